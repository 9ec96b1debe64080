//! Periodic outreach jobs.
//!
//! Three tasks drive leads through the lifecycle: the dispatcher sends first
//! messages, the reply poller watches open threads, and the follow-up
//! trigger nudges leads that stayed silent. All of them go through the
//! same per-lead unit of work in [`orchestrator`].

mod dispatcher;
mod followup;
pub mod locks;
pub mod orchestrator;
mod outbox;
mod reply_poller;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use orchestrator::{Collaborators, DeferReason, JobOrchestrator, StepOutcome};

/// The periodic tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Dispatch,
    ReplyPoll,
    Followup,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [Self::Dispatch, Self::ReplyPoll, Self::Followup];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::ReplyPoll => "reply_poll",
            Self::Followup => "followup",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Dispatch => 0,
            Self::ReplyPoll => 1,
            Self::Followup => 2,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dispatch" => Ok(Self::Dispatch),
            "reply_poll" => Ok(Self::ReplyPoll),
            "followup" => Ok(Self::Followup),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// Outcome of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Ok,
    Failed,
    /// Left `running` by a process that went away.
    Abandoned,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Ok => write!(f, "ok"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "ok" => Ok(RunStatus::Ok),
            "failed" => Ok(RunStatus::Failed),
            "abandoned" => Ok(RunStatus::Abandoned),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// How a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Schedule,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Manual => "manual",
        }
    }
}

/// Per-run tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Leads looked at.
    pub candidates: u32,
    /// Leads that moved along an edge.
    pub advanced: u32,
    /// Leads evaluated with no state change (neutral reply, nothing new).
    pub unchanged: u32,
    /// Left for a later tick (rate limit, lease, unresolved send, pending reply).
    pub deferred: u32,
    /// Lost an optimistic version check.
    pub conflicts: u32,
    /// Collaborator or store failures.
    pub failed: u32,
}

impl RunReport {
    pub fn summary(&self) -> String {
        format!(
            "{} candidates: {} advanced, {} unchanged, {} deferred, {} conflicts, {} failed",
            self.candidates,
            self.advanced,
            self.unchanged,
            self.deferred,
            self.conflicts,
            self.failed
        )
    }

    pub(crate) fn record(&mut self, outcome: &Result<StepOutcome, crate::error::Error>) {
        match outcome {
            Ok(StepOutcome::Advanced(_)) => self.advanced += 1,
            Ok(StepOutcome::Unchanged) | Ok(StepOutcome::Ignored) => self.unchanged += 1,
            Ok(StepOutcome::Deferred(_)) => self.deferred += 1,
            Err(crate::error::Error::Database(e)) if e.is_conflict() => self.conflicts += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// A single execution of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub id: Uuid,
    pub kind: JobKind,
    pub trigger: Trigger,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub report: RunReport,
    pub result_summary: Option<String>,
}

impl JobRun {
    pub fn start(kind: JobKind, trigger: Trigger, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            trigger,
            status: RunStatus::Running,
            started_at: now,
            completed_at: None,
            report: RunReport::default(),
            result_summary: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_status_roundtrip() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        for status in [
            RunStatus::Running,
            RunStatus::Ok,
            RunStatus::Failed,
            RunStatus::Abandoned,
        ] {
            let parsed: RunStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("hourly".parse::<JobKind>().is_err());
    }

    #[test]
    fn report_summary_lists_every_tally() {
        let report = RunReport {
            candidates: 4,
            advanced: 2,
            deferred: 1,
            failed: 1,
            ..Default::default()
        };
        assert_eq!(
            report.summary(),
            "4 candidates: 2 advanced, 0 unchanged, 1 deferred, 0 conflicts, 1 failed"
        );
    }
}
