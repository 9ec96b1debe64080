//! The job orchestrator: scheduling, single-flight, and the per-lead
//! read-evaluate-write unit every task goes through.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::locks::LeadLocks;
use super::outbox::{self, Delivery};
use super::{JobKind, JobRun, RunReport, RunStatus, Trigger, dispatcher, followup, reply_poller};
use crate::campaigns::CampaignTracker;
use crate::channels::MailTransport;
use crate::clock::Clock;
use crate::config::ScheduleConfig;
use crate::error::{DatabaseError, Error, JobError};
use crate::leads::{
    Decision, EmailThread, EnrichmentData, Lead, LeadEvent, LeadState, ThreadMessage, Transition,
    apply, transition,
};
use crate::llm::{ContentGenerator, ReplyClassifier};
use crate::ratelimit::{RateLimitStatus, RateLimiter};
use crate::store::{Database, LeadCommit};

/// Why a lead was left for a later tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// The rate limiter said not now.
    RateLimited,
    /// Another task holds the lead.
    LeadBusy,
    /// A previous send has an unknown outcome.
    UnresolvedSend,
    /// The lead replied and the reply has not been acted on yet.
    PendingReply,
}

/// Result of one per-lead step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Advanced(Transition),
    /// Valid event, state unchanged; thread bookkeeping may have been saved.
    Unchanged,
    /// Event not valid in the lead's current state.
    Ignored,
    Deferred(DeferReason),
}

/// External services the jobs call out to.
#[derive(Clone)]
pub struct Collaborators {
    pub mail: Arc<dyn MailTransport>,
    pub generator: Arc<dyn ContentGenerator>,
    pub classifier: Arc<dyn ReplyClassifier>,
}

/// Clears the running flag for a job kind when dropped.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct JobOrchestrator {
    store: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    limiter: Arc<RateLimiter>,
    tracker: CampaignTracker,
    collaborators: Collaborators,
    schedule: ScheduleConfig,
    locks: LeadLocks,
    running: [AtomicBool; 3],
    shutdown: AtomicBool,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        limiter: Arc<RateLimiter>,
        collaborators: Collaborators,
        schedule: ScheduleConfig,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            tracker: CampaignTracker::new(Arc::clone(&store), Arc::clone(&clock)),
            store,
            clock,
            limiter,
            collaborators,
            schedule,
            locks: LeadLocks::new(),
            running: [AtomicBool::new(false), AtomicBool::new(false), AtomicBool::new(false)],
            shutdown: AtomicBool::new(false),
            stop_tx,
            stop_rx,
        }
    }

    // ── Accessors used by the job modules ───────────────────────────

    pub(crate) fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }

    pub(crate) fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub(crate) fn mail(&self) -> &dyn MailTransport {
        self.collaborators.mail.as_ref()
    }

    pub(crate) fn generator(&self) -> &dyn ContentGenerator {
        self.collaborators.generator.as_ref()
    }

    pub(crate) fn classifier(&self) -> &dyn ReplyClassifier {
        self.collaborators.classifier.as_ref()
    }

    pub(crate) fn schedule(&self) -> &ScheduleConfig {
        &self.schedule
    }

    pub(crate) fn collaborator_timeout(&self) -> Duration {
        self.schedule.collaborator_timeout
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn tracker(&self) -> &CampaignTracker {
        &self.tracker
    }

    pub fn rate_limit_status(&self) -> RateLimitStatus {
        self.limiter.status()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // ── Startup ─────────────────────────────────────────────────────

    /// Clean up after a previous process: abandon its unfinished runs, seed
    /// the rate limiter from today's sends, and report unresolved sends.
    pub async fn recover(&self) -> Result<(), Error> {
        let now = self.now();
        let abandoned = self.store.abandon_running_job_runs(now).await?;
        if abandoned > 0 {
            warn!(count = abandoned, "Marked interrupted job runs as abandoned");
        }

        let (sent_today, last_sent_at) = self.store.sends_since(self.limiter.day_start()).await?;
        self.limiter.restore(sent_today, last_sent_at);

        for entry in self.store.list_unresolved_outbound().await? {
            warn!(
                lead_id = %entry.lead_id,
                kind = %entry.kind,
                claimed_at = %entry.claimed_at,
                "Send outcome unknown, needs operator review"
            );
        }
        Ok(())
    }

    // ── Runs ────────────────────────────────────────────────────────

    /// Run one job immediately. Fails with `AlreadyRunning` if a run of the
    /// same kind is in progress.
    pub async fn run_now(&self, kind: JobKind) -> Result<RunReport, Error> {
        self.run_job(kind, Trigger::Manual).await
    }

    pub async fn run_job(&self, kind: JobKind, trigger: Trigger) -> Result<RunReport, Error> {
        if self.is_shutting_down() {
            return Err(JobError::ShuttingDown.into());
        }
        let Some(_flight) = FlightGuard::enter(&self.running[kind.index()]) else {
            return Err(JobError::AlreadyRunning {
                kind: kind.to_string(),
            }
            .into());
        };

        let run = JobRun::start(kind, trigger, self.now());
        self.store.create_job_run(&run).await?;
        debug!(job = %kind, run_id = %run.id, trigger = trigger.as_str(), "Job run started");

        let result = match kind {
            JobKind::Dispatch => dispatcher::run(self).await,
            JobKind::ReplyPoll => reply_poller::run(self).await,
            JobKind::Followup => followup::run(self).await,
        };

        let completed_at = self.now();
        match result {
            Ok(report) => {
                let summary = report.summary();
                self.store
                    .complete_job_run(run.id, RunStatus::Ok, &report, Some(&summary), completed_at)
                    .await?;
                info!(job = %kind, run_id = %run.id, "Job run finished: {summary}");
                Ok(report)
            }
            Err(e) => {
                let reason = e.to_string();
                if let Err(db) = self
                    .store
                    .complete_job_run(
                        run.id,
                        RunStatus::Failed,
                        &RunReport::default(),
                        Some(&reason),
                        completed_at,
                    )
                    .await
                {
                    error!(job = %kind, run_id = %run.id, "Failed to record run failure: {db}");
                }
                error!(job = %kind, run_id = %run.id, "Job run failed: {reason}");
                Err(JobError::Failed { id: run.id, reason }.into())
            }
        }
    }

    pub async fn last_run_at(&self, kind: JobKind) -> Result<Option<DateTime<Utc>>, Error> {
        Ok(self.store.last_job_run(kind).await?.map(|run| run.started_at))
    }

    // ── Scheduling ──────────────────────────────────────────────────

    pub fn interval_for(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Dispatch => self.schedule.dispatch_interval,
            JobKind::ReplyPoll => self.schedule.reply_poll_interval,
            JobKind::Followup => self.schedule.followup_interval,
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.schedule.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    /// Start one ticker per job kind.
    pub fn spawn_tickers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        JobKind::ALL
            .iter()
            .map(|&kind| spawn_ticker(Arc::clone(self), kind))
            .collect()
    }

    /// Stop the tickers. Runs in progress stop after their current lead.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            info!("Job orchestrator shutting down");
        }
        let _ = self.stop_tx.send(true);
    }

    // ── Per-lead unit of work ───────────────────────────────────────

    /// Evaluate `event` against a freshly read `lead` and carry out the
    /// resulting transition. The caller must hold the lead's lease.
    pub(crate) async fn execute(
        &self,
        mut lead: Lead,
        event: LeadEvent,
        mut thread: Option<EmailThread>,
    ) -> Result<StepOutcome, Error> {
        let transition = match transition(&lead, event) {
            Decision::Ignore { state, event } => {
                debug!(
                    lead_id = %lead.id,
                    state = %state,
                    event = event.name(),
                    "Event not valid in current state, ignoring"
                );
                return Ok(StepOutcome::Ignored);
            }
            Decision::Stay => {
                if let Some(thread) = thread {
                    self.save_thread(lead, thread).await?;
                }
                return Ok(StepOutcome::Unchanged);
            }
            Decision::Advance(t) => t,
        };

        let mut outbound_id = None;
        if let Some(kind) = transition.send() {
            let receipt = match outbox::deliver(self, &lead, kind, thread.as_ref()).await? {
                Delivery::Sent(receipt) => receipt,
                Delivery::Deferred(reason) => return Ok(StepOutcome::Deferred(reason)),
            };
            let at = self.now();
            let t = thread.get_or_insert_with(|| {
                EmailThread::open(lead.id, receipt.subject.clone(), receipt.message_id.clone(), at)
            });
            t.push(ThreadMessage::sent(
                receipt.body.clone(),
                Some(receipt.message_id.clone()),
                at,
            ));
            if receipt.reconciled {
                info!(lead_id = %lead.id, kind = %kind, "Reconciled earlier send");
            }
            outbound_id = Some(receipt.ledger_id);
        }

        let now = self.now();
        apply(&mut lead, &transition, now);
        if transition.marks_requires_human() {
            match thread.as_mut() {
                Some(t) => {
                    t.requires_human = true;
                    t.updated_at = now;
                }
                None => warn!(lead_id = %lead.id, "No thread to flag for human follow-up"),
            }
        }

        let campaign_id = lead.campaign_id;
        let lead_id = lead.id;
        self.store
            .commit_lead(&LeadCommit {
                lead,
                thread,
                outbound_id,
                counters: CampaignTracker::delta_for(&transition),
            })
            .await?;

        info!(
            lead_id = %lead_id,
            from = %transition.from,
            to = %transition.to,
            event = transition.event.name(),
            "Lead advanced"
        );

        if let Err(e) = self.tracker.refresh_status(campaign_id).await {
            warn!(campaign_id = %campaign_id, "Campaign status refresh failed: {e}");
        }
        Ok(StepOutcome::Advanced(transition))
    }

    /// Persist thread bookkeeping without moving the lead.
    pub(crate) async fn save_thread(&self, lead: Lead, thread: EmailThread) -> Result<(), Error> {
        self.store
            .commit_lead(&LeadCommit {
                lead,
                thread: Some(thread),
                outbound_id: None,
                counters: Default::default(),
            })
            .await?;
        Ok(())
    }

    /// Lease the lead, re-read it, and hand it to `step` if it is in one of
    /// the `expected` states. The lease is held for the whole step.
    pub(crate) async fn with_lead<F, Fut>(
        &self,
        lead_id: Uuid,
        expected: &[LeadState],
        step: F,
    ) -> Result<StepOutcome, Error>
    where
        F: FnOnce(Lead) -> Fut,
        Fut: std::future::Future<Output = Result<StepOutcome, Error>>,
    {
        let Some(_lease) = self.locks.try_acquire(lead_id) else {
            debug!(lead_id = %lead_id, "Lead busy, skipping");
            return Ok(StepOutcome::Deferred(DeferReason::LeadBusy));
        };
        let Some(lead) = self.store.get_lead(lead_id).await? else {
            return Err(DatabaseError::NotFound {
                entity: "lead".into(),
                id: lead_id.to_string(),
            }
            .into());
        };
        if !expected.contains(&lead.state) {
            debug!(lead_id = %lead_id, state = %lead.state, "Lead moved on since selection");
            return Ok(StepOutcome::Ignored);
        }
        step(lead).await
    }

    pub(crate) fn log_outcome(
        &self,
        kind: JobKind,
        lead_id: Uuid,
        outcome: &Result<StepOutcome, Error>,
    ) {
        match outcome {
            Ok(StepOutcome::Deferred(reason)) => {
                debug!(job = %kind, lead_id = %lead_id, reason = ?reason, "Lead deferred")
            }
            Ok(_) => {}
            Err(Error::Database(e)) if e.is_conflict() => {
                info!(job = %kind, lead_id = %lead_id, "Lost a concurrent update, retrying next tick: {e}")
            }
            Err(e) if e.is_transient() => {
                warn!(job = %kind, lead_id = %lead_id, "Transient failure, retrying next tick: {e}")
            }
            Err(e) => error!(job = %kind, lead_id = %lead_id, "Lead step failed: {e}"),
        }
    }

    // ── Operator and collaborator events ────────────────────────────

    /// The enrichment collaborator finished for this lead. A replay on an
    /// already enriched lead is a no-op.
    pub async fn complete_enrichment(
        &self,
        lead_id: Uuid,
        data: EnrichmentData,
    ) -> Result<StepOutcome, Error> {
        let states = LeadState::ALL;
        self.with_lead(lead_id, &states, |mut lead| async move {
            if lead.state == LeadState::Collected {
                lead.enrichment = Some(data);
            }
            self.execute(lead, LeadEvent::EnrichmentCompleted, None).await
        })
        .await
    }

    /// Manual close by an operator.
    pub async fn close_lead(&self, lead_id: Uuid) -> Result<StepOutcome, Error> {
        let states = LeadState::ALL;
        self.with_lead(lead_id, &states, |lead| async move {
            let thread = self.store.get_thread_for_lead(lead.id).await?;
            self.execute(lead, LeadEvent::ManualClose, thread).await
        })
        .await
    }
}

fn spawn_ticker(orch: Arc<JobOrchestrator>, kind: JobKind) -> JoinHandle<()> {
    let period = orch.interval_for(kind);
    let first = tokio::time::Instant::now() + orch.jitter();
    let mut stop = orch.stop_rx.clone();

    tokio::spawn(async move {
        info!(job = %kind, interval_secs = period.as_secs(), "Job ticker started");
        let mut ticker = tokio::time::interval_at(first, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => {}
            }
            if orch.is_shutting_down() {
                info!(job = %kind, "Job ticker stopped");
                return;
            }

            match orch.run_job(kind, Trigger::Schedule).await {
                Ok(_) => {}
                Err(Error::Job(JobError::AlreadyRunning { .. })) => {
                    debug!(job = %kind, "Previous run still active, skipping tick")
                }
                Err(Error::Job(JobError::ShuttingDown)) => return,
                // Already logged by run_job.
                Err(_) => {}
            }
        }
    })
}
