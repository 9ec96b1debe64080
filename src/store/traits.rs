//! Unified `Database` trait: single async interface for all persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::campaigns::model::{Campaign, CampaignCounters, CampaignStatus};
use crate::error::DatabaseError;
use crate::jobs::{JobKind, JobRun, RunReport, RunStatus};
use crate::leads::{EmailThread, Lead, LeadState, OutboundKind};

/// Additive change to a campaign's funnel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub found: i64,
    pub valid: i64,
    pub enriched: i64,
    pub emailed: i64,
}

impl CounterDelta {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// One atomic read-evaluate-write unit for a lead.
///
/// `lead.version` is the version that was read; the commit fails with
/// `DatabaseError::Conflict` if the stored row has moved on. The thread
/// snapshot is upserted, the ledger entry (if any) is marked committed and
/// the counter delta is applied, all in one transaction.
#[derive(Debug, Clone)]
pub struct LeadCommit {
    pub lead: Lead,
    pub thread: Option<EmailThread>,
    pub outbound_id: Option<Uuid>,
    pub counters: CounterDelta,
}

/// Lifecycle of an idempotency marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundStatus {
    /// Claimed before the send; outcome unknown if it is still here later.
    Claimed,
    /// The transport accepted the message.
    Sent,
    /// The state transition that goes with the send is committed.
    Committed,
}

impl OutboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Sent => "sent",
            Self::Committed => "committed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => Self::Sent,
            "committed" => Self::Committed,
            _ => Self::Claimed,
        }
    }
}

/// A row of the outbound send ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundSend {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub kind: OutboundKind,
    pub status: OutboundStatus,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub message_id: Option<String>,
    pub claimed_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Thread-level flags aggregated over all leads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadTotals {
    pub with_reply: u32,
    pub requires_human: u32,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Campaigns ───────────────────────────────────────────────────

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError>;

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError>;

    /// Most recent first.
    async fn list_campaigns(&self, limit: usize) -> Result<Vec<Campaign>, DatabaseError>;

    async fn count_campaigns(&self) -> Result<u32, DatabaseError>;

    async fn update_campaign_status(
        &self,
        id: Uuid,
        status: CampaignStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Overwrite counters (used by full recomputation).
    async fn set_campaign_counters(
        &self,
        id: Uuid,
        counters: CampaignCounters,
    ) -> Result<(), DatabaseError>;

    /// Derive counters from the campaign's lead rows.
    async fn recount_campaign(&self, id: Uuid) -> Result<CampaignCounters, DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    /// Insert new leads and apply the counter delta in one transaction.
    async fn insert_leads(&self, leads: &[Lead], counters: CounterDelta)
    -> Result<(), DatabaseError>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    /// Leads in `state`, oldest first. ENRICHED leads are ordered by
    /// `enriched_at`, other states by the time they entered the state.
    async fn list_leads_in_state(
        &self,
        state: LeadState,
        limit: usize,
    ) -> Result<Vec<Lead>, DatabaseError>;

    /// EMAILED_1 and EMAILED_2 leads, least recently polled thread first.
    async fn list_awaiting_reply(&self, limit: usize) -> Result<Vec<Lead>, DatabaseError>;

    /// EMAILED_1 leads with fewer than two counted sends whose first message
    /// went out at or before `cutoff`, oldest first.
    async fn list_followup_due(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Lead>, DatabaseError>;

    /// Per-state counts, over one campaign or all leads.
    async fn count_leads_by_state(
        &self,
        campaign_id: Option<Uuid>,
    ) -> Result<HashMap<LeadState, u32>, DatabaseError>;

    /// Apply a lead transition atomically. See [`LeadCommit`].
    async fn commit_lead(&self, commit: &LeadCommit) -> Result<(), DatabaseError>;

    // ── Threads ─────────────────────────────────────────────────────

    async fn get_thread_for_lead(&self, lead_id: Uuid)
    -> Result<Option<EmailThread>, DatabaseError>;

    /// Record a poll visit that found nothing new.
    async fn touch_thread_checked(
        &self,
        thread_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn thread_totals(&self) -> Result<ThreadTotals, DatabaseError>;

    // ── Outbound ledger ─────────────────────────────────────────────

    async fn get_outbound(
        &self,
        lead_id: Uuid,
        kind: OutboundKind,
    ) -> Result<Option<OutboundSend>, DatabaseError>;

    /// Insert a claim. Returns `false` if a row for `(lead_id, kind)` exists.
    async fn claim_outbound(&self, entry: &OutboundSend) -> Result<bool, DatabaseError>;

    async fn mark_outbound_sent(
        &self,
        id: Uuid,
        message_id: &str,
        subject: &str,
        body: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Drop a claim whose send definitely did not happen.
    async fn release_outbound(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Claims whose outcome is unknown.
    async fn list_unresolved_outbound(&self) -> Result<Vec<OutboundSend>, DatabaseError>;

    /// Number of sends at or after `since` and the latest send time overall.
    async fn sends_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<(u32, Option<DateTime<Utc>>), DatabaseError>;

    // ── Job runs ────────────────────────────────────────────────────

    async fn create_job_run(&self, run: &JobRun) -> Result<(), DatabaseError>;

    async fn complete_job_run(
        &self,
        id: Uuid,
        status: RunStatus,
        report: &RunReport,
        summary: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn last_job_run(&self, kind: JobKind) -> Result<Option<JobRun>, DatabaseError>;

    /// Mark runs left `running` by a previous process as abandoned.
    async fn abandon_running_job_runs(&self, at: DateTime<Utc>) -> Result<usize, DatabaseError>;
}
