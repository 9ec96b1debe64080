//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All writes are serialized
//! through `write_lock` so a multi-statement transaction on the shared
//! connection never interleaves with another task's statements.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::campaigns::model::{Campaign, CampaignCounters, CampaignStatus};
use crate::error::DatabaseError;
use crate::jobs::{JobKind, JobRun, RunReport, RunStatus, Trigger};
use crate::leads::{
    ContactInfo, EmailThread, EnrichmentData, Lead, LeadState, MessageRole, OutboundKind,
    Sentiment, ThreadMessage,
};
use crate::store::migrations;
use crate::store::traits::{
    CounterDelta, Database, LeadCommit, OutboundSend, OutboundStatus, ThreadTotals,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn writer(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed width so string order is time order.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: Option<&DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s}: {e}")))
}

fn count(v: i64) -> u32 {
    u32::try_from(v.max(0)).unwrap_or(u32::MAX)
}

/// Column order: 0:id, 1:keywords, 2:status, 3:leads_found, 4:leads_valid,
/// 5:leads_enriched, 6:leads_emailed, 7:error_message, 8:created_at,
/// 9:updated_at, 10:completed_at
const CAMPAIGN_COLUMNS: &str = "id, keywords, status, leads_found, leads_valid, leads_enriched, leads_emailed, error_message, created_at, updated_at, completed_at";

fn row_to_campaign(row: &libsql::Row) -> Result<Campaign, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("campaign row: {e}"));

    let id: String = row.get(0).map_err(get_err)?;
    let status_str: String = row.get(2).map_err(get_err)?;
    let created_str: String = row.get(8).map_err(get_err)?;
    let updated_str: String = row.get(9).map_err(get_err)?;
    let completed_str: Option<String> = row.get(10).ok();

    Ok(Campaign {
        id: parse_uuid(&id)?,
        keywords: row.get(1).map_err(get_err)?,
        status: status_str
            .parse::<CampaignStatus>()
            .map_err(DatabaseError::Serialization)?,
        counters: CampaignCounters {
            leads_found: count(row.get(3).unwrap_or(0)),
            leads_valid: count(row.get(4).unwrap_or(0)),
            leads_enriched: count(row.get(5).unwrap_or(0)),
            leads_emailed: count(row.get(6).unwrap_or(0)),
        },
        error_message: row.get::<String>(7).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        completed_at: parse_optional_datetime(&completed_str),
    })
}

/// Column order: 0:id, 1:campaign_id, 2:state, 3:contact, 4:enrichment,
/// 5:emails_sent_count, 6:first_emailed_at, 7:last_emailed_at,
/// 8:enriched_at, 9:version, 10:created_at, 11:updated_at
const LEAD_COLUMNS: &str = "id, campaign_id, state, contact, enrichment, emails_sent_count, first_emailed_at, last_emailed_at, enriched_at, version, created_at, updated_at";

fn row_to_lead(row: &libsql::Row) -> Result<Lead, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("lead row: {e}"));

    let id: String = row.get(0).map_err(get_err)?;
    let campaign_id: String = row.get(1).map_err(get_err)?;
    let state_str: String = row.get(2).map_err(get_err)?;
    let contact_str: String = row.get(3).map_err(get_err)?;
    let enrichment_str: Option<String> = row.get(4).ok();
    let sent: i64 = row.get(5).unwrap_or(0);
    let created_str: String = row.get(10).map_err(get_err)?;
    let updated_str: String = row.get(11).map_err(get_err)?;

    let contact: ContactInfo = serde_json::from_str(&contact_str)
        .map_err(|e| DatabaseError::Serialization(format!("lead {id} contact: {e}")))?;
    let enrichment = match enrichment_str {
        Some(s) => Some(
            serde_json::from_str::<EnrichmentData>(&s)
                .map_err(|e| DatabaseError::Serialization(format!("lead {id} enrichment: {e}")))?,
        ),
        None => None,
    };

    Ok(Lead {
        id: parse_uuid(&id)?,
        campaign_id: parse_uuid(&campaign_id)?,
        state: state_str
            .parse::<LeadState>()
            .map_err(DatabaseError::Serialization)?,
        contact,
        enrichment,
        emails_sent_count: u8::try_from(sent.clamp(0, u8::MAX as i64)).unwrap_or(u8::MAX),
        first_emailed_at: parse_optional_datetime(&row.get::<String>(6).ok()),
        last_emailed_at: parse_optional_datetime(&row.get::<String>(7).ok()),
        enriched_at: parse_optional_datetime(&row.get::<String>(8).ok()),
        version: row.get(9).unwrap_or(0),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Column order: 0:id, 1:lead_id, 2:subject, 3:thread_key, 4:has_reply,
/// 5:requires_human, 6:reply_sentiment, 7:last_checked_at, 8:created_at,
/// 9:updated_at
const THREAD_COLUMNS: &str = "id, lead_id, subject, thread_key, has_reply, requires_human, reply_sentiment, last_checked_at, created_at, updated_at";

fn row_to_thread(row: &libsql::Row) -> Result<EmailThread, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("thread row: {e}"));

    let id: String = row.get(0).map_err(get_err)?;
    let lead_id: String = row.get(1).map_err(get_err)?;
    let sentiment: Option<Sentiment> = row
        .get::<String>(6)
        .ok()
        .and_then(|s| s.parse::<Sentiment>().ok());
    let created_str: String = row.get(8).map_err(get_err)?;
    let updated_str: String = row.get(9).map_err(get_err)?;

    Ok(EmailThread {
        id: parse_uuid(&id)?,
        lead_id: parse_uuid(&lead_id)?,
        subject: row.get(2).map_err(get_err)?,
        thread_key: row.get(3).map_err(get_err)?,
        has_reply: row.get::<i64>(4).unwrap_or(0) != 0,
        requires_human: row.get::<i64>(5).unwrap_or(0) != 0,
        reply_sentiment: sentiment,
        messages: Vec::new(),
        last_checked_at: parse_optional_datetime(&row.get::<String>(7).ok()),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Column order: 0:id, 1:lead_id, 2:kind, 3:status, 4:subject, 5:body,
/// 6:message_id, 7:claimed_at, 8:sent_at
const OUTBOUND_COLUMNS: &str =
    "id, lead_id, kind, status, subject, body, message_id, claimed_at, sent_at";

fn row_to_outbound(row: &libsql::Row) -> Result<OutboundSend, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("outbound row: {e}"));

    let id: String = row.get(0).map_err(get_err)?;
    let lead_id: String = row.get(1).map_err(get_err)?;
    let kind_str: String = row.get(2).map_err(get_err)?;
    let status_str: String = row.get(3).map_err(get_err)?;
    let claimed_str: String = row.get(7).map_err(get_err)?;

    Ok(OutboundSend {
        id: parse_uuid(&id)?,
        lead_id: parse_uuid(&lead_id)?,
        kind: kind_str
            .parse::<OutboundKind>()
            .map_err(DatabaseError::Serialization)?,
        status: OutboundStatus::parse(&status_str),
        subject: row.get::<String>(4).ok(),
        body: row.get::<String>(5).ok(),
        message_id: row.get::<String>(6).ok(),
        claimed_at: parse_datetime(&claimed_str),
        sent_at: parse_optional_datetime(&row.get::<String>(8).ok()),
    })
}

/// Column order: 0:id, 1:kind, 2:trigger, 3:status, 4:started_at,
/// 5:completed_at, 6:candidates, 7:advanced, 8:unchanged, 9:deferred,
/// 10:conflicts, 11:failed, 12:result_summary
const JOB_RUN_COLUMNS: &str = "id, kind, trigger, status, started_at, completed_at, candidates, advanced, unchanged, deferred, conflicts, failed, result_summary";

fn row_to_job_run(row: &libsql::Row) -> Result<JobRun, DatabaseError> {
    let id: String = row.get(0).unwrap_or_default();
    let kind: JobKind = row
        .get::<String>(1)
        .unwrap_or_default()
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let trigger = match row.get::<String>(2).unwrap_or_default().as_str() {
        "manual" => Trigger::Manual,
        _ => Trigger::Schedule,
    };
    let status: RunStatus = row
        .get::<String>(3)
        .unwrap_or_else(|_| "running".to_string())
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let started_str: String = row.get(4).unwrap_or_default();

    Ok(JobRun {
        id: parse_uuid(&id)?,
        kind,
        trigger,
        status,
        started_at: parse_datetime(&started_str),
        completed_at: parse_optional_datetime(&row.get::<String>(5).ok()),
        report: RunReport {
            candidates: count(row.get(6).unwrap_or(0)),
            advanced: count(row.get(7).unwrap_or(0)),
            unchanged: count(row.get(8).unwrap_or(0)),
            deferred: count(row.get(9).unwrap_or(0)),
            conflicts: count(row.get(10).unwrap_or(0)),
            failed: count(row.get(11).unwrap_or(0)),
        },
        result_summary: row.get::<String>(12).ok(),
    })
}

async fn insert_lead_row(conn: &Connection, lead: &Lead) -> Result<(), DatabaseError> {
    let contact = serde_json::to_string(&lead.contact)
        .map_err(|e| DatabaseError::Serialization(format!("contact: {e}")))?;
    let enrichment = match &lead.enrichment {
        Some(data) => Some(
            serde_json::to_string(data)
                .map_err(|e| DatabaseError::Serialization(format!("enrichment: {e}")))?,
        ),
        None => None,
    };

    conn.execute(
        &format!(
            "INSERT INTO leads ({LEAD_COLUMNS}, email, is_valid) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            lead.id.to_string(),
            lead.campaign_id.to_string(),
            lead.state.as_str(),
            contact,
            opt_text(enrichment.as_deref()),
            lead.emails_sent_count as i64,
            opt_ts(lead.first_emailed_at.as_ref()),
            opt_ts(lead.last_emailed_at.as_ref()),
            opt_ts(lead.enriched_at.as_ref()),
            lead.version,
            fmt_ts(&lead.created_at),
            fmt_ts(&lead.updated_at),
            lead.contact.email.clone(),
            lead.contact.is_valid() as i64,
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_lead: {e}")))?;
    Ok(())
}

async fn apply_counter_delta(
    conn: &Connection,
    campaign_id: Uuid,
    delta: CounterDelta,
    at: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    if delta.is_zero() {
        return Ok(());
    }
    conn.execute(
        "UPDATE campaigns SET
            leads_found = MAX(0, leads_found + ?1),
            leads_valid = MAX(0, leads_valid + ?2),
            leads_enriched = MAX(0, leads_enriched + ?3),
            leads_emailed = MAX(0, leads_emailed + ?4),
            updated_at = ?5
         WHERE id = ?6",
        params![
            delta.found,
            delta.valid,
            delta.enriched,
            delta.emailed,
            fmt_ts(at),
            campaign_id.to_string(),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("apply_counter_delta: {e}")))?;
    Ok(())
}

async fn upsert_thread(conn: &Connection, thread: &EmailThread) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO email_threads ({THREAD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                subject = excluded.subject,
                has_reply = excluded.has_reply,
                requires_human = excluded.requires_human,
                reply_sentiment = excluded.reply_sentiment,
                last_checked_at = excluded.last_checked_at,
                updated_at = excluded.updated_at"
        ),
        params![
            thread.id.to_string(),
            thread.lead_id.to_string(),
            thread.subject.clone(),
            thread.thread_key.clone(),
            thread.has_reply as i64,
            thread.requires_human as i64,
            opt_text(thread.reply_sentiment.as_ref().map(|s| s.as_str())),
            opt_ts(thread.last_checked_at.as_ref()),
            fmt_ts(&thread.created_at),
            fmt_ts(&thread.updated_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("upsert_thread: {e}")))?;

    // Messages are append-only; earlier positions are already stored.
    for (seq, message) in thread.messages.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO thread_messages (thread_id, seq, role, content, external_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                thread.id.to_string(),
                seq as i64,
                message.role.as_str(),
                message.content.clone(),
                opt_text(message.external_id.as_deref()),
                fmt_ts(&message.timestamp),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_thread_message: {e}")))?;
    }
    Ok(())
}

/// Statements of one `commit_lead`, run inside its transaction.
async fn apply_commit(conn: &Connection, commit: &LeadCommit) -> Result<(), DatabaseError> {
    let lead = &commit.lead;
    let contact = serde_json::to_string(&lead.contact)
        .map_err(|e| DatabaseError::Serialization(format!("contact: {e}")))?;
    let enrichment = match &lead.enrichment {
        Some(data) => Some(
            serde_json::to_string(data)
                .map_err(|e| DatabaseError::Serialization(format!("enrichment: {e}")))?,
        ),
        None => None,
    };

    let updated = conn
        .execute(
            "UPDATE leads SET
                state = ?1, contact = ?2, enrichment = ?3, emails_sent_count = ?4,
                first_emailed_at = ?5, last_emailed_at = ?6, enriched_at = ?7,
                updated_at = ?8, version = version + 1
             WHERE id = ?9 AND version = ?10",
            params![
                lead.state.as_str(),
                contact,
                opt_text(enrichment.as_deref()),
                lead.emails_sent_count as i64,
                opt_ts(lead.first_emailed_at.as_ref()),
                opt_ts(lead.last_emailed_at.as_ref()),
                opt_ts(lead.enriched_at.as_ref()),
                fmt_ts(&lead.updated_at),
                lead.id.to_string(),
                lead.version,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("commit_lead: {e}")))?;

    if updated == 0 {
        return Err(DatabaseError::Conflict {
            entity: "lead".into(),
            id: lead.id.to_string(),
            expected: lead.version,
        });
    }

    if let Some(thread) = &commit.thread {
        upsert_thread(conn, thread).await?;
    }

    if let Some(outbound_id) = commit.outbound_id {
        conn.execute(
            "UPDATE outbound_sends SET status = 'committed' WHERE id = ?1",
            params![outbound_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("commit_lead outbound: {e}")))?;
    }

    apply_counter_delta(conn, lead.campaign_id, commit.counters, &lead.updated_at).await
}

async fn collect_leads(mut rows: libsql::Rows) -> Vec<Lead> {
    let mut leads = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        match row_to_lead(&row) {
            Ok(lead) => leads.push(lead),
            Err(e) => tracing::warn!("Skipping lead row: {e}"),
        }
    }
    leads
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _w = self.writer().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Campaigns ───────────────────────────────────────────────────

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError> {
        let _w = self.writer().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO campaigns ({CAMPAIGN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    campaign.id.to_string(),
                    campaign.keywords.clone(),
                    campaign.status.as_str(),
                    campaign.counters.leads_found as i64,
                    campaign.counters.leads_valid as i64,
                    campaign.counters.leads_enriched as i64,
                    campaign.counters.leads_emailed as i64,
                    opt_text(campaign.error_message.as_deref()),
                    fmt_ts(&campaign.created_at),
                    fmt_ts(&campaign.updated_at),
                    opt_ts(campaign.completed_at.as_ref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_campaign: {e}")))?;

        debug!(campaign_id = %campaign.id, "Campaign inserted");
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_campaign: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_campaign(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_campaign: {e}"))),
        }
    }

    async fn list_campaigns(&self, limit: usize) -> Result<Vec<Campaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CAMPAIGN_COLUMNS} FROM campaigns ORDER BY created_at DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_campaigns: {e}")))?;

        let mut campaigns = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_campaign(&row) {
                Ok(c) => campaigns.push(c),
                Err(e) => tracing::warn!("Skipping campaign row: {e}"),
            }
        }
        Ok(campaigns)
    }

    async fn count_campaigns(&self) -> Result<u32, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM campaigns", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_campaigns: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(count(row.get(0).unwrap_or(0))),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_campaigns: {e}"))),
        }
    }

    async fn update_campaign_status(
        &self,
        id: Uuid,
        status: CampaignStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let completed = matches!(status, CampaignStatus::Completed | CampaignStatus::Failed);
        let _w = self.writer().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE campaigns SET
                    status = ?1,
                    error_message = COALESCE(?2, error_message),
                    updated_at = ?3,
                    completed_at = CASE WHEN ?4 THEN COALESCE(completed_at, ?3) ELSE NULL END
                 WHERE id = ?5",
                params![
                    status.as_str(),
                    opt_text(error_message),
                    fmt_ts(&at),
                    completed as i64,
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_campaign_status: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "campaign".into(),
                id: id.to_string(),
            });
        }
        debug!(campaign_id = %id, status = %status, "Campaign status updated");
        Ok(())
    }

    async fn set_campaign_counters(
        &self,
        id: Uuid,
        counters: CampaignCounters,
    ) -> Result<(), DatabaseError> {
        let _w = self.writer().await;
        self.conn()
            .execute(
                "UPDATE campaigns SET leads_found = ?1, leads_valid = ?2, leads_enriched = ?3, leads_emailed = ?4 WHERE id = ?5",
                params![
                    counters.leads_found as i64,
                    counters.leads_valid as i64,
                    counters.leads_enriched as i64,
                    counters.leads_emailed as i64,
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_campaign_counters: {e}")))?;
        Ok(())
    }

    async fn recount_campaign(&self, id: Uuid) -> Result<CampaignCounters, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*),
                        COALESCE(SUM(is_valid), 0),
                        COALESCE(SUM(CASE WHEN enriched_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN first_emailed_at IS NOT NULL THEN 1 ELSE 0 END), 0)
                 FROM leads WHERE campaign_id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recount_campaign: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(CampaignCounters {
                leads_found: count(row.get(0).unwrap_or(0)),
                leads_valid: count(row.get(1).unwrap_or(0)),
                leads_enriched: count(row.get(2).unwrap_or(0)),
                leads_emailed: count(row.get(3).unwrap_or(0)),
            }),
            Ok(None) => Ok(CampaignCounters::default()),
            Err(e) => Err(DatabaseError::Query(format!("recount_campaign: {e}"))),
        }
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_leads(
        &self,
        leads: &[Lead],
        counters: CounterDelta,
    ) -> Result<(), DatabaseError> {
        let Some(first) = leads.first() else {
            return Ok(());
        };
        let campaign_id = first.campaign_id;
        let at = first.created_at;

        let _w = self.writer().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_leads begin: {e}")))?;

        let result = async {
            for lead in leads {
                insert_lead_row(&tx, lead).await?;
            }
            apply_counter_delta(&tx, campaign_id, counters, &at).await
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("insert_leads commit: {e}")))?;
                debug!(campaign_id = %campaign_id, count = leads.len(), "Leads inserted");
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_lead: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_lead(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_lead: {e}"))),
        }
    }

    async fn list_leads_in_state(
        &self,
        state: LeadState,
        limit: usize,
    ) -> Result<Vec<Lead>, DatabaseError> {
        let order = match state {
            LeadState::Enriched => "enriched_at ASC, updated_at ASC, created_at ASC",
            _ => "updated_at ASC, created_at ASC",
        };
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads WHERE state = ?1 ORDER BY {order} LIMIT ?2"
                ),
                params![state.as_str(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_leads_in_state: {e}")))?;
        Ok(collect_leads(rows).await)
    }

    async fn list_awaiting_reply(&self, limit: usize) -> Result<Vec<Lead>, DatabaseError> {
        // NULL sorts first in SQLite, so never-polled threads lead.
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads
                     WHERE state IN ('EMAILED_1', 'EMAILED_2')
                     ORDER BY (SELECT t.last_checked_at FROM email_threads t WHERE t.lead_id = leads.id) ASC,
                              updated_at ASC
                     LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_awaiting_reply: {e}")))?;
        Ok(collect_leads(rows).await)
    }

    async fn list_followup_due(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Lead>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads
                     WHERE state = 'EMAILED_1' AND emails_sent_count < 2
                       AND first_emailed_at IS NOT NULL AND first_emailed_at <= ?1
                     ORDER BY first_emailed_at ASC LIMIT ?2"
                ),
                params![fmt_ts(&cutoff), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_followup_due: {e}")))?;
        Ok(collect_leads(rows).await)
    }

    async fn count_leads_by_state(
        &self,
        campaign_id: Option<Uuid>,
    ) -> Result<HashMap<LeadState, u32>, DatabaseError> {
        let mut rows = match campaign_id {
            Some(id) => {
                self.conn()
                    .query(
                        "SELECT state, COUNT(*) FROM leads WHERE campaign_id = ?1 GROUP BY state",
                        params![id.to_string()],
                    )
                    .await
            }
            None => {
                self.conn()
                    .query("SELECT state, COUNT(*) FROM leads GROUP BY state", ())
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("count_leads_by_state: {e}")))?;

        let mut counts = HashMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let state_str: String = row.get(0).unwrap_or_default();
            let n: i64 = row.get(1).unwrap_or(0);
            match state_str.parse::<LeadState>() {
                Ok(state) => {
                    counts.insert(state, count(n));
                }
                Err(e) => tracing::warn!("Skipping state count row: {e}"),
            }
        }
        Ok(counts)
    }

    async fn commit_lead(&self, commit: &LeadCommit) -> Result<(), DatabaseError> {
        let _w = self.writer().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_lead begin: {e}")))?;

        match apply_commit(&tx, commit).await {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("commit_lead commit: {e}")))?;
                debug!(
                    lead_id = %commit.lead.id,
                    state = %commit.lead.state,
                    version = commit.lead.version + 1,
                    "Lead committed"
                );
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    // ── Threads ─────────────────────────────────────────────────────

    async fn get_thread_for_lead(
        &self,
        lead_id: Uuid,
    ) -> Result<Option<EmailThread>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {THREAD_COLUMNS} FROM email_threads WHERE lead_id = ?1"),
                params![lead_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_thread_for_lead: {e}")))?;

        let mut thread = match rows.next().await {
            Ok(Some(row)) => row_to_thread(&row)?,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get_thread_for_lead: {e}"))),
        };

        let mut rows = self
            .conn()
            .query(
                "SELECT role, content, external_id, created_at FROM thread_messages WHERE thread_id = ?1 ORDER BY seq ASC",
                params![thread.id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_thread_messages: {e}")))?;

        while let Ok(Some(row)) = rows.next().await {
            let role = match row.get::<String>(0).unwrap_or_default().as_str() {
                "received" => MessageRole::Received,
                _ => MessageRole::Sent,
            };
            let created_str: String = row.get(3).unwrap_or_default();
            thread.messages.push(ThreadMessage {
                role,
                content: row.get(1).unwrap_or_default(),
                external_id: row.get::<String>(2).ok(),
                timestamp: parse_datetime(&created_str),
            });
        }
        Ok(Some(thread))
    }

    async fn touch_thread_checked(
        &self,
        thread_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _w = self.writer().await;
        self.conn()
            .execute(
                "UPDATE email_threads SET last_checked_at = ?1 WHERE id = ?2",
                params![fmt_ts(&at), thread_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_thread_checked: {e}")))?;
        Ok(())
    }

    async fn thread_totals(&self) -> Result<ThreadTotals, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COALESCE(SUM(has_reply), 0), COALESCE(SUM(requires_human), 0) FROM email_threads",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("thread_totals: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(ThreadTotals {
                with_reply: count(row.get(0).unwrap_or(0)),
                requires_human: count(row.get(1).unwrap_or(0)),
            }),
            Ok(None) => Ok(ThreadTotals::default()),
            Err(e) => Err(DatabaseError::Query(format!("thread_totals: {e}"))),
        }
    }

    // ── Outbound ledger ─────────────────────────────────────────────

    async fn get_outbound(
        &self,
        lead_id: Uuid,
        kind: OutboundKind,
    ) -> Result<Option<OutboundSend>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {OUTBOUND_COLUMNS} FROM outbound_sends WHERE lead_id = ?1 AND kind = ?2"
                ),
                params![lead_id.to_string(), kind.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_outbound: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_outbound(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_outbound: {e}"))),
        }
    }

    async fn claim_outbound(&self, entry: &OutboundSend) -> Result<bool, DatabaseError> {
        let _w = self.writer().await;
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO outbound_sends ({OUTBOUND_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    entry.id.to_string(),
                    entry.lead_id.to_string(),
                    entry.kind.as_str(),
                    entry.status.as_str(),
                    opt_text(entry.subject.as_deref()),
                    opt_text(entry.body.as_deref()),
                    opt_text(entry.message_id.as_deref()),
                    fmt_ts(&entry.claimed_at),
                    opt_ts(entry.sent_at.as_ref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_outbound: {e}")))?;
        Ok(inserted > 0)
    }

    async fn mark_outbound_sent(
        &self,
        id: Uuid,
        message_id: &str,
        subject: &str,
        body: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _w = self.writer().await;
        self.conn()
            .execute(
                "UPDATE outbound_sends SET status = 'sent', message_id = ?1, subject = ?2, body = ?3, sent_at = ?4 WHERE id = ?5",
                params![message_id, subject, body, fmt_ts(&sent_at), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_outbound_sent: {e}")))?;
        Ok(())
    }

    async fn release_outbound(&self, id: Uuid) -> Result<(), DatabaseError> {
        let _w = self.writer().await;
        self.conn()
            .execute(
                "DELETE FROM outbound_sends WHERE id = ?1 AND status = 'claimed'",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_outbound: {e}")))?;
        Ok(())
    }

    async fn list_unresolved_outbound(&self) -> Result<Vec<OutboundSend>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {OUTBOUND_COLUMNS} FROM outbound_sends WHERE status = 'claimed' ORDER BY claimed_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_unresolved_outbound: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_outbound(&row) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("Skipping outbound row: {e}"),
            }
        }
        Ok(entries)
    }

    async fn sends_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<(u32, Option<DateTime<Utc>>), DatabaseError> {
        // Unresolved claims count too: they may have gone out.
        let mut rows = self
            .conn()
            .query(
                "SELECT
                    (SELECT COUNT(*) FROM outbound_sends WHERE COALESCE(sent_at, claimed_at) >= ?1),
                    (SELECT MAX(COALESCE(sent_at, claimed_at)) FROM outbound_sends)",
                params![fmt_ts(&since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("sends_since: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let n: i64 = row.get(0).unwrap_or(0);
                let last: Option<String> = row.get(1).ok();
                Ok((count(n), parse_optional_datetime(&last)))
            }
            Ok(None) => Ok((0, None)),
            Err(e) => Err(DatabaseError::Query(format!("sends_since: {e}"))),
        }
    }

    // ── Job runs ────────────────────────────────────────────────────

    async fn create_job_run(&self, run: &JobRun) -> Result<(), DatabaseError> {
        let _w = self.writer().await;
        self.conn()
            .execute(
                "INSERT INTO job_runs (id, kind, trigger, status, started_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run.id.to_string(),
                    run.kind.as_str(),
                    run.trigger.as_str(),
                    run.status.to_string(),
                    fmt_ts(&run.started_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_job_run: {e}")))?;
        Ok(())
    }

    async fn complete_job_run(
        &self,
        id: Uuid,
        status: RunStatus,
        report: &RunReport,
        summary: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _w = self.writer().await;
        self.conn()
            .execute(
                "UPDATE job_runs SET status=?1, completed_at=?2, candidates=?3, advanced=?4, unchanged=?5, deferred=?6, conflicts=?7, failed=?8, result_summary=?9 WHERE id=?10",
                params![
                    status.to_string(),
                    fmt_ts(&completed_at),
                    report.candidates as i64,
                    report.advanced as i64,
                    report.unchanged as i64,
                    report.deferred as i64,
                    report.conflicts as i64,
                    report.failed as i64,
                    opt_text(summary),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_job_run: {e}")))?;
        Ok(())
    }

    async fn last_job_run(&self, kind: JobKind) -> Result<Option<JobRun>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_RUN_COLUMNS} FROM job_runs WHERE kind = ?1 ORDER BY started_at DESC LIMIT 1"
                ),
                params![kind.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("last_job_run: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("last_job_run: {e}"))),
        }
    }

    async fn abandon_running_job_runs(&self, at: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let _w = self.writer().await;
        let n = self
            .conn()
            .execute(
                "UPDATE job_runs SET status = 'abandoned', completed_at = ?1 WHERE status = 'running'",
                params![fmt_ts(&at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("abandon_running_job_runs: {e}")))?;
        Ok(n as usize)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn contact(email: &str) -> ContactInfo {
        ContactInfo {
            first_name: "Grace".into(),
            last_name: "Hopper".into(),
            email: email.into(),
            profile_url: Some("https://linkedin.com/in/grace".into()),
            ..Default::default()
        }
    }

    async fn seed(db: &LibSqlBackend, n: usize) -> (Campaign, Vec<Lead>) {
        let campaign = Campaign::new("cto fintech", t0());
        db.insert_campaign(&campaign).await.unwrap();
        let leads: Vec<Lead> = (0..n)
            .map(|i| Lead::collected(campaign.id, contact(&format!("l{i}@x.io")), t0()))
            .collect();
        let delta = CounterDelta {
            found: n as i64,
            valid: n as i64,
            ..Default::default()
        };
        db.insert_leads(&leads, delta).await.unwrap();
        (campaign, leads)
    }

    // ── Campaigns ───────────────────────────────────────────────────

    #[tokio::test]
    async fn campaign_insert_and_get() {
        let db = test_db().await;
        let (campaign, _) = seed(&db, 3).await;

        let fetched = db.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(fetched.keywords, "cto fintech");
        assert_eq!(fetched.status, CampaignStatus::Pending);
        assert_eq!(fetched.counters.leads_found, 3);
        assert_eq!(fetched.counters.leads_valid, 3);
        assert_eq!(db.count_campaigns().await.unwrap(), 1);
        assert!(db.get_campaign(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn campaign_status_sets_completion_time() {
        let db = test_db().await;
        let (campaign, _) = seed(&db, 0).await;

        db.update_campaign_status(campaign.id, CampaignStatus::Active, None, t0())
            .await
            .unwrap();
        let c = db.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(c.status, CampaignStatus::Active);
        assert!(c.completed_at.is_none());

        db.update_campaign_status(campaign.id, CampaignStatus::Failed, Some("sourcing failed"), t0())
            .await
            .unwrap();
        let c = db.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(c.status, CampaignStatus::Failed);
        assert_eq!(c.error_message.as_deref(), Some("sourcing failed"));
        assert_eq!(c.completed_at, Some(t0()));

        let missing = db
            .update_campaign_status(Uuid::new_v4(), CampaignStatus::Active, None, t0())
            .await;
        assert!(matches!(missing, Err(DatabaseError::NotFound { .. })));
    }

    // ── Leads ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn lead_roundtrip_keeps_contact_and_timestamps() {
        let db = test_db().await;
        let (_, leads) = seed(&db, 1).await;

        let fetched = db.get_lead(leads[0].id).await.unwrap().unwrap();
        assert_eq!(fetched, leads[0]);
    }

    #[tokio::test]
    async fn list_in_state_is_oldest_first_and_limited() {
        let db = test_db().await;
        let (_, leads) = seed(&db, 3).await;

        for (i, lead) in leads.iter().enumerate() {
            let mut next = lead.clone();
            next.state = LeadState::Enriched;
            next.updated_at = t0() + chrono::Duration::minutes(10 - i as i64);
            db.commit_lead(&LeadCommit {
                lead: next,
                thread: None,
                outbound_id: None,
                counters: CounterDelta::default(),
            })
            .await
            .unwrap();
        }

        let enriched = db.list_leads_in_state(LeadState::Enriched, 2).await.unwrap();
        assert_eq!(enriched.len(), 2);
        assert_eq!(enriched[0].id, leads[2].id);
        assert_eq!(enriched[1].id, leads[1].id);
        assert!(enriched.iter().all(|l| l.version == 1));
    }

    #[tokio::test]
    async fn enriched_leads_are_listed_by_enrichment_time() {
        let db = test_db().await;
        let (_, leads) = seed(&db, 2).await;

        // Enriched second but touched first.
        for (lead, enriched, updated) in [
            (&leads[0], t0() + chrono::Duration::minutes(5), t0() + chrono::Duration::minutes(1)),
            (&leads[1], t0() + chrono::Duration::minutes(2), t0() + chrono::Duration::minutes(9)),
        ] {
            let mut next = lead.clone();
            next.state = LeadState::Enriched;
            next.enriched_at = Some(enriched);
            next.updated_at = updated;
            db.commit_lead(&LeadCommit {
                lead: next,
                thread: None,
                outbound_id: None,
                counters: CounterDelta::default(),
            })
            .await
            .unwrap();
        }

        let enriched = db.list_leads_in_state(LeadState::Enriched, 10).await.unwrap();
        let ids: Vec<Uuid> = enriched.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![leads[1].id, leads[0].id]);
    }

    #[tokio::test]
    async fn awaiting_reply_scan_rotates_by_last_check() {
        let db = test_db().await;
        let (_, leads) = seed(&db, 3).await;

        let mut threads = Vec::new();
        for (i, lead) in leads.iter().enumerate() {
            let mut next = lead.clone();
            next.state = if i == 2 { LeadState::Emailed2 } else { LeadState::Emailed1 };
            next.updated_at = t0() + chrono::Duration::minutes(i as i64);
            let thread = EmailThread::open(lead.id, "Hi", format!("<m{i}@x.io>"), t0());
            db.commit_lead(&LeadCommit {
                lead: next,
                thread: Some(thread.clone()),
                outbound_id: None,
                counters: CounterDelta::default(),
            })
            .await
            .unwrap();
            threads.push(thread);
        }

        // More candidates than the limit: the unchecked ones come first.
        let first = db.list_awaiting_reply(2).await.unwrap();
        let ids: Vec<Uuid> = first.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![leads[0].id, leads[1].id]);

        for (thread, mins) in threads.iter().zip([60, 61]) {
            db.touch_thread_checked(thread.id, t0() + chrono::Duration::minutes(mins))
                .await
                .unwrap();
        }
        let next = db.list_awaiting_reply(2).await.unwrap();
        let ids: Vec<Uuid> = next.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![leads[2].id, leads[0].id]);

        db.touch_thread_checked(threads[2].id, t0() + chrono::Duration::minutes(62))
            .await
            .unwrap();
        let ids: Vec<Uuid> = db
            .list_awaiting_reply(3)
            .await
            .unwrap()
            .iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(ids, vec![leads[0].id, leads[1].id, leads[2].id]);
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict_and_rolls_back() {
        let db = test_db().await;
        let (campaign, leads) = seed(&db, 1).await;

        let mut first = leads[0].clone();
        first.state = LeadState::Enriched;
        db.commit_lead(&LeadCommit {
            lead: first,
            thread: None,
            outbound_id: None,
            counters: CounterDelta {
                enriched: 1,
                ..Default::default()
            },
        })
        .await
        .unwrap();

        // Second writer still holds version 0.
        let mut stale = leads[0].clone();
        stale.state = LeadState::Enriched;
        let err = db
            .commit_lead(&LeadCommit {
                lead: stale,
                thread: None,
                outbound_id: None,
                counters: CounterDelta {
                    enriched: 1,
                    ..Default::default()
                },
            })
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let c = db.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(c.counters.leads_enriched, 1);
    }

    #[tokio::test]
    async fn followup_due_respects_cutoff_and_cap() {
        let db = test_db().await;
        let (_, leads) = seed(&db, 3).await;

        let sent_at = [t0(), t0() + chrono::Duration::days(5), t0()];
        let counts = [1u8, 1, 2];
        for ((lead, at), sent) in leads.iter().zip(sent_at).zip(counts) {
            let mut next = lead.clone();
            next.state = LeadState::Emailed1;
            next.emails_sent_count = sent;
            next.first_emailed_at = Some(at);
            db.commit_lead(&LeadCommit {
                lead: next,
                thread: None,
                outbound_id: None,
                counters: CounterDelta::default(),
            })
            .await
            .unwrap();
        }

        let due = db
            .list_followup_due(t0() + chrono::Duration::days(1), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, leads[0].id);
    }

    #[tokio::test]
    async fn state_counts_and_recount() {
        let db = test_db().await;
        let (campaign, leads) = seed(&db, 2).await;

        let mut next = leads[0].clone();
        next.state = LeadState::Enriched;
        next.enriched_at = Some(t0());
        db.commit_lead(&LeadCommit {
            lead: next,
            thread: None,
            outbound_id: None,
            counters: CounterDelta::default(),
        })
        .await
        .unwrap();

        let counts = db.count_leads_by_state(Some(campaign.id)).await.unwrap();
        assert_eq!(counts.get(&LeadState::Collected), Some(&1));
        assert_eq!(counts.get(&LeadState::Enriched), Some(&1));

        let recount = db.recount_campaign(campaign.id).await.unwrap();
        assert_eq!(recount.leads_found, 2);
        assert_eq!(recount.leads_valid, 2);
        assert_eq!(recount.leads_enriched, 1);
        assert_eq!(recount.leads_emailed, 0);
    }

    // ── Threads ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn thread_upsert_appends_messages() {
        let db = test_db().await;
        let (_, leads) = seed(&db, 1).await;

        let mut lead = leads[0].clone();
        let mut thread = EmailThread::open(lead.id, "Quick question", "<m1@x.io>", t0());
        thread.push(ThreadMessage::sent("hello", Some("<m1@x.io>".into()), t0()));
        lead.state = LeadState::Enriched;
        db.commit_lead(&LeadCommit {
            lead: lead.clone(),
            thread: Some(thread.clone()),
            outbound_id: None,
            counters: CounterDelta::default(),
        })
        .await
        .unwrap();

        thread.push(ThreadMessage::received("not now", Some("<r1@y.io>".into()), t0()));
        thread.reply_sentiment = Some(Sentiment::Negative);
        lead.version += 1;
        db.commit_lead(&LeadCommit {
            lead,
            thread: Some(thread.clone()),
            outbound_id: None,
            counters: CounterDelta::default(),
        })
        .await
        .unwrap();

        let stored = db.get_thread_for_lead(thread.lead_id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert!(stored.has_reply);
        assert_eq!(stored.reply_sentiment, Some(Sentiment::Negative));
        assert_eq!(stored.latest_received().unwrap().content, "not now");

        let totals = db.thread_totals().await.unwrap();
        assert_eq!(totals.with_reply, 1);
        assert_eq!(totals.requires_human, 0);
    }

    // ── Outbound ledger ─────────────────────────────────────────────

    #[tokio::test]
    async fn outbound_claim_is_once_per_kind() {
        let db = test_db().await;
        let (_, leads) = seed(&db, 1).await;
        let lead_id = leads[0].id;

        let claim = OutboundSend {
            id: Uuid::new_v4(),
            lead_id,
            kind: OutboundKind::First,
            status: OutboundStatus::Claimed,
            subject: None,
            body: None,
            message_id: None,
            claimed_at: t0(),
            sent_at: None,
        };
        assert!(db.claim_outbound(&claim).await.unwrap());
        let again = OutboundSend {
            id: Uuid::new_v4(),
            ..claim.clone()
        };
        assert!(!db.claim_outbound(&again).await.unwrap());
        assert_eq!(db.list_unresolved_outbound().await.unwrap().len(), 1);

        db.mark_outbound_sent(claim.id, "<m1@x.io>", "Hi", "Body", t0())
            .await
            .unwrap();
        let stored = db
            .get_outbound(lead_id, OutboundKind::First)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, OutboundStatus::Sent);
        assert_eq!(stored.message_id.as_deref(), Some("<m1@x.io>"));
        assert!(db.list_unresolved_outbound().await.unwrap().is_empty());

        // A sent row cannot be released.
        db.release_outbound(claim.id).await.unwrap();
        assert!(db.get_outbound(lead_id, OutboundKind::First).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sends_since_counts_window() {
        let db = test_db().await;
        let (_, leads) = seed(&db, 2).await;

        for (lead, at) in leads.iter().zip([t0(), t0() + chrono::Duration::hours(3)]) {
            let entry = OutboundSend {
                id: Uuid::new_v4(),
                lead_id: lead.id,
                kind: OutboundKind::First,
                status: OutboundStatus::Claimed,
                subject: None,
                body: None,
                message_id: None,
                claimed_at: at,
                sent_at: None,
            };
            db.claim_outbound(&entry).await.unwrap();
            db.mark_outbound_sent(entry.id, "<id>", "s", "b", at).await.unwrap();
        }

        let (n, last) = db.sends_since(t0() + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(last, Some(t0() + chrono::Duration::hours(3)));
    }

    // ── Job runs ────────────────────────────────────────────────────

    #[tokio::test]
    async fn job_run_lifecycle_and_abandon() {
        let db = test_db().await;

        let run = JobRun::start(JobKind::Dispatch, Trigger::Schedule, t0());
        db.create_job_run(&run).await.unwrap();
        let report = RunReport {
            candidates: 2,
            advanced: 1,
            deferred: 1,
            ..Default::default()
        };
        db.complete_job_run(run.id, RunStatus::Ok, &report, Some("done"), t0())
            .await
            .unwrap();

        let last = db.last_job_run(JobKind::Dispatch).await.unwrap().unwrap();
        assert_eq!(last.status, RunStatus::Ok);
        assert_eq!(last.report, report);

        let stuck = JobRun::start(JobKind::ReplyPoll, Trigger::Manual, t0());
        db.create_job_run(&stuck).await.unwrap();
        assert_eq!(db.abandon_running_job_runs(t0()).await.unwrap(), 1);
        let last = db.last_job_run(JobKind::ReplyPoll).await.unwrap().unwrap();
        assert_eq!(last.status, RunStatus::Abandoned);
        assert_eq!(last.trigger, Trigger::Manual);
        assert!(db.last_job_run(JobKind::Followup).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outreach.db");
        let campaign_id = {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            let (campaign, _) = seed(&db, 1).await;
            campaign.id
        };
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_campaign(campaign_id).await.unwrap().is_some());
    }
}
