//! Nudges EMAILED_1 leads whose first message has gone unanswered for the
//! configured silence period.

use tokio::time::timeout;
use tracing::debug;

use super::orchestrator::{DeferReason, JobOrchestrator, StepOutcome};
use super::{JobKind, RunReport};
use crate::error::{Error, MailError};
use crate::leads::{EmailThread, Lead, LeadEvent, LeadState};

pub(super) async fn run(orch: &JobOrchestrator) -> Result<RunReport, Error> {
    let cutoff = orch.now() - orch.schedule().followup_after;
    let candidates = orch
        .store()
        .list_followup_due(cutoff, orch.schedule().max_leads_per_run)
        .await?;
    let mut report = RunReport::default();

    for candidate in candidates {
        if orch.is_shutting_down() {
            break;
        }
        report.candidates += 1;

        let outcome = orch
            .with_lead(candidate.id, &[LeadState::Emailed1], |lead| async move {
                // Re-check against the fresh row.
                if !lead.first_emailed_at.is_some_and(|at| at <= cutoff) {
                    return Ok(StepOutcome::Ignored);
                }
                let thread = orch.store().get_thread_for_lead(lead.id).await?;
                if let Some(t) = thread.as_ref()
                    && (t.has_unsettled_reply() || has_unseen_reply(orch, &lead, t).await?)
                {
                    debug!(lead_id = %lead.id, "Lead has replied, leaving it to the reply poller");
                    return Ok(StepOutcome::Deferred(DeferReason::PendingReply));
                }
                orch.execute(lead, LeadEvent::NoReplyTimeout, thread).await
            })
            .await;

        orch.log_outcome(JobKind::Followup, candidate.id, &outcome);
        report.record(&outcome);
    }

    Ok(report)
}

/// A reply sitting in the mailbox that the poller has not stored yet.
async fn has_unseen_reply(
    orch: &JobOrchestrator,
    lead: &Lead,
    thread: &EmailThread,
) -> Result<bool, Error> {
    let limit = orch.collaborator_timeout();
    let fetched = timeout(limit, orch.mail().fetch_replies(thread, &lead.contact.email))
        .await
        .map_err(|_| MailError::Timeout(limit))??;
    Ok(fetched.iter().any(|m| !thread.contains_external(&m.message_id)))
}
