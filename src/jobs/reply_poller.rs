//! Watches open threads for replies.
//!
//! New replies are stored on the thread before anything else happens, so a
//! lead that answered is never treated as silent. For EMAILED_1 leads the
//! latest reply is classified and the sentiment drives the transition. A
//! reply that could not be classified, or whose follow-up was deferred, stays
//! unsettled on the thread and is picked up again on the next run. For
//! EMAILED_2 any reply closes the lead; classification there is informational
//! only.

use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::orchestrator::{JobOrchestrator, StepOutcome};
use super::outbox;
use super::{JobKind, RunReport};
use crate::channels::InboundMail;
use crate::error::{ClassifyError, Error, MailError};
use crate::leads::{
    EmailThread, Lead, LeadEvent, LeadState, OutboundKind, Sentiment, ThreadMessage,
};

/// Upper bound on threads visited per run. Least recently checked go first,
/// so successive runs rotate through larger backlogs.
const SCAN_LIMIT: usize = 1000;

const AWAITING: [LeadState; 2] = [LeadState::Emailed1, LeadState::Emailed2];

pub(super) async fn run(orch: &JobOrchestrator) -> Result<RunReport, Error> {
    let candidates = orch.store().list_awaiting_reply(SCAN_LIMIT).await?;
    let after_followup = candidates
        .iter()
        .filter(|l| l.state == LeadState::Emailed2)
        .count();
    if after_followup > 0 {
        info!(count = after_followup, "Leads awaiting a reply after follow-up");
    }

    let mut report = RunReport::default();
    for candidate in candidates {
        if orch.is_shutting_down() {
            break;
        }
        report.candidates += 1;

        let outcome = orch
            .with_lead(candidate.id, &AWAITING, |lead| poll_lead(orch, lead))
            .await;

        orch.log_outcome(JobKind::ReplyPoll, candidate.id, &outcome);
        report.record(&outcome);
    }

    Ok(report)
}

async fn poll_lead(orch: &JobOrchestrator, lead: Lead) -> Result<StepOutcome, Error> {
    let Some(mut thread) = orch.store().get_thread_for_lead(lead.id).await? else {
        warn!(lead_id = %lead.id, state = %lead.state, "Contacted lead has no thread");
        return Ok(StepOutcome::Ignored);
    };

    let limit = orch.collaborator_timeout();
    let fetched = timeout(limit, orch.mail().fetch_replies(&thread, &lead.contact.email))
        .await
        .map_err(|_| MailError::Timeout(limit))??;

    let now = orch.now();
    let fresh: Vec<InboundMail> = fetched
        .into_iter()
        .filter(|m| !thread.contains_external(&m.message_id))
        .collect();
    let has_new = !fresh.is_empty();
    let unsettled = lead.state == LeadState::Emailed1 && thread.has_unsettled_reply();
    if !has_new && !unsettled {
        orch.store().touch_thread_checked(thread.id, now).await?;
        return Ok(StepOutcome::Unchanged);
    }

    if has_new {
        debug!(lead_id = %lead.id, new = fresh.len(), "New replies on thread");
        for mail in fresh {
            thread.push(ThreadMessage::received(
                mail.body,
                Some(mail.message_id),
                mail.received_at,
            ));
        }
    }
    thread.last_checked_at = Some(now);

    match lead.state {
        LeadState::Emailed1 => settle_first_reply(orch, lead, thread, has_new).await,
        _ => {
            match classify_latest(orch, &thread).await {
                Ok(sentiment) => thread.reply_sentiment = Some(sentiment),
                Err(e) => debug!(lead_id = %lead.id, "Reply left unlabelled: {e}"),
            }
            orch.execute(lead, LeadEvent::ReplyReceived, Some(thread)).await
        }
    }
}

/// Label the latest reply to the first mail and act on it. Whatever happens,
/// the stored thread ends up holding every reply seen so far.
async fn settle_first_reply(
    orch: &JobOrchestrator,
    lead: Lead,
    mut thread: EmailThread,
    has_new: bool,
) -> Result<StepOutcome, Error> {
    let refusal_sent =
        outbox::sent_uncommitted(orch, lead.id, OutboundKind::RefusalFollowup).await?;
    let sentiment = if refusal_sent {
        // The refusal already went out; the reply was negative.
        Sentiment::Negative
    } else if let (false, Some(label)) = (has_new, thread.reply_sentiment) {
        label
    } else {
        thread.reply_sentiment = None;
        match classify_latest(orch, &thread).await {
            Ok(label) => label,
            Err(e) => {
                orch.save_thread(lead, thread).await?;
                return Err(e.into());
            }
        }
    };
    thread.reply_sentiment = Some(sentiment);

    let outcome = orch
        .execute(
            lead.clone(),
            LeadEvent::ReplyClassified(sentiment),
            Some(thread.clone()),
        )
        .await?;
    if let StepOutcome::Deferred(reason) = outcome {
        debug!(lead_id = %lead.id, sentiment = %sentiment, reason = ?reason, "Reply recorded, action deferred");
        orch.save_thread(lead, thread).await?;
    }
    Ok(outcome)
}

async fn classify_latest(
    orch: &JobOrchestrator,
    thread: &EmailThread,
) -> Result<Sentiment, ClassifyError> {
    let text = thread
        .latest_received()
        .map(|m| m.content.as_str())
        .unwrap_or_default();
    let limit = orch.collaborator_timeout();
    timeout(limit, orch.classifier().classify(text))
        .await
        .map_err(|_| ClassifyError::Timeout(limit))?
}
