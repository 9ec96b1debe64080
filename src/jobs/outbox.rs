//! Gated, idempotent sends.
//!
//! Every outbound message goes through [`deliver`]. The order is fixed:
//! check the ledger, take a rate-limit permit, claim the ledger row,
//! generate, send, mark the row sent. The caller then commits the lead
//! transition, which consumes the row.
//!
//! A row left `sent` means the transport took the message but the commit
//! never landed; the next attempt reuses it without sending again. A row
//! left `claimed` means the outcome is unknown and it is never retried
//! automatically.

use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::orchestrator::{DeferReason, JobOrchestrator};
use crate::channels::{OutgoingMail, normalize_message_id};
use crate::error::{DatabaseError, Error, LlmError, MailError};
use crate::leads::{EmailThread, Lead, OutboundKind};
use crate::ratelimit::SendPermit;
use crate::store::{OutboundSend, OutboundStatus};

/// What was sent, for recording on the thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SendReceipt {
    pub ledger_id: Uuid,
    pub message_id: String,
    pub subject: String,
    pub body: String,
    /// Recovered from the ledger; nothing went over the wire this time.
    pub reconciled: bool,
}

#[derive(Debug)]
pub(crate) enum Delivery {
    Sent(SendReceipt),
    Deferred(DeferReason),
}

fn bracketed(id: &str) -> String {
    format!("<{}>", normalize_message_id(id))
}

/// Follow-ups answer the latest reply if there is one, else our first mail.
fn outgoing(
    lead: &Lead,
    kind: OutboundKind,
    thread: Option<&EmailThread>,
    subject: &str,
    body: &str,
) -> OutgoingMail {
    let mut mail = OutgoingMail::new(lead.contact.email.clone(), subject, body);
    let Some(thread) = thread.filter(|_| kind != OutboundKind::First) else {
        return mail;
    };

    mail = mail.replying_to(bracketed(&thread.thread_key));
    if let Some(reply) = thread.latest_received().and_then(|m| m.external_id.as_deref()) {
        let reply = bracketed(reply);
        mail.references.push(reply.clone());
        mail.in_reply_to = Some(reply);
    }
    mail
}

pub(crate) async fn deliver(
    orch: &JobOrchestrator,
    lead: &Lead,
    kind: OutboundKind,
    thread: Option<&EmailThread>,
) -> Result<Delivery, Error> {
    let store = orch.store();

    if let Some(entry) = store.get_outbound(lead.id, kind).await? {
        return match entry.status {
            OutboundStatus::Sent => {
                info!(
                    lead_id = %lead.id,
                    kind = %kind,
                    "Send already happened, committing without resending"
                );
                Ok(Delivery::Sent(SendReceipt {
                    ledger_id: entry.id,
                    message_id: entry.message_id.unwrap_or_default(),
                    subject: entry.subject.unwrap_or_default(),
                    body: entry.body.unwrap_or_default(),
                    reconciled: true,
                }))
            }
            OutboundStatus::Claimed => {
                warn!(
                    lead_id = %lead.id,
                    kind = %kind,
                    claimed_at = %entry.claimed_at,
                    "Send outcome unknown, needs operator review"
                );
                Ok(Delivery::Deferred(DeferReason::UnresolvedSend))
            }
            OutboundStatus::Committed => Err(DatabaseError::Constraint(format!(
                "{kind} send for lead {} already committed",
                lead.id
            ))
            .into()),
        };
    }

    let limiter = orch.limiter();
    let Some(permit) = limiter.try_acquire() else {
        debug!(lead_id = %lead.id, kind = %kind, "Rate limited, deferring send");
        return Ok(Delivery::Deferred(DeferReason::RateLimited));
    };

    let claim = OutboundSend {
        id: Uuid::new_v4(),
        lead_id: lead.id,
        kind,
        status: OutboundStatus::Claimed,
        subject: None,
        body: None,
        message_id: None,
        claimed_at: orch.now(),
        sent_at: None,
    };
    match store.claim_outbound(&claim).await {
        Ok(true) => {}
        Ok(false) => {
            limiter.refund(permit);
            debug!(lead_id = %lead.id, kind = %kind, "Send claimed elsewhere");
            return Ok(Delivery::Deferred(DeferReason::LeadBusy));
        }
        Err(e) => {
            limiter.refund(permit);
            return Err(e.into());
        }
    }

    let limit = orch.collaborator_timeout();
    let email = match timeout(limit, orch.generator().generate(lead, kind, thread)).await {
        Ok(Ok(email)) => email,
        Ok(Err(e)) => {
            abandon_claim(orch, claim.id, permit).await;
            return Err(e.into());
        }
        Err(_) => {
            abandon_claim(orch, claim.id, permit).await;
            return Err(LlmError::Timeout(limit).into());
        }
    };

    let mail = outgoing(lead, kind, thread, &email.subject, &email.body);
    let sent = match timeout(limit, orch.mail().send(&mail)).await {
        Ok(Ok(sent)) => sent,
        Ok(Err(MailError::Timeout(d))) => {
            error!(lead_id = %lead.id, kind = %kind, "Send timed out, outcome unknown");
            return Err(MailError::Timeout(d).into());
        }
        Ok(Err(e)) => {
            abandon_claim(orch, claim.id, permit).await;
            return Err(e.into());
        }
        Err(_) => {
            error!(lead_id = %lead.id, kind = %kind, "Send timed out, outcome unknown");
            return Err(MailError::Timeout(limit).into());
        }
    };

    store
        .mark_outbound_sent(
            claim.id,
            &sent.message_id,
            &email.subject,
            &email.body,
            orch.now(),
        )
        .await?;

    Ok(Delivery::Sent(SendReceipt {
        ledger_id: claim.id,
        message_id: sent.message_id,
        subject: email.subject,
        body: email.body,
        reconciled: false,
    }))
}

/// Whether a `kind` send went out for this lead without its transition
/// being committed.
pub(crate) async fn sent_uncommitted(
    orch: &JobOrchestrator,
    lead_id: Uuid,
    kind: OutboundKind,
) -> Result<bool, Error> {
    Ok(orch
        .store()
        .get_outbound(lead_id, kind)
        .await?
        .is_some_and(|entry| entry.status == OutboundStatus::Sent))
}

/// The send definitely did not happen: drop the claim and return the permit.
async fn abandon_claim(orch: &JobOrchestrator, ledger_id: Uuid, permit: SendPermit) {
    orch.limiter().refund(permit);
    if let Err(e) = orch.store().release_outbound(ledger_id).await {
        error!(ledger_id = %ledger_id, "Failed to release send claim: {e}");
    }
}
