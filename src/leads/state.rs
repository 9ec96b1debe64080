//! Lead lifecycle state machine.
//!
//! Pure transition logic: given a lead and an event, decide the next state
//! and the side effects the caller must carry out. Nothing here touches the
//! store, the mail transport, or the clock; the orchestrator owns all I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::{Lead, LeadState, MAX_EMAILS_PER_LEAD};
use super::thread::Sentiment;

/// Something that happened to a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "sentiment", rename_all = "snake_case")]
pub enum LeadEvent {
    /// The enrichment collaborator finished.
    EnrichmentCompleted,
    /// The dispatcher obtained a send permit for this lead.
    DispatchApproved,
    /// A reply on an EMAILED_1 thread was classified.
    ReplyClassified(Sentiment),
    /// No reply within the follow-up threshold.
    NoReplyTimeout,
    /// Any reply on an EMAILED_2 thread.
    ReplyReceived,
    /// An operator closed the lead.
    ManualClose,
}

impl LeadEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::EnrichmentCompleted => "enrichment_completed",
            Self::DispatchApproved => "dispatch_approved",
            Self::ReplyClassified(_) => "reply_classified",
            Self::NoReplyTimeout => "no_reply_timeout",
            Self::ReplyReceived => "reply_received",
            Self::ManualClose => "manual_close",
        }
    }
}

/// Which outbound message a send side effect asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    /// The first outreach message.
    First,
    /// Follow-up after the silent period.
    NoReplyFollowup,
    /// One polite answer to a refusal.
    RefusalFollowup,
}

impl OutboundKind {
    /// Whether the send counts toward the two-message cap.
    pub fn is_counted(&self) -> bool {
        !matches!(self, Self::RefusalFollowup)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::First => "first",
            Self::NoReplyFollowup => "no_reply_followup",
            Self::RefusalFollowup => "refusal_followup",
        }
    }
}

impl std::fmt::Display for OutboundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboundKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(Self::First),
            "no_reply_followup" => Ok(Self::NoReplyFollowup),
            "refusal_followup" => Ok(Self::RefusalFollowup),
            other => Err(format!("unknown outbound kind: {other}")),
        }
    }
}

/// Work the caller must perform as part of the same atomic unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    Send(OutboundKind),
    MarkRequiresHuman,
}

/// An accepted edge of the lifecycle graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: LeadState,
    pub to: LeadState,
    pub event: LeadEvent,
    pub effects: Vec<SideEffect>,
}

impl Transition {
    pub fn send(&self) -> Option<OutboundKind> {
        self.effects.iter().find_map(|e| match e {
            SideEffect::Send(kind) => Some(*kind),
            SideEffect::MarkRequiresHuman => None,
        })
    }

    pub fn marks_requires_human(&self) -> bool {
        self.effects.contains(&SideEffect::MarkRequiresHuman)
    }
}

/// Result of evaluating an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Move along an edge.
    Advance(Transition),
    /// Valid event, state unchanged (neutral reply keeps monitoring).
    Stay,
    /// Event not valid for the current state.
    Ignore { state: LeadState, event: LeadEvent },
}

impl Decision {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignore { .. })
    }
}

/// Evaluate `event` against `lead`.
pub fn transition(lead: &Lead, event: LeadEvent) -> Decision {
    use LeadEvent::*;
    use LeadState::*;

    let advance = |to: LeadState, effects: Vec<SideEffect>| {
        Decision::Advance(Transition {
            from: lead.state,
            to,
            event,
            effects,
        })
    };

    match (lead.state, event) {
        (Collected, EnrichmentCompleted) => advance(Enriched, vec![]),

        (Enriched, DispatchApproved) if lead.emails_sent_count < MAX_EMAILS_PER_LEAD => {
            advance(Emailed1, vec![SideEffect::Send(OutboundKind::First)])
        }

        (Emailed1, ReplyClassified(Sentiment::Positive)) => {
            advance(Interested, vec![SideEffect::MarkRequiresHuman])
        }
        (Emailed1, ReplyClassified(Sentiment::Negative)) => advance(
            NotInterested,
            vec![SideEffect::Send(OutboundKind::RefusalFollowup)],
        ),
        (Emailed1, ReplyClassified(Sentiment::Neutral)) => Decision::Stay,

        (Emailed1, NoReplyTimeout) if lead.emails_sent_count < MAX_EMAILS_PER_LEAD => advance(
            Emailed2,
            vec![SideEffect::Send(OutboundKind::NoReplyFollowup)],
        ),

        (Emailed2, ReplyReceived) => advance(Closed, vec![SideEffect::MarkRequiresHuman]),

        (Interested | NotInterested | Emailed2, ManualClose) => advance(Closed, vec![]),

        (state, event) => Decision::Ignore { state, event },
    }
}

/// Apply an accepted transition to the lead's own fields.
///
/// Thread effects (`MarkRequiresHuman`) and the actual send are the
/// caller's job; this only keeps the counters and timestamps in step.
pub fn apply(lead: &mut Lead, transition: &Transition, now: DateTime<Utc>) {
    debug_assert_eq!(lead.state, transition.from);
    debug_assert!(transition.from.can_transition_to(transition.to));

    if let Some(kind) = transition.send() {
        if kind.is_counted() {
            lead.emails_sent_count = (lead.emails_sent_count + 1).min(MAX_EMAILS_PER_LEAD);
        }
        if kind == OutboundKind::First && lead.first_emailed_at.is_none() {
            lead.first_emailed_at = Some(now);
        }
        lead.last_emailed_at = Some(now);
    }
    if transition.to == LeadState::Enriched {
        lead.enriched_at = Some(now);
    }

    lead.state = transition.to;
    lead.updated_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leads::model::ContactInfo;
    use uuid::Uuid;

    fn lead_in(state: LeadState, sent: u8) -> Lead {
        let mut lead = Lead::collected(Uuid::new_v4(), ContactInfo::default(), Utc::now());
        lead.state = state;
        lead.emails_sent_count = sent;
        lead
    }

    fn advance(decision: Decision) -> Transition {
        match decision {
            Decision::Advance(t) => t,
            other => panic!("expected advance, got {other:?}"),
        }
    }

    #[test]
    fn enrichment_moves_collected_to_enriched() {
        let t = advance(transition(
            &lead_in(LeadState::Collected, 0),
            LeadEvent::EnrichmentCompleted,
        ));
        assert_eq!(t.to, LeadState::Enriched);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn enrichment_replay_is_ignored() {
        let lead = lead_in(LeadState::Enriched, 0);
        let decision = transition(&lead, LeadEvent::EnrichmentCompleted);
        assert!(decision.is_ignored());
    }

    #[test]
    fn dispatch_sends_first_message() {
        let mut lead = lead_in(LeadState::Enriched, 0);
        let t = advance(transition(&lead, LeadEvent::DispatchApproved));
        assert_eq!(t.to, LeadState::Emailed1);
        assert_eq!(t.send(), Some(OutboundKind::First));

        let now = Utc::now();
        apply(&mut lead, &t, now);
        assert_eq!(lead.state, LeadState::Emailed1);
        assert_eq!(lead.emails_sent_count, 1);
        assert_eq!(lead.first_emailed_at, Some(now));
    }

    #[test]
    fn positive_reply_hands_over_without_sending() {
        let t = advance(transition(
            &lead_in(LeadState::Emailed1, 1),
            LeadEvent::ReplyClassified(Sentiment::Positive),
        ));
        assert_eq!(t.to, LeadState::Interested);
        assert!(t.marks_requires_human());
        assert_eq!(t.send(), None);
    }

    #[test]
    fn negative_reply_sends_one_uncounted_followup() {
        let mut lead = lead_in(LeadState::Emailed1, 1);
        let t = advance(transition(
            &lead,
            LeadEvent::ReplyClassified(Sentiment::Negative),
        ));
        assert_eq!(t.to, LeadState::NotInterested);
        assert!(!t.marks_requires_human());
        let sends: Vec<_> = t
            .effects
            .iter()
            .filter(|e| matches!(e, SideEffect::Send(_)))
            .collect();
        assert_eq!(sends, vec![&SideEffect::Send(OutboundKind::RefusalFollowup)]);

        apply(&mut lead, &t, Utc::now());
        assert_eq!(lead.emails_sent_count, 1);
    }

    #[test]
    fn neutral_reply_stays() {
        let decision = transition(
            &lead_in(LeadState::Emailed1, 1),
            LeadEvent::ReplyClassified(Sentiment::Neutral),
        );
        assert_eq!(decision, Decision::Stay);
    }

    #[test]
    fn silence_sends_counted_followup() {
        let mut lead = lead_in(LeadState::Emailed1, 1);
        let first = Utc::now();
        lead.first_emailed_at = Some(first);
        let t = advance(transition(&lead, LeadEvent::NoReplyTimeout));
        assert_eq!(t.send(), Some(OutboundKind::NoReplyFollowup));

        apply(&mut lead, &t, first + chrono::Duration::days(14));
        assert_eq!(lead.state, LeadState::Emailed2);
        assert_eq!(lead.emails_sent_count, 2);
        assert_eq!(lead.first_emailed_at, Some(first));
    }

    #[test]
    fn cap_blocks_counted_sends() {
        let lead = lead_in(LeadState::Emailed1, 2);
        assert!(transition(&lead, LeadEvent::NoReplyTimeout).is_ignored());
    }

    #[test]
    fn any_reply_on_second_mail_closes_for_human() {
        let t = advance(transition(
            &lead_in(LeadState::Emailed2, 2),
            LeadEvent::ReplyReceived,
        ));
        assert_eq!(t.to, LeadState::Closed);
        assert!(t.marks_requires_human());
        assert_eq!(t.send(), None);
    }

    #[test]
    fn emailed2_ignores_classification_and_timeout() {
        let lead = lead_in(LeadState::Emailed2, 2);
        assert!(transition(&lead, LeadEvent::ReplyClassified(Sentiment::Negative)).is_ignored());
        assert!(transition(&lead, LeadEvent::NoReplyTimeout).is_ignored());
    }

    #[test]
    fn manual_close_only_from_settled_states() {
        for state in [
            LeadState::Interested,
            LeadState::NotInterested,
            LeadState::Emailed2,
        ] {
            let t = advance(transition(&lead_in(state, 1), LeadEvent::ManualClose));
            assert_eq!(t.to, LeadState::Closed);
            assert!(t.effects.is_empty());
        }
        for state in [
            LeadState::Collected,
            LeadState::Enriched,
            LeadState::Emailed1,
            LeadState::Closed,
        ] {
            assert!(transition(&lead_in(state, 0), LeadEvent::ManualClose).is_ignored());
        }
    }

    #[test]
    fn periodic_events_ignored_outside_their_states() {
        let periodic = [
            LeadEvent::DispatchApproved,
            LeadEvent::ReplyClassified(Sentiment::Positive),
            LeadEvent::NoReplyTimeout,
            LeadEvent::ReplyReceived,
        ];
        for state in [
            LeadState::Collected,
            LeadState::Interested,
            LeadState::NotInterested,
            LeadState::Closed,
        ] {
            for event in periodic {
                assert!(
                    transition(&lead_in(state, 0), event).is_ignored(),
                    "{state} should ignore {}",
                    event.name()
                );
            }
        }
    }

    #[test]
    fn every_advance_follows_a_graph_edge() {
        let events = [
            LeadEvent::EnrichmentCompleted,
            LeadEvent::DispatchApproved,
            LeadEvent::ReplyClassified(Sentiment::Positive),
            LeadEvent::ReplyClassified(Sentiment::Negative),
            LeadEvent::ReplyClassified(Sentiment::Neutral),
            LeadEvent::NoReplyTimeout,
            LeadEvent::ReplyReceived,
            LeadEvent::ManualClose,
        ];
        for state in LeadState::ALL {
            for sent in 0..=MAX_EMAILS_PER_LEAD {
                for event in events {
                    if let Decision::Advance(t) = transition(&lead_in(state, sent), event) {
                        assert!(state.can_transition_to(t.to));
                    }
                }
            }
        }
    }
}
