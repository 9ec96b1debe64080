//! Lead records and lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of counted outbound messages per lead (first + follow-up).
pub const MAX_EMAILS_PER_LEAD: u8 = 2;

/// Lifecycle state of a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeadState {
    /// Returned by the sourcing collaborator.
    #[serde(rename = "COLLECTED")]
    Collected,
    /// Profile enrichment attached.
    #[serde(rename = "ENRICHED")]
    Enriched,
    /// First message sent, waiting for a reply.
    #[serde(rename = "EMAILED_1")]
    Emailed1,
    /// Positive reply received, human takeover.
    #[serde(rename = "INTERESTED")]
    Interested,
    /// Negative reply received and answered once.
    #[serde(rename = "NOT_INTERESTED")]
    NotInterested,
    /// Follow-up sent after 14 silent days, waiting for a reply.
    #[serde(rename = "EMAILED_2")]
    Emailed2,
    /// Terminal.
    #[serde(rename = "CLOSED")]
    Closed,
}

impl LeadState {
    pub const ALL: [LeadState; 7] = [
        Self::Collected,
        Self::Enriched,
        Self::Emailed1,
        Self::Interested,
        Self::NotInterested,
        Self::Emailed2,
        Self::Closed,
    ];

    /// Edges of the lifecycle graph. Self-loops are not edges.
    pub fn can_transition_to(&self, target: LeadState) -> bool {
        use LeadState::*;

        matches!(
            (self, target),
            (Collected, Enriched)
                | (Enriched, Emailed1)
                | (Emailed1, Interested)
                | (Emailed1, NotInterested)
                | (Emailed1, Emailed2)
                | (Emailed2, Closed)
                | (Interested, Closed)
                | (NotInterested, Closed)
        )
    }

    /// No further automatic transitions happen from these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Interested | Self::NotInterested | Self::Closed)
    }

    /// States in which at least one outbound message has gone out.
    pub fn is_contacted(&self) -> bool {
        !matches!(self, Self::Collected | Self::Enriched)
    }

    /// States the reply poller watches.
    pub fn is_awaiting_reply(&self) -> bool {
        matches!(self, Self::Emailed1 | Self::Emailed2)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collected => "COLLECTED",
            Self::Enriched => "ENRICHED",
            Self::Emailed1 => "EMAILED_1",
            Self::Interested => "INTERESTED",
            Self::NotInterested => "NOT_INTERESTED",
            Self::Emailed2 => "EMAILED_2",
            Self::Closed => "CLOSED",
        }
    }
}

impl std::fmt::Display for LeadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LeadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown lead state: {s}"))
    }
}

/// Contact and company fields. Opaque to the state machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub profile_url: Option<String>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub company_domain: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl ContactInfo {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// A lead is valid for outreach when it has both a mailbox and a profile.
    pub fn is_valid(&self) -> bool {
        self.email.contains('@')
            && self
                .profile_url
                .as_deref()
                .is_some_and(|url| !url.trim().is_empty())
    }
}

/// Data attached by the enrichment collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentData {
    /// Recent public posts used for personalization.
    #[serde(default)]
    pub recent_posts: Vec<String>,
    #[serde(default)]
    pub headline: Option<String>,
    #[serde(default)]
    pub company_description: Option<String>,
    #[serde(default)]
    pub personalization_angle: Option<String>,
}

/// A lead as handed over by the sourcing collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLead {
    pub contact: ContactInfo,
}

/// One prospective contact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lead {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub state: LeadState,
    pub contact: ContactInfo,
    pub enrichment: Option<EnrichmentData>,
    /// Counted outbound messages, 0..=2. The refusal follow-up is not counted.
    pub emails_sent_count: u8,
    pub first_emailed_at: Option<DateTime<Utc>>,
    pub last_emailed_at: Option<DateTime<Utc>>,
    pub enriched_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped on every committed transition.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// Build a fresh COLLECTED lead.
    pub fn collected(campaign_id: Uuid, contact: ContactInfo, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            state: LeadState::Collected,
            contact,
            enrichment: None,
            emails_sent_count: 0,
            first_emailed_at: None,
            last_emailed_at: None,
            enriched_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_send_counted_email(&self) -> bool {
        self.emails_sent_count < MAX_EMAILS_PER_LEAD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_edges() {
        use LeadState::*;
        assert!(Collected.can_transition_to(Enriched));
        assert!(Enriched.can_transition_to(Emailed1));
        assert!(Emailed1.can_transition_to(Interested));
        assert!(Emailed1.can_transition_to(NotInterested));
        assert!(Emailed1.can_transition_to(Emailed2));
        assert!(Emailed2.can_transition_to(Closed));
        assert!(Interested.can_transition_to(Closed));
        assert!(NotInterested.can_transition_to(Closed));
    }

    #[test]
    fn no_backward_or_skipping_edges() {
        use LeadState::*;
        assert!(!Enriched.can_transition_to(Collected));
        assert!(!Collected.can_transition_to(Emailed1));
        assert!(!Emailed1.can_transition_to(Closed));
        assert!(!Emailed2.can_transition_to(Emailed1));
        assert!(!Closed.can_transition_to(Collected));
        for state in LeadState::ALL {
            assert!(!Closed.can_transition_to(state));
            assert!(!state.can_transition_to(state));
        }
    }

    #[test]
    fn terminal_states() {
        assert!(LeadState::Interested.is_terminal());
        assert!(LeadState::NotInterested.is_terminal());
        assert!(LeadState::Closed.is_terminal());
        assert!(!LeadState::Emailed2.is_terminal());
        assert!(!LeadState::Collected.is_terminal());
    }

    #[test]
    fn state_string_roundtrip() {
        for state in LeadState::ALL {
            let parsed: LeadState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("WAITING".parse::<LeadState>().is_err());
    }

    #[test]
    fn state_serde_uses_wire_names() {
        let json = serde_json::to_string(&LeadState::Emailed1).unwrap();
        assert_eq!(json, "\"EMAILED_1\"");
        let parsed: LeadState = serde_json::from_str("\"NOT_INTERESTED\"").unwrap();
        assert_eq!(parsed, LeadState::NotInterested);
    }

    #[test]
    fn contact_validity_requires_profile() {
        let mut contact = ContactInfo {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@example.com".into(),
            ..Default::default()
        };
        assert!(!contact.is_valid());
        contact.profile_url = Some("https://linkedin.com/in/ada".into());
        assert!(contact.is_valid());
        contact.email = "not-an-address".into();
        assert!(!contact.is_valid());
        assert_eq!(contact.full_name(), "Ada Lovelace");
    }
}
