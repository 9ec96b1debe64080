//! Conversation record for one lead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Classification of an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "POSITIVE",
            Self::Negative => "NEGATIVE",
            Self::Neutral => "NEUTRAL",
        }
    }
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Sentiment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POSITIVE" => Ok(Self::Positive),
            "NEGATIVE" => Ok(Self::Negative),
            "NEUTRAL" => Ok(Self::Neutral),
            other => Err(format!("unknown sentiment: {other}")),
        }
    }
}

/// Direction of a thread message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Sent,
    Received,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Received => "received",
        }
    }
}

/// One message in a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub role: MessageRole,
    pub content: String,
    /// Transport Message-ID, used to append each inbound message once.
    pub external_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ThreadMessage {
    pub fn sent(content: impl Into<String>, external_id: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            role: MessageRole::Sent,
            content: content.into(),
            external_id,
            timestamp: at,
        }
    }

    pub fn received(
        content: impl Into<String>,
        external_id: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            role: MessageRole::Received,
            content: content.into(),
            external_id,
            timestamp: at,
        }
    }
}

/// The outbound/inbound exchange with one lead. Created with the first send.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailThread {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub subject: String,
    /// Message-ID of the first outbound message; replies reference it.
    pub thread_key: String,
    pub has_reply: bool,
    pub requires_human: bool,
    pub reply_sentiment: Option<Sentiment>,
    pub messages: Vec<ThreadMessage>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailThread {
    pub fn open(
        lead_id: Uuid,
        subject: impl Into<String>,
        thread_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            subject: subject.into(),
            thread_key: thread_key.into(),
            has_reply: false,
            requires_human: false,
            reply_sentiment: None,
            messages: Vec::new(),
            last_checked_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message. Inbound messages already present (same external id)
    /// are dropped. Returns whether the message was added.
    pub fn push(&mut self, message: ThreadMessage) -> bool {
        if let Some(ref ext) = message.external_id
            && self
                .messages
                .iter()
                .any(|m| m.external_id.as_deref() == Some(ext.as_str()))
        {
            return false;
        }
        if message.role == MessageRole::Received {
            self.has_reply = true;
        }
        self.updated_at = message.timestamp.max(self.updated_at);
        self.messages.push(message);
        true
    }

    pub fn contains_external(&self, external_id: &str) -> bool {
        self.messages
            .iter()
            .any(|m| m.external_id.as_deref() == Some(external_id))
    }

    pub fn first_sent(&self) -> Option<&ThreadMessage> {
        self.messages.iter().find(|m| m.role == MessageRole::Sent)
    }

    pub fn latest_received(&self) -> Option<&ThreadMessage> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Received)
    }

    pub fn received_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role == MessageRole::Received)
            .count()
    }

    /// A stored reply that has not been acted on yet: unlabelled, or
    /// labelled with a sentiment whose transition is still outstanding.
    /// Only meaningful while the lead is EMAILED_1; a neutral reply is settled.
    pub fn has_unsettled_reply(&self) -> bool {
        self.has_reply && self.reply_sentiment != Some(Sentiment::Neutral)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread() -> EmailThread {
        EmailThread::open(Uuid::new_v4(), "Hello", "<key@example.com>", Utc::now())
    }

    #[test]
    fn has_reply_tracks_received_messages() {
        let mut t = thread();
        t.push(ThreadMessage::sent("hi", Some("<a@x>".into()), Utc::now()));
        assert!(!t.has_reply);
        assert_eq!(t.received_count(), 0);

        t.push(ThreadMessage::received("thanks", Some("<b@x>".into()), Utc::now()));
        assert!(t.has_reply);
        assert_eq!(t.received_count(), 1);
    }

    #[test]
    fn duplicate_inbound_is_dropped() {
        let mut t = thread();
        assert!(t.push(ThreadMessage::received("one", Some("<r1@x>".into()), Utc::now())));
        assert!(!t.push(ThreadMessage::received("one", Some("<r1@x>".into()), Utc::now())));
        assert_eq!(t.messages.len(), 1);
        assert!(t.contains_external("<r1@x>"));
    }

    #[test]
    fn latest_received_is_last_inbound() {
        let mut t = thread();
        t.push(ThreadMessage::sent("pitch", None, Utc::now()));
        t.push(ThreadMessage::received("maybe", Some("<r1@x>".into()), Utc::now()));
        t.push(ThreadMessage::received("no thanks", Some("<r2@x>".into()), Utc::now()));
        assert_eq!(t.latest_received().unwrap().content, "no thanks");
        assert_eq!(t.first_sent().unwrap().content, "pitch");
    }

    #[test]
    fn unsettled_reply_until_neutral() {
        let mut t = thread();
        assert!(!t.has_unsettled_reply());

        t.push(ThreadMessage::received("no thanks", Some("<r1@x>".into()), Utc::now()));
        assert!(t.has_unsettled_reply());
        t.reply_sentiment = Some(Sentiment::Negative);
        assert!(t.has_unsettled_reply());
        t.reply_sentiment = Some(Sentiment::Neutral);
        assert!(!t.has_unsettled_reply());
    }

    #[test]
    fn sentiment_parse_is_case_insensitive() {
        assert_eq!("positive".parse::<Sentiment>().unwrap(), Sentiment::Positive);
        assert_eq!(" NEGATIVE ".parse::<Sentiment>().unwrap(), Sentiment::Negative);
        assert!("UNKNOWN".parse::<Sentiment>().is_err());
    }
}
