//! Mail transport abstraction.
//!
//! The orchestrator only sees [`MailTransport`]; the SMTP/IMAP
//! implementation lives in [`email`].

pub mod email;

pub use email::{EmailConfig, SmtpImapTransport};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MailError;
use crate::leads::EmailThread;

/// A message to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Message-ID this mail answers, for follow-ups on an existing thread.
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

impl OutgoingMail {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            in_reply_to: None,
            references: Vec::new(),
        }
    }

    /// Thread this mail under an earlier message.
    pub fn replying_to(mut self, message_id: impl Into<String>) -> Self {
        let id = message_id.into();
        self.references.push(id.clone());
        self.in_reply_to = Some(id);
        self
    }
}

/// Receipt for an accepted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub message_id: String,
}

/// A reply found on a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMail {
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// Sends outreach mail and finds replies to it.
#[async_trait]
pub trait MailTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, mail: &OutgoingMail) -> Result<SentMail, MailError>;

    /// Inbound messages belonging to `thread`, sent by anyone but us.
    /// May include messages already recorded on the thread.
    async fn fetch_replies(
        &self,
        thread: &EmailThread,
        counterpart: &str,
    ) -> Result<Vec<InboundMail>, MailError>;
}

/// Message-IDs compare without their angle brackets.
pub fn normalize_message_id(id: &str) -> String {
    id.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}
