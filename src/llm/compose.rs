//! Outbound message composition.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, info};

use super::{ChatMessage, CompletionRequest, LlmProvider, extract_json_object};
use crate::config::SenderProfile;
use crate::error::LlmError;
use crate::leads::{EmailThread, Lead, OutboundKind};

const DEFAULT_SUBJECT: &str = "Quick question";
const MAX_POSTS: usize = 2;
const MAX_POST_CHARS: usize = 500;
const MAX_ORIGINAL_CHARS: usize = 300;

/// Subject and body of a message about to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedEmail {
    pub subject: String,
    pub body: String,
}

/// Writes outbound messages for a lead.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(
        &self,
        lead: &Lead,
        kind: OutboundKind,
        thread: Option<&EmailThread>,
    ) -> Result<GeneratedEmail, LlmError>;
}

const FIRST_VARIANTS: [&str; 3] = [
    "Write a brief, personalized cold email. Focus on:
- A specific pain point relevant to their role/industry
- A clear, concise value proposition
- A soft call to action (question, not meeting request)
Keep it under 100 words. Be conversational, not salesy.",
    "Write a short, curiosity-driven cold email. Focus on:
- Lead with an insight or observation about their industry
- Reference something specific about them or their company
- End with an intriguing question
Keep it under 100 words. Sound like a peer, not a vendor.",
    "Write a concise problem-aware cold email. Focus on:
- Acknowledge a common challenge in their role
- Share a brief relevant insight or approach
- Offer to share more if relevant
Keep it under 100 words. Be helpful, not pushy.",
];

const NO_REPLY_PROMPT: &str = "Write a brief follow-up email (no reply after 14 days).
Reference the original email briefly. Different angle. Max 75 words.
Be respectful of their time. Soft close only.";

const REFUSAL_PROMPT: &str = "Write a very brief, polite follow-up asking why it's not a fit.
Be respectful of their decision. Max 50 words. This is the final message.";

#[derive(Deserialize)]
struct EmailJson {
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
}

/// LLM-backed generator. First messages rotate between three prompt styles.
pub struct LlmContentGenerator {
    llm: Arc<dyn LlmProvider>,
    sender: SenderProfile,
}

impl LlmContentGenerator {
    pub fn new(llm: Arc<dyn LlmProvider>, sender: SenderProfile) -> Self {
        Self { llm, sender }
    }

    fn sender_context(&self) -> String {
        let mut out = String::new();
        if let Some(ref name) = self.sender.name {
            out.push_str(&format!("\n\nYou are writing as {name}."));
        }
        if let Some(ref context) = self.sender.company_context {
            out.push_str(&format!("\n\nAbout the sender's company:\n{context}"));
        }
        out
    }
}

fn or_unknown(value: Option<&str>) -> &str {
    value.filter(|v| !v.trim().is_empty()).unwrap_or("Unknown")
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn lead_context(lead: &Lead) -> String {
    let c = &lead.contact;
    let mut out = format!(
        "Lead Information:\n- Name: {}\n- Job Title: {}\n- Company: {}\n- Industry: {}",
        c.full_name(),
        or_unknown(c.job_title.as_deref()),
        or_unknown(c.company_name.as_deref()),
        or_unknown(c.industry.as_deref()),
    );

    let Some(ref enrichment) = lead.enrichment else {
        return out;
    };
    if let Some(ref headline) = enrichment.headline {
        out.push_str(&format!("\n- Headline: {headline}"));
    }
    if let Some(ref description) = enrichment.company_description {
        out.push_str(&format!("\n- About the company: {description}"));
    }
    if let Some(ref angle) = enrichment.personalization_angle {
        out.push_str(&format!("\n- Suggested angle: {angle}"));
    }

    let posts: Vec<String> = enrichment
        .recent_posts
        .iter()
        .filter(|p| !p.trim().is_empty())
        .take(MAX_POSTS)
        .enumerate()
        .map(|(i, p)| format!("Post {}: {}", i + 1, truncate(p, MAX_POST_CHARS)))
        .collect();
    if !posts.is_empty() {
        out.push_str("\n\nRecent activity (use for personalization):\n");
        out.push_str(&posts.join("\n"));
    }
    out
}

fn first_prompt(lead: &Lead, variant: usize, sender: &str) -> String {
    format!(
        "You are an expert cold email writer. {}\n\n{}{}\n\n\
         Return a JSON object with 'subject' (compelling, under 50 chars) and 'body' (the email content).\n\
         Do not include [Your Name] or similar placeholders - end naturally.",
        FIRST_VARIANTS[variant % FIRST_VARIANTS.len()],
        lead_context(lead),
        sender,
    )
}

fn followup_prompt(lead: &Lead, kind: OutboundKind, thread: Option<&EmailThread>) -> String {
    let instructions = match kind {
        OutboundKind::RefusalFollowup => REFUSAL_PROMPT,
        _ => NO_REPLY_PROMPT,
    };
    let original = thread
        .and_then(|t| t.first_sent())
        .map(|m| truncate(&m.content, MAX_ORIGINAL_CHARS))
        .unwrap_or_default();
    let company = lead
        .contact
        .company_name
        .as_deref()
        .unwrap_or("their company");

    format!(
        "{instructions}\n\nLead: {} at {company}\n\nOriginal email context:\n{original}...\n\n\
         Return JSON with 'subject' and 'body'.",
        lead.contact.full_name(),
    )
}

/// Follow-ups always stay on the original thread subject.
fn reply_subject(original: &str) -> String {
    let trimmed = original.trim();
    if trimmed.to_ascii_lowercase().starts_with("re:") {
        trimmed.to_string()
    } else {
        format!("Re: {trimmed}")
    }
}

fn parse_email(
    raw: &str,
    kind: OutboundKind,
    thread: Option<&EmailThread>,
) -> Result<GeneratedEmail, LlmError> {
    let parsed: EmailJson = serde_json::from_str(extract_json_object(raw))?;
    let body = parsed.body.trim().to_string();
    if body.is_empty() {
        return Err(LlmError::InvalidResponse {
            provider: "compose".to_string(),
            reason: "generated email has an empty body".to_string(),
        });
    }

    let subject = match (kind, thread) {
        (OutboundKind::First, _) | (_, None) => {
            let s = parsed.subject.trim();
            if s.is_empty() {
                DEFAULT_SUBJECT.to_string()
            } else {
                s.to_string()
            }
        }
        (_, Some(thread)) => reply_subject(&thread.subject),
    };

    Ok(GeneratedEmail { subject, body })
}

#[async_trait]
impl ContentGenerator for LlmContentGenerator {
    async fn generate(
        &self,
        lead: &Lead,
        kind: OutboundKind,
        thread: Option<&EmailThread>,
    ) -> Result<GeneratedEmail, LlmError> {
        let (system, user, temperature) = match kind {
            OutboundKind::First => {
                let variant = rand::thread_rng().gen_range(0..FIRST_VARIANTS.len());
                debug!(lead_id = %lead.id, variant, "Composing first message");
                (
                    first_prompt(lead, variant, &self.sender_context()),
                    "Generate the personalized outreach email.",
                    0.7,
                )
            }
            _ => (
                followup_prompt(lead, kind, thread),
                "Generate the follow-up email.",
                0.6,
            ),
        };

        let request = CompletionRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(user),
        ])
        .with_temperature(temperature)
        .json();

        let response = self.llm.complete(request).await?;
        let email = parse_email(&response.content, kind, thread)?;
        info!(lead_id = %lead.id, kind = %kind, "Generated {} message", kind);
        Ok(email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leads::{ContactInfo, EnrichmentData, ThreadMessage};
    use chrono::Utc;
    use uuid::Uuid;

    fn lead() -> Lead {
        let contact = ContactInfo {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@example.com".into(),
            job_title: Some("CTO".into()),
            company_name: Some("Analytical".into()),
            ..Default::default()
        };
        let mut lead = Lead::collected(Uuid::new_v4(), contact, Utc::now());
        lead.enrichment = Some(EnrichmentData {
            recent_posts: vec!["a".repeat(800), "second".into(), "third".into()],
            headline: Some("Engines".into()),
            ..Default::default()
        });
        lead
    }

    fn thread(subject: &str) -> EmailThread {
        let mut t = EmailThread::open(Uuid::new_v4(), subject, "<k@x>", Utc::now());
        t.push(ThreadMessage::sent("Hello Ada, original pitch", None, Utc::now()));
        t
    }

    #[test]
    fn first_prompt_includes_lead_and_caps_posts() {
        let prompt = first_prompt(&lead(), 4, "\n\nYou are writing as Sam.");
        assert!(prompt.contains(FIRST_VARIANTS[1]));
        assert!(prompt.contains("Ada Lovelace"));
        assert!(prompt.contains("Job Title: CTO"));
        assert!(prompt.contains("Industry: Unknown"));
        assert!(prompt.contains("Post 2: second"));
        assert!(!prompt.contains("third"));
        assert!(!prompt.contains(&"a".repeat(501)));
        assert!(prompt.contains("Sam"));
    }

    #[test]
    fn followup_prompt_matches_kind() {
        let t = thread("Hello");
        let refusal = followup_prompt(&lead(), OutboundKind::RefusalFollowup, Some(&t));
        assert!(refusal.contains("Max 50 words"));
        assert!(refusal.contains("original pitch"));

        let no_reply = followup_prompt(&lead(), OutboundKind::NoReplyFollowup, Some(&t));
        assert!(no_reply.contains("Max 75 words"));
    }

    #[test]
    fn first_email_defaults_subject() {
        let email = parse_email(r#"{"body": "Hi Ada"}"#, OutboundKind::First, None).unwrap();
        assert_eq!(email.subject, DEFAULT_SUBJECT);
        assert_eq!(email.body, "Hi Ada");
    }

    #[test]
    fn followup_keeps_thread_subject() {
        let t = thread("Engines at scale");
        let raw = "```json\n{\"subject\": \"Something else\", \"body\": \"Circling back\"}\n```";
        let email = parse_email(raw, OutboundKind::NoReplyFollowup, Some(&t)).unwrap();
        assert_eq!(email.subject, "Re: Engines at scale");

        let t = thread("RE: Engines");
        let email = parse_email(raw, OutboundKind::RefusalFollowup, Some(&t)).unwrap();
        assert_eq!(email.subject, "RE: Engines");
    }

    #[test]
    fn empty_body_is_rejected() {
        let err = parse_email(r#"{"subject": "x", "body": "  "}"#, OutboundKind::First, None)
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }
}
