//! Reply sentiment classification.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::{ChatMessage, CompletionRequest, LlmProvider, extract_json_object};
use crate::error::ClassifyError;
use crate::leads::Sentiment;

/// Maximum reply length sent to the classifier.
const MAX_REPLY_CHARS: usize = 4000;

const SYSTEM_PROMPT: &str = "Analyze this email reply and classify the sender's intent:

- POSITIVE: Shows interest, asks questions, wants to learn more, requests a call/meeting
- NEGATIVE: Explicit rejection, not interested, asks to stop contacting, unsubscribe request
- NEUTRAL: Automatic replies, out of office, unclear intent, forwarding to someone else

Return a JSON object with 'sentiment' (POSITIVE, NEGATIVE, or NEUTRAL) and 'reasoning' (brief explanation).";

/// Labels an inbound reply.
#[async_trait]
pub trait ReplyClassifier: Send + Sync {
    async fn classify(&self, reply: &str) -> Result<Sentiment, ClassifyError>;
}

pub struct LlmReplyClassifier {
    llm: Arc<dyn LlmProvider>,
}

impl LlmReplyClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[derive(Deserialize)]
struct ClassificationJson {
    sentiment: Option<String>,
    #[serde(default)]
    reasoning: String,
}

/// Parse classifier output. A missing or unknown label is an error rather
/// than a silent NEUTRAL.
pub fn parse_classification(raw: &str) -> Result<(Sentiment, String), ClassifyError> {
    let parsed: ClassificationJson = serde_json::from_str(extract_json_object(raw))
        .map_err(|e| ClassifyError::Unparseable(e.to_string()))?;
    let label = parsed
        .sentiment
        .ok_or_else(|| ClassifyError::Unparseable("missing 'sentiment' field".to_string()))?;
    let sentiment = label
        .parse::<Sentiment>()
        .map_err(|_| ClassifyError::UnknownLabel(label))?;
    Ok((sentiment, parsed.reasoning))
}

#[async_trait]
impl ReplyClassifier for LlmReplyClassifier {
    async fn classify(&self, reply: &str) -> Result<Sentiment, ClassifyError> {
        let reply: String = reply.chars().take(MAX_REPLY_CHARS).collect();
        let request = CompletionRequest::new(vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!("Classify this reply:\n\n{reply}")),
        ])
        .with_temperature(0.1)
        .json();

        let response = self.llm.complete(request).await?;
        let (sentiment, reasoning) = parse_classification(&response.content)?;
        info!(sentiment = %sentiment, "Classified reply: {reasoning}");
        Ok(sentiment)
    }
}
