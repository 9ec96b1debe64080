//! Error types for the outreach engine.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Classification error: {0}")]
    Classify(#[from] ClassifyError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

impl Error {
    /// Whether retrying on a later tick can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Mail(e) => e.is_transient(),
            Self::Llm(e) => e.is_transient(),
            Self::Classify(e) => e.is_transient(),
            Self::Database(e) => e.is_conflict(),
            Self::Config(_) | Self::Job(_) => false,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// The row changed underneath an optimistic update.
    #[error("Concurrent update lost on {entity} {id} (expected version {expected})")]
    Conflict {
        entity: String,
        id: String,
        expected: i64,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Mail transport errors. All of them are retried on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("SMTP send to {to} failed: {reason}")]
    SendFailed { to: String, reason: String },

    #[error("IMAP fetch failed: {0}")]
    FetchFailed(String),

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Mail operation timed out after {0:?}")]
    Timeout(Duration),
}

impl MailError {
    /// A bad address will fail the same way on every retry.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidAddress { .. })
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Bad credentials fail the same way until someone fixes the config.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::AuthFailed { .. })
    }
}

/// Reply classification errors. Callers treat every one of these as
/// "no decision yet" and never guess a label.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Classifier returned unknown label: {0}")]
    UnknownLabel(String),

    #[error("Classifier output could not be parsed: {0}")]
    Unparseable(String),

    #[error("Classifier backend failed: {0}")]
    Backend(#[from] LlmError),

    #[error("Classification timed out after {0:?}")]
    Timeout(Duration),
}

impl ClassifyError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_transient(),
            _ => true,
        }
    }
}

/// Periodic job errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {kind} is already running")]
    AlreadyRunning { kind: String },

    #[error("Job run {id} failed: {reason}")]
    Failed { id: Uuid, reason: String },

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

/// Result type alias for the outreach engine.
pub type Result<T> = std::result::Result<T, Error>;
