//! Leads, their conversation threads, and the lifecycle state machine.

pub mod model;
pub mod state;
pub mod thread;

pub use model::{ContactInfo, EnrichmentData, Lead, LeadState, MAX_EMAILS_PER_LEAD, NewLead};
pub use state::{Decision, LeadEvent, OutboundKind, SideEffect, Transition, apply, transition};
pub use thread::{EmailThread, MessageRole, Sentiment, ThreadMessage};
