//! Lead outreach engine.
//!
//! Leads move through a fixed lifecycle (collected, enriched, emailed,
//! replied or followed up, closed) driven by three periodic jobs that send
//! mail under a global rate limit and watch threads for replies.

pub mod campaigns;
pub mod channels;
pub mod clock;
pub mod config;
pub mod error;
pub mod jobs;
pub mod leads;
pub mod llm;
pub mod ratelimit;
pub mod store;
