//! Campaigns: lead batches, their funnel counters and derived status.

pub mod model;
pub mod tracker;

pub use model::{Campaign, CampaignCounters, CampaignStatus};
pub use tracker::{CampaignTracker, OutreachStats};
