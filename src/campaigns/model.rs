//! Campaign records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Campaign status. Authoritative only for PENDING and FAILED; the rest are
/// derived from member lead states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Pending,
    Collecting,
    Enriching,
    Active,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Collecting => "COLLECTING",
            Self::Enriching => "ENRICHING",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "COLLECTING" => Ok(Self::Collecting),
            "ENRICHING" => Ok(Self::Enriching),
            "ACTIVE" => Ok(Self::Active),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown campaign status: {other}")),
        }
    }
}

/// Funnel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignCounters {
    pub leads_found: u32,
    /// Leads with both an address and a profile.
    pub leads_valid: u32,
    pub leads_enriched: u32,
    pub leads_emailed: u32,
}

/// A batch of leads from one search or upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Campaign {
    pub id: Uuid,
    pub keywords: String,
    pub status: CampaignStatus,
    pub counters: CampaignCounters,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn new(keywords: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            keywords: keywords.into(),
            status: CampaignStatus::Pending,
            counters: CampaignCounters::default(),
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}
