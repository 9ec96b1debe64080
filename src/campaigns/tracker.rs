//! Campaign counters, status derivation and the outreach read model.
//!
//! Counters move incrementally: the per-transition delta from
//! [`CampaignTracker::delta_for`] is written in the same transaction as the
//! lead change, so a crash cannot leave them out of step. `reconcile`
//! recomputes them from lead rows when an operator wants a fresh count.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::campaigns::model::{Campaign, CampaignCounters, CampaignStatus};
use crate::clock::Clock;
use crate::error::DatabaseError;
use crate::leads::{Lead, LeadState, NewLead, OutboundKind, Transition};
use crate::store::{CounterDelta, Database};

/// Dashboard numbers across all campaigns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutreachStats {
    pub total_campaigns: u32,
    pub total_leads: u32,
    /// Leads that received at least one message.
    pub leads_contacted: u32,
    /// Threads with at least one inbound message.
    pub replies_received: u32,
    pub interested: u32,
    pub not_interested: u32,
    pub closed: u32,
    /// EMAILED_1 plus EMAILED_2.
    pub awaiting_reply: u32,
    /// EMAILED_2 leads. They have no further automatic step.
    pub awaiting_after_followup: u32,
    pub requires_human: u32,
    /// Sends whose outcome is unknown and need an operator.
    pub unresolved_sends: u32,
    pub by_state: BTreeMap<String, u32>,
}

pub struct CampaignTracker {
    store: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
}

impl CampaignTracker {
    pub fn new(store: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Counter change implied by a committed transition.
    pub fn delta_for(transition: &Transition) -> CounterDelta {
        let mut delta = CounterDelta::default();
        if transition.to == LeadState::Enriched {
            delta.enriched = 1;
        }
        if transition.send() == Some(OutboundKind::First) {
            delta.emailed = 1;
        }
        delta
    }

    /// Status implied by member lead states. FAILED is sticky.
    pub fn derive_status(
        current: CampaignStatus,
        counts: &HashMap<LeadState, u32>,
    ) -> CampaignStatus {
        if current == CampaignStatus::Failed {
            return current;
        }
        let total: u32 = counts.values().sum();
        if total == 0 {
            return current;
        }
        let of = |pred: fn(&LeadState) -> bool| -> u32 {
            counts
                .iter()
                .filter(|(state, _)| pred(*state))
                .map(|(_, n)| *n)
                .sum()
        };

        if of(LeadState::is_terminal) == total {
            CampaignStatus::Completed
        } else if of(LeadState::is_contacted) > 0 {
            CampaignStatus::Active
        } else if counts.get(&LeadState::Enriched).copied().unwrap_or(0) > 0 {
            CampaignStatus::Enriching
        } else {
            CampaignStatus::Collecting
        }
    }

    // ── Intake ──────────────────────────────────────────────────────

    pub async fn create_campaign(&self, keywords: &str) -> Result<Campaign, DatabaseError> {
        let campaign = Campaign::new(keywords.trim(), self.clock.now());
        self.store.insert_campaign(&campaign).await?;
        info!(campaign_id = %campaign.id, keywords = %campaign.keywords, "Campaign created");
        Ok(campaign)
    }

    /// Persist a sourcing batch as COLLECTED leads.
    pub async fn import_leads(
        &self,
        campaign_id: Uuid,
        batch: Vec<NewLead>,
    ) -> Result<Vec<Lead>, DatabaseError> {
        let campaign =
            self.store
                .get_campaign(campaign_id)
                .await?
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "campaign".into(),
                    id: campaign_id.to_string(),
                })?;
        if campaign.status == CampaignStatus::Failed {
            return Err(DatabaseError::Constraint(format!(
                "campaign {campaign_id} has failed; not importing leads"
            )));
        }

        let now = self.clock.now();
        let leads: Vec<Lead> = batch
            .into_iter()
            .map(|new| Lead::collected(campaign_id, new.contact, now))
            .collect();
        let valid = leads.iter().filter(|l| l.contact.is_valid()).count();
        let delta = CounterDelta {
            found: leads.len() as i64,
            valid: valid as i64,
            ..Default::default()
        };

        self.store.insert_leads(&leads, delta).await?;
        self.refresh_status(campaign_id).await?;

        info!(
            campaign_id = %campaign_id,
            found = leads.len(),
            valid,
            "Leads imported"
        );
        Ok(leads)
    }

    /// The sourcing collaborator gave up on this campaign.
    pub async fn fail_campaign(&self, campaign_id: Uuid, reason: &str) -> Result<(), DatabaseError> {
        self.store
            .update_campaign_status(
                campaign_id,
                CampaignStatus::Failed,
                Some(reason),
                self.clock.now(),
            )
            .await?;
        warn!(campaign_id = %campaign_id, reason, "Campaign failed");
        Ok(())
    }

    // ── Derived state ───────────────────────────────────────────────

    /// Recompute and store the campaign status from its leads.
    pub async fn refresh_status(&self, campaign_id: Uuid) -> Result<CampaignStatus, DatabaseError> {
        let Some(campaign) = self.store.get_campaign(campaign_id).await? else {
            return Err(DatabaseError::NotFound {
                entity: "campaign".into(),
                id: campaign_id.to_string(),
            });
        };
        let counts = self.store.count_leads_by_state(Some(campaign_id)).await?;
        let next = Self::derive_status(campaign.status, &counts);
        if next != campaign.status {
            self.store
                .update_campaign_status(campaign_id, next, None, self.clock.now())
                .await?;
            info!(
                campaign_id = %campaign_id,
                from = %campaign.status,
                to = %next,
                "Campaign status changed"
            );
        }
        Ok(next)
    }

    /// Rebuild counters from lead rows, replacing the incremental values.
    pub async fn reconcile(&self, campaign_id: Uuid) -> Result<CampaignCounters, DatabaseError> {
        let stored = self
            .store
            .get_campaign(campaign_id)
            .await?
            .map(|c| c.counters)
            .unwrap_or_default();
        let actual = self.store.recount_campaign(campaign_id).await?;
        if stored != actual {
            warn!(
                campaign_id = %campaign_id,
                stored = ?stored,
                actual = ?actual,
                "Campaign counters drifted, rewriting"
            );
            self.store.set_campaign_counters(campaign_id, actual).await?;
        } else {
            debug!(campaign_id = %campaign_id, "Campaign counters consistent");
        }
        self.refresh_status(campaign_id).await?;
        Ok(actual)
    }

    pub async fn stats(&self) -> Result<OutreachStats, DatabaseError> {
        let counts = self.store.count_leads_by_state(None).await?;
        let threads = self.store.thread_totals().await?;
        let unresolved = self.store.list_unresolved_outbound().await?;
        let get = |state: LeadState| counts.get(&state).copied().unwrap_or(0);

        Ok(OutreachStats {
            total_campaigns: self.store.count_campaigns().await?,
            total_leads: counts.values().sum(),
            leads_contacted: counts
                .iter()
                .filter(|(s, _)| s.is_contacted())
                .map(|(_, n)| *n)
                .sum(),
            replies_received: threads.with_reply,
            interested: get(LeadState::Interested),
            not_interested: get(LeadState::NotInterested),
            closed: get(LeadState::Closed),
            awaiting_reply: get(LeadState::Emailed1) + get(LeadState::Emailed2),
            awaiting_after_followup: get(LeadState::Emailed2),
            requires_human: threads.requires_human,
            unresolved_sends: unresolved.len() as u32,
            by_state: LeadState::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), get(*s)))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::leads::{ContactInfo, LeadEvent, SideEffect};
    use crate::store::{LeadCommit, LibSqlBackend};
    use chrono::{TimeZone, Utc};

    fn counts(pairs: &[(LeadState, u32)]) -> HashMap<LeadState, u32> {
        pairs.iter().copied().collect()
    }

    async fn tracker() -> (CampaignTracker, Arc<dyn Database>) {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
        (
            CampaignTracker::new(Arc::clone(&store), Arc::new(clock)),
            store,
        )
    }

    fn new_lead(email: &str, profile: Option<&str>) -> NewLead {
        NewLead {
            contact: ContactInfo {
                first_name: "Lin".into(),
                email: email.into(),
                profile_url: profile.map(String::from),
                ..Default::default()
            },
        }
    }

    #[test]
    fn status_derivation() {
        use CampaignStatus::*;
        use LeadState::*;

        assert_eq!(CampaignTracker::derive_status(Pending, &counts(&[])), Pending);
        assert_eq!(
            CampaignTracker::derive_status(Pending, &counts(&[(Collected, 3)])),
            Collecting
        );
        assert_eq!(
            CampaignTracker::derive_status(Collecting, &counts(&[(Collected, 1), (Enriched, 2)])),
            Enriching
        );
        assert_eq!(
            CampaignTracker::derive_status(Enriching, &counts(&[(Enriched, 2), (Emailed1, 1)])),
            Active
        );
        assert_eq!(
            CampaignTracker::derive_status(
                Active,
                &counts(&[(Interested, 1), (NotInterested, 1), (Closed, 4)])
            ),
            Completed
        );
        assert_eq!(
            CampaignTracker::derive_status(Failed, &counts(&[(Emailed1, 1)])),
            Failed
        );
    }

    #[test]
    fn deltas_follow_transitions() {
        let enrich = Transition {
            from: LeadState::Collected,
            to: LeadState::Enriched,
            event: LeadEvent::EnrichmentCompleted,
            effects: vec![],
        };
        assert_eq!(CampaignTracker::delta_for(&enrich).enriched, 1);

        let first = Transition {
            from: LeadState::Enriched,
            to: LeadState::Emailed1,
            event: LeadEvent::DispatchApproved,
            effects: vec![SideEffect::Send(OutboundKind::First)],
        };
        assert_eq!(
            CampaignTracker::delta_for(&first),
            CounterDelta {
                emailed: 1,
                ..Default::default()
            }
        );

        let followup = Transition {
            from: LeadState::Emailed1,
            to: LeadState::Emailed2,
            event: LeadEvent::NoReplyTimeout,
            effects: vec![SideEffect::Send(OutboundKind::NoReplyFollowup)],
        };
        assert!(CampaignTracker::delta_for(&followup).is_zero());
    }

    #[tokio::test]
    async fn import_counts_found_and_valid() {
        let (tracker, store) = tracker().await;
        let campaign = tracker.create_campaign("  head of data  ").await.unwrap();
        assert_eq!(campaign.keywords, "head of data");

        let leads = tracker
            .import_leads(
                campaign.id,
                vec![
                    new_lead("a@x.io", Some("https://linkedin.com/in/a")),
                    new_lead("b@x.io", None),
                    new_lead("c@x.io", Some("https://linkedin.com/in/c")),
                ],
            )
            .await
            .unwrap();
        assert_eq!(leads.len(), 3);
        assert!(leads.iter().all(|l| l.state == LeadState::Collected));

        let stored = store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.counters.leads_found, 3);
        assert_eq!(stored.counters.leads_valid, 2);
        assert_eq!(stored.status, CampaignStatus::Collecting);
    }

    #[tokio::test]
    async fn failed_campaign_rejects_import() {
        let (tracker, _) = tracker().await;
        let campaign = tracker.create_campaign("founders").await.unwrap();
        tracker.fail_campaign(campaign.id, "sourcing quota").await.unwrap();
        let err = tracker
            .import_leads(campaign.id, vec![new_lead("a@x.io", None)])
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn reconcile_repairs_drift() {
        let (tracker, store) = tracker().await;
        let campaign = tracker.create_campaign("vp sales").await.unwrap();
        tracker
            .import_leads(campaign.id, vec![new_lead("a@x.io", Some("p"))])
            .await
            .unwrap();

        store
            .set_campaign_counters(
                campaign.id,
                CampaignCounters {
                    leads_found: 9,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let fixed = tracker.reconcile(campaign.id).await.unwrap();
        assert_eq!(fixed.leads_found, 1);
        assert_eq!(fixed.leads_valid, 1);
        let stored = store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.counters, fixed);
    }

    #[tokio::test]
    async fn stats_break_down_by_state() {
        let (tracker, store) = tracker().await;
        let campaign = tracker.create_campaign("cto").await.unwrap();
        let leads = tracker
            .import_leads(
                campaign.id,
                vec![new_lead("a@x.io", Some("p")), new_lead("b@x.io", Some("p"))],
            )
            .await
            .unwrap();

        let mut emailed = leads[0].clone();
        emailed.state = LeadState::Emailed1;
        store
            .commit_lead(&LeadCommit {
                lead: emailed,
                thread: None,
                outbound_id: None,
                counters: CounterDelta::default(),
            })
            .await
            .unwrap();

        let stats = tracker.stats().await.unwrap();
        assert_eq!(stats.total_campaigns, 1);
        assert_eq!(stats.total_leads, 2);
        assert_eq!(stats.leads_contacted, 1);
        assert_eq!(stats.awaiting_reply, 1);
        assert_eq!(stats.by_state["COLLECTED"], 1);
        assert_eq!(stats.by_state["EMAILED_1"], 1);
        assert_eq!(stats.by_state["CLOSED"], 0);
        assert_eq!(stats.unresolved_sends, 0);
    }
}
