//! Sends first messages to enriched leads, oldest enrichment first.

use super::orchestrator::JobOrchestrator;
use super::{JobKind, RunReport};
use crate::error::Error;
use crate::leads::{LeadEvent, LeadState};

pub(super) async fn run(orch: &JobOrchestrator) -> Result<RunReport, Error> {
    let candidates = orch
        .store()
        .list_leads_in_state(LeadState::Enriched, orch.schedule().max_leads_per_run)
        .await?;
    let mut report = RunReport::default();

    // Rate-limit denial is per lead, so a day rollover mid-run lets later
    // leads through.
    for candidate in candidates {
        if orch.is_shutting_down() {
            break;
        }
        report.candidates += 1;

        let outcome = orch
            .with_lead(candidate.id, &[LeadState::Enriched], |lead| async move {
                let thread = orch.store().get_thread_for_lead(lead.id).await?;
                orch.execute(lead, LeadEvent::DispatchApproved, thread).await
            })
            .await;

        orch.log_outcome(JobKind::Dispatch, candidate.id, &outcome);
        report.record(&outcome);
    }

    Ok(report)
}
