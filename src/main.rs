use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use lead_outreach::channels::SmtpImapTransport;
use lead_outreach::clock::{Clock, SystemClock};
use lead_outreach::config::OutreachConfig;
use lead_outreach::jobs::{Collaborators, JobOrchestrator};
use lead_outreach::llm::{LlmContentGenerator, LlmReplyClassifier, create_provider};
use lead_outreach::ratelimit::RateLimiter;
use lead_outreach::store::{Database, LibSqlBackend};

/// Console output always; a daily-rolling file too when `OUTREACH_LOG_DIR` is set.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("OUTREACH_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "outreach.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let config = OutreachConfig::from_env().context("Invalid configuration")?;
    let email = config
        .email
        .clone()
        .context("EMAIL_IMAP_HOST is not set; a mailbox is required")?;
    let llm_config = config
        .llm
        .clone()
        .context("LLM_API_KEY (or OPENAI_API_KEY) is not set")?;

    info!(
        "Lead outreach v{} (db: {}, daily limit: {}, timezone: {})",
        env!("CARGO_PKG_VERSION"),
        config.database_path.display(),
        config.rate_limit.daily_limit,
        config.rate_limit.timezone,
    );

    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.database_path)
            .await
            .with_context(|| {
                format!("Failed to open database at {}", config.database_path.display())
            })?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), Arc::clone(&clock)));

    let llm = create_provider(&llm_config)?;
    let collaborators = Collaborators {
        mail: Arc::new(SmtpImapTransport::new(
            email,
            config.schedule.collaborator_timeout,
        )),
        generator: Arc::new(LlmContentGenerator::new(
            Arc::clone(&llm),
            config.sender.clone(),
        )),
        classifier: Arc::new(LlmReplyClassifier::new(llm)),
    };

    let orchestrator = Arc::new(JobOrchestrator::new(
        store,
        clock,
        limiter,
        collaborators,
        config.schedule.clone(),
    ));
    orchestrator.recover().await?;

    match orchestrator.tracker().stats().await {
        Ok(stats) => info!(
            campaigns = stats.total_campaigns,
            leads = stats.total_leads,
            awaiting_reply = stats.awaiting_reply,
            requires_human = stats.requires_human,
            unresolved_sends = stats.unresolved_sends,
            "Outreach status"
        ),
        Err(e) => warn!("Could not compute outreach stats: {e}"),
    }

    let tickers = orchestrator.spawn_tickers();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    orchestrator.shutdown();
    futures::future::join_all(tickers).await;

    info!("Stopped");
    Ok(())
}
