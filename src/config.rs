//! Configuration types.
//!
//! Everything is read from the environment with defaults; nothing here is
//! mutated at runtime.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::channels::email::EmailConfig;
use crate::error::ConfigError;
use crate::llm::LlmConfig;

/// Sending budget.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum sends per calendar day.
    pub daily_limit: u32,
    /// Minimum spacing between two sends.
    pub min_interval: Duration,
    /// Zone whose midnight starts a new day.
    pub timezone: Tz,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            daily_limit: 50,
            min_interval: Duration::from_secs(120),
            timezone: Tz::UTC,
        }
    }
}

/// Periodic task cadence and per-run limits.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    pub dispatch_interval: Duration,
    pub reply_poll_interval: Duration,
    pub followup_interval: Duration,
    /// Silence after the first message before the follow-up goes out.
    pub followup_after: chrono::Duration,
    /// Candidates examined per run of each task.
    pub max_leads_per_run: usize,
    /// Upper bound on every mail, generation and classification call.
    pub collaborator_timeout: Duration,
    /// Random delay added before each scheduled run, up to this much.
    pub jitter: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_secs(180), // 3 minutes
            reply_poll_interval: Duration::from_secs(3600), // 1 hour
            followup_interval: Duration::from_secs(6 * 3600), // 6 hours
            followup_after: chrono::Duration::days(14),
            max_leads_per_run: 5,
            collaborator_timeout: Duration::from_secs(30),
            jitter: Duration::from_secs(5),
        }
    }
}

/// Who the outreach is from. Fed to content generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SenderProfile {
    pub name: Option<String>,
    /// Free text about the sending company used for personalization.
    pub company_context: Option<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct OutreachConfig {
    pub database_path: PathBuf,
    pub rate_limit: RateLimitConfig,
    pub schedule: ScheduleConfig,
    pub sender: SenderProfile,
    pub email: Option<EmailConfig>,
    pub llm: Option<LlmConfig>,
}

impl Default for OutreachConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/outreach.db"),
            rate_limit: RateLimitConfig::default(),
            schedule: ScheduleConfig::default(),
            sender: SenderProfile::default(),
            email: None,
            llm: None,
        }
    }
}

impl OutreachConfig {
    /// Build from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let rate_defaults = RateLimitConfig::default();
        let sched_defaults = ScheduleConfig::default();

        let daily_limit: u32 = parse_or(&get, "OUTREACH_DAILY_LIMIT", rate_defaults.daily_limit)?;
        if daily_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "OUTREACH_DAILY_LIMIT".into(),
                message: "must be at least 1".into(),
            });
        }

        let timezone = match get("OUTREACH_TIMEZONE") {
            Some(name) => name.parse::<Tz>().map_err(|e| ConfigError::InvalidValue {
                key: "OUTREACH_TIMEZONE".into(),
                message: e.to_string(),
            })?,
            None => rate_defaults.timezone,
        };

        let rate_limit = RateLimitConfig {
            daily_limit,
            min_interval: secs_or(
                &get,
                "OUTREACH_MIN_INTERVAL_SECS",
                rate_defaults.min_interval,
            )?,
            timezone,
        };

        let followup_days: i64 = parse_or(
            &get,
            "OUTREACH_FOLLOWUP_DAYS",
            sched_defaults.followup_after.num_days(),
        )?;
        if followup_days < 1 {
            return Err(ConfigError::InvalidValue {
                key: "OUTREACH_FOLLOWUP_DAYS".into(),
                message: "must be at least 1".into(),
            });
        }

        let schedule = ScheduleConfig {
            dispatch_interval: positive_secs(
                &get,
                "OUTREACH_DISPATCH_INTERVAL_SECS",
                sched_defaults.dispatch_interval,
            )?,
            reply_poll_interval: positive_secs(
                &get,
                "OUTREACH_REPLY_POLL_INTERVAL_SECS",
                sched_defaults.reply_poll_interval,
            )?,
            followup_interval: positive_secs(
                &get,
                "OUTREACH_FOLLOWUP_INTERVAL_SECS",
                sched_defaults.followup_interval,
            )?,
            followup_after: chrono::Duration::days(followup_days),
            max_leads_per_run: nonzero(
                "OUTREACH_MAX_LEADS_PER_RUN",
                parse_or(
                    &get,
                    "OUTREACH_MAX_LEADS_PER_RUN",
                    sched_defaults.max_leads_per_run,
                )?,
            )?,
            collaborator_timeout: positive_secs(
                &get,
                "OUTREACH_COLLABORATOR_TIMEOUT_SECS",
                sched_defaults.collaborator_timeout,
            )?,
            jitter: secs_or(&get, "OUTREACH_JITTER_SECS", sched_defaults.jitter)?,
        };

        let sender = SenderProfile {
            name: get("OUTREACH_SENDER_NAME").filter(|s| !s.trim().is_empty()),
            company_context: get("OUTREACH_COMPANY_CONTEXT").filter(|s| !s.trim().is_empty()),
        };

        Ok(Self {
            database_path: get("OUTREACH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            rate_limit,
            schedule,
            sender,
            email: EmailConfig::from_lookup(&get),
            llm: LlmConfig::from_lookup(&get),
        })
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn secs_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}

/// Like [`secs_or`], but zero is rejected.
fn positive_secs(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let secs = nonzero(key, parse_or(get, key, default.as_secs())?)?;
    Ok(Duration::from_secs(secs))
}

fn nonzero<T: PartialEq + Default>(key: &str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".into(),
        });
    }
    Ok(value)
}
