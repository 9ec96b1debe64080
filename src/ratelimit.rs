//! Global sending budget.
//!
//! One limiter is shared by every task that sends mail. `try_acquire` is a
//! single check-and-record step under a lock, so two concurrent callers can
//! never both take the last permit of the day or both pass the spacing check.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::RateLimitConfig;

/// Snapshot of the limiter for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub daily_limit: u32,
    pub sent_today: u32,
    pub remaining_today: u32,
    pub last_sent_at: Option<DateTime<Utc>>,
    /// Earliest instant at which `try_acquire` could succeed.
    pub next_allowed_at: DateTime<Utc>,
}

/// One granted send, tied to the local day it was counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct SendPermit {
    day: NaiveDate,
}

#[derive(Debug)]
struct Window {
    day: NaiveDate,
    sent: u32,
    last_sent_at: Option<DateTime<Utc>>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let day = local_day(&config, clock.now());
        Self {
            config,
            clock,
            window: Mutex::new(Window {
                day,
                sent: 0,
                last_sent_at: None,
            }),
        }
    }

    /// Take one send permit if both the daily budget and the spacing allow it.
    pub fn try_acquire(&self) -> Option<SendPermit> {
        self.try_acquire_at(self.clock.now())
    }

    pub fn try_acquire_at(&self, now: DateTime<Utc>) -> Option<SendPermit> {
        let mut window = self.lock();
        self.roll(&mut window, now);

        if window.sent >= self.config.daily_limit {
            debug!(sent = window.sent, limit = self.config.daily_limit, "Daily send limit reached");
            return None;
        }
        if let Some(last) = window.last_sent_at
            && now < last + self.min_interval()
        {
            debug!(last_sent_at = %last, "Send spacing not yet elapsed");
            return None;
        }

        window.sent += 1;
        window.last_sent_at = Some(now);
        Some(SendPermit { day: window.day })
    }

    /// Give back a permit whose send never happened. Spacing is kept. A
    /// permit from a day that has since rolled over is dropped.
    pub fn refund(&self, permit: SendPermit) {
        let now = self.clock.now();
        let mut window = self.lock();
        self.roll(&mut window, now);
        if window.day != permit.day {
            debug!(permit_day = %permit.day, today = %window.day, "Stale refund ignored");
            return;
        }
        window.sent = window.sent.saturating_sub(1);
    }

    /// Seed from persisted history after a restart.
    pub fn restore(&self, sent_today: u32, last_sent_at: Option<DateTime<Utc>>) {
        let now = self.clock.now();
        let mut window = self.lock();
        window.day = local_day(&self.config, now);
        window.sent = sent_today;
        window.last_sent_at = last_sent_at;
        info!(
            sent_today,
            last_sent_at = ?last_sent_at,
            "Rate limiter restored"
        );
    }

    /// UTC instant at which the current local day began.
    pub fn day_start(&self) -> DateTime<Utc> {
        day_start_utc(&self.config, self.clock.now())
    }

    pub fn status(&self) -> RateLimitStatus {
        let now = self.clock.now();
        let mut window = self.lock();
        self.roll(&mut window, now);

        let spacing_ready = window
            .last_sent_at
            .map(|last| last + self.min_interval())
            .unwrap_or(now)
            .max(now);
        let next_allowed_at = if window.sent >= self.config.daily_limit {
            next_day_start_utc(&self.config, now).max(spacing_ready)
        } else {
            spacing_ready
        };

        RateLimitStatus {
            daily_limit: self.config.daily_limit,
            sent_today: window.sent,
            remaining_today: self.config.daily_limit.saturating_sub(window.sent),
            last_sent_at: window.last_sent_at,
            next_allowed_at,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        // Poisoning only happens if a holder panicked; the counters are still usable.
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn roll(&self, window: &mut Window, now: DateTime<Utc>) {
        let today = local_day(&self.config, now);
        if today != window.day {
            debug!(from = %window.day, to = %today, "Send window rolled over");
            window.day = today;
            window.sent = 0;
        }
    }

    fn min_interval(&self) -> Duration {
        Duration::from_std(self.config.min_interval).unwrap_or(Duration::zero())
    }
}

fn local_day(config: &RateLimitConfig, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&config.timezone).date_naive()
}

fn midnight_utc(config: &RateLimitConfig, day: NaiveDate) -> DateTime<Utc> {
    let midnight = day.and_hms_opt(0, 0, 0).unwrap_or_default();
    // Some zones skip midnight on DST change; the first valid hour starts the day.
    (0..3)
        .find_map(|h| {
            config
                .timezone
                .from_local_datetime(&(midnight + Duration::hours(h)))
                .earliest()
        })
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| midnight.and_utc())
}

fn day_start_utc(config: &RateLimitConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    midnight_utc(config, local_day(config, now))
}

fn next_day_start_utc(config: &RateLimitConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = local_day(config, now);
    midnight_utc(config, today.succ_opt().unwrap_or(today))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn limiter(daily_limit: u32, secs: u64, tz: chrono_tz::Tz) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
        let config = RateLimitConfig {
            daily_limit,
            min_interval: std::time::Duration::from_secs(secs),
            timezone: tz,
        };
        (RateLimiter::new(config, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn enforces_min_interval() {
        let (rl, clock) = limiter(50, 120, chrono_tz::UTC);
        assert!(rl.try_acquire().is_some());
        assert!(rl.try_acquire().is_none());
        clock.advance(Duration::seconds(119));
        assert!(rl.try_acquire().is_none());
        clock.advance(Duration::seconds(1));
        assert!(rl.try_acquire().is_some());
    }

    #[test]
    fn enforces_daily_limit_until_midnight() {
        let (rl, clock) = limiter(3, 0, chrono_tz::UTC);
        assert!(rl.try_acquire().is_some());
        assert!(rl.try_acquire().is_some());
        assert!(rl.try_acquire().is_some());
        assert!(rl.try_acquire().is_none());
        assert_eq!(rl.status().remaining_today, 0);

        clock.set(Utc.with_ymd_and_hms(2026, 3, 2, 23, 59, 59).unwrap());
        assert!(rl.try_acquire().is_none());
        clock.set(Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap());
        assert!(rl.try_acquire().is_some());
        assert_eq!(rl.status().sent_today, 1);
    }

    #[test]
    fn day_boundary_follows_configured_zone() {
        // 09:00 UTC is 04:00 in New York (EST, UTC-5).
        let (rl, clock) = limiter(1, 0, chrono_tz::America::New_York);
        assert!(rl.try_acquire().is_some());
        assert_eq!(
            rl.day_start(),
            Utc.with_ymd_and_hms(2026, 3, 2, 5, 0, 0).unwrap()
        );

        // UTC midnight is not a new day in New York.
        clock.set(Utc.with_ymd_and_hms(2026, 3, 3, 1, 0, 0).unwrap());
        assert!(rl.try_acquire().is_none());
        clock.set(Utc.with_ymd_and_hms(2026, 3, 3, 5, 0, 0).unwrap());
        assert!(rl.try_acquire().is_some());
    }

    #[test]
    fn concurrent_acquire_never_exceeds_limit() {
        let (rl, _clock) = limiter(10, 0, chrono_tz::UTC);
        let rl = Arc::new(rl);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rl = Arc::clone(&rl);
                std::thread::spawn(move || (0..10).filter(|_| rl.try_acquire().is_some()).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 10);
    }

    #[test]
    fn refund_returns_budget_but_keeps_spacing() {
        let (rl, clock) = limiter(1, 60, chrono_tz::UTC);
        let permit = rl.try_acquire().unwrap();
        rl.refund(permit);
        assert_eq!(rl.status().sent_today, 0);
        assert!(rl.try_acquire().is_none());
        clock.advance(Duration::seconds(60));
        assert!(rl.try_acquire().is_some());
    }

    #[test]
    fn refund_after_rollover_does_not_credit_new_day() {
        let (rl, clock) = limiter(1, 0, chrono_tz::UTC);
        clock.set(Utc.with_ymd_and_hms(2026, 3, 2, 23, 59, 50).unwrap());
        let late = rl.try_acquire().unwrap();

        clock.set(Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 5).unwrap());
        let today = rl.try_acquire().unwrap();
        rl.refund(late);
        assert_eq!(rl.status().sent_today, 1);
        assert!(rl.try_acquire().is_none());

        rl.refund(today);
        assert_eq!(rl.status().sent_today, 0);
    }

    #[test]
    fn restore_seeds_budget_and_spacing() {
        let (rl, clock) = limiter(5, 120, chrono_tz::UTC);
        let now = clock.now();
        rl.restore(5, Some(now - Duration::seconds(30)));
        assert!(rl.try_acquire().is_none());
        let status = rl.status();
        assert_eq!(status.sent_today, 5);
        assert_eq!(
            status.next_allowed_at,
            Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap()
        );

        rl.restore(1, Some(now - Duration::seconds(30)));
        assert_eq!(rl.status().next_allowed_at, now + Duration::seconds(90));
        clock.advance(Duration::seconds(90));
        assert!(rl.try_acquire().is_some());
    }
}
