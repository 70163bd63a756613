//! Rate/window guard: decides whether an action may be dispatched now.
//!
//! The guard owns no state. Every check is evaluated against the action log
//! history handed in by the caller, so the same inputs always produce the
//! same answer (apart from the randomized spacing draw in [`Guard::authorize`]).
//!
//! Rules, first failure wins:
//! 1. working hours / rest days in the configured timezone
//! 2. daily cap for the action's cap class
//! 3. randomized spacing since the last dispatch of any kind

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use rand::Rng;

use crate::config::{CapWindow, OutreachConfig};

use super::model::{ActionKind, ActionLogEntry, Authorization, Denial};

/// Guard settings, a projection of [`OutreachConfig`].
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub daily_message_limit: u32,
    pub daily_profile_view_limit: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub working_hours_start: NaiveTime,
    pub working_hours_end: NaiveTime,
    pub timezone: Tz,
    pub rest_days: Vec<Weekday>,
    pub cap_window: CapWindow,
}

impl From<&OutreachConfig> for GuardConfig {
    fn from(c: &OutreachConfig) -> Self {
        Self {
            daily_message_limit: c.daily_message_limit,
            daily_profile_view_limit: c.daily_profile_view_limit,
            min_delay: Duration::from_secs(c.min_delay_seconds),
            max_delay: Duration::from_secs(c.max_delay_seconds.max(c.min_delay_seconds)),
            working_hours_start: c.working_hours_start,
            working_hours_end: c.working_hours_end,
            timezone: c.timezone,
            rest_days: c.rest_days.clone(),
            cap_window: c.cap_window,
        }
    }
}

/// Stateless rate/window guard.
#[derive(Debug, Clone)]
pub struct Guard {
    config: GuardConfig,
}

impl Guard {
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Check all rules, drawing a fresh spacing delay for this check.
    pub fn authorize(
        &self,
        kind: ActionKind,
        now: DateTime<Utc>,
        history: &[ActionLogEntry],
    ) -> Authorization {
        let delay = self.draw_delay(&mut rand::thread_rng());
        self.authorize_with_delay(kind, now, history, delay)
    }

    /// Check all rules with an explicit spacing delay. The delay is clamped
    /// to the configured minimum.
    pub fn authorize_with_delay(
        &self,
        kind: ActionKind,
        now: DateTime<Utc>,
        history: &[ActionLogEntry],
        delay: Duration,
    ) -> Authorization {
        if !self.in_working_hours(now) {
            return Authorization::Denied(Denial::OutsideWindow);
        }

        let limit = self.daily_limit(kind);
        if self.used_in_window(kind, now, history) >= limit {
            return Authorization::Denied(Denial::DailyCapExceeded {
                kind: kind.cap_class(),
                limit,
            });
        }

        let delay = delay.max(self.config.min_delay);
        if let Some(last) = history.iter().map(|e| e.timestamp).max() {
            let elapsed = now
                .signed_duration_since(last)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed < delay {
                return Authorization::Denied(Denial::TooSoon {
                    retry_after: delay - elapsed,
                });
            }
        }

        Authorization::Allowed
    }

    /// Draw a spacing delay uniformly from `[min_delay, max_delay]`.
    pub fn draw_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let min = self.config.min_delay.as_secs();
        let max = self.config.max_delay.as_secs().max(min);
        Duration::from_secs(rng.gen_range(min..=max))
    }

    /// Whether `now` falls inside local working hours on a working day.
    pub fn in_working_hours(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.config.timezone);
        if self.config.rest_days.contains(&local.weekday()) {
            return false;
        }
        let t = local.time();
        t >= self.config.working_hours_start && t < self.config.working_hours_end
    }

    /// Start of the window the daily caps count over.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let rolling = now - chrono::Duration::hours(24);
        match self.config.cap_window {
            CapWindow::Rolling => rolling,
            CapWindow::CalendarDay => {
                let tz = self.config.timezone;
                let midnight = now.with_timezone(&tz).date_naive().and_time(NaiveTime::MIN);
                tz.from_local_datetime(&midnight)
                    .earliest()
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or(rolling)
            }
        }
    }

    /// Dispatched actions in `kind`'s cap class inside the current window.
    pub fn used_in_window(
        &self,
        kind: ActionKind,
        now: DateTime<Utc>,
        history: &[ActionLogEntry],
    ) -> u32 {
        let class = kind.cap_class();
        let start = self.window_start(now);
        history
            .iter()
            .filter(|e| e.kind.cap_class() == class && e.timestamp > start && e.timestamp <= now)
            .count() as u32
    }

    /// Daily limit for `kind`'s cap class.
    pub fn daily_limit(&self, kind: ActionKind) -> u32 {
        match kind.cap_class() {
            ActionKind::ProfileView => self.config.daily_profile_view_limit,
            _ => self.config.daily_message_limit,
        }
    }

    /// How many more actions of `kind`'s class the cap admits right now.
    pub fn remaining_budget(
        &self,
        kind: ActionKind,
        now: DateTime<Utc>,
        history: &[ActionLogEntry],
    ) -> u32 {
        self.daily_limit(kind)
            .saturating_sub(self.used_in_window(kind, now, history))
    }
}
