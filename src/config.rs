//! Configuration types.
//!
//! Everything is read from `OUTREACH_*` environment variables. Parsing goes
//! through [`OutreachConfig::from_vars`] so tests can supply a plain map
//! instead of mutating the process environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How the daily caps measure "a day".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapWindow {
    /// Trailing 24 hours ending at the moment of the check.
    Rolling,
    /// Since local midnight in the configured timezone.
    CalendarDay,
}

impl FromStr for CapWindow {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rolling" => Ok(Self::Rolling),
            "calendar_day" | "calendar-day" => Ok(Self::CalendarDay),
            other => Err(format!("unknown cap window: {other}")),
        }
    }
}

/// Governance settings: safety limits, working hours, dispatch policy.
#[derive(Debug, Clone)]
pub struct OutreachConfig {
    /// Max message-class actions (messages, connection requests) per day.
    pub daily_message_limit: u32,
    /// Max profile views per day.
    pub daily_profile_view_limit: u32,
    /// Lower bound of the randomized spacing between dispatches.
    pub min_delay_seconds: u64,
    /// Upper bound of the randomized spacing between dispatches.
    pub max_delay_seconds: u64,
    /// Start of the local working day (inclusive).
    pub working_hours_start: NaiveTime,
    /// End of the local working day (exclusive).
    pub working_hours_end: NaiveTime,
    /// Timezone the working hours and rest days are expressed in.
    pub timezone: Tz,
    /// Local weekdays on which nothing is dispatched.
    pub rest_days: Vec<Weekday>,
    /// When false, drafted actions are approved at enqueue time.
    pub require_human_approval: bool,
    /// Window the daily caps count over.
    pub cap_window: CapWindow,
    /// Bound on every call to an external collaborator.
    pub external_timeout: Duration,
    /// Send attempts per dispatch before the action is marked failed.
    pub dispatch_max_attempts: u32,
    /// Base delay for exponential backoff between send attempts.
    pub dispatch_backoff: Duration,
    /// Drafts requested per lead before settling for the best invalid one.
    pub generation_attempts: u32,
    /// Days of silence after our last message before a follow-up is due.
    pub follow_up_after_days: u32,
    /// Lifetime of the scheduler tick lease.
    pub lease_ttl: Duration,
}

impl Default for OutreachConfig {
    fn default() -> Self {
        Self {
            daily_message_limit: 10,
            daily_profile_view_limit: 20,
            min_delay_seconds: 60,
            max_delay_seconds: 180,
            working_hours_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            working_hours_end: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or_default(),
            timezone: chrono_tz::Asia::Jerusalem,
            rest_days: vec![Weekday::Fri, Weekday::Sat],
            require_human_approval: true,
            cap_window: CapWindow::Rolling,
            external_timeout: Duration::from_secs(30),
            dispatch_max_attempts: 3,
            dispatch_backoff: Duration::from_millis(2000),
            generation_attempts: 3,
            follow_up_after_days: 4,
            lease_ttl: Duration::from_secs(900),
        }
    }
}

impl OutreachConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Build config from a variable map, falling back to defaults for
    /// anything unset, then validate.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let d = Self::default();

        let config = Self {
            daily_message_limit: parse_or(vars, "OUTREACH_DAILY_MESSAGE_LIMIT", d.daily_message_limit)?,
            daily_profile_view_limit: parse_or(
                vars,
                "OUTREACH_DAILY_PROFILE_VIEW_LIMIT",
                d.daily_profile_view_limit,
            )?,
            min_delay_seconds: parse_or(vars, "OUTREACH_MIN_DELAY_SECONDS", d.min_delay_seconds)?,
            max_delay_seconds: parse_or(vars, "OUTREACH_MAX_DELAY_SECONDS", d.max_delay_seconds)?,
            working_hours_start: match vars.get("OUTREACH_WORKING_HOURS_START") {
                Some(s) => parse_time_of_day("OUTREACH_WORKING_HOURS_START", s)?,
                None => d.working_hours_start,
            },
            working_hours_end: match vars.get("OUTREACH_WORKING_HOURS_END") {
                Some(s) => parse_time_of_day("OUTREACH_WORKING_HOURS_END", s)?,
                None => d.working_hours_end,
            },
            timezone: match vars.get("OUTREACH_TIMEZONE") {
                Some(s) => s
                    .trim()
                    .parse::<Tz>()
                    .map_err(|e| ConfigError::invalid("OUTREACH_TIMEZONE", e.to_string()))?,
                None => d.timezone,
            },
            rest_days: match vars.get("OUTREACH_REST_DAYS") {
                Some(s) => parse_rest_days(s)?,
                None => d.rest_days,
            },
            require_human_approval: parse_or(
                vars,
                "OUTREACH_REQUIRE_HUMAN_APPROVAL",
                d.require_human_approval,
            )?,
            cap_window: parse_or(vars, "OUTREACH_CAP_WINDOW", d.cap_window)?,
            external_timeout: Duration::from_secs(parse_or(
                vars,
                "OUTREACH_EXTERNAL_TIMEOUT_SECS",
                d.external_timeout.as_secs(),
            )?),
            dispatch_max_attempts: parse_or(
                vars,
                "OUTREACH_DISPATCH_MAX_ATTEMPTS",
                d.dispatch_max_attempts,
            )?,
            dispatch_backoff: Duration::from_millis(parse_or(
                vars,
                "OUTREACH_DISPATCH_BACKOFF_MS",
                d.dispatch_backoff.as_millis() as u64,
            )?),
            generation_attempts: parse_or(
                vars,
                "OUTREACH_GENERATION_ATTEMPTS",
                d.generation_attempts,
            )?,
            follow_up_after_days: parse_or(
                vars,
                "OUTREACH_FOLLOW_UP_AFTER_DAYS",
                d.follow_up_after_days,
            )?,
            lease_ttl: Duration::from_secs(parse_or(
                vars,
                "OUTREACH_LEASE_TTL_SECS",
                d.lease_ttl.as_secs(),
            )?),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the safety bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=50).contains(&self.daily_message_limit) {
            return Err(ConfigError::invalid(
                "OUTREACH_DAILY_MESSAGE_LIMIT",
                format!("{} is outside 1..=50", self.daily_message_limit),
            ));
        }
        if !(1..=100).contains(&self.daily_profile_view_limit) {
            return Err(ConfigError::invalid(
                "OUTREACH_DAILY_PROFILE_VIEW_LIMIT",
                format!("{} is outside 1..=100", self.daily_profile_view_limit),
            ));
        }
        if self.min_delay_seconds < 30 {
            return Err(ConfigError::invalid(
                "OUTREACH_MIN_DELAY_SECONDS",
                "must be at least 30",
            ));
        }
        if self.max_delay_seconds < 60 || self.max_delay_seconds < self.min_delay_seconds {
            return Err(ConfigError::invalid(
                "OUTREACH_MAX_DELAY_SECONDS",
                format!(
                    "must be at least 60 and at least the minimum delay ({})",
                    self.min_delay_seconds
                ),
            ));
        }
        if self.working_hours_end <= self.working_hours_start {
            return Err(ConfigError::invalid(
                "OUTREACH_WORKING_HOURS_END",
                "must be later than the start of working hours",
            ));
        }
        if self.dispatch_max_attempts == 0 {
            return Err(ConfigError::invalid(
                "OUTREACH_DISPATCH_MAX_ATTEMPTS",
                "must be at least 1",
            ));
        }
        if self.generation_attempts == 0 {
            return Err(ConfigError::invalid(
                "OUTREACH_GENERATION_ATTEMPTS",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Process-level settings for the binary.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Port for the approval API / WebSocket.
    pub api_port: u16,
    /// Cron expression (with seconds) for scheduler ticks.
    pub tick_schedule: String,
    /// Cron expression (with seconds) for reconciler runs.
    pub reconcile_schedule: String,
    /// Directory for daily-rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl ServiceConfig {
    /// Build from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let tick_schedule = vars
            .get("OUTREACH_TICK_SCHEDULE")
            .cloned()
            .unwrap_or_else(|| "0 * * * * *".to_string());
        let reconcile_schedule = vars
            .get("OUTREACH_RECONCILE_SCHEDULE")
            .cloned()
            .unwrap_or_else(|| "30 */5 * * * *".to_string());

        for (key, expr) in [
            ("OUTREACH_TICK_SCHEDULE", &tick_schedule),
            ("OUTREACH_RECONCILE_SCHEDULE", &reconcile_schedule),
        ] {
            cron::Schedule::from_str(expr)
                .map_err(|e| ConfigError::invalid(key, format!("invalid cron expression: {e}")))?;
        }

        Ok(Self {
            db_path: vars
                .get("OUTREACH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/outreach.db")),
            api_port: parse_or(vars, "OUTREACH_API_PORT", 8080)?,
            tick_schedule,
            reconcile_schedule,
            log_dir: vars.get("OUTREACH_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_or<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, format!("{raw:?}: {e}"))),
        None => Ok(default),
    }
}

/// Accepts `HH:MM` or a bare hour (`9`).
fn parse_time_of_day(key: &str, raw: &str) -> Result<NaiveTime, ConfigError> {
    let raw = raw.trim();
    if let Ok(t) = NaiveTime::parse_from_str(raw, "%H:%M") {
        return Ok(t);
    }
    raw.parse::<u32>()
        .ok()
        .and_then(|h| NaiveTime::from_hms_opt(h, 0, 0))
        .ok_or_else(|| ConfigError::invalid(key, format!("{raw:?} is not HH:MM or an hour 0-23")))
}

fn parse_rest_days(raw: &str) -> Result<Vec<Weekday>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Weekday>()
                .map_err(|_| ConfigError::invalid("OUTREACH_REST_DAYS", format!("unknown weekday {s:?}")))
        })
        .collect()
}
