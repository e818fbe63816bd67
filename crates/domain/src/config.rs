use std::{env, str::FromStr, time::Duration as StdDuration};

use chrono::Duration;

use crate::errors::{Error, Result};
use crate::store::Collection;

/// Table names backing each collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableNames {
    pub commands: String,
    pub events: String,
    pub archived_events: String,
    pub transaction_log: String,
    pub rollback_log: String,
    pub manual_review: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            commands: "adherence-commands".to_string(),
            events: "adherence-events".to_string(),
            archived_events: "adherence-archived-events".to_string(),
            transaction_log: "adherence-transaction-log".to_string(),
            rollback_log: "adherence-rollback-log".to_string(),
            manual_review: "adherence-manual-review".to_string(),
        }
    }
}

impl TableNames {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            commands: env::var("DYNAMODB_COMMANDS_TABLE").unwrap_or(defaults.commands),
            events: env::var("DYNAMODB_EVENTS_TABLE").unwrap_or(defaults.events),
            archived_events: env::var("DYNAMODB_ARCHIVED_EVENTS_TABLE")
                .unwrap_or(defaults.archived_events),
            transaction_log: env::var("DYNAMODB_TRANSACTION_LOG_TABLE")
                .unwrap_or(defaults.transaction_log),
            rollback_log: env::var("DYNAMODB_ROLLBACK_LOG_TABLE").unwrap_or(defaults.rollback_log),
            manual_review: env::var("DYNAMODB_MANUAL_REVIEW_TABLE")
                .unwrap_or(defaults.manual_review),
        }
    }

    pub fn table_for(&self, collection: Collection) -> &str {
        match collection {
            Collection::Commands => &self.commands,
            Collection::Events => &self.events,
            Collection::ArchivedEvents => &self.archived_events,
            Collection::TransactionLog => &self.transaction_log,
            Collection::RollbackLog => &self.rollback_log,
            Collection::ManualReview => &self.manual_review,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub undo_window: Duration,
    pub correction_window: Duration,
    pub on_time_threshold: Duration,
    pub schedule_horizon_days: i64,
    pub max_generated_events: usize,
    pub max_batch_size: usize,
    pub transaction_timeout: StdDuration,
    pub missed_lookaround: Duration,
    pub missed_lookback: Duration,
    pub adherence_window: Duration,
    pub event_retention: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: StdDuration,
    pub tables: TableNames,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            undo_window: Duration::seconds(30),
            correction_window: Duration::hours(24),
            on_time_threshold: Duration::minutes(30),
            schedule_horizon_days: 30,
            max_generated_events: 100,
            max_batch_size: 100,
            transaction_timeout: StdDuration::from_millis(10_000),
            missed_lookaround: Duration::minutes(120),
            missed_lookback: Duration::hours(24),
            adherence_window: Duration::days(7),
            event_retention: Duration::days(365),
            breaker_failure_threshold: 5,
            breaker_cooldown: StdDuration::from_secs(60),
            tables: TableNames::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            undo_window: Duration::seconds(env_or("UNDO_WINDOW_SECONDS", 30)?),
            correction_window: Duration::hours(env_or("CORRECTION_WINDOW_HOURS", 24)?),
            on_time_threshold: Duration::minutes(env_or("ON_TIME_THRESHOLD_MINUTES", 30)?),
            schedule_horizon_days: env_or("SCHEDULE_HORIZON_DAYS", defaults.schedule_horizon_days)?,
            max_generated_events: env_or("MAX_GENERATED_EVENTS", defaults.max_generated_events)?,
            max_batch_size: env_or("MAX_BATCH_SIZE", defaults.max_batch_size)?,
            transaction_timeout: StdDuration::from_millis(env_or(
                "TRANSACTION_TIMEOUT_MS",
                10_000u64,
            )?),
            missed_lookaround: Duration::minutes(env_or("MISSED_LOOKAROUND_MINUTES", 120)?),
            missed_lookback: Duration::hours(env_or("MISSED_LOOKBACK_HOURS", 24)?),
            adherence_window: Duration::days(env_or("ADHERENCE_WINDOW_DAYS", 7)?),
            event_retention: Duration::days(env_or("EVENT_RETENTION_DAYS", 365)?),
            breaker_failure_threshold: env_or(
                "BREAKER_FAILURE_THRESHOLD",
                defaults.breaker_failure_threshold,
            )?,
            breaker_cooldown: StdDuration::from_secs(env_or("BREAKER_COOLDOWN_SECONDS", 60u64)?),
            tables: TableNames::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.undo_window <= Duration::zero() {
            return Err(config_error("undo window must be positive"));
        }
        if self.correction_window <= self.undo_window {
            return Err(config_error("correction window must exceed the undo window"));
        }
        if self.max_batch_size == 0 {
            return Err(config_error("max batch size must be positive"));
        }
        if self.max_generated_events > self.max_batch_size {
            return Err(config_error(
                "max generated events must fit in a single batch",
            ));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(config_error("breaker failure threshold must be positive"));
        }
        if self.schedule_horizon_days <= 0 {
            return Err(config_error("schedule horizon must be positive"));
        }
        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| config_error(format!("{key}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn config_error(message: impl Into<String>) -> Error {
    Error::Config {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_windows() {
        let config = Config {
            correction_window: Duration::seconds(10),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_rejects_horizon_larger_than_batch() {
        let config = Config {
            max_generated_events: 500,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
