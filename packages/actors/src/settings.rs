//! Scheduler settings.

use std::str::FromStr;
use std::time::Duration;

use db::{DbError, RetryPolicy, StoreConfig, StoreOptions};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("Store configuration error: {0}")]
    Store(#[from] DbError),
}

/// Tunables for the scheduler core and the legacy processor.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Name recorded on fired triggers and heartbeats.
    pub instance_name: String,
    /// Number of workers; defaults to processor count plus two.
    pub pool_size: usize,
    /// How often the dispatcher looks for due triggers.
    pub tick_interval: Duration,
    /// Triggers due within this window of now are acquired early.
    pub fire_ahead: Duration,
    /// Delay before a filter-deferred trigger is looked at again.
    pub filter_recheck: Duration,
    pub misfire_threshold: Duration,
    pub heartbeat_interval: Duration,
    /// Backoff for transient store failures.
    pub store_retry: RetryPolicy,
    /// Re-runs granted to a failing recoverable job before it is dropped.
    pub job_max_retries: u32,
    pub job_retry_delay: Duration,
    /// Commands the legacy processor runs at once.
    pub legacy_max_concurrency: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            instance_name: "scheduler".to_string(),
            pool_size: default_pool_size(),
            tick_interval: Duration::from_millis(250),
            fire_ahead: Duration::ZERO,
            filter_recheck: Duration::from_secs(5),
            misfire_threshold: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            store_retry: RetryPolicy::default(),
            job_max_retries: 3,
            job_retry_delay: Duration::from_secs(30),
            legacy_max_concurrency: 4,
        }
    }
}

/// Processor count plus two.
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        + 2
}

impl SchedulerSettings {
    /// Read settings from `SCHEDULER_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, SettingsError> {
        let defaults = Self::default();

        let store_retry = RetryPolicy {
            max_attempts: env_parse("SCHEDULER_STORE_MAX_ATTEMPTS")?
                .unwrap_or(defaults.store_retry.max_attempts),
            initial_backoff: env_millis("SCHEDULER_STORE_BACKOFF_MS")?
                .unwrap_or(defaults.store_retry.initial_backoff),
            max_backoff: env_millis("SCHEDULER_STORE_MAX_BACKOFF_MS")?
                .unwrap_or(defaults.store_retry.max_backoff),
        };

        let settings = Self {
            instance_name: std::env::var("SCHEDULER_INSTANCE_NAME")
                .unwrap_or(defaults.instance_name),
            pool_size: env_parse("SCHEDULER_POOL_SIZE")?.unwrap_or(defaults.pool_size),
            tick_interval: env_millis("SCHEDULER_TICK_MS")?.unwrap_or(defaults.tick_interval),
            fire_ahead: env_millis("SCHEDULER_FIRE_AHEAD_MS")?.unwrap_or(defaults.fire_ahead),
            filter_recheck: env_millis("SCHEDULER_FILTER_RECHECK_MS")?
                .unwrap_or(defaults.filter_recheck),
            misfire_threshold: env_millis("SCHEDULER_MISFIRE_THRESHOLD_MS")?
                .unwrap_or(defaults.misfire_threshold),
            heartbeat_interval: env_millis("SCHEDULER_HEARTBEAT_MS")?
                .unwrap_or(defaults.heartbeat_interval),
            store_retry,
            job_max_retries: env_parse("SCHEDULER_JOB_MAX_RETRIES")?
                .unwrap_or(defaults.job_max_retries),
            job_retry_delay: env_millis("SCHEDULER_JOB_RETRY_DELAY_MS")?
                .unwrap_or(defaults.job_retry_delay),
            legacy_max_concurrency: env_parse("SCHEDULER_LEGACY_CONCURRENCY")?
                .unwrap_or(defaults.legacy_max_concurrency),
        };

        if settings.pool_size == 0 {
            return Err(SettingsError::Invalid {
                name: "SCHEDULER_POOL_SIZE",
                value: "0".to_string(),
            });
        }

        Ok(settings)
    }

    /// Options handed to the trigger store.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions::default()
            .with_instance_name(self.instance_name.clone())
            .with_retry(self.store_retry.clone())
            .with_misfire_threshold(self.misfire_threshold)
            .with_checkin_interval(self.heartbeat_interval)
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_filter_recheck(mut self, recheck: Duration) -> Self {
        self.filter_recheck = recheck;
        self
    }

    pub fn with_job_retries(mut self, max_retries: u32, delay: Duration) -> Self {
        self.job_max_retries = max_retries;
        self.job_retry_delay = delay;
        self
    }
}

/// Source of the settings a scheduler process starts with.
pub trait SettingsProvider: Send + Sync {
    fn scheduler_settings(&self) -> Result<SchedulerSettings, SettingsError>;

    fn store_config(&self) -> Result<StoreConfig, SettingsError>;
}

/// Settings read from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSettings;

impl SettingsProvider for EnvSettings {
    fn scheduler_settings(&self) -> Result<SchedulerSettings, SettingsError> {
        SchedulerSettings::from_env()
    }

    fn store_config(&self) -> Result<StoreConfig, SettingsError> {
        Ok(StoreConfig::from_env()?)
    }
}

fn env_parse<T: FromStr>(name: &'static str) -> Result<Option<T>, SettingsError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SettingsError::Invalid { name, value }),
        Err(_) => Ok(None),
    }
}

fn env_millis(name: &'static str) -> Result<Option<Duration>, SettingsError> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_is_processors_plus_two() {
        let settings = SchedulerSettings::default();
        assert!(settings.pool_size >= 3);
        assert_eq!(settings.pool_size, default_pool_size());
    }

    #[test]
    fn store_options_carry_instance_and_thresholds() {
        let settings = SchedulerSettings {
            instance_name: "node-a".to_string(),
            misfire_threshold: Duration::from_secs(5),
            ..SchedulerSettings::default()
        };

        let options = settings.store_options();
        assert_eq!(options.instance_name, "node-a");
        assert_eq!(options.misfire_threshold, Duration::from_secs(5));
    }

    #[test]
    fn pool_size_is_never_zero() {
        let settings = SchedulerSettings::default().with_pool_size(0);
        assert_eq!(settings.pool_size, 1);
    }
}
