use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub fetcher: FetcherConfig,
    pub scheduler: SchedulerConfig,
    pub signal: SignalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Headless Chrome instances to launch, 1 to 3. Each one holds a full
    /// renderer process, so the ceiling is deliberately low.
    pub browser_pool_size: usize,
    pub request_timeout: u64,
    pub user_agent: String,
    pub chrome_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two checks of the same item.
    pub check_interval: u64,
    /// Maximum jitter applied around check_interval, in seconds.
    pub jitter: u64,
    /// Seconds between scheduler ticks (due-item polls).
    pub tick_interval: u64,
    /// Concurrent checks across all items.
    pub max_concurrent_checks: usize,
    /// Consecutive failures before an item stops auto-rescheduling.
    pub retry_ceiling: u32,
    /// First retry delay after a failed check, in seconds.
    pub retry_base: u64,
    /// Upper bound for the exponential retry delay, in seconds.
    pub retry_cap: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    pub account: String,
    pub group_id: String,
    /// Seconds between receive polls.
    pub poll_interval: u64,
    pub cli_path: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with default configuration
            .add_source(File::with_name("config/default"))
            // Add environment-specific config
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add local config (ignored by git)
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables with prefix "DEALWATCH_"
            .add_source(Environment::with_prefix("DEALWATCH").separator("__"))
            .build()?;

        let config: AppConfig = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.max_connections == 0 {
            return Err(ConfigError::Message(
                "Database max_connections must be greater than 0".into(),
            ));
        }

        if !(1..=3).contains(&self.fetcher.browser_pool_size) {
            return Err(ConfigError::Message(
                "Fetcher browser_pool_size must be between 1 and 3".into(),
            ));
        }

        if self.fetcher.request_timeout == 0 {
            return Err(ConfigError::Message(
                "Fetcher request_timeout must be greater than 0".into(),
            ));
        }

        if self.scheduler.check_interval == 0 {
            return Err(ConfigError::Message(
                "Scheduler check_interval must be greater than 0".into(),
            ));
        }

        if self.scheduler.jitter >= self.scheduler.check_interval {
            return Err(ConfigError::Message(
                "Scheduler jitter must be smaller than check_interval".into(),
            ));
        }

        if self.scheduler.max_concurrent_checks == 0 {
            return Err(ConfigError::Message(
                "Scheduler max_concurrent_checks must be greater than 0".into(),
            ));
        }

        if self.scheduler.retry_ceiling == 0 {
            return Err(ConfigError::Message(
                "Scheduler retry_ceiling must be greater than 0".into(),
            ));
        }

        if self.scheduler.retry_base == 0 || self.scheduler.retry_cap < self.scheduler.retry_base {
            return Err(ConfigError::Message(
                "Scheduler retry_cap must be at least retry_base, both non-zero".into(),
            ));
        }

        if self.signal.account.is_empty() {
            return Err(ConfigError::Message(
                "Signal account (phone number) must be set".into(),
            ));
        }

        if self.signal.group_id.is_empty() {
            return Err(ConfigError::Message("Signal group_id must be set".into()));
        }

        Ok(())
    }
}
