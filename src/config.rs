// Token Raffle - Configuration
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::error::RaffleError;

pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 250;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_DRAW_TIMEOUT_SECS: i64 = 300;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Where the journal lives; `None` keeps everything in memory
    pub journal_path: Option<PathBuf>,
    /// How long one attempt waits on a contended ledger or raffle lock
    pub lock_timeout: Duration,
    /// Attempts before contention surfaces as `RaceConditionRetry`
    pub retry_attempts: u32,
    /// Seconds a raffle may sit in Drawing before the sweep resumes it
    pub draw_timeout_secs: i64,
    pub sweep_interval: Duration,
    /// Buffered draw events per subscriber
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            journal_path: None,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            draw_timeout_secs: DEFAULT_DRAW_TIMEOUT_SECS,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// `RAFFLE_*` variables as the config crate sees them; unset ones keep the defaults
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnvOverrides {
    journal_path: Option<PathBuf>,
    lock_timeout_ms: Option<u64>,
    retry_attempts: Option<u32>,
    draw_timeout_secs: Option<i64>,
    sweep_interval_secs: Option<u64>,
    event_capacity: Option<usize>,
}

impl EngineConfig {
    /// Defaults overridden by `RAFFLE_*` environment variables
    pub fn from_env() -> Result<Self, RaffleError> {
        Self::load(Environment::with_prefix("RAFFLE"))
    }

    /// Same as `from_env`, reading from the given variables instead of the process environment
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, RaffleError> {
        Self::load(Environment::with_prefix("RAFFLE").source(Some(vars.into_iter().collect())))
    }

    fn load(source: Environment) -> Result<Self, RaffleError> {
        let overrides: EnvOverrides = Config::builder()
            .add_source(source)
            .build()
            .and_then(|settings| settings.try_deserialize::<EnvOverrides>())
            .map_err(|err: ConfigError| RaffleError::validation(format!("invalid configuration: {err}")))?;

        let mut config = Self::default();
        if let Some(path) = overrides.journal_path.filter(|p| !p.as_os_str().is_empty()) {
            config.journal_path = Some(path);
        }
        if let Some(ms) = overrides.lock_timeout_ms {
            config.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = overrides.retry_attempts {
            config.retry_attempts = attempts;
        }
        if let Some(secs) = overrides.draw_timeout_secs {
            config.draw_timeout_secs = secs;
        }
        if let Some(secs) = overrides.sweep_interval_secs {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(capacity) = overrides.event_capacity {
            config.event_capacity = capacity;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RaffleError> {
        if self.retry_attempts == 0 {
            return Err(RaffleError::validation("retry_attempts must be at least 1"));
        }
        if self.draw_timeout_secs <= 0 {
            return Err(RaffleError::validation("draw_timeout_secs must be positive"));
        }
        if self.sweep_interval.is_zero() {
            return Err(RaffleError::validation("sweep_interval must be positive"));
        }
        if self.event_capacity == 0 {
            return Err(RaffleError::validation("event_capacity must be positive"));
        }
        Ok(())
    }
}
