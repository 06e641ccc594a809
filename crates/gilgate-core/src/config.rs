//! # Gateway Configuration
//!
//! Scheduler, worker pool and suspension settings, loadable from the
//! environment through [`GatewayConfigBuilder::from_env`].
//!
//! ## Environment Variables
//!
//! - `GILGATE_WORKERS` - Number of worker threads (default: 16)
//! - `GILGATE_MAX_QUEUE_LENGTH` - Pending jobs before eviction starts (default: 128)
//! - `GILGATE_REQUEST_TIMEOUT_SECS` - Per-request timeout in seconds (default: 60)
//! - `GILGATE_BACKGROUND_TIMEOUT_SECS` - Background task timeout in seconds (default: 1800)
//! - `GILGATE_LOW_PRIORITY_THRESHOLD` - Priority at or below which jobs wait while busy (default: -7000)
//! - `GILGATE_REQUEST_BUFFER_LENGTH` - Bytes of request body buffered eagerly (default: 1048576)
//! - `GILGATE_BLOCK_WAIT_SLOTS` - Concurrently delayed requests from blocked sources (default: 100)
//! - `GILGATE_PARK_DEFAULT_TIMEOUT_SECS` - Park timeout when none is given (default: 7200)
//!
//! Priority weights:
//!
//! - `GILGATE_PRIORITY_BASE` - Starting priority of every job (default: 1000)
//! - `GILGATE_BOT_PENALTY` - Subtracted for automated user agents (default: 8000)
//! - `GILGATE_QUERY_PENALTY` - Subtracted when the URL has a query string (default: 500)
//! - `GILGATE_CPU_TIME_FACTOR` - Subtracted per millisecond of recent page CPU time (default: 10)
//! - `GILGATE_ACTIVE_PENALTY` - Subtracted per running job from the same source (default: 2000)
//! - `GILGATE_RATE_PENALTY` - Subtracted per unit of the source's aged request rate (default: 1000)

use std::env;
use std::num::NonZeroUsize;
use std::time::Duration;

use crate::error::ConfigError;
use crate::priority::PriorityWeights;

/// Capacity of the per-source and per-page recency caches.
pub const STATS_CACHE_CAPACITY: u64 = 16_384;

/// Validated maximum queue length (1-100,000)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueLength(NonZeroUsize);

impl QueueLength {
    pub const MAX: usize = 100_000;
    pub const DEFAULT: Self = match NonZeroUsize::new(128) {
        Some(length) => Self(length),
        None => unreachable!(),
    };

    pub fn new(length: usize) -> Result<Self, ConfigError> {
        let non_zero = NonZeroUsize::new(length).ok_or_else(|| {
            ConfigError::ValidationError("max queue length must be at least 1".to_string())
        })?;
        if length > Self::MAX {
            return Err(ConfigError::ValidationError(format!(
                "max queue length must be at most {}",
                Self::MAX
            )));
        }
        Ok(Self(non_zero))
    }

    pub fn get(&self) -> usize {
        self.0.get()
    }
}

impl std::fmt::Display for QueueLength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated worker thread count (1-1,024)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkerCount(NonZeroUsize);

impl WorkerCount {
    pub const MAX: usize = 1_024;
    pub const DEFAULT: Self = match NonZeroUsize::new(16) {
        Some(count) => Self(count),
        None => unreachable!(),
    };

    pub fn new(count: usize) -> Result<Self, ConfigError> {
        let non_zero = NonZeroUsize::new(count).ok_or_else(|| {
            ConfigError::ValidationError("worker count must be at least 1".to_string())
        })?;
        if count > Self::MAX {
            return Err(ConfigError::ValidationError(format!(
                "worker count must be at most {}",
                Self::MAX
            )));
        }
        Ok(Self(non_zero))
    }

    pub fn get(&self) -> usize {
        self.0.get()
    }
}

impl std::fmt::Display for WorkerCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub workers: WorkerCount,
    pub max_queue_length: QueueLength,
    /// Producer-side wait bound and watchdog timeout for request executions
    pub request_timeout: Duration,
    /// Watchdog timeout for background tasks
    pub background_timeout: Duration,
    pub request_buffer_length: usize,
    pub block_wait_slots: usize,
    pub park_default_timeout: Duration,
    pub priority: PriorityWeights,
    pub stats_capacity: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            workers: WorkerCount::DEFAULT,
            max_queue_length: QueueLength::DEFAULT,
            request_timeout: Duration::from_secs(60),
            background_timeout: Duration::from_secs(1800),
            request_buffer_length: 1024 * 1024,
            block_wait_slots: 100,
            park_default_timeout: Duration::from_secs(7200),
            priority: PriorityWeights::default(),
            stats_capacity: STATS_CACHE_CAPACITY,
        }
    }
}

impl GatewayConfig {
    /// Timeout used when a parked or retried request is resubmitted
    pub fn resume_timeout(&self) -> Duration {
        self.request_timeout * 2
    }
}

/// Builder for [`GatewayConfig`] with environment variable support
#[derive(Debug, Clone)]
pub struct GatewayConfigBuilder {
    workers: usize,
    max_queue_length: usize,
    request_timeout_secs: u64,
    background_timeout_secs: u64,
    request_buffer_length: usize,
    block_wait_slots: usize,
    park_default_timeout_secs: u64,
    priority: PriorityWeights,
}

impl Default for GatewayConfigBuilder {
    fn default() -> Self {
        let defaults = GatewayConfig::default();
        Self {
            workers: defaults.workers.get(),
            max_queue_length: defaults.max_queue_length.get(),
            request_timeout_secs: defaults.request_timeout.as_secs(),
            background_timeout_secs: defaults.background_timeout.as_secs(),
            request_buffer_length: defaults.request_buffer_length,
            block_wait_slots: defaults.block_wait_slots,
            park_default_timeout_secs: defaults.park_default_timeout.as_secs(),
            priority: defaults.priority,
        }
    }
}

impl GatewayConfigBuilder {
    /// Create a new builder with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `GILGATE_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnvVar` if a variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Self::default();

        if let Some(workers) = get_env_usize("GILGATE_WORKERS")? {
            builder = builder.workers(workers);
        }
        if let Some(length) = get_env_usize("GILGATE_MAX_QUEUE_LENGTH")? {
            builder = builder.max_queue_length(length);
        }
        if let Some(secs) = get_env_u64("GILGATE_REQUEST_TIMEOUT_SECS")? {
            builder = builder.request_timeout_secs(secs);
        }
        if let Some(secs) = get_env_u64("GILGATE_BACKGROUND_TIMEOUT_SECS")? {
            builder = builder.background_timeout_secs(secs);
        }
        if let Some(threshold) = get_env_i64("GILGATE_LOW_PRIORITY_THRESHOLD")? {
            builder = builder.low_priority_threshold(threshold);
        }
        if let Some(length) = get_env_usize("GILGATE_REQUEST_BUFFER_LENGTH")? {
            builder = builder.request_buffer_length(length);
        }
        if let Some(slots) = get_env_usize("GILGATE_BLOCK_WAIT_SLOTS")? {
            builder = builder.block_wait_slots(slots);
        }
        if let Some(secs) = get_env_u64("GILGATE_PARK_DEFAULT_TIMEOUT_SECS")? {
            builder = builder.park_default_timeout_secs(secs);
        }
        if let Some(base) = get_env_i64("GILGATE_PRIORITY_BASE")? {
            builder = builder.base_priority(base);
        }
        if let Some(penalty) = get_env_i64("GILGATE_BOT_PENALTY")? {
            builder = builder.bot_penalty(penalty);
        }
        if let Some(penalty) = get_env_i64("GILGATE_QUERY_PENALTY")? {
            builder = builder.query_penalty(penalty);
        }
        if let Some(factor) = get_env_i64("GILGATE_CPU_TIME_FACTOR")? {
            builder = builder.cpu_time_factor(factor);
        }
        if let Some(penalty) = get_env_i64("GILGATE_ACTIVE_PENALTY")? {
            builder = builder.active_penalty(penalty);
        }
        if let Some(penalty) = get_env_i64("GILGATE_RATE_PENALTY")? {
            builder = builder.rate_penalty(penalty);
        }

        Ok(builder)
    }

    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub fn max_queue_length(mut self, length: usize) -> Self {
        self.max_queue_length = length;
        self
    }

    #[must_use]
    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn background_timeout_secs(mut self, secs: u64) -> Self {
        self.background_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn low_priority_threshold(mut self, threshold: i64) -> Self {
        self.priority.low_priority_threshold = threshold;
        self
    }

    #[must_use]
    pub fn base_priority(mut self, base: i64) -> Self {
        self.priority.base = base;
        self
    }

    #[must_use]
    pub fn bot_penalty(mut self, penalty: i64) -> Self {
        self.priority.bot_penalty = penalty;
        self
    }

    #[must_use]
    pub fn query_penalty(mut self, penalty: i64) -> Self {
        self.priority.query_penalty = penalty;
        self
    }

    #[must_use]
    pub fn cpu_time_factor(mut self, factor: i64) -> Self {
        self.priority.cpu_time_factor = factor;
        self
    }

    #[must_use]
    pub fn active_penalty(mut self, penalty: i64) -> Self {
        self.priority.active_penalty = penalty;
        self
    }

    #[must_use]
    pub fn rate_penalty(mut self, penalty: i64) -> Self {
        self.priority.rate_penalty = penalty;
        self
    }

    /// Replace every priority weight at once
    #[must_use]
    pub fn priority_weights(mut self, weights: PriorityWeights) -> Self {
        self.priority = weights;
        self
    }

    #[must_use]
    pub fn request_buffer_length(mut self, length: usize) -> Self {
        self.request_buffer_length = length;
        self
    }

    #[must_use]
    pub fn block_wait_slots(mut self, slots: usize) -> Self {
        self.block_wait_slots = slots;
        self
    }

    #[must_use]
    pub fn park_default_timeout_secs(mut self, secs: u64) -> Self {
        self.park_default_timeout_secs = secs;
        self
    }

    /// Validate and build the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if any value is out of range.
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        self.validate()?;

        Ok(GatewayConfig {
            workers: WorkerCount::new(self.workers)?,
            max_queue_length: QueueLength::new(self.max_queue_length)?,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            background_timeout: Duration::from_secs(self.background_timeout_secs),
            request_buffer_length: self.request_buffer_length,
            block_wait_slots: self.block_wait_slots,
            park_default_timeout: Duration::from_secs(self.park_default_timeout_secs),
            priority: self.priority,
            stats_capacity: STATS_CACHE_CAPACITY,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.background_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "background_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.park_default_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "park_default_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.request_buffer_length > 64 * 1024 * 1024 {
            return Err(ConfigError::ValidationError(
                "request_buffer_length must be <= 64MB".to_string(),
            ));
        }
        let weights = &self.priority;
        if weights.low_priority_threshold >= weights.base {
            return Err(ConfigError::ValidationError(
                "low_priority_threshold must be below the base priority".to_string(),
            ));
        }
        // Negative weights would turn penalties into boosts
        for (name, value) in [
            ("bot_penalty", weights.bot_penalty),
            ("query_penalty", weights.query_penalty),
            ("cpu_time_factor", weights.cpu_time_factor),
            ("active_penalty", weights.active_penalty),
            ("rate_penalty", weights.rate_penalty),
        ] {
            if value < 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must not be negative"
                )));
            }
        }
        Ok(())
    }
}

// Environment variable helper functions

fn get_env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid u64 value '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}

fn get_env_i64(key: &str) -> Result<Option<i64>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<i64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid i64 value '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}

fn get_env_usize(key: &str) -> Result<Option<usize>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<usize>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid usize value '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}
