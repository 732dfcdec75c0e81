//! Configuration for queries and the client

use crate::error::{QueryError, Result};
use crate::logger::{QueryLogger, TracingLogger};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Effective options of one query entry
///
/// `Duration::MAX` stands for "never": a `stale_time` of `Duration::MAX`
/// keeps data fresh forever and a `cache_time` of `Duration::MAX` disables
/// eviction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// How long settled data counts as fresh; zero means always refetch
    pub stale_time: Duration,

    /// How long an entry with no subscribers is retained
    pub cache_time: Duration,

    /// Number of attempts for a failing operation; zero disables retry wrapping
    pub retry: u32,

    /// Fixed delay between attempts
    pub retry_delay: Duration,

    /// Polling interval while subscribed; zero disables polling
    pub refetch_interval: Duration,

    /// Surface Loading and Error outcomes to the fetch caller
    pub suspense: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            // 5 minutes retention after the last subscriber leaves
            cache_time: Duration::from_secs(300),
            retry: 3,
            retry_delay: Duration::from_secs(1),
            refetch_interval: Duration::ZERO,
            suspense: false,
        }
    }
}

impl QueryOptions {
    /// Create a new builder for partial options
    pub fn builder() -> QueryOptionsBuilder {
        QueryOptionsBuilder::default()
    }

    /// Whether automatic polling is configured
    pub fn polls(&self) -> bool {
        !self.refetch_interval.is_zero()
    }

    /// Options for data that changes constantly
    pub fn realtime() -> Self {
        Self {
            stale_time: Duration::ZERO,
            cache_time: Duration::from_secs(60),
            retry: 1,
            retry_delay: Duration::from_millis(250),
            ..Default::default()
        }
    }

    /// Options for reference data that never goes stale on its own
    pub fn static_content() -> Self {
        Self {
            stale_time: Duration::MAX,
            cache_time: Duration::MAX,
            ..Default::default()
        }
    }

    /// Options that poll every `interval` while subscribed
    pub fn polling(interval: Duration) -> Self {
        Self {
            refetch_interval: interval,
            ..Default::default()
        }
    }
}

/// Partial query options: global defaults, per-call overrides and updates
///
/// Unset fields leave the base value untouched when merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptionsBuilder {
    pub stale_time: Option<Duration>,
    pub cache_time: Option<Duration>,
    pub retry: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub refetch_interval: Option<Duration>,
    pub suspense: Option<bool>,
}

impl QueryOptionsBuilder {
    /// Set the staleness window
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Set the retention after the last unsubscribe
    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }

    /// Set the attempt count
    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the delay between attempts
    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    /// Set the polling interval
    pub fn refetch_interval(mut self, refetch_interval: Duration) -> Self {
        self.refetch_interval = Some(refetch_interval);
        self
    }

    /// Enable or disable suspense signalling
    pub fn suspense(mut self, suspense: bool) -> Self {
        self.suspense = Some(suspense);
        self
    }

    /// Whether no field is set
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge the set fields over `base`
    pub fn merge_into(&self, base: &QueryOptions) -> QueryOptions {
        QueryOptions {
            stale_time: self.stale_time.unwrap_or(base.stale_time),
            cache_time: self.cache_time.unwrap_or(base.cache_time),
            retry: self.retry.unwrap_or(base.retry),
            retry_delay: self.retry_delay.unwrap_or(base.retry_delay),
            refetch_interval: self.refetch_interval.unwrap_or(base.refetch_interval),
            suspense: self.suspense.unwrap_or(base.suspense),
        }
    }

    /// Build options with unset fields taken from the defaults
    pub fn build(self) -> QueryOptions {
        self.merge_into(&QueryOptions::default())
    }
}

/// Client-wide configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Defaults merged under every per-call override
    pub default_options: QueryOptions,

    /// Soft limit on registry size; exceeding it only logs a warning
    pub max_entries_warning: Option<usize>,

    /// Sink for subscriber failures and advisory warnings
    pub logger: Arc<dyn QueryLogger>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_options: QueryOptions::default(),
            max_entries_warning: None,
            logger: Arc::new(TracingLogger),
        }
    }
}

impl ClientConfig {
    /// Create a new builder for client configuration
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_entries_warning == Some(0) {
            return Err(QueryError::Config(
                "max_entries_warning must be greater than 0".to_string(),
            ));
        }

        if self.default_options.retry > 0 && self.default_options.retry_delay == Duration::MAX {
            return Err(QueryError::Config(
                "retry_delay must be finite when retry is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from the environment (and a `.env` file if present)
    ///
    /// Recognised variables: `QUERY_STALE_TIME_MS`, `QUERY_CACHE_TIME_MS`,
    /// `QUERY_RETRY`, `QUERY_RETRY_DELAY_MS`, `QUERY_REFETCH_INTERVAL_MS`,
    /// `QUERY_SUSPENSE` and `QUERY_MAX_ENTRIES_WARNING`.
    pub fn from_env() -> Result<Self> {
        if dotenv::dotenv().is_ok() {
            debug!("Loaded query client settings from .env");
        }

        let mut options = QueryOptions::builder();
        if let Some(ms) = env_var::<u64>("QUERY_STALE_TIME_MS")? {
            options = options.stale_time(Duration::from_millis(ms));
        }
        if let Some(ms) = env_var::<u64>("QUERY_CACHE_TIME_MS")? {
            options = options.cache_time(Duration::from_millis(ms));
        }
        if let Some(retry) = env_var::<u32>("QUERY_RETRY")? {
            options = options.retry(retry);
        }
        if let Some(ms) = env_var::<u64>("QUERY_RETRY_DELAY_MS")? {
            options = options.retry_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = env_var::<u64>("QUERY_REFETCH_INTERVAL_MS")? {
            options = options.refetch_interval(Duration::from_millis(ms));
        }
        if let Some(suspense) = env_var::<bool>("QUERY_SUSPENSE")? {
            options = options.suspense(suspense);
        }

        let mut builder = ClientConfig::builder().default_options(options.build());
        if let Some(limit) = env_var::<usize>("QUERY_MAX_ENTRIES_WARNING")? {
            builder = builder.max_entries_warning(limit);
        }

        let config = builder.build();
        config.validate()?;
        Ok(config)
    }
}

fn env_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| QueryError::Config(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

/// Builder for client configuration
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    default_options: Option<QueryOptions>,
    max_entries_warning: Option<usize>,
    logger: Option<Arc<dyn QueryLogger>>,
}

impl ClientConfigBuilder {
    /// Set the global default options
    pub fn default_options(mut self, options: QueryOptions) -> Self {
        self.default_options = Some(options);
        self
    }

    /// Set the soft registry size limit
    pub fn max_entries_warning(mut self, limit: usize) -> Self {
        self.max_entries_warning = Some(limit);
        self
    }

    /// Set the logging sink
    pub fn logger(mut self, logger: Arc<dyn QueryLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Build the client configuration
    pub fn build(self) -> ClientConfig {
        let defaults = ClientConfig::default();

        ClientConfig {
            default_options: self.default_options.unwrap_or(defaults.default_options),
            max_entries_warning: self.max_entries_warning.or(defaults.max_entries_warning),
            logger: self.logger.unwrap_or(defaults.logger),
        }
    }
}
