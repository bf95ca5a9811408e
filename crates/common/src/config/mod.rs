//! Configuration management for CiteGraph services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default.toml, config/{APP_ENV}.toml, config/local.toml)
//! - Default values

use crate::errors::{AppError, Result};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Database configuration
    pub database: DatabaseConfig,

    /// External bibliographic API configuration
    #[serde(default)]
    pub bibliographic: BibliographicConfig,

    /// Durable priority queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Priority weighting constants
    #[serde(default)]
    pub weight: WeightConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DatabaseConfig {
    /// Database URL (postgres://... in production, sqlite::memory: in tests)
    #[validate(length(min = 1))]
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    #[validate(range(min = 1))]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BibliographicConfig {
    /// API base URL
    #[serde(default = "default_api_base")]
    #[validate(length(min = 1))]
    pub base_url: String,

    /// API key, sent as `x-api-key` when present
    pub api_key: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,

    /// Sustained request rate against the API
    #[serde(default = "default_requests_per_second")]
    #[validate(range(min = 1))]
    pub requests_per_second: u32,

    /// Concurrency ceiling for in-flight API calls, independent of worker count
    #[serde(default = "default_max_concurrent_requests")]
    #[validate(range(min = 1))]
    pub max_concurrent_requests: usize,

    /// Page size for reference/citation listing
    #[serde(default = "default_page_size")]
    #[validate(range(min = 1, max = 1000))]
    pub page_size: u32,

    /// Maximum neighbors collected per direction
    #[serde(default = "default_max_neighbors")]
    pub max_neighbors: usize,

    /// Upper bound on in-process transport retries for one request
    #[serde(default = "default_transport_retry_secs")]
    pub transport_retry_max_elapsed_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct QueueConfig {
    /// Failures tolerated before an entry becomes terminally failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Lease granted to a worker for a processing entry (seconds)
    #[serde(default = "default_lease_secs")]
    #[validate(range(min = 1))]
    pub lease_secs: u64,

    /// First retry delay in milliseconds
    #[serde(default = "default_backoff_initial_ms")]
    #[validate(range(min = 1))]
    pub backoff_initial_ms: u64,

    /// Cap on computed retry delays in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    #[validate(range(min = 1))]
    pub backoff_max_ms: u64,

    /// Growth factor between consecutive retries
    #[serde(default = "default_backoff_multiplier")]
    #[validate(range(min = 1.0))]
    pub backoff_multiplier: f64,

    /// Fraction of the delay randomized away (0 disables jitter)
    #[serde(default = "default_backoff_jitter")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub backoff_jitter: f64,

    /// Ceiling on a server-requested retry delay (seconds)
    #[serde(default = "default_max_retry_after")]
    #[validate(range(min = 1))]
    pub max_retry_after_secs: u64,

    /// How often the lease sweeper runs (seconds)
    #[serde(default = "default_reclaim_interval")]
    #[validate(range(min = 1))]
    pub reclaim_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct WeightConfig {
    /// Geometric decay applied per hop from the seed
    #[serde(default = "default_distance_decay")]
    #[validate(range(exclusive_min = 0.0, exclusive_max = 1.0))]
    pub distance_decay: f64,

    /// Age penalty per year
    #[serde(default = "default_k_recency")]
    #[validate(range(min = 0.0))]
    pub k_recency: f64,

    /// Lower bound for the citation factor
    #[serde(default = "default_citation_floor")]
    #[validate(range(exclusive_min = 0.0))]
    pub citation_floor: f64,

    /// Priority given to user-supplied seeds
    #[serde(default = "default_seed_priority")]
    #[validate(range(exclusive_min = 0.0))]
    pub seed_priority: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CrawlerConfig {
    /// Number of concurrent discovery workers
    #[serde(default = "default_workers")]
    #[validate(range(min = 1))]
    pub workers: usize,

    /// Idle wait between polls of an empty queue (milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Exit once no pending or processing work remains
    #[serde(default = "default_stop_when_drained")]
    pub stop_when_drained: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name attached to log lines
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_max_connections() -> u32 { 10 }
fn default_min_connections() -> u32 { 1 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_api_base() -> String { "https://api.semanticscholar.org/graph/v1".to_string() }
fn default_api_timeout() -> u64 { 30 }
fn default_requests_per_second() -> u32 { 1 }
fn default_max_concurrent_requests() -> usize { 2 }
fn default_page_size() -> u32 { 100 }
fn default_max_neighbors() -> usize { 500 }
fn default_transport_retry_secs() -> u64 { 20 }
fn default_max_retries() -> u32 { 5 }
fn default_lease_secs() -> u64 { 300 }
fn default_backoff_initial_ms() -> u64 { 2_000 }
fn default_backoff_max_ms() -> u64 { 600_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_backoff_jitter() -> f64 { 0.5 }
fn default_max_retry_after() -> u64 { 86_400 }
fn default_reclaim_interval() -> u64 { 60 }
fn default_distance_decay() -> f64 { 0.5 }
fn default_k_recency() -> f64 { 0.05 }
fn default_citation_floor() -> f64 { 0.1 }
fn default_seed_priority() -> f64 { 1_000.0 }
fn default_workers() -> usize { 4 }
fn default_poll_interval() -> u64 { 1_000 }
fn default_stop_when_drained() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "citegraph-crawler".to_string() }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with defaults
            .set_default("database.url", "postgres://localhost/citegraph")?

            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__QUEUE__MAX_RETRIES=8
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        config.try_deserialize()
    }

    /// Check every section's numeric ranges
    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.bibliographic.validate()?;
        self.queue.validate()?;
        self.weight.validate()?;
        self.crawler.validate()?;

        if self.queue.backoff_max_ms < self.queue.backoff_initial_ms {
            return Err(AppError::Configuration {
                message: "queue.backoff_max_ms must be >= queue.backoff_initial_ms".to_string(),
            });
        }

        Ok(())
    }

    /// Get lease duration
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.queue.lease_secs)
    }

    /// Get lease sweeper interval
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.queue.reclaim_interval_secs)
    }

    /// Get idle poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.crawler.poll_interval_ms)
    }
}

impl Default for BibliographicConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base(),
            api_key: None,
            timeout_secs: default_api_timeout(),
            requests_per_second: default_requests_per_second(),
            max_concurrent_requests: default_max_concurrent_requests(),
            page_size: default_page_size(),
            max_neighbors: default_max_neighbors(),
            transport_retry_max_elapsed_secs: default_transport_retry_secs(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            lease_secs: default_lease_secs(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_jitter: default_backoff_jitter(),
            max_retry_after_secs: default_max_retry_after(),
            reclaim_interval_secs: default_reclaim_interval(),
        }
    }
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            distance_decay: default_distance_decay(),
            k_recency: default_k_recency(),
            citation_floor: default_citation_floor(),
            seed_priority: default_seed_priority(),
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval(),
            stop_when_drained: default_stop_when_drained(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgres://localhost/citegraph".to_string(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
            },
            bibliographic: BibliographicConfig::default(),
            queue: QueueConfig::default(),
            weight: WeightConfig::default(),
            crawler: CrawlerConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}
