//! Configuration module for the consumer-group engine.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [redis]
//! url = "${REDIS_URL}"
//!
//! [stream]
//! name = "orders"
//! group = "billing"
//! consumer = "billing-worker"
//! workers = 4
//! shape = "record"
//!
//! [reclaim]
//! min_idle_ms = 60000
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::decoder::TargetShape;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub reclaim: ReclaimConfig,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Upper bound on pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_max_connections() -> usize {
    16
}

/// Which stream is consumed, by which group, and how entries are decoded.
#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default = "default_stream_name")]
    pub name: String,

    #[serde(default = "default_group")]
    pub group: String,

    /// Base consumer name; live workers are named `<consumer>-<index>`.
    /// When unset the worker binary derives one from the hostname.
    #[serde(default)]
    pub consumer: Option<String>,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub shape: TargetShape,

    /// Entry field holding the payload; the first field when unset.
    #[serde(default)]
    pub payload_field: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: default_stream_name(),
            group: default_group(),
            consumer: None,
            workers: default_workers(),
            shape: TargetShape::default(),
            payload_field: None,
        }
    }
}

fn default_stream_name() -> String {
    "events".to_string()
}

fn default_group() -> String {
    "workers".to_string()
}

fn default_workers() -> usize {
    1
}

/// Live consumption loop settings
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerConfig {
    /// Entries requested per read
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Block time of the first read
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Block time once the stream has gone quiet
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Replay the consumer's own pending entries before reading new ones
    #[serde(default = "default_true")]
    pub replay_pending: bool,
}

impl ConsumerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            read_timeout_ms: default_read_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            replay_pending: true,
        }
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_idle_timeout_ms() -> u64 {
    10000
}

fn default_true() -> bool {
    true
}

/// Pending reclaimer settings
#[derive(Debug, Deserialize, Clone)]
pub struct ReclaimConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consumer identity that takes over abandoned entries
    #[serde(default = "default_claim_consumer")]
    pub consumer: String,

    /// Pending entries inspected per scan
    #[serde(default = "default_pending_batch")]
    pub batch_size: usize,

    /// Entries idle for less than this are left to their owner
    #[serde(default = "default_min_idle_ms")]
    pub min_idle_ms: u64,

    /// Pause between scans
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Deliveries after which an entry is dead-lettered instead of retried.
    /// Unset means retry forever.
    #[serde(default)]
    pub max_deliveries: Option<u64>,

    #[serde(default)]
    pub dead_letter_stream: Option<String>,
}

impl ReclaimConfig {
    pub fn min_idle(&self) -> Duration {
        Duration::from_millis(self.min_idle_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// The delivery bound and target stream, when dead-lettering is on.
    pub fn dead_letter(&self) -> Option<(u64, &str)> {
        match (self.max_deliveries, self.dead_letter_stream.as_deref()) {
            (Some(max), Some(stream)) => Some((max, stream)),
            _ => None,
        }
    }
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            consumer: default_claim_consumer(),
            batch_size: default_pending_batch(),
            min_idle_ms: default_min_idle_ms(),
            interval_ms: default_interval_ms(),
            max_deliveries: None,
            dead_letter_stream: None,
        }
    }
}

fn default_claim_consumer() -> String {
    crate::DEFAULT_CLAIM_CONSUMER.to_string()
}

fn default_pending_batch() -> usize {
    100
}

fn default_min_idle_ms() -> u64 {
    60000
}

fn default_interval_ms() -> u64 {
    30000
}

/// Retry delays, in milliseconds, by error class
#[derive(Debug, Deserialize, Clone)]
pub struct BackoffConfig {
    #[serde(default = "default_timeout_backoff_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_long_backoff_ms")]
    pub missing_key_ms: u64,

    #[serde(default = "default_long_backoff_ms")]
    pub error_ms: u64,

    /// Wait before retrying group creation on a stream that does not exist
    #[serde(default = "default_long_backoff_ms")]
    pub missing_stream_ms: u64,

    /// Give up group creation after this many missing-stream retries.
    /// Unset means keep waiting until shutdown.
    #[serde(default)]
    pub missing_stream_retries: Option<u32>,
}

impl BackoffConfig {
    pub fn missing_stream(&self) -> Duration {
        Duration::from_millis(self.missing_stream_ms)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_backoff_ms(),
            missing_key_ms: default_long_backoff_ms(),
            error_ms: default_long_backoff_ms(),
            missing_stream_ms: default_long_backoff_ms(),
            missing_stream_retries: None,
        }
    }
}

fn default_timeout_backoff_ms() -> u64 {
    3000
}

fn default_long_backoff_ms() -> u64 {
    10000
}

impl EngineConfig {
    /// Load configuration from the default path or STREAMGROUP_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = env::var("STREAMGROUP_CONFIG")
            .unwrap_or_else(|_| crate::DEFAULT_CONFIG_PATH.to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;

        info!(
            stream = %config.stream.name,
            group = %config.stream.group,
            workers = config.stream.workers,
            shape = %config.stream.shape,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        debug!("Parsing TOML configuration");
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.name.is_empty() {
            return Err(ConfigError::MissingField("stream.name".to_string()));
        }
        if self.stream.group.is_empty() {
            return Err(ConfigError::MissingField("stream.group".to_string()));
        }
        if self.consumer.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "consumer.batch_size must be at least 1".to_string(),
            ));
        }
        if self.reclaim.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "reclaim.batch_size must be at least 1".to_string(),
            ));
        }
        if self.reclaim.consumer.is_empty() {
            return Err(ConfigError::MissingField("reclaim.consumer".to_string()));
        }

        if let Some(base) = &self.stream.consumer {
            if base.is_empty() {
                return Err(ConfigError::ValidationError(
                    "stream.consumer must not be empty".to_string(),
                ));
            }
            if self.reclaim.consumer.starts_with(&format!("{base}-")) {
                return Err(ConfigError::ValidationError(format!(
                    "reclaim consumer '{}' collides with live consumers '{}-<n>'",
                    self.reclaim.consumer, base
                )));
            }
        }

        match (&self.reclaim.max_deliveries, &self.reclaim.dead_letter_stream) {
            (Some(0), _) => {
                return Err(ConfigError::ValidationError(
                    "reclaim.max_deliveries must be at least 1".to_string(),
                ));
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(ConfigError::ValidationError(
                    "reclaim.max_deliveries and reclaim.dead_letter_stream must be set together"
                        .to_string(),
                ));
            }
            (Some(_), Some(dlq)) if *dlq == self.stream.name => {
                return Err(ConfigError::ValidationError(
                    "reclaim.dead_letter_stream must differ from stream.name".to_string(),
                ));
            }
            _ => {}
        }

        if self.consumer.idle_timeout_ms < self.consumer.read_timeout_ms {
            warn!(
                read_timeout_ms = self.consumer.read_timeout_ms,
                idle_timeout_ms = self.consumer.idle_timeout_ms,
                "Idle timeout is shorter than the initial read timeout"
            );
        }

        if self.redis.url.contains("${") {
            warn!(
                url = %self.redis.url,
                "Redis URL contains unsubstituted environment variable"
            );
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    static ENV_VAR: OnceLock<Regex> = OnceLock::new();
    let re = ENV_VAR.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
    });

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("STREAMGROUP_TEST_VAR", "substituted_value");
        let input = "url = \"${STREAMGROUP_TEST_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"substituted_value\"");
        env::remove_var("STREAMGROUP_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "url = \"${NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [stream]
            name = "orders"
            group = "billing"
        "#;

        let config = EngineConfig::from_toml(toml).unwrap();
        assert_eq!(config.stream.name, "orders");
        assert_eq!(config.stream.group, "billing");
        assert_eq!(config.stream.shape, TargetShape::Record);
        assert_eq!(config.redis.url, "redis://localhost:6379");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [redis]
            url = "redis://cache:6380/2"
            max_connections = 4

            [stream]
            name = "counters"
            group = "agg"
            consumer = "agg-node"
            workers = 3
            shape = "uint64"
            payload_field = "value"

            [consumer]
            batch_size = 50
            read_timeout_ms = 500
            idle_timeout_ms = 5000
            replay_pending = false

            [reclaim]
            consumer = "_rescue"
            batch_size = 20
            min_idle_ms = 1000
            interval_ms = 2000
            max_deliveries = 5
            dead_letter_stream = "counters:dlq"

            [backoff]
            timeout_ms = 100
            missing_stream_retries = 3
        "#;

        let config = EngineConfig::from_toml(toml).unwrap();
        assert_eq!(config.redis.max_connections, 4);
        assert_eq!(config.stream.consumer.as_deref(), Some("agg-node"));
        assert_eq!(config.stream.workers, 3);
        assert_eq!(config.stream.shape, TargetShape::Unsigned);
        assert_eq!(config.stream.payload_field.as_deref(), Some("value"));
        assert_eq!(config.consumer.batch_size, 50);
        assert_eq!(config.consumer.read_timeout(), Duration::from_millis(500));
        assert!(!config.consumer.replay_pending);
        assert_eq!(config.reclaim.consumer, "_rescue");
        assert_eq!(config.reclaim.min_idle(), Duration::from_secs(1));
        assert_eq!(config.reclaim.dead_letter(), Some((5, "counters:dlq")));
        assert_eq!(config.backoff.timeout_ms, 100);
        assert_eq!(config.backoff.missing_key_ms, 10000);
        assert_eq!(config.backoff.missing_stream_retries, Some(3));
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.consumer.batch_size, 10);
        assert_eq!(config.consumer.read_timeout_ms, 1000);
        assert_eq!(config.consumer.idle_timeout_ms, 10000);
        assert_eq!(config.reclaim.consumer, "_xclaim");
        assert_eq!(config.reclaim.batch_size, 100);
        assert_eq!(config.reclaim.min_idle_ms, 60000);
        assert_eq!(config.reclaim.interval_ms, 30000);
        assert_eq!(config.reclaim.dead_letter(), None);
        assert_eq!(config.backoff.timeout_ms, 3000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unsupported_shape_rejected() {
        let toml = r#"
            [stream]
            shape = "float64"
        "#;

        let result = EngineConfig::from_toml(toml);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validation_zero_batch() {
        let toml = r#"
            [consumer]
            batch_size = 0
        "#;

        let result = EngineConfig::from_toml(toml);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_half_configured_dead_letter() {
        let toml = r#"
            [reclaim]
            max_deliveries = 3
        "#;

        let result = EngineConfig::from_toml(toml);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_reclaim_identity_collision() {
        let toml = r#"
            [stream]
            consumer = "node"

            [reclaim]
            consumer = "node-0"
        "#;

        let result = EngineConfig::from_toml(toml);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_empty_stream_name() {
        let toml = r#"
            [stream]
            name = ""
        "#;

        let result = EngineConfig::from_toml(toml);
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }
}
