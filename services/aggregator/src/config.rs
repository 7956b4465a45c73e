use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the aggregator service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 client configuration
    #[serde(default)]
    pub s3: S3Config,
    /// Source bucket configuration
    #[serde(default)]
    pub aggregation: AggregationConfig,
    /// Summary output configuration
    #[serde(default)]
    pub publish: PublishConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Prometheus exporter port; exporter disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
    /// Run the pipeline once and exit instead of ticking on a schedule
    #[serde(default)]
    pub run_once: bool,
    /// Interval between scheduled runs in seconds
    #[serde(default = "default_schedule_interval_secs")]
    pub schedule_interval_secs: u64,
}

/// S3 client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// What to do with a well-shaped file whose timestamp is not an integer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedTimestampPolicy {
    /// Abort the run
    #[default]
    Fail,
    /// Treat the file as invalid and leave it in place
    Skip,
}

/// Source bucket configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Buckets holding shipment event files, folded in this order
    #[serde(default = "default_source_buckets")]
    pub source_buckets: Vec<String>,
    #[serde(default)]
    pub malformed_timestamp: MalformedTimestampPolicy,
}

/// Summary output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PublishConfig {
    /// Bucket receiving one summary object per run
    #[serde(default = "default_summary_bucket")]
    pub summary_bucket: String,
    /// Prefix prepended to every summary key
    #[serde(default)]
    pub summary_prefix: String,
    /// Delay between existence checks in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Give up waiting for the summary after this many seconds
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

/// Longest accepted wait for a summary to become visible
pub const MAX_POLL_TIMEOUT_SECS: u64 = 60 * 60;

/// Longest accepted gap between scheduled runs
pub const MAX_SCHEDULE_INTERVAL_SECS: u64 = 24 * 60 * 60;

// Default value functions
fn default_service_name() -> String {
    "shipment-aggregator".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_schedule_interval_secs() -> u64 {
    15 * 60
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_source_buckets() -> Vec<String> {
    vec![
        "shipment-events-from-scanner".to_string(),
        "shipment-events-from-mobile-app".to_string(),
    ]
}

fn default_summary_bucket() -> String {
    "shipment-events-summary".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_poll_timeout_secs() -> u64 {
    60
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::File::with_name("config/aggregator")
                    .required(false)
            )
            .add_source(
                config::File::with_name("/etc/shipments/aggregator")
                    .required(false)
            )
            // AGGREGATOR__PUBLISH__SUMMARY_BUCKET -> publish.summary_bucket
            .add_source(
                config::Environment::with_prefix("AGGREGATOR")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("aggregation.source_buckets")
                    .try_parsing(true)
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.aggregation.source_buckets.is_empty() {
            return Err(ConfigError::MissingRequired(
                "aggregation.source_buckets".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for bucket in &self.aggregation.source_buckets {
            if bucket.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "aggregation.source_buckets".to_string(),
                    message: "bucket names must not be empty".to_string(),
                });
            }
            if !seen.insert(bucket.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: "aggregation.source_buckets".to_string(),
                    message: format!("duplicate bucket {}", bucket),
                });
            }
        }

        if self.publish.summary_bucket.trim().is_empty() {
            return Err(ConfigError::MissingRequired(
                "publish.summary_bucket".to_string(),
            ));
        }

        // Summaries would be folded back in as event files
        if seen.contains(self.publish.summary_bucket.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "publish.summary_bucket".to_string(),
                message: "summary bucket must not also be a source bucket".to_string(),
            });
        }

        if self.publish.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "publish.poll_interval_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.publish.poll_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "publish.poll_timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.publish.poll_timeout_secs > MAX_POLL_TIMEOUT_SECS {
            return Err(ConfigError::InvalidValue {
                key: "publish.poll_timeout_secs".to_string(),
                message: format!("must be at most {}", MAX_POLL_TIMEOUT_SECS),
            });
        }

        if self.poll_interval() > self.poll_timeout() {
            return Err(ConfigError::InvalidValue {
                key: "publish.poll_interval_ms".to_string(),
                message: "must not exceed publish.poll_timeout_secs".to_string(),
            });
        }

        if !self.service.run_once {
            if self.service.schedule_interval_secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "service.schedule_interval_secs".to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
            if self.service.schedule_interval_secs > MAX_SCHEDULE_INTERVAL_SECS {
                return Err(ConfigError::InvalidValue {
                    key: "service.schedule_interval_secs".to_string(),
                    message: format!("must be at most {}", MAX_SCHEDULE_INTERVAL_SECS),
                });
            }
        }

        Ok(())
    }

    /// Get the summary poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.publish.poll_interval_ms)
    }

    /// Get the summary poll timeout as Duration
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.publish.poll_timeout_secs)
    }

    /// Get the schedule interval as Duration
    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.service.schedule_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            s3: S3Config::default(),
            aggregation: AggregationConfig::default(),
            publish: PublishConfig::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: None,
            run_once: false,
            schedule_interval_secs: default_schedule_interval_secs(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            source_buckets: default_source_buckets(),
            malformed_timestamp: MalformedTimestampPolicy::default(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            summary_bucket: default_summary_bucket(),
            summary_prefix: String::new(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(
            config.aggregation.source_buckets,
            vec!["shipment-events-from-scanner", "shipment-events-from-mobile-app"]
        );
        assert_eq!(config.publish.summary_bucket, "shipment-events-summary");
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.poll_timeout(), Duration::from_secs(60));
        assert_eq!(config.schedule_interval(), Duration::from_secs(900));
        assert_eq!(
            config.aggregation.malformed_timestamp,
            MalformedTimestampPolicy::Fail
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_source_buckets() {
        let mut config = Config::default();
        config.aggregation.source_buckets.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_source_bucket() {
        let mut config = Config::default();
        config.aggregation.source_buckets = vec!["a".to_string(), "a".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_rejects_summary_bucket_in_sources() {
        let mut config = Config::default();
        config.publish.summary_bucket = "shipment-events-from-scanner".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_poll_settings() {
        let mut config = Config::default();
        config.publish.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.publish.poll_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_poll_settings() {
        let mut config = Config::default();
        config.publish.poll_timeout_secs = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "publish.poll_timeout_secs"
        ));

        let mut config = Config::default();
        config.publish.poll_timeout_secs = MAX_POLL_TIMEOUT_SECS;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.publish.poll_interval_ms = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "publish.poll_interval_ms"
        ));
    }

    #[test]
    fn test_rejects_oversized_schedule_interval() {
        let mut config = Config::default();
        config.service.schedule_interval_secs = u64::MAX;
        assert!(config.validate().is_err());

        config.service.run_once = true;
        assert!(config.validate().is_ok());
    }

    // The only test touching AGGREGATOR__* variables, so nothing races on them
    #[test]
    fn test_load_environment_overrides() {
        std::env::set_var("AGGREGATOR__AGGREGATION__SOURCE_BUCKETS", "scanner-a,app-b");
        std::env::set_var("AGGREGATOR__PUBLISH__SUMMARY_BUCKET", "summary-x");
        std::env::set_var("AGGREGATOR__PUBLISH__POLL_TIMEOUT_SECS", "30");

        let loaded = Config::load();

        std::env::set_var("AGGREGATOR__PUBLISH__POLL_TIMEOUT_SECS", "18446744073709551615");
        let oversized = Config::load();

        for name in [
            "AGGREGATOR__AGGREGATION__SOURCE_BUCKETS",
            "AGGREGATOR__PUBLISH__SUMMARY_BUCKET",
            "AGGREGATOR__PUBLISH__POLL_TIMEOUT_SECS",
        ] {
            std::env::remove_var(name);
        }

        let config = loaded.unwrap();
        assert_eq!(config.aggregation.source_buckets, vec!["scanner-a", "app-b"]);
        assert_eq!(config.publish.summary_bucket, "summary-x");
        assert_eq!(config.poll_timeout(), Duration::from_secs(30));

        assert!(oversized.is_err());
    }

    #[test]
    fn test_policy_deserialization() {
        let policy: MalformedTimestampPolicy = serde_json::from_str("\"skip\"").unwrap();
        assert_eq!(policy, MalformedTimestampPolicy::Skip);
    }
}
