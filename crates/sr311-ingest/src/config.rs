//! Ingestion configuration
//!
//! Deployment-level settings for the ingestion job, loaded from environment
//! variables (a `.env` file is honoured for local runs). Per-invocation knobs
//! such as `max_records` live in [`crate::request::RunRequest`] instead.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::fetcher::RetryPolicy;
use crate::storage::config::StorageConfig;

// ============================================================================
// Defaults
// ============================================================================

/// Origin of the open data portal.
pub const DEFAULT_SOCRATA_BASE_URL: &str = "https://data.cityofnewyork.us";

/// 311 Service Requests from 2010 to Present.
pub const DEFAULT_DATASET_ID: &str = "erm2-nwe9";

/// Per-request timeout in seconds. Large pages from the portal can be slow.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Attempts per page before the fetch is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Backoff base delay in milliseconds.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 2_000;

/// Backoff ceiling in milliseconds.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Bucket for raw JSON batches.
pub const DEFAULT_RAW_BUCKET: &str = "311-raw-data";

/// Bucket for partitioned Parquet output.
pub const DEFAULT_PROCESSED_BUCKET: &str = "311-processed-data";

/// Well-known key of the watermark document.
pub const DEFAULT_STATE_FILE_KEY: &str = "pipeline_state/last_run_timestamp.json";

/// Wall-clock budget for one invocation (15 minutes).
pub const DEFAULT_RUN_BUDGET_SECS: u64 = 900;

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub source: SourceConfig,
    pub retry: RetryConfig,
    pub output: OutputConfig,
    pub storage: StorageConfig,
    /// Execution budget in seconds; exceeding it fails the run
    pub run_budget_secs: u64,
}

/// Source API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub base_url: String,
    pub dataset_id: String,
    /// Application token; raises the portal's rate limit
    #[serde(skip_serializing)]
    pub app_token: Option<String>,
    pub request_timeout_secs: u64,
}

/// Retry settings for transient source failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Where fetched data and the watermark land
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub raw_bucket: String,
    pub processed_bucket: String,
    pub state_bucket: String,
    pub state_key: String,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl IngestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let processed_bucket = env_string("S3_PROCESSED_BUCKET", DEFAULT_PROCESSED_BUCKET);

        let config = Self {
            source: SourceConfig {
                base_url: env_string("SOCRATA_BASE_URL", DEFAULT_SOCRATA_BASE_URL),
                dataset_id: env_string("SOCRATA_DATASET_ID", DEFAULT_DATASET_ID),
                app_token: std::env::var("SOCRATA_APP_TOKEN")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
                request_timeout_secs: env_parse(
                    "SOURCE_REQUEST_TIMEOUT_SECS",
                    DEFAULT_REQUEST_TIMEOUT_SECS,
                ),
            },
            retry: RetryConfig {
                max_attempts: env_parse("SOURCE_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
                base_delay_ms: env_parse("SOURCE_RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS),
                max_delay_ms: env_parse("SOURCE_RETRY_MAX_DELAY_MS", DEFAULT_RETRY_MAX_DELAY_MS),
            },
            output: OutputConfig {
                raw_bucket: env_string("S3_RAW_BUCKET", DEFAULT_RAW_BUCKET),
                state_bucket: env_string("S3_STATE_BUCKET", &processed_bucket),
                processed_bucket,
                state_key: env_string("STATE_FILE_KEY", DEFAULT_STATE_FILE_KEY),
            },
            storage: StorageConfig::from_env(),
            run_budget_secs: env_parse("RUN_BUDGET_SECS", DEFAULT_RUN_BUDGET_SECS),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source.base_url.is_empty() || self.source.dataset_id.is_empty() {
            anyhow::bail!("SOCRATA_BASE_URL and SOCRATA_DATASET_ID cannot be empty");
        }
        if self.source.request_timeout_secs == 0 {
            anyhow::bail!("SOURCE_REQUEST_TIMEOUT_SECS must be greater than 0");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("SOURCE_MAX_ATTEMPTS must be greater than 0");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!(
                "SOURCE_RETRY_BASE_DELAY_MS ({}) cannot exceed SOURCE_RETRY_MAX_DELAY_MS ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            );
        }
        for (name, value) in [
            ("S3_RAW_BUCKET", &self.output.raw_bucket),
            ("S3_PROCESSED_BUCKET", &self.output.processed_bucket),
            ("S3_STATE_BUCKET", &self.output.state_bucket),
            ("STATE_FILE_KEY", &self.output.state_key),
        ] {
            if value.is_empty() {
                anyhow::bail!("{} cannot be empty", name);
            }
        }
        if self.run_budget_secs == 0 {
            anyhow::bail!("RUN_BUDGET_SECS must be greater than 0");
        }
        Ok(())
    }

    /// Get the execution budget as Duration
    pub fn run_budget(&self) -> Duration {
        Duration::from_secs(self.run_budget_secs)
    }
}

impl SourceConfig {
    /// Resource endpoint for the dataset, e.g. `.../resource/erm2-nwe9.json`
    pub fn resource_url(&self) -> String {
        format!(
            "{}/resource/{}.json",
            self.base_url.trim_end_matches('/'),
            self.dataset_id
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "SOCRATA_BASE_URL",
        "SOCRATA_DATASET_ID",
        "SOCRATA_APP_TOKEN",
        "SOURCE_MAX_ATTEMPTS",
        "S3_RAW_BUCKET",
        "S3_PROCESSED_BUCKET",
        "S3_STATE_BUCKET",
        "STATE_FILE_KEY",
        "RUN_BUDGET_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = IngestConfig::from_env().unwrap();

        assert_eq!(
            config.source.resource_url(),
            "https://data.cityofnewyork.us/resource/erm2-nwe9.json"
        );
        assert_eq!(config.retry.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.output.raw_bucket, DEFAULT_RAW_BUCKET);
        assert_eq!(config.output.state_bucket, DEFAULT_PROCESSED_BUCKET);
        assert_eq!(config.output.state_key, DEFAULT_STATE_FILE_KEY);
        assert_eq!(config.run_budget(), Duration::from_secs(900));
    }

    #[test]
    #[serial]
    fn test_state_bucket_follows_processed_bucket() {
        clear_env();
        std::env::set_var("S3_PROCESSED_BUCKET", "curated");
        let config = IngestConfig::from_env().unwrap();
        assert_eq!(config.output.state_bucket, "curated");

        std::env::set_var("S3_STATE_BUCKET", "state");
        let config = IngestConfig::from_env().unwrap();
        assert_eq!(config.output.processed_bucket, "curated");
        assert_eq!(config.output.state_bucket, "state");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_zero_attempts_rejected() {
        clear_env();
        std::env::set_var("SOURCE_MAX_ATTEMPTS", "0");
        assert!(IngestConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    fn test_resource_url_trims_trailing_slash() {
        let source = SourceConfig {
            base_url: "http://localhost:8080/".to_string(),
            dataset_id: "abcd-1234".to_string(),
            app_token: None,
            request_timeout_secs: 5,
        };
        assert_eq!(source.resource_url(), "http://localhost:8080/resource/abcd-1234.json");
    }
}
