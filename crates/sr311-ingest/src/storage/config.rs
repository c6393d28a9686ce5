use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;

/// S3 client settings shared by the watermark store and the persister.
///
/// Buckets are chosen per use (raw, processed, state), so they live in
/// [`crate::config::OutputConfig`] rather than here.
#[derive(Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    #[serde(skip_serializing)]
    pub access_key: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: env::var("S3_ENDPOINT").ok().filter(|s| !s.is_empty()),
            region: env::var("S3_REGION")
                .or_else(|_| env::var("AWS_REGION"))
                .unwrap_or_else(|_| "us-east-1".to_string()),
            access_key: env::var("S3_ACCESS_KEY").ok().filter(|s| !s.is_empty()),
            secret_key: env::var("S3_SECRET_KEY").ok().filter(|s| !s.is_empty()),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        }
    }

    /// Static credentials when both halves are configured
    pub fn static_credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_key, &self.secret_key) {
            (Some(access), Some(secret)) => Some((access.as_str(), secret.as_str())),
            _ => None,
        }
    }
}

// Keys never reach logs
impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("path_style", &self.path_style)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_output_redacts_keys() {
        let config = StorageConfig {
            endpoint: Some("http://localhost:9000".to_string()),
            region: "us-east-1".to_string(),
            access_key: Some("minio-access-id".to_string()),
            secret_key: Some("minio-secret-value".to_string()),
            path_style: true,
        };
        assert_eq!(
            config.static_credentials(),
            Some(("minio-access-id", "minio-secret-value"))
        );

        let formatted = format!("{:?}", config);
        assert!(!formatted.contains("minio-secret-value"));
        assert!(!formatted.contains("minio-access-id"));
        assert!(formatted.contains("http://localhost:9000"));
        assert!(formatted.contains("<redacted>"));
    }

    #[test]
    fn test_partial_credentials_fall_back_to_provider_chain() {
        let config = StorageConfig {
            endpoint: None,
            region: "us-east-2".to_string(),
            access_key: Some("AKIA".to_string()),
            secret_key: None,
            path_style: false,
        };
        assert!(config.static_credentials().is_none());
    }
}
