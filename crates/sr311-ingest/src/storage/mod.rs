use anyhow::{Context, Result};
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use tracing::{debug, info, instrument};

pub mod config;

/// Build an S3 client from [`config::StorageConfig`].
///
/// Static credentials are used when both keys are configured (MinIO, local
/// runs); otherwise the AWS default provider chain applies, which is what a
/// scheduled cloud deployment with an attached role expects.
pub async fn connect(config: &config::StorageConfig) -> Client {
    debug!(
        endpoint = ?config.endpoint,
        region = %config.region,
        path_style = config.path_style,
        static_credentials = config.static_credentials().is_some(),
        "Initializing S3 client"
    );

    let mut builder = match config.static_credentials() {
        Some((access_key, secret_key)) => {
            let credentials = Credentials::new(access_key, secret_key, None, None, "sr311-storage");
            aws_sdk_s3::Config::builder()
                .behavior_version_latest()
                .credentials_provider(credentials)
                .region(Region::new(config.region.clone()))
        }
        None => {
            let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .load()
                .await;
            aws_sdk_s3::config::Builder::from(&shared)
        }
    };

    builder = builder.force_path_style(config.path_style);
    if let Some(endpoint) = &config.endpoint {
        builder = builder.endpoint_url(endpoint);
    }

    Client::from_conf(builder.build())
}

/// Bucket-scoped object storage handle
#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// `s3://bucket/key` for logs and error messages
    pub fn uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    #[instrument(skip(self, data), fields(bucket = %self.bucket, size = data.len()))]
    pub async fn upload(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|| format!("Failed to upload {}", self.uri(key)))?;

        info!("Successfully uploaded to {}", self.uri(key));
        Ok(())
    }

    /// Download an object, returning `None` when the key does not exist
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn download_optional(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    debug!("No object at {}", self.uri(key));
                    return Ok(None);
                }
                return Err(err).with_context(|| format!("Failed to download {}", self.uri(key)));
            }
        };

        let data = response
            .body
            .collect()
            .await
            .context("Failed to read S3 response body")?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from {}", data.len(), self.uri(key));
        Ok(Some(data))
    }
}
