use async_trait::async_trait;
use tracing::{info, instrument};

use super::{Watermark, WatermarkStore};
use crate::error::WatermarkError;
use crate::storage::Storage;

/// Watermark document stored as a single S3 object
#[derive(Clone)]
pub struct S3WatermarkStore {
    storage: Storage,
    key: String,
}

impl S3WatermarkStore {
    pub fn new(storage: Storage, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
        }
    }
}

#[async_trait]
impl WatermarkStore for S3WatermarkStore {
    fn location(&self) -> String {
        self.storage.uri(&self.key)
    }

    #[instrument(skip(self), fields(location = %self.location()))]
    async fn read(&self) -> Result<Option<Watermark>, WatermarkError> {
        let bytes = self
            .storage
            .download_optional(&self.key)
            .await
            .map_err(|e| WatermarkError::Read {
                location: self.location(),
                reason: format!("{:#}", e),
            })?;

        match bytes {
            Some(bytes) => Watermark::from_json_bytes(&self.location(), &bytes).map(Some),
            None => {
                info!("No previous run found");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, watermark), fields(location = %self.location()))]
    async fn write(&self, watermark: &Watermark) -> Result<(), WatermarkError> {
        self.storage
            .upload(&self.key, watermark.to_json_bytes(), "application/json")
            .await
            .map_err(|e| WatermarkError::Write {
                location: self.location(),
                reason: format!("{:#}", e),
            })
    }
}
