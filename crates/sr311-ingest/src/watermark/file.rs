use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

use super::{Watermark, WatermarkStore};
use crate::error::WatermarkError;

/// Watermark kept in a local JSON file, for runs outside the cloud
/// deployment. Writes go through a sibling temp file and a rename so a crash
/// mid-write never leaves a truncated document behind.
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn write_error(&self, err: impl std::fmt::Display) -> WatermarkError {
        WatermarkError::Write {
            location: self.location(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    async fn read(&self) -> Result<Option<Watermark>, WatermarkError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Watermark::from_json_bytes(&self.location(), &bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No watermark file yet");
                Ok(None)
            }
            Err(e) => Err(WatermarkError::Read {
                location: self.location(),
                reason: e.to_string(),
            }),
        }
    }

    async fn write(&self, watermark: &Watermark) -> Result<(), WatermarkError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.write_error(e))?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, watermark.to_json_bytes())
            .await
            .map_err(|e| self.write_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.write_error(e))?;

        info!(path = %self.path.display(), "Saved watermark");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_absent() {
        let dir = TempDir::new().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("state.json"));
        assert_eq!(store.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("pipeline_state/last_run.json"));
        let watermark = Watermark::new(
            Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            Utc::now(),
        );

        store.write(&watermark).await.unwrap();
        assert_eq!(store.read().await.unwrap(), Some(watermark));
        assert!(!dir.path().join("pipeline_state/last_run.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_garbage_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();

        let store = FileWatermarkStore::new(&path);
        assert!(matches!(
            store.read().await,
            Err(WatermarkError::Corrupt { .. })
        ));
    }
}
