//! Watermark persistence
//!
//! The watermark is a single JSON document at a fixed location recording the
//! upper bound of source data already durably landed:
//!
//! ```json
//! { "last_run_timestamp": "2024-06-01T06:00:00Z", "updated_at": "2024-06-01T06:03:12.5Z" }
//! ```
//!
//! It is overwritten, never appended, and only after the batch it covers has
//! been persisted. Absence is the normal state before the first successful
//! run. A document that exists but cannot be decoded is an error: treating it
//! as absent would silently trigger a full backfill.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::WatermarkError;

mod file;
mod s3;

pub use file::FileWatermarkStore;
pub use s3::S3WatermarkStore;

/// Last successfully processed point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Window end of the last run whose batch was persisted
    #[serde(with = "sr311_common::timestamp::lenient")]
    pub last_run_timestamp: DateTime<Utc>,
    /// When the watermark was written
    #[serde(with = "sr311_common::timestamp::lenient")]
    pub updated_at: DateTime<Utc>,
}

impl Watermark {
    pub fn new(last_run_timestamp: DateTime<Utc>, updated_at: DateTime<Utc>) -> Self {
        Self {
            last_run_timestamp,
            updated_at,
        }
    }

    pub fn to_json_bytes(&self) -> Vec<u8> {
        // Two string fields; serialization cannot fail.
        serde_json::to_vec_pretty(self).unwrap_or_default()
    }

    pub fn from_json_bytes(location: &str, bytes: &[u8]) -> Result<Self, WatermarkError> {
        serde_json::from_slice(bytes).map_err(|e| WatermarkError::Corrupt {
            location: location.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Durable home of the watermark document.
///
/// Implementations assume a single writer; the scheduler runs at most one
/// invocation at a time per watermark location.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Human-readable location for logs and errors
    fn location(&self) -> String;

    /// `Ok(None)` when no watermark has been written yet
    async fn read(&self) -> Result<Option<Watermark>, WatermarkError>;

    /// Replace the stored watermark
    async fn write(&self, watermark: &Watermark) -> Result<(), WatermarkError>;
}

/// Process-local store holding the serialized document.
///
/// Keeps the exact bytes written so callers can assert a failed run left the
/// store untouched.
#[derive(Debug, Default)]
pub struct InMemoryWatermarkStore {
    document: Mutex<Option<Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_watermark(watermark: Watermark) -> Self {
        let store = Self::new();
        *store.lock() = Some(watermark.to_json_bytes());
        store
    }

    /// Seed the store with an arbitrary document
    pub fn with_raw(bytes: impl Into<Vec<u8>>) -> Self {
        let store = Self::new();
        *store.lock() = Some(bytes.into());
        store
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Current document bytes
    pub fn raw(&self) -> Option<Vec<u8>> {
        self.lock().clone()
    }

    /// Successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Vec<u8>>> {
        self.document.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    fn location(&self) -> String {
        "memory://watermark".to_string()
    }

    async fn read(&self) -> Result<Option<Watermark>, WatermarkError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(WatermarkError::Read {
                location: self.location(),
                reason: "injected read failure".to_string(),
            });
        }

        match self.lock().as_deref() {
            Some(bytes) => Watermark::from_json_bytes(&self.location(), bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn write(&self, watermark: &Watermark) -> Result<(), WatermarkError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(WatermarkError::Write {
                location: self.location(),
                reason: "injected write failure".to_string(),
            });
        }

        *self.lock() = Some(watermark.to_json_bytes());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
