//! Landing fetched batches in object storage
//!
//! A batch is written twice: once verbatim as a JSON array (the raw zone)
//! and once as Parquet, one file per year/month partition of
//! `created_date` (the processed zone). Every object key carries the run id
//! so repeated runs on the same day never overwrite each other.
//!
//! ```text
//! raw/2024/06/15/data_<run_id>.json
//! processed/year=2024/month=06/data_2024-06-15_<run_id>.parquet
//! processed/unpartitioned/data_2024-06-15_<run_id>.parquet
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::PersistError;
use crate::record::{PartitionKey, RecordBatch};
use crate::storage::Storage;

pub mod parquet;

const JSON_CONTENT_TYPE: &str = "application/json";
const PARQUET_CONTENT_TYPE: &str = "application/vnd.apache.parquet";

/// Identity of the run a batch belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistContext {
    pub run_id: Uuid,
    /// Invocation start; dates the object keys
    pub run_started: DateTime<Utc>,
}

impl PersistContext {
    pub fn new(run_started: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            run_started,
        }
    }
}

/// Which bucket an object belongs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Zone {
    Raw,
    Processed,
}

/// One object to upload
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedObject {
    pub zone: Zone,
    pub key: String,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    pub records: usize,
}

/// What a successful persist wrote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub records: usize,
    pub keys: Vec<String>,
}

/// Transform-and-store collaborator.
///
/// Synchronous from the caller's point of view: `Ok` means every object is
/// durably stored. Any failure fails the whole batch.
#[async_trait]
pub trait Persister: Send + Sync {
    async fn persist(
        &self,
        batch: &RecordBatch,
        ctx: &PersistContext,
    ) -> Result<PersistReport, PersistError>;
}

pub fn raw_key(ctx: &PersistContext) -> String {
    format!(
        "raw/{}/data_{}.json",
        ctx.run_started.format("%Y/%m/%d"),
        ctx.run_id
    )
}

pub fn processed_key(partition: Option<PartitionKey>, ctx: &PersistContext) -> String {
    let prefix = match partition {
        Some(partition) => partition.to_string(),
        None => "unpartitioned".to_string(),
    };
    format!(
        "processed/{}/data_{}_{}.parquet",
        prefix,
        ctx.run_started.format("%Y-%m-%d"),
        ctx.run_id
    )
}

/// Encode a batch into the objects that land it. Empty batches plan nothing.
pub fn plan(batch: &RecordBatch, ctx: &PersistContext) -> Result<Vec<PlannedObject>, PersistError> {
    if batch.is_empty() {
        return Ok(Vec::new());
    }

    let raw = serde_json::to_vec(batch.records()).map_err(|e| PersistError::Encode {
        what: "raw JSON".to_string(),
        reason: e.to_string(),
    })?;

    let mut objects = vec![PlannedObject {
        zone: Zone::Raw,
        key: raw_key(ctx),
        content_type: JSON_CONTENT_TYPE,
        body: raw,
        records: batch.len(),
    }];

    for (partition, records) in batch.partitions() {
        objects.push(PlannedObject {
            zone: Zone::Processed,
            key: processed_key(partition, ctx),
            content_type: PARQUET_CONTENT_TYPE,
            body: parquet::encode(&records)?.to_vec(),
            records: records.len(),
        });
    }

    Ok(objects)
}

/// Writes the raw and processed zones to two S3 buckets
#[derive(Clone)]
pub struct S3Persister {
    raw: Storage,
    processed: Storage,
}

impl S3Persister {
    pub fn new(raw: Storage, processed: Storage) -> Self {
        Self { raw, processed }
    }

    fn storage(&self, zone: Zone) -> &Storage {
        match zone {
            Zone::Raw => &self.raw,
            Zone::Processed => &self.processed,
        }
    }
}

#[async_trait]
impl Persister for S3Persister {
    #[instrument(skip(self, batch, ctx), fields(records = batch.len(), run_id = %ctx.run_id))]
    async fn persist(
        &self,
        batch: &RecordBatch,
        ctx: &PersistContext,
    ) -> Result<PersistReport, PersistError> {
        let objects = plan(batch, ctx)?;
        let mut report = PersistReport {
            records: batch.len(),
            keys: Vec::with_capacity(objects.len()),
        };

        for object in objects {
            let storage = self.storage(object.zone);
            let uri = storage.uri(&object.key);
            storage
                .upload(&object.key, object.body, object.content_type)
                .await
                .map_err(|e| PersistError::Upload {
                    key: uri.clone(),
                    reason: format!("{:#}", e),
                })?;
            info!(records = object.records, "Landed {}", uri);
            report.keys.push(uri);
        }

        Ok(report)
    }
}

/// Keeps planned objects in memory; can be told to fail
#[derive(Debug, Default)]
pub struct InMemoryPersister {
    objects: Mutex<BTreeMap<String, PlannedObject>>,
    batches: Mutex<Vec<RecordBatch>>,
    fail: AtomicBool,
}

impl InMemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Batches persisted so far
    pub fn batches(&self) -> Vec<RecordBatch> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Stored objects keyed by object key
    pub fn objects(&self) -> BTreeMap<String, PlannedObject> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Persister for InMemoryPersister {
    async fn persist(
        &self,
        batch: &RecordBatch,
        ctx: &PersistContext,
    ) -> Result<PersistReport, PersistError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PersistError::Upload {
                key: raw_key(ctx),
                reason: "injected persist failure".to_string(),
            });
        }

        let objects = plan(batch, ctx)?;
        let keys = objects.iter().map(|o| o.key.clone()).collect();

        let mut stored = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        for object in objects {
            stored.insert(object.key.clone(), object);
        }
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(batch.clone());

        Ok(PersistReport {
            records: batch.len(),
            keys,
        })
    }
}
