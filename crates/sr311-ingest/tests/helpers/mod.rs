//! Shared fixtures for the ingestion integration tests
//!
//! A [`Pipeline`] wires the orchestrator to in-memory collaborators and a
//! manually driven clock, so runs can be replayed deterministically.

#![allow(dead_code, clippy::unwrap_used)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use sr311_common::timestamp::format_floating;
use sr311_ingest::{
    clock::FixedClock,
    fetcher::{PaginatedFetcher, RetryPolicy},
    orchestrator::IngestionOrchestrator,
    persist::InMemoryPersister,
    record::Record,
    source::{InMemorySource, SourceClient},
    watermark::{InMemoryWatermarkStore, Watermark, WatermarkStore},
};
use std::sync::Arc;

/// Fixed "now" used by most scenarios
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 15, 6, 0, 0).unwrap()
}

/// One open service request created at `created`
pub fn record(id: usize, created: DateTime<Utc>) -> Record {
    json!({
        "unique_key": format!("{:08}", id),
        "status": "Open",
        "complaint_type": "Noise - Residential",
        "created_date": format_floating(created),
        "latitude": "40.7128",
        "longitude": "-74.0060"
    })
    .as_object()
    .cloned()
    .unwrap()
}

/// `count` records spaced one minute apart, ending `before` ahead of `end`
pub fn records_before(end: DateTime<Utc>, count: usize, before: Duration) -> Vec<Record> {
    (0..count)
        .map(|i| record(i, end - before - Duration::minutes((count - i) as i64)))
        .collect()
}

pub struct Pipeline {
    pub store: Arc<InMemoryWatermarkStore>,
    pub source: Arc<InMemorySource>,
    pub persister: Arc<InMemoryPersister>,
    pub clock: Arc<FixedClock>,
    pub orchestrator: IngestionOrchestrator,
}

impl Pipeline {
    pub fn new(records: Vec<Record>) -> Self {
        Self::with_store(InMemoryWatermarkStore::new(), records)
    }

    pub fn with_watermark(last_run: DateTime<Utc>, records: Vec<Record>) -> Self {
        Self::with_store(
            InMemoryWatermarkStore::with_watermark(Watermark::new(last_run, last_run)),
            records,
        )
    }

    pub fn with_store(store: InMemoryWatermarkStore, records: Vec<Record>) -> Self {
        let source = Arc::new(InMemorySource::new(records));
        Self::with_source(store, source.clone(), source)
    }

    /// `client` is what the fetcher talks to; `source` stays reachable for
    /// assertions and may be the same object.
    pub fn with_source(
        store: InMemoryWatermarkStore,
        source: Arc<InMemorySource>,
        client: Arc<dyn SourceClient>,
    ) -> Self {
        let store = Arc::new(store);
        let persister = Arc::new(InMemoryPersister::new());
        let clock = Arc::new(FixedClock::new(t0()));
        let orchestrator = IngestionOrchestrator::new(
            store.clone(),
            PaginatedFetcher::new(client, RetryPolicy::default()),
            persister.clone(),
            clock.clone(),
        );

        Self {
            store,
            source,
            persister,
            clock,
            orchestrator,
        }
    }

    pub async fn watermark(&self) -> Option<Watermark> {
        self.store.read().await.unwrap()
    }
}
