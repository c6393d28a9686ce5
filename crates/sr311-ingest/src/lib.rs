//! SR311 Ingest Library
//!
//! Scheduled, watermark-driven ingestion of 311 service requests from a
//! paginated public data API into object storage.
//!
//! # Run lifecycle
//!
//! Each invocation reads the watermark, picks INITIAL (bounded backfill) or
//! INCREMENTAL (catch-up since the watermark) mode, pages through the source
//! under a record cap, lands the batch as raw JSON plus partitioned Parquet,
//! and only then advances the watermark.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sr311_ingest::{
//!     clock::SystemClock,
//!     fetcher::{PaginatedFetcher, RetryPolicy},
//!     handler,
//!     orchestrator::IngestionOrchestrator,
//!     persist::InMemoryPersister,
//!     source::InMemorySource,
//!     watermark::FileWatermarkStore,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let orchestrator = IngestionOrchestrator::new(
//!         Arc::new(FileWatermarkStore::new("./state/last_run_timestamp.json")),
//!         PaginatedFetcher::new(Arc::new(InMemorySource::default()), RetryPolicy::default()),
//!         Arc::new(InMemoryPersister::new()),
//!         Arc::new(SystemClock),
//!     );
//!
//!     let event = serde_json::json!({ "max_records": 100, "initial_lookback_days": 7 });
//!     let response = handler::handle(event, &orchestrator, std::time::Duration::from_secs(900)).await;
//!     println!("{}", serde_json::to_string_pretty(&response).unwrap_or_default());
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod clock;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod handler;
pub mod mode;
pub mod orchestrator;
pub mod persist;
pub mod record;
pub mod request;
pub mod source;
pub mod storage;
pub mod watermark;

pub use error::{IngestError, Result};
