//! Incremental ingestion state machine
//!
//! ```text
//! START -> MODE_SELECTED -> FETCHING -> PERSISTED -> WATERMARK_ADVANCED
//!                              |            |
//!                              +--> FAILED <+
//! ```
//!
//! Side effects happen in a fixed order: source reads, then the persist
//! write, then the watermark write. The watermark is only written once the
//! batch it covers is durably stored, so any failure leaves the next run to
//! retry the same window. That can land duplicates downstream but never
//! skips data.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{IngestError, Result, WatermarkError};
use crate::fetcher::PaginatedFetcher;
use crate::mode::{select_mode, FilterWindow, IngestMode, ORDER_KEY};
use crate::persist::{PersistContext, Persister};
use crate::request::RunRequest;
use crate::watermark::{Watermark, WatermarkStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Start,
    ModeSelected,
    Fetching,
    Persisted,
    WatermarkAdvanced,
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Start => "START",
            RunPhase::ModeSelected => "MODE_SELECTED",
            RunPhase::Fetching => "FETCHING",
            RunPhase::Persisted => "PERSISTED",
            RunPhase::WatermarkAdvanced => "WATERMARK_ADVANCED",
            RunPhase::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub run_id: Uuid,
    pub mode: IngestMode,
    pub records: usize,
    pub window: FilterWindow,
    /// The watermark written at the end of the run
    pub watermark: Watermark,
    pub started_at: DateTime<Utc>,
    /// Object URIs written by the persister; empty for a zero-record run
    pub persisted: Vec<String>,
}

impl RunResult {
    pub fn date_range(&self) -> String {
        self.window.date_range()
    }

    pub fn message(&self) -> &'static str {
        if self.records == 0 {
            "No new data available"
        } else {
            "Data ingestion successful"
        }
    }
}

/// What a run had established before it stopped.
///
/// Lets a caller report mode and fetched count for a run that failed or was
/// cut off after mode selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunProgress {
    pub mode: Option<IngestMode>,
    /// Records held by the run so far; zero until the fetch completes
    pub records: usize,
}

/// Runs one invocation end to end against injected collaborators
#[derive(Clone)]
pub struct IngestionOrchestrator {
    watermarks: Arc<dyn WatermarkStore>,
    fetcher: PaginatedFetcher,
    persister: Arc<dyn Persister>,
    clock: Arc<dyn Clock>,
}

impl IngestionOrchestrator {
    pub fn new(
        watermarks: Arc<dyn WatermarkStore>,
        fetcher: PaginatedFetcher,
        persister: Arc<dyn Persister>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            watermarks,
            fetcher,
            persister,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Execute one run.
    ///
    /// On any error the watermark store is left exactly as it was, except
    /// when the watermark write itself is what failed.
    pub async fn run(&self, request: &RunRequest) -> Result<RunResult> {
        self.run_tracked(request, &mut RunProgress::default()).await
    }

    /// [`run`](Self::run), recording progress into `progress` as it goes
    pub async fn run_tracked(
        &self,
        request: &RunRequest,
        progress: &mut RunProgress,
    ) -> Result<RunResult> {
        request.validate()?;

        let mut phase = RunPhase::Start;
        let ctx = PersistContext::new(self.clock.now());
        info!(run_id = %ctx.run_id, phase = %phase, "Starting ingestion run");

        match self.execute(request, &ctx, &mut phase, progress).await {
            Ok(result) => Ok(result),
            Err(err) => {
                error!(
                    run_id = %ctx.run_id,
                    from = %phase,
                    to = %RunPhase::Failed,
                    "Run failed in {}: {}",
                    phase,
                    err
                );
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        request: &RunRequest,
        ctx: &PersistContext,
        phase: &mut RunPhase,
        progress: &mut RunProgress,
    ) -> Result<RunResult> {
        let previous = self.read_watermark(request.force_initial_load).await?;

        let selection = select_mode(request, previous.as_ref(), ctx.run_started)?;
        transition(phase, RunPhase::ModeSelected);
        progress.mode = Some(selection.mode);
        info!(
            mode = %selection.mode,
            "=== {} LOAD MODE === {}",
            selection.mode.as_str().to_uppercase(),
            selection.window.date_range()
        );
        info!(filter = %selection.filter_expression, "Filter expression");
        if let Some(previous) = &previous {
            info!("Last run was: {}", previous.last_run_timestamp);
        }

        transition(phase, RunPhase::Fetching);
        let batch = self
            .fetcher
            .fetch(
                &selection.filter_expression,
                request.max_records,
                request.batch_size,
                ORDER_KEY,
            )
            .await?;
        progress.records = batch.len();
        info!(records = batch.len(), "Total records fetched: {}", batch.len());

        if request.max_records > 0 && batch.len() == request.max_records {
            warn!(
                max_records = request.max_records,
                "Record cap hit; the watermark still advances to the window end"
            );
        }

        let persisted = if batch.is_empty() {
            info!("No new data fetched; nothing to persist");
            Vec::new()
        } else {
            self.persister.persist(&batch, ctx).await?.keys
        };
        transition(phase, RunPhase::Persisted);

        let watermark = next_watermark(previous.as_ref(), &selection.window, self.clock.now());
        self.watermarks.write(&watermark).await?;
        transition(phase, RunPhase::WatermarkAdvanced);
        info!(
            records = batch.len(),
            "Watermark at {} advanced to {}",
            self.watermarks.location(),
            watermark.last_run_timestamp
        );

        Ok(RunResult {
            run_id: ctx.run_id,
            mode: selection.mode,
            records: batch.len(),
            window: selection.window,
            watermark,
            started_at: ctx.run_started,
            persisted,
        })
    }

    /// A forced backfill ignores a corrupt document; it will be overwritten
    async fn read_watermark(&self, force_initial_load: bool) -> Result<Option<Watermark>> {
        match self.watermarks.read().await {
            Ok(watermark) => Ok(watermark),
            Err(WatermarkError::Corrupt { location, reason }) if force_initial_load => {
                warn!("Ignoring corrupt watermark at {} for forced initial load: {}", location, reason);
                Ok(None)
            }
            Err(err) => Err(IngestError::from(err)),
        }
    }
}

/// Never moves `last_run_timestamp` backwards
pub fn next_watermark(
    previous: Option<&Watermark>,
    window: &FilterWindow,
    now: DateTime<Utc>,
) -> Watermark {
    let last = previous
        .map(|p| p.last_run_timestamp.max(window.end))
        .unwrap_or(window.end);
    Watermark::new(last, now)
}

fn transition(phase: &mut RunPhase, next: RunPhase) {
    info!(from = %phase, to = %next, "Run phase {} -> {}", phase, next);
    *phase = next;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::fetcher::RetryPolicy;
    use crate::mode::StatusPredicate;
    use crate::persist::InMemoryPersister;
    use crate::record::Record;
    use crate::source::InMemorySource;
    use crate::watermark::InMemoryWatermarkStore;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 6, 0, 0).unwrap()
    }

    fn record(id: u32, created: DateTime<Utc>) -> Record {
        json!({
            "unique_key": id.to_string(),
            "status": "Open",
            "created_date": sr311_common::timestamp::format_floating(created)
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    struct Harness {
        store: Arc<InMemoryWatermarkStore>,
        source: Arc<InMemorySource>,
        persister: Arc<InMemoryPersister>,
        orchestrator: IngestionOrchestrator,
    }

    fn harness(store: InMemoryWatermarkStore) -> Harness {
        let store = Arc::new(store);
        let source = Arc::new(InMemorySource::new(
            (0..5).map(|i| record(i, now() - Duration::hours(i64::from(i) + 1))).collect(),
        ));
        let persister = Arc::new(InMemoryPersister::new());
        let orchestrator = IngestionOrchestrator::new(
            store.clone(),
            PaginatedFetcher::new(source.clone(), RetryPolicy::default()),
            persister.clone(),
            Arc::new(FixedClock::new(now())),
        );
        Harness {
            store,
            source,
            persister,
            orchestrator,
        }
    }

    fn window(end: DateTime<Utc>) -> FilterWindow {
        FilterWindow {
            start: end - Duration::days(1),
            start_inclusive: true,
            end,
            status_predicate: StatusPredicate::default(),
        }
    }

    #[test]
    fn test_next_watermark_is_monotonic() {
        let later = Watermark::new(now() + Duration::days(3), now());
        let next = next_watermark(Some(&later), &window(now()), now());
        assert_eq!(next.last_run_timestamp, now() + Duration::days(3));
        assert_eq!(next.updated_at, now());

        let earlier = Watermark::new(now() - Duration::days(3), now());
        let next = next_watermark(Some(&earlier), &window(now()), now());
        assert_eq!(next.last_run_timestamp, now());

        assert_eq!(next_watermark(None, &window(now()), now()).last_run_timestamp, now());
    }

    #[tokio::test]
    async fn test_initial_run_persists_then_advances() {
        let h = harness(InMemoryWatermarkStore::new());
        let result = h.orchestrator.run(&RunRequest::default()).await.unwrap();

        assert_eq!(result.mode, IngestMode::Initial);
        assert_eq!(result.records, 5);
        assert_eq!(result.message(), "Data ingestion successful");
        assert_eq!(h.persister.batches()[0].len(), 5);
        assert_eq!(result.persisted.len(), 2);

        let stored = h.store.read().await.unwrap().unwrap();
        assert_eq!(stored.last_run_timestamp, now());
        assert_eq!(stored, result.watermark);
    }

    #[tokio::test]
    async fn test_empty_run_skips_persister_but_advances() {
        let previous = Watermark::new(now() - Duration::minutes(10), now() - Duration::minutes(10));
        let h = harness(InMemoryWatermarkStore::with_watermark(previous));

        let result = h.orchestrator.run(&RunRequest::default()).await.unwrap();

        assert_eq!(result.mode, IngestMode::Incremental);
        assert_eq!(result.records, 0);
        assert_eq!(result.message(), "No new data available");
        assert!(h.persister.batches().is_empty());
        assert!(result.persisted.is_empty());
        assert_eq!(h.store.write_count(), 1);
        assert_eq!(h.store.read().await.unwrap().unwrap().last_run_timestamp, now());
    }

    #[tokio::test]
    async fn test_persist_failure_leaves_watermark_untouched() {
        let previous = Watermark::new(now() - Duration::days(1), now() - Duration::days(1));
        let h = harness(InMemoryWatermarkStore::with_watermark(previous));
        let before = h.store.raw();
        h.persister.fail(true);

        let err = h.orchestrator.run(&RunRequest::default()).await.unwrap_err();

        assert!(matches!(err, IngestError::Persist(_)));
        assert_eq!(h.store.raw(), before);
        assert_eq!(h.store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_watermark_fails_unless_forced() {
        let h = harness(InMemoryWatermarkStore::with_raw("not json"));

        let err = h.orchestrator.run(&RunRequest::default()).await.unwrap_err();
        assert!(matches!(err, IngestError::Watermark(WatermarkError::Corrupt { .. })));
        assert!(h.source.queries().is_empty());

        let forced = RunRequest {
            force_initial_load: true,
            ..Default::default()
        };
        let result = h.orchestrator.run(&forced).await.unwrap();
        assert_eq!(result.mode, IngestMode::Initial);
        assert!(h.store.read().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_read_failure_is_not_ignored_when_forced() {
        let store = InMemoryWatermarkStore::new();
        store.fail_reads(true);
        let h = harness(store);

        let forced = RunRequest {
            force_initial_load: true,
            ..Default::default()
        };
        let err = h.orchestrator.run(&forced).await.unwrap_err();
        assert!(matches!(err, IngestError::Watermark(WatermarkError::Read { .. })));
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_before_any_io() {
        let h = harness(InMemoryWatermarkStore::new());
        let request = RunRequest {
            batch_size: 0,
            ..Default::default()
        };

        let err = h.orchestrator.run(&request).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(h.source.queries().is_empty());
    }
}
