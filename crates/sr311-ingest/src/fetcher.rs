//! Paginated fetching under a record cap
//!
//! Pages are requested sequentially, sorted ascending on the creation
//! timestamp, with an offset that advances by the page limit. Pagination
//! stops at the first short page or when the cap is reached, so whatever a
//! capped run leaves behind is always the newest part of the window.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{FetchError, SourceError};
use crate::record::{Record, RecordBatch};
use crate::source::{PageQuery, SourceClient, MAX_PAGE_SIZE};

/// Backoff for transient page failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per page, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    ///
    /// Exponential from `base_delay`, capped at `max_delay`. A server hint
    /// (`Retry-After`) replaces the computed delay but is still capped.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let computed = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        hint.unwrap_or(computed).min(self.max_delay)
    }
}

/// Drives repeated page requests against a [`SourceClient`]
#[derive(Clone)]
pub struct PaginatedFetcher {
    client: Arc<dyn SourceClient>,
    retry: RetryPolicy,
}

impl PaginatedFetcher {
    pub fn new(client: Arc<dyn SourceClient>, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// Fetch up to `max_records` records matching `filter`.
    ///
    /// Returns exactly `max_records` records when the source has at least
    /// that many. Any failure discards everything fetched so far.
    pub async fn fetch(
        &self,
        filter: &str,
        max_records: usize,
        batch_size: usize,
        order_key: &str,
    ) -> Result<RecordBatch, FetchError> {
        let page_size = batch_size.clamp(1, MAX_PAGE_SIZE);
        let mut records: Vec<Record> = Vec::new();
        let mut offset: u64 = 0;

        while records.len() < max_records {
            let limit = page_size.min(max_records - records.len());
            let query = PageQuery {
                filter: filter.to_string(),
                order_key: order_key.to_string(),
                limit,
                offset,
            };

            info!(
                offset,
                limit,
                fetched = records.len(),
                "Fetching records {} to {}",
                offset,
                offset + limit as u64
            );

            let mut page = self.fetch_with_retry(&query).await?;
            let returned = page.len();

            if returned > limit {
                warn!(returned, limit, "Source returned more records than requested, truncating");
                page.truncate(limit);
            }
            records.extend(page);

            if returned < limit {
                info!(total = records.len(), "Reached end of available data");
                break;
            }

            offset += limit as u64;
        }

        if max_records > 0 && records.len() >= max_records {
            info!(max_records, "Reached record cap; newer records are left for the next run");
        }

        let batch = RecordBatch::new(records);
        if let Some(index) = batch.first_out_of_order() {
            warn!(index, "Source returned records out of creation order");
        }

        Ok(batch)
    }

    async fn fetch_with_retry(&self, query: &PageQuery) -> Result<Vec<Record>, FetchError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!("Page attempt {}/{} at offset {}", attempt, max_attempts, query.offset);

            let err: SourceError = match self.client.fetch_page(query).await {
                Ok(page) => return Ok(page),
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(FetchError::Permanent {
                    offset: query.offset,
                    source: err,
                });
            }

            if attempt >= max_attempts {
                return Err(FetchError::RetriesExhausted {
                    offset: query.offset,
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.retry.delay_for(attempt, err.retry_after());
            warn!(
                attempt,
                "Page attempt {}/{} failed: {}. Retrying in {:?}...",
                attempt, max_attempts, err, delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::source::InMemorySource;
    use serde_json::json;

    const FILTER: &str = "(status='Open' OR status='In Progress') \
                          AND created_date >= '2024-01-01T00:00:00.000' \
                          AND created_date <= '2024-12-31T00:00:00.000'";

    fn dataset(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                json!({
                    "unique_key": format!("{:05}", i),
                    "status": "Open",
                    "created_date": format!(
                        "2024-01-{:02}T{:02}:{:02}:00.000",
                        1 + i / 1440,
                        (i / 60) % 24,
                        i % 60
                    )
                })
                .as_object()
                .cloned()
                .unwrap()
            })
            .collect()
    }

    fn fetcher(source: Arc<InMemorySource>) -> PaginatedFetcher {
        PaginatedFetcher::new(source, RetryPolicy::default())
    }

    fn unavailable() -> SourceError {
        SourceError::Status {
            status: 503,
            body: String::new(),
            retry_after: None,
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1, None), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2, None), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3, None), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10, None), Duration::from_secs(30));
        assert_eq!(policy.delay_for(1, Some(Duration::from_secs(5))), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1, Some(Duration::from_secs(600))), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_exhaustion_stops_on_short_page() {
        let source = Arc::new(InMemorySource::new(dataset(25)));
        let batch = fetcher(source.clone())
            .fetch(FILTER, 100, 10, "created_date")
            .await
            .unwrap();

        assert_eq!(batch.len(), 25);
        let offsets: Vec<_> = source.queries().iter().map(|q| q.offset).collect();
        assert_eq!(offsets, vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn test_exact_multiple_needs_one_empty_page() {
        let source = Arc::new(InMemorySource::new(dataset(20)));
        let batch = fetcher(source.clone())
            .fetch(FILTER, 100, 10, "created_date")
            .await
            .unwrap();

        assert_eq!(batch.len(), 20);
        assert_eq!(source.queries().len(), 3);
    }

    #[tokio::test]
    async fn test_cap_truncates_to_exactly_max_records() {
        let all = dataset(50);
        let source = Arc::new(InMemorySource::new(all.clone()));
        let batch = fetcher(source.clone())
            .fetch(FILTER, 23, 10, "created_date")
            .await
            .unwrap();

        assert_eq!(batch.len(), 23);
        assert_eq!(batch.records(), &all[..23]);

        let limits: Vec<_> = source.queries().iter().map(|q| q.limit).collect();
        assert_eq!(limits, vec![10, 10, 3]);
    }

    #[tokio::test]
    async fn test_zero_cap_makes_no_requests() {
        let source = Arc::new(InMemorySource::new(dataset(5)));
        let batch = fetcher(source.clone())
            .fetch(FILTER, 0, 10, "created_date")
            .await
            .unwrap();

        assert!(batch.is_empty());
        assert!(source.queries().is_empty());
    }

    #[tokio::test]
    async fn test_queries_carry_filter_and_order_key() {
        let source = Arc::new(InMemorySource::new(dataset(3)));
        fetcher(source.clone())
            .fetch(FILTER, 10, 2_000, "created_date")
            .await
            .unwrap();

        let query = &source.queries()[0];
        assert_eq!(query.filter, FILTER);
        assert_eq!(query.order_key, "created_date");
        assert_eq!(query.limit, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let source = Arc::new(InMemorySource::new(dataset(5)));
        source.fail_next(unavailable());
        source.fail_next(SourceError::Timeout("read timeout".into()));

        let batch = fetcher(source.clone())
            .fetch(FILTER, 100, 10, "created_date")
            .await
            .unwrap();

        assert_eq!(batch.len(), 5);
        assert_eq!(source.queries().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_discard_partial_results() {
        let source = Arc::new(InMemorySource::new(dataset(30)));
        let fetcher = fetcher(source.clone());

        // First page succeeds, then the source goes down for good.
        let first = fetcher.fetch(FILTER, 10, 10, "created_date").await.unwrap();
        assert_eq!(first.len(), 10);
        for _ in 0..3 {
            source.fail_next(unavailable());
        }

        let err = fetcher
            .fetch(FILTER, 100, 10, "created_date")
            .await
            .unwrap_err();

        match err {
            FetchError::RetriesExhausted {
                offset, attempts, ..
            } => {
                assert_eq!(offset, 0);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let source = Arc::new(InMemorySource::new(dataset(5)));
        source.fail_next(SourceError::Status {
            status: 400,
            body: "bad query".into(),
            retry_after: None,
        });

        let err = fetcher(source.clone())
            .fetch(FILTER, 100, 10, "created_date")
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Permanent { offset: 0, .. }));
        assert_eq!(source.queries().len(), 1);
    }
}
