//! Source API client
//!
//! One call to [`SourceClient::fetch_page`] is one bounded request. Retry
//! and pagination live in [`crate::fetcher`]; this layer only classifies
//! failures.

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, Response};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::record::Record;

/// Largest `$limit` the source API accepts
pub const MAX_PAGE_SIZE: usize = 50_000;

/// Header carrying the application token
pub const APP_TOKEN_HEADER: &str = "X-App-Token";

/// Response body bytes kept in error messages
const ERROR_BODY_LIMIT: usize = 512;

/// One page request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    /// Server-side filter, passed through verbatim
    pub filter: String,
    /// Field sorted ascending
    pub order_key: String,
    pub limit: usize,
    pub offset: u64,
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<Record>, SourceError>;
}

/// Client for a Socrata-style `/resource/<id>.json` endpoint
#[derive(Clone)]
pub struct SocrataClient {
    client: Client,
    resource_url: String,
    app_token: Option<String>,
}

impl SocrataClient {
    pub fn new(config: &SourceConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("sr311-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        if config.app_token.is_none() {
            tracing::warn!("SOCRATA_APP_TOKEN not set; requests are subject to anonymous rate limits");
        }

        Ok(Self {
            client,
            resource_url: config.resource_url(),
            app_token: config.app_token.clone(),
        })
    }

    pub fn resource_url(&self) -> &str {
        &self.resource_url
    }
}

#[async_trait]
impl SourceClient for SocrataClient {
    #[instrument(skip(self, query), fields(offset = query.offset, limit = query.limit))]
    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<Record>, SourceError> {
        let mut request = self.client.get(&self.resource_url).query(&[
            ("$where", query.filter.clone()),
            ("$order", format!("{} ASC", query.order_key)),
            ("$limit", query.limit.to_string()),
            ("$offset", query.offset.to_string()),
        ]);

        if let Some(token) = &self.app_token {
            request = request.header(APP_TOKEN_HEADER, token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let body = response.bytes().await?;
        let records: Vec<Record> =
            serde_json::from_slice(&body).map_err(|e| SourceError::Decode(e.to_string()))?;

        debug!(returned = records.len(), "Fetched page");
        Ok(records)
    }
}

async fn status_error(response: Response) -> SourceError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    let mut body = response.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }

    SourceError::Status {
        status,
        body,
        retry_after,
    }
}

/// Fixed dataset served from memory, for dry runs and tests.
///
/// Honours the `created_date` bounds of the filter expression (the status
/// clause is ignored), sorts ascending, and applies `$offset`/`$limit` like
/// the real API. Failures queued with [`InMemorySource::fail_next`] are
/// returned before any data.
#[derive(Default)]
pub struct InMemorySource {
    records: std::sync::Mutex<Vec<Record>>,
    failures: std::sync::Mutex<std::collections::VecDeque<SourceError>>,
    queries: std::sync::Mutex<Vec<PageQuery>>,
}

impl InMemorySource {
    pub fn new(records: Vec<Record>) -> Self {
        let source = Self::default();
        source.extend(records);
        source
    }

    /// Add records, as if they had just been created at the source
    pub fn extend(&self, records: impl IntoIterator<Item = Record>) {
        let mut guard = self.records.lock().unwrap_or_else(|e| e.into_inner());
        guard.extend(records);
        guard.sort_by_key(crate::record::created_at);
    }

    /// Queue an error for the next request
    pub fn fail_next(&self, error: SourceError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    /// Every query received so far, in order
    pub fn queries(&self) -> Vec<PageQuery> {
        self.queries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn matches(record: &Record, bounds: &[(String, chrono::DateTime<chrono::Utc>)]) -> bool {
        let Some(ts) = crate::record::created_at(record) else {
            return false;
        };
        bounds.iter().all(|(op, bound)| match op.as_str() {
            ">" => ts > *bound,
            ">=" => ts >= *bound,
            "<" => ts < *bound,
            "<=" => ts <= *bound,
            _ => true,
        })
    }
}

/// `(operator, instant)` pairs for every `<order_key> <op> '<ts>'` term
fn time_bounds(
    filter: &str,
    order_key: &str,
) -> Result<Vec<(String, chrono::DateTime<chrono::Utc>)>, SourceError> {
    let prefix = format!("{} ", order_key);
    filter
        .split(" AND ")
        .filter_map(|term| term.trim().strip_prefix(&prefix))
        .map(|rest| {
            let (op, literal) = rest
                .split_once(' ')
                .ok_or_else(|| SourceError::Decode(format!("malformed term: {}", rest)))?;
            let ts = sr311_common::timestamp::parse_iso8601(literal.trim_matches('\''))
                .map_err(|e| SourceError::Decode(e.to_string()))?;
            Ok((op.to_string(), ts))
        })
        .collect()
}

#[async_trait]
impl SourceClient for InMemorySource {
    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<Record>, SourceError> {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(query.clone());

        if let Some(err) = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(err);
        }

        let bounds = time_bounds(&query.filter, &query.order_key)?;
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .iter()
            .filter(|r| Self::matches(r, &bounds))
            .skip(usize::try_from(query.offset).unwrap_or(usize::MAX))
            .take(query.limit)
            .cloned()
            .collect())
    }
}
