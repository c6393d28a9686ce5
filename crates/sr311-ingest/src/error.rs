//! Error types for the ingestion job
//!
//! Errors are layered the same way the run is: a single page request fails
//! with [`SourceError`], the pagination loop escalates to [`FetchError`],
//! and the orchestrator reports everything as an [`IngestError`].

use std::time::Duration;
use thiserror::Error;

/// Result type alias for a whole ingestion run
pub type Result<T> = std::result::Result<T, IngestError>;

/// One failed request against the source API
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Source returned HTTP {status}: {body}")]
    Status {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("Undecodable response body: {0}")]
    Decode(String),

    #[error("Request failed: {0}")]
    Request(String),
}

impl SourceError {
    /// Whether retrying the same request may succeed.
    ///
    /// Timeouts, connection failures, rate limiting (429) and server errors
    /// (5xx) are transient. Other 4xx responses and bodies that do not parse
    /// as a JSON array will fail the same way every time.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Timeout(_) | SourceError::Connect(_) | SourceError::Request(_) => true,
            SourceError::Status { status, .. } => *status == 429 || *status >= 500,
            SourceError::Decode(_) => false,
        }
    }

    /// Server-requested delay before the next attempt, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::Timeout(err.to_string())
        } else if err.is_connect() {
            SourceError::Connect(err.to_string())
        } else if err.is_decode() {
            SourceError::Decode(err.to_string())
        } else {
            SourceError::Request(err.to_string())
        }
    }
}

/// Pagination aborted; nothing fetched in this run may be persisted
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Page at offset {offset} still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        offset: u64,
        attempts: u32,
        #[source]
        last: SourceError,
    },

    #[error("Page at offset {offset} failed permanently: {source}")]
    Permanent {
        offset: u64,
        #[source]
        source: SourceError,
    },
}

/// Watermark store failures
#[derive(Error, Debug)]
pub enum WatermarkError {
    #[error("Failed to read watermark from {location}: {reason}")]
    Read { location: String, reason: String },

    #[error("Failed to write watermark to {location}: {reason}")]
    Write { location: String, reason: String },

    #[error("Watermark at {location} is corrupt: {reason}")]
    Corrupt { location: String, reason: String },
}

/// Transform/persist failures
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Failed to encode {what}: {reason}")]
    Encode { what: String, reason: String },

    #[error("Failed to upload {key}: {reason}")]
    Upload { key: String, reason: String },
}

/// Terminal failure of an ingestion run
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Invalid run request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Watermark(#[from] WatermarkError),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Persist failed: {0}")]
    Persist(#[from] PersistError),

    #[error("Run exceeded its execution budget of {}s", budget.as_secs())]
    BudgetExceeded { budget: Duration },
}

impl IngestError {
    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// HTTP-style status code reported to the scheduler
    pub fn status_code(&self) -> u16 {
        match self {
            IngestError::InvalidRequest(_) => 400,
            _ => 500,
        }
    }
}
