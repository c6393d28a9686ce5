//! Scheduler-facing entry point
//!
//! Takes the raw invocation event and always answers with the response
//! document, whatever happened. Failures never escape as panics or bare
//! errors: the scheduler alerts on the status code.

use serde::{Deserialize, Serialize};
use sr311_common::timestamp::format_rfc3339;
use std::time::Duration;
use tracing::{error, info};

use crate::error::IngestError;
use crate::mode::IngestMode;
use crate::orchestrator::{IngestionOrchestrator, RunProgress, RunResult};
use crate::request::RunRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<IngestMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<String>,
    /// Invocation start time
    pub timestamp: String,
}

impl InvocationResponse {
    pub fn success(result: &RunResult) -> Self {
        Self {
            status_code: 200,
            body: ResponseBody {
                message: result.message().to_string(),
                records: Some(result.records),
                mode: Some(result.mode),
                date_range: Some(result.date_range()),
                timestamp: format_rfc3339(result.started_at),
            },
        }
    }

    /// Mode and record count are reported once the run got past mode
    /// selection
    pub fn failure(err: &IngestError, progress: &RunProgress, timestamp: String) -> Self {
        Self {
            status_code: err.status_code(),
            body: ResponseBody {
                message: format!("Error: {}", err),
                records: progress.mode.map(|_| progress.records),
                mode: progress.mode,
                date_range: None,
                timestamp,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Decode `event`, run under `budget`, and build the response.
///
/// Exceeding the budget drops the in-flight run. Because the watermark is
/// the last write of a run, an aborted run never advances it.
pub async fn handle(
    event: serde_json::Value,
    orchestrator: &IngestionOrchestrator,
    budget: Duration,
) -> InvocationResponse {
    let timestamp = format_rfc3339(orchestrator.now());

    let request = match RunRequest::from_event(event) {
        Ok(request) => request,
        Err(err) => {
            error!("Rejected invocation event: {}", err);
            return InvocationResponse::failure(&err, &RunProgress::default(), timestamp);
        }
    };

    let mut progress = RunProgress::default();
    let outcome = match tokio::time::timeout(budget, orchestrator.run_tracked(&request, &mut progress)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(IngestError::BudgetExceeded { budget }),
    };

    match outcome {
        Ok(result) => {
            info!(
                records = result.records,
                mode = %result.mode,
                "{}", result.message()
            );
            InvocationResponse::success(&result)
        }
        Err(err) => {
            error!("Ingestion run failed: {}", err);
            InvocationResponse::failure(&err, &progress, timestamp)
        }
    }
}
