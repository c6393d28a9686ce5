//! Per-invocation run parameters

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};
use crate::source::MAX_PAGE_SIZE;

pub const DEFAULT_MAX_RECORDS: usize = 10_000;
pub const DEFAULT_INITIAL_LOOKBACK_DAYS: u32 = 365;
pub const DEFAULT_BATCH_SIZE: usize = 2_000;

/// Upper bound on the backfill window, roughly a century
const MAX_LOOKBACK_DAYS: u32 = 36_500;

/// Invocation input. Every field is optional on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    /// Backfill even when a watermark exists
    pub force_initial_load: bool,
    /// Record cap for this run
    pub max_records: usize,
    /// Backfill window length in INITIAL mode
    pub initial_lookback_days: u32,
    /// Records requested per page
    pub batch_size: usize,
    /// Pins the window end to midnight UTC of this date
    pub test_end_date: Option<NaiveDate>,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            force_initial_load: false,
            max_records: DEFAULT_MAX_RECORDS,
            initial_lookback_days: DEFAULT_INITIAL_LOOKBACK_DAYS,
            batch_size: DEFAULT_BATCH_SIZE,
            test_end_date: None,
        }
    }
}

impl RunRequest {
    /// Decode an invocation event. `null` means "all defaults".
    pub fn from_event(event: serde_json::Value) -> Result<Self> {
        if event.is_null() {
            return Ok(Self::default());
        }

        let request: Self = serde_json::from_value(event)
            .map_err(|e| IngestError::invalid_request(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_PAGE_SIZE {
            return Err(IngestError::invalid_request(format!(
                "batch_size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, self.batch_size
            )));
        }
        if self.initial_lookback_days > MAX_LOOKBACK_DAYS {
            return Err(IngestError::invalid_request(format!(
                "initial_lookback_days must be at most {}, got {}",
                MAX_LOOKBACK_DAYS, self.initial_lookback_days
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_event_uses_defaults() {
        assert_eq!(RunRequest::from_event(json!({})).unwrap(), RunRequest::default());
        assert_eq!(RunRequest::from_event(json!(null)).unwrap(), RunRequest::default());

        let defaults = RunRequest::default();
        assert!(!defaults.force_initial_load);
        assert_eq!(defaults.max_records, 10_000);
        assert_eq!(defaults.initial_lookback_days, 365);
        assert_eq!(defaults.batch_size, 2_000);
        assert_eq!(defaults.test_end_date, None);
    }

    #[test]
    fn test_partial_event() {
        let request = RunRequest::from_event(json!({
            "force_initial_load": true,
            "max_records": 100,
            "initial_lookback_days": 7,
            "test_end_date": "2024-06-30",
            "unrelated": "ignored"
        }))
        .unwrap();

        assert!(request.force_initial_load);
        assert_eq!(request.max_records, 100);
        assert_eq!(request.initial_lookback_days, 7);
        assert_eq!(request.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(request.test_end_date, NaiveDate::from_ymd_opt(2024, 6, 30));
    }

    #[test]
    fn test_rejects_bad_values() {
        for event in [
            json!({ "batch_size": 0 }),
            json!({ "batch_size": 50_001 }),
            json!({ "max_records": -5 }),
            json!({ "initial_lookback_days": 100_000 }),
            json!({ "test_end_date": "06/30/2024" }),
            json!({ "force_initial_load": "yes" }),
        ] {
            let err = RunRequest::from_event(event.clone()).unwrap_err();
            assert!(
                matches!(err, IngestError::InvalidRequest(_)),
                "expected invalid request for {}",
                event
            );
        }
    }

    #[test]
    fn test_zero_record_cap_is_allowed() {
        let request = RunRequest::from_event(json!({ "max_records": 0 })).unwrap();
        assert_eq!(request.max_records, 0);
    }
}
