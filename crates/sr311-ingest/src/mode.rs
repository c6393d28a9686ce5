//! Mode selection
//!
//! Decides between a bounded historical backfill (INITIAL) and a catch-up
//! from the watermark (INCREMENTAL), and renders the server-side filter for
//! the chosen window. Pure: no I/O, no clock reads.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sr311_common::timestamp::{format_floating, start_of_day};
use std::fmt;

use crate::error::{IngestError, Result, WatermarkError};
use crate::request::RunRequest;
use crate::watermark::Watermark;

/// Source field the window and the pagination order are keyed on
pub const ORDER_KEY: &str = "created_date";

/// Statuses harvested by both modes
pub const HARVESTED_STATUSES: &[&str] = &["Open", "In Progress"];

/// Offset added to the watermark in INCREMENTAL mode.
///
/// The window start is already exclusive, so this only matters if the source
/// compares at coarser than sub-second precision. It is a heuristic: records
/// created in the same second as the previous window end but after that
/// instant are skipped. Do not widen or remove without confirming the source
/// API's comparison semantics.
pub const INCREMENTAL_START_OFFSET_SECS: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// First-ever or forced backfill over the lookback window
    Initial,
    /// Catch-up of records created after the watermark
    Incremental,
}

impl IngestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestMode::Initial => "initial",
            IngestMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for IngestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `status IN (...)` expressed as an OR chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPredicate {
    statuses: Vec<String>,
}

impl StatusPredicate {
    pub fn new<I, S>(statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            statuses: statuses.into_iter().map(Into::into).collect(),
        }
    }

    /// `(status='Open' OR status='In Progress')`
    pub fn to_clause(&self) -> String {
        let terms: Vec<String> = self
            .statuses
            .iter()
            .map(|s| format!("status={}", quote(s)))
            .collect();
        format!("({})", terms.join(" OR "))
    }
}

impl Default for StatusPredicate {
    fn default() -> Self {
        Self::new(HARVESTED_STATUSES.iter().copied())
    }
}

/// Time window plus status filter for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterWindow {
    pub start: DateTime<Utc>,
    /// `>=` when true (INITIAL), `>` when false (INCREMENTAL)
    pub start_inclusive: bool,
    /// Always inclusive. Becomes the next watermark.
    pub end: DateTime<Utc>,
    pub status_predicate: StatusPredicate,
}

impl FilterWindow {
    /// Single `$where` expression: status OR-chain AND time bounds
    pub fn to_filter_expression(&self) -> String {
        let start_op = if self.start_inclusive { ">=" } else { ">" };
        format!(
            "{} AND {key} {} {} AND {key} <= {}",
            self.status_predicate.to_clause(),
            start_op,
            quote(&format_floating(self.start)),
            quote(&format_floating(self.end)),
            key = ORDER_KEY,
        )
    }

    /// `"<start> to <end>"` as reported in the run response
    pub fn date_range(&self) -> String {
        format!("{} to {}", format_floating(self.start), format_floating(self.end))
    }
}

/// Outcome of mode selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeSelection {
    pub mode: IngestMode,
    pub window: FilterWindow,
    pub filter_expression: String,
}

/// Choose the run mode and window.
///
/// `now` is the invocation start time. `request.test_end_date`, when set,
/// replaces it with midnight UTC of that date in both modes.
///
/// Fails instead of panicking when a window bound falls outside the
/// representable date range.
pub fn select_mode(
    request: &RunRequest,
    watermark: Option<&Watermark>,
    now: DateTime<Utc>,
) -> Result<ModeSelection> {
    let end = request.test_end_date.map(start_of_day).unwrap_or(now);

    let (mode, start, start_inclusive) = match watermark {
        Some(watermark) if !request.force_initial_load => {
            let start = watermark
                .last_run_timestamp
                .checked_add_signed(Duration::seconds(INCREMENTAL_START_OFFSET_SECS))
                .ok_or_else(|| {
                    IngestError::from(WatermarkError::Corrupt {
                        location: "last_run_timestamp".to_string(),
                        reason: format!("{} is out of range", watermark.last_run_timestamp),
                    })
                })?;
            (IngestMode::Incremental, start, false)
        }
        _ => {
            let start = end
                .checked_sub_signed(Duration::days(i64::from(request.initial_lookback_days)))
                .ok_or_else(|| {
                    IngestError::invalid_request(format!(
                        "lookback of {} days before {} is out of range",
                        request.initial_lookback_days, end
                    ))
                })?;
            (IngestMode::Initial, start, true)
        }
    };

    let window = FilterWindow {
        start,
        start_inclusive,
        end,
        status_predicate: StatusPredicate::default(),
    };

    Ok(ModeSelection {
        mode,
        filter_expression: window.to_filter_expression(),
        window,
    })
}

/// SoQL string literal; embedded quotes are doubled
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
