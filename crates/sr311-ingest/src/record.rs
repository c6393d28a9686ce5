//! Source records and the per-run batch

use chrono::{DateTime, Datelike, Utc};
use serde_json::{Map, Value};
use sr311_common::timestamp::parse_iso8601;
use std::collections::BTreeMap;
use std::fmt;

use crate::mode::ORDER_KEY;

/// One source row, kept as the JSON object the API returned
pub type Record = Map<String, Value>;

/// Creation timestamp of a record, if present and parseable
pub fn created_at(record: &Record) -> Option<DateTime<Utc>> {
    record
        .get(ORDER_KEY)
        .and_then(Value::as_str)
        .and_then(|s| parse_iso8601(s).ok())
}

/// Year/month partition derived from a record's creation timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
}

impl PartitionKey {
    pub fn of(ts: DateTime<Utc>) -> Self {
        Self {
            year: ts.year(),
            month: ts.month(),
        }
    }
}

impl fmt::Display for PartitionKey {
    /// Hive-style path segment: `year=2024/month=03`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "year={}/month={:02}", self.year, self.month)
    }
}

/// Records fetched in one run, in source order (ascending creation time).
///
/// Built once by the fetcher and only read afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBatch {
    records: Vec<Record>,
}

impl RecordBatch {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Group records by partition, preserving order inside each group.
    ///
    /// Records without a usable creation timestamp are grouped under `None`
    /// rather than dropped.
    pub fn partitions(&self) -> BTreeMap<Option<PartitionKey>, Vec<&Record>> {
        let mut groups: BTreeMap<Option<PartitionKey>, Vec<&Record>> = BTreeMap::new();
        for record in &self.records {
            groups
                .entry(created_at(record).map(PartitionKey::of))
                .or_default()
                .push(record);
        }
        groups
    }

    /// Index of the first record older than its predecessor, if any
    pub fn first_out_of_order(&self) -> Option<usize> {
        let mut previous: Option<DateTime<Utc>> = None;
        for (index, record) in self.records.iter().enumerate() {
            if let Some(ts) = created_at(record) {
                if previous.is_some_and(|p| ts < p) {
                    return Some(index);
                }
                previous = Some(ts);
            }
        }
        None
    }
}
