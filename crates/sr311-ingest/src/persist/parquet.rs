//! JSON records to Snappy-compressed Parquet
//!
//! Column set is the union of keys across the group, sorted by name. A few
//! well-known fields get typed columns; everything else is stored as text,
//! with nested values serialised as JSON.

use arrow::array::{ArrayRef, Float64Builder, StringBuilder, TimestampMillisecondBuilder};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch as ArrowBatch;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde_json::Value;
use sr311_common::timestamp::parse_iso8601;
use std::collections::BTreeSet;
use std::io::Cursor;
use std::sync::Arc;

use crate::error::PersistError;
use crate::record::Record;

/// Fields stored as millisecond timestamps
pub const TIMESTAMP_COLUMNS: &[&str] = &["created_date", "closed_date", "resolution_action_updated_date"];

/// Fields stored as 64-bit floats
pub const FLOAT_COLUMNS: &[&str] = &["latitude", "longitude"];

const MAX_ROW_GROUP_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Timestamp,
    Float,
    Text,
}

impl ColumnKind {
    fn of(name: &str) -> Self {
        if TIMESTAMP_COLUMNS.contains(&name) {
            ColumnKind::Timestamp
        } else if FLOAT_COLUMNS.contains(&name) {
            ColumnKind::Float
        } else {
            ColumnKind::Text
        }
    }

    fn data_type(self) -> DataType {
        match self {
            ColumnKind::Timestamp => DataType::Timestamp(TimeUnit::Millisecond, None),
            ColumnKind::Float => DataType::Float64,
            ColumnKind::Text => DataType::Utf8,
        }
    }
}

/// Arrow schema for a group of records
pub fn infer_schema(records: &[&Record]) -> Schema {
    let names: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.keys().map(String::as_str))
        .collect();

    Schema::new(
        names
            .into_iter()
            .map(|name| Field::new(name, ColumnKind::of(name).data_type(), true))
            .collect::<Vec<_>>(),
    )
}

/// Build the Arrow batch for a group of records
pub fn to_arrow(records: &[&Record]) -> Result<ArrowBatch, PersistError> {
    let schema = Arc::new(infer_schema(records));

    let columns: Vec<ArrayRef> = schema
        .fields()
        .iter()
        .map(|field| build_column(field.name(), records))
        .collect();

    ArrowBatch::try_new(schema, columns).map_err(|e| PersistError::Encode {
        what: "arrow record batch".to_string(),
        reason: e.to_string(),
    })
}

fn build_column(name: &str, records: &[&Record]) -> ArrayRef {
    let values = records.iter().map(|r| r.get(name));

    match ColumnKind::of(name) {
        ColumnKind::Timestamp => {
            let mut builder = TimestampMillisecondBuilder::with_capacity(records.len());
            for value in values {
                builder.append_option(
                    value
                        .and_then(Value::as_str)
                        .and_then(|s| parse_iso8601(s).ok())
                        .map(|ts| ts.timestamp_millis()),
                );
            }
            Arc::new(builder.finish())
        }
        ColumnKind::Float => {
            let mut builder = Float64Builder::with_capacity(records.len());
            for value in values {
                builder.append_option(value.and_then(as_float));
            }
            Arc::new(builder.finish())
        }
        ColumnKind::Text => {
            let mut builder = StringBuilder::new();
            for value in values {
                match value {
                    None | Some(Value::Null) => builder.append_null(),
                    Some(Value::String(s)) => builder.append_value(s),
                    Some(other) => builder.append_value(other.to_string()),
                }
            }
            Arc::new(builder.finish())
        }
    }
}

/// The source serves numbers as strings; accept both
fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Encode a group of records as one Parquet file
pub fn encode(records: &[&Record]) -> Result<Bytes, PersistError> {
    let batch = to_arrow(records)?;
    let encode_err = |e: parquet::errors::ParquetError| PersistError::Encode {
        what: "parquet file".to_string(),
        reason: e.to_string(),
    };

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_max_row_group_size(MAX_ROW_GROUP_SIZE)
        .build();

    let mut buffer = Cursor::new(Vec::new());
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props)).map_err(encode_err)?;
    writer.write(&batch).map_err(encode_err)?;
    writer.close().map_err(encode_err)?;

    Ok(Bytes::from(buffer.into_inner()))
}
