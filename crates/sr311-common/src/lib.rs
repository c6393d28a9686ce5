//! SR311 Common Library
//!
//! Shared types, utilities, and error handling for the SR311 pipeline.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup shared by every binary
//! - **Timestamps**: the source API's floating timestamp format and lenient
//!   ISO-8601 parsing for persisted state
//!
//! # Example
//!
//! ```no_run
//! use sr311_common::timestamp::{format_floating, parse_iso8601};
//!
//! fn main() -> sr311_common::Result<()> {
//!     let ts = parse_iso8601("2024-03-01T12:30:00")?;
//!     assert_eq!(format_floating(ts), "2024-03-01T12:30:00.000");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod timestamp;

// Re-export commonly used types
pub use error::{CommonError, Result};
