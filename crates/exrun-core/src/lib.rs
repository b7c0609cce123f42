//! Foundational types and utilities shared across exrun crates.
//!
//! Provides the run log entry model and sink seam, time helpers used for log
//! timestamps and run ids, a cooperative cancellation token, and JSON file
//! reading for manifests and workflow definitions.

pub mod cancellation;
pub mod json_io;
pub mod log_entry;
pub mod time_utils;

pub use cancellation::CooperativeCancellationToken;
pub use json_io::{read_json_file, read_json_file_as};
pub use log_entry::{LogEntry, LogKind, LogSink, MemoryLogSink};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, now_rfc3339};
