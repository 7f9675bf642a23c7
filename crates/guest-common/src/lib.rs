//! Common utilities for guest-side boot tools.
//!
//! - Timestamp formatting shared by every guest log format
//! - Stage telemetry recording

pub mod telemetry;

/// Get current timestamp in RFC3339 format with milliseconds.
pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
