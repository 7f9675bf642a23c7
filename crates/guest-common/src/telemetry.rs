//! Telemetry recording for boot stages.

use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Serialize)]
struct OpEntry<'a> {
    ts: String,
    action_type: &'a str,
    duration_ms: u64,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Append-only JSONL log of stage timings.
///
/// A log without a path is disabled and every `record` call is a no-op.
#[derive(Debug, Clone, Default)]
pub struct OpsLog {
    path: Option<PathBuf>,
}

impl OpsLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Record one stage as a single JSONL line.
    ///
    /// Best effort: open or write failures are swallowed so telemetry can
    /// never fail a boot.
    pub fn record(&self, action_type: &str, duration: Duration, success: bool, error: Option<&str>) {
        let Some(path) = &self.path else {
            return;
        };

        let entry = OpEntry {
            ts: crate::timestamp(),
            action_type,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            success,
            error,
        };

        let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) else {
            return;
        };

        let Ok(json) = serde_json::to_string(&entry) else {
            return;
        };

        let _ = writeln!(file, "{json}");
    }
}
