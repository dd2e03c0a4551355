//! Stage timing records for the next-stage init.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::error::{Stage, StageResult};

#[derive(Serialize)]
struct StageEntry<'a> {
    ts: String,
    stage: &'a str,
    duration_ms: u64,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Appends one JSONL entry per stage. `/var` is moved into the target at
/// teardown, so the log survives into the guest.
#[derive(Debug, Clone)]
pub struct StageRecorder {
    path: PathBuf,
}

impl StageRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Records a stage outcome. Silently does nothing if the log cannot be
    /// written, e.g. before `/var` exists.
    pub fn record<T>(&self, stage: Stage, duration: Duration, result: &StageResult<T>) {
        let entry = StageEntry {
            ts: timestamp(),
            stage: stage.as_str(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.cause.as_str()),
        };

        let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        else {
            return;
        };
        let Ok(json) = serde_json::to_string(&entry) else {
            return;
        };
        let _ = writeln!(file, "{json}");
    }

    /// Runs `f` as `stage` and records how it went.
    pub fn timed<T>(&self, stage: Stage, f: impl FnOnce() -> StageResult<T>) -> StageResult<T> {
        let start = Instant::now();
        let result = f();
        self.record(stage, start.elapsed(), &result);
        result
    }
}
