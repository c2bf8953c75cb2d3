// src/progress.rs

//! Conversion progress reporting
//!
//! The conversion subprocess prints `(NN.NN/100%)` progress lines while it
//! runs; `ProgressReporter` parses them and forwards only the positive deltas
//! to an injected `ProgressSink`. The sink replaces process-global metric
//! registration so tests can substitute a no-op collector.

use regex::Regex;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::info;

/// Environment variable carrying the owner identifier used as the metric label.
pub const OWNER_UID_VAR: &str = "OWNER_UID";

/// Destination for conversion progress observations.
///
/// Implementations should be thread-safe; the reporter may be driven from
/// the threads draining subprocess output.
pub trait ProgressSink: Send + Sync {
    /// Record `delta` percentage points of progress for `owner`.
    fn observe(&self, owner: &str, delta: f64);
}

/// No-op sink for tests and callers that do not track progress.
#[derive(Debug, Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn observe(&self, _owner: &str, _delta: f64) {}
}

/// Sink that logs progress through tracing at info level.
#[derive(Debug, Default)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn observe(&self, owner: &str, delta: f64) {
        info!("import progress for {}: +{:.2}%", owner, delta);
    }
}

/// Owner identifier, read once per process and cached.
pub fn owner_uid() -> &'static str {
    static OWNER_UID: OnceLock<String> = OnceLock::new();
    OWNER_UID.get_or_init(|| crate::util::parse_env_var(OWNER_UID_VAR, false).unwrap_or_default())
}

fn progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\((\d{1,3}(?:\.\d+)?)/100%\)").unwrap())
}

/// Extract the percentage from a converter progress line, if present.
pub fn parse_progress(line: &str) -> Option<f64> {
    let caps = progress_re().captures(line)?;
    caps.get(1)?.as_str().parse().ok()
}

/// Tracks the converter's last reported percentage and forwards deltas.
///
/// The total only moves forward: repeated or out-of-order percentages are
/// dropped so the sink sees a monotonic counter.
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    owner: String,
    last_percent: Mutex<f64>,
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            owner: owner_uid().to_string(),
            last_percent: Mutex::new(0.0),
        }
    }

    /// Feed one line of converter output.
    pub fn report_line(&self, line: &str) {
        let Some(percent) = parse_progress(line) else {
            return;
        };
        let mut last = self.last_percent.lock().unwrap();
        if percent > *last {
            self.sink.observe(&self.owner, percent - *last);
            *last = percent;
        }
    }
}
