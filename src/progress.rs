use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;
use tracing::info;

/// Captures move the bar at most this far; the rest is rewriting and packaging.
pub const CAPTURE_CEILING: f64 = 0.7;
/// Captures needed to reach [`CAPTURE_CEILING`] in the rough estimate.
pub const EXPECTED_CAPTURES: f64 = 50.0;
pub const SETTLED: f64 = 0.7;
pub const HARVEST_END: f64 = 0.8;
pub const CLEANUP: f64 = 0.85;
pub const PACKAGING: f64 = 0.9;
pub const DONE: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub fraction: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Receives progress updates for one clone run.
#[cfg_attr(test, mockall::automock)]
pub trait ProgressSink: Send + Sync {
    fn report(&self, update: &ProgressUpdate);
}

/// Monotonic front for a [`ProgressSink`]: fractions are clamped to `[0, 1]`
/// and never go backwards.
pub struct Progress<'a> {
    sink: &'a dyn ProgressSink,
    last: Mutex<f64>,
}

impl<'a> Progress<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        Self {
            sink,
            last: Mutex::new(0.0),
        }
    }

    pub fn report(&self, fraction: f64, status: Option<&str>) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let fraction = fraction.clamp(0.0, 1.0).max(*last);
        *last = fraction;
        self.sink.report(&ProgressUpdate {
            fraction,
            status: status.map(str::to_string),
        });
    }

    /// Report `done` of `total` steps mapped onto `[start, end]`.
    pub fn step(&self, start: f64, end: f64, done: usize, total: usize, status: Option<&str>) {
        let ratio = if total == 0 { 1.0 } else { done as f64 / total as f64 };
        self.report(start + (end - start) * ratio, status);
    }

    pub fn fraction(&self) -> f64 {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Discards every update.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _update: &ProgressUpdate) {}
}

/// Logs milestone updates (those with a status) through `tracing`.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, update: &ProgressUpdate) {
        if let Some(status) = &update.status {
            info!("cloning progress {:.0}%: {}", update.fraction * 100.0, status);
        }
    }
}

/// One JSON object per update on stdout.
pub struct JsonProgress;

impl ProgressSink for JsonProgress {
    fn report(&self, update: &ProgressUpdate) {
        if let Ok(line) = serde_json::to_string(update) {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{}", line);
        }
    }
}

/// Terminal progress bar.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::default_bar()
            .template("{spinner} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style.progress_chars("=> "));
        Self { bar }
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for BarProgress {
    fn report(&self, update: &ProgressUpdate) {
        self.bar.set_position((update.fraction * 100.0).round() as u64);
        if let Some(status) = &update.status {
            self.bar.set_message(status.clone());
        }
    }
}
