//! Progress reporting for long-running comparisons and migrations.

/// Receives `(label, fraction)` updates. Purely observational.
pub trait ProgressSink: Send + Sync {
    fn report(&self, label: &str, fraction: f64);
}

/// Reports progress as debug-level tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, label: &str, fraction: f64) {
        tracing::debug!(progress = format!("{:.0}%", fraction * 100.0), "{}", label);
    }
}

/// Discards progress updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _label: &str, _fraction: f64) {}
}

/// Tracks completion of `total` equal steps.
pub(crate) struct Steps<'a> {
    sink: &'a dyn ProgressSink,
    done: usize,
    total: usize,
}

impl<'a> Steps<'a> {
    pub(crate) fn new(sink: &'a dyn ProgressSink, total: usize) -> Self {
        Self { sink, done: 0, total }
    }

    pub(crate) fn advance(&mut self, label: &str) {
        self.done = (self.done + 1).min(self.total);
        let fraction = if self.total == 0 {
            1.0
        } else {
            self.done as f64 / self.total as f64
        };
        self.sink.report(label, fraction);
    }
}
