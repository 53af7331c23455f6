//! Console logging backend.

use super::{MetricLogger, Metrics};

/// Writes metrics as `tracing` events, one line per summary.
#[derive(Default)]
pub struct ConsoleLogger;

impl ConsoleLogger {
    pub fn new() -> Self {
        Self
    }
}

impl MetricLogger for ConsoleLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        tracing::info!(step, "{} = {:.4}", name, value);
    }

    fn log_metrics(&self, metrics: &Metrics, step: u64) {
        if metrics.is_empty() {
            return;
        }
        let line = metrics
            .iter()
            .map(|(name, value)| format!("{}={:.4}", name, value))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(step, "{}", line);
    }
}
