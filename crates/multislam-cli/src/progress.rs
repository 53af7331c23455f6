//! Progress bar metric backend.

use indicatif::{ProgressBar, ProgressStyle};
use multislam::log::{MetricLogger, Metrics};

const TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}";

/// Metrics shown next to the bar, in order
const SHOWN: [&str; 3] = ["reward/step_mean", "loss/local", "perf/fps"];

/// Drives a progress bar over environment steps summed across agents.
pub struct ProgressLogger {
    bar: ProgressBar,
}

impl ProgressLogger {
    pub fn new(total_steps: u64) -> Self {
        let bar = ProgressBar::new(total_steps);
        if let Ok(style) = ProgressStyle::default_bar().template(TEMPLATE) {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self { bar }
    }
}

impl MetricLogger for ProgressLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        self.bar.set_position(step);
        self.bar.set_message(format!("{name}={value:.3}"));
    }

    fn log_metrics(&self, metrics: &Metrics, step: u64) {
        self.bar.set_position(step);
        let message = SHOWN
            .iter()
            .filter_map(|&name| metrics.get(name).map(|v| format!("{name}={v:.3}")))
            .collect::<Vec<_>>()
            .join(" ");
        self.bar.set_message(message);
    }

    fn close(&self) {
        self.bar.finish_with_message("Run complete");
    }
}
