//! Metric sinks for training summaries.
//!
//! - `MetricLogger` trait for composable backends
//! - `ConsoleLogger` writes summaries through `tracing`
//! - `CompositeLogger` fans a summary out to several backends

mod console;
mod logger;

pub use console::ConsoleLogger;
pub use logger::{CompositeLogger, MetricLogger, Metrics, NoOpLogger};
