//! Utility functions.

mod stats;

pub use stats::RollingWindow;

/// Abbreviate step counts for the periodic summary line (`1.5K`, `2.0M`, ...)
pub fn abbreviate(num: u64) -> String {
    const UNITS: [(u64, &str); 3] = [(1_000_000_000, "B"), (1_000_000, "M"), (1_000, "K")];
    UNITS
        .iter()
        .find(|(scale, _)| num >= *scale)
        .map(|(scale, unit)| format!("{:.1}{unit}", num as f64 / *scale as f64))
        .unwrap_or_else(|| num.to_string())
}

/// Elapsed wall time as `HHh MMm SSs`; negative or NaN input reads as zero.
pub fn format_duration(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    format!(
        "{:02}h {:02}m {:02}s",
        total / 3600,
        total % 3600 / 60,
        total % 60
    )
}

/// Logistic function used to map raw global actions into `(0, 1)`
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
