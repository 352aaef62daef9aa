//! Small numerical helpers shared by scoring and clustering.

use serde::{Deserialize, Serialize};

/// Linear-interpolation percentile over an ascending slice.
///
/// `p` is clamped to `0..=100`. An empty slice yields 0.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 100.0) };
    let index = (p / 100.0) * (sorted.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;

    if lower == upper {
        return sorted[lower];
    }

    let weight = index - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

/// Collect and sort values ascending.
pub fn sorted_values(values: impl IntoIterator<Item = f64>) -> Vec<f64> {
    let mut out: Vec<f64> = values.into_iter().collect();
    out.sort_by(|a, b| a.total_cmp(b));
    out
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Mean, median and upper percentiles of one metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub mean: f64,
    pub median: f64,
    pub p75: f64,
    pub p90: f64,
}

impl Summary {
    pub fn of_sorted(sorted: &[f64]) -> Self {
        Self {
            mean: mean(sorted),
            median: percentile(sorted, 50.0),
            p75: percentile(sorted, 75.0),
            p90: percentile(sorted, 90.0),
        }
    }
}
