//! Integration and windowed queries over an irregular sample series.
//!
//! Integrals are taken with the trapezoidal rule over microseconds. The
//! cumulative sequence is aligned with the samples (`cumulative[i]` is the
//! area from sample 0 to sample i), so the average over any window is two
//! lookups and a subtraction.

use thiserror::Error;

use crate::schema::{micros_between, Sample, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeriesError {
    #[error("series has fewer than two samples")]
    NoData,

    #[error("no sample after {lo}")]
    EmptyWindow { lo: Timestamp },

    /// The window covers no time, so an average would divide by zero.
    #[error("window {lo} .. {hi} has zero length")]
    DegenerateWindow { lo: Timestamp, hi: Timestamp },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Utilization,
    Memory,
    Power,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Utilization, Metric::Memory, Metric::Power];

    pub fn value(&self, sample: &Sample) -> u64 {
        match self {
            Metric::Utilization => u64::from(sample.utilization_percent),
            Metric::Memory => sample.memory_used_bytes,
            Metric::Power => u64::from(sample.power_milliwatts),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Integral {
    /// Area under the whole series, in value·µs.
    pub total: f64,
    pub cumulative: Vec<f64>,
}

impl Integral {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.cumulative.is_empty()
    }
}

pub fn integrate(samples: &[Sample], metric: Metric) -> Integral {
    if samples.len() < 2 {
        return Integral::empty();
    }
    let mut cumulative = Vec::with_capacity(samples.len());
    let mut total = 0.0;
    cumulative.push(total);
    for pair in samples.windows(2) {
        let width = micros_between(pair[0].timestamp, pair[1].timestamp) as f64;
        let height = (metric.value(&pair[0]) as f64 + metric.value(&pair[1]) as f64) / 2.0;
        total += height * width;
        cumulative.push(total);
    }
    Integral { total, cumulative }
}

/// Largest value strictly inside `(lo, hi)`, or `None` if no sample is.
pub fn window_peak(samples: &[Sample], metric: Metric, lo: Timestamp, hi: Timestamp) -> Option<u64> {
    samples
        .iter()
        .skip_while(|s| s.timestamp <= lo)
        .take_while(|s| s.timestamp < hi)
        .map(|s| metric.value(s))
        .max()
}

/// Largest value strictly inside `(lo, hi)`.
///
/// An empty window yields 0, which cannot be told apart from a genuine zero
/// reading; use [`window_peak`] where that matters.
pub fn window_max(samples: &[Sample], metric: Metric, lo: Timestamp, hi: Timestamp) -> u64 {
    window_peak(samples, metric, lo, hi).unwrap_or(0)
}

/// Time-weighted average between the first sample after `lo` and the first
/// sample at or after `hi` (the last sample if none reaches `hi`).
pub fn window_average(
    samples: &[Sample],
    cumulative: &[f64],
    lo: Timestamp,
    hi: Timestamp,
) -> Result<f64, SeriesError> {
    if cumulative.is_empty() || cumulative.len() != samples.len() {
        return Err(SeriesError::NoData);
    }
    if lo >= hi {
        return Err(SeriesError::DegenerateWindow { lo, hi });
    }
    let start = samples.partition_point(|s| s.timestamp <= lo);
    if start == samples.len() {
        return Err(SeriesError::EmptyWindow { lo });
    }
    let end = (start + samples[start..].partition_point(|s| s.timestamp < hi)).min(samples.len() - 1);
    let span = micros_between(samples[start].timestamp, samples[end].timestamp);
    if span <= 0 {
        return Err(SeriesError::DegenerateWindow { lo, hi });
    }
    Ok((cumulative[end] - cumulative[start]) / span as f64)
}

/// The samples strictly inside `(lo, hi)`. Assumes timestamps are sorted.
pub fn slice_window(samples: &[Sample], lo: Timestamp, hi: Timestamp) -> &[Sample] {
    let start = samples.partition_point(|s| s.timestamp <= lo);
    let end = samples.partition_point(|s| s.timestamp < hi).max(start);
    &samples[start..end]
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub average: f64,
    pub peak: u64,
}

/// A sample window with all three metric integrals precomputed.
pub struct SeriesAggregator<'a> {
    samples: &'a [Sample],
    integrals: [Integral; 3],
}

impl<'a> SeriesAggregator<'a> {
    pub fn new(samples: &'a [Sample]) -> Self {
        let integrals = Metric::ALL.map(|m| integrate(samples, m));
        Self { samples, integrals }
    }

    pub fn samples(&self) -> &'a [Sample] {
        self.samples
    }

    pub fn integral(&self, metric: Metric) -> &Integral {
        &self.integrals[metric as usize]
    }

    pub fn average(&self, metric: Metric, lo: Timestamp, hi: Timestamp) -> Result<f64, SeriesError> {
        window_average(self.samples, &self.integral(metric).cumulative, lo, hi)
    }

    pub fn peak(&self, metric: Metric, lo: Timestamp, hi: Timestamp) -> u64 {
        window_max(self.samples, metric, lo, hi)
    }

    pub fn stats(&self, metric: Metric, lo: Timestamp, hi: Timestamp) -> Result<WindowStats, SeriesError> {
        Ok(WindowStats {
            average: self.average(metric, lo, hi)?,
            peak: self.peak(metric, lo, hi),
        })
    }
}
