//! # Run Statistics
//!
//! Turns the raw counters of one benchmark run into a [`StatisticsRecord`]:
//! throughput, timeout count, and, when latency tracking was on, nine
//! latency percentiles plus the population standard deviation.
//!
//! ## Percentile Rule
//!
//! Samples are sorted and percentile `p` is read at index `floor(p * n)`,
//! clamped to `n - 1`. The fractions are evaluated in integer arithmetic
//! (`n * 2 / 3`, `n * 19 / 20`, ...) so that no float rounding moves an
//! index.
//!
//! ## Output Formats
//!
//! With samples the log line is
//! `timeouts, concurrency, seconds, completed, throughput | p50, ..., p100, stdev`.
//! Without samples a compact line is emitted instead; percentiles are
//! never fabricated from an empty set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Percentiles reported per run, as exact fractions.
pub const PERCENTILES: [(usize, usize); 9] = [
    (1, 2),
    (2, 3),
    (3, 4),
    (4, 5),
    (9, 10),
    (19, 20),
    (98, 100),
    (99, 100),
    (1, 1),
];

/// Column header written at the top of every statistics log.
pub const LOG_HEADER: &str =
    "Timeouts, Concurrency, Time, Completed, Throughput | 50%, 66%, 75%, 80%, 90%, 95%, 98%, 99%, 100%, stdev(ms)";

/// Latency distribution of one run, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub mean_ms: f64,
    pub stdev_ms: f64,
    /// p50, p66, p75, p80, p90, p95, p98, p99, p100
    pub percentiles_ms: [u32; 9],
}

impl LatencySummary {
    /// Summarize a sample set. Returns `None` for an empty set.
    pub fn from_samples(samples: &mut [u32]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();

        let mut percentiles_ms = [0u32; 9];
        for (slot, (num, den)) in percentiles_ms.iter_mut().zip(PERCENTILES.iter()) {
            *slot = percentile(samples, *num, *den);
        }
        let (mean_ms, stdev_ms) = mean_and_stdev(samples);

        Some(Self {
            samples: samples.len(),
            mean_ms,
            stdev_ms,
            percentiles_ms,
        })
    }
}

/// Read percentile `num/den` from an ascending slice. An empty slice
/// yields 0.
pub fn percentile(sorted: &[u32], num: usize, den: usize) -> u32 {
    if sorted.is_empty() || den == 0 {
        return 0;
    }
    let n = sorted.len();
    let index = (n * num / den).min(n - 1);
    sorted[index]
}

/// Mean and population standard deviation.
pub fn mean_and_stdev(values: &[u32]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let count = values.len() as f64;
    let mean = values.iter().map(|v| *v as f64).sum::<f64>() / count;
    let variance = values
        .iter()
        .map(|v| (*v as f64 - mean).powi(2))
        .sum::<f64>()
        / count;
    (mean, variance.sqrt())
}

/// Counters collected from every device at the end of a run.
#[derive(Debug, Clone, Default)]
pub struct RunTotals {
    pub uri: String,
    pub concurrency: usize,
    pub elapsed_ms: u64,
    pub completed: u64,
    pub timeouts: u64,
    pub sent: u64,
}

/// One aggregated result per completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsRecord {
    pub timestamp: DateTime<Utc>,
    pub uri: String,
    pub concurrency: usize,
    pub elapsed_ms: u64,
    pub completed: u64,
    pub timeouts: u64,
    pub sent: u64,
    /// Completed exchanges per second.
    pub throughput: f64,
    pub latency: Option<LatencySummary>,
}

impl StatisticsRecord {
    pub fn compute(totals: RunTotals, latencies: &mut [u32]) -> Self {
        let throughput = if totals.elapsed_ms == 0 {
            0.0
        } else {
            totals.completed as f64 * 1000.0 / totals.elapsed_ms as f64
        };

        Self {
            timestamp: Utc::now(),
            uri: totals.uri,
            concurrency: totals.concurrency,
            elapsed_ms: totals.elapsed_ms,
            completed: totals.completed,
            timeouts: totals.timeouts,
            sent: totals.sent,
            throughput,
            latency: LatencySummary::from_samples(latencies),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed_ms as f64 / 1000.0
    }

    /// Render the record as one statistics log line.
    pub fn to_log_line(&self) -> String {
        match &self.latency {
            Some(latency) => {
                let p = &latency.percentiles_ms;
                format!(
                    "{}, {}, {:.3}, {}, {:.2} | {}, {}, {}, {}, {}, {}, {}, {}, {}, {:.1}",
                    self.timeouts,
                    self.concurrency,
                    self.elapsed_secs(),
                    self.completed,
                    self.throughput,
                    p[0],
                    p[1],
                    p[2],
                    p[3],
                    p[4],
                    p[5],
                    p[6],
                    p[7],
                    p[8],
                    latency.stdev_ms
                )
            }
            None => format!(
                "c={}, t={:.3}, received={}, timeouts={}, throughput={:.2}, uri={}",
                self.concurrency,
                self.elapsed_secs(),
                self.completed,
                self.timeouts,
                self.throughput,
                self.uri
            ),
        }
    }
}
