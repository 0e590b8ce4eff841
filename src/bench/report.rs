//! Per-trial statistics and the console report.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Nanoseconds per key for a pass over `key_count` keys; zero for no keys.
fn ns_per_key(elapsed: Duration, key_count: usize) -> f64 {
    if key_count == 0 {
        return 0.0;
    }
    elapsed.as_nanos() as f64 / key_count as f64
}

/// Timing of one pass over the corpus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialStats {
    pub elapsed: Duration,
    pub ns_per_key: f64,
}

impl TrialStats {
    pub fn new(elapsed: Duration, key_count: usize) -> Self {
        Self {
            elapsed,
            ns_per_key: ns_per_key(elapsed, key_count),
        }
    }
}

impl fmt::Display for TrialStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Elapsed: {:.3}s; {:.3} ns/key",
            self.elapsed.as_secs_f64(),
            self.ns_per_key
        )
    }
}

/// Results of a benchmark run, in trial order.
#[derive(Debug, Clone)]
pub struct BenchReport {
    pub trials: Vec<TrialStats>,
    pub total: Duration,
    pub key_count: usize,
    /// Wrapping sum of every query result across all trials.
    pub checksum: u64,
}

impl BenchReport {
    /// Mean trial duration, zero when no trial ran.
    pub fn average(&self) -> Duration {
        match u32::try_from(self.trials.len()) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total / n,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.trials.len() as f64),
        }
    }

    pub fn average_ns_per_key(&self) -> f64 {
        ns_per_key(self.average(), self.key_count)
    }

    pub fn min(&self) -> Option<Duration> {
        self.trials.iter().map(|t| t.elapsed).min()
    }

    pub fn max(&self) -> Option<Duration> {
        self.trials.iter().map(|t| t.elapsed).max()
    }

    /// The closing `Average: <s>s; <ns> ns/key` line, without the blank line
    /// that precedes it in the full report.
    pub fn average_line(&self) -> String {
        format!(
            "Average: {:.3}s; {:.3} ns/key",
            self.average().as_secs_f64(),
            self.average_ns_per_key()
        )
    }

    /// Machine-readable view of the report.
    pub fn summary(&self) -> BenchSummary {
        BenchSummary {
            keys: self.key_count,
            trials: self.trials.iter().map(|t| t.elapsed.as_secs_f64()).collect(),
            average_secs: self.average().as_secs_f64(),
            average_ns_per_key: self.average_ns_per_key(),
            min_secs: self.min().unwrap_or_default().as_secs_f64(),
            max_secs: self.max().unwrap_or_default().as_secs_f64(),
            checksum: self.checksum,
        }
    }
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for trial in &self.trials {
            writeln!(f, "{trial}")?;
        }
        write!(f, "\n{}", self.average_line())
    }
}

/// Serializable summary printed by `chdmap-bench --json`.
#[derive(Debug, Clone, Serialize)]
pub struct BenchSummary {
    pub keys: usize,
    pub trials: Vec<f64>,
    pub average_secs: f64,
    pub average_ns_per_key: f64,
    pub min_secs: f64,
    pub max_secs: f64,
    pub checksum: u64,
}
