//! Timing records produced by a pipeline run.

use std::time::Duration;

use serde::Serialize;

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every iteration in the budget completed.
    Completed,
    /// A cancel token stopped the run before the budget was reached.
    Cancelled,
}

/// One completed iteration.
///
/// `submit_seq` and `complete_seq` come from a single counter shared by the
/// submission and completion paths, so a serialized run satisfies
/// `submit_seq < complete_seq < next.submit_seq` for every pair of
/// consecutive records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IterationRecord {
    /// 1-based iteration number.
    pub index: usize,
    pub submit_seq: u64,
    pub complete_seq: u64,
    /// From the start of submission to the completion callback.
    pub latency_us: u64,
}

/// Latency distribution over the iterations of a run, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p95_us: u64,
}

/// Result of a finished pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub runtime: String,
    pub dimension: usize,
    pub max_iterations: usize,
    pub completed_iterations: usize,
    pub outcome: RunOutcome,
    /// From `enqueue()` to the final completion.
    pub total_us: u64,
    pub iterations: Vec<IterationRecord>,
}

impl RunReport {
    pub fn total(&self) -> Duration {
        Duration::from_micros(self.total_us)
    }

    /// Latency distribution, or `None` when no iteration completed.
    pub fn summary(&self) -> Option<LatencySummary> {
        let mut latencies: Vec<u64> = self.iterations.iter().map(|r| r.latency_us).collect();
        if latencies.is_empty() {
            return None;
        }
        latencies.sort_unstable();
        let sum: u64 = latencies.iter().sum();
        Some(LatencySummary {
            min_us: latencies[0],
            max_us: latencies[latencies.len() - 1],
            mean_us: sum as f64 / latencies.len() as f64,
            p50_us: percentile(&latencies, 50),
            p95_us: percentile(&latencies, 95),
        })
    }

    /// Whether submissions and completions strictly alternate.
    pub fn is_serialized(&self) -> bool {
        self.iterations.iter().all(|r| r.submit_seq < r.complete_seq)
            && self.iterations.windows(2).all(|w| w[0].complete_seq < w[1].submit_seq)
    }
}

/// Nearest-rank percentile of sorted, non-empty data.
fn percentile(sorted: &[u64], pct: usize) -> u64 {
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted[rank - 1]
}

pub(crate) fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(latencies: &[u64]) -> RunReport {
        let iterations = latencies
            .iter()
            .enumerate()
            .map(|(i, &latency_us)| IterationRecord {
                index: i + 1,
                submit_seq: 2 * i as u64,
                complete_seq: 2 * i as u64 + 1,
                latency_us,
            })
            .collect();
        RunReport {
            runtime: "sim".into(),
            dimension: 4,
            max_iterations: latencies.len(),
            completed_iterations: latencies.len(),
            outcome: RunOutcome::Completed,
            total_us: latencies.iter().sum(),
            iterations,
        }
    }

    #[test]
    fn summary_of_empty_run_is_none() {
        assert!(report(&[]).summary().is_none());
    }

    #[test]
    fn summary_percentiles() {
        let r = report(&[50, 10, 40, 20, 30]);
        let s = r.summary().unwrap();
        assert_eq!(s.min_us, 10);
        assert_eq!(s.max_us, 50);
        assert_eq!(s.p50_us, 30);
        assert_eq!(s.p95_us, 50);
        assert!((s.mean_us - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn serialization_check_detects_overlap() {
        let mut r = report(&[1, 1, 1]);
        assert!(r.is_serialized());
        r.iterations[1].submit_seq = 0;
        assert!(!r.is_serialized());
    }

    #[test]
    fn report_serializes_outcome_snake_case() {
        let json = serde_json::to_string(&report(&[7])).unwrap();
        assert!(json.contains("\"outcome\":\"completed\""));
        assert!(json.contains("\"latency_us\":7"));
    }
}
