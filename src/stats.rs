use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::gate::PollOutcome;
use crate::platform::StepKind;
use crate::report::{PollSummary, Report, StepSummary};

#[derive(Debug, Default, Clone)]
struct StepStats {
    requests: u64,
    failures: u64,
    latencies_ms: Vec<u64>,
    status_codes: BTreeMap<u16, u64>,
}

#[derive(Debug, Default, Clone)]
struct PollCounters {
    completed: u64,
    timed_out: u64,
    failed: u64,
    attempts: u64,
}

#[derive(Debug, Default)]
struct Inner {
    steps: BTreeMap<StepKind, StepStats>,
    poll: PollCounters,
    iterations: u64,
    aborted_users: u64,
}

/// Request statistics shared by every virtual user.
///
/// The lock is only held for counter updates, never across a request.
pub struct Stats {
    inner: Mutex<Inner>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub async fn record(&self, step: StepKind, latency: Duration, ok: bool, status: Option<u16>) {
        let mut guard = self.inner.lock().await;
        let entry = guard.steps.entry(step).or_default();
        entry.requests += 1;
        if !ok {
            entry.failures += 1;
        }
        entry.latencies_ms.push(latency.as_millis() as u64);
        if let Some(code) = status {
            *entry.status_codes.entry(code).or_default() += 1;
        }
    }

    pub async fn record_poll(&self, outcome: &PollOutcome) {
        let mut guard = self.inner.lock().await;
        match outcome {
            PollOutcome::Completed { .. } => guard.poll.completed += 1,
            PollOutcome::TimedOut { .. } => guard.poll.timed_out += 1,
            PollOutcome::Failed { .. } => guard.poll.failed += 1,
        }
        guard.poll.attempts += u64::from(outcome.attempts());
    }

    pub async fn record_iteration(&self) {
        self.inner.lock().await.iterations += 1;
    }

    pub async fn record_aborted_user(&self) {
        self.inner.lock().await.aborted_users += 1;
    }

    pub async fn iterations(&self) -> u64 {
        self.inner.lock().await.iterations
    }

    /// Build a report of everything recorded so far.
    pub async fn snapshot(&self, users: usize) -> Report {
        let guard = self.inner.lock().await;
        let elapsed = self.started.elapsed().as_secs_f64();

        let steps = guard
            .steps
            .iter()
            .map(|(step, s)| summarize_step(*step, s, elapsed))
            .collect();

        let p = &guard.poll;
        let sequences = p.completed + p.timed_out + p.failed;
        let poll = PollSummary {
            sequences,
            completed: p.completed,
            timed_out: p.timed_out,
            failed: p.failed,
            avg_attempts: ratio(p.attempts, sequences),
        };

        Report {
            started_at: self.started_at,
            duration_seconds: elapsed,
            users,
            iterations: guard.iterations,
            aborted_users: guard.aborted_users,
            steps,
            poll,
        }
    }
}

fn summarize_step(step: StepKind, s: &StepStats, elapsed_secs: f64) -> StepSummary {
    let mut sorted = s.latencies_ms.clone();
    sorted.sort_unstable();
    let total: u64 = sorted.iter().sum();

    StepSummary {
        name: step.name().to_string(),
        requests: s.requests,
        failures: s.failures,
        failure_rate: ratio(s.failures, s.requests),
        min_ms: sorted.first().copied().unwrap_or(0),
        avg_ms: ratio(total, sorted.len() as u64),
        p50_ms: percentile(&sorted, 50.0),
        p95_ms: percentile(&sorted, 95.0),
        p99_ms: percentile(&sorted, 99.0),
        max_ms: sorted.last().copied().unwrap_or(0),
        requests_per_second: if elapsed_secs > 0.0 {
            s.requests as f64 / elapsed_secs
        } else {
            0.0
        },
        status_codes: s.status_codes.clone(),
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

/// Nearest-rank percentile over an ascending slice.
pub fn percentile(sorted: &[u64], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_nearest_rank() {
        let v: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&v, 50.0), 50);
        assert_eq!(percentile(&v, 95.0), 95);
        assert_eq!(percentile(&v, 99.0), 99);
        assert_eq!(percentile(&v, 100.0), 100);
        assert_eq!(percentile(&[7], 50.0), 7);
        assert_eq!(percentile(&[], 50.0), 0);
    }

    #[test]
    fn ratio_handles_zero_denominator() {
        assert_eq!(ratio(3, 0), 0.0);
        assert_eq!(ratio(1, 4), 0.25);
    }
}
