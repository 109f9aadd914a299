use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing samples are kept in a bounded window; the oldest sample is
/// evicted once the window is full.
const TIMING_WINDOW: usize = 4096;

#[derive(Debug, Default)]
pub struct ProxyStats {
    requests_total: AtomicI64,
    requests_successful: AtomicI64,
    requests_failed: AtomicI64,
    synthesized_error_responses: AtomicI64,
    batches_total: AtomicI64,
    batches_successful: AtomicI64,
    batches_failed: AtomicI64,
    request_timings: Mutex<VecDeque<f64>>,
    batch_timings: Mutex<VecDeque<f64>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestStats {
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub synthesized_error_responses: i64,
    pub avg_time_ms: f64,
    pub p50_time_ms: f64,
    pub p95_time_ms: f64,
    pub p99_time_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchStats {
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub avg_time_ms: f64,
    pub p50_time_ms: f64,
    pub p95_time_ms: f64,
    pub p99_time_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub requests: RequestStats,
    pub batches: BatchStats,
}

impl ProxyStats {
    pub fn track_request_start(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn track_request_end(&self, success: bool, elapsed: Duration) {
        if success {
            self.requests_successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        push_sample(&self.request_timings, elapsed);
    }

    pub fn track_batch_start(&self) {
        self.batches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn track_batch_end(&self, success: bool, elapsed: Duration) {
        if success {
            self.batches_successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.batches_failed.fetch_add(1, Ordering::Relaxed);
        }
        push_sample(&self.batch_timings, elapsed);
    }

    pub fn track_synthesized_error(&self) {
        self.synthesized_error_responses
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let (req_avg, req_p50, req_p95, req_p99) = summarize(&self.request_timings);
        let (batch_avg, batch_p50, batch_p95, batch_p99) = summarize(&self.batch_timings);

        StatsSnapshot {
            requests: RequestStats {
                total: self.requests_total.load(Ordering::Relaxed),
                successful: self.requests_successful.load(Ordering::Relaxed),
                failed: self.requests_failed.load(Ordering::Relaxed),
                synthesized_error_responses: self
                    .synthesized_error_responses
                    .load(Ordering::Relaxed),
                avg_time_ms: req_avg,
                p50_time_ms: req_p50,
                p95_time_ms: req_p95,
                p99_time_ms: req_p99,
            },
            batches: BatchStats {
                total: self.batches_total.load(Ordering::Relaxed),
                successful: self.batches_successful.load(Ordering::Relaxed),
                failed: self.batches_failed.load(Ordering::Relaxed),
                avg_time_ms: batch_avg,
                p50_time_ms: batch_p50,
                p95_time_ms: batch_p95,
                p99_time_ms: batch_p99,
            },
        }
    }
}

fn push_sample(timings: &Mutex<VecDeque<f64>>, elapsed: Duration) {
    let mut timings = match timings.lock() {
        Ok(timings) => timings,
        Err(poisoned) => poisoned.into_inner(),
    };
    if timings.len() == TIMING_WINDOW {
        timings.pop_front();
    }
    timings.push_back(elapsed.as_secs_f64() * 1000.0);
}

fn summarize(timings: &Mutex<VecDeque<f64>>) -> (f64, f64, f64, f64) {
    let samples: Vec<f64> = {
        let timings = match timings.lock() {
            Ok(timings) => timings,
            Err(poisoned) => poisoned.into_inner(),
        };
        timings.iter().copied().collect()
    };
    if samples.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }

    let mut sorted = samples.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let avg = samples.iter().sum::<f64>() / samples.len() as f64;
    (
        avg,
        percentile(&sorted, 50.0),
        percentile(&sorted, 95.0),
        percentile(&sorted, 99.0),
    )
}

fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let index = ((sorted.len() as f64) * pct / 100.0) as usize;
    sorted[index.min(sorted.len() - 1)]
}
