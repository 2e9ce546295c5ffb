//! Metrics collection utilities.
//!
//! Counts attempts, responses, transport failures by kind, retries and the
//! two availability fallbacks (locally generated tokens and whole-pool proxy
//! selection) so degraded operation is visible.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::request::transport::TransportErrorKind;

const LATENCY_WINDOW: usize = 128;

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub started_at: DateTime<Utc>,
    pub attempts: u64,
    pub responses: u64,
    pub server_errors: u64,
    pub transport_failures: u64,
    pub failures_by_kind: HashMap<TransportErrorKind, u64>,
    pub retries: u64,
    pub token_fallbacks: u64,
    pub pool_fallbacks: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

#[derive(Debug)]
struct MetricsState {
    started_at: DateTime<Utc>,
    attempts: u64,
    responses: u64,
    server_errors: u64,
    failures_by_kind: HashMap<TransportErrorKind, u64>,
    retries: u64,
    token_fallbacks: u64,
    pool_fallbacks: u64,
    latencies: VecDeque<Duration>,
}

impl MetricsState {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            attempts: 0,
            responses: 0,
            server_errors: 0,
            failures_by_kind: HashMap::new(),
            retries: 0,
            token_fallbacks: 0,
            pool_fallbacks: 0,
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
        }
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().cloned().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
    }
}

/// Thread-safe metrics collector shared by the executor and its handlers.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new())),
        }
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_attempt(&self) {
        self.state().attempts += 1;
    }

    pub fn record_response(&self, status: u16, latency: Duration) {
        let mut guard = self.state();
        guard.responses += 1;
        if status >= 500 {
            guard.server_errors += 1;
        }
        if guard.latencies.len() == LATENCY_WINDOW {
            guard.latencies.pop_front();
        }
        guard.latencies.push_back(latency);
    }

    pub fn record_transport_failure(&self, kind: TransportErrorKind) {
        *self.state().failures_by_kind.entry(kind).or_default() += 1;
    }

    pub fn record_retry(&self) {
        self.state().retries += 1;
    }

    pub fn record_token_fallback(&self) {
        self.state().token_fallbacks += 1;
    }

    pub fn record_pool_fallback(&self) {
        self.state().pool_fallbacks += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.state();
        let (average_latency, p95_latency) = guard.latency_stats();
        MetricsSnapshot {
            started_at: guard.started_at,
            attempts: guard.attempts,
            responses: guard.responses,
            server_errors: guard.server_errors,
            transport_failures: guard.failures_by_kind.values().sum(),
            failures_by_kind: guard.failures_by_kind.clone(),
            retries: guard.retries,
            token_fallbacks: guard.token_fallbacks,
            pool_fallbacks: guard.pool_fallbacks,
            average_latency,
            p95_latency,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
