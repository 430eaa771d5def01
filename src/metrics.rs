//! Running per-backend performance counters read by the selector and analytics.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

/// Aggregate counters for one backend.
///
/// `average_latency_ms` is maintained as an incremental weighted average so it always
/// agrees with `total_requests` without keeping a latency history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_latency_ms: f64,
    pub total_tokens: u64,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl BackendMetrics {
    fn observe(&mut self, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1_000.0;
        let previous = self.total_requests as f64;
        self.total_requests += 1;
        self.average_latency_ms =
            (self.average_latency_ms * previous + latency_ms) / self.total_requests as f64;
        self.last_request_at = Some(Utc::now());
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }

    /// Untried backends report a perfect record so they are not penalized before use.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

/// Metrics for every registered backend, each behind its own lock.
#[derive(Debug, Default)]
pub struct PerformanceMetrics {
    backends: HashMap<String, Mutex<BackendMetrics>>,
}

impl PerformanceMetrics {
    pub fn new<I, S>(backend_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            backends: backend_ids
                .into_iter()
                .map(|id| (id.into(), Mutex::new(BackendMetrics::default())))
                .collect(),
        }
    }

    fn update(&self, backend: &str, apply: impl FnOnce(&mut BackendMetrics)) {
        match self.backends.get(backend) {
            Some(slot) => apply(&mut slot.lock().unwrap_or_else(PoisonError::into_inner)),
            None => debug!(backend, "metrics update for unregistered backend ignored"),
        }
    }

    pub fn record_success(&self, backend: &str, latency: Duration, tokens: u64) {
        self.update(backend, |metrics| {
            metrics.observe(latency);
            metrics.successful_requests += 1;
            metrics.total_tokens += tokens;
        });
    }

    pub fn record_failure(&self, backend: &str, latency: Duration) {
        self.update(backend, |metrics| {
            metrics.observe(latency);
            metrics.failed_requests += 1;
        });
    }

    /// Copy of one backend's counters; unknown ids read as empty metrics.
    pub fn get(&self, backend: &str) -> BackendMetrics {
        self.backends
            .get(backend)
            .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<String, BackendMetrics> {
        self.backends
            .keys()
            .map(|id| (id.clone(), self.get(id)))
            .collect()
    }
}
