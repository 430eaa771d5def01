//! Read-only reports built from metrics, rate-limit state and switch history.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::metrics::BackendMetrics;
use crate::provider::DynProvider;
use crate::ratelimit::RateLimitStatus;
use crate::types::{ModelSwitchEvent, SwitchReason};

/// Error rate at which a backend with enough traffic is reported unhealthy.
const UNHEALTHY_ERROR_RATE: f64 = 0.5;
/// Error rate that triggers a recommendation.
const HIGH_ERROR_RATE: f64 = 0.2;
const SLOW_LATENCY_MS: f64 = 5_000.0;
/// Requests needed before rates are trusted.
const MIN_REQUESTS: u64 = 5;
/// Share of served requests that came through fallback before the order is questioned.
const HIGH_FALLBACK_SHARE: f64 = 0.25;

/// Live view of one backend returned by `backends_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStatus {
    pub id: String,
    pub enabled: bool,
    /// Enabled and not failing most of its recent traffic.
    pub healthy: bool,
    pub average_latency_ms: f64,
    pub error_rate: f64,
    pub total_requests: u64,
    pub rate_limit: RateLimitStatus,
}

impl BackendStatus {
    pub(crate) fn new(backend: &DynProvider, metrics: &BackendMetrics) -> Self {
        let enabled = backend.is_enabled();
        let error_rate = metrics.error_rate();
        let healthy =
            enabled && (metrics.total_requests < MIN_REQUESTS || error_rate < UNHEALTHY_ERROR_RATE);
        Self {
            id: backend.id().to_string(),
            enabled,
            healthy,
            average_latency_ms: metrics.average_latency_ms,
            error_rate,
            total_requests: metrics.total_requests,
            rate_limit: backend.rate_limiter().status(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendAnalytics {
    pub id: String,
    pub metrics: BackendMetrics,
    pub success_rate: f64,
    pub error_rate: f64,
    /// Fraction of all requests across backends that went to this one.
    pub share_of_requests: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SwitchSummary {
    pub total: usize,
    pub by_reason: HashMap<SwitchReason, usize>,
    pub most_common_target: Option<String>,
    pub last_switch_at: Option<DateTime<Utc>>,
}

impl SwitchSummary {
    pub fn count(&self, reason: SwitchReason) -> usize {
        self.by_reason.get(&reason).copied().unwrap_or(0)
    }
}

/// Result of `performance_analytics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceAnalytics {
    /// In registration order.
    pub backends: Vec<BackendAnalytics>,
    pub switches: SwitchSummary,
    pub recommendations: Vec<String>,
}

pub(crate) fn backend_analytics(snapshot: Vec<(String, BackendMetrics)>) -> Vec<BackendAnalytics> {
    let total: u64 = snapshot.iter().map(|(_, m)| m.total_requests).sum();
    snapshot
        .into_iter()
        .map(|(id, metrics)| BackendAnalytics {
            success_rate: metrics.success_rate(),
            error_rate: metrics.error_rate(),
            share_of_requests: if total == 0 {
                0.0
            } else {
                metrics.total_requests as f64 / total as f64
            },
            id,
            metrics,
        })
        .collect()
}

pub(crate) fn summarize_switches(history: &[ModelSwitchEvent]) -> SwitchSummary {
    let mut by_reason = HashMap::new();
    let mut targets: Vec<(&str, usize)> = Vec::new();
    for event in history {
        *by_reason.entry(event.reason).or_insert(0) += 1;
        match targets.iter_mut().find(|(id, _)| *id == event.to) {
            Some((_, count)) => *count += 1,
            None => targets.push((event.to.as_str(), 1)),
        }
    }

    // Earliest target wins ties.
    let mut most_common: Option<(&str, usize)> = None;
    for (id, count) in targets {
        if most_common.is_none_or(|(_, best)| count > best) {
            most_common = Some((id, count));
        }
    }

    SwitchSummary {
        total: history.len(),
        by_reason,
        most_common_target: most_common.map(|(id, _)| id.to_string()),
        last_switch_at: history.last().map(|event| event.timestamp),
    }
}

pub(crate) fn recommendations(backends: &[BackendAnalytics], switches: &SwitchSummary) -> Vec<String> {
    let mut advice = Vec::new();

    for backend in backends {
        let metrics = &backend.metrics;
        if metrics.total_requests >= MIN_REQUESTS && backend.error_rate >= HIGH_ERROR_RATE {
            advice.push(format!(
                "{} fails {:.0}% of requests; check its credentials and quota or move it later in the fallback order",
                backend.id,
                backend.error_rate * 100.0
            ));
        }
        if metrics.total_requests >= MIN_REQUESTS && metrics.average_latency_ms >= SLOW_LATENCY_MS {
            advice.push(format!(
                "{} averages {:.0} ms per request; lower its latency weight only if long answers are expected",
                backend.id, metrics.average_latency_ms
            ));
        }
    }

    let served: u64 = backends.iter().map(|b| b.metrics.successful_requests).sum();
    let fallbacks = switches.count(SwitchReason::Fallback);
    if served > 0 && fallbacks as f64 / served as f64 >= HIGH_FALLBACK_SHARE {
        advice.push(format!(
            "{fallbacks} of {served} served requests needed a fallback; review the preferred backend and fallback order"
        ));
    }

    let idle: Vec<&str> = backends
        .iter()
        .filter(|b| b.metrics.total_requests == 0)
        .map(|b| b.id.as_str())
        .collect();
    if served > 0 && !idle.is_empty() {
        advice.push(format!("never used so far: {}", idle.join(", ")));
    }

    advice
}
