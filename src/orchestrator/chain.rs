//! Walks the fallback chain for one call.
//!
//! The plan hands out one backend per attempt. Disabled, excluded and non-admissible
//! backends are skipped without consuming an attempt, and the chain cycles when it is
//! shorter than the attempt budget.

use std::collections::HashSet;
use std::time::Duration;

use tracing::debug;

use crate::client::BackendPool;
use crate::error::{ErrorKind, LLMError};
use crate::provider::DynProvider;

/// Backend chosen for the next attempt.
pub(crate) struct Dispatch {
    pub backend: DynProvider,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Linear back-off owed before retrying a rate-limited backend.
    pub backoff: Option<Duration>,
}

pub(crate) struct AttemptPlan {
    chain: Vec<String>,
    max_attempts: u32,
    position: usize,
    attempts: u32,
    tried: Vec<String>,
    excluded: HashSet<String>,
    last_error: Option<LLMError>,
}

/// `[selected] + fallback`, without duplicates.
pub(crate) fn build_chain(selected: &str, fallback: &[String]) -> Vec<String> {
    let mut chain = vec![selected.to_string()];
    for id in fallback {
        if !chain.contains(id) {
            chain.push(id.clone());
        }
    }
    chain
}

impl AttemptPlan {
    pub fn new(chain: Vec<String>, max_attempts: u32) -> Self {
        Self {
            chain,
            max_attempts: max_attempts.max(1),
            position: 0,
            attempts: 0,
            tried: Vec::new(),
            excluded: HashSet::new(),
            last_error: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Next backend to call, or `Err` with the aggregate error once nothing is left.
    pub fn next(&mut self, pool: &BackendPool) -> Result<Dispatch, LLMError> {
        if self.attempts >= self.max_attempts {
            return Err(self.exhausted(pool));
        }

        let mut skipped = 0;
        while skipped < self.chain.len() {
            let id = &self.chain[self.position % self.chain.len()];
            self.position += 1;

            let Some(backend) = pool.get(id) else {
                skipped += 1;
                continue;
            };
            if self.excluded.contains(id) || !backend.is_enabled() {
                skipped += 1;
                continue;
            }
            if !backend.can_admit() {
                debug!(backend = %id, "skipping backend over its rate limit");
                skipped += 1;
                continue;
            }

            let backoff = match (self.tried.last(), &self.last_error) {
                (Some(previous), Some(err))
                    if previous == id && err.kind() == ErrorKind::RateLimit =>
                {
                    Some(Duration::from_secs(u64::from(self.attempts)))
                }
                _ => None,
            };
            self.attempts += 1;
            self.tried.push(id.clone());
            return Ok(Dispatch {
                backend: backend.clone(),
                attempt: self.attempts,
                backoff,
            });
        }

        Err(self.exhausted(pool))
    }

    /// Records a failed attempt. Returns the error itself when it must end the call.
    pub fn failed(&mut self, backend: &str, err: LLMError) -> Result<(), LLMError> {
        let kind = err.kind();
        if !kind.allows_fallback() {
            return Err(err);
        }
        if !kind.is_retryable() {
            self.excluded.insert(backend.to_string());
        }
        self.last_error = Some(err);
        Ok(())
    }

    fn exhausted(&mut self, pool: &BackendPool) -> LLMError {
        match self.last_error.take() {
            Some(last) if self.attempts > 0 => LLMError::AllBackendsFailed {
                attempts: self.attempts,
                tried: std::mem::take(&mut self.tried),
                last: Box::new(last),
            },
            _ => no_backend_available(pool, &self.chain),
        }
    }
}

/// Aggregate error raised when no candidate could be called at all.
pub(crate) fn no_backend_available(pool: &BackendPool, candidates: &[String]) -> LLMError {
    let enabled: Vec<&DynProvider> = candidates
        .iter()
        .filter_map(|id| pool.get(id))
        .filter(|backend| backend.is_enabled())
        .collect();
    let retry_after = enabled
        .iter()
        .filter_map(|backend| backend.rate_limiter().retry_after())
        .min();
    let message = if enabled.is_empty() {
        "no enabled backend is registered".to_string()
    } else {
        format!(
            "{} enabled backend(s) are over their rate limits",
            enabled.len()
        )
    };
    LLMError::NoBackendAvailable {
        message,
        retry_after,
    }
}
