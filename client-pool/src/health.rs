//! # Endpoint Health
//!
//! Failure and backoff bookkeeping for a single endpoint. Pure data, no I/O.
//!
//! A failure puts the endpoint into cooldown for `backoff`. Failures that
//! follow each other within the failure window double the cooldown up to the
//! ceiling; an endpoint that has been quiet longer than the window starts
//! again from the base cooldown.

use crate::config::HealthConfig;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthState {
    last_failed_at: Option<Instant>,
    backoff: Duration,
    policy: HealthConfig,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

impl HealthState {
    pub fn new(policy: HealthConfig) -> Self {
        Self {
            last_failed_at: None,
            backoff: policy.base_backoff(),
            policy,
        }
    }

    /// Records a failure now.
    pub fn mark_unhealthy(&mut self) {
        self.mark_unhealthy_at(Instant::now());
    }

    /// Records a failure at `now`.
    ///
    /// Ignored while the endpoint is still cooling down from an earlier
    /// failure, so correlated errors do not compound the backoff.
    pub fn mark_unhealthy_at(&mut self, now: Instant) {
        if !self.is_healthy_at(now) {
            return;
        }

        self.backoff = match self.last_failed_at {
            Some(last) if now.saturating_duration_since(last) <= self.policy.failure_window() => {
                (self.backoff * 2).min(self.policy.max_backoff())
            }
            _ => self.policy.base_backoff(),
        };
        self.last_failed_at = Some(now);
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(Instant::now())
    }

    pub fn is_healthy_at(&self, now: Instant) -> bool {
        match self.next_available() {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// When the endpoint leaves cooldown. `None` if it has never failed.
    pub fn next_available(&self) -> Option<Instant> {
        self.last_failed_at.map(|at| at + self.backoff)
    }

    pub fn last_failed_at(&self) -> Option<Instant> {
        self.last_failed_at
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn has_failed(&self) -> bool {
        self.last_failed_at.is_some()
    }
}
