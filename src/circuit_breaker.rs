// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Circuit Breaker
//!
//! Gate in front of downstream task execution. Failures are counted in two independent
//! buckets, transient and critical, so a single critical failure weighs more than many
//! transient ones:
//! - **Open** when critical failures reach the critical threshold, or when the total
//!   reaches the failure threshold and the last failure is younger than the reset timeout
//! - **HalfOpen** once the reset timeout has elapsed for every tripped bucket, allowing
//!   a trial call. Any failure recorded while half-open restarts the window, so the
//!   breaker reopens
//! - **Closed** otherwise
//!
//! A success resets both counters. [`CircuitBreaker::state`] is the only gate:
//! dispatch must check it is not `Open` before invoking an executor.

use crate::{config::ResilienceConfigs, metrics::Metrics};
use parking_lot::Mutex;
use std::{future::Future, time::Duration};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls are allowed
    Closed,
    /// Calls are refused
    Open,
    /// The reset timeout elapsed; a trial call is allowed
    HalfOpen,
}

/// Severity of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Critical,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Critical => "critical",
        }
    }
}

/// Failure counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakerCounters {
    pub transient: u32,
    pub critical: u32,
    pub last_failure: Option<Instant>,
    pub last_critical: Option<Instant>,
}

impl BreakerCounters {
    pub fn total(&self) -> u32 {
        self.transient.saturating_add(self.critical)
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BreakerError<E> {
    #[error("circuit breaker is open")]
    Open,

    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    critical_threshold: u32,
    reset_timeout: Duration,
    counters: Mutex<BreakerCounters>,
    metrics: Metrics,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, critical_threshold: u32, reset_timeout: Duration) -> Self {
        CircuitBreaker {
            failure_threshold: failure_threshold.max(1),
            critical_threshold: critical_threshold.max(1),
            reset_timeout,
            counters: Mutex::new(BreakerCounters::default()),
            metrics: Metrics::global(),
        }
    }

    pub fn from_configs(cfg: &ResilienceConfigs) -> Self {
        Self::new(
            cfg.failure_threshold,
            cfg.critical_threshold,
            cfg.reset_timeout(),
        )
    }

    /// Current state, derived from the counters and the clock.
    pub fn state(&self) -> CircuitState {
        let counters = *self.counters.lock();

        let critical_tripped = counters.critical >= self.critical_threshold;
        let total_tripped = counters.total() >= self.failure_threshold;
        if !critical_tripped && !total_tripped {
            return CircuitState::Closed;
        }

        // either tripped bucket still inside its window keeps the breaker open
        let open = (critical_tripped && self.within_reset(counters.last_critical))
            || (total_tripped && self.within_reset(counters.last_failure));
        if open {
            CircuitState::Open
        } else {
            CircuitState::HalfOpen
        }
    }

    fn within_reset(&self, since: Option<Instant>) -> bool {
        since.is_some_and(|at| at.elapsed() < self.reset_timeout)
    }

    /// Whether a call may be dispatched now.
    pub fn allows(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_failure(&self, kind: FailureKind) {
        let before = self.state();
        {
            let mut counters = self.counters.lock();
            let now = Instant::now();
            match kind {
                FailureKind::Transient => counters.transient = counters.transient.saturating_add(1),
                FailureKind::Critical => {
                    counters.critical = counters.critical.saturating_add(1);
                    counters.last_critical = Some(now);
                }
            }
            counters.last_failure = Some(now);
        }
        self.metrics.breaker_failure(kind.as_str());

        let after = self.state();
        if after == CircuitState::Open && before != CircuitState::Open {
            warn!(kind = kind.as_str(), "circuit breaker opened");
        }
    }

    /// Resets both counters.
    pub fn record_success(&self) {
        let previous = std::mem::take(&mut *self.counters.lock());
        if previous.total() > 0 {
            info!("circuit breaker closed");
        }
    }

    pub fn counters(&self) -> BreakerCounters {
        *self.counters.lock()
    }

    /// Runs `fut` when the breaker allows it and records its outcome.
    ///
    /// `classify` decides whether an error counts as transient or critical.
    pub async fn call<T, E, F, C>(&self, classify: C, fut: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> FailureKind,
    {
        if !self.allows() {
            return Err(BreakerError::Open);
        }

        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure(classify(&err));
                Err(BreakerError::Inner(err))
            }
        }
    }
}
