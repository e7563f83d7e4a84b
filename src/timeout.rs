// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Task Timeouts
//!
//! [`TimeoutController`] supervises downstream task execution. It refuses to start a
//! task while the circuit breaker is open and escalates overdue tasks by severity:
//! - **soft**: logged, diagnostics are collected in the background, the task keeps running
//! - **hard**: the executor is asked to cancel the task and its resources are released
//!   in the background; the task counts as a transient breaker failure
//! - **critical**: the task is abandoned, a critical breaker failure and a dedicated
//!   metric are recorded
//!
//! Independently, a [`Watchdog`] polls the [`TaskRegistry`] and flags tasks whose last
//! heartbeat is older than twice its polling interval.

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitState, FailureKind},
    config::ResilienceConfigs,
    errors::TaskError,
    metrics::Metrics,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How overdue a task is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimeoutSeverity {
    Soft,
    Hard,
    Critical,
}

impl TimeoutSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutSeverity::Soft => "soft",
            TimeoutSeverity::Hard => "hard",
            TimeoutSeverity::Critical => "critical",
        }
    }
}

/// Deadlines of the three severities, measured from task start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub soft: Duration,
    pub hard: Duration,
    pub critical: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::from_configs(&ResilienceConfigs::default())
    }
}

impl TimeoutPolicy {
    pub fn from_configs(cfg: &ResilienceConfigs) -> Self {
        TimeoutPolicy {
            soft: cfg.soft_timeout(),
            hard: cfg.hard_timeout(),
            critical: cfg.critical_timeout(),
        }
    }

    /// Severity reached after `elapsed`, if any.
    pub fn classify(&self, elapsed: Duration) -> Option<TimeoutSeverity> {
        if elapsed >= self.critical {
            Some(TimeoutSeverity::Critical)
        } else if elapsed >= self.hard {
            Some(TimeoutSeverity::Hard)
        } else if elapsed >= self.soft {
            Some(TimeoutSeverity::Soft)
        } else {
            None
        }
    }

    fn deadline(&self, severity: TimeoutSeverity) -> Duration {
        match severity {
            TimeoutSeverity::Soft => self.soft,
            TimeoutSeverity::Hard => self.hard,
            TimeoutSeverity::Critical => self.critical,
        }
    }
}

/// Runtime hooks of whatever executes the task (a scanner container, a worker...).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Asks the running task to stop.
    async fn cancel(&self, task_id: &str) -> Result<(), TaskError>;

    /// Frees whatever the task held once it stopped.
    async fn release_resources(&self, task_id: &str) -> Result<(), TaskError>;

    /// Free-form state of the task, for logs.
    async fn diagnostics(&self, task_id: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy)]
struct TaskEntry {
    started: Instant,
    last_heartbeat: Instant,
    lease: u64,
}

/// Running tasks and their heartbeats.
///
/// Every registration gets a lease number so an owner only ever removes its own entry.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    leases: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self) -> TaskEntry {
        let now = Instant::now();
        TaskEntry {
            started: now,
            last_heartbeat: now,
            lease: self.leases.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Registers `task_id`, replacing any previous entry. Returns the lease of the new entry.
    pub fn register(&self, task_id: &str) -> u64 {
        let entry = self.entry();
        let lease = entry.lease;
        self.tasks.lock().insert(task_id.to_owned(), entry);
        lease
    }

    /// Registers `task_id` unless it is already tracked.
    pub fn try_register(&self, task_id: &str) -> Option<u64> {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(task_id) {
            return None;
        }
        let entry = self.entry();
        let lease = entry.lease;
        tasks.insert(task_id.to_owned(), entry);
        Some(lease)
    }

    /// Removes `task_id` only if it still holds `lease`.
    pub fn release(&self, task_id: &str, lease: u64) {
        let mut tasks = self.tasks.lock();
        if tasks.get(task_id).is_some_and(|entry| entry.lease == lease) {
            tasks.remove(task_id);
        }
    }

    /// Refreshes the heartbeat of `task_id`. `false` when the task is unknown.
    pub fn heartbeat(&self, task_id: &str) -> bool {
        match self.tasks.lock().get_mut(task_id) {
            Some(entry) => {
                entry.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, task_id: &str) {
        self.tasks.lock().remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How long `task_id` has been running.
    pub fn running_for(&self, task_id: &str) -> Option<Duration> {
        self.tasks
            .lock()
            .get(task_id)
            .map(|entry| entry.started.elapsed())
    }

    /// Tasks whose last heartbeat is older than `threshold`, sorted by id.
    pub fn stalled(&self, threshold: Duration) -> Vec<String> {
        let mut stalled: Vec<String> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, entry)| entry.last_heartbeat.elapsed() > threshold)
            .map(|(id, _)| id.clone())
            .collect();
        stalled.sort();
        stalled
    }
}

/// Flags tasks that stopped sending heartbeats.
pub struct Watchdog {
    registry: Arc<TaskRegistry>,
    interval: Duration,
    metrics: Metrics,
}

impl Watchdog {
    pub fn new(registry: Arc<TaskRegistry>, interval: Duration) -> Self {
        Watchdog {
            registry,
            interval: interval.max(Duration::from_millis(1)),
            metrics: Metrics::global(),
        }
    }

    /// Heartbeat age beyond which a task is stalled.
    pub fn stall_threshold(&self) -> Duration {
        self.interval * 2
    }

    /// Logs and returns the currently stalled tasks.
    pub fn check_stalled(&self) -> Vec<String> {
        let stalled = self.registry.stalled(self.stall_threshold());
        for task_id in &stalled {
            self.metrics.stalled_task();
            warn!(task_id = task_id.as_str(), threshold_ms = self.stall_threshold().as_millis() as u64, "task stalled");
        }
        stalled
    }

    /// Polls the registry every interval until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("watchdog stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.check_stalled();
                    }
                }
            }
        })
    }
}

/// Supervises task execution with deadlines and the circuit breaker.
pub struct TimeoutController {
    policy: TimeoutPolicy,
    breaker: Arc<CircuitBreaker>,
    registry: Arc<TaskRegistry>,
    metrics: Metrics,
}

impl TimeoutController {
    pub fn new(policy: TimeoutPolicy, breaker: Arc<CircuitBreaker>, registry: Arc<TaskRegistry>) -> Self {
        TimeoutController {
            policy,
            breaker,
            registry,
            metrics: Metrics::global(),
        }
    }

    pub fn policy(&self) -> TimeoutPolicy {
        self.policy
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Applies the escalation of `severity` to `task_id`.
    pub async fn handle_timeout(
        &self,
        task_id: &str,
        severity: TimeoutSeverity,
        executor: &Arc<dyn TaskExecutor>,
    ) {
        let elapsed_ms = self.policy.deadline(severity).as_millis() as u64;

        match severity {
            TimeoutSeverity::Soft => {
                warn!(task_id, elapsed_ms, "task exceeded soft timeout");
                let executor = executor.clone();
                let task_id = task_id.to_owned();
                tokio::spawn(async move {
                    let report = executor.diagnostics(&task_id).await;
                    info!(task_id = task_id.as_str(), diagnostics = report.as_deref().unwrap_or("none"), "task diagnostics");
                });
            }
            TimeoutSeverity::Hard => {
                error!(task_id, elapsed_ms, "task exceeded hard timeout, cancelling");
                if let Err(err) = executor.cancel(task_id).await {
                    error!(error = err.to_string(), task_id, "failure to cancel task");
                }
                let executor = executor.clone();
                let task_id = task_id.to_owned();
                tokio::spawn(async move {
                    if let Err(err) = executor.release_resources(&task_id).await {
                        error!(error = err.to_string(), task_id = task_id.as_str(), "failure to release task resources");
                    }
                });
                self.breaker.record_failure(FailureKind::Transient);
            }
            TimeoutSeverity::Critical => {
                error!(task_id, elapsed_ms, "task exceeded critical timeout");
                self.metrics.critical_timeout(task_id);
                self.breaker.record_failure(FailureKind::Critical);
            }
        }
    }

    /// Runs `task` under supervision.
    ///
    /// After a hard timeout the task is still awaited so it can wind down; reaching the
    /// critical deadline abandons it.
    pub async fn run<T, F>(
        &self,
        task_id: &str,
        executor: Arc<dyn TaskExecutor>,
        task: F,
    ) -> Result<T, TaskError>
    where
        F: Future<Output = Result<T, TaskError>> + Send,
    {
        if self.breaker.state() == CircuitState::Open {
            warn!(task_id, "circuit breaker open, refusing task");
            return Err(TaskError::CircuitOpen);
        }

        let Some(lease) = self.registry.try_register(task_id) else {
            warn!(task_id, "task already running, refusing duplicate");
            return Err(TaskError::AlreadyRunning(task_id.to_owned()));
        };
        let registration = Registration {
            registry: &self.registry,
            task_id,
            lease,
        };
        let started = Instant::now();
        tokio::pin!(task);

        let mut escalated: Option<TimeoutSeverity> = None;
        let outcome = loop {
            let next = match escalated {
                None => TimeoutSeverity::Soft,
                Some(TimeoutSeverity::Soft) => TimeoutSeverity::Hard,
                Some(TimeoutSeverity::Hard) | Some(TimeoutSeverity::Critical) => {
                    TimeoutSeverity::Critical
                }
            };

            tokio::select! {
                result = &mut task => break result.map_err(|err| (err, escalated)),
                _ = tokio::time::sleep_until(started + self.policy.deadline(next)) => {
                    self.handle_timeout(task_id, next, &executor).await;
                    escalated = Some(next);
                    if next == TimeoutSeverity::Critical {
                        break Err((
                            TaskError::TimedOut(task_id.to_owned(), started.elapsed()),
                            escalated,
                        ));
                    }
                }
            }
        };

        drop(registration);

        match outcome {
            Ok(value) => {
                if escalated.is_none() || escalated == Some(TimeoutSeverity::Soft) {
                    self.breaker.record_success();
                }
                debug!(task_id, elapsed_ms = started.elapsed().as_millis() as u64, "task finished");
                Ok(value)
            }
            // already recorded by the hard or critical escalation
            Err((_, Some(TimeoutSeverity::Hard))) => {
                Err(TaskError::TimedOut(task_id.to_owned(), started.elapsed()))
            }
            Err((err, Some(TimeoutSeverity::Critical))) => Err(err),
            Err((err, _)) => {
                self.breaker.record_failure(FailureKind::Transient);
                Err(err)
            }
        }
    }
}

/// Removes a supervised task from the registry however its run ends, including when
/// the run future itself is dropped.
struct Registration<'a> {
    registry: &'a TaskRegistry,
    task_id: &'a str,
    lease: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.release(self.task_id, self.lease);
    }
}
