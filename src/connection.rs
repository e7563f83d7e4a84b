// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Pool
//!
//! [`ConnectionManager`] owns a bounded pool of broker connections. Connections are
//! opened lazily up to the configured maximum and handed out exclusively until they
//! are released. Every pooled connection has a monitor task: when the broker closes
//! the connection the monitor reports `connected = false`, redials with exponential
//! backoff until it succeeds, swaps the fresh handle into the pool slot and reports
//! `connected = true`.

use crate::{
    config::PoolConfigs,
    errors::AmqpError,
    metrics::Metrics,
    transport::{BrokerConnection, Connector},
};
use parking_lot::Mutex;
use std::{fmt, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Callback invoked with the connectivity of a pooled connection.
pub type StateChangeCallback = Arc<dyn Fn(u64, bool) + Send + Sync>;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_configs(cfg: &PoolConfigs) -> Self {
        ReconnectPolicy {
            initial: cfg.initial_backoff(),
            max: cfg.max_backoff(),
        }
    }

    /// Delay before the reconnect attempt number `attempt` (0-based): doubles each time, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// A connection checked out of the pool.
#[derive(Clone)]
pub struct PooledConnection {
    id: u64,
    connection: Arc<dyn BrokerConnection>,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("connected", &self.connection.is_connected())
            .finish()
    }
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.connection
    }
}

/// Pool occupancy snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub opening: usize,
}

struct ManagedConnection {
    id: u64,
    connection: Arc<dyn BrokerConnection>,
    in_use: bool,
}

#[derive(Default)]
struct Pool {
    connections: Vec<ManagedConnection>,
    opening: usize,
    next_id: u64,
    closed: bool,
}

impl Pool {
    fn current(&self, id: u64) -> Option<Arc<dyn BrokerConnection>> {
        self.connections
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.connection.clone())
    }
}

/// Bounded pool of self-healing broker connections.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    max_connections: usize,
    policy: ReconnectPolicy,
    pool: Arc<Mutex<Pool>>,
    on_state_change: Option<StateChangeCallback>,
    metrics: Metrics,
    shutdown: CancellationToken,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, cfg: &PoolConfigs) -> Self {
        ConnectionManager {
            connector,
            max_connections: cfg.max_connections.max(1),
            policy: ReconnectPolicy::from_configs(cfg),
            pool: Arc::new(Mutex::new(Pool::default())),
            on_state_change: None,
            metrics: Metrics::global(),
            shutdown: CancellationToken::new(),
            monitors: Mutex::new(Vec::new()),
        }
    }

    /// Registers a callback invoked whenever a pooled connection goes down or comes back.
    pub fn with_state_callback(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Checks out an idle connection, opening a new one while the pool has room.
    pub async fn get_connection(&self) -> Result<PooledConnection, AmqpError> {
        let id = {
            let mut pool = self.pool.lock();
            if pool.closed {
                return Err(AmqpError::PoolClosed);
            }

            if let Some(idle) = pool
                .connections
                .iter_mut()
                .find(|c| !c.in_use && c.connection.is_connected())
            {
                idle.in_use = true;
                debug!(connection_id = idle.id, "reusing pooled connection");
                return Ok(PooledConnection {
                    id: idle.id,
                    connection: idle.connection.clone(),
                });
            }

            if pool.connections.len() + pool.opening >= self.max_connections {
                warn!(max = self.max_connections, "connection pool exhausted");
                return Err(AmqpError::PoolExhausted);
            }

            pool.opening += 1;
            pool.next_id += 1;
            pool.next_id
        };

        let connected = self.connector.connect().await;

        let admitted = {
            let mut pool = self.pool.lock();
            pool.opening -= 1;
            let connection = connected?;

            if pool.closed {
                Err(connection)
            } else {
                pool.connections.push(ManagedConnection {
                    id,
                    connection: connection.clone(),
                    in_use: true,
                });
                Ok(connection)
            }
        };

        let connection = match admitted {
            Ok(connection) => connection,
            Err(stale) => {
                let _ = stale.close().await;
                return Err(AmqpError::PoolClosed);
            }
        };

        info!(connection_id = id, "opened pooled connection");
        self.spawn_monitor(id);

        Ok(PooledConnection { id, connection })
    }

    /// Returns a connection to the idle set.
    pub fn release_connection(&self, conn: &PooledConnection) {
        let mut pool = self.pool.lock();
        if let Some(managed) = pool.connections.iter_mut().find(|c| c.id == conn.id) {
            managed.in_use = false;
            debug!(connection_id = conn.id, "released pooled connection");
        }
    }

    /// Closes `conn` and dials a replacement into the same pool slot.
    ///
    /// The returned connection stays checked out by the caller.
    pub async fn reconnect(&self, conn: &PooledConnection) -> Result<PooledConnection, AmqpError> {
        if self.pool.lock().closed {
            return Err(AmqpError::PoolClosed);
        }

        let fresh = self.connector.connect().await?;

        let replaced = {
            let mut pool = self.pool.lock();
            match pool.connections.iter_mut().find(|c| c.id == conn.id) {
                Some(managed) => {
                    managed.connection = fresh.clone();
                    managed.in_use = true;
                    true
                }
                None => false,
            }
        };

        if let Err(err) = conn.connection.close().await {
            debug!(error = err.to_string(), "closing stale connection");
        }

        if !replaced {
            let _ = fresh.close().await;
            return Err(AmqpError::PoolClosed);
        }

        info!(connection_id = conn.id, "connection replaced");
        Ok(PooledConnection {
            id: conn.id,
            connection: fresh,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let pool = self.pool.lock();
        let in_use = pool.connections.iter().filter(|c| c.in_use).count();
        PoolStats {
            total: pool.connections.len(),
            idle: pool.connections.len() - in_use,
            in_use,
            opening: pool.opening,
        }
    }

    /// Stops every monitor and closes every pooled connection.
    ///
    /// Further checkouts fail with [`AmqpError::PoolClosed`]; calling it again is a no-op.
    pub async fn close_all(&self) -> Result<(), AmqpError> {
        let connections = {
            let mut pool = self.pool.lock();
            if pool.closed {
                return Ok(());
            }
            pool.closed = true;
            std::mem::take(&mut pool.connections)
        };

        self.shutdown.cancel();
        let monitors = std::mem::take(&mut *self.monitors.lock());
        for monitor in monitors {
            let _ = monitor.await;
        }

        let mut result = Ok(());
        for managed in connections {
            if let Err(err) = managed.connection.close().await {
                error!(
                    error = err.to_string(),
                    connection_id = managed.id,
                    "failure to close pooled connection"
                );
                result = Err(err);
            }
        }

        info!("connection pool closed");
        result
    }

    fn spawn_monitor(&self, id: u64) {
        let monitor = Monitor {
            id,
            connector: self.connector.clone(),
            pool: self.pool.clone(),
            policy: self.policy,
            on_state_change: self.on_state_change.clone(),
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.child_token(),
        };

        self.monitors.lock().push(tokio::spawn(monitor.run()));
    }
}

struct Monitor {
    id: u64,
    connector: Arc<dyn Connector>,
    pool: Arc<Mutex<Pool>>,
    policy: ReconnectPolicy,
    on_state_change: Option<StateChangeCallback>,
    metrics: Metrics,
    shutdown: CancellationToken,
}

impl Monitor {
    async fn run(self) {
        loop {
            let Some(watched) = self.pool.lock().current(self.id) else {
                return;
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = watched.closed() => {}
            }

            // reconnect() swaps the slot before closing the stale handle; keep watching the new one
            let current = self.pool.lock().current(self.id);
            match current {
                Some(current) if !Arc::ptr_eq(&current, &watched) => continue,
                Some(_) => {}
                None => return,
            }

            warn!(connection_id = self.id, "connection closed, reconnecting");
            self.notify(false);

            let Some(fresh) = self.redial().await else {
                return;
            };

            {
                let mut pool = self.pool.lock();
                match pool.connections.iter_mut().find(|c| c.id == self.id) {
                    Some(managed) => managed.connection = fresh,
                    None => return,
                }
            }

            info!(connection_id = self.id, "connection re-established");
            self.notify(true);
        }
    }

    async fn redial(&self) -> Option<Arc<dyn BrokerConnection>> {
        let mut attempt = 0u32;
        loop {
            let delay = self.policy.delay(attempt);
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            self.metrics.reconnect_attempt();
            match self.connector.connect().await {
                Ok(conn) => return Some(conn),
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        connection_id = self.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "reconnect failed"
                    );
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    fn notify(&self, connected: bool) {
        if let Some(callback) = &self.on_state_change {
            callback(self.id, connected);
        }
    }
}
