// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Serde-deserializable configuration for every component of the crate. All fields
//! carry defaults so a partial TOML document (or none at all) yields a usable value.
//! Durations are expressed as integer milliseconds or seconds, matching the suffix
//! of the field name.

use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use tracing::error;

use crate::errors::AmqpError;

/// Root configuration consumed by the connection layer and the consumers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
    pub pool: PoolConfigs,
    pub publisher: PublisherConfigs,
    pub consumer: ConsumerConfigs,
    pub idempotency: IdempotencyConfigs,
    pub dead_letter: DeadLetterConfigs,
    pub scheduler: SchedulerConfigs,
    pub resilience: ResilienceConfigs,
}

impl Configs {
    /// Parses a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, AmqpError> {
        toml::from_str(raw).map_err(|err| {
            error!(error = err.to_string(), "failure to parse configs");
            AmqpError::ParsePayloadError(err.to_string())
        })
    }

    /// Reads and parses a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AmqpError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            error!(
                error = err.to_string(),
                path = %path.as_ref().display(),
                "failure to read configs"
            );
            AmqpError::ParsePayloadError(err.to_string())
        })?;

        Self::from_toml_str(&raw)
    }

    /// Renders the AMQP URI for the configured broker.
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.rabbitmq.user,
            self.rabbitmq.password,
            self.rabbitmq.host,
            self.rabbitmq.port,
            self.rabbitmq.vhost.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfigs {
    /// Used as the AMQP connection name.
    pub name: String,
}

impl Default for AppConfigs {
    fn default() -> Self {
        Self {
            name: "rabbitmq-tasks".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
        }
    }
}

/// Connection pool sizing and reconnect backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfigs {
    pub max_connections: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for PoolConfigs {
    fn default() -> Self {
        Self {
            max_connections: 10,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl PoolConfigs {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfigs {
    /// Total publish attempts before giving up.
    pub max_retries: u32,
    pub retry_interval_ms: u64,
    pub confirm_timeout_ms: u64,
    /// Bodies larger than this are gzip-compressed. `None` disables compression.
    pub compress_above_bytes: Option<usize>,
}

impl Default for PublisherConfigs {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval_ms: 1_000,
            confirm_timeout_ms: 5_000,
            compress_above_bytes: None,
        }
    }
}

impl PublisherConfigs {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfigs {
    pub prefetch: u16,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
}

impl Default for ConsumerConfigs {
    fn default() -> Self {
        Self {
            prefetch: 10,
            batch_size: 50,
            batch_timeout_ms: 5_000,
        }
    }
}

impl ConsumerConfigs {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfigs {
    pub max_entries: usize,
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for IdempotencyConfigs {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl_secs: 3_600,
            sweep_interval_secs: 60,
        }
    }
}

impl IdempotencyConfigs {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfigs {
    pub max_retries: u32,
    pub prefetch: u16,
    /// Wait between a failure and its republish, counted from the newest `x-death` time.
    /// Matches the retry queue TTL.
    pub retry_delay_ms: u64,
}

impl Default for DeadLetterConfigs {
    fn default() -> Self {
        Self {
            max_retries: 3,
            prefetch: 1,
            retry_delay_ms: 300_000,
        }
    }
}

impl DeadLetterConfigs {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfigs {
    pub tier_capacity: usize,
    pub high_weight: u32,
    pub medium_weight: u32,
    pub low_weight: u32,
    pub saturated_pause_ms: u64,
    pub idle_pause_ms: u64,
}

impl Default for SchedulerConfigs {
    fn default() -> Self {
        Self {
            tier_capacity: 100,
            high_weight: 60,
            medium_weight: 30,
            low_weight: 10,
            saturated_pause_ms: 500,
            idle_pause_ms: 100,
        }
    }
}

impl SchedulerConfigs {
    pub fn saturated_pause(&self) -> Duration {
        Duration::from_millis(self.saturated_pause_ms)
    }

    pub fn idle_pause(&self) -> Duration {
        Duration::from_millis(self.idle_pause_ms)
    }
}

/// Circuit breaker and timeout escalation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfigs {
    /// Total failures (transient + critical) that open the breaker.
    pub failure_threshold: u32,
    /// Critical failures that open the breaker on their own.
    pub critical_threshold: u32,
    pub reset_timeout_secs: u64,
    pub soft_timeout_secs: u64,
    pub hard_timeout_secs: u64,
    pub critical_timeout_secs: u64,
    pub watchdog_interval_secs: u64,
}

impl Default for ResilienceConfigs {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            critical_threshold: 2,
            reset_timeout_secs: 60,
            soft_timeout_secs: 300,
            hard_timeout_secs: 600,
            critical_timeout_secs: 900,
            watchdog_interval_secs: 5,
        }
    }
}

impl ResilienceConfigs {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn soft_timeout(&self) -> Duration {
        Duration::from_secs(self.soft_timeout_secs)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_secs)
    }

    pub fn critical_timeout(&self) -> Duration {
        Duration::from_secs(self.critical_timeout_secs)
    }
}
