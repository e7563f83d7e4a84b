// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Metrics
//!
//! OpenTelemetry instruments recorded by the publisher, the consumers, the connection
//! manager and the resilience layer. Instruments come from the global meter provider,
//! so they are no-ops until the embedding process installs an exporter.

use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};
use std::fmt;

/// Name of the meter every instrument is created from.
pub const METER_NAME: &str = "rabbitmq-tasks";

/// Settlement recorded for a consumed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Nack,
    Requeue,
    Reject,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ack => "ack",
            Outcome::Nack => "nack",
            Outcome::Requeue => "requeue",
            Outcome::Reject => "reject",
        }
    }
}

#[derive(Clone)]
pub struct Metrics {
    published: Counter<u64>,
    publish_failures: Counter<u64>,
    consumed: Counter<u64>,
    reconnects: Counter<u64>,
    batch_size: Histogram<u64>,
    batch_duration: Histogram<f64>,
    batch_messages: Counter<u64>,
    dead_letter: Counter<u64>,
    deduplicated: Counter<u64>,
    breaker_failures: Counter<u64>,
    critical_timeouts: Counter<u64>,
    stalled_tasks: Counter<u64>,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::global()
    }
}

impl Metrics {
    /// Instruments bound to the global meter provider.
    pub fn global() -> Self {
        Self::new(&global::meter(METER_NAME))
    }

    pub fn new(meter: &Meter) -> Self {
        Metrics {
            published: meter
                .u64_counter("amqp.publish.messages")
                .with_description("Messages confirmed by the broker")
                .build(),
            publish_failures: meter
                .u64_counter("amqp.publish.failures")
                .with_description("Failed publish attempts")
                .build(),
            consumed: meter
                .u64_counter("amqp.consume.messages")
                .with_description("Deliveries settled by consumers")
                .build(),
            reconnects: meter
                .u64_counter("amqp.connection.reconnects")
                .with_description("Reconnect attempts after a connection was lost")
                .build(),
            batch_size: meter
                .u64_histogram("amqp.batch.size")
                .with_description("Messages per flushed batch")
                .build(),
            batch_duration: meter
                .f64_histogram("amqp.batch.duration")
                .with_unit("s")
                .with_description("Batch handler processing time")
                .build(),
            batch_messages: meter
                .u64_counter("amqp.batch.messages")
                .with_description("Batched messages by result")
                .build(),
            dead_letter: meter
                .u64_counter("amqp.dead_letter.messages")
                .with_description("Dead-letter decisions by action and reason")
                .build(),
            deduplicated: meter
                .u64_counter("amqp.idempotency.duplicates")
                .with_description("Deliveries skipped as already processed")
                .build(),
            breaker_failures: meter
                .u64_counter("task.circuit_breaker.failures")
                .with_description("Failures recorded by the circuit breaker")
                .build(),
            critical_timeouts: meter
                .u64_counter("task.timeouts.critical")
                .with_description("Tasks exceeding the critical timeout")
                .build(),
            stalled_tasks: meter
                .u64_counter("task.watchdog.stalled")
                .with_description("Tasks flagged as stalled by the watchdog")
                .build(),
        }
    }

    pub fn published(&self, exchange: &str) {
        self.published
            .add(1, &[KeyValue::new("exchange", exchange.to_owned())]);
    }

    pub fn publish_failed(&self, exchange: &str) {
        self.publish_failures
            .add(1, &[KeyValue::new("exchange", exchange.to_owned())]);
    }

    pub fn consumed(&self, queue: &str, outcome: Outcome) {
        self.consumed.add(
            1,
            &[
                KeyValue::new("queue", queue.to_owned()),
                KeyValue::new("outcome", outcome.as_str()),
            ],
        );
    }

    pub fn reconnect_attempt(&self) {
        self.reconnects.add(1, &[]);
    }

    pub fn batch(&self, queue: &str, size: usize, seconds: f64, succeeded: u64, failed: u64) {
        let queue = KeyValue::new("queue", queue.to_owned());
        self.batch_size.record(size as u64, &[queue.clone()]);
        self.batch_duration.record(seconds, &[queue.clone()]);
        self.batch_messages
            .add(succeeded, &[queue.clone(), KeyValue::new("result", "success")]);
        self.batch_messages
            .add(failed, &[queue, KeyValue::new("result", "failure")]);
    }

    pub fn dead_letter(&self, action: &'static str, reason: &'static str) {
        self.dead_letter.add(
            1,
            &[
                KeyValue::new("action", action),
                KeyValue::new("reason", reason),
            ],
        );
    }

    pub fn deduplicated(&self) {
        self.deduplicated.add(1, &[]);
    }

    pub fn breaker_failure(&self, kind: &'static str) {
        self.breaker_failures
            .add(1, &[KeyValue::new("kind", kind)]);
    }

    pub fn critical_timeout(&self, task_id: &str) {
        self.critical_timeouts
            .add(1, &[KeyValue::new("task_id", task_id.to_owned())]);
    }

    pub fn stalled_task(&self) {
        self.stalled_tasks.add(1, &[]);
    }
}
