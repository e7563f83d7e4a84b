// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dead-Letter Consumer
//!
//! Drains the retry queue and owns the whole retry policy of the platform. For each
//! dead-lettered message it reads the broker `x-death` provenance and the application
//! `x-retry-info` bookkeeping, then either republishes the message to its original
//! exchange and routing key with an incremented attempt count, or escalates it to the
//! manual intervention queue tagged with an `x-failure-reason`.
//!
//! Decision order:
//! 1. no `x-death` header: escalate with `missing_x_death_header`
//! 2. undecodable `x-retry-info`: escalate with `invalid_retry_info`
//! 3. attempts at or above the maximum: escalate with `max_retry_exceeded`
//! 4. original destination unknown: escalate with `missing_routing_info`
//! 5. otherwise republish to the original destination
//!
//! A republish waits until the retry delay has passed since the newest `x-death`
//! entry, so attempts are spaced by the retry queue TTL even while this consumer keeps
//! the queue drained. Shutdown during that wait requeues the message.
//!
//! The retry-queue delivery is acked once the republish or escalation is confirmed by
//! the broker. If that publish fails the delivery is requeued so the message is never
//! dropped.

use crate::{
    config::DeadLetterConfigs,
    connection::ConnectionManager,
    consumer::{next_delivery, Workers},
    delivery::Delivery,
    errors::AmqpError,
    headers::{self, DeathRecord, RetryInfo},
    metrics::Metrics,
    otel,
    publisher::{PublishMessage, Publisher},
    routing,
};
use chrono::{DateTime, Utc};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use std::{fmt, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a message was sent to manual intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationReason {
    MissingXDeath,
    InvalidRetryInfo,
    MaxRetryExceeded,
    MissingRoutingInfo,
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationReason::MissingXDeath => "missing_x_death_header",
            EscalationReason::InvalidRetryInfo => "invalid_retry_info",
            EscalationReason::MaxRetryExceeded => "max_retry_exceeded",
            EscalationReason::MissingRoutingInfo => "missing_routing_info",
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Republish(RetryInfo),
    Escalate(EscalationReason),
}

/// Applies the retry policy to the headers of a dead-lettered message.
///
/// `retry_exchange` is skipped when looking for the original destination in `x-death`,
/// since the retry queue itself shows up there once a message went around.
pub fn decide(headers: Option<&FieldTable>, max_retries: u32, retry_exchange: &str) -> Decision {
    let Some(deaths) = headers::x_death(headers).filter(|d| !d.is_empty()) else {
        return Decision::Escalate(EscalationReason::MissingXDeath);
    };

    let cached = match headers::retry_info(headers) {
        Ok(info) => info,
        Err(_) => return Decision::Escalate(EscalationReason::InvalidRetryInfo),
    };

    let origin = deaths
        .iter()
        .find(|d| d.exchange != retry_exchange && !d.exchange.is_empty())
        .or_else(|| deaths.first());

    // a message that expired out of the retry queue comes back without a fresh
    // x-retry-info, but the broker keeps counting its deaths at the origin
    let counted = origin.map_or(0, |d| {
        d.count.saturating_sub(1).clamp(0, i64::from(u32::MAX)) as u32
    });
    let attempts = cached
        .as_ref()
        .map_or(0, |info| info.attempt_count)
        .max(counted);
    if attempts >= max_retries {
        return Decision::Escalate(EscalationReason::MaxRetryExceeded);
    }

    let destination = cached
        .filter(RetryInfo::has_destination)
        .map(|info| (info.original_exchange, info.original_routing_key))
        .or_else(|| {
            let origin = origin?;
            let key = origin.routing_keys.first()?;
            if origin.exchange.is_empty() || key.is_empty() {
                return None;
            }
            Some((origin.exchange.clone(), key.clone()))
        });

    let Some((exchange, routing_key)) = destination else {
        return Decision::Escalate(EscalationReason::MissingRoutingInfo);
    };

    Decision::Republish(RetryInfo {
        attempt_count: attempts + 1,
        last_retry_at: Utc::now(),
        original_exchange: exchange,
        original_routing_key: routing_key,
    })
}

/// Time left before a dead-lettered message may be republished.
///
/// Counted from the newest `x-death` time (whole seconds, as stamped by the broker).
/// Without a recorded time the full `delay` applies.
pub fn remaining_delay(deaths: &[DeathRecord], delay: Duration, now: DateTime<Utc>) -> Duration {
    let Some(newest) = deaths.iter().filter_map(|d| d.time).max() else {
        return delay;
    };

    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    let due_ms = i64::try_from(newest)
        .unwrap_or(i64::MAX)
        .saturating_mul(1_000)
        .saturating_add(delay_ms);
    let left = due_ms.saturating_sub(now.timestamp_millis()).clamp(0, delay_ms);
    Duration::from_millis(left as u64)
}

/// Consumes the retry queue, republishing or escalating each message.
pub struct DeadLetterConsumer {
    workers: Workers,
    publisher: Arc<dyn Publisher>,
    cfg: DeadLetterConfigs,
    retry_exchange: String,
    escalation_exchange: String,
    escalation_routing_key: String,
    metrics: Metrics,
}

impl DeadLetterConsumer {
    pub fn new(
        manager: Arc<ConnectionManager>,
        publisher: Arc<dyn Publisher>,
        cfg: DeadLetterConfigs,
    ) -> Self {
        DeadLetterConsumer {
            workers: Workers::new(manager),
            publisher,
            cfg,
            retry_exchange: routing::RETRY_EXCHANGE.to_owned(),
            escalation_exchange: routing::RETRY_EXCHANGE.to_owned(),
            escalation_routing_key: routing::MANUAL_INTERVENTION_ROUTING_KEY.to_owned(),
            metrics: Metrics::global(),
        }
    }

    /// Starts draining `queue`, usually [`routing::RETRY_QUEUE`].
    pub async fn consume(&self, shutdown: CancellationToken, queue: &str) -> Result<(), AmqpError> {
        let (conn, channel, mut stream) = self.workers.open(queue, self.cfg.prefetch).await?;

        let worker = RetryWorker {
            publisher: self.publisher.clone(),
            max_retries: self.cfg.max_retries,
            retry_delay: self.cfg.retry_delay(),
            retry_exchange: self.retry_exchange.clone(),
            escalation_exchange: self.escalation_exchange.clone(),
            escalation_routing_key: self.escalation_routing_key.clone(),
            metrics: self.metrics.clone(),
        };
        let done = self.workers.done();
        let name = queue.to_owned();

        let handle = tokio::spawn(async move {
            let tracer = global::tracer(otel::TRACER_NAME);
            while let Some(delivery) = next_delivery(&mut stream, &shutdown, &done, &name).await {
                worker.handle(delivery, &tracer, &shutdown, &done).await;
            }
        });

        self.workers.track(queue, conn, channel, handle).await;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.workers.close().await
    }
}

struct RetryWorker {
    publisher: Arc<dyn Publisher>,
    max_retries: u32,
    retry_delay: Duration,
    retry_exchange: String,
    escalation_exchange: String,
    escalation_routing_key: String,
    metrics: Metrics,
}

impl RetryWorker {
    async fn handle(
        &self,
        delivery: Delivery,
        tracer: &BoxedTracer,
        shutdown: &CancellationToken,
        done: &CancellationToken,
    ) {
        let (ctx, mut span) = otel::new_span(delivery.headers(), tracer, "dead-letter retry");

        let mut decision = decide(delivery.headers(), self.max_retries, &self.retry_exchange);
        if let Decision::Republish(info) = &mut decision {
            let deaths = headers::x_death(delivery.headers()).unwrap_or_default();
            let wait = remaining_delay(&deaths, self.retry_delay, Utc::now());
            if !wait.is_zero() {
                debug!(
                    routing_key = %info.original_routing_key,
                    wait_ms = wait.as_millis() as u64,
                    "holding message until its retry is due"
                );
                let stopped = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => true,
                    _ = done.cancelled() => true,
                    _ = tokio::time::sleep(wait) => false,
                };
                if stopped {
                    let tag = delivery.delivery_tag;
                    if let Err(err) = delivery.nack(true).await {
                        error!(error = err.to_string(), delivery_tag = tag, "failure to requeue retry message");
                    }
                    return;
                }
                info.last_retry_at = Utc::now();
            }
        }

        let published = match &decision {
            Decision::Republish(info) => self.republish(&ctx, &delivery, info).await,
            Decision::Escalate(reason) => self.escalate(&ctx, &delivery, *reason).await,
        };

        let tag = delivery.delivery_tag;
        let settled = match &published {
            Ok(()) => delivery.ack().await,
            Err(_) => delivery.nack(true).await,
        };

        match (&published, settled) {
            (Ok(()), Ok(())) => span.set_status(Status::Ok),
            (Err(err), _) => otel::record_failure(&mut span, err, "failure to forward message"),
            (Ok(()), Err(err)) => {
                error!(error = err.to_string(), delivery_tag = tag, "failure to ack retry message");
                otel::record_failure(&mut span, &err, "failure to ack retry message");
            }
        }
    }

    async fn republish(
        &self,
        ctx: &Context,
        delivery: &Delivery,
        info: &RetryInfo,
    ) -> Result<(), AmqpError> {
        let mut table = headers::without(
            delivery.headers(),
            &[headers::AMQP_HEADERS_X_DEATH, headers::AMQP_HEADERS_RETRY_INFO],
        );
        table.insert(
            ShortString::from(headers::AMQP_HEADERS_RETRY_INFO),
            info.to_header()?,
        );

        let msg = self.forward(
            delivery,
            &info.original_exchange,
            &info.original_routing_key,
            table,
        );

        match self.publisher.publish_message(ctx, &msg).await {
            Ok(()) => {
                self.metrics.dead_letter("retry", "scheduled");
                info!(
                    exchange = %info.original_exchange,
                    routing_key = %info.original_routing_key,
                    attempt = info.attempt_count,
                    "message republished for retry"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = %info.original_exchange,
                    routing_key = %info.original_routing_key,
                    "failure to republish message, requeueing"
                );
                Err(err)
            }
        }
    }

    async fn escalate(
        &self,
        ctx: &Context,
        delivery: &Delivery,
        reason: EscalationReason,
    ) -> Result<(), AmqpError> {
        let mut table = headers::without(delivery.headers(), &[]);
        table.insert(
            ShortString::from(headers::AMQP_HEADERS_FAILURE_REASON),
            AMQPValue::LongString(LongString::from(reason.as_str())),
        );

        let msg = self.forward(
            delivery,
            &self.escalation_exchange,
            &self.escalation_routing_key,
            table,
        );

        match self.publisher.publish_message(ctx, &msg).await {
            Ok(()) => {
                self.metrics.dead_letter("escalate", reason.as_str());
                warn!(
                    reason = reason.as_str(),
                    routing_key = %delivery.routing_key,
                    "message escalated to manual intervention"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    reason = reason.as_str(),
                    "failure to escalate message, requeueing"
                );
                Err(AmqpError::EscalationError(err.to_string()))
            }
        }
    }

    /// Copies body and properties of `delivery` into a message for `exchange`.
    fn forward(
        &self,
        delivery: &Delivery,
        exchange: &str,
        routing_key: &str,
        table: FieldTable,
    ) -> PublishMessage {
        let mut msg = PublishMessage::new(exchange, routing_key, delivery.data.clone()).headers(table);

        if let Some(priority) = delivery.priority() {
            msg = msg.priority(priority);
        }
        if let Some(kind) = delivery.properties.kind() {
            msg = msg.msg_type(kind.as_str());
        }
        if let Some(encoding) = delivery.content_encoding() {
            msg = msg.content_encoding(encoding);
        }

        msg
    }
}
