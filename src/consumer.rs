// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module provides the [`Consumer`] trait and the standard per-message consumer.
//! Every consumer sets the queue prefetch before consuming and runs its delivery loop
//! in a dedicated task that stops on the caller's cancellation token or on `close()`.
//!
//! Settlement rules shared by every consumer:
//! - handler success acks the delivery
//! - a backpressure error nacks with requeue, deferring the message
//! - any other error nacks without requeue, handing the message to the queue's
//!   dead-letter exchange
//!
//! No retry policy lives here; retries are driven by the dead-letter consumer.

use crate::{
    connection::{ConnectionManager, PooledConnection},
    delivery::Delivery,
    errors::{AmqpError, HandlerError},
    handler::MessageHandler,
    metrics::{Metrics, Outcome},
    otel,
    transport::{BrokerChannel, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Consumes a queue, handing each message to a [`MessageHandler`].
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Starts consuming `queue` in the background.
    ///
    /// Returns once the subscription is established. The delivery loop runs until
    /// `shutdown` is cancelled or the consumer is closed.
    async fn consume(
        &self,
        shutdown: CancellationToken,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), AmqpError>;

    /// Stops every delivery loop and releases the broker resources. Idempotent.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Applies the handler outcome to the delivery.
pub(crate) async fn settle(
    delivery: Delivery,
    result: &Result<(), HandlerError>,
    queue: &str,
    metrics: &Metrics,
) -> Result<(), AmqpError> {
    let tag = delivery.delivery_tag;

    let (outcome, settled) = match result {
        Ok(()) => (Outcome::Ack, delivery.ack().await),
        Err(err) if err.requeue() => (Outcome::Requeue, delivery.nack(true).await),
        Err(_) => (Outcome::Nack, delivery.nack(false).await),
    };

    match settled {
        Ok(()) => {
            metrics.consumed(queue, outcome);
            debug!(queue, delivery_tag = tag, outcome = outcome.as_str(), "message settled");
            Ok(())
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                queue,
                delivery_tag = tag,
                outcome = outcome.as_str(),
                "failure to settle message"
            );
            Err(err)
        }
    }
}

/// Runs one delivery through `handler` inside a consumer span and settles it.
pub(crate) async fn process(
    delivery: Delivery,
    queue: &str,
    handler: &dyn MessageHandler,
    tracer: &BoxedTracer,
    metrics: &Metrics,
) {
    let (ctx, mut span) = otel::new_span(delivery.headers(), tracer, queue);

    debug!(
        queue,
        exchange = %delivery.exchange,
        routing_key = %delivery.routing_key,
        redelivered = delivery.redelivered,
        "message received"
    );

    let result = match delivery.payload().await {
        Ok(body) => handler.handle_message(&ctx, &body).await,
        Err(err) => Err(HandlerError::from(err)),
    };

    match &result {
        Ok(()) => span.set_status(Status::Ok),
        Err(err) => {
            warn!(error = err.to_string(), queue, "handler failure");
            otel::record_failure(&mut span, err, "handler failure");
        }
    }

    if let Err(err) = settle(delivery, &result, queue, metrics).await {
        otel::record_failure(&mut span, &err, "failure to settle message");
    }
}

struct Subscription {
    queue: String,
    conn: PooledConnection,
    channel: Arc<dyn BrokerChannel>,
    handle: JoinHandle<()>,
}

/// Subscriptions owned by a consumer and their shared stop signal.
pub(crate) struct Workers {
    manager: Arc<ConnectionManager>,
    done: CancellationToken,
    closed: AtomicBool,
    active: Mutex<Vec<Subscription>>,
}

impl Workers {
    pub(crate) fn new(manager: Arc<ConnectionManager>) -> Self {
        Workers {
            manager,
            done: CancellationToken::new(),
            closed: AtomicBool::new(false),
            active: Mutex::new(Vec::new()),
        }
    }

    /// Signal cancelled by `close()`.
    pub(crate) fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Opens a channel with `prefetch` and registers a consumer on `queue`.
    pub(crate) async fn open(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<(PooledConnection, Arc<dyn BrokerChannel>, DeliveryStream), AmqpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AmqpError::AlreadyClosed);
        }

        let conn = self.manager.get_connection().await?;

        let opened = async {
            let channel = conn.connection().create_channel().await?;
            let stream = async {
                channel.basic_qos(prefetch).await?;
                let tag = format!("{}-{}", queue, Uuid::new_v4());
                channel.basic_consume(queue, &tag).await
            }
            .await;

            match stream {
                Ok(stream) => Ok((channel, stream)),
                Err(err) => {
                    let _ = channel.close().await;
                    Err(err)
                }
            }
        }
        .await;

        match opened {
            Ok((channel, stream)) => {
                info!(queue, prefetch, "consumer started");
                Ok((conn, channel, stream))
            }
            Err(err) => {
                error!(error = err.to_string(), queue, "failure to start consumer");
                self.manager.release_connection(&conn);
                Err(err)
            }
        }
    }

    /// Keeps the subscription until `close()`; tears it down at once if already closed.
    pub(crate) async fn track(
        &self,
        queue: &str,
        conn: PooledConnection,
        channel: Arc<dyn BrokerChannel>,
        handle: JoinHandle<()>,
    ) {
        let sub = Subscription {
            queue: queue.to_owned(),
            conn,
            channel,
            handle,
        };

        {
            let mut active = self.active.lock();
            if !self.closed.load(Ordering::Acquire) {
                active.push(sub);
                return;
            }
        }

        self.teardown(sub).await;
    }

    pub(crate) async fn close(&self) -> Result<(), AmqpError> {
        let subs = {
            let mut active = self.active.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            std::mem::take(&mut *active)
        };

        self.done.cancel();

        for sub in subs {
            self.teardown(sub).await;
        }

        Ok(())
    }

    async fn teardown(&self, sub: Subscription) {
        self.done.cancel();
        if let Err(err) = sub.handle.await {
            error!(error = err.to_string(), queue = sub.queue, "consumer task failed");
        }
        if let Err(err) = sub.channel.close().await {
            debug!(error = err.to_string(), queue = sub.queue, "closing consumer channel");
        }
        self.manager.release_connection(&sub.conn);
        info!(queue = sub.queue, "consumer stopped");
    }
}

/// Waits for the next delivery or a stop signal. `None` ends the loop.
pub(crate) async fn next_delivery(
    stream: &mut DeliveryStream,
    shutdown: &CancellationToken,
    done: &CancellationToken,
    queue: &str,
) -> Option<Delivery> {
    let next = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return None,
        _ = done.cancelled() => return None,
        next = stream.next() => next,
    };

    match next {
        Some(Ok(delivery)) => Some(delivery),
        Some(Err(err)) => {
            error!(error = err.to_string(), queue, "delivery stream failure");
            None
        }
        None => {
            warn!(queue, "delivery stream ended");
            None
        }
    }
}

/// Per-message consumer: one delivery, one handler call, one settlement.
pub struct StandardConsumer {
    workers: Workers,
    prefetch: u16,
    metrics: Metrics,
}

impl StandardConsumer {
    pub fn new(manager: Arc<ConnectionManager>, prefetch: u16) -> Self {
        StandardConsumer {
            workers: Workers::new(manager),
            prefetch,
            metrics: Metrics::global(),
        }
    }
}

#[async_trait]
impl Consumer for StandardConsumer {
    async fn consume(
        &self,
        shutdown: CancellationToken,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), AmqpError> {
        let (conn, channel, mut stream) = self.workers.open(queue, self.prefetch).await?;

        let done = self.workers.done();
        let metrics = self.metrics.clone();
        let name = queue.to_owned();

        let handle = tokio::spawn(async move {
            let tracer = global::tracer(otel::TRACER_NAME);
            while let Some(delivery) = next_delivery(&mut stream, &shutdown, &done, &name).await {
                process(delivery, &name, handler.as_ref(), &tracer, &metrics).await;
            }
        });

        self.workers.track(queue, conn, channel, handle).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.workers.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::MockAcker;
    use lapin::BasicProperties;

    fn delivery(acker: MockAcker) -> Delivery {
        Delivery::new(
            1,
            "task.dispatch",
            "scan.sast.high",
            BasicProperties::default(),
            b"{}".to_vec(),
            Box::new(acker),
        )
    }

    #[tokio::test]
    async fn success_acks() {
        let mut acker = MockAcker::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker.expect_nack().never();

        settle(delivery(acker), &Ok(()), "scan.high", &Metrics::global())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backpressure_requeues() {
        let mut acker = MockAcker::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .withf(|requeue| *requeue)
            .times(1)
            .returning(|_| Ok(()));

        let result = Err(HandlerError::backpressure("scanner pool full"));
        settle(delivery(acker), &result, "scan.high", &Metrics::global())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failure_dead_letters() {
        let mut acker = MockAcker::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .withf(|requeue| !*requeue)
            .times(1)
            .returning(|_| Ok(()));

        let result = Err(HandlerError::failed("scanner crashed"));
        settle(delivery(acker), &result, "scan.high", &Metrics::global())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn settle_failure_is_reported() {
        let mut acker = MockAcker::new();
        acker
            .expect_ack()
            .times(1)
            .returning(|| Err(AmqpError::AckMessageError));

        let err = settle(delivery(acker), &Ok(()), "scan.high", &Metrics::global())
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::AckMessageError);
    }

    #[tokio::test]
    async fn malformed_payload_skips_handler() {
        let mut acker = MockAcker::new();
        acker
            .expect_nack()
            .withf(|requeue| !*requeue)
            .times(1)
            .returning(|_| Ok(()));

        let mut handler = crate::handler::MockMessageHandler::new();
        handler.expect_handle_message().never();

        let broken = Delivery::new(
            7,
            "task.dispatch",
            "scan.sast.high",
            BasicProperties::default()
                .with_content_encoding(crate::compression::GZIP_ENCODING.into()),
            b"not gzip".to_vec(),
            Box::new(acker),
        );

        let tracer = global::tracer(otel::TRACER_NAME);
        process(broken, "scan.high", &handler, &tracer, &Metrics::global()).await;
    }
}
