// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Batch Consumer
//!
//! Accumulates deliveries and hands them to a batch handler. A batch is flushed when it
//! reaches the configured size or when the rolling flush timer elapses, whichever comes
//! first; the timer restarts after every flush.
//!
//! Two modes are supported:
//! - [`BatchMode::Whole`]: a single outcome for the batch. Success acks every message,
//!   failure nacks every message with requeue.
//! - [`BatchMode::PerMessage`]: one outcome per message. Each message is acked or
//!   nacked with requeue on its own, so a batch may partially succeed.

use crate::{
    config::ConsumerConfigs,
    connection::ConnectionManager,
    consumer::{next_delivery, Consumer, Workers},
    delivery::Delivery,
    errors::{AmqpError, HandlerError},
    handler::{BatchHandler, BatchResultHandler, EachMessage, MessageHandler},
    metrics::{Metrics, Outcome},
    otel,
};
use async_trait::async_trait;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How a flushed batch is handled and settled.
#[derive(Clone)]
pub enum BatchMode {
    Whole(Arc<dyn BatchHandler>),
    PerMessage(Arc<dyn BatchResultHandler>),
}

/// Running totals of a batch consumer.
#[derive(Debug, Default)]
pub struct BatchStats {
    batches: AtomicU64,
    messages: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    last_batch_size: AtomicU64,
}

/// Point-in-time copy of [`BatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStatsSnapshot {
    pub batches: u64,
    pub messages: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub last_batch_size: u64,
}

impl BatchStats {
    fn record(&self, size: u64, succeeded: u64, failed: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.messages.fetch_add(size, Ordering::Relaxed);
        self.succeeded.fetch_add(succeeded, Ordering::Relaxed);
        self.failed.fetch_add(failed, Ordering::Relaxed);
        self.last_batch_size.store(size, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BatchStatsSnapshot {
        BatchStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_batch_size: self.last_batch_size.load(Ordering::Relaxed),
        }
    }
}

/// Pending deliveries of one subscription.
struct Batcher {
    queue: String,
    size: usize,
    pending: Mutex<Vec<Delivery>>,
    mode: BatchMode,
    stats: Arc<BatchStats>,
    metrics: Metrics,
}

impl Batcher {
    /// Adds a delivery, returning the batch when it became full.
    fn push(&self, delivery: Delivery) -> Option<Vec<Delivery>> {
        let mut pending = self.pending.lock();
        pending.push(delivery);
        if pending.len() >= self.size {
            Some(std::mem::take(&mut *pending))
        } else {
            None
        }
    }

    fn take(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.pending.lock())
    }

    async fn flush(&self, batch: Vec<Delivery>, tracer: &BoxedTracer) {
        if batch.is_empty() {
            return;
        }

        let (ctx, mut span) = otel::new_span(batch[0].headers(), tracer, &self.queue);

        let mut deliveries = Vec::with_capacity(batch.len());
        let mut bodies = Vec::with_capacity(batch.len());
        for delivery in batch {
            match delivery.payload().await {
                Ok(body) => {
                    bodies.push(body);
                    deliveries.push(delivery);
                }
                Err(err) => {
                    warn!(error = err.to_string(), queue = %self.queue, "dropping undecodable message");
                    self.settle(delivery, false, false).await;
                }
            }
        }

        if deliveries.is_empty() {
            return;
        }

        let size = deliveries.len();
        let started = Instant::now();
        let results = self.run(&ctx, &bodies).await;
        let elapsed = started.elapsed();

        let mut succeeded = 0u64;
        let mut failed = 0u64;
        for (delivery, result) in deliveries.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    succeeded += 1;
                    self.settle(delivery, true, false).await;
                }
                Err(err) => {
                    failed += 1;
                    debug!(error = err.to_string(), queue = %self.queue, "batched message failed");
                    self.settle(delivery, false, true).await;
                }
            }
        }

        self.stats.record(size as u64, succeeded, failed);
        self.metrics
            .batch(&self.queue, size, elapsed.as_secs_f64(), succeeded, failed);

        if failed == 0 {
            span.set_status(Status::Ok);
        } else {
            otel::record_failure(
                &mut span,
                &HandlerError::failed(format!("{} of {} messages failed", failed, size)),
                "batch failure",
            );
        }

        debug!(
            queue = %self.queue,
            size,
            succeeded,
            failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "batch flushed"
        );
    }

    /// One result per body, in order.
    async fn run(&self, ctx: &Context, bodies: &[Vec<u8>]) -> Vec<Result<(), HandlerError>> {
        match &self.mode {
            BatchMode::Whole(handler) => {
                let outcome = handler.handle_batch(ctx, bodies).await;
                vec![outcome; bodies.len()]
            }
            BatchMode::PerMessage(handler) => {
                let mut results = handler.handle_batch(ctx, bodies).await;
                if results.len() != bodies.len() {
                    warn!(
                        queue = %self.queue,
                        expected = bodies.len(),
                        got = results.len(),
                        "batch handler returned a mismatched number of results"
                    );
                }
                results.resize_with(bodies.len(), || {
                    Err(HandlerError::failed("no result returned for message"))
                });
                results
            }
        }
    }

    async fn settle(&self, delivery: Delivery, success: bool, requeue: bool) {
        let tag = delivery.delivery_tag;
        let (outcome, settled) = if success {
            (Outcome::Ack, delivery.ack().await)
        } else if requeue {
            (Outcome::Requeue, delivery.nack(true).await)
        } else {
            (Outcome::Nack, delivery.nack(false).await)
        };

        match settled {
            Ok(()) => self.metrics.consumed(&self.queue, outcome),
            Err(err) => error!(
                error = err.to_string(),
                queue = %self.queue,
                delivery_tag = tag,
                "failure to settle batched message"
            ),
        }
    }

    /// Returns unprocessed deliveries to the queue.
    async fn requeue_pending(&self) {
        let pending = self.take();
        if !pending.is_empty() {
            debug!(queue = %self.queue, count = pending.len(), "requeueing pending batch");
        }
        for delivery in pending {
            self.settle(delivery, false, true).await;
        }
    }
}

/// Consumer delivering messages to a handler in batches.
pub struct BatchConsumer {
    workers: Workers,
    prefetch: u16,
    batch_size: usize,
    batch_timeout: Duration,
    stats: Arc<BatchStats>,
    metrics: Metrics,
}

impl BatchConsumer {
    pub fn new(manager: Arc<ConnectionManager>, cfg: &ConsumerConfigs) -> Self {
        BatchConsumer {
            workers: Workers::new(manager),
            // the broker must be allowed to push at least one full batch
            prefetch: cfg.prefetch.max(cfg.batch_size.min(u16::MAX as usize) as u16),
            batch_size: cfg.batch_size.max(1),
            batch_timeout: cfg.batch_timeout(),
            stats: Arc::new(BatchStats::default()),
            metrics: Metrics::global(),
        }
    }

    pub fn stats(&self) -> BatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Starts consuming `queue` in batches.
    pub async fn consume_batches(
        &self,
        shutdown: CancellationToken,
        queue: &str,
        mode: BatchMode,
    ) -> Result<(), AmqpError> {
        let (conn, channel, mut stream) = self.workers.open(queue, self.prefetch).await?;

        let batcher = Batcher {
            queue: queue.to_owned(),
            size: self.batch_size,
            pending: Mutex::new(Vec::with_capacity(self.batch_size)),
            mode,
            stats: self.stats.clone(),
            metrics: self.metrics.clone(),
        };
        let timeout = self.batch_timeout;
        let done = self.workers.done();

        let handle = tokio::spawn(async move {
            let tracer = global::tracer(otel::TRACER_NAME);
            let timer = tokio::time::sleep(timeout);
            tokio::pin!(timer);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut timer => {
                        let batch = batcher.take();
                        batcher.flush(batch, &tracer).await;
                        timer.as_mut().reset(Instant::now() + timeout);
                    }
                    next = next_delivery(&mut stream, &shutdown, &done, &batcher.queue) => {
                        let Some(delivery) = next else {
                            break;
                        };
                        if let Some(batch) = batcher.push(delivery) {
                            batcher.flush(batch, &tracer).await;
                            timer.as_mut().reset(Instant::now() + timeout);
                        }
                    }
                }
            }

            batcher.requeue_pending().await;
        });

        self.workers.track(queue, conn, channel, handle).await;
        Ok(())
    }
}

#[async_trait]
impl Consumer for BatchConsumer {
    /// Batches deliveries and runs `handler` over each message of a flushed batch.
    async fn consume(
        &self,
        shutdown: CancellationToken,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), AmqpError> {
        self.consume_batches(shutdown, queue, BatchMode::PerMessage(Arc::new(EachMessage(handler))))
            .await
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.workers.close().await
    }
}
