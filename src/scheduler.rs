// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Priority Scheduler
//!
//! Buffers deliveries of the three scan tiers in bounded lanes and dispatches them one
//! at a time with a weighted random draw. On every tick:
//! - when the shared [`SystemState`] reports saturation the scheduler pauses entirely
//! - otherwise each non-empty tier contributes its weight (60/30/10 by default) and a
//!   uniform draw in `[0, total)` picks the tier
//! - an empty scheduler idles briefly before looking again
//!
//! Dispatch is synchronous: the handler outcome is settled like the standard consumer
//! does, so a backpressure error requeues the delivery instead of dead-lettering it.

use crate::{
    backpressure::SystemState,
    config::SchedulerConfigs,
    connection::ConnectionManager,
    consumer::{next_delivery, process, Workers},
    delivery::Delivery,
    errors::AmqpError,
    handler::MessageHandler,
    metrics::Metrics,
    otel,
    routing::Tier,
};
use opentelemetry::global;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Pause after picking a tier whose lane raced empty.
const NEAR_MISS_PAUSE: Duration = Duration::from_millis(10);

fn slot(tier: Tier) -> usize {
    match tier {
        Tier::High => 0,
        Tier::Medium => 1,
        Tier::Low => 2,
    }
}

/// Sum of the weights of the tiers with pending work.
pub fn total_weight(weights: [u32; 3], pending: [usize; 3]) -> u32 {
    weights
        .iter()
        .zip(pending)
        .filter(|(_, pending)| *pending > 0)
        .map(|(weight, _)| *weight)
        .sum()
}

/// Maps a draw `r` in `[0, total_weight)` to a tier, skipping empty tiers.
pub fn select_tier(weights: [u32; 3], pending: [usize; 3], r: u32) -> Option<Tier> {
    let mut upper = 0u32;
    for tier in Tier::ALL {
        let i = slot(tier);
        if pending[i] == 0 {
            continue;
        }
        upper = upper.saturating_add(weights[i]);
        if r < upper {
            return Some(tier);
        }
    }
    None
}

struct Lane {
    tx: mpsc::Sender<Delivery>,
    pending: AtomicUsize,
    dispatched: AtomicU64,
}

struct Lanes([Lane; 3]);

impl Lanes {
    fn lane(&self, tier: Tier) -> &Lane {
        &self.0[slot(tier)]
    }

    fn pending(&self) -> [usize; 3] {
        [
            self.0[0].pending.load(Ordering::Acquire),
            self.0[1].pending.load(Ordering::Acquire),
            self.0[2].pending.load(Ordering::Acquire),
        ]
    }

    /// Buffers `delivery`, waiting for room. Requeues it when a stop signal fires first.
    async fn submit(
        &self,
        tier: Tier,
        delivery: Delivery,
        shutdown: &CancellationToken,
        done: &CancellationToken,
    ) -> Result<(), AmqpError> {
        let lane = self.lane(tier);

        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            _ = done.cancelled() => None,
            permit = lane.tx.reserve() => permit.ok(),
        };

        let Some(permit) = permit else {
            let _ = delivery.nack(true).await;
            return Err(AmqpError::AlreadyClosed);
        };

        // counted before the send so the dispatcher never sees a negative backlog
        lane.pending.fetch_add(1, Ordering::AcqRel);
        permit.send(delivery);
        Ok(())
    }
}

/// Weighted dispatcher across the high, medium and low scan tiers.
pub struct PriorityScheduler {
    lanes: Arc<Lanes>,
    receivers: Mutex<Option<[mpsc::Receiver<Delivery>; 3]>>,
    state: SystemState,
    weights: [u32; 3],
    saturated_pause: Duration,
    idle_pause: Duration,
    prefetch: u16,
    seed: Option<u64>,
    workers: Workers,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    metrics: Metrics,
}

impl PriorityScheduler {
    pub fn new(
        manager: Arc<ConnectionManager>,
        cfg: &SchedulerConfigs,
        prefetch: u16,
        state: SystemState,
    ) -> Self {
        let capacity = cfg.tier_capacity.max(1);
        let (high_tx, high_rx) = mpsc::channel(capacity);
        let (medium_tx, medium_rx) = mpsc::channel(capacity);
        let (low_tx, low_rx) = mpsc::channel(capacity);

        let lane = |tx| Lane {
            tx,
            pending: AtomicUsize::new(0),
            dispatched: AtomicU64::new(0),
        };

        PriorityScheduler {
            lanes: Arc::new(Lanes([lane(high_tx), lane(medium_tx), lane(low_tx)])),
            receivers: Mutex::new(Some([high_rx, medium_rx, low_rx])),
            state,
            weights: [cfg.high_weight, cfg.medium_weight, cfg.low_weight],
            saturated_pause: cfg.saturated_pause(),
            idle_pause: cfg.idle_pause(),
            prefetch,
            seed: None,
            workers: Workers::new(manager),
            dispatcher: Mutex::new(None),
            metrics: Metrics::global(),
        }
    }

    /// Makes the tier draws reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn pending(&self, tier: Tier) -> usize {
        self.lanes.lane(tier).pending.load(Ordering::Acquire)
    }

    pub fn dispatched(&self, tier: Tier) -> u64 {
        self.lanes.lane(tier).dispatched.load(Ordering::Acquire)
    }

    /// Buffers a delivery on the lane of `tier`, waiting while the lane is full.
    pub async fn submit(&self, tier: Tier, delivery: Delivery) -> Result<(), AmqpError> {
        let done = self.workers.done();
        self.lanes.submit(tier, delivery, &done, &done).await
    }

    /// Consumes `queue` into the lane of `tier`.
    pub async fn feed(
        &self,
        shutdown: CancellationToken,
        tier: Tier,
        queue: &str,
    ) -> Result<(), AmqpError> {
        let (conn, channel, mut stream) = self.workers.open(queue, self.prefetch).await?;

        let lanes = self.lanes.clone();
        let done = self.workers.done();
        let name = queue.to_owned();

        let handle = tokio::spawn(async move {
            while let Some(delivery) = next_delivery(&mut stream, &shutdown, &done, &name).await {
                if lanes.submit(tier, delivery, &shutdown, &done).await.is_err() {
                    break;
                }
            }
        });

        self.workers.track(queue, conn, channel, handle).await;
        Ok(())
    }

    /// Feeds every tier from its platform queue.
    pub async fn feed_tiers(&self, shutdown: CancellationToken) -> Result<(), AmqpError> {
        for tier in Tier::ALL {
            self.feed(shutdown.clone(), tier, tier.queue()).await?;
        }
        Ok(())
    }

    /// Starts the dispatch loop. Can only be started once.
    pub fn start(
        &self,
        shutdown: CancellationToken,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), AmqpError> {
        let Some(receivers) = self.receivers.lock().take() else {
            return Err(AmqpError::ConsumerError(
                "scheduler already started".to_owned(),
            ));
        };

        let dispatch = Dispatch {
            lanes: self.lanes.clone(),
            receivers,
            state: self.state.clone(),
            weights: self.weights,
            saturated_pause: self.saturated_pause,
            idle_pause: self.idle_pause,
            rng: match self.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
            handler,
            metrics: self.metrics.clone(),
        };

        let done = self.workers.done();
        *self.dispatcher.lock() = Some(tokio::spawn(dispatch.run(shutdown, done)));
        info!(weights = ?self.weights, "priority scheduler started");
        Ok(())
    }

    /// Stops the dispatcher and the feeders. Buffered deliveries are requeued. Idempotent.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.workers.done().cancel();

        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            if let Err(err) = dispatcher.await {
                error!(error = err.to_string(), "scheduler dispatcher failed");
            }
        }

        // never started, so the buffered deliveries are still held here
        let idle = self.receivers.lock().take();
        if let Some(mut receivers) = idle {
            drain(&self.lanes, &mut receivers).await;
        }

        self.workers.close().await
    }
}

struct Dispatch {
    lanes: Arc<Lanes>,
    receivers: [mpsc::Receiver<Delivery>; 3],
    state: SystemState,
    weights: [u32; 3],
    saturated_pause: Duration,
    idle_pause: Duration,
    rng: StdRng,
    handler: Arc<dyn MessageHandler>,
    metrics: Metrics,
}

impl Dispatch {
    async fn run(mut self, shutdown: CancellationToken, done: CancellationToken) {
        let tracer = global::tracer(otel::TRACER_NAME);

        loop {
            if shutdown.is_cancelled() || done.is_cancelled() {
                break;
            }

            let pause = match self.pick() {
                Ok(Some((tier, delivery))) => {
                    process(
                        delivery,
                        tier.queue(),
                        self.handler.as_ref(),
                        &tracer,
                        &self.metrics,
                    )
                    .await;
                    tokio::task::yield_now().await;
                    continue;
                }
                Ok(None) => NEAR_MISS_PAUSE,
                Err(pause) => pause,
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = done.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        drain(&self.lanes, &mut self.receivers).await;
    }

    /// Picks the next delivery. `Err` carries the pause when nothing can be dispatched.
    fn pick(&mut self) -> Result<Option<(Tier, Delivery)>, Duration> {
        if self.state.is_saturated() {
            return Err(self.saturated_pause);
        }

        let pending = self.lanes.pending();
        let total = total_weight(self.weights, pending);
        if total == 0 {
            return Err(self.idle_pause);
        }

        let r = self.rng.gen_range(0..total);
        let Some(tier) = select_tier(self.weights, pending, r) else {
            return Err(self.idle_pause);
        };

        match self.receivers[slot(tier)].try_recv() {
            Ok(delivery) => {
                let lane = self.lanes.lane(tier);
                lane.pending.fetch_sub(1, Ordering::AcqRel);
                lane.dispatched.fetch_add(1, Ordering::Relaxed);
                Ok(Some((tier, delivery)))
            }
            Err(_) => Ok(None),
        }
    }
}

/// Closes the lanes and requeues everything still buffered in them.
async fn drain(lanes: &Lanes, receivers: &mut [mpsc::Receiver<Delivery>; 3]) {
    let mut requeued = 0usize;
    for tier in Tier::ALL {
        let rx = &mut receivers[slot(tier)];
        rx.close();
        while let Ok(delivery) = rx.try_recv() {
            lanes.lane(tier).pending.fetch_sub(1, Ordering::AcqRel);
            if let Err(err) = delivery.nack(true).await {
                error!(error = err.to_string(), tier = tier.as_str(), "failure to requeue buffered message");
            }
            requeued += 1;
        }
    }
    debug!(requeued, "priority scheduler stopped");
}
