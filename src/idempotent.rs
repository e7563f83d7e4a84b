// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Idempotent Consumer
//!
//! Decorator deduplicating deliveries of any [`Consumer`]. The dedup key is the SHA-256
//! digest of the message body. A key found in the cache means the message was already
//! handled successfully: the wrapped handler is skipped and the delivery is acked.
//! Keys are cached only after a successful handler run, so failed messages stay
//! retryable.
//!
//! The cache is bounded (oldest entry evicted first) and entries expire after a TTL,
//! purged by a background sweep.

use crate::{
    config::IdempotencyConfigs,
    consumer::Consumer,
    errors::{AmqpError, HandlerError},
    handler::MessageHandler,
    metrics::Metrics,
};
use async_trait::async_trait;
use opentelemetry::Context;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Dedup key of a message body.
pub fn message_key(body: &[u8]) -> String {
    format!("{:x}", Sha256::digest(body))
}

#[derive(Default)]
struct Entries {
    seen: HashMap<String, Instant>,
    order: VecDeque<String>,
}

/// Bounded, TTL-expiring set of processed message keys.
pub struct IdempotencyCache {
    entries: Mutex<Entries>,
    max_entries: usize,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        IdempotencyCache {
            entries: Mutex::new(Entries::default()),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    pub fn from_configs(cfg: &IdempotencyConfigs) -> Self {
        Self::new(cfg.max_entries, cfg.ttl())
    }

    /// Whether `key` was recorded and has not expired yet.
    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.lock();
        entries
            .seen
            .get(key)
            .is_some_and(|first_seen| first_seen.elapsed() < self.ttl)
    }

    /// Records `key`, evicting the oldest entries beyond capacity.
    pub fn insert(&self, key: String) {
        let mut entries = self.entries.lock();
        self.expire(&mut entries);
        if entries.seen.contains_key(&key) {
            return;
        }

        while entries.order.len() >= self.max_entries {
            let Some(oldest) = entries.order.pop_front() else {
                break;
            };
            entries.seen.remove(&oldest);
        }

        entries.seen.insert(key.clone(), Instant::now());
        entries.order.push_back(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        self.expire(&mut entries)
    }

    fn expire(&self, entries: &mut Entries) -> usize {
        let mut purged = 0;

        // insertion order is first-seen order
        while let Some(oldest) = entries.order.front() {
            let expired = entries
                .seen
                .get(oldest)
                .map_or(true, |first_seen| first_seen.elapsed() >= self.ttl);
            if !expired {
                break;
            }
            if let Some(key) = entries.order.pop_front() {
                entries.seen.remove(&key);
                purged += 1;
            }
        }

        purged
    }

    /// Purges expired entries every `interval` until `shutdown` is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            debug!(purged, remaining = cache.len(), "idempotency cache swept");
                        }
                    }
                }
            }
        })
    }
}

/// Handler skipping bodies already processed.
struct DedupHandler {
    inner: Arc<dyn MessageHandler>,
    cache: Arc<IdempotencyCache>,
    metrics: Metrics,
}

#[async_trait]
impl MessageHandler for DedupHandler {
    async fn handle_message(&self, ctx: &Context, body: &[u8]) -> Result<(), HandlerError> {
        let key = message_key(body);

        if self.cache.contains(&key) {
            self.metrics.deduplicated();
            debug!(key, "duplicate message, skipping handler");
            return Ok(());
        }

        self.inner.handle_message(ctx, body).await?;
        self.cache.insert(key);
        Ok(())
    }
}

/// Wraps a [`Consumer`] so each distinct body is handled successfully at most once per TTL.
pub struct IdempotentConsumer {
    inner: Arc<dyn Consumer>,
    cache: Arc<IdempotencyCache>,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
    metrics: Metrics,
}

impl IdempotentConsumer {
    pub fn new(inner: Arc<dyn Consumer>, cfg: &IdempotencyConfigs) -> Self {
        Self::with_cache(
            inner,
            Arc::new(IdempotencyCache::from_configs(cfg)),
            cfg.sweep_interval(),
        )
    }

    pub fn with_cache(
        inner: Arc<dyn Consumer>,
        cache: Arc<IdempotencyCache>,
        sweep_interval: Duration,
    ) -> Self {
        IdempotentConsumer {
            inner,
            cache,
            sweep_interval,
            sweeper: Mutex::new(None),
            stop: CancellationToken::new(),
            metrics: Metrics::global(),
        }
    }

    pub fn cache(&self) -> &Arc<IdempotencyCache> {
        &self.cache
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() && !self.stop.is_cancelled() {
            *sweeper = Some(
                self.cache
                    .spawn_sweeper(self.sweep_interval, self.stop.child_token()),
            );
        }
    }
}

#[async_trait]
impl Consumer for IdempotentConsumer {
    async fn consume(
        &self,
        shutdown: CancellationToken,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), AmqpError> {
        self.ensure_sweeper();

        let dedup = Arc::new(DedupHandler {
            inner: handler,
            cache: self.cache.clone(),
            metrics: self.metrics.clone(),
        });

        self.inner.consume(shutdown, queue, dedup).await
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.stop.cancel();
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MockMessageHandler;

    #[test]
    fn key_is_sha256_hex() {
        assert_eq!(
            message_key(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(message_key(b"a"), message_key(b"b"));
    }

    #[tokio::test(start_paused = true)]
    async fn oldest_entry_is_evicted_on_overflow() {
        let cache = IdempotencyCache::new(2, Duration::from_secs(60));
        cache.insert("a".to_owned());
        cache.insert("b".to_owned());
        cache.insert("c".to_owned());

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_and_are_swept() {
        let cache = Arc::new(IdempotencyCache::new(10, Duration::from_secs(60)));
        cache.insert("old".to_owned());
        tokio::time::advance(Duration::from_secs(30)).await;
        cache.insert("new".to_owned());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!cache.contains("old"));
        assert!(cache.contains("new"));

        let stop = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(Duration::from_secs(5), stop.clone());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.len(), 1);

        stop.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn only_successes_are_cached() {
        let mut inner = MockMessageHandler::new();
        let mut seq = mockall::Sequence::new();
        inner
            .expect_handle_message()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(HandlerError::failed("transient")));
        inner
            .expect_handle_message()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let cache = Arc::new(IdempotencyCache::new(10, Duration::from_secs(60)));
        let handler = DedupHandler {
            inner: Arc::new(inner),
            cache: cache.clone(),
            metrics: Metrics::global(),
        };

        let ctx = Context::new();
        assert!(handler.handle_message(&ctx, b"scan-1").await.is_err());
        assert!(cache.is_empty());

        assert!(handler.handle_message(&ctx, b"scan-1").await.is_ok());
        // third delivery hits the cache, the mock would panic on a third call
        assert!(handler.handle_message(&ctx, b"scan-1").await.is_ok());
        assert_eq!(cache.len(), 1);
    }
}
