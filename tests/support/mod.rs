// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the transport traits.
//!
//! Supports direct, topic and fanout exchanges, the default exchange, queue argument
//! checks on redeclaration, dead-lettering with `x-death` records, publisher confirms
//! with injectable nacks, connection failures and server-side connection drops.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties,
};
use parking_lot::Mutex;
use rabbitmq_tasks::{
    delivery::{Acker, Delivery},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    headers,
    queue::{QueueBinding, QueueDefinition},
    transport::{BrokerChannel, BrokerConnection, Confirm, Connector, DeliveryStream},
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

/// A message at rest in a queue.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    pub redelivered: bool,
}

impl StoredMessage {
    pub fn header_string(&self, key: &str) -> Option<String> {
        headers::header_string(self.properties.headers().as_ref(), key)
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

struct Subscriber {
    channel_id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct Unacked {
    channel_id: u64,
    queue: String,
    message: StoredMessage,
}

struct QueueState {
    def: QueueDefinition,
    messages: VecDeque<StoredMessage>,
    subscribers: Vec<Subscriber>,
    next: usize,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    next_tag: u64,
    next_channel: u64,
    nack_publishes: u32,
    published: Vec<StoredMessage>,
    settlements: Vec<(String, Settlement)>,
    unacked: HashMap<u64, Unacked>,
}

/// Shared broker state. Clones observe the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            topic_matches(&pattern[1..], key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => topic_matches(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => topic_matches(&pattern[1..], &key[1..]),
        _ => false,
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` confirmed publishes come back as nacks.
    pub fn nack_next_publishes(&self, count: u32) {
        self.state.lock().nack_publishes = count;
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn exchange_count(&self) -> usize {
        self.state.lock().exchanges.len()
    }

    pub fn binding_count(&self) -> usize {
        self.state.lock().bindings.len()
    }

    /// Messages waiting in `queue`.
    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.messages(queue).len()
    }

    /// Every message accepted by an exchange, in publish order.
    pub fn published(&self) -> Vec<StoredMessage> {
        self.state.lock().published.clone()
    }

    pub fn settlements(&self, queue: &str) -> Vec<Settlement> {
        self.state
            .lock()
            .settlements
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, s)| *s)
            .collect()
    }

    /// Publishes as an external producer would, without confirms.
    pub fn publish(&self, exchange: &str, routing_key: &str, properties: BasicProperties, data: &[u8]) {
        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            data: data.to_vec(),
            redelivered: false,
        };
        let mut state = self.state.lock();
        state.published.push(message.clone());
        self.route(&mut state, message);
    }

    /// Expires every message waiting in `queue`, dead-lettering them as a TTL would.
    pub fn expire(&self, queue: &str) {
        let mut state = self.state.lock();
        let expired: Vec<StoredMessage> = match state.queues.get_mut(queue) {
            Some(q) => q.messages.drain(..).collect(),
            None => return,
        };
        for message in expired {
            self.dead_letter(&mut state, queue, message, "expired");
        }
    }

    fn route(&self, state: &mut State, message: StoredMessage) -> bool {
        let targets: Vec<String> = if message.exchange.is_empty() {
            vec![message.routing_key.clone()]
        } else {
            let Some(exchange) = state.exchanges.get(&message.exchange) else {
                return false;
            };
            let kind = exchange.exchange_kind();
            let key: Vec<&str> = message.routing_key.split('.').collect();
            let mut targets: Vec<String> = Vec::new();
            for binding in state.bindings.iter().filter(|b| b.exchange_name() == message.exchange) {
                let matched = match kind {
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Direct | ExchangeKind::Headers => binding.key() == message.routing_key,
                    ExchangeKind::Topic => {
                        let pattern: Vec<&str> = binding.key().split('.').collect();
                        topic_matches(&pattern, &key)
                    }
                };
                if matched && !targets.iter().any(|t| t == binding.queue_name()) {
                    targets.push(binding.queue_name().to_owned());
                }
            }
            targets
        };

        let mut routed = false;
        for queue in targets {
            if state.queues.contains_key(&queue) {
                self.enqueue(state, &queue, message.clone());
                routed = true;
            }
        }
        routed
    }

    fn enqueue(&self, state: &mut State, queue: &str, message: StoredMessage) {
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        q.messages.push_back(message);
        self.dispatch(state, queue);
    }

    /// Hands waiting messages of `queue` to its subscribers, round-robin.
    fn dispatch(&self, state: &mut State, queue: &str) {
        let State {
            queues,
            next_tag,
            unacked,
            ..
        } = state;
        let Some(q) = queues.get_mut(queue) else {
            return;
        };

        while !q.subscribers.is_empty() {
            let Some(message) = q.messages.pop_front() else {
                return;
            };
            *next_tag += 1;
            let tag = *next_tag;
            let index = q.next % q.subscribers.len();
            let delivery = Delivery::new(
                tag,
                message.exchange.clone(),
                message.routing_key.clone(),
                message.properties.clone(),
                message.data.clone(),
                Box::new(MemoryAcker {
                    broker: self.clone(),
                    tag,
                }),
            )
            .redelivered(message.redelivered);

            if q.subscribers[index].tx.send(delivery).is_err() {
                q.subscribers.remove(index);
                q.messages.push_front(message);
                continue;
            }
            unacked.insert(
                tag,
                Unacked {
                    channel_id: q.subscribers[index].channel_id,
                    queue: queue.to_owned(),
                    message,
                },
            );
            q.next = q.next.wrapping_add(1);
        }
    }

    fn dead_letter(&self, state: &mut State, queue: &str, message: StoredMessage, reason: &str) {
        let Some(def) = state.queues.get(queue).map(|q| q.def.clone()) else {
            return;
        };
        let Some(dlx) = def.dead_letter_exchange() else {
            return;
        };

        let routing_key = def
            .dead_letter_routing_key()
            .unwrap_or(&message.routing_key)
            .to_owned();

        let mut headers = message
            .properties
            .headers()
            .clone()
            .unwrap_or_default();
        let mut deaths: Vec<AMQPValue> = match headers.inner().get("x-death") {
            Some(AMQPValue::FieldArray(array)) => array.as_slice().to_vec(),
            _ => Vec::new(),
        };

        let mut count = 1i64;
        deaths.retain(|entry| {
            let AMQPValue::FieldTable(table) = entry else {
                return true;
            };
            let same_queue = matches!(table.inner().get("queue"), Some(AMQPValue::LongString(q)) if q.as_bytes() == queue.as_bytes());
            let same_reason = matches!(table.inner().get("reason"), Some(AMQPValue::LongString(r)) if r.as_bytes() == reason.as_bytes());
            if same_queue && same_reason {
                if let Some(AMQPValue::LongLongInt(previous)) = table.inner().get("count") {
                    count = previous + 1;
                }
                return false;
            }
            true
        });

        let mut entry = FieldTable::default();
        entry.insert(ShortString::from("queue"), AMQPValue::LongString(LongString::from(queue)));
        entry.insert(ShortString::from("reason"), AMQPValue::LongString(LongString::from(reason)));
        entry.insert(ShortString::from("count"), AMQPValue::LongLongInt(count));
        entry.insert(
            ShortString::from("exchange"),
            AMQPValue::LongString(LongString::from(message.exchange.as_str())),
        );
        entry.insert(
            ShortString::from("routing-keys"),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::LongString(
                LongString::from(message.routing_key.as_str()),
            )])),
        );
        entry.insert(
            ShortString::from("time"),
            AMQPValue::Timestamp(chrono::Utc::now().timestamp() as u64),
        );
        deaths.insert(0, AMQPValue::FieldTable(entry));
        headers.insert(ShortString::from("x-death"), AMQPValue::FieldArray(FieldArray::from(deaths)));

        let dead = StoredMessage {
            exchange: dlx.to_owned(),
            routing_key,
            properties: message.properties.clone().with_headers(headers),
            data: message.data,
            redelivered: false,
        };
        self.route(state, dead);
    }

    fn settle(&self, tag: u64, settlement: Settlement) -> Result<(), AmqpError> {
        let mut state = self.state.lock();
        let Some(Unacked { queue, message, .. }) = state.unacked.remove(&tag) else {
            return Err(AmqpError::ConsumerError(format!("unknown delivery tag {tag}")));
        };
        state.settlements.push((queue.clone(), settlement));
        match settlement {
            Settlement::Ack => {}
            Settlement::Nack { requeue: true } | Settlement::Reject { requeue: true } => {
                let message = StoredMessage {
                    redelivered: true,
                    ..message
                };
                self.enqueue(&mut state, &queue, message);
            }
            Settlement::Nack { requeue: false } | Settlement::Reject { requeue: false } => {
                self.dead_letter(&mut state, &queue, message, "rejected");
            }
        }
        Ok(())
    }

    /// Unsubscribes the channel and requeues what it left unsettled.
    fn drop_channel(&self, channel_id: u64) {
        let mut state = self.state.lock();
        for q in state.queues.values_mut() {
            q.subscribers.retain(|s| s.channel_id != channel_id);
        }

        let mut orphaned: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        orphaned.sort();
        for tag in orphaned {
            if let Some(Unacked { queue, message, .. }) = state.unacked.remove(&tag) {
                let message = StoredMessage {
                    redelivered: true,
                    ..message
                };
                self.enqueue(&mut state, &queue, message);
            }
        }
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    tag: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.broker.settle(self.tag, Settlement::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.broker.settle(self.tag, Settlement::Nack { requeue })
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.broker.settle(self.tag, Settlement::Reject { requeue })
    }
}

/// Dials [`MemoryConnection`]s, optionally failing a number of attempts.
pub struct MemoryConnector {
    broker: MemoryBroker,
    failures: AtomicU32,
    attempts: Mutex<Vec<Instant>>,
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
}

impl MemoryConnector {
    pub fn new(broker: &MemoryBroker) -> Arc<Self> {
        Arc::new(MemoryConnector {
            broker: broker.clone(),
            failures: AtomicU32::new(0),
            attempts: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        })
    }

    /// Refuses the next `count` dial attempts.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Instants of every dial attempt, failed ones included.
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    /// Number of connections successfully opened.
    pub fn opened(&self) -> usize {
        self.connections.lock().len()
    }

    /// Closes every open connection from the server side.
    pub fn drop_connections(&self) {
        for conn in self.connections.lock().iter() {
            conn.server_close();
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.attempts.lock().push(Instant::now());

        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let conn = Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            connected: AtomicBool::new(true),
            closed: CancellationToken::new(),
            channels: Mutex::new(Vec::new()),
        });
        self.connections.lock().push(conn.clone());
        Ok(conn)
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    connected: AtomicBool,
    closed: CancellationToken,
    channels: Mutex<Vec<u64>>,
}

impl MemoryConnection {
    fn server_close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            for channel_id in self.channels.lock().drain(..) {
                self.broker.drop_channel(channel_id);
            }
            self.closed.cancel();
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }
        let id = {
            let mut state = self.broker.state.lock();
            state.next_channel += 1;
            state.next_channel
        };
        self.channels.lock().push(id);
        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
            confirms: AtomicBool::new(false),
            open: AtomicBool::new(true),
        }))
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.server_close();
        Ok(())
    }
}

pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
    confirms: AtomicBool,
    open: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AmqpError::ChannelError("channel is closed".to_owned()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_qos(&self, _prefetch: u16) -> Result<(), AmqpError> {
        self.ensure_open()
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        match state.exchanges.get(def.name()) {
            Some(existing) if existing.exchange_kind() != def.exchange_kind() => {
                Err(AmqpError::DeclareExchangeError(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name().to_owned(), def.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        match state.queues.get(def.name()) {
            Some(existing) if existing.def.arguments() != def.arguments() => {
                Err(AmqpError::DeclareQueueError(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name().to_owned(),
                    QueueState {
                        def: def.clone(),
                        messages: VecDeque::new(),
                        subscribers: Vec::new(),
                        next: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if !state.queues.contains_key(binding.queue_name())
            || !state.exchanges.contains_key(binding.exchange_name())
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            ));
        }
        if !state.bindings.iter().any(|b| b == binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<Confirm, AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::PublishingError(format!("no exchange `{exchange}`")));
        }

        let confirms = self.confirms.load(Ordering::SeqCst);
        if confirms && state.nack_publishes > 0 {
            state.nack_publishes -= 1;
            return Ok(Confirm::Nack);
        }

        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            data: payload.to_vec(),
            redelivered: false,
        };
        state.published.push(message.clone());
        self.broker.route(&mut state, message);

        Ok(if confirms { Confirm::Ack } else { Confirm::NotRequested })
    }

    async fn basic_consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.state.lock();
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            };
            q.subscribers.push(Subscriber {
                channel_id: self.id,
                tx,
            });
            self.broker.dispatch(&mut state, queue);
        }

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.drop_channel(self.id);
        }
        Ok(())
    }
}

/// Polls `condition` on the paused clock until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
