// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides the reliable publisher. Every message is published on a
//! channel with publisher confirms enabled and the broker acknowledgement is awaited
//! for a bounded time. A nack or a timeout counts as a failed attempt: the publisher
//! sleeps the configured interval, replaces its connection and channel, and tries
//! again until the retry budget is spent.
//!
//! Delivery is at-least-once: a message whose confirmation was lost may be sent twice,
//! so consumers must tolerate duplicates.

use crate::{
    compression,
    config::PublisherConfigs,
    connection::{ConnectionManager, PooledConnection},
    errors::AmqpError,
    metrics::Metrics,
    otel,
    transport::{BrokerChannel, Confirm},
};
use async_trait::async_trait;
use chrono::Utc;
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties,
};
use opentelemetry::Context;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Delivery mode marking messages as persistent
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Header values accepted by [`PublishMessage::header`].
///
/// Each variant maps onto the AMQP field type of the same width.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Bool(bool),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    LongUint(u32),
}

impl From<HeaderValues> for AMQPValue {
    fn from(value: HeaderValues) -> Self {
        match value {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValues::Bool(v) => AMQPValue::Boolean(v),
            HeaderValues::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValues::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
        }
    }
}

/// A message to publish.
///
/// Built with a builder pattern, then handed to [`Publisher::publish_message`]. The
/// publisher adds the message id, timestamp, content type and trace context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishMessage {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub msg_type: Option<String>,
    pub headers: BTreeMap<ShortString, AMQPValue>,
    pub priority: Option<u8>,
    pub content_encoding: Option<String>,
}

impl PublishMessage {
    /// Creates a message without headers or priority.
    ///
    /// # Parameters
    /// * `exchange` - The exchange to publish to
    /// * `routing_key` - The routing key
    /// * `data` - The message body
    ///
    /// # Returns
    /// A new message ready for further configuration
    pub fn new(exchange: &str, routing_key: &str, data: impl Into<Vec<u8>>) -> Self {
        PublishMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: data.into(),
            ..Default::default()
        }
    }

    /// Sets the AMQP `type` property.
    ///
    /// # Parameters
    /// * `kind` - The message type, e.g. `scan.task`
    ///
    /// # Returns
    /// Self for method chaining
    pub fn msg_type(mut self, kind: &str) -> Self {
        self.msg_type = Some(kind.to_owned());
        self
    }

    /// Adds a single header.
    ///
    /// # Parameters
    /// * `key` - The header name
    /// * `value` - The header value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn header(mut self, key: &str, value: HeaderValues) -> Self {
        self.headers.insert(ShortString::from(key), value.into());
        self
    }

    /// Merges a header table, overriding existing keys.
    pub fn headers(mut self, table: FieldTable) -> Self {
        for (key, value) in table.inner() {
            self.headers.insert(key.clone(), value.clone());
        }
        self
    }

    /// Merges a map of header values, overriding existing keys.
    pub fn header_map(mut self, map: HashMap<String, HeaderValues>) -> Self {
        for (key, value) in map {
            self.headers.insert(ShortString::from(key), value.into());
        }
        self
    }

    /// Sets the priority read by queues declared with `x-max-priority`.
    ///
    /// # Parameters
    /// * `priority` - The message priority, 0 to 255
    ///
    /// # Returns
    /// Self for method chaining
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Declares the body as already encoded (for example `gzip`).
    pub fn content_encoding(mut self, encoding: &str) -> Self {
        self.content_encoding = Some(encoding.to_owned());
        self
    }
}

/// Publishes messages to exchanges.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `body` to `exchange` with `routing_key` and no extra headers.
    async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), AmqpError>;

    /// Publishes a fully described message.
    ///
    /// # Parameters
    /// * `ctx` - The caller's context, injected into the message headers
    /// * `msg` - The message to publish
    ///
    /// # Returns
    /// `Ok(())` once the broker confirmed the message, or the error of the last attempt
    async fn publish_message(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError>;

    /// Releases the publisher's channel and connection. Later publishes fail with
    /// [`AmqpError::AlreadyClosed`].
    async fn close(&self) -> Result<(), AmqpError>;
}

struct Session {
    conn: PooledConnection,
    channel: Arc<dyn BrokerChannel>,
}

/// Publisher with broker confirms and bounded retry-with-reconnect.
pub struct RabbitMQPublisher {
    manager: Arc<ConnectionManager>,
    cfg: PublisherConfigs,
    session: Mutex<Option<Session>>,
    closed: AtomicBool,
    metrics: Metrics,
}

impl RabbitMQPublisher {
    /// Creates a new RabbitMQ publisher drawing its connection from `manager`.
    ///
    /// No connection is taken until the first publish.
    ///
    /// # Parameters
    /// * `manager` - The connection pool
    /// * `cfg` - Retry budget, retry interval, confirm timeout and compression threshold
    ///
    /// # Returns
    /// The publisher behind an `Arc`, ready to be shared between tasks
    pub fn new(manager: Arc<ConnectionManager>, cfg: PublisherConfigs) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            manager,
            cfg,
            session: Mutex::new(None),
            closed: AtomicBool::new(false),
            metrics: Metrics::global(),
        })
    }

    /// Publishes `body` with extra headers and a priority understood by priority queues.
    ///
    /// # Parameters
    /// * `ctx` - The caller's context
    /// * `exchange` - The exchange to publish to
    /// * `routing_key` - The routing key
    /// * `headers` - Application headers added to the message
    /// * `priority` - The message priority
    /// * `body` - The message body
    ///
    /// # Returns
    /// `Ok(())` once the broker confirmed the message
    pub async fn publish_with_headers(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        headers: HashMap<String, HeaderValues>,
        priority: u8,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        let msg = PublishMessage::new(exchange, routing_key, body)
            .header_map(headers)
            .priority(priority);

        self.publish_message(ctx, &msg).await
    }

    async fn properties(
        &self,
        ctx: &Context,
        msg: &PublishMessage,
    ) -> Result<(BasicProperties, Vec<u8>), AmqpError> {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject(ctx, &mut btree);
        btree.extend(msg.headers.clone());

        let mut body = msg.data.clone();
        let mut encoding = msg.content_encoding.clone();

        if let Some(threshold) = self.cfg.compress_above_bytes {
            if encoding.is_none() && body.len() > threshold {
                body = compression::gzip(&body).await?;
                encoding = Some(compression::GZIP_ENCODING.to_owned());
            }
        }

        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_timestamp(Utc::now().timestamp() as u64)
            .with_headers(FieldTable::from(btree));

        if let Some(kind) = &msg.msg_type {
            props = props.with_type(ShortString::from(kind.clone()));
        }

        if let Some(priority) = msg.priority {
            props = props.with_priority(priority);
        }

        if let Some(encoding) = encoding {
            props = props.with_content_encoding(ShortString::from(encoding));
        }

        Ok((props, body))
    }

    async fn open_session(&self) -> Result<Session, AmqpError> {
        let conn = self.manager.get_connection().await?;
        match Self::confirm_channel(&conn).await {
            Ok(channel) => Ok(Session { conn, channel }),
            Err(err) => {
                self.manager.release_connection(&conn);
                Err(err)
            }
        }
    }

    async fn confirm_channel(conn: &PooledConnection) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = conn.connection().create_channel().await?;
        channel.confirm_select().await?;
        Ok(channel)
    }

    /// Closes the current channel and connection and dials fresh ones.
    async fn reconnect(&self, session: &mut Option<Session>) {
        let Some(old) = session.take() else {
            return;
        };

        let _ = old.channel.close().await;

        match self.manager.reconnect(&old.conn).await {
            Ok(conn) => match Self::confirm_channel(&conn).await {
                Ok(channel) => {
                    debug!(connection_id = conn.id(), "publisher reconnected");
                    *session = Some(Session { conn, channel });
                }
                Err(err) => {
                    warn!(error = err.to_string(), "failure to reopen publisher channel");
                    self.manager.release_connection(&conn);
                }
            },
            Err(err) => {
                warn!(error = err.to_string(), "failure to reconnect publisher");
                self.manager.release_connection(&old.conn);
            }
        }
    }

    async fn attempt(
        &self,
        session: &mut Option<Session>,
        msg: &PublishMessage,
        props: &BasicProperties,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        if session.is_none() {
            *session = Some(self.open_session().await?);
        }
        let Some(active) = session.as_ref() else {
            return Err(AmqpError::InternalError);
        };

        let confirm = tokio::time::timeout(
            self.cfg.confirm_timeout(),
            active
                .channel
                .basic_publish(&msg.exchange, &msg.routing_key, body, props.clone()),
        )
        .await
        .map_err(|_| AmqpError::PublishConfirmTimeout)??;

        match confirm {
            Confirm::Ack => Ok(()),
            Confirm::Nack => Err(AmqpError::PublishNacked),
            Confirm::NotRequested => Err(AmqpError::PublishingError(
                "publisher confirms are not enabled".to_owned(),
            )),
        }
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        self.publish_message(ctx, &PublishMessage::new(exchange, routing_key, body))
            .await
    }

    async fn publish_message(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AmqpError::AlreadyClosed);
        }

        let (props, body) = self.properties(ctx, msg).await?;
        let attempts = self.cfg.max_retries.max(1);
        let mut session = self.session.lock().await;

        for attempt in 1..=attempts {
            match self.attempt(&mut session, msg, &props, &body).await {
                Ok(()) => {
                    self.metrics.published(&msg.exchange);
                    debug!(
                        exchange = %msg.exchange,
                        routing_key = %msg.routing_key,
                        attempt,
                        "message published"
                    );
                    return Ok(());
                }
                Err(err) => {
                    self.metrics.publish_failed(&msg.exchange);
                    warn!(
                        error = err.to_string(),
                        exchange = %msg.exchange,
                        routing_key = %msg.routing_key,
                        attempt,
                        "publish attempt failed"
                    );

                    if attempt < attempts {
                        tokio::time::sleep(self.cfg.retry_interval()).await;
                        self.reconnect(&mut session).await;
                    }
                }
            }
        }

        error!(
            exchange = %msg.exchange,
            routing_key = %msg.routing_key,
            attempts,
            "giving up publishing message"
        );
        Err(AmqpError::PublishRetriesExhausted(attempts))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        let result = session.channel.close().await;
        self.manager.release_connection(&session.conn);
        result
    }
}
