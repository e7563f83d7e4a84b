// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Abstraction
//!
//! Traits describing the small slice of AMQP the crate relies on. The lapin-backed
//! implementations live in [`crate::channel`]; keeping the components generic over
//! these traits lets the same connection manager, publisher and consumers run against
//! any broker client, including in-memory doubles.

use crate::{
    delivery::Delivery,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
use std::sync::Arc;

/// Stream of deliveries produced by a consumer registration.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Outcome of a publish on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirm {
    /// The broker accepted the message.
    Ack,
    /// The broker refused the message.
    Nack,
    /// Publisher confirms are not enabled on the channel.
    NotRequested,
}

/// Opens new broker connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new channel multiplexed on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Resolves once the connection has been lost or closed.
    async fn closed(&self);

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel on a broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Enables publisher confirms on the channel.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries held by consumers of this channel.
    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes a message and waits for the broker confirmation, if enabled.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<Confirm, AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
