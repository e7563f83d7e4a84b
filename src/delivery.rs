// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deliveries
//!
//! A [`Delivery`] is a message handed to a consumer together with the handle used to
//! settle it. Settling (`ack`, `nack`, `reject`) consumes the delivery, so a second
//! terminal action on the same message does not compile.

use crate::{compression, errors::AmqpError};
use async_trait::async_trait;
use lapin::{types::FieldTable, BasicProperties};
use std::fmt;

/// Settles a delivery on the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message received from a queue.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    acker: Box<dyn Acker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        properties: BasicProperties,
        data: Vec<u8>,
        acker: Box<dyn Acker>,
    ) -> Self {
        Delivery {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered: false,
            properties,
            data,
            acker,
        }
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn headers(&self) -> Option<&FieldTable> {
        self.properties.headers().as_ref()
    }

    pub fn priority(&self) -> Option<u8> {
        *self.properties.priority()
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.properties
            .content_encoding()
            .as_ref()
            .map(|enc| enc.as_str())
    }

    /// Returns the body, decompressed according to `Content-Encoding`.
    pub async fn payload(&self) -> Result<Vec<u8>, AmqpError> {
        compression::decode(self.content_encoding(), &self.data).await
    }

    pub async fn ack(self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await
    }

    pub async fn reject(self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.reject(requeue).await
    }
}
