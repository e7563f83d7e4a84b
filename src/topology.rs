// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides functionality for defining and creating RabbitMQ topology components.
//! The topology includes exchanges, queues, and the bindings between them. Declarations are
//! idempotent on the broker side, so installing the same topology twice succeeds as long as
//! the arguments match.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation of the Topology trait over a broker channel
//! - `platform_topology`: The exchanges, queues and bindings of the task platform

use crate::{
    connection::ConnectionManager,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    routing::{self, Tier},
    transport::BrokerChannel,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This creates all the exchanges and queues, and sets up all the bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology {
    channel: Arc<dyn BrokerChannel>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.queues_binding
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.retain(|q| q.name != def.name);
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs exchanges, then queues, then bindings.
    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology {
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            self.channel.exchange_declare(exch).await?;
            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);
            self.channel.queue_declare(def).await?;
            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            self.channel.queue_bind(binding).await?;
        }

        debug!("queues were bound");

        Ok(())
    }
}

/// The exchanges, queues and bindings of the task platform.
pub fn platform_topology(channel: Arc<dyn BrokerChannel>) -> AmqpTopology {
    let mut topology = AmqpTopology::new(channel)
        .exchange(
            ExchangeDefinition::new(routing::TASK_DISPATCH_EXCHANGE)
                .topic()
                .durable(),
        )
        .exchange(
            ExchangeDefinition::new(routing::RESULT_PROCESS_EXCHANGE)
                .direct()
                .durable(),
        )
        .exchange(
            ExchangeDefinition::new(routing::NOTIFICATION_EXCHANGE)
                .fanout()
                .durable(),
        )
        .exchange(
            ExchangeDefinition::new(routing::RETRY_EXCHANGE)
                .topic()
                .durable(),
        );

    for tier in Tier::ALL {
        topology = topology
            .queue(
                QueueDefinition::new(tier.queue())
                    .durable()
                    .with_max_priority(tier.max_priority())
                    .with_dead_letter(routing::RETRY_EXCHANGE, tier.retry_key()),
            )
            .queue_binding(
                QueueBinding::new(tier.queue())
                    .exchange(routing::TASK_DISPATCH_EXCHANGE)
                    .routing_key(tier.pattern()),
            );
    }

    topology = topology
        .queue(
            QueueDefinition::new(routing::ASSET_TASK_QUEUE)
                .durable()
                .with_dead_letter(routing::RETRY_EXCHANGE, routing::ASSET_RETRY_KEY),
        )
        .queue_binding(
            QueueBinding::new(routing::ASSET_TASK_QUEUE)
                .exchange(routing::TASK_DISPATCH_EXCHANGE)
                .routing_key(routing::ASSET_ROUTING_PATTERN),
        )
        .queue(
            QueueDefinition::new(routing::RESULT_STORAGE_QUEUE)
                .durable()
                .with_dead_letter(routing::RETRY_EXCHANGE, routing::RESULT_RETRY_KEY),
        )
        .queue_binding(
            QueueBinding::new(routing::RESULT_STORAGE_QUEUE)
                .exchange(routing::RESULT_PROCESS_EXCHANGE)
                .routing_key(routing::RESULT_STORAGE_ROUTING_KEY),
        );

    for queue in [
        routing::NOTIFICATION_EMAIL_QUEUE,
        routing::NOTIFICATION_WEBHOOK_QUEUE,
        routing::NOTIFICATION_AUDIT_QUEUE,
    ] {
        topology = topology
            .queue(QueueDefinition::new(queue).durable())
            .queue_binding(
                QueueBinding::new(queue)
                    .exchange(routing::NOTIFICATION_EXCHANGE)
                    .routing_key(""),
            );
    }

    // The retry queue expires messages into the dispatch exchange under the key they were
    // dead-lettered with, so every retry key is bound back to the queue it came from.
    for tier in Tier::ALL {
        topology = topology.queue_binding(
            QueueBinding::new(tier.queue())
                .exchange(routing::TASK_DISPATCH_EXCHANGE)
                .routing_key(tier.retry_key()),
        );
    }
    topology = topology
        .queue_binding(
            QueueBinding::new(routing::ASSET_TASK_QUEUE)
                .exchange(routing::TASK_DISPATCH_EXCHANGE)
                .routing_key(routing::ASSET_RETRY_KEY),
        )
        .queue_binding(
            QueueBinding::new(routing::RESULT_STORAGE_QUEUE)
                .exchange(routing::TASK_DISPATCH_EXCHANGE)
                .routing_key(routing::RESULT_RETRY_KEY),
        );

    topology
        .queue(
            QueueDefinition::new(routing::RETRY_QUEUE)
                .durable()
                .ttl(routing::RETRY_QUEUE_TTL_MS)
                .with_dead_letter_exchange(routing::TASK_DISPATCH_EXCHANGE),
        )
        .queue_binding(
            QueueBinding::new(routing::RETRY_QUEUE)
                .exchange(routing::RETRY_EXCHANGE)
                .routing_key(routing::RETRY_ROUTING_PATTERN),
        )
        .queue(QueueDefinition::new(routing::MANUAL_INTERVENTION_QUEUE).durable())
        .queue_binding(
            QueueBinding::new(routing::MANUAL_INTERVENTION_QUEUE)
                .exchange(routing::RETRY_EXCHANGE)
                .routing_key(routing::MANUAL_ROUTING_PATTERN),
        )
}

/// Declares the platform topology on a pooled connection.
///
/// Safe to run on every start-up.
pub async fn bootstrap(manager: &ConnectionManager) -> Result<(), AmqpError> {
    let conn = manager.get_connection().await?;

    let result = async {
        let channel = conn.connection().create_channel().await?;
        let installed = platform_topology(channel.clone()).install().await;
        let _ = channel.close().await;
        installed
    }
    .await;

    manager.release_connection(&conn);

    if result.is_ok() {
        info!("topology installed");
    }
    result
}
