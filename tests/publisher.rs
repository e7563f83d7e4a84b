// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod support;

use opentelemetry::Context;
use rabbitmq_tasks::{
    compression,
    config::{PoolConfigs, PublisherConfigs},
    connection::ConnectionManager,
    errors::AmqpError,
    headers,
    publisher::{Publisher, RabbitMQPublisher},
    publishers::{ScanTask, TaskPublisher},
    routing::{self, Tier},
    topology::bootstrap,
};
use std::{sync::Arc, time::Duration};
use support::{MemoryBroker, MemoryConnector};
use tokio::time::Instant;

async fn setup(cfg: PublisherConfigs) -> (MemoryBroker, Arc<MemoryConnector>, Arc<RabbitMQPublisher>) {
    let broker = MemoryBroker::new();
    let connector = MemoryConnector::new(&broker);
    let manager = Arc::new(ConnectionManager::new(connector.clone(), &PoolConfigs::default()));
    bootstrap(&manager).await.unwrap();
    (broker, connector, RabbitMQPublisher::new(manager, cfg))
}

#[tokio::test(start_paused = true)]
async fn confirmed_publish_lands_on_the_queue() {
    let (broker, _connector, publisher) = setup(PublisherConfigs::default()).await;

    let tasks = TaskPublisher::new(publisher.clone());
    tasks
        .publish_scan(&Context::new(), &ScanTask::new("vulnerability", "10.0.0.1", Tier::High))
        .await
        .unwrap();

    let messages = broker.messages(Tier::High.queue());
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message.routing_key, "scan.vulnerability.high");
    assert_eq!(*message.properties.priority(), Some(9));
    assert_eq!(*message.properties.delivery_mode(), Some(2));
    assert!(message.properties.message_id().is_some());
    assert_eq!(
        headers::header_i64(message.properties.headers().as_ref(), headers::AMQP_HEADERS_PRIORITY),
        Some(9)
    );

    publisher.close().await.unwrap();
    assert_eq!(
        publisher
            .publish(&Context::new(), routing::TASK_DISPATCH_EXCHANGE, "asset.x", b"{}")
            .await,
        Err(AmqpError::AlreadyClosed)
    );
}

#[tokio::test(start_paused = true)]
async fn nacked_publish_is_retried_on_a_fresh_connection() {
    let (broker, connector, publisher) = setup(PublisherConfigs::default()).await;
    let dialed = connector.opened();

    broker.nack_next_publishes(2);
    let started = Instant::now();
    publisher
        .publish(&Context::new(), routing::TASK_DISPATCH_EXCHANGE, "asset.sync", b"{}")
        .await
        .unwrap();

    assert_eq!(broker.depth(routing::ASSET_TASK_QUEUE), 1);
    // two retry intervals, each followed by a reconnect
    assert_eq!(started.elapsed(), Duration::from_secs(2));
    assert_eq!(connector.opened(), dialed + 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_a_terminal_error() {
    let cfg = PublisherConfigs {
        max_retries: 3,
        retry_interval_ms: 100,
        ..PublisherConfigs::default()
    };
    let (broker, _connector, publisher) = setup(cfg).await;

    broker.nack_next_publishes(5);
    let err = publisher
        .publish(&Context::new(), routing::TASK_DISPATCH_EXCHANGE, "asset.sync", b"{}")
        .await
        .unwrap_err();

    assert_eq!(err, AmqpError::PublishRetriesExhausted(3));
    assert_eq!(broker.depth(routing::ASSET_TASK_QUEUE), 0);

    // clear the leftover injected nacks, then publishing recovers
    broker.nack_next_publishes(0);
    publisher
        .publish(&Context::new(), routing::TASK_DISPATCH_EXCHANGE, "asset.sync", b"{}")
        .await
        .unwrap();
    assert_eq!(broker.depth(routing::ASSET_TASK_QUEUE), 1);
}

#[tokio::test(start_paused = true)]
async fn large_bodies_are_gzipped() {
    let cfg = PublisherConfigs {
        compress_above_bytes: Some(64),
        ..PublisherConfigs::default()
    };
    let (broker, _connector, publisher) = setup(cfg).await;

    let body = vec![b'a'; 4096];
    publisher
        .publish(&Context::new(), routing::RESULT_PROCESS_EXCHANGE, routing::RESULT_STORAGE_ROUTING_KEY, &body)
        .await
        .unwrap();

    let stored = broker.messages(routing::RESULT_STORAGE_QUEUE).remove(0);
    assert_eq!(
        stored.properties.content_encoding().as_ref().map(|e| e.as_str()),
        Some(compression::GZIP_ENCODING)
    );
    assert!(stored.data.len() < body.len());
    assert_eq!(compression::gunzip(&stored.data).await.unwrap(), body);
}
