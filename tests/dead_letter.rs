// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod support;

use lapin::BasicProperties;
use opentelemetry::Context;
use rabbitmq_tasks::{
    config::{DeadLetterConfigs, PoolConfigs, PublisherConfigs},
    connection::ConnectionManager,
    consumer::{Consumer, StandardConsumer},
    dead_letter::DeadLetterConsumer,
    errors::HandlerError,
    handler::handler_fn,
    headers,
    publisher::RabbitMQPublisher,
    publishers::{ScanTask, TaskPublisher},
    routing::{self, Tier},
    topology::bootstrap,
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use support::{eventually, MemoryBroker, MemoryConnector, Settlement};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Platform {
    broker: MemoryBroker,
    manager: Arc<ConnectionManager>,
    publisher: Arc<RabbitMQPublisher>,
    dead_letters: DeadLetterConsumer,
}

async fn platform(max_retries: u32, retry_delay: Duration) -> Platform {
    let broker = MemoryBroker::new();
    let manager = Arc::new(ConnectionManager::new(
        MemoryConnector::new(&broker),
        &PoolConfigs::default(),
    ));
    bootstrap(&manager).await.unwrap();

    let publisher = RabbitMQPublisher::new(manager.clone(), PublisherConfigs::default());
    let dead_letters = DeadLetterConsumer::new(
        manager.clone(),
        publisher.clone(),
        DeadLetterConfigs {
            max_retries,
            prefetch: 1,
            retry_delay_ms: retry_delay.as_millis() as u64,
        },
    );
    dead_letters
        .consume(CancellationToken::new(), routing::RETRY_QUEUE)
        .await
        .unwrap();

    Platform {
        broker,
        manager,
        publisher,
        dead_letters,
    }
}

#[tokio::test(start_paused = true)]
async fn failing_scan_ends_in_manual_intervention() {
    let platform = platform(3, Duration::from_secs(10)).await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = attempts.clone();

    let scans = StandardConsumer::new(platform.manager.clone(), 10);
    scans
        .consume(
            CancellationToken::new(),
            Tier::High.queue(),
            Arc::new(handler_fn(move |_body: Vec<u8>| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(HandlerError::failed("scanner crashed"))
                }
            })),
        )
        .await
        .unwrap();

    TaskPublisher::new(platform.publisher.clone())
        .publish_scan(
            &Context::new(),
            &ScanTask::new("vulnerability", "10.0.0.7", Tier::High),
        )
        .await
        .unwrap();

    let broker = platform.broker.clone();
    let started = Instant::now();
    assert!(
        eventually(Duration::from_secs(60), || {
            broker.depth(routing::MANUAL_INTERVENTION_QUEUE) == 1
        })
        .await
    );
    // three retries, each held back by the retry delay
    assert!(started.elapsed() >= Duration::from_secs(27), "{:?}", started.elapsed());

    // first delivery plus one per retry
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(
        broker.settlements(Tier::High.queue()),
        vec![Settlement::Nack { requeue: false }; 4]
    );
    assert_eq!(broker.settlements(routing::RETRY_QUEUE), vec![Settlement::Ack; 4]);

    let escalated = broker.messages(routing::MANUAL_INTERVENTION_QUEUE).remove(0);
    assert_eq!(
        escalated.header_string(headers::AMQP_HEADERS_FAILURE_REASON).as_deref(),
        Some("max_retry_exceeded")
    );
    let info = headers::retry_info(escalated.properties.headers().as_ref())
        .unwrap()
        .unwrap();
    assert_eq!(info.attempt_count, 3);
    assert_eq!(info.original_exchange, routing::TASK_DISPATCH_EXCHANGE);
    assert_eq!(info.original_routing_key, "scan.vulnerability.high");

    // every republish went back through normal routing
    let republished: Vec<_> = broker
        .published()
        .into_iter()
        .filter(|m| m.routing_key == "scan.vulnerability.high")
        .collect();
    assert_eq!(republished.len(), 4);
    assert!(republished.iter().all(|m| *m.properties.priority() == Some(9)));

    scans.close().await.unwrap();
    platform.dead_letters.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn message_without_provenance_is_escalated() {
    let platform = platform(3, Duration::from_secs(300)).await;

    platform.broker.publish(
        routing::RETRY_EXCHANGE,
        Tier::Low.retry_key(),
        BasicProperties::default(),
        b"{}",
    );

    let broker = platform.broker.clone();
    assert!(
        eventually(Duration::from_secs(1), || {
            broker.depth(routing::MANUAL_INTERVENTION_QUEUE) == 1
        })
        .await
    );
    let escalated = broker.messages(routing::MANUAL_INTERVENTION_QUEUE).remove(0);
    assert_eq!(
        escalated.header_string(headers::AMQP_HEADERS_FAILURE_REASON).as_deref(),
        Some("missing_x_death_header")
    );
    assert_eq!(broker.settlements(routing::RETRY_QUEUE), vec![Settlement::Ack]);

    platform.dead_letters.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unparseable_retry_info_is_escalated() {
    let platform = platform(3, Duration::from_secs(300)).await;

    let mut table = lapin::types::FieldTable::default();
    headers::insert_string(&mut table, headers::AMQP_HEADERS_RETRY_INFO, "not json");
    platform.broker.publish(
        routing::TASK_DISPATCH_EXCHANGE,
        "asset.sync",
        BasicProperties::default().with_headers(table),
        b"{}",
    );

    // dead-letter it the way a failing asset consumer would
    let assets = StandardConsumer::new(platform.manager.clone(), 1);
    assets
        .consume(
            CancellationToken::new(),
            routing::ASSET_TASK_QUEUE,
            Arc::new(handler_fn(|_body: Vec<u8>| async {
                Err::<(), _>(HandlerError::failed("asset store down"))
            })),
        )
        .await
        .unwrap();

    let broker = platform.broker.clone();
    assert!(
        eventually(Duration::from_secs(1), || {
            broker.depth(routing::MANUAL_INTERVENTION_QUEUE) == 1
        })
        .await
    );
    let escalated = broker.messages(routing::MANUAL_INTERVENTION_QUEUE).remove(0);
    assert_eq!(
        escalated.header_string(headers::AMQP_HEADERS_FAILURE_REASON).as_deref(),
        Some("invalid_retry_info")
    );

    assets.close().await.unwrap();
    platform.dead_letters.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn retry_is_held_until_the_delay_passes() {
    let platform = platform(3, Duration::from_secs(300)).await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = attempts.clone();

    let scans = StandardConsumer::new(platform.manager.clone(), 10);
    scans
        .consume(
            CancellationToken::new(),
            Tier::Medium.queue(),
            Arc::new(handler_fn(move |_body: Vec<u8>| {
                let counted = counted.clone();
                async move {
                    if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(HandlerError::failed("scanner crashed"));
                    }
                    Ok(())
                }
            })),
        )
        .await
        .unwrap();

    TaskPublisher::new(platform.publisher.clone())
        .publish_scan(&Context::new(), &ScanTask::new("secret", "repo-1", Tier::Medium))
        .await
        .unwrap();

    let broker = platform.broker.clone();
    assert!(
        eventually(Duration::from_secs(1), || {
            broker.settlements(Tier::Medium.queue()) == vec![Settlement::Nack { requeue: false }]
        })
        .await
    );

    tokio::time::sleep(Duration::from_secs(290)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(broker.settlements(routing::RETRY_QUEUE).is_empty());

    assert!(
        eventually(Duration::from_secs(20), || {
            broker.settlements(routing::RETRY_QUEUE) == vec![Settlement::Ack]
                && broker.settlements(Tier::Medium.queue()).len() == 2
        })
        .await
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(
        broker.settlements(Tier::Medium.queue()),
        vec![Settlement::Nack { requeue: false }, Settlement::Ack]
    );

    scans.close().await.unwrap();
    platform.dead_letters.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_during_the_retry_delay_keeps_the_message() {
    let platform = platform(3, Duration::from_secs(300)).await;

    let scans = StandardConsumer::new(platform.manager.clone(), 10);
    scans
        .consume(
            CancellationToken::new(),
            Tier::Low.queue(),
            Arc::new(handler_fn(|_body: Vec<u8>| async {
                Err::<(), _>(HandlerError::failed("scanner crashed"))
            })),
        )
        .await
        .unwrap();

    TaskPublisher::new(platform.publisher.clone())
        .publish_scan(&Context::new(), &ScanTask::new("port", "10.0.0.9", Tier::Low))
        .await
        .unwrap();

    let broker = platform.broker.clone();
    assert!(
        eventually(Duration::from_secs(1), || !broker.settlements(Tier::Low.queue()).is_empty()).await
    );
    scans.close().await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    platform.dead_letters.close().await.unwrap();

    assert_eq!(
        broker.settlements(routing::RETRY_QUEUE),
        vec![Settlement::Nack { requeue: true }]
    );
    assert_eq!(broker.depth(routing::RETRY_QUEUE), 1);
    assert_eq!(broker.depth(routing::MANUAL_INTERVENTION_QUEUE), 0);
}
