// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Domain Publishers
//!
//! Thin helpers layered on [`Publisher`] that know the platform's routing conventions.
//! Payloads are serialized as JSON.

use crate::{
    backpressure::SystemState,
    errors::AmqpError,
    headers::AMQP_HEADERS_PRIORITY,
    publisher::{HeaderValues, PublishMessage, Publisher},
    routing::{self, Tier},
};
use chrono::{DateTime, Utc};
use opentelemetry::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const SCAN_TASK_TYPE: &str = "scan.task";
pub const ASSET_TASK_TYPE: &str = "asset.task";
pub const SCAN_RESULT_TYPE: &str = "scan.result";
pub const NOTIFICATION_TYPE: &str = "notification";

/// A scan to run against a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanTask {
    pub task_id: String,
    pub scan_type: String,
    pub target: String,
    pub tier: Tier,
    #[serde(default)]
    pub parameters: Value,
    pub created_at: DateTime<Utc>,
}

impl ScanTask {
    pub fn new(scan_type: &str, target: &str, tier: Tier) -> Self {
        ScanTask {
            task_id: Uuid::new_v4().to_string(),
            scan_type: scan_type.to_owned(),
            target: target.to_owned(),
            tier,
            parameters: Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn routing_key(&self) -> String {
        self.tier.routing_key(&self.scan_type)
    }
}

/// An operation on an asset, routed by action (`asset.discover`, `asset.sync`...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetTask {
    pub task_id: String,
    pub asset_id: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl AssetTask {
    pub fn new(asset_id: &str, action: &str) -> Self {
        AssetTask {
            task_id: Uuid::new_v4().to_string(),
            asset_id: asset_id.to_owned(),
            action: action.to_owned(),
            payload: Value::Null,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Succeeded,
    Failed,
    TimedOut,
}

/// Outcome of a scan, sent to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub task_id: String,
    pub status: ScanStatus,
    #[serde(default)]
    pub findings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(subject: &str, body: &str) -> Self {
        Notification {
            subject: subject.to_owned(),
            body: body.to_owned(),
            task_id: None,
            created_at: Utc::now(),
        }
    }
}

fn encode<T: Serialize>(payload: &T) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(payload).map_err(|err| {
        error!(error = err.to_string(), "failure to serialize payload");
        AmqpError::ParsePayloadError(err.to_string())
    })
}

/// Publishes scan and asset tasks on the task dispatch exchange.
pub struct TaskPublisher {
    publisher: Arc<dyn Publisher>,
    state: Option<SystemState>,
}

impl TaskPublisher {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        TaskPublisher {
            publisher,
            state: None,
        }
    }

    /// Refuses new scan tasks while `state` is saturated.
    pub fn with_admission(mut self, state: SystemState) -> Self {
        self.state = Some(state);
        self
    }

    /// Publishes `task` with routing key `scan.<type>.<tier>` and the tier's priority.
    pub async fn publish_scan(&self, ctx: &Context, task: &ScanTask) -> Result<(), AmqpError> {
        if self.state.as_ref().is_some_and(SystemState::is_saturated) {
            warn!(task_id = %task.task_id, tier = task.tier.as_str(), "system saturated, refusing scan task");
            return Err(AmqpError::SystemSaturated);
        }

        let priority = task.tier.message_priority();
        let routing_key = task.routing_key();
        let msg = PublishMessage::new(routing::TASK_DISPATCH_EXCHANGE, &routing_key, encode(task)?)
            .msg_type(SCAN_TASK_TYPE)
            .priority(priority)
            .header(AMQP_HEADERS_PRIORITY, HeaderValues::LongInt(i32::from(priority)));

        self.publisher.publish_message(ctx, &msg).await?;
        debug!(task_id = %task.task_id, routing_key = %routing_key, "scan task published");
        Ok(())
    }

    pub async fn publish_asset(&self, ctx: &Context, task: &AssetTask) -> Result<(), AmqpError> {
        let routing_key = routing::asset_routing_key(&task.action);
        let msg = PublishMessage::new(routing::TASK_DISPATCH_EXCHANGE, &routing_key, encode(task)?)
            .msg_type(ASSET_TASK_TYPE);

        self.publisher.publish_message(ctx, &msg).await?;
        debug!(task_id = %task.task_id, routing_key = %routing_key, "asset task published");
        Ok(())
    }
}

/// Publishes scan results on the direct result exchange.
pub struct ResultPublisher {
    publisher: Arc<dyn Publisher>,
}

impl ResultPublisher {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        ResultPublisher { publisher }
    }

    pub async fn publish_result(&self, ctx: &Context, result: &ScanResult) -> Result<(), AmqpError> {
        let msg = PublishMessage::new(
            routing::RESULT_PROCESS_EXCHANGE,
            routing::RESULT_STORAGE_ROUTING_KEY,
            encode(result)?,
        )
        .msg_type(SCAN_RESULT_TYPE);

        self.publisher.publish_message(ctx, &msg).await
    }
}

/// Broadcasts notifications to every notification queue.
pub struct NotificationPublisher {
    publisher: Arc<dyn Publisher>,
}

impl NotificationPublisher {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        NotificationPublisher { publisher }
    }

    pub async fn notify(&self, ctx: &Context, notification: &Notification) -> Result<(), AmqpError> {
        let msg = PublishMessage::new(routing::NOTIFICATION_EXCHANGE, "", encode(notification)?)
            .msg_type(NOTIFICATION_TYPE);

        self.publisher.publish_message(ctx, &msg).await
    }
}
