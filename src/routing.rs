// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing Conventions
//!
//! Exchange names, queue names and routing-key patterns of the task platform, plus the
//! [`Tier`] type describing the three scan priority tiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Topic exchange receiving scan and asset tasks.
pub const TASK_DISPATCH_EXCHANGE: &str = "task.dispatch";
/// Direct exchange receiving scan results.
pub const RESULT_PROCESS_EXCHANGE: &str = "result.process";
/// Fanout exchange broadcasting notifications.
pub const NOTIFICATION_EXCHANGE: &str = "notification";
/// Topic exchange receiving dead-lettered messages and escalations.
pub const RETRY_EXCHANGE: &str = "task.retry";

pub const ASSET_TASK_QUEUE: &str = "asset.task";
pub const RESULT_STORAGE_QUEUE: &str = "result.storage";
pub const NOTIFICATION_EMAIL_QUEUE: &str = "notification.email";
pub const NOTIFICATION_WEBHOOK_QUEUE: &str = "notification.webhook";
pub const NOTIFICATION_AUDIT_QUEUE: &str = "notification.audit";
/// Time-bounded queue holding failed messages between attempts.
pub const RETRY_QUEUE: &str = "task.retry.wait";
/// Terminal queue for messages needing an operator.
pub const MANUAL_INTERVENTION_QUEUE: &str = "manual.intervention";

pub const ASSET_ROUTING_PATTERN: &str = "asset.*";
pub const RESULT_STORAGE_ROUTING_KEY: &str = "result.storage";
pub const RETRY_ROUTING_PATTERN: &str = "retry.#";
pub const MANUAL_ROUTING_PATTERN: &str = "manual.#";
/// Routing key the asset queue dead-letters with.
pub const ASSET_RETRY_KEY: &str = "retry.asset";
/// Routing key the result storage queue dead-letters with.
pub const RESULT_RETRY_KEY: &str = "retry.result";
/// Routing key used when escalating to the manual intervention queue.
pub const MANUAL_INTERVENTION_ROUTING_KEY: &str = "manual.intervention";

/// Delay between retry attempts, enforced by the retry queue TTL.
pub const RETRY_QUEUE_TTL_MS: i32 = 300_000;

/// Scan priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    High,
    Medium,
    Low,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::High, Tier::Medium, Tier::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::High => "high",
            Tier::Medium => "medium",
            Tier::Low => "low",
        }
    }

    pub fn queue(&self) -> &'static str {
        match self {
            Tier::High => "scan.high",
            Tier::Medium => "scan.medium",
            Tier::Low => "scan.low",
        }
    }

    /// Binding pattern on the task dispatch exchange.
    pub fn pattern(&self) -> &'static str {
        match self {
            Tier::High => "scan.*.high",
            Tier::Medium => "scan.*.medium",
            Tier::Low => "scan.*.low",
        }
    }

    /// `x-max-priority` of the tier queue.
    pub fn max_priority(&self) -> u8 {
        match self {
            Tier::High => 10,
            Tier::Medium => 5,
            Tier::Low => 1,
        }
    }

    /// Message priority stamped on tasks of this tier.
    pub fn message_priority(&self) -> u8 {
        match self {
            Tier::High => 9,
            Tier::Medium => 5,
            Tier::Low => 1,
        }
    }

    /// Routing key used when the tier queue dead-letters a message.
    pub fn retry_key(&self) -> &'static str {
        match self {
            Tier::High => "retry.scan.high",
            Tier::Medium => "retry.scan.medium",
            Tier::Low => "retry.scan.low",
        }
    }

    /// Routing key of a scan task, `scan.<scan_type>.<tier>`.
    pub fn routing_key(&self, scan_type: &str) -> String {
        format!("scan.{}.{}", scan_type, self.as_str())
    }

    /// Tier encoded in the last segment of a scan routing key.
    pub fn from_routing_key(key: &str) -> Option<Tier> {
        match key.rsplit('.').next()? {
            "high" => Some(Tier::High),
            "medium" => Some(Tier::Medium),
            "low" => Some(Tier::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing key of an asset task, `asset.<action>`.
pub fn asset_routing_key(action: &str) -> String {
    format!("asset.{}", action)
}
