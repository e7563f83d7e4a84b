// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Header Conventions
//!
//! Header names shared by producers and consumers, together with the parsers for
//! the broker-populated `x-death` provenance and the application `x-retry-info`
//! side-channel that carries retry state across broker round-trips.

use crate::errors::AmqpError;
use chrono::{DateTime, Utc};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use serde::{Deserialize, Serialize};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Application header carrying the JSON encoded [`RetryInfo`]
pub const AMQP_HEADERS_RETRY_INFO: &str = "x-retry-info";
/// Application header mirroring the message priority
pub const AMQP_HEADERS_PRIORITY: &str = "x-priority";
/// Header attached to escalated messages for operator triage
pub const AMQP_HEADERS_FAILURE_REASON: &str = "x-failure-reason";

/// Retry bookkeeping carried in the `x-retry-info` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryInfo {
    #[serde(rename = "retry_count")]
    pub attempt_count: u32,
    #[serde(rename = "last_retry_time")]
    pub last_retry_at: DateTime<Utc>,
    pub original_exchange: String,
    pub original_routing_key: String,
}

impl RetryInfo {
    /// Starts the bookkeeping for a message seen for the first time on the retry queue.
    pub fn first(exchange: &str, routing_key: &str) -> Self {
        RetryInfo {
            attempt_count: 0,
            last_retry_at: Utc::now(),
            original_exchange: exchange.to_owned(),
            original_routing_key: routing_key.to_owned(),
        }
    }

    /// Whether both halves of the original destination are known.
    pub fn has_destination(&self) -> bool {
        !self.original_exchange.is_empty() && !self.original_routing_key.is_empty()
    }

    pub fn to_header(&self) -> Result<AMQPValue, AmqpError> {
        serde_json::to_string(self)
            .map(|raw| AMQPValue::LongString(LongString::from(raw)))
            .map_err(|err| AmqpError::HeaderError(AMQP_HEADERS_RETRY_INFO.to_owned(), err.to_string()))
    }
}

/// One entry of the broker-populated `x-death` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeathRecord {
    pub queue: String,
    pub reason: String,
    pub count: i64,
    pub exchange: String,
    pub routing_keys: Vec<String>,
    pub time: Option<u64>,
}

/// Reads the `x-death` header. `None` when the header is absent or not a list.
pub fn x_death(headers: Option<&FieldTable>) -> Option<Vec<DeathRecord>> {
    let value = headers?.inner().get(AMQP_HEADERS_X_DEATH)?;
    let entries = value.as_array()?;

    Some(
        entries
            .as_slice()
            .iter()
            .filter_map(|entry| entry.as_field_table())
            .map(death_record)
            .collect(),
    )
}

fn death_record(table: &FieldTable) -> DeathRecord {
    let inner = table.inner();
    let text = |key: &str| inner.get(key).and_then(as_string).unwrap_or_default();

    DeathRecord {
        queue: text("queue"),
        reason: text("reason"),
        count: inner
            .get(AMQP_HEADERS_COUNT)
            .and_then(as_i64)
            .unwrap_or_default(),
        exchange: text("exchange"),
        routing_keys: inner
            .get("routing-keys")
            .and_then(|v| v.as_array())
            .map(|keys| keys.as_slice().iter().filter_map(as_string).collect())
            .unwrap_or_default(),
        time: inner.get("time").and_then(|v| match v {
            AMQPValue::Timestamp(ts) => Some(*ts),
            other => as_i64(other).map(|ts| ts as u64),
        }),
    }
}

/// Reads the `x-retry-info` header.
///
/// `Ok(None)` when absent, an error when present but not decodable.
pub fn retry_info(headers: Option<&FieldTable>) -> Result<Option<RetryInfo>, AmqpError> {
    let Some(value) = headers.and_then(|h| h.inner().get(AMQP_HEADERS_RETRY_INFO)) else {
        return Ok(None);
    };

    let raw = match value {
        AMQPValue::ByteArray(bytes) => String::from_utf8_lossy(bytes.as_slice()).into_owned(),
        other => as_string(other).ok_or_else(|| {
            AmqpError::HeaderError(
                AMQP_HEADERS_RETRY_INFO.to_owned(),
                "unexpected header type".to_owned(),
            )
        })?,
    };

    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|err| AmqpError::HeaderError(AMQP_HEADERS_RETRY_INFO.to_owned(), err.to_string()))
}

/// Reads a header as text.
pub fn header_string(headers: Option<&FieldTable>, key: &str) -> Option<String> {
    headers?.inner().get(key).and_then(as_string)
}

/// Reads a header as an integer, accepting any AMQP integer width.
pub fn header_i64(headers: Option<&FieldTable>, key: &str) -> Option<i64> {
    headers?.inner().get(key).and_then(as_i64)
}

/// Copies `headers` dropping the given keys.
pub fn without(headers: Option<&FieldTable>, keys: &[&str]) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(headers) = headers {
        for (key, value) in headers.inner() {
            if !keys.contains(&key.as_str()) {
                table.insert(key.clone(), value.clone());
            }
        }
    }
    table
}

/// Inserts a text header.
pub fn insert_string(table: &mut FieldTable, key: &str, value: &str) {
    table.insert(
        ShortString::from(key),
        AMQPValue::LongString(LongString::from(value)),
    );
}

fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        _ => None,
    }
}

fn as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::FieldArray;

    fn death_table(exchange: &str, key: &str, count: i64) -> AMQPValue {
        let mut entry = FieldTable::default();
        insert_string(&mut entry, "queue", "scan.high");
        insert_string(&mut entry, "reason", "rejected");
        insert_string(&mut entry, "exchange", exchange);
        entry.insert(
            ShortString::from(AMQP_HEADERS_COUNT),
            AMQPValue::LongLongInt(count),
        );
        entry.insert(
            ShortString::from("routing-keys"),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::LongString(
                LongString::from(key),
            )])),
        );
        entry.insert(ShortString::from("time"), AMQPValue::Timestamp(1_700_000_000));
        AMQPValue::FieldTable(entry)
    }

    #[test]
    fn parses_x_death_entries() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(vec![death_table(
                "task.dispatch",
                "scan.vulnerability.high",
                2,
            )])),
        );

        let deaths = x_death(Some(&headers)).unwrap();
        assert_eq!(deaths.len(), 1);
        assert_eq!(deaths[0].exchange, "task.dispatch");
        assert_eq!(deaths[0].routing_keys, vec!["scan.vulnerability.high"]);
        assert_eq!(deaths[0].count, 2);
        assert_eq!(deaths[0].reason, "rejected");
        assert_eq!(deaths[0].time, Some(1_700_000_000));
    }

    #[test]
    fn missing_x_death_is_none() {
        assert!(x_death(None).is_none());
        assert!(x_death(Some(&FieldTable::default())).is_none());
    }

    #[test]
    fn retry_info_survives_header_encoding() {
        let info = RetryInfo {
            attempt_count: 2,
            ..RetryInfo::first("task.dispatch", "scan.sast.low")
        };

        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_INFO),
            info.to_header().unwrap(),
        );

        assert_eq!(retry_info(Some(&headers)).unwrap(), Some(info));
        assert_eq!(retry_info(None).unwrap(), None);
    }

    #[test]
    fn garbage_retry_info_is_an_error() {
        let mut headers = FieldTable::default();
        insert_string(&mut headers, AMQP_HEADERS_RETRY_INFO, "{not json");

        assert!(matches!(
            retry_info(Some(&headers)),
            Err(AmqpError::HeaderError(_, _))
        ));
    }

    #[test]
    fn without_drops_only_listed_keys() {
        let mut headers = FieldTable::default();
        insert_string(&mut headers, "keep", "1");
        insert_string(&mut headers, AMQP_HEADERS_X_DEATH, "gone");

        let copy = without(Some(&headers), &[AMQP_HEADERS_X_DEATH]);
        assert_eq!(header_string(Some(&copy), "keep"), Some("1".to_owned()));
        assert!(header_string(Some(&copy), AMQP_HEADERS_X_DEATH).is_none());
    }
}
