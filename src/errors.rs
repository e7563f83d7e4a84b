// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Task Broker
//!
//! This module provides the error types shared by every component of the crate.
//! `AmqpError` covers broker-side failures (connectivity, declarations, publishing,
//! acknowledgement) while `HandlerError` is the application-facing taxonomy used by
//! message handlers to tell a consumer how a failed delivery must be settled.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant provides specific context about what operation failed. Connectivity
/// variants are retried by the connection manager, publish variants by the reliable
/// publisher, everything else is surfaced to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Every pooled connection is in use and the pool is at its maximum size
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The pool was closed and can no longer hand out connections
    #[error("connection pool closed")]
    PoolClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker negatively acknowledged a published message
    #[error("publish was nacked by the broker")]
    PublishNacked,

    /// The broker did not confirm a published message in time
    #[error("timeout waiting for publish confirmation")]
    PublishConfirmTimeout,

    /// Every publish attempt failed
    #[error("failed to publish after {0} attempts")]
    PublishRetriesExhausted(u32),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error reading or writing a message header
    #[error("invalid header `{0}`: {1}")]
    HeaderError(String, String),

    /// Error compressing or decompressing a payload
    #[error("failure to (de)compress payload: {0}")]
    CompressionError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error publishing a message to the manual intervention queue
    #[error("failure to escalate message: {0}")]
    EscalationError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The system is saturated and refuses new work
    #[error("system saturated, try again later")]
    SystemSaturated,

    /// The component was already closed
    #[error("already closed")]
    AlreadyClosed,
}

/// Errors returned by application message handlers.
///
/// The variant decides how the consumer settles the delivery: backpressure is
/// requeued so the message is merely deferred, every other failure is nacked
/// without requeue and left to the queue's dead-letter configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Downstream capacity is exhausted; the message is valid and must be retried later
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// Business failure while processing the message
    #[error("handler failed: {0}")]
    Failed(String),

    /// The message can never be processed as-is
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl HandlerError {
    /// Shorthand for a business failure.
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }

    /// Shorthand for a backpressure failure.
    pub fn backpressure(msg: impl Into<String>) -> Self {
        HandlerError::Backpressure(msg.into())
    }

    /// Whether the delivery should go back to its queue instead of being dead-lettered.
    pub fn requeue(&self) -> bool {
        matches!(self, HandlerError::Backpressure(_))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Malformed(err.to_string())
    }
}

impl From<AmqpError> for HandlerError {
    fn from(err: AmqpError) -> Self {
        match err {
            AmqpError::SystemSaturated => HandlerError::Backpressure(err.to_string()),
            AmqpError::ParsePayloadError(_) | AmqpError::CompressionError(_) => {
                HandlerError::Malformed(err.to_string())
            }
            other => HandlerError::Failed(other.to_string()),
        }
    }
}

/// Errors surfaced while supervising a downstream task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The circuit breaker refused to dispatch the task
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The task was stopped after exceeding its deadline
    #[error("task `{0}` timed out after {1:?}")]
    TimedOut(String, Duration),

    /// The executor cancelled the task
    #[error("task `{0}` was cancelled")]
    Cancelled(String),

    /// The task ran and failed
    #[error("task failed: {0}")]
    Failed(String),

    /// Another supervised run already owns this task id
    #[error("task `{0}` is already running")]
    AlreadyRunning(String),
}
