// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # rabbitmq-tasks
//!
//! Broker reliability layer of the task platform: pooled connections with automatic
//! recovery, a confirming publisher, topology bootstrap, the consumer family (standard,
//! batch, idempotent, dead-letter), priority scheduling under backpressure, and the
//! circuit breaker and timeout controller guarding task execution.

mod otel;

pub mod backpressure;
pub mod batch;
pub mod channel;
pub mod circuit_breaker;
pub mod compression;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dead_letter;
pub mod delivery;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod headers;
pub mod idempotent;
pub mod logging;
pub mod metrics;
pub mod publisher;
pub mod publishers;
pub mod queue;
pub mod routing;
pub mod scheduler;
pub mod timeout;
pub mod topology;
pub mod transport;
