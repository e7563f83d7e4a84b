// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Propagates trace context through message headers. Publishers inject the caller's
//! context, consumers extract it and open one consumer span per delivery so a scan
//! task can be followed from the API that produced it to the worker that ran it.

use lapin::types::{AMQPValue, FieldTable, ShortString};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{Span, SpanKind, Status, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Name of the tracer used for consumer spans.
pub const TRACER_NAME: &str = "amqp consumer";

/// An adapter for injecting and extracting OpenTelemetry context from RabbitMQ headers.
///
/// Implements the OpenTelemetry `Injector` and `Extractor` traits over the header map
/// of a message, so the configured text map propagator can read and write it.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    /// Creates a new RabbitMQTracePropagator.
    ///
    /// # Parameters
    /// * `headers` - The header map the trace context is read from or written to
    ///
    /// # Returns
    /// A propagator borrowing `headers`
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    /// Stores a trace context entry as a lowercased long-string header.
    ///
    /// # Parameters
    /// * `key` - The header key
    /// * `value` - The header value
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    /// Reads a trace context entry from the headers.
    ///
    /// # Parameters
    /// * `key` - The header key
    ///
    /// # Returns
    /// The header value when it is a UTF-8 long string, `None` otherwise
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    /// Lists every header key, trace related or not.
    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the trace context of `ctx` into `headers`.
///
/// Uses the globally registered text map propagator, so nothing is written until the
/// embedding process installs one.
///
/// # Parameters
/// * `ctx` - The caller's context, usually the one of the request producing the message
/// * `headers` - The header map of the outgoing message
pub fn inject(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(headers))
    });
}

/// Extracts the remote context from `headers` and starts a consumer span named `name`.
///
/// # Parameters
/// * `headers` - The headers of the received delivery, if any
/// * `tracer` - The tracer the span is started on
/// * `name` - The span name
///
/// # Returns
/// The extracted parent context and the started `SpanKind::Consumer` span
pub fn new_span(headers: Option<&FieldTable>, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let mut carrier = headers.map(|h| h.inner().clone()).unwrap_or_default();

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut carrier))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

/// Marks the span as failed with `description`.
///
/// # Parameters
/// * `span` - The span of the delivery being processed
/// * `err` - The error recorded as a span event
/// * `description` - The status description
pub fn record_failure(span: &mut BoxedSpan, err: &(dyn std::error::Error + 'static), description: &str) {
    span.record_error(err);
    span.set_status(Status::Error {
        description: Cow::from(description.to_owned()),
    });
}
