// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context travels inside message headers: the publisher injects the
//! caller's context, the consumer extracts it and opens one consumer span per
//! delivery.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, LongString, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{Span, SpanKind, Tracer},
    Context, KeyValue,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::warn;

/// Message headers seen as an OpenTelemetry carrier. Keys are stored lowercase,
/// only long string values are readable as trace fields.
pub(crate) struct HeaderCarrier<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderCarrier<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        HeaderCarrier { headers }
    }
}

impl Injector for HeaderCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        let key = ShortString::from(key.to_ascii_lowercase());
        self.headers
            .insert(key, AMQPValue::LongString(LongString::from(value)));
    }
}

impl Extractor for HeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        let Some(AMQPValue::LongString(value)) = self.headers.get(key) else {
            return None;
        };

        match std::str::from_utf8(value.as_bytes()) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = err.to_string(), "trace header is not utf-8");
                None
            }
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(ShortString::as_str).collect()
    }
}

/// Writes the current trace context into outgoing headers.
pub(crate) fn inject_current(headers: &mut BTreeMap<ShortString, AMQPValue>) {
    let ctx = Context::current();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeaderCarrier::new(headers))
    });
}

/// Opens the consumer span for one delivery from `queue`.
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub(crate) fn new_span(
    props: &AMQPProperties,
    tracer: &BoxedTracer,
    queue: &str,
) -> (Context, BoxedSpan) {
    let mut headers = props
        .headers()
        .as_ref()
        .map(|headers| headers.inner().clone())
        .unwrap_or_default();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderCarrier::new(&mut headers))
    });

    let mut span = tracer
        .span_builder(Cow::from(format!("{} process", queue)))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    span.set_attribute(KeyValue::new("messaging.system", "rabbitmq"));
    span.set_attribute(KeyValue::new("messaging.destination.name", queue.to_owned()));
    if let Some(id) = props.message_id() {
        span.set_attribute(KeyValue::new("messaging.message.id", id.to_string()));
    }

    (ctx, span)
}
