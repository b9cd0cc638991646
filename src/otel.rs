// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through AMQP message headers. Outgoing messages get
//! the current context injected into their header table; on receipt the
//! context is extracted from the envelope headers and a consumer span is
//! opened for the dispatch.

use crate::envelope::{Envelope, Header};
use lapin::types::{AMQPValue, ShortString};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// Injects trace context into an outgoing AMQP header table.
pub(crate) struct AmqpHeaderInjector<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> AmqpHeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for AmqpHeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Reads trace context back from the generic headers of a received envelope.
pub(crate) struct EnvelopeHeaderExtractor<'a> {
    headers: &'a [Header],
}

impl<'a> EnvelopeHeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a [Header]) -> Self {
        Self { headers }
    }
}

impl Extractor for EnvelopeHeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.iter().find_map(|header| match header {
            Header::Generic { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers
            .iter()
            .filter_map(|header| match header {
                Header::Generic { key, .. } => Some(key.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Injects `ctx` into `headers` with the globally configured propagator.
pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut AmqpHeaderInjector::new(headers))
    });
}

/// Opens a consumer span for a received envelope, named after its contract,
/// as a child of the context the sender propagated.
pub(crate) fn new_span(env: &Envelope, tracer: &BoxedTracer) -> (Context, BoxedSpan) {
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&EnvelopeHeaderExtractor::new(&env.headers))
    });

    let span = tracer
        .span_builder(Cow::from(env.contract.to_string()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
