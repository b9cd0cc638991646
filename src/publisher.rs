// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Publisher
//!
//! The serialized send path. Every envelope the bus sends, including handler
//! replies, goes through a [`BusPublisher`], which owns the single-writer
//! [`SerializedChannel`] and propagates the OpenTelemetry context in the
//! message headers.

use crate::{
    channel::{AmqpChannel, PublishOutcome, SerializedChannel},
    envelope::{Contract, Envelope, Header},
    errors::BusError,
    otel,
    properties::properties_from_envelope,
    serializer::Serializers,
    trace::{BusTrace, TracingBusTrace},
};
use lapin::types::FieldTable;
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct BusPublisher {
    channel: Arc<SerializedChannel>,
    serializers: Arc<Serializers>,
    trace: Arc<dyn BusTrace>,
    bus_id: Option<String>,
}

impl BusPublisher {
    pub fn new(channel: Arc<SerializedChannel>, serializers: Arc<Serializers>) -> Self {
        BusPublisher {
            channel,
            serializers,
            trace: Arc::new(TracingBusTrace),
            bus_id: None,
        }
    }

    pub fn with_trace(mut self, trace: Arc<dyn BusTrace>) -> Self {
        self.trace = trace;
        self
    }

    /// Stamped on outgoing envelopes that don't carry a bus id yet.
    pub fn with_bus_id(mut self, bus_id: impl Into<String>) -> Self {
        self.bus_id = Some(bus_id.into());
        self
    }

    /// The channel acks for this bus must go through.
    pub fn channel(&self) -> Arc<SerializedChannel> {
        self.channel.clone()
    }

    pub fn serializers(&self) -> Arc<Serializers> {
        self.serializers.clone()
    }

    /// Publishes an envelope. With `mandatory`, an unroutable message comes
    /// back as [`PublishOutcome::Returned`].
    pub async fn publish(
        &self,
        ctx: &Context,
        envelope: &Envelope,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
    ) -> Result<PublishOutcome, BusError> {
        let mut envelope = envelope.clone();
        if envelope.bus_id.is_none() {
            envelope.bus_id = self.bus_id.clone();
        }

        let props = properties_from_envelope(&envelope);
        let mut headers = props.headers().clone().unwrap_or_default().inner().clone();
        otel::inject(ctx, &mut headers);
        let props = props.with_headers(FieldTable::from(headers));

        let outcome = self
            .channel
            .publish(exchange, routing_key, mandatory, props, &envelope.data)
            .await?;

        match &outcome {
            PublishOutcome::Delivered => self.trace.message_sent(&envelope),
            PublishOutcome::Returned {
                reply_code,
                reply_text,
            } => warn!(
                reply_code,
                reply_text = reply_text.as_str(),
                contract = %envelope.contract,
                "message returned by the broker"
            ),
        }

        Ok(outcome)
    }

    /// Encodes `value` with the default serializer and publishes it.
    pub async fn send<T: Contract>(
        &self,
        ctx: &Context,
        value: &T,
        exchange: &str,
        routing_key: &str,
    ) -> Result<PublishOutcome, BusError> {
        let envelope = self.serializers.encode(value)?;
        self.publish(ctx, &envelope, exchange, routing_key, false)
            .await
    }

    /// Sends a handler reply back to `reply_to` through the default exchange.
    pub async fn reply(
        &self,
        ctx: &Context,
        reply: &Envelope,
        reply_to: &str,
    ) -> Result<(), BusError> {
        debug!(reply_to, correlation_id = reply.correlation_id.as_deref(), "sending reply");
        self.publish(ctx, reply, "", reply_to, false).await?;
        Ok(())
    }

    /// Sends a fault reply so the caller's request resolves as a handler fault.
    pub async fn fault_reply(
        &self,
        ctx: &Context,
        request: &Envelope,
        reply_to: &str,
        err: &BusError,
    ) -> Result<(), BusError> {
        let fault = request
            .reply_skeleton()
            .with_header(Header::Exception(err.to_string()));
        self.reply(ctx, &fault, reply_to).await
    }
}
