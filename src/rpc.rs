// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Client
//!
//! Request/reply over the bus. Requests carry a fresh correlation id and a
//! `reply_to` address; replies are matched back through a
//! [`CorrelationTable`]. Two reply paths are supported:
//!
//! - **fast reply**: the broker's direct reply-to pseudo queue, consumed in
//!   no-ack mode on the publishing channel
//! - **dedicated queue**: a private, broker-named queue consumed by a
//!   [`Subscription`] attached to the table
//!
//! Handlers answering requests are the same in both cases.

use crate::{
    channel::{LapinChannel, PublishOutcome},
    correlation::{CorrelationTable, ReplyHandle},
    dispatcher::{Subscription, SubscriptionOptions},
    envelope::{Contract, Envelope},
    errors::BusError,
    properties::decode_delivery,
    publisher::BusPublisher,
    queue::QueueDefinition,
};
use futures_util::{Stream, StreamExt};
use opentelemetry::Context;
use std::{fmt::Display, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// RabbitMQ direct reply-to pseudo queue.
pub const FAST_REPLY_QUEUE: &str = "amq.rabbitmq.reply-to";

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Where replies to a client's requests are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyMode {
    FastReply,
    DedicatedQueue(String),
}

impl ReplyMode {
    pub fn address(&self) -> &str {
        match self {
            ReplyMode::FastReply => FAST_REPLY_QUEUE,
            ReplyMode::DedicatedQueue(queue) => queue,
        }
    }
}

/// Sends requests and matches their replies through a [`CorrelationTable`].
pub struct RpcClient {
    publisher: Arc<BusPublisher>,
    table: Arc<CorrelationTable>,
    mode: ReplyMode,
    timeout: Duration,
}

impl RpcClient {
    /// Creates a client over an already running reply consumer.
    ///
    /// # Parameters
    /// * `publisher` - Send path for requests
    /// * `table` - Table the reply consumer completes
    /// * `mode` - Reply address stamped on every request
    ///
    /// # Returns
    /// A client waiting [`DEFAULT_REPLY_TIMEOUT`] for each reply
    pub fn new(
        publisher: Arc<BusPublisher>,
        table: Arc<CorrelationTable>,
        mode: ReplyMode,
    ) -> Self {
        RpcClient {
            publisher,
            table,
            mode,
            timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn mode(&self) -> &ReplyMode {
        &self.mode
    }

    /// Client answering through the broker's direct reply-to. The reply
    /// consumer must run on the channel the requests are published on.
    pub async fn fast_reply(
        channel: &LapinChannel,
        publisher: Arc<BusPublisher>,
        table: Arc<CorrelationTable>,
    ) -> Result<(RpcClient, JoinHandle<usize>), BusError> {
        let consumer = channel.consume(FAST_REPLY_QUEUE, "", true).await?;
        let replies =
            consumer.map(|result| result.map(|delivery| decode_delivery(&delivery).envelope));
        let pump = tokio::spawn(complete_replies(replies, table.clone()));

        Ok((RpcClient::new(publisher, table, ReplyMode::FastReply), pump))
    }

    /// Client answering through a private queue consumed by its own
    /// subscription. Closing the subscription stops the replies.
    ///
    /// Replies are acked through `publisher`, so `publisher` must be built
    /// over `channel`: delivery tags are only valid on the channel that
    /// received them.
    pub async fn dedicated_queue(
        channel: &LapinChannel,
        publisher: Arc<BusPublisher>,
        table: Arc<CorrelationTable>,
    ) -> Result<(RpcClient, Arc<Subscription>), BusError> {
        let name = channel
            .declare_queue(&QueueDefinition::private_reply())
            .await?;

        let subscription = Arc::new(
            Subscription::new(publisher.clone(), SubscriptionOptions::default())
                .with_correlation(table.clone()),
        );
        subscription
            .connect(channel, &QueueDefinition::new(&name).passive())
            .await?;
        subscription.open()?;

        debug!(queue = name, "dedicated reply queue ready");
        let client = RpcClient::new(publisher, table, ReplyMode::DedicatedQueue(name));
        Ok((client, subscription))
    }

    /// Publishes `request` and returns the handle its reply resolves.
    ///
    /// The request is mandatory: if the broker cannot route it the handle
    /// resolves with [`BusError::MessageUndeliverable`].
    ///
    /// # Parameters
    /// * `ctx` - Trace context propagated with the request
    /// * `request` - The request payload
    /// * `exchange` - Exchange the request is published to
    /// * `routing_key` - Routing key of the request
    ///
    /// # Returns
    /// The reply handle. Fails without registering anything if the request
    /// cannot be encoded or published.
    pub async fn call<Req: Contract, Resp: Contract>(
        &self,
        ctx: &Context,
        request: &Req,
        exchange: &str,
        routing_key: &str,
    ) -> Result<ReplyHandle<Resp>, BusError> {
        let correlation_id = Uuid::new_v4().to_string();
        let handle = self.table.register::<Resp>(&correlation_id, self.timeout)?;

        let envelope = match self.publisher.serializers().encode(request) {
            Ok(env) => env
                .with_correlation_id(correlation_id.as_str())
                .with_reply_to(self.mode.address()),
            Err(err) => {
                let _ = self.table.cancel(&correlation_id);
                return Err(err);
            }
        };

        match self
            .publisher
            .publish(ctx, &envelope, exchange, routing_key, true)
            .await
        {
            Ok(PublishOutcome::Delivered) => {}
            Ok(PublishOutcome::Returned {
                reply_code,
                reply_text,
            }) => {
                let _ = self
                    .table
                    .handle_returned(&correlation_id, reply_code, &reply_text);
            }
            Err(err) => {
                let _ = self.table.cancel(&correlation_id);
                return Err(err);
            }
        }

        Ok(handle)
    }

    /// Sends `request` and waits for its reply.
    pub async fn request<Req: Contract, Resp: Contract>(
        &self,
        ctx: &Context,
        request: &Req,
        exchange: &str,
        routing_key: &str,
    ) -> Result<Resp, BusError> {
        self.call::<Req, Resp>(ctx, request, exchange, routing_key)
            .await?
            .wait()
            .await
    }

    pub fn cancel(&self, correlation_id: &str) -> Result<(), BusError> {
        self.table.cancel(correlation_id)
    }
}

/// Completes pending requests from a stream of reply envelopes until it ends.
/// Returns how many replies resolved a request.
pub(crate) async fn complete_replies<S, E>(mut replies: S, table: Arc<CorrelationTable>) -> usize
where
    S: Stream<Item = Result<Envelope, E>> + Unpin,
    E: Display,
{
    let mut completed = 0;

    while let Some(result) = replies.next().await {
        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                error!(error = err.to_string(), "errors consume reply");
                continue;
            }
        };

        let Some(correlation_id) = reply.correlation_id.clone() else {
            warn!(contract = %reply.contract, "reply without correlation id");
            continue;
        };

        match table.complete(&correlation_id, reply) {
            Ok(()) => completed += 1,
            Err(err) => debug!(error = err.to_string(), "reply ignored"),
        }
    }

    completed
}
