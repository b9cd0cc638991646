// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Message Bus
//!
//! This module provides the error taxonomy shared by every part of the bus:
//! the delivery queue, the subscription registry, call handlers, the RPC
//! correlation table and the AMQP transport underneath them.

use thiserror::Error;

/// Represents errors that can occur while consuming, dispatching or publishing
/// bus messages.
///
/// Structural failures (`QueueClosed`, `SubscriptionClosed`) mean the component
/// is no longer usable. RPC failures (`ReplyTimeout`, `MessageUndeliverable`,
/// `RequestCancelled`) are only ever delivered to the caller waiting on the
/// request. Transport failures wrap the lapin error text after it was logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The delivery queue has been closed
    #[error("delivery queue is closed")]
    QueueClosed,

    /// A request with the same correlation id is still pending
    #[error("correlation id `{0}` is already pending")]
    DuplicateCorrelationId(String),

    /// No pending request carries the given correlation id
    #[error("unknown correlation id `{0}`")]
    UnknownCorrelationId(String),

    /// The request deadline elapsed before a reply arrived
    #[error("no reply received for `{0}` before the deadline")]
    ReplyTimeout(String),

    /// The broker returned the request as unroutable
    #[error("message undeliverable: {code} {text}")]
    MessageUndeliverable { code: u16, text: String },

    /// The request was cancelled by the caller
    #[error("request `{0}` was cancelled")]
    RequestCancelled(String),

    /// A call handler raised a fault
    #[error("handler failure: {0}")]
    Handler(String),

    /// The payload did not match the expected contract
    #[error("failure to deserialize payload: {0}")]
    Deserialize(String),

    /// The payload could not be encoded
    #[error("failure to serialize payload: {0}")]
    Serialize(String),

    /// The transaction already reached (or is reaching) its outcome
    #[error("transaction `{0}` is no longer active")]
    TransactionCompleted(String),

    /// Operation attempted after the subscription was closed
    #[error("subscription is closed")]
    SubscriptionClosed,

    /// The subscriber could not establish a consumer on the queue
    #[error("no incoming connection accepted on `{0}`")]
    NoIncomingConnectionAccepted(String),

    /// The configuration document could not be parsed
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error pulling a message with basic.get
    #[error("failure to get message from `{0}`")]
    GetMessageError(String),
}

impl BusError {
    /// Wraps any displayable handler fault.
    pub fn handler<E: std::fmt::Display>(err: E) -> Self {
        BusError::Handler(err.to_string())
    }

    /// True for failures that mean the payload itself is unusable, as opposed
    /// to a failure while processing a well-formed message.
    pub fn is_payload_error(&self) -> bool {
        matches!(self, BusError::Deserialize(_))
    }
}
