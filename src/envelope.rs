// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Envelope and Header Model
//!
//! In-memory representation of a bus message. An [`Envelope`] is built either
//! from a delivery (wire properties plus the raw body) or from an application
//! send, and is treated as immutable once it reaches a handler.

use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, time::SystemTime};

/// Well-known header key carrying broker dead-lettering history.
pub const HEADER_DEAD_LETTER: &str = "x-death";
/// Well-known header key carrying federation/shovel origin information.
pub const HEADER_RECEIVED_FROM: &str = "x-received-from";
/// Well-known marker header set on rejected messages.
pub const HEADER_REJECTED: &str = "rejected";
/// Well-known header carrying a fault message on RPC replies.
pub const HEADER_EXCEPTION: &str = "exception";

/// Opaque broker-assigned identifier of a single delivery.
pub type DeliveryTag = u64;

/// (Name, Namespace) pair identifying the wire type of a message.
///
/// It is the primary routing key of the subscription registry and is
/// independent of the Rust type used to decode the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ContractKey {
    pub name: String,
    pub namespace: String,
}

impl ContractKey {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        ContractKey {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for ContractKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}:{}", self.namespace, self.name)
        }
    }
}

/// A message type that can travel over the bus.
///
/// `ancestors` declares the contracts this type specializes, nearest first.
/// A handler registered with hierarchy matching for one of those contracts
/// also receives this type.
pub trait Contract: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn contract_key() -> ContractKey;

    fn ancestors() -> Vec<ContractKey> {
        Vec::new()
    }
}

/// One entry of the broker `x-death` history.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeadLetterInfo {
    pub reason: String,
    pub queue: String,
    pub exchange: String,
    pub time: Option<u64>,
    pub routing_keys: Vec<String>,
    pub count: i64,
}

/// Origin information added by federation links and shovels.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceivedFromInfo {
    pub uri: String,
    pub exchange: String,
    pub redelivered: bool,
    pub cluster_name: String,
}

/// A key/value pair attached to an envelope.
///
/// Keys are not unique within an envelope. Well-known keys are recognized by
/// exact name when a delivery is decoded; anything else becomes `Generic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    DeadLetter(Vec<DeadLetterInfo>),
    ReceivedFrom(Vec<ReceivedFromInfo>),
    Rejected,
    Exception(String),
    Generic { key: String, value: String },
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Header::Generic {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Header::DeadLetter(_) => HEADER_DEAD_LETTER,
            Header::ReceivedFrom(_) => HEADER_RECEIVED_FROM,
            Header::Rejected => HEADER_REJECTED,
            Header::Exception(_) => HEADER_EXCEPTION,
            Header::Generic { key, .. } => key,
        }
    }
}

/// Contract key plus the headers a delivery must carry to match.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterInfo {
    pub contract: ContractKey,
    pub headers: Vec<Header>,
}

impl FilterInfo {
    pub fn new(contract: ContractKey) -> Self {
        FilterInfo {
            contract,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    /// Every filter header must be present, with the same value, in `headers`.
    pub fn matches(&self, headers: &[Header]) -> bool {
        self.headers.iter().all(|required| headers.contains(required))
    }

    /// Filters compare equal regardless of the order headers were declared in.
    pub(crate) fn same_as(&self, other: &FilterInfo) -> bool {
        self.contract == other.contract
            && self.headers.len() == other.headers.len()
            && self.headers.iter().all(|h| other.headers.contains(h))
    }
}

/// A bus message: payload bytes plus routing metadata and headers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Envelope {
    pub data: Vec<u8>,
    pub headers: Vec<Header>,
    pub bus_id: Option<String>,
    pub sent: Option<SystemTime>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    pub contract: ContractKey,
}

impl Envelope {
    pub fn new(contract: ContractKey, data: Vec<u8>) -> Self {
        Envelope {
            contract,
            data,
            sent: Some(SystemTime::now()),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_bus_id(mut self, bus_id: impl Into<String>) -> Self {
        self.bus_id = Some(bus_id.into());
        self
    }

    /// First header with the given key.
    pub fn header(&self, key: &str) -> Option<&Header> {
        self.headers.iter().find(|h| h.key() == key)
    }

    /// The fault message if this envelope is a fault reply.
    pub fn exception(&self) -> Option<&str> {
        self.headers.iter().find_map(|h| match h {
            Header::Exception(msg) => Some(msg.as_str()),
            _ => None,
        })
    }

    pub fn is_rejected(&self) -> bool {
        self.headers.iter().any(|h| matches!(h, Header::Rejected))
    }

    /// Builds an empty reply envelope addressed back to the sender of `self`.
    pub(crate) fn reply_skeleton(&self) -> Envelope {
        Envelope {
            correlation_id: self.correlation_id.clone(),
            sent: Some(SystemTime::now()),
            ..Default::default()
        }
    }
}

/// A decoded payload together with the envelope metadata it arrived with.
#[derive(Debug, Clone)]
pub struct BusMessage<T> {
    pub data: T,
    pub correlation_id: Option<String>,
    pub headers: Vec<Header>,
    pub sent: Option<SystemTime>,
    pub bus_id: Option<String>,
}

impl<T> BusMessage<T> {
    pub(crate) fn from_envelope(data: T, env: &Envelope) -> Self {
        BusMessage {
            data,
            correlation_id: env.correlation_id.clone(),
            headers: env.headers.clone(),
            sent: env.sent,
            bus_id: env.bus_id.clone(),
        }
    }
}
