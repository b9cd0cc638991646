// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definition
//!
//! The settings a subscriber needs for the queue it consumes from: name,
//! durability, prefetch, and the optional broker arguments (TTL, expiry,
//! max priority, dead-letter target) plus the exchange binding.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortShortUInt, ShortString};
use std::collections::BTreeMap;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify idle queue expiry
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify the queue priority range
pub const AMQP_HEADERS_MAX_PRIORITY: &str = "x-max-priority";

/// Definition of the queue a subscription consumes from.
///
/// An empty name lets the broker pick one, which is how private reply queues
/// are declared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) prefetch: u16,
    pub(crate) ttl: Option<i32>,
    pub(crate) expires: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_priority: Option<u8>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
    pub(crate) exchange: Option<String>,
    pub(crate) routing_key: String,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default the queue is non-durable, non-exclusive and unbound.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Broker-named, exclusive, auto-deleted queue used for dedicated replies.
    pub fn private_reply() -> QueueDefinition {
        QueueDefinition::new("").exclusive().auto_delete()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the queue once its last consumer is gone.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks the queue exists instead of declaring it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Maximum number of unacknowledged deliveries pushed to the consumer.
    /// Zero means unlimited.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = count;
        self
    }

    /// Sets the message Time-To-Live in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Deletes the queue after it has been unused for `expires` milliseconds.
    pub fn expires(mut self, expires: i32) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn max_priority(mut self, priority: u8) -> Self {
        self.max_priority = Some(priority);
        self
    }

    /// Routes rejected and expired messages to `exchange`, optionally with a
    /// fixed routing key.
    pub fn dead_letter(mut self, exchange: &str, routing_key: Option<&str>) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = routing_key.map(str::to_owned);
        self
    }

    /// Binds the queue to `exchange` with `routing_key` once declared.
    pub fn bind(mut self, exchange: &str, routing_key: &str) -> Self {
        self.exchange = Some(exchange.to_owned());
        self.routing_key = routing_key.to_owned();
        self
    }

    /// Broker arguments for `queue.declare`.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::<ShortString, AMQPValue>::new();

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.as_str())),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.as_str())),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(expires) = self.expires {
            args.insert(
                ShortString::from(AMQP_HEADERS_EXPIRES),
                AMQPValue::LongInt(LongInt::from(expires)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(priority) = self.max_priority {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_PRIORITY),
                AMQPValue::ShortShortUInt(ShortShortUInt::from(priority)),
            );
        }

        FieldTable::from(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arguments_only_contain_configured_settings() {
        let def = QueueDefinition::new("orders").durable().prefetch(10);

        assert!(def.arguments().inner().is_empty());
        assert_eq!(def.prefetch_count(), 10);
    }

    #[test]
    fn test_arguments_carry_broker_settings() {
        let def = QueueDefinition::new("orders")
            .ttl(60_000)
            .expires(120_000)
            .max_priority(9)
            .dead_letter("orders.dlx", Some("orders.dead"));

        let args = def.arguments();
        let args = args.inner();

        assert_eq!(
            args.get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongInt(60_000))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_EXPIRES),
            Some(&AMQPValue::LongInt(120_000))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_MAX_PRIORITY),
            Some(&AMQPValue::ShortShortUInt(9))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString("orders.dlx".into()))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString("orders.dead".into()))
        );
    }

    #[test]
    fn test_private_reply_queue_is_broker_named_and_exclusive() {
        let def = QueueDefinition::private_reply();

        assert_eq!(def.name(), "");
        assert!(def.exclusive);
        assert!(def.auto_delete);
        assert!(!def.durable);
    }
}
