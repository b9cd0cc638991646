// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Configuration
//!
//! Connection settings and per-subscription settings, deserialized with serde.
//! Every field has a default so partial documents are accepted.

use crate::{
    ack::AckMode,
    dispatcher::{Scheduler, SubscriptionOptions},
    envelope::Header,
    errors::BusError,
    queue::QueueDefinition,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::error;

/// Connection settings for the RabbitMQ server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Used as the AMQP connection name and as the default bus id.
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Enables publisher confirms so returned messages can be reported.
    /// Applied by [`crate::channel::LapinChannel::from_config`].
    pub publisher_confirms: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            app_name: "rabbitmq-bus".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "%2f".to_owned(),
            publisher_confirms: true,
        }
    }
}

impl BusConfig {
    pub fn from_json(raw: &str) -> Result<Self, BusError> {
        serde_json::from_str(raw).map_err(|err| {
            error!(error = err.to_string(), "invalid bus configuration");
            BusError::ConfigError(err.to_string())
        })
    }

    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

/// Settings of one subscription: its queue, filters and dispatch policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub queue: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub prefetch: u16,
    pub max_priority: Option<u8>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    /// Message TTL in milliseconds.
    pub message_ttl: Option<i32>,
    /// Idle queue expiry in milliseconds.
    pub expires: Option<i32>,
    pub exchange: Option<String>,
    pub routing_key: String,
    pub header_filters: BTreeMap<String, String>,
    pub hierarchy: bool,
    /// 1 keeps strict delivery order; more runs handlers concurrently.
    pub concurrency: usize,
    pub ack_mode: AckMode,
    pub redeliver_undecodable: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        SubscriptionConfig {
            queue: String::new(),
            durable: false,
            auto_delete: false,
            exclusive: false,
            prefetch: 0,
            max_priority: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
            expires: None,
            exchange: None,
            routing_key: String::new(),
            header_filters: BTreeMap::new(),
            hierarchy: false,
            concurrency: 1,
            ack_mode: AckMode::default(),
            redeliver_undecodable: false,
        }
    }
}

impl SubscriptionConfig {
    pub fn from_json(raw: &str) -> Result<Self, BusError> {
        serde_json::from_str(raw).map_err(|err| {
            error!(error = err.to_string(), "invalid subscription configuration");
            BusError::ConfigError(err.to_string())
        })
    }

    pub fn queue_definition(&self) -> QueueDefinition {
        let mut def = QueueDefinition::new(&self.queue).prefetch(self.prefetch);

        if self.durable {
            def = def.durable();
        }
        if self.auto_delete {
            def = def.auto_delete();
        }
        if self.exclusive {
            def = def.exclusive();
        }
        if let Some(priority) = self.max_priority {
            def = def.max_priority(priority);
        }
        if let Some(exchange) = &self.dead_letter_exchange {
            def = def.dead_letter(exchange, self.dead_letter_routing_key.as_deref());
        }
        if let Some(ttl) = self.message_ttl {
            def = def.ttl(ttl);
        }
        if let Some(expires) = self.expires {
            def = def.expires(expires);
        }
        if let Some(exchange) = &self.exchange {
            def = def.bind(exchange, &self.routing_key);
        }

        def
    }

    pub fn filter_headers(&self) -> Vec<Header> {
        self.header_filters
            .iter()
            .map(|(k, v)| Header::new(k.as_str(), v.as_str()))
            .collect()
    }

    pub fn options(&self) -> SubscriptionOptions {
        SubscriptionOptions {
            ack_mode: self.ack_mode,
            scheduler: match self.concurrency {
                0 | 1 => Scheduler::Inline,
                n => Scheduler::Bounded(n),
            },
            redeliver_undecodable: self.redeliver_undecodable,
            filter_headers: self.filter_headers(),
            hierarchy: self.hierarchy,
        }
    }
}
