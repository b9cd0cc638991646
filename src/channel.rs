// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! The dispatch engine only needs a handful of channel primitives: ack, nack,
//! publish and an open/closed probe. They are expressed by the [`AmqpChannel`]
//! trait so the engine can be driven by lapin in production and by mocks in
//! tests. This module also establishes the lapin connection and channel, and
//! declares the queue a subscriber consumes from.

use crate::{config::BusConfig, envelope::DeliveryTag, errors::BusError, queue::QueueDefinition};
use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// What the broker did with a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    /// The message was mandatory and no queue accepted it.
    Returned { reply_code: u16, reply_text: String },
}

/// The channel primitives the dispatch engine relies on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BusError>;

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BusError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<PublishOutcome, BusError>;
}

/// Creates a new AMQP connection and channel.
///
/// The application name from `cfg` is used as the connection name so the
/// connection can be identified in the broker management UI.
pub async fn new_amqp_channel(
    cfg: &BusConfig,
) -> Result<(Arc<Connection>, Arc<Channel>), BusError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(BusError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(BusError::ChannelError)
        }
    }
}

/// lapin-backed channel.
pub struct LapinChannel {
    channel: Arc<Channel>,
    confirms: bool,
}

impl LapinChannel {
    pub fn new(channel: Arc<Channel>) -> Self {
        LapinChannel {
            channel,
            confirms: false,
        }
    }

    /// Wraps `channel` with the publishing behaviour requested by `cfg`.
    ///
    /// # Parameters
    /// * `channel` - An open lapin channel
    /// * `cfg` - Bus settings; `publisher_confirms` selects confirm mode
    ///
    /// # Returns
    /// The channel, or [`BusError::ChannelError`] if confirm mode could not be
    /// enabled.
    pub async fn from_config(channel: Arc<Channel>, cfg: &BusConfig) -> Result<Self, BusError> {
        let channel = LapinChannel::new(channel);
        if cfg.publisher_confirms {
            channel.with_publisher_confirms().await
        } else {
            Ok(channel)
        }
    }

    /// Enables publisher confirms, which is what lets returned mandatory
    /// messages surface as [`PublishOutcome::Returned`].
    pub async fn with_publisher_confirms(mut self) -> Result<Self, BusError> {
        if let Err(err) = self
            .channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            error!(error = err.to_string(), "failure to enable publisher confirms");
            return Err(BusError::ChannelError);
        }
        self.confirms = true;
        Ok(self)
    }

    pub fn inner(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub async fn qos(&self, prefetch: u16) -> Result<(), BusError> {
        match self
            .channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), prefetch, "failure to configure qos");
                Err(BusError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Declares the queue (and its binding) and returns its actual name, which
    /// differs from the definition when the broker names the queue.
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, BusError> {
        debug!("declaring queue: {}", def.name);

        let queue = match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "failure to declare queue");
                Err(BusError::DeclareQueueError(def.name.clone()))
            }
            Ok(q) => Ok(q),
        }?;
        let name = queue.name().to_string();

        if let Some(exchange) = &def.exchange {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                name, exchange, def.routing_key
            );
            if let Err(err) = self
                .channel
                .queue_bind(
                    &name,
                    exchange,
                    &def.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
            {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(BusError::BindingExchangeToQueueError(
                    name,
                    exchange.to_owned(),
                ));
            }
        }

        debug!("queue: {} is ready", name);
        Ok(name)
    }

    /// Starts a push consumer on `queue`.
    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<Consumer, BusError> {
        match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(BusError::NoIncomingConnectionAccepted(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }
    }

    /// Pulls a single message with `basic.get`.
    pub async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>, BusError> {
        match self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to get message");
                Err(BusError::GetMessageError(queue.to_owned()))
            }
            Ok(msg) => Ok(msg.map(|m| m.delivery)),
        }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BusError> {
        match self
            .channel
            .basic_ack(tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), tag, "error whiling ack msg");
                Err(BusError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BusError> {
        match self
            .channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), tag, "error whiling nack msg");
                Err(BusError::NackMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<PublishOutcome, BusError> {
        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate: false,
                },
                body,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(BusError::PublishingError)
            }
            Ok(c) => Ok(c),
        }?;

        if !self.confirms {
            return Ok(PublishOutcome::Delivered);
        }

        match confirm.await {
            Ok(confirmation) => publish_outcome(confirmation),
            Err(err) => {
                error!(error = err.to_string(), "error waiting for publisher confirm");
                Err(BusError::PublishingError)
            }
        }
    }
}

/// Maps a publisher confirm to what happened to the message. A message the
/// broker hands back is reported as returned whether it was acked or nacked.
fn publish_outcome(confirmation: Confirmation) -> Result<PublishOutcome, BusError> {
    match confirmation {
        Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) => {
            Ok(PublishOutcome::Returned {
                reply_code: returned.reply_code,
                reply_text: returned.reply_text.as_str().to_owned(),
            })
        }
        Confirmation::Nack(None) => {
            error!("broker nacked the published message");
            Err(BusError::PublishingError)
        }
        Confirmation::Ack(None) | Confirmation::NotRequested => Ok(PublishOutcome::Delivered),
    }
}

/// Serializes every channel operation behind one writer lock.
///
/// A channel must not see concurrent publishes and acks from different
/// handlers, so everything the engine sends goes through this wrapper.
pub struct SerializedChannel {
    inner: Arc<dyn AmqpChannel>,
    writer: Mutex<()>,
}

impl SerializedChannel {
    pub fn new(inner: Arc<dyn AmqpChannel>) -> Arc<SerializedChannel> {
        Arc::new(SerializedChannel {
            inner,
            writer: Mutex::new(()),
        })
    }
}

#[async_trait]
impl AmqpChannel for SerializedChannel {
    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BusError> {
        let _writer = self.writer.lock().await;
        self.inner.ack(tag).await
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BusError> {
        let _writer = self.writer.lock().await;
        self.inner.nack(tag, requeue).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<PublishOutcome, BusError> {
        let _writer = self.writer.lock().await;
        self.inner
            .publish(exchange, routing_key, mandatory, properties, body)
            .await
    }
}
