// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Acknowledgment Strategies
//!
//! Decides how a delivery is settled with the broker once it has been
//! dispatched:
//!
//! - [`NoAck`]: the broker settled the delivery when it pushed it.
//! - [`TransactionalAck`]: ack on accept, nack with requeue on reject.
//! - [`AmbientTransactionAck`]: on accept inside an ambient [`Transaction`],
//!   enlist a [`DeliveryEnlistment`] and let the transaction outcome decide.

use crate::{
    channel::AmqpChannel,
    envelope::DeliveryTag,
    errors::BusError,
    transaction::{Participant, Transaction, Vote},
};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// How deliveries of a subscription are settled with the broker. Configured
/// as `no-ack`, `transactional` or `ambient-transaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckMode {
    NoAck,
    #[default]
    Transactional,
    AmbientTransaction,
}

/// Decides how and when a delivery is reported as done or handed back.
#[async_trait]
pub trait AckStrategy: Send + Sync {
    /// True when deliveries are already settled once received, so consumers
    /// must be started with `no_ack`.
    fn settles_on_delivery(&self) -> bool {
        false
    }

    /// The delivery was processed.
    async fn accept(&self, tag: DeliveryTag) -> Result<(), BusError>;

    /// The delivery must be handed back to the broker for redelivery.
    async fn reject(&self, tag: DeliveryTag) -> Result<(), BusError>;
}

/// Builds the strategy for `mode`.
///
/// # Parameters
/// * `mode` - The configured acknowledgment mode
/// * `channel` - The channel the deliveries were received on
///
/// # Returns
/// The strategy, shared by every delivery of a subscription
pub fn strategy_for(mode: AckMode, channel: Arc<dyn AmqpChannel>) -> Arc<dyn AckStrategy> {
    match mode {
        AckMode::NoAck => Arc::new(NoAck),
        AckMode::Transactional => Arc::new(TransactionalAck::new(channel)),
        AckMode::AmbientTransaction => Arc::new(AmbientTransactionAck::new(channel)),
    }
}

/// The broker settled the delivery when it sent it; accept and reject do
/// nothing.
pub struct NoAck;

#[async_trait]
impl AckStrategy for NoAck {
    fn settles_on_delivery(&self) -> bool {
        true
    }

    async fn accept(&self, _tag: DeliveryTag) -> Result<(), BusError> {
        Ok(())
    }

    async fn reject(&self, _tag: DeliveryTag) -> Result<(), BusError> {
        Ok(())
    }
}

/// Acks on accept and nacks with requeue on reject, immediately.
pub struct TransactionalAck {
    channel: Arc<dyn AmqpChannel>,
}

impl TransactionalAck {
    pub fn new(channel: Arc<dyn AmqpChannel>) -> Self {
        TransactionalAck { channel }
    }
}

#[async_trait]
impl AckStrategy for TransactionalAck {
    async fn accept(&self, tag: DeliveryTag) -> Result<(), BusError> {
        self.channel.ack(tag).await
    }

    async fn reject(&self, tag: DeliveryTag) -> Result<(), BusError> {
        self.channel.nack(tag, true).await
    }
}

/// Defers the ack to the ambient [`Transaction`]: an accepted delivery is
/// enlisted and acked on commit, or requeued on rollback. Without an ambient
/// transaction it behaves like [`TransactionalAck`].
pub struct AmbientTransactionAck {
    channel: Arc<dyn AmqpChannel>,
}

impl AmbientTransactionAck {
    pub fn new(channel: Arc<dyn AmqpChannel>) -> Self {
        AmbientTransactionAck { channel }
    }
}

#[async_trait]
impl AckStrategy for AmbientTransactionAck {
    async fn accept(&self, tag: DeliveryTag) -> Result<(), BusError> {
        let Some(tx) = Transaction::current() else {
            return self.channel.ack(tag).await;
        };

        let enlistment = Arc::new(DeliveryEnlistment::new(tag, self.channel.clone()));
        match tx.enlist(enlistment) {
            Ok(()) => {
                debug!(tag, transaction = tx.id(), "delivery enlisted");
                Ok(())
            }
            Err(err) => {
                warn!(error = err.to_string(), tag, "transaction no longer active, acking now");
                self.channel.ack(tag).await
            }
        }
    }

    async fn reject(&self, tag: DeliveryTag) -> Result<(), BusError> {
        if !self.channel.is_open() {
            debug!(tag, "channel closed, skipping nack");
            return Ok(());
        }
        self.channel.nack(tag, true).await
    }
}

/// Two-phase participant holding one pending ack.
pub struct DeliveryEnlistment {
    tag: DeliveryTag,
    channel: Arc<dyn AmqpChannel>,
}

impl DeliveryEnlistment {
    pub fn new(tag: DeliveryTag, channel: Arc<dyn AmqpChannel>) -> Self {
        DeliveryEnlistment { tag, channel }
    }
}

#[async_trait]
impl Participant for DeliveryEnlistment {
    async fn prepare(&self) -> Vote {
        Vote::Prepared
    }

    async fn commit(&self) {
        if !self.channel.is_open() {
            debug!(tag = self.tag, "channel closed, skipping ack");
            return;
        }
        if let Err(err) = self.channel.ack(self.tag).await {
            error!(error = err.to_string(), tag = self.tag, "failure to ack on commit");
        }
    }

    async fn rollback(&self) {
        if !self.channel.is_open() {
            debug!(tag = self.tag, "channel closed, skipping nack");
            return;
        }
        if let Err(err) = self.channel.nack(self.tag, true).await {
            error!(error = err.to_string(), tag = self.tag, "failure to nack on rollback");
        }
    }

    async fn in_doubt(&self) {
        debug!(tag = self.tag, "transaction in doubt");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::MockAmqpChannel, transaction::TransactionOutcome};
    use mockall::predicate::eq;

    #[tokio::test]
    async fn test_rollback_nacks_once_and_never_acks() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_is_open().return_const(true);
        mock.expect_ack().times(0);
        mock.expect_nack()
            .with(eq(7), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let strategy = AmbientTransactionAck::new(Arc::new(mock));
        let tx = Transaction::new();

        tx.scope(strategy.accept(7)).await.unwrap();
        assert_eq!(tx.rollback().await, Ok(TransactionOutcome::RolledBack));
    }

    #[tokio::test]
    async fn test_commit_acks_once_and_never_nacks() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_is_open().return_const(true);
        mock.expect_nack().times(0);
        mock.expect_ack().with(eq(7)).times(1).returning(|_| Ok(()));

        let strategy = AmbientTransactionAck::new(Arc::new(mock));
        let tx = Transaction::new();

        tx.scope(strategy.accept(7)).await.unwrap();
        assert_eq!(tx.commit().await, Ok(TransactionOutcome::Committed));
    }

    #[tokio::test]
    async fn test_commit_skips_ack_on_closed_channel() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_is_open().return_const(false);
        mock.expect_ack().times(0);
        mock.expect_nack().times(0);

        let strategy = AmbientTransactionAck::new(Arc::new(mock));
        let tx = Transaction::new();

        tx.scope(strategy.accept(3)).await.unwrap();
        assert_eq!(tx.commit().await, Ok(TransactionOutcome::Committed));
    }

    #[tokio::test]
    async fn test_in_doubt_settles_nothing() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_is_open().return_const(true);
        mock.expect_ack().times(0);
        mock.expect_nack().times(0);

        let strategy = AmbientTransactionAck::new(Arc::new(mock));
        let tx = Transaction::new();

        tx.scope(strategy.accept(3)).await.unwrap();
        assert_eq!(tx.in_doubt().await, Ok(TransactionOutcome::InDoubt));
    }

    #[tokio::test]
    async fn test_ambient_accept_without_transaction_acks_immediately() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_ack().with(eq(11)).times(1).returning(|_| Ok(()));

        let strategy = AmbientTransactionAck::new(Arc::new(mock));
        assert_eq!(strategy.accept(11).await, Ok(()));
    }

    #[tokio::test]
    async fn test_transactional_acks_and_requeues() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_ack().with(eq(1)).times(1).returning(|_| Ok(()));
        mock.expect_nack()
            .with(eq(2), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let strategy = strategy_for(AckMode::Transactional, Arc::new(mock));
        assert!(!strategy.settles_on_delivery());
        strategy.accept(1).await.unwrap();
        strategy.reject(2).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_ack_never_touches_the_channel() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_ack().times(0);
        mock.expect_nack().times(0);

        let strategy = strategy_for(AckMode::NoAck, Arc::new(mock));
        assert!(strategy.settles_on_delivery());
        strategy.accept(1).await.unwrap();
        strategy.reject(1).await.unwrap();
    }

    #[test]
    fn test_ack_mode_names() {
        let modes: Vec<AckMode> =
            serde_json::from_str(r#"["no-ack", "transactional", "ambient-transaction"]"#).unwrap();
        assert_eq!(
            modes,
            vec![
                AckMode::NoAck,
                AckMode::Transactional,
                AckMode::AmbientTransaction
            ]
        );
    }
}
