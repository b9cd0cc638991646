// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Adapters
//!
//! Moves lapin deliveries into a [`DeliveryQueue`]. The push adapter pumps a
//! `basic.consume` stream on its own task; the pull adapter polls
//! `basic.get` for manual receives.

use crate::{
    channel::{AmqpChannel, LapinChannel},
    delivery_queue::{DeliveryQueue, QueuedDelivery},
    errors::BusError,
    properties::decode_delivery,
    queue::QueueDefinition,
};
use futures_util::{Stream, StreamExt};
use std::{fmt::Display, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, error, warn};

const GET_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Declares the queue, applies its prefetch and starts a push consumer
/// feeding `queue`.
///
/// `settled` means the consumer runs in no-ack mode, so deliveries that can
/// no longer be queued are not handed back to the broker.
pub async fn start_consumer(
    channel: &LapinChannel,
    def: &QueueDefinition,
    queue: Arc<DeliveryQueue<QueuedDelivery>>,
    acker: Arc<dyn AmqpChannel>,
    settled: bool,
) -> Result<JoinHandle<usize>, BusError> {
    if def.prefetch_count() > 0 {
        channel.qos(def.prefetch_count()).await?;
    }
    let name = channel.declare_queue(def).await?;
    let consumer = channel.consume(&name, "", settled).await?;

    debug!(queue = name, "consumer started");
    let deliveries = consumer.map(|result| result.map(|delivery| decode_delivery(&delivery)));
    Ok(tokio::spawn(pump(deliveries, queue, acker, settled)))
}

/// Enqueues every delivery of the stream until it ends or the queue closes.
/// Returns how many deliveries were queued.
///
/// Stream errors are logged and skipped. The delivery that hits a closed
/// queue is nacked with requeue, unless it was already settled.
pub(crate) async fn pump<S, E>(
    mut deliveries: S,
    queue: Arc<DeliveryQueue<QueuedDelivery>>,
    acker: Arc<dyn AmqpChannel>,
    settled: bool,
) -> usize
where
    S: Stream<Item = Result<QueuedDelivery, E>> + Unpin,
    E: Display,
{
    let mut queued = 0;

    while let Some(result) = deliveries.next().await {
        let delivery = match result {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(error = err.to_string(), "errors consume msg");
                continue;
            }
        };

        let tag = delivery.tag;
        match queue.enqueue(delivery) {
            Ok(()) => queued += 1,
            Err(_) => {
                warn!(tag, "delivery queue closed, stopping consumer");
                if !settled {
                    if let Err(err) = acker.nack(tag, true).await {
                        error!(error = err.to_string(), tag, "error whiling requeuing");
                    }
                }
                break;
            }
        }
    }

    queued
}

/// Pulls one delivery with `basic.get`, polling until `timeout` elapses.
pub async fn receive(
    channel: &LapinChannel,
    queue: &str,
    no_ack: bool,
    timeout: Duration,
) -> Result<Option<QueuedDelivery>, BusError> {
    let start = Instant::now();

    loop {
        if let Some(delivery) = channel.get(queue, no_ack).await? {
            return Ok(Some(decode_delivery(&delivery)));
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Ok(None);
        }
        tokio::time::sleep(GET_POLL_INTERVAL.min(timeout - elapsed)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockAmqpChannel,
        envelope::{ContractKey, Envelope},
    };
    use futures_util::stream;
    use mockall::predicate::eq;

    fn delivery(tag: u64) -> Result<QueuedDelivery, BusError> {
        Ok(QueuedDelivery::new(
            tag,
            Envelope::new(ContractKey::new("Foo", "ns"), vec![]),
            false,
        ))
    }

    #[tokio::test]
    async fn test_pump_queues_in_order_and_skips_stream_errors() {
        let queue = Arc::new(DeliveryQueue::new());
        let deliveries = stream::iter(vec![
            delivery(1),
            Err(BusError::ChannelError),
            delivery(2),
            delivery(3),
        ]);

        let queued = pump(deliveries, queue.clone(), Arc::new(MockAmqpChannel::new()), false).await;

        assert_eq!(queued, 3);
        let tags: Vec<_> = (0..3).map(|_| queue.dequeue().unwrap().tag).collect();
        assert_eq!(tags, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_closed_queue_requeues_and_stops() {
        let queue = Arc::new(DeliveryQueue::new());
        queue.close();

        let mut mock = MockAmqpChannel::new();
        mock.expect_nack()
            .with(eq(1), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let deliveries = stream::iter(vec![delivery(1), delivery(2)]);
        let queued = pump(deliveries, queue, Arc::new(mock), false).await;

        assert_eq!(queued, 0);
    }

    #[tokio::test]
    async fn test_closed_queue_does_not_nack_settled_deliveries() {
        let queue = Arc::new(DeliveryQueue::new());
        queue.close();

        let mut mock = MockAmqpChannel::new();
        mock.expect_nack().times(0);

        let deliveries = stream::iter(vec![delivery(1)]);
        assert_eq!(pump(deliveries, queue, Arc::new(mock), true).await, 0);
    }
}
