// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Blocking Delivery Queue
//!
//! A thread-safe FIFO used to hand deliveries from the transport receive
//! callback to whoever consumes them: an application thread doing manual
//! receives, or the dispatch loop running on the tokio runtime.
//!
//! Both kinds of waiter are supported. Blocking waiters park on a condition
//! variable, async waiters on a `tokio::sync::Notify`; every state change
//! signals both.

use crate::{envelope::DeliveryTag, envelope::Envelope, errors::BusError};
use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::Notify;

/// A delivery waiting to be dispatched.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedDelivery {
    pub tag: DeliveryTag,
    pub envelope: Envelope,
    pub redelivered: bool,
}

impl QueuedDelivery {
    pub fn new(tag: DeliveryTag, envelope: Envelope, redelivered: bool) -> Self {
        QueuedDelivery {
            tag,
            envelope,
            redelivered,
        }
    }
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// FIFO queue with an open/closed lifecycle.
///
/// Once closed, `enqueue` fails and waiters are released. Items already queued
/// can still be drained; dequeueing only fails once the queue is closed *and*
/// empty.
pub struct DeliveryQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
    notify: Notify,
}

impl<T> Default for DeliveryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeliveryQueue<T> {
    pub fn new() -> Self {
        DeliveryQueue {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends an item and wakes one waiter.
    pub fn enqueue(&self, item: T) -> Result<(), BusError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(BusError::QueueClosed);
            }
            state.items.push_back(item);
        }

        self.available.notify_one();
        self.notify.notify_one();
        Ok(())
    }

    /// Blocks the calling thread until an item is available.
    ///
    /// Must not be called from inside an async task; use [`Self::dequeue_async`].
    pub fn dequeue(&self) -> Result<T, BusError> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            if state.closed {
                return Err(BusError::QueueClosed);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Blocks for at most `timeout`. `Ok(None)` means nothing arrived in time.
    pub fn try_dequeue(&self, timeout: Duration) -> Result<Option<T>, BusError> {
        let state = self.lock();
        let (mut state, _) = self
            .available
            .wait_timeout_while(state, timeout, |s| s.items.is_empty() && !s.closed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match state.items.pop_front() {
            Some(item) => Ok(Some(item)),
            None if state.closed => Err(BusError::QueueClosed),
            None => Ok(None),
        }
    }

    /// Waits until an item is present without removing it.
    ///
    /// Returns false on timeout or when the queue is closed and empty.
    pub fn wait_for_any(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .available
            .wait_timeout_while(state, timeout, |s| s.items.is_empty() && !s.closed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let found = !state.items.is_empty();
        drop(state);

        // the probe consumed a wakeup meant for a real consumer
        if found {
            self.available.notify_one();
        }
        found
    }

    /// Async counterpart of [`Self::dequeue`].
    pub async fn dequeue_async(&self) -> Result<T, BusError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    return Ok(item);
                }
                if state.closed {
                    return Err(BusError::QueueClosed);
                }
            }

            notified.await;
        }
    }

    /// Async counterpart of [`Self::try_dequeue`].
    pub async fn try_dequeue_async(&self, timeout: Duration) -> Result<Option<T>, BusError> {
        match tokio::time::timeout(timeout, self.dequeue_async()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Marks the queue closed and releases every waiter. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }

        self.available.notify_all();
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Instant};

    #[test]
    fn test_items_come_out_in_enqueue_order() {
        let queue = DeliveryQueue::new();
        for i in 0..5 {
            queue.enqueue(i).unwrap();
        }

        let drained: Vec<i32> = (0..5).map(|_| queue.dequeue().unwrap()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_multi_producer_items_are_each_delivered_once() {
        let queue = Arc::new(DeliveryQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        queue.enqueue((p, i)).unwrap();
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        queue.close();

        let mut seen = Vec::new();
        while let Ok(item) = queue.dequeue() {
            seen.push(item);
        }

        assert_eq!(seen.len(), 400);
        // per-producer order survives interleaving
        for p in 0..4 {
            let mine: Vec<i32> = seen.iter().filter(|(q, _)| *q == p).map(|(_, i)| *i).collect();
            assert_eq!(mine, (0..100).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_close_wakes_blocked_dequeue() {
        let queue: Arc<DeliveryQueue<u8>> = Arc::new(DeliveryQueue::new());
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.dequeue())
        };

        thread::sleep(Duration::from_millis(50));
        queue.close();

        assert_eq!(waiter.join().unwrap(), Err(BusError::QueueClosed));
    }

    #[test]
    fn test_enqueue_after_close_fails() {
        let queue = DeliveryQueue::new();
        queue.close();
        queue.close();

        assert_eq!(queue.enqueue(1), Err(BusError::QueueClosed));
        assert!(queue.is_closed());
    }

    #[test]
    fn test_closed_queue_still_drains_pending_items() {
        let queue = DeliveryQueue::new();
        queue.enqueue("a").unwrap();
        queue.close();

        assert_eq!(queue.dequeue(), Ok("a"));
        assert_eq!(queue.dequeue(), Err(BusError::QueueClosed));
    }

    #[test]
    fn test_try_dequeue_times_out_without_error() {
        let queue: DeliveryQueue<u8> = DeliveryQueue::new();
        let started = Instant::now();

        assert_eq!(queue.try_dequeue(Duration::from_millis(30)), Ok(None));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_try_dequeue_on_closed_empty_queue_fails_immediately() {
        let queue: DeliveryQueue<u8> = DeliveryQueue::new();
        queue.close();
        let started = Instant::now();

        assert_eq!(
            queue.try_dequeue(Duration::from_secs(5)),
            Err(BusError::QueueClosed)
        );
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_for_any_does_not_consume() {
        let queue = DeliveryQueue::new();
        assert!(!queue.wait_for_any(Duration::from_millis(10)));

        queue.enqueue(7).unwrap();
        assert!(queue.wait_for_any(Duration::from_millis(10)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue(), Ok(7));
    }

    #[tokio::test]
    async fn test_async_dequeue_is_woken_by_enqueue() {
        let queue = Arc::new(DeliveryQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue_async().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(42).unwrap();

        assert_eq!(waiter.await.unwrap(), Ok(42));
    }

    #[tokio::test]
    async fn test_async_dequeue_is_released_by_close() {
        let queue: Arc<DeliveryQueue<u8>> = Arc::new(DeliveryQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue_async().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        assert_eq!(waiter.await.unwrap(), Err(BusError::QueueClosed));
    }

    #[tokio::test]
    async fn test_try_dequeue_async_timeout() {
        let queue: DeliveryQueue<u8> = DeliveryQueue::new();
        assert_eq!(queue.try_dequeue_async(Duration::from_millis(10)).await, Ok(None));
    }
}
