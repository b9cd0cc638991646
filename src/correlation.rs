// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Correlation Table
//!
//! Tracks outstanding requests by correlation id. Each pending request ends in
//! exactly one terminal state:
//!
//! ```text
//! Pending -> Completed | Faulted | TimedOut | Cancelled
//! ```
//!
//! The transition is a compare-and-set on the entry state, so a reply racing
//! the timeout watcher (or a cancellation) resolves the waiter only once.
//! Late and duplicate replies are ignored.

use crate::{
    envelope::{Contract, Envelope},
    errors::BusError,
    serializer::Serializers,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{oneshot, Notify},
    time::{sleep_until, Instant},
};
use tracing::{debug, warn};

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const FAULTED: u8 = 2;
const TIMED_OUT: u8 = 3;
const CANCELLED: u8 = 4;

/// Deadline used when the timeout does not fit an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

type Sink = Box<dyn FnOnce(Result<Envelope, BusError>) + Send>;

struct Entry {
    state: AtomicU8,
    deadline: Instant,
    sink: Mutex<Option<Sink>>,
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

/// Outstanding requests of one RPC client.
///
/// Must be created inside a Tokio runtime: it spawns the task that expires
/// requests whose deadline elapsed.
pub struct CorrelationTable {
    pending: Mutex<HashMap<String, Arc<Entry>>>,
    serializers: Arc<Serializers>,
    wake: Arc<Notify>,
}

impl CorrelationTable {
    pub fn new(serializers: Arc<Serializers>) -> Arc<CorrelationTable> {
        let wake = Arc::new(Notify::new());
        let table = Arc::new(CorrelationTable {
            pending: Mutex::new(HashMap::new()),
            serializers,
            wake: wake.clone(),
        });

        tokio::spawn(watch(Arc::downgrade(&table), wake));
        table
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Entry>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a request whose reply is awaited through the returned handle.
    pub fn register<T: Contract>(
        &self,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<ReplyHandle<T>, BusError> {
        let (tx, rx) = oneshot::channel();
        self.register_callback::<T, _>(correlation_id, timeout, move |outcome| {
            let _ = tx.send(outcome);
        })?;

        Ok(ReplyHandle {
            correlation_id: correlation_id.to_owned(),
            rx,
        })
    }

    /// Registers a request whose outcome is handed to `callback`.
    ///
    /// The callback runs on whichever task resolves the request and must not
    /// block.
    pub fn register_callback<T, F>(
        &self,
        correlation_id: &str,
        timeout: Duration,
        callback: F,
    ) -> Result<(), BusError>
    where
        T: Contract,
        F: FnOnce(Result<T, BusError>) + Send + 'static,
    {
        let serializers = self.serializers.clone();
        let sink: Sink = Box::new(move |outcome: Result<Envelope, BusError>| {
            callback(outcome.and_then(|env| serializers.decode::<T>(&env)));
        });

        {
            let mut pending = self.lock();
            if pending.contains_key(correlation_id) {
                return Err(BusError::DuplicateCorrelationId(correlation_id.to_owned()));
            }
            pending.insert(
                correlation_id.to_owned(),
                Arc::new(Entry {
                    state: AtomicU8::new(PENDING),
                    deadline: deadline_after(timeout),
                    sink: Mutex::new(Some(sink)),
                }),
            );
        }

        self.wake.notify_one();
        Ok(())
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.lock().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Resolves a pending request with its reply. A reply carrying an
    /// `exception` header faults the request.
    pub fn complete(&self, correlation_id: &str, reply: Envelope) -> Result<(), BusError> {
        match reply.exception().map(str::to_owned) {
            Some(fault) => self.resolve(correlation_id, FAULTED, Err(BusError::Handler(fault))),
            None => self.resolve(correlation_id, COMPLETED, Ok(reply)),
        }
    }

    /// The broker returned the request as unroutable.
    pub fn handle_returned(
        &self,
        correlation_id: &str,
        code: u16,
        text: &str,
    ) -> Result<(), BusError> {
        self.resolve(
            correlation_id,
            FAULTED,
            Err(BusError::MessageUndeliverable {
                code,
                text: text.to_owned(),
            }),
        )
    }

    pub fn cancel(&self, correlation_id: &str) -> Result<(), BusError> {
        self.resolve(
            correlation_id,
            CANCELLED,
            Err(BusError::RequestCancelled(correlation_id.to_owned())),
        )
    }

    fn resolve(
        &self,
        correlation_id: &str,
        target: u8,
        outcome: Result<Envelope, BusError>,
    ) -> Result<(), BusError> {
        let entry = self.lock().get(correlation_id).cloned();
        let Some(entry) = entry else {
            debug!(correlation_id, "no pending request, ignoring");
            return Err(BusError::UnknownCorrelationId(correlation_id.to_owned()));
        };

        if entry
            .state
            .compare_exchange(PENDING, target, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(correlation_id, "request already resolved, ignoring");
            return Err(BusError::UnknownCorrelationId(correlation_id.to_owned()));
        }

        self.lock().remove(correlation_id);

        let sink = entry
            .sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sink) = sink {
            sink(outcome);
        }
        Ok(())
    }

    /// Times out every request whose deadline passed and returns the nearest
    /// remaining deadline.
    fn expire(&self, now: Instant) -> Option<Instant> {
        let mut due = vec![];
        let mut next: Option<Instant> = None;

        for (id, entry) in self.lock().iter() {
            if entry.deadline <= now {
                due.push(id.clone());
            } else {
                next = Some(next.map_or(entry.deadline, |n| n.min(entry.deadline)));
            }
        }

        for id in due {
            warn!(correlation_id = id, "request timed out");
            let _ = self.resolve(&id, TIMED_OUT, Err(BusError::ReplyTimeout(id.clone())));
        }

        next
    }
}

impl Drop for CorrelationTable {
    fn drop(&mut self) {
        self.wake.notify_one();
    }
}

async fn watch(table: Weak<CorrelationTable>, wake: Arc<Notify>) {
    loop {
        let next = match table.upgrade() {
            Some(table) => table.expire(Instant::now()),
            None => return,
        };

        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = sleep_until(deadline) => {}
                }
            }
            None => wake.notified().await,
        }
    }
}

/// Wait handle for one pending request.
#[derive(Debug)]
pub struct ReplyHandle<T> {
    correlation_id: String,
    rx: oneshot::Receiver<Result<T, BusError>>,
}

impl<T> ReplyHandle<T> {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub async fn wait(self) -> Result<T, BusError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BusError::InternalError),
        }
    }

    /// Blocks the calling thread until the request resolves. Must not be
    /// called from an async context.
    pub fn wait_blocking(self) -> Result<T, BusError> {
        match self.rx.blocking_recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(BusError::InternalError),
        }
    }
}
