// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Ambient Transactions
//!
//! A [`Transaction`] becomes ambient for the code running inside
//! [`Transaction::scope`]: anything executing there, including call handlers,
//! can look it up with [`Transaction::current`] and enlist a [`Participant`]
//! without a handle being passed around.
//!
//! Completion is two-phase. `commit` asks every participant to prepare; if all
//! vote [`Vote::Prepared`] they are committed, otherwise all are rolled back.
//! Each participant receives exactly one of commit, rollback or in-doubt, and
//! only once. Participants never choose the outcome themselves.

use crate::errors::BusError;
use async_trait::async_trait;
use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, warn};
use uuid::Uuid;

tokio::task_local! {
    static AMBIENT: Transaction;
}

/// A participant's answer to prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Prepared,
    ForceRollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
    InDoubt,
}

/// A resource manager taking part in a transaction.
#[async_trait]
pub trait Participant: Send + Sync {
    async fn prepare(&self) -> Vote;

    async fn commit(&self);

    async fn rollback(&self);

    async fn in_doubt(&self);
}

enum Status {
    Active,
    Completing,
    Done(TransactionOutcome),
}

struct Inner {
    id: String,
    status: Mutex<(Status, Vec<Arc<dyn Participant>>)>,
}

/// Handle to one transaction. Clones refer to the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Transaction {
            inner: Arc::new(Inner {
                id: Uuid::new_v4().to_string(),
                status: Mutex::new((Status::Active, Vec::new())),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The transaction ambient to the running task, if any.
    pub fn current() -> Option<Transaction> {
        AMBIENT.try_with(|tx| tx.clone()).ok()
    }

    /// Runs `fut` with this transaction ambient.
    pub async fn scope<F: Future>(&self, fut: F) -> F::Output {
        AMBIENT.scope(self.clone(), fut).await
    }

    fn lock(&self) -> MutexGuard<'_, (Status, Vec<Arc<dyn Participant>>)> {
        self.inner
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_active(&self) -> bool {
        matches!(self.lock().0, Status::Active)
    }

    pub fn outcome(&self) -> Option<TransactionOutcome> {
        match self.lock().0 {
            Status::Done(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Adds `participant` to the transaction.
    ///
    /// # Returns
    /// [`BusError::TransactionCompleted`] once completion has started
    pub fn enlist(&self, participant: Arc<dyn Participant>) -> Result<(), BusError> {
        let mut guard = self.lock();
        if !matches!(guard.0, Status::Active) {
            return Err(BusError::TransactionCompleted(self.inner.id.clone()));
        }
        guard.1.push(participant);
        Ok(())
    }

    /// Takes the participants if this caller is the one completing the
    /// transaction.
    fn begin_completion(&self) -> Result<Vec<Arc<dyn Participant>>, BusError> {
        let mut guard = self.lock();
        if !matches!(guard.0, Status::Active) {
            return Err(BusError::TransactionCompleted(self.inner.id.clone()));
        }
        guard.0 = Status::Completing;
        Ok(std::mem::take(&mut guard.1))
    }

    fn finish(&self, outcome: TransactionOutcome) -> TransactionOutcome {
        self.lock().0 = Status::Done(outcome);
        debug!(transaction = %self.inner.id, ?outcome, "transaction completed");
        outcome
    }

    /// Completes the transaction in two phases: every participant prepares,
    /// then all are committed, or all are rolled back if any of them voted
    /// [`Vote::ForceRollback`].
    ///
    /// # Returns
    /// The outcome the participants received, or
    /// [`BusError::TransactionCompleted`] if the transaction was already
    /// completed, in which case no participant is called
    pub async fn commit(&self) -> Result<TransactionOutcome, BusError> {
        let participants = self.begin_completion()?;

        let mut prepared = true;
        for participant in &participants {
            if participant.prepare().await == Vote::Prepared {
                continue;
            }
            warn!(transaction = %self.inner.id, "participant voted to roll back");
            prepared = false;
            break;
        }

        if !prepared {
            for participant in &participants {
                participant.rollback().await;
            }
            return Ok(self.finish(TransactionOutcome::RolledBack));
        }

        for participant in &participants {
            participant.commit().await;
        }
        Ok(self.finish(TransactionOutcome::Committed))
    }

    /// Rolls every participant back without preparing them.
    pub async fn rollback(&self) -> Result<TransactionOutcome, BusError> {
        let participants = self.begin_completion()?;
        for participant in &participants {
            participant.rollback().await;
        }
        Ok(self.finish(TransactionOutcome::RolledBack))
    }

    /// Used by a coordinator that lost track of the outcome.
    pub async fn in_doubt(&self) -> Result<TransactionOutcome, BusError> {
        let participants = self.begin_completion()?;
        for participant in &participants {
            participant.in_doubt().await;
        }
        Ok(self.finish(TransactionOutcome::InDoubt))
    }
}
