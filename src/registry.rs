// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Registry
//!
//! Maps a [`ContractKey`] plus required headers to the call handlers that
//! should receive a delivery.
//!
//! Hierarchy registrations match subtypes of the registered contract. Rust has
//! no runtime type ancestry, so each message type declares its ancestors
//! through [`Contract::ancestors`] and the registry records them once, in an
//! ancestry table, when the type becomes known. Lookups then walk that table
//! instead of inspecting types per delivery.

use crate::{
    envelope::{Contract, ContractKey, FilterInfo, Header},
    handler::CallHandler,
};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Open,
    Closed,
}

struct Entry {
    filter: FilterInfo,
    handler: CallHandler,
    hierarchy: bool,
}

struct State {
    lifecycle: Lifecycle,
    entries: HashMap<ContractKey, Vec<Entry>>,
    ancestry: HashMap<ContractKey, Vec<ContractKey>>,
}

/// Handlers selected for one delivery.
#[derive(Debug, Default)]
pub struct Resolution {
    pub handlers: Vec<CallHandler>,
    /// Some registration matched the contract but its header filter did not.
    pub filtered_out: bool,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub struct SubscriptionRegistry {
    state: Mutex<State>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        SubscriptionRegistry {
            state: Mutex::new(State {
                lifecycle: Lifecycle::Created,
                entries: HashMap::new(),
                ancestry: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records the ancestors of `T` so hierarchy registrations can match it.
    pub fn register_type<T: Contract>(&self) {
        self.register_ancestry(T::contract_key(), T::ancestors());
    }

    /// Records the ancestors of a contract, nearest first.
    pub fn register_ancestry(&self, key: ContractKey, ancestors: Vec<ContractKey>) {
        if ancestors.is_empty() {
            return;
        }
        self.lock().ancestry.insert(key, ancestors);
    }

    /// Adds a handler for `filter`.
    ///
    /// Returns false when the registry has been closed, or when an identical
    /// contract/filter pair is already registered with the same hierarchy
    /// flag, which would otherwise dispatch the same message twice.
    pub fn register(&self, filter: FilterInfo, handler: CallHandler, hierarchy: bool) -> bool {
        let mut state = self.lock();
        if state.lifecycle == Lifecycle::Closed {
            debug!(contract = %filter.contract, "registration rejected, registry is closed");
            return false;
        }

        let entries = state.entries.entry(filter.contract.clone()).or_default();
        if entries
            .iter()
            .any(|e| e.hierarchy == hierarchy && e.filter.same_as(&filter))
        {
            debug!(contract = %filter.contract, "registration rejected, duplicate filter");
            return false;
        }

        entries.push(Entry {
            filter,
            handler,
            hierarchy,
        });
        true
    }

    /// Finds every handler for a delivery of contract `key` carrying `headers`.
    pub fn resolve(&self, key: &ContractKey, headers: &[Header]) -> Resolution {
        let state = self.lock();
        let mut resolution = Resolution::default();

        let ancestors = state.ancestry.get(key).map(Vec::as_slice).unwrap_or(&[]);
        let candidates =
            std::iter::once((key, true)).chain(ancestors.iter().map(|a| (a, false)));

        for (candidate, exact) in candidates {
            let Some(entries) = state.entries.get(candidate) else {
                continue;
            };

            for entry in entries.iter().filter(|e| exact || e.hierarchy) {
                if entry.filter.matches(headers) {
                    resolution.handlers.push(entry.handler.clone());
                } else {
                    resolution.filtered_out = true;
                }
            }
        }

        resolution
    }

    /// Moves the registry to the open state. Returns false once closed.
    pub fn open(&self) -> bool {
        let mut state = self.lock();
        match state.lifecycle {
            Lifecycle::Closed => false,
            _ => {
                state.lifecycle = Lifecycle::Open;
                true
            }
        }
    }

    pub fn close(&self) {
        self.lock().lifecycle = Lifecycle::Closed;
    }

    pub fn is_open(&self) -> bool {
        self.lock().lifecycle == Lifecycle::Open
    }

    pub fn is_closed(&self) -> bool {
        self.lock().lifecycle == Lifecycle::Closed
    }
}
