// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Trace Events
//!
//! The trace collaborator is notified of what happens to each message. It can
//! only observe: methods return nothing, so a misbehaving observer cannot fail
//! a dispatch.

use crate::{envelope::Envelope, errors::BusError};
use tracing::{debug, error, warn};

/// Observer of bus events. Every method defaults to a no-op.
pub trait BusTrace: Send + Sync {
    fn message_arrived(&self, _env: &Envelope) {}

    fn message_sent(&self, _env: &Envelope) {}

    fn deserialize_failure(&self, _env: &Envelope, _err: &BusError) {}

    fn dispatch_failure(&self, _env: &Envelope, _err: &BusError) {}

    /// A handler exists for the contract but its header filter did not match.
    fn filtered_out(&self, _env: &Envelope) {}

    /// No handler is registered for the contract at all.
    fn unregistered_message(&self, _env: &Envelope) {}
}

/// Reports bus events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBusTrace;

impl BusTrace for TracingBusTrace {
    fn message_arrived(&self, env: &Envelope) {
        debug!(
            contract = %env.contract,
            correlation_id = env.correlation_id.as_deref(),
            "message arrived"
        );
    }

    fn message_sent(&self, env: &Envelope) {
        debug!(
            contract = %env.contract,
            correlation_id = env.correlation_id.as_deref(),
            "message sent"
        );
    }

    fn deserialize_failure(&self, env: &Envelope, err: &BusError) {
        warn!(error = err.to_string(), contract = %env.contract, "failure to deserialize message");
    }

    fn dispatch_failure(&self, env: &Envelope, err: &BusError) {
        error!(error = err.to_string(), contract = %env.contract, "failure to dispatch message");
    }

    fn filtered_out(&self, env: &Envelope) {
        debug!(contract = %env.contract, "message filtered out");
    }

    fn unregistered_message(&self, env: &Envelope) {
        warn!(contract = %env.contract, "removing message from queue - reason: unsupported msg type");
    }
}
