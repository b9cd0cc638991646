// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Bus
//!
//! Message-bus dispatch engine on top of lapin: deliveries are queued,
//! resolved against a per-subscription handler registry, dispatched to call
//! handlers and settled through an acknowledgment strategy. Request/reply is
//! built on a correlation table shared by the RPC client and the dispatch loop.

mod otel;

pub mod ack;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod correlation;
pub mod delivery_queue;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod handler;
pub mod properties;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod rpc;
pub mod serializer;
pub mod trace;
pub mod transaction;
