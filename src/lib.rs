// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Delayed-retry messaging on RabbitMQ.
//!
//! Events are published as persistent JSON and consumed with at-least-once
//! delivery. A failing delivery is sent through a TTL delay queue that
//! dead-letters back into the primary exchange, up to a bounded number of
//! retries, after which it is parked for an operator.

mod consumer;
mod otel;

pub mod channel;
pub mod client;
pub mod configs;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod logging;
pub mod orders;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use consumer::{
    Outcome, AMQP_HEADERS_COUNT, AMQP_HEADERS_LAST_ERROR, AMQP_HEADERS_RETRY_COUNT,
    AMQP_HEADERS_X_DEATH,
};
