// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Retry Layer
//!
//! `AmqpError` covers everything that can go wrong while talking to the broker:
//! connecting, declaring topology, publishing and resolving deliveries.
//! Connection and topology errors are fatal to the caller; per-message errors
//! are contained to the delivery they belong to.
//!
//! `HandlerError` is what an event handler reports back to the consumer. Any
//! variant causes the delivery to go down the retry path.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The client was used before `initialize` completed
    #[error("client is not ready, initialize it first")]
    NotReady,

    /// The client was explicitly closed
    #[error("client was closed")]
    ClientClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// An entity was re-declared with arguments that differ from the existing one
    #[error("topology conflict on `{0}`")]
    TopologyConflict(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer on `{0}`")]
    ConsumerDeclarationError(String),

    /// Error receiving a message from the consumer stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker refused a message under publisher confirms
    #[error("broker nacked publish to `{0}`")]
    PublishNacked(String),

    /// Error serializing an outgoing payload
    #[error("failure to serialize payload: {0}")]
    SerializationError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error publishing a message to the parking queue
    #[error("failure to publish to parking queue `{0}`")]
    PublishingToParkingError(String),
}

/// Failure reported for a single delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The payload was not valid JSON for the expected event type
    #[error("failure to deserialize payload: {0}")]
    Deserialize(String),

    /// The handler did not finish within the processing deadline
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    /// Business logic failure
    #[error("{0}")]
    Failed(String),

    /// The event can never be processed; it is parked without further retries
    #[error("invalid event: {0}")]
    Invalid(String),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        HandlerError::Invalid(reason.into())
    }

    /// Whether retrying the same event can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Invalid(_))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Deserialize(err.to_string())
    }
}
