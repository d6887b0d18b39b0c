// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Every publish goes to an exchange with a routing key; pushing straight to
//! a queue is the default exchange (`""`) with the queue name as key. With
//! `delay` set the message is sent to `<exchange>.delay` instead, where it
//! waits out the delay queue TTL before the broker routes it back to
//! `<exchange>`.
//!
//! Messages are persistent JSON. `publish` returns once the broker accepted
//! the message (publisher confirms when enabled on the connection), not when
//! a consumer processed it.

use crate::{
    client::AmqpClient,
    errors::AmqpError,
    handler::DomainEvent,
    otel,
    topology::{EventRoute, DELAY_SUFFIX},
};
use lapin::{
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode asking the broker to write the message to disk
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Application header values attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::Str(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
        }
    }
}

/// A serialized message and where it goes.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub msg_type: Option<String>,
    pub headers: BTreeMap<String, HeaderValue>,
    pub delay: bool,
}

impl PublishMessage {
    /// A message for `exchange`/`routing_key`, routed through the delay exchange.
    pub fn new(exchange: &str, routing_key: &str, payload: Vec<u8>) -> PublishMessage {
        PublishMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload,
            msg_type: None,
            headers: BTreeMap::new(),
            delay: true,
        }
    }

    /// A message pushed straight to `queue` through the default exchange.
    pub fn to_queue(queue: &str, payload: Vec<u8>) -> PublishMessage {
        PublishMessage::new("", queue, payload).immediate()
    }

    /// Serializes `payload` as JSON.
    pub fn json<T: Serialize>(
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<PublishMessage, AmqpError> {
        let payload = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializationError(err.to_string())
        })?;

        Ok(PublishMessage::new(exchange, routing_key, payload))
    }

    /// Sends to the primary exchange, skipping the delay queue.
    pub fn immediate(mut self) -> Self {
        self.delay = false;
        self
    }

    pub fn delay(mut self, delay: bool) -> Self {
        self.delay = delay;
        self
    }

    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    /// Exchange the message is actually sent to.
    pub fn destination(&self) -> String {
        if self.delay && !self.exchange.is_empty() {
            format!("{}{}", self.exchange, DELAY_SUFFIX)
        } else {
            self.exchange.clone()
        }
    }
}

/// Publishes messages over the channel of an [`AmqpClient`].
#[derive(Clone)]
pub struct AmqpPublisher {
    client: Arc<AmqpClient>,
}

impl AmqpPublisher {
    pub fn new(client: Arc<AmqpClient>) -> AmqpPublisher {
        AmqpPublisher { client }
    }

    /// Initializes the client if needed and hands the message to the broker.
    pub async fn publish(&self, msg: &PublishMessage) -> Result<(), AmqpError> {
        self.client.initialize().await?;
        let channel = self.client.channel()?;

        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject(&Context::current(), &mut headers);
        for (key, value) in &msg.headers {
            headers.insert(ShortString::from(key.as_str()), value.clone().into());
        }

        let destination = msg.destination();
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_timestamp(chrono::Utc::now().timestamp().max(0) as u64)
            .with_type(ShortString::from(msg.msg_type.clone().unwrap_or_default()))
            .with_headers(FieldTable::from(headers));

        channel
            .basic_publish(&destination, &msg.routing_key, &msg.payload, properties)
            .await?;

        debug!(
            exchange = destination,
            routing_key = msg.routing_key,
            "message published"
        );
        Ok(())
    }
}

/// Publishes `event` as JSON on `route`, through the delay exchange when `delay` is set.
pub async fn publish_event<T: DomainEvent>(
    client: &Arc<AmqpClient>,
    route: &EventRoute,
    event: &T,
    delay: bool,
) -> Result<(), AmqpError> {
    let msg = PublishMessage::json(&route.exchange, &route.routing_key, event)?
        .msg_type(T::message_type())
        .delay(delay);

    AmqpPublisher::new(client.clone()).publish(&msg).await
}
