// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Order Events
//!
//! The order payload and its publisher/consumer pair. Publishing fills in a
//! missing timestamp; consuming logs the key fields of each order before the
//! business handler runs.

use crate::{
    client::AmqpClient,
    dispatcher::consume_events,
    errors::{AmqpError, HandlerError},
    handler::{inspect, DomainEvent, EventHandler},
    publisher::publish_event,
    topology::EventRoute,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Queue order creation events are consumed from.
pub const ORDER_CREATED_QUEUE: &str = "order.created";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub order_id: String,
    pub total: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Set at publish time when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl OrderEvent {
    pub fn new(order_id: &str, total: f64) -> OrderEvent {
        OrderEvent {
            order_id: order_id.to_owned(),
            total,
            user_id: None,
            timestamp: None,
        }
    }

    pub fn user_id(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_owned());
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// The event with `timestamp` defaulted to now.
    pub fn stamped(self) -> OrderEvent {
        OrderEvent {
            timestamp: self.timestamp.or_else(|| Some(Utc::now())),
            ..self
        }
    }
}

impl DomainEvent for OrderEvent {
    fn queue_name() -> &'static str {
        ORDER_CREATED_QUEUE
    }
}

/// Publishes order events as first attempts on the primary exchange.
#[derive(Clone)]
pub struct OrderPublisher {
    client: Arc<AmqpClient>,
    route: EventRoute,
}

impl OrderPublisher {
    pub fn new(client: Arc<AmqpClient>, route: EventRoute) -> OrderPublisher {
        OrderPublisher { client, route }
    }

    /// Connects and declares the order topology.
    pub async fn initialize(&self) -> Result<(), AmqpError> {
        self.client.initialize().await?;
        self.client.declare_topology(&self.route.topology()).await
    }

    /// Publishes `event`, returning it as sent (timestamp filled in).
    pub async fn publish(&self, event: OrderEvent) -> Result<OrderEvent, AmqpError> {
        self.send(event, false).await
    }

    /// Like [`OrderPublisher::publish`], but the first delivery waits out the delay TTL.
    pub async fn publish_delayed(&self, event: OrderEvent) -> Result<OrderEvent, AmqpError> {
        self.send(event, true).await
    }

    async fn send(&self, event: OrderEvent, delay: bool) -> Result<OrderEvent, AmqpError> {
        let event = event.stamped();
        publish_event(&self.client, &self.route, &event, delay).await?;
        Ok(event)
    }
}

/// Runs an order handler with structured logging in front of it.
pub struct OrderConsumer {
    client: Arc<AmqpClient>,
    route: EventRoute,
}

impl OrderConsumer {
    pub fn new(client: Arc<AmqpClient>, route: EventRoute) -> OrderConsumer {
        OrderConsumer { client, route }
    }

    pub fn queue_name(&self) -> &str {
        self.route.queue_name()
    }

    /// Consumes until the client is closed.
    pub async fn consume<H>(&self, handler: H) -> Result<(), AmqpError>
    where
        H: EventHandler<OrderEvent>,
    {
        consume_events(&self.client, &self.route, logged(handler)).await
    }
}

/// Logs `{order_id, total, user_id, timestamp}` for each order before `handler` runs.
pub fn logged<H>(handler: H) -> impl EventHandler<OrderEvent>
where
    H: EventHandler<OrderEvent>,
{
    inspect(handler, |event: &OrderEvent| {
        info!(
            order_id = event.order_id.as_str(),
            total = event.total,
            user_id = event.user_id.as_deref(),
            timestamp = ?event.timestamp,
            "received order event"
        );
    })
}

/// Rejects orders without an id or a positive total. These failures are permanent.
pub fn validate(event: &OrderEvent) -> Result<(), HandlerError> {
    if event.order_id.is_empty() {
        return Err(HandlerError::invalid("orderId is required"));
    }
    if !(event.total > 0.0) {
        return Err(HandlerError::invalid("total is required"));
    }
    Ok(())
}
