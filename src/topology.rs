// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! `AmqpTopology` collects exchanges, queues and bindings and installs them in
//! a fixed order: exchanges, then queues, then bindings, so a binding never
//! references an entity the broker has not seen yet. Declarations are
//! idempotent on the broker side; re-declaring with different arguments fails
//! with [`AmqpError::TopologyConflict`].
//!
//! `EventRoute` describes one event stream together with its delayed-retry
//! topology:
//!
//! ```text
//!   publish ──► E ──K──► Q ──► consumer ──ok──► ack
//!                        ▲         │
//!                        │       fail (attempt < max)
//!                        │         ▼
//!               (TTL, DLX=E) ◄── Q.delay ◄──K── E.delay
//!                                  │
//!                      fail (attempt = max) ──► Q.parking
//! ```

use crate::{
    channel::BrokerChannel,
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Suffix of the delay exchange and delay queue names.
pub const DELAY_SUFFIX: &str = ".delay";
/// Suffix of the parking queue name.
pub const PARKING_SUFFIX: &str = ".parking";

/// RabbitMQ topology: exchanges, queues and the bindings between them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.queues_binding
    }

    /// Declares exchanges, then queues, then bindings.
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        self.install_exchanges(channel).await?;
        self.install_queues(channel).await?;
        self.binding_queues(channel).await
    }

    async fn install_exchanges(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name());
            channel.exchange_declare(exch).await?;
            debug!("exchange: {} was created", exch.name());
        }

        Ok(())
    }

    async fn install_queues(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name());
            channel.queue_declare(def).await?;
            debug!("queue: {} was created", def.name());
        }

        Ok(())
    }

    async fn binding_queues(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name(),
                binding.exchange_name(),
                binding.key()
            );
            channel.queue_bind(binding).await?;
        }

        Ok(())
    }
}

/// How a failed delivery reaches the delay queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryMode {
    /// The consumer publishes a copy to the delay exchange with an
    /// incremented `x-retry-count` header, then rejects the original.
    #[default]
    Republish,
    /// The primary queue dead-letters into the delay exchange; the consumer
    /// only rejects.
    DeadLetter,
}

/// An event stream and its delayed-retry topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRoute {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub queue: String,
    pub routing_key: String,
    pub delay_ttl: Duration,
    pub max_retries: u32,
    pub retry_mode: RetryMode,
    pub prefetch: u16,
    pub handler_timeout: Duration,
}

impl EventRoute {
    /// A topic route with default retry tuning.
    pub fn new(exchange: &str, queue: &str, routing_key: &str) -> EventRoute {
        EventRoute {
            exchange: exchange.to_owned(),
            exchange_kind: ExchangeKind::Topic,
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
            delay_ttl: Duration::from_millis(5000),
            max_retries: 3,
            retry_mode: RetryMode::Republish,
            prefetch: 1,
            handler_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_configs(cfg: &RabbitMQConfigs) -> EventRoute {
        EventRoute {
            exchange: cfg.exchange.clone(),
            exchange_kind: cfg.exchange_kind.clone(),
            queue: cfg.queue.clone(),
            routing_key: cfg.routing_key.clone(),
            delay_ttl: cfg.delay_ttl(),
            max_retries: cfg.max_retries,
            retry_mode: cfg.retry_mode,
            prefetch: cfg.prefetch.max(1),
            handler_timeout: cfg.handler_timeout(),
        }
    }

    pub fn delay_ttl(mut self, ttl: Duration) -> Self {
        self.delay_ttl = ttl;
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn retry_mode(mut self, mode: RetryMode) -> Self {
        self.retry_mode = mode;
        self
    }

    /// Unacked deliveries allowed in flight; at least one.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = kind;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn delay_exchange(&self) -> String {
        format!("{}{}", self.exchange, DELAY_SUFFIX)
    }

    pub fn delay_queue(&self) -> String {
        format!("{}{}", self.queue, DELAY_SUFFIX)
    }

    pub fn parking_queue(&self) -> String {
        format!("{}{}", self.queue, PARKING_SUFFIX)
    }

    /// Expands the route into its exchanges, queues and bindings.
    pub fn topology(&self) -> AmqpTopology {
        let delay_exchange = self.delay_exchange();
        let delay_queue = self.delay_queue();
        let ttl = u32::try_from(self.delay_ttl.as_millis()).unwrap_or(u32::MAX);

        let mut primary = QueueDefinition::new(&self.queue).durable();
        if self.retry_mode == RetryMode::DeadLetter {
            primary = primary.dead_letter(&delay_exchange, &self.routing_key);
        }

        AmqpTopology::new()
            .exchange(
                ExchangeDefinition::new(&self.exchange)
                    .kind(self.exchange_kind.clone())
                    .durable(),
            )
            .exchange(ExchangeDefinition::new(&delay_exchange).direct().durable())
            .queue(primary)
            .queue(
                QueueDefinition::new(&delay_queue)
                    .durable()
                    .ttl(ttl)
                    .dead_letter(&self.exchange, &self.routing_key),
            )
            .queue(QueueDefinition::new(&self.parking_queue()).durable())
            .queue_binding(
                QueueBinding::new(&self.queue)
                    .exchange(&self.exchange)
                    .routing_key(&self.routing_key),
            )
            .queue_binding(
                QueueBinding::new(&delay_queue)
                    .exchange(&delay_exchange)
                    .routing_key(&self.routing_key),
            )
    }
}
