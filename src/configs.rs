// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Connection parameters, topology names and retry tuning are read from an
//! optional `config/rabbitmq` file and then from `RABBITMQ_*` environment
//! variables (a `.env` file is honoured). Every field has a default, so an
//! empty environment yields a client pointing at a local broker.

use crate::{exchange::ExchangeKind, topology::RetryMode};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Prefix of the environment variables read by [`RabbitMQConfigs::load`].
pub const ENV_PREFIX: &str = "RABBITMQ";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub app_name: String,
    /// Full connection URL; takes precedence over host/port/credentials.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,

    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub queue: String,
    pub routing_key: String,

    pub delay_ttl_ms: u32,
    pub max_retries: u32,
    pub retry_mode: RetryMode,
    pub prefetch: u16,
    pub handler_timeout_ms: u64,

    pub publisher_confirms: bool,
    pub reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,

    pub log_level: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            app_name: "rabbitmq-retry".to_owned(),
            url: None,
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            exchange: "orders".to_owned(),
            exchange_kind: ExchangeKind::Topic,
            queue: "order.created".to_owned(),
            routing_key: "order.created".to_owned(),
            delay_ttl_ms: 5000,
            max_retries: 3,
            retry_mode: RetryMode::Republish,
            prefetch: 1,
            handler_timeout_ms: 30_000,
            publisher_confirms: true,
            reconnect_attempts: 5,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 10_000,
            log_level: "info".to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// Loads configs from `config/rabbitmq.*` and `RABBITMQ_*` variables.
    pub fn load() -> Result<RabbitMQConfigs, ConfigError> {
        dotenvy::dotenv().ok();

        Config::builder()
            .add_source(File::with_name("config/rabbitmq").required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// AMQP URI of the broker.
    pub fn uri(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "amqp://{}:{}@{}:{}/{}",
                self.user, self.password, self.host, self.port, self.vhost
            ),
        }
    }

    pub fn delay_ttl(&self) -> Duration {
        Duration::from_millis(self.delay_ttl_ms as u64)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}
