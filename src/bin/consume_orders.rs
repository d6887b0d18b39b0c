// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Consumes order events until interrupted.

use rabbitmq_retry::{
    client::AmqpClient,
    configs::RabbitMQConfigs,
    errors::HandlerError,
    logging,
    orders::{validate, OrderConsumer, OrderEvent},
    topology::EventRoute,
};
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cfg = match RabbitMQConfigs::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&cfg.log_level);

    let client = AmqpClient::from_configs(&cfg);
    let consumer = OrderConsumer::new(client.clone(), EventRoute::from_configs(&cfg));
    info!(queue = consumer.queue_name(), "waiting for order events");

    let handler = |event: OrderEvent| async move {
        validate(&event)?;
        info!(order_id = event.order_id.as_str(), total = event.total, "order processed");
        Ok::<(), HandlerError>(())
    };

    let result = tokio::select! {
        result = consumer.consume(handler) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            client.close().await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = err.to_string(), "consumer stopped");
            ExitCode::FAILURE
        }
    }
}
