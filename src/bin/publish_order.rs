// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Publishes a single order event.

use clap::Parser;
use rabbitmq_retry::{
    client::AmqpClient,
    configs::RabbitMQConfigs,
    errors::HandlerError,
    logging,
    orders::{validate, OrderEvent, OrderPublisher},
    topology::EventRoute,
};
use std::process::ExitCode;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "publish-order", about = "Publish an order.created event")]
struct Args {
    /// Order id; a random UUID when omitted
    #[arg(long)]
    order_id: Option<String>,

    #[arg(long, default_value_t = 99.9)]
    total: f64,

    #[arg(long)]
    user_id: Option<String>,

    /// Route through the delay queue instead of delivering right away
    #[arg(long)]
    delay: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let cfg = match RabbitMQConfigs::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&cfg.log_level);

    let mut event = OrderEvent::new(
        &args.order_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        args.total,
    );
    if let Some(user_id) = &args.user_id {
        event = event.user_id(user_id);
    }
    if let Err(HandlerError::Invalid(reason)) = validate(&event) {
        error!(reason = reason.as_str(), "invalid order");
        return ExitCode::FAILURE;
    }

    let client = AmqpClient::from_configs(&cfg);
    let publisher = OrderPublisher::new(client.clone(), EventRoute::from_configs(&cfg));

    let result = match publisher.initialize().await {
        Ok(()) if args.delay => publisher.publish_delayed(event).await,
        Ok(()) => publisher.publish(event).await,
        Err(err) => Err(err),
    };
    client.close().await.ok();

    match result {
        Ok(event) => {
            info!(order_id = event.order_id.as_str(), timestamp = ?event.timestamp, "order published");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to publish order");
            ExitCode::FAILURE
        }
    }
}
