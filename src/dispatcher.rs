// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Dispatcher
//!
//! `consume_events` subscribes a handler to the primary queue of a route and
//! keeps it subscribed: it declares the route topology, applies the prefetch
//! limit, settles each delivery through the consumer lifecycle, and when the
//! delivery stream dies with the client still open it reconnects (replaying
//! topology) and subscribes again.
//!
//! At most `prefetch` deliveries are processed at the same time; with the
//! default of 1 the handler sees one message at a time.

use crate::{
    client::{AmqpClient, ClientState},
    consumer::consume,
    errors::AmqpError,
    handler::EventHandler,
    otel,
    topology::EventRoute,
};
use futures_util::StreamExt;
use opentelemetry::global;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Consumes `route` with `handler` until the client is closed.
///
/// Fails fast on connection, topology and subscription errors; per-message
/// failures are settled on the delivery and never stop the loop.
pub async fn consume_events<T, H>(
    client: &Arc<AmqpClient>,
    route: &EventRoute,
    handler: H,
) -> Result<(), AmqpError>
where
    T: DeserializeOwned + Send + 'static,
    H: EventHandler<T>,
{
    client.initialize().await?;
    client.declare_topology(&route.topology()).await?;

    let tracer = global::tracer("amqp consumer");
    // a zero prefetch would lift the broker side limit entirely
    let prefetch = route.prefetch.max(1);
    let limit = usize::from(prefetch);

    loop {
        let channel = match client.channel() {
            Ok(channel) => channel,
            Err(AmqpError::ClientClosed) => return Ok(()),
            Err(err) => return Err(err),
        };

        channel.basic_qos(prefetch).await?;

        let consumer_tag = format!("{}-{}", route.queue, Uuid::new_v4());
        let stream = channel.basic_consume(&route.queue, &consumer_tag).await?;
        info!(queue = route.queue.as_str(), consumer_tag, "consuming");

        let handler = &handler;
        let tracer = &tracer;
        let current = channel.as_ref();

        stream
            .for_each_concurrent(limit, move |result| async move {
                let delivery = match result {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        error!(error = err.to_string(), "errors consume msg");
                        return;
                    }
                };

                let (_ctx, mut span) = otel::new_span(&delivery.properties, tracer, &route.queue);
                match consume::<T, H>(current, route, &delivery, handler, &mut span).await {
                    Ok(outcome) => debug!(?outcome, "delivery settled"),
                    Err(err) => error!(error = err.to_string(), "error consume msg"),
                }
            })
            .await;

        if client.state() == ClientState::Closed {
            debug!(queue = route.queue.as_str(), "client closed, consumer stopped");
            return Ok(());
        }

        warn!(queue = route.queue.as_str(), "delivery stream ended, reconnecting");
        match client.reconnect(&channel).await {
            Ok(()) => continue,
            Err(AmqpError::ClientClosed) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}
