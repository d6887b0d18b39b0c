// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Lifecycle
//!
//! Resolves one delivery: deserialize, run the handler under a deadline, then
//! either ack it, send it around the delay queue again, or park it once the
//! retry budget is spent. A malformed payload takes the same path as a
//! failing handler.

use crate::{
    channel::{BrokerChannel, Delivery},
    errors::{AmqpError, HandlerError},
    handler::EventHandler,
    publisher::PERSISTENT_DELIVERY_MODE,
    topology::{EventRoute, RetryMode},
};
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
};
use opentelemetry::trace::{Span, Status};
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use tracing::{debug, error, warn};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Number of retries a message already went through
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Reason of the last failure of a parked message
pub const AMQP_HEADERS_LAST_ERROR: &str = "x-last-error";

/// How a delivery was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    /// Sent to the delay queue; `attempt` is the retry number it now carries.
    Retried { attempt: u32 },
    /// Retry budget exhausted; moved to the parking queue.
    Parked,
}

/// Processes `delivery` with `handler` and settles it on `channel`.
pub(crate) async fn consume<T, H>(
    channel: &dyn BrokerChannel,
    route: &EventRoute,
    delivery: &Delivery,
    handler: &H,
    span: &mut impl Span,
) -> Result<Outcome, AmqpError>
where
    T: DeserializeOwned + Send + 'static,
    H: EventHandler<T> + ?Sized,
{
    debug!(
        delivery_tag = delivery.delivery_tag,
        exchange = delivery.exchange.as_str(),
        routing_key = delivery.routing_key.as_str(),
        "received message"
    );

    let result = match serde_json::from_slice::<T>(&delivery.data) {
        Ok(event) => match tokio::time::timeout(route.handler_timeout, handler.handle(event)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Timeout(route.handler_timeout)),
        },
        Err(err) => Err(HandlerError::from(err)),
    };

    let failure = match result {
        Ok(()) => {
            channel.basic_ack(delivery.delivery_tag).await.map_err(|err| {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                err
            })?;

            debug!("message successfully processed");
            span.set_status(Status::Ok);
            return Ok(Outcome::Acked);
        }
        Err(failure) => failure,
    };

    span.record_error(&failure);
    span.set_status(Status::Error {
        description: Cow::from(failure.to_string()),
    });

    let attempts = retry_count(&delivery.properties);
    if attempts < route.max_retries && !failure.is_permanent() {
        retry(channel, route, delivery, attempts + 1, &failure).await?;
        return Ok(Outcome::Retried {
            attempt: attempts + 1,
        });
    }

    error!(
        error = failure.to_string(),
        attempts,
        permanent = failure.is_permanent(),
        "giving up on message, sending to parking queue"
    );
    park(channel, route, delivery, attempts, &failure).await?;
    Ok(Outcome::Parked)
}

async fn retry(
    channel: &dyn BrokerChannel,
    route: &EventRoute,
    delivery: &Delivery,
    attempt: u32,
    failure: &HandlerError,
) -> Result<(), AmqpError> {
    warn!(
        error = failure.to_string(),
        attempt,
        max_retries = route.max_retries,
        "error whiling handling msg, retrying later"
    );

    if route.retry_mode == RetryMode::Republish {
        let properties = with_headers(
            &delivery.properties,
            [(
                AMQP_HEADERS_RETRY_COUNT,
                AMQPValue::LongLongInt(LongLongInt::from(attempt as i64)),
            )],
        );

        if let Err(err) = channel
            .basic_publish(
                &route.delay_exchange(),
                &route.routing_key,
                &delivery.data,
                properties,
            )
            .await
        {
            // the primary queue has no dead letter exchange here, so only a requeue keeps it
            error!(error = err.to_string(), "error whiling sending to delay queue");
            channel.basic_nack(delivery.delivery_tag, true).await.ok();
            return Err(err);
        }
    }

    // without requeue: republished above, or dead-lettered into the delay queue by the broker
    channel.basic_nack(delivery.delivery_tag, false).await
}

async fn park(
    channel: &dyn BrokerChannel,
    route: &EventRoute,
    delivery: &Delivery,
    attempts: u32,
    failure: &HandlerError,
) -> Result<(), AmqpError> {
    let parking_queue = route.parking_queue();
    let properties = with_headers(
        &delivery.properties,
        [
            (
                AMQP_HEADERS_RETRY_COUNT,
                AMQPValue::LongLongInt(LongLongInt::from(attempts as i64)),
            ),
            (
                AMQP_HEADERS_LAST_ERROR,
                AMQPValue::LongString(LongString::from(failure.to_string())),
            ),
        ],
    );

    if let Err(err) = channel
        .basic_publish("", &parking_queue, &delivery.data, properties)
        .await
    {
        error!(error = err.to_string(), "error whiling sending to parking queue");
        channel.basic_nack(delivery.delivery_tag, true).await.ok();
        return Err(AmqpError::PublishingToParkingError(parking_queue));
    }

    channel.basic_ack(delivery.delivery_tag).await
}

/// Copies `props` with `extra` merged into its headers.
fn with_headers<const N: usize>(
    props: &AMQPProperties,
    extra: [(&str, AMQPValue); N],
) -> AMQPProperties {
    let mut headers = props
        .headers()
        .as_ref()
        .map(|table| table.inner().clone())
        .unwrap_or_default();

    for (key, value) in extra {
        headers.insert(ShortString::from(key), value);
    }

    props
        .clone()
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_headers(FieldTable::from(headers))
}

/// Retries a message already went through: the larger of the `x-retry-count`
/// header and the highest `x-death` count.
pub(crate) fn retry_count(props: &AMQPProperties) -> u32 {
    let headers = match props.headers() {
        Some(val) => val.to_owned(),
        None => FieldTable::default(),
    };

    let explicit = headers
        .inner()
        .get(AMQP_HEADERS_RETRY_COUNT)
        .and_then(as_i64)
        .unwrap_or_default();

    let deaths = match headers.inner().get(AMQP_HEADERS_X_DEATH) {
        Some(value) => match value.as_array() {
            Some(arr) => arr
                .as_slice()
                .iter()
                .filter_map(|entry| entry.as_field_table())
                .filter_map(|table| table.inner().get(AMQP_HEADERS_COUNT).and_then(as_i64))
                .max()
                .unwrap_or_default(),
            _ => 0,
        },
        _ => 0,
    };

    u32::try_from(explicit.max(deaths)).unwrap_or_default()
}

fn as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(*v as i64),
        AMQPValue::ShortShortUInt(v) => Some(*v as i64),
        AMQPValue::ShortInt(v) => Some(*v as i64),
        AMQPValue::ShortUInt(v) => Some(*v as i64),
        AMQPValue::LongInt(v) => Some(*v as i64),
        AMQPValue::LongUInt(v) => Some(*v as i64),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}
