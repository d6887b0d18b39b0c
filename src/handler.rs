// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Handlers
//!
//! An [`EventHandler`] receives one deserialized event and reports success or
//! failure; the consumer turns that outcome into an ack or a retry. Async
//! closures returning `Result<(), HandlerError>` are handlers too.
//!
//! Cross-cutting behaviour is layered around a handler instead of being
//! baked into it: [`inspect`] runs a hook before delegating and never touches
//! the outcome.

use crate::errors::HandlerError;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::{future::Future, marker::PhantomData};

/// A payload type carried by the broker.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Queue the event is consumed from by default.
    fn queue_name() -> &'static str;

    /// Value of the AMQP `type` property.
    fn message_type() -> &'static str {
        Self::queue_name()
    }
}

#[async_trait]
pub trait EventHandler<T>: Send + Sync
where
    T: Send + 'static,
{
    async fn handle(&self, event: T) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T, F, Fut> EventHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: T) -> Result<(), HandlerError> {
        (self)(event).await
    }
}

/// Handler decorator that runs a hook on each event before delegating.
pub struct Inspect<T, H, F> {
    inner: H,
    hook: F,
    _event: PhantomData<fn(T)>,
}

/// Wraps `handler` so that `hook` sees every event first.
pub fn inspect<T, H, F>(handler: H, hook: F) -> Inspect<T, H, F>
where
    T: Send + 'static,
    H: EventHandler<T>,
    F: Fn(&T) + Send + Sync,
{
    Inspect {
        inner: handler,
        hook,
        _event: PhantomData,
    }
}

#[async_trait]
impl<T, H, F> EventHandler<T> for Inspect<T, H, F>
where
    T: Send + 'static,
    H: EventHandler<T>,
    F: Fn(&T) + Send + Sync,
{
    async fn handle(&self, event: T) -> Result<(), HandlerError> {
        (self.hook)(&event);
        self.inner.handle(event).await
    }
}
