// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! `AmqpClient` owns the single connection/channel pair of a client instance.
//! It moves through `Uninitialized → Initializing → Ready → Closed`. Callers
//! that arrive while a setup is in flight await that same setup instead of
//! starting their own, so topology is never declared twice concurrently.
//!
//! Topologies declared through the client are remembered and replayed on
//! every new connection made by [`AmqpClient::reconnect`].

use crate::{
    channel::{BrokerChannel, Connector, LapinConnector},
    configs::RabbitMQConfigs,
    errors::AmqpError,
    topology::AmqpTopology,
};
use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tracing::{debug, error, warn};

fn same_channel(a: &Arc<dyn BrokerChannel>, b: &Arc<dyn BrokerChannel>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

type SetupFuture = Shared<BoxFuture<'static, Result<Arc<dyn BrokerChannel>, AmqpError>>>;

/// Lifecycle of an [`AmqpClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

enum Session {
    Uninitialized,
    Initializing(SetupFuture),
    Ready(Arc<dyn BrokerChannel>),
    Closed,
}

/// Exponential backoff used by [`AmqpClient::reconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_configs(cfg: &RabbitMQConfigs) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: cfg.reconnect_attempts,
            base_delay: Duration::from_millis(cfg.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(cfg.reconnect_max_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub struct AmqpClient {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    session: Mutex<Session>,
    topologies: Arc<Mutex<Vec<AmqpTopology>>>,
}

impl AmqpClient {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Arc<AmqpClient> {
        Arc::new(AmqpClient {
            connector,
            policy,
            session: Mutex::new(Session::Uninitialized),
            topologies: Arc::new(Mutex::new(vec![])),
        })
    }

    /// A client connecting with lapin to the broker described by `cfg`.
    pub fn from_configs(cfg: &RabbitMQConfigs) -> Arc<AmqpClient> {
        AmqpClient::new(
            Arc::new(LapinConnector::new(cfg)),
            ReconnectPolicy::from_configs(cfg),
        )
    }

    fn session(&self) -> Result<MutexGuard<'_, Session>, AmqpError> {
        self.session.lock().map_err(|_| {
            error!("client state lock poisoned");
            AmqpError::InternalError
        })
    }

    pub fn state(&self) -> ClientState {
        match self.session.lock().as_deref() {
            Ok(Session::Uninitialized) => ClientState::Uninitialized,
            Ok(Session::Initializing(_)) => ClientState::Initializing,
            Ok(Session::Ready(_)) => ClientState::Ready,
            Ok(Session::Closed) | Err(_) => ClientState::Closed,
        }
    }

    /// Opens the connection and channel. A no-op once the client is ready.
    ///
    /// Connection failures are returned to every caller waiting on this
    /// setup and leave the client `Uninitialized`; they are not retried here.
    pub async fn initialize(&self) -> Result<(), AmqpError> {
        let setup = {
            let mut session = self.session()?;
            match &*session {
                Session::Ready(_) => return Ok(()),
                Session::Closed => return Err(AmqpError::ClientClosed),
                Session::Initializing(setup) => setup.clone(),
                Session::Uninitialized => {
                    let setup = self.setup().boxed().shared();
                    *session = Session::Initializing(setup.clone());
                    setup
                }
            }
        };

        let result = setup.clone().await;

        // a channel that finished connecting after the client was closed
        let orphan = {
            let mut session = self.session()?;
            let is_current = matches!(
                &*session,
                Session::Initializing(current) if current.ptr_eq(&setup)
            );

            match result {
                Ok(channel) if is_current => {
                    *session = Session::Ready(channel);
                    debug!("amqp client ready");
                    return Ok(());
                }
                Ok(channel) => match &*session {
                    Session::Closed => channel,
                    Session::Ready(_) => return Ok(()),
                    _ => return Err(AmqpError::NotReady),
                },
                Err(err) => {
                    if is_current {
                        *session = Session::Uninitialized;
                    }
                    return Err(err);
                }
            }
        };

        orphan.close().await.ok();
        Err(AmqpError::ClientClosed)
    }

    /// Connects and replays every recorded topology on the new channel.
    fn setup(&self) -> impl std::future::Future<Output = Result<Arc<dyn BrokerChannel>, AmqpError>> {
        let connector = self.connector.clone();
        let topologies = self.topologies.clone();

        async move {
            let channel = connector.connect().await?;

            let recorded = match topologies.lock() {
                Ok(recorded) => recorded.clone(),
                Err(_) => return Err(AmqpError::InternalError),
            };

            for topology in &recorded {
                if let Err(err) = topology.install(channel.as_ref()).await {
                    error!(error = err.to_string(), "failure to replay topology");
                    channel.close().await.ok();
                    return Err(err);
                }
            }

            Ok(channel)
        }
    }

    /// The live channel; fails unless the client is `Ready`.
    pub fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        match &*self.session()? {
            Session::Ready(channel) => Ok(channel.clone()),
            Session::Closed => Err(AmqpError::ClientClosed),
            _ => Err(AmqpError::NotReady),
        }
    }

    /// Installs `topology` and remembers it for replay after reconnects.
    pub async fn declare_topology(&self, topology: &AmqpTopology) -> Result<(), AmqpError> {
        let channel = self.channel()?;
        topology.install(channel.as_ref()).await?;

        let mut recorded = self.topologies.lock().map_err(|_| AmqpError::InternalError)?;
        if !recorded.contains(topology) {
            recorded.push(topology.clone());
        }

        Ok(())
    }

    /// Replaces the failed channel `stale` with a new connection, retrying
    /// with exponential backoff and replaying recorded topologies before
    /// becoming ready.
    ///
    /// Consumers sharing the client all report the same dead channel. Only
    /// the first one reconnects, the others find it already replaced and
    /// return right away.
    pub async fn reconnect(&self, stale: &Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        let stale = {
            let mut session = self.session()?;
            match &*session {
                Session::Closed => return Err(AmqpError::ClientClosed),
                Session::Ready(current) if !same_channel(current, stale) => {
                    debug!("channel already replaced");
                    return Ok(());
                }
                _ => {}
            }

            match std::mem::replace(&mut *session, Session::Uninitialized) {
                Session::Ready(channel) => Some(channel),
                pending => {
                    *session = pending;
                    None
                }
            }
        };

        if let Some(channel) = stale {
            if channel.is_open() {
                channel.close().await.ok();
            }
        }

        let mut attempt = 0;
        loop {
            match self.initialize().await {
                Ok(()) => {
                    debug!(attempt, "amqp client reconnected");
                    return Ok(());
                }
                Err(AmqpError::ClientClosed) => return Err(AmqpError::ClientClosed),
                Err(err) if attempt + 1 >= self.policy.max_attempts => {
                    error!(error = err.to_string(), "giving up reconnecting");
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.policy.delay(attempt);
                    warn!(
                        error = err.to_string(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "reconnect failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Closes the connection. The client cannot be used afterwards.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let previous = {
            let mut session = self.session()?;
            std::mem::replace(&mut *session, Session::Closed)
        };

        match previous {
            Session::Ready(channel) => channel.close().await,
            _ => Ok(()),
        }
    }
}
