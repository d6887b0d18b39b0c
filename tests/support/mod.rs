// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory stand-in for a RabbitMQ broker: exchanges, queues, bindings,
//! per-queue TTL with dead-lettering, `x-death` bookkeeping and prefetch.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    types::{AMQPValue, FieldArray, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
use rabbitmq_retry::{
    channel::{BrokerChannel, Connector, Delivery, DeliveryStream},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    AMQP_HEADERS_COUNT, AMQP_HEADERS_X_DEATH,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct Message {
    pub id: u64,
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
    pub redelivered: bool,
}

struct Queue {
    def: QueueDefinition,
    ready: VecDeque<Message>,
}

struct Consumer {
    id: u64,
    channel_id: u64,
    queue: String,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

struct Unacked {
    queue: String,
    consumer_id: u64,
    channel_id: u64,
    message: Message,
}

type Expiry = (String, u64, Duration);

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, Queue>,
    bindings: Vec<QueueBinding>,
    consumers: Vec<Consumer>,
    unacked: HashMap<u64, Unacked>,
    open_channels: HashSet<u64>,
    next_id: u64,
    exchange_declarations: usize,
    nacked_publishes: HashMap<String, usize>,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    refuse_connections: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    fn go(p: &[&str], k: &[&str]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(&"#"), _) => go(&p[1..], k) || (!k.is_empty() && go(p, &k[1..])),
            (Some(&"*"), Some(_)) => go(&p[1..], &k[1..]),
            (Some(a), Some(b)) if a == b => go(&p[1..], &k[1..]),
            _ => false,
        }
    }

    let p: Vec<&str> = pattern.split('.').collect();
    let k: Vec<&str> = key.split('.').collect();
    go(&p, &k)
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(&self, exchange: &str, key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(key)
                .then(|| vec![key.to_owned()])
                .unwrap_or_default());
        }

        let def = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| AmqpError::PublishingError(format!("no exchange '{exchange}'")))?;

        Ok(self
            .bindings
            .iter()
            .filter(|b| b.exchange_name() == exchange)
            .filter(|b| match def.exchange_kind() {
                ExchangeKind::Direct => b.key() == key,
                ExchangeKind::Topic => topic_matches(b.key(), key),
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            })
            .map(|b| b.queue_name().to_owned())
            .collect())
    }

    fn enqueue(&mut self, queue: &str, message: Message, expiries: &mut Vec<Expiry>) {
        if let Some(q) = self.queues.get_mut(queue) {
            if let Some(ttl) = q.def.message_ttl() {
                expiries.push((queue.to_owned(), message.id, Duration::from_millis(ttl as u64)));
            }
            q.ready.push_back(message);
        }
    }

    fn publish(
        &mut self,
        exchange: &str,
        key: &str,
        data: Vec<u8>,
        properties: BasicProperties,
        expiries: &mut Vec<Expiry>,
    ) -> Result<(), AmqpError> {
        let targets = self.route(exchange, key)?;
        for queue in targets {
            let message = Message {
                id: self.next_id(),
                exchange: exchange.to_owned(),
                routing_key: key.to_owned(),
                data: data.clone(),
                properties: properties.clone(),
                redelivered: false,
            };
            self.enqueue(&queue, message, expiries);
            self.dispatch(&queue);
        }
        Ok(())
    }

    /// Moves `message` out of `queue` to its dead letter exchange, if any.
    fn dead_letter(&mut self, queue: &str, message: Message, reason: &str, expiries: &mut Vec<Expiry>) {
        let Some(def) = self.queues.get(queue).map(|q| q.def.clone()) else {
            return;
        };
        let Some(dlx) = def.dead_letter_exchange() else {
            return;
        };
        let key = def
            .dead_letter_routing_key()
            .unwrap_or(&message.routing_key)
            .to_owned();

        let mut headers = message
            .properties
            .headers()
            .as_ref()
            .map(|t| t.inner().clone())
            .unwrap_or_default();

        let mut deaths: Vec<AMQPValue> = headers
            .get(AMQP_HEADERS_X_DEATH)
            .and_then(|v| v.as_array())
            .map(|a| a.as_slice().to_vec())
            .unwrap_or_default();

        let matches = |entry: &AMQPValue| {
            entry.as_field_table().is_some_and(|t| {
                t.inner().get("queue") == Some(&AMQPValue::LongString(queue.into()))
                    && t.inner().get("reason") == Some(&AMQPValue::LongString(reason.into()))
            })
        };

        let previous = deaths
            .iter()
            .position(|e| matches(e))
            .map(|idx| deaths.remove(idx))
            .and_then(|e| e.as_field_table().cloned())
            .and_then(|t| t.inner().get(AMQP_HEADERS_COUNT).and_then(|c| c.as_long_long_int()))
            .unwrap_or_default();

        let mut entry = BTreeMap::new();
        entry.insert(ShortString::from("queue"), AMQPValue::LongString(queue.into()));
        entry.insert(ShortString::from("reason"), AMQPValue::LongString(reason.into()));
        entry.insert(
            ShortString::from("exchange"),
            AMQPValue::LongString(LongString::from(message.exchange.clone())),
        );
        entry.insert(
            ShortString::from(AMQP_HEADERS_COUNT),
            AMQPValue::LongLongInt(LongLongInt::from(previous + 1)),
        );
        deaths.insert(0, AMQPValue::FieldTable(FieldTable::from(entry)));

        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(deaths)),
        );
        let properties = message.properties.with_headers(FieldTable::from(headers));

        // unroutable dead letters are dropped, as on a real broker
        self.publish(dlx, &key, message.data, properties, expiries).ok();
    }

    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(q) = self.queues.get(queue) else {
                return;
            };
            if q.ready.is_empty() {
                return;
            }

            let Some(idx) = self
                .consumers
                .iter()
                .enumerate()
                .filter(|(_, c)| c.queue == queue)
                .filter(|(_, c)| c.prefetch == 0 || c.in_flight < c.prefetch as usize)
                .min_by_key(|(_, c)| c.in_flight)
                .map(|(idx, _)| idx)
            else {
                return;
            };

            let Some(message) = self.queues.get_mut(queue).and_then(|q| q.ready.pop_front()) else {
                return;
            };
            let tag = self.next_id();
            let consumer = &mut self.consumers[idx];

            let delivery = Delivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                data: message.data.clone(),
            };

            if consumer.sender.send(Ok(delivery)).is_err() {
                self.consumers.remove(idx);
                if let Some(q) = self.queues.get_mut(queue) {
                    q.ready.push_front(message);
                }
                continue;
            }

            consumer.in_flight += 1;
            let unacked = Unacked {
                queue: queue.to_owned(),
                consumer_id: consumer.id,
                channel_id: consumer.channel_id,
                message,
            };
            self.unacked.insert(tag, unacked);
        }
    }

    fn settle(&mut self, tag: u64) -> Option<Unacked> {
        let unacked = self.unacked.remove(&tag)?;
        if let Some(consumer) = self
            .consumers
            .iter_mut()
            .find(|c| c.id == unacked.consumer_id)
        {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        Some(unacked)
    }

    fn close_channel(&mut self, channel_id: u64) {
        self.open_channels.remove(&channel_id);
        self.consumers.retain(|c| c.channel_id != channel_id);

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();

        let mut queues = vec![];
        for tag in tags {
            if let Some(mut unacked) = self.unacked.remove(&tag) {
                unacked.message.redelivered = true;
                if let Some(q) = self.queues.get_mut(&unacked.queue) {
                    q.ready.push_front(unacked.message);
                }
                queues.push(unacked.queue);
            }
        }

        for queue in queues {
            self.dispatch(&queue);
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn schedule(&self, expiries: Vec<Expiry>) {
        for (queue, id, ttl) in expiries {
            let broker = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                broker.expire(&queue, id);
            });
        }
    }

    fn expire(&self, queue: &str, id: u64) {
        let mut expiries = vec![];
        {
            let mut state = self.lock();
            let message = state.queues.get_mut(queue).and_then(|q| {
                let idx = q.ready.iter().position(|m| m.id == id)?;
                q.ready.remove(idx)
            });
            if let Some(message) = message {
                state.dead_letter(queue, message, "expired", &mut expiries);
            }
        }
        self.schedule(expiries);
    }

    /// Nacks the next `times` publishes sent straight to `queue` through the default exchange.
    pub fn nack_publishes_to(&self, queue: &str, times: usize) {
        self.lock().nacked_publishes.insert(queue.to_owned(), times);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Simulates the broker dropping every client connection.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let open: Vec<u64> = state.open_channels.iter().copied().collect();
        for channel_id in open {
            state.close_channel(channel_id);
        }
    }

    pub fn exchange_count(&self) -> usize {
        self.lock().exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    pub fn exchange_declarations(&self) -> usize {
        self.lock().exchange_declarations
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Ready messages sitting in `queue`.
    pub fn ready(&self, queue: &str) -> Vec<Message> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }
        self.connections.fetch_add(1, Ordering::SeqCst);

        let id = {
            let mut state = self.lock();
            let id = state.next_id();
            state.open_channels.insert(id);
            id
        };

        Ok(Arc::new(InMemoryChannel {
            id,
            broker: self.clone(),
            prefetch: Mutex::new(0),
        }))
    }
}

pub struct InMemoryChannel {
    id: u64,
    broker: InMemoryBroker,
    prefetch: Mutex<u16>,
}

impl InMemoryChannel {
    fn state(&self) -> Result<MutexGuard<'_, State>, AmqpError> {
        let state = self.broker.lock();
        if state.open_channels.contains(&self.id) {
            Ok(state)
        } else {
            Err(AmqpError::ChannelError)
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.state()?;
        state.exchange_declarations += 1;
        match state.exchanges.get(def.name()) {
            Some(existing) if existing != def => {
                Err(AmqpError::TopologyConflict(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name().to_owned(), def.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.state()?;
        match state.queues.get(def.name()) {
            Some(existing)
                if existing.def.arguments() != def.arguments()
                    || existing.def.is_durable() != def.is_durable() =>
            {
                Err(AmqpError::TopologyConflict(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name().to_owned(),
                    Queue {
                        def: def.clone(),
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state()?;
        if !state.exchanges.contains_key(binding.exchange_name())
            || !state.queues.contains_key(binding.queue_name())
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            ));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.state()?;
        *self.prefetch.lock().unwrap() = prefetch;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut expiries = vec![];
        {
            let mut state = self.state()?;
            if exchange.is_empty() {
                if let Some(left) = state.nacked_publishes.get_mut(routing_key).filter(|n| **n > 0) {
                    *left -= 1;
                    return Err(AmqpError::PublishNacked(routing_key.to_owned()));
                }
            }
            state.publish(exchange, routing_key, payload.to_vec(), properties, &mut expiries)?;
        }
        self.broker.schedule(expiries);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let prefetch = *self.prefetch.lock().unwrap();
        let mut state = self.state()?;
        if !state.queues.contains_key(queue) {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let id = state.next_id();
        state.consumers.push(Consumer {
            id,
            channel_id: self.id,
            queue: queue.to_owned(),
            prefetch,
            in_flight: 0,
            sender,
        });
        state.dispatch(queue);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.state()?;
        let unacked = state.settle(delivery_tag).ok_or(AmqpError::AckMessageError)?;
        state.dispatch(&unacked.queue);
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut expiries = vec![];
        {
            let mut state = self.state()?;
            let mut unacked = state
                .settle(delivery_tag)
                .ok_or(AmqpError::NackMessageError)?;

            if requeue {
                unacked.message.redelivered = true;
                if let Some(q) = state.queues.get_mut(&unacked.queue) {
                    q.ready.push_front(unacked.message);
                }
            } else {
                state.dead_letter(&unacked.queue, unacked.message, "rejected", &mut expiries);
            }
            state.dispatch(&unacked.queue);
        }
        self.broker.schedule(expiries);
        Ok(())
    }

    async fn message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        let state = self.state()?;
        state
            .queues
            .get(queue)
            .map(|q| q.ready.len() as u32)
            .ok_or_else(|| AmqpError::DeclareQueueError(queue.to_owned()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.lock().open_channels.contains(&self.id)
    }
}

#[test]
fn topic_patterns() {
    assert!(topic_matches("order.created", "order.created"));
    assert!(topic_matches("order.*", "order.created"));
    assert!(topic_matches("order.#", "order.created.eu"));
    assert!(topic_matches("#", "anything.at.all"));
    assert!(!topic_matches("order.*", "order.created.eu"));
    assert!(!topic_matches("order.updated", "order.created"));
}
