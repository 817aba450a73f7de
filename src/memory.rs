// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process local broker implementing the broker abstraction. It behaves like a
//! RabbitMQ server for everything the transport relies on:
//!
//! - direct routing through bindings, plus the nameless default exchange;
//! - basic-get with delivery tags, ack and reject;
//! - unacknowledged messages return to the head of their queue, flagged as
//!   redelivered, when the channel that fetched them closes;
//! - per-message expiration;
//! - publisher confirms and mandatory returns.
//!
//! It also exposes introspection and fault injection so tests can sever
//! connections, refuse connects or force negative confirmations.
//!
//! Time is read from `tokio::time::Instant`, so a paused test clock drives
//! message expiration too.

use crate::{
    broker::{
        BrokerChannel, BrokerConnector, BrokerDelivery, ConfirmSlot, PublishOutcome, QueueInfo,
        QueueOptions,
    },
    errors::TransportError,
    exchange::ExchangeDefinition,
};
use async_trait::async_trait;
use lapin::{types::FieldTable, BasicProperties};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    body: Vec<u8>,
    redelivered: bool,
    expires_at: Option<Instant>,
}

impl StoredMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug)]
struct MemoryQueue {
    durable: bool,
    auto_delete: bool,
    arguments: FieldTable,
    messages: VecDeque<StoredMessage>,
}

impl MemoryQueue {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.messages.retain(|m| !m.is_expired(now));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

#[derive(Debug, Default)]
struct ChannelState {
    open: bool,
    confirms: bool,
    prefetch: u16,
    unacked: HashMap<u64, (String, StoredMessage)>,
}

#[derive(Debug)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    channels: HashMap<u64, ChannelState>,
    next_channel: u64,
    next_tag: u64,
    refuse_connects: u32,
    forced_nacks: u32,
    connects: u64,
    acked: Vec<u64>,
    rejected: Vec<u64>,
}

impl BrokerState {
    fn new() -> BrokerState {
        let exchanges = ["", "amq.direct", "amq.topic", "amq.fanout"]
            .iter()
            .map(|name| name.to_string())
            .collect();

        BrokerState {
            exchanges,
            queues: HashMap::new(),
            bindings: vec![],
            channels: HashMap::new(),
            next_channel: 1,
            next_tag: 1,
            refuse_connects: 0,
            forced_nacks: 0,
            connects: 0,
            acked: vec![],
            rejected: vec![],
        }
    }

    fn channel(&mut self, id: u64) -> Result<&mut ChannelState, TransportError> {
        match self.channels.get_mut(&id) {
            Some(channel) if channel.open => Ok(channel),
            _ => Err(TransportError::TransientBroker(format!(
                "channel {} is closed",
                id
            ))),
        }
    }

    /// Closes a channel, handing its unacknowledged messages back to their queues.
    fn close_channel(&mut self, id: u64) {
        let Some(mut channel) = self.channels.remove(&id) else {
            return;
        };
        channel.open = false;

        let mut unacked: Vec<_> = channel.unacked.drain().collect();
        // newest first, so that pushing to the front restores fetch order
        unacked.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, (queue, mut message)) in unacked {
            if let Some(queue) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return match self.queues.contains_key(routing_key) {
                true => vec![routing_key.to_owned()],
                false => vec![],
            };
        }

        let mut targets = vec![];
        for binding in &self.bindings {
            if binding.exchange == exchange
                && binding.routing_key == routing_key
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }
}

fn expiration_of(properties: &BasicProperties) -> Option<Instant> {
    properties
        .expiration()
        .as_ref()
        .and_then(|value| value.as_str().parse::<u64>().ok())
        .map(|ms| Instant::now() + Duration::from_millis(ms))
}

/// Process local broker shared by every connector clone.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker {
            state: Arc::new(Mutex::new(BrokerState::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.lock().exchanges.contains(name)
    }

    /// Ready (not in-flight, not expired) messages of a queue.
    pub fn message_count(&self, name: &str) -> usize {
        let mut state = self.lock();
        match state.queues.get_mut(name) {
            Some(queue) => {
                queue.purge_expired();
                queue.messages.len()
            }
            None => 0,
        }
    }

    /// Bodies of the ready messages of a queue, head first.
    pub fn peek_bodies(&self, name: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(name)
            .map(|queue| queue.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn queue_arguments(&self, name: &str) -> Option<FieldTable> {
        self.lock().queues.get(name).map(|q| q.arguments.clone())
    }

    pub fn is_queue_durable(&self, name: &str) -> Option<bool> {
        self.lock().queues.get(name).map(|q| q.durable)
    }

    pub fn is_queue_auto_delete(&self, name: &str) -> Option<bool> {
        self.lock().queues.get(name).map(|q| q.auto_delete)
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.lock().bindings.contains(&Binding {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            queue: queue.to_owned(),
        })
    }

    /// Delivery tags acknowledged so far, in order.
    pub fn acked_tags(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    pub fn rejected_tags(&self) -> Vec<u64> {
        self.lock().rejected.clone()
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.values().filter(|c| c.open).count()
    }

    pub fn prefetch_of_open_channels(&self) -> Vec<u16> {
        self.lock()
            .channels
            .values()
            .filter(|c| c.open)
            .map(|c| c.prefetch)
            .collect()
    }

    /// Successful connects so far.
    pub fn connects(&self) -> u64 {
        self.lock().connects
    }

    /// Closes every open channel as if the network dropped.
    pub fn sever_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id);
        }
        debug!("severed every in-memory connection");
    }

    /// Refuses the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().refuse_connects = count;
    }

    /// Answers the next `count` publishes with a negative confirmation.
    pub fn nack_next_publishes(&self, count: u32) {
        self.lock().forced_nacks = count;
    }

    /// Deletes a queue behind the transport's back.
    pub fn delete_queue(&self, name: &str) {
        let mut state = self.lock();
        state.queues.remove(name);
        state.bindings.retain(|b| b.queue != name);
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, TransportError> {
        let mut state = self.lock();

        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(TransportError::ConnectionError(
                "connection refused".to_owned(),
            ));
        }

        let id = state.next_channel;
        state.next_channel += 1;
        state.connects += 1;
        state.channels.insert(
            id,
            ChannelState {
                open: true,
                ..ChannelState::default()
            },
        );

        Ok(Box::new(MemoryChannel {
            id,
            broker: self.clone(),
        }))
    }
}

/// One connection/channel pair on an `InMemoryBroker`.
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .channels
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;
        state.exchanges.insert(def.name().to_owned());
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, TransportError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;

        if !state.queues.contains_key(name) {
            if options.passive {
                return Err(TransportError::QueueNotFound(name.to_owned()));
            }

            state.queues.insert(
                name.to_owned(),
                MemoryQueue {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    arguments,
                    messages: VecDeque::new(),
                },
            );
        }

        let mut info = QueueInfo::default();
        if let Some(queue) = state.queues.get_mut(name) {
            queue.purge_expired();
            info.message_count = queue.messages.len() as u32;
        }

        Ok(info)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;

        if !state.exchanges.contains(exchange) || !state.queues.contains_key(queue) {
            return Err(TransportError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        let binding = Binding {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            queue: queue.to_owned(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }

        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;

        state.queues.remove(name);
        state.bindings.retain(|b| b.queue != name);
        for channel in state.channels.values_mut() {
            channel.unacked.retain(|_, (queue, _)| queue != name);
        }

        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?.prefetch = count;
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?.confirms = true;
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<BrokerDelivery>, TransportError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;

        let Some(stored) = state.queues.get_mut(queue) else {
            return Err(TransportError::QueueNotFound(queue.to_owned()));
        };
        stored.purge_expired();

        let Some(message) = stored.messages.pop_front() else {
            return Ok(None);
        };
        let message_count = stored.messages.len() as u32;

        let tag = state.next_tag;
        state.next_tag += 1;

        let delivery = BrokerDelivery {
            delivery_tag: tag,
            redelivered: message.redelivered,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            message_count,
            properties: message.properties.clone(),
            body: message.body.clone(),
        };

        state
            .channel(self.id)?
            .unacked
            .insert(tag, (queue.to_owned(), message));

        Ok(Some(delivery))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let mut state = self.broker.lock();

        if state
            .channel(self.id)?
            .unacked
            .remove(&delivery_tag)
            .is_none()
        {
            return Err(TransportError::AckMessageError(delivery_tag));
        }

        state.acked.push(delivery_tag);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.broker.lock();

        let Some((queue, mut message)) = state.channel(self.id)?.unacked.remove(&delivery_tag)
        else {
            return Err(TransportError::RejectMessageError(delivery_tag));
        };

        state.rejected.push(delivery_tag);
        if requeue {
            if let Some(queue) = state.queues.get_mut(&queue) {
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<ConfirmSlot, TransportError> {
        let mut state = self.broker.lock();
        let confirms = state.channel(self.id)?.confirms;

        if !state.exchanges.contains(exchange) {
            // a publish to a missing exchange closes the channel on a real broker
            state.close_channel(self.id);
            return Err(TransportError::PublishingError(format!(
                "no exchange `{}`",
                exchange
            )));
        }

        if confirms && state.forced_nacks > 0 {
            state.forced_nacks -= 1;
            return Ok(ConfirmSlot::resolved(PublishOutcome::Nacked));
        }

        let targets = state.route(exchange, routing_key);
        if targets.is_empty() {
            debug!(exchange, routing_key, "returning unroutable message");
            return Ok(ConfirmSlot::resolved(PublishOutcome::Returned));
        }

        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            expires_at: expiration_of(&properties),
            properties,
            body: body.to_vec(),
            redelivered: false,
        };

        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.messages.push_back(message.clone());
            }
        }

        Ok(ConfirmSlot::resolved(PublishOutcome::Acked))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;

    async fn declared(broker: &InMemoryBroker, queue: &str) -> Box<dyn BrokerChannel> {
        let channel = broker.connect().await.unwrap();
        channel
            .declare_queue(queue, QueueOptions::default(), FieldTable::default())
            .await
            .unwrap();
        channel.bind_queue(queue, "amq.direct", queue).await.unwrap();
        channel.enable_confirms().await.unwrap();
        channel
    }

    #[tokio::test]
    async fn routes_through_bindings_and_returns_unroutable() {
        let broker = InMemoryBroker::new();
        let channel = declared(&broker, "orders").await;

        let routed = channel
            .publish("amq.direct", "orders", b"a", BasicProperties::default())
            .await
            .unwrap();
        assert_eq!(routed.wait().await, Ok(PublishOutcome::Acked));

        let returned = channel
            .publish("amq.direct", "missing", b"b", BasicProperties::default())
            .await
            .unwrap();
        assert_eq!(returned.wait().await, Ok(PublishOutcome::Returned));

        assert_eq!(broker.peek_bodies("orders"), vec![b"a".to_vec()]);
    }

    #[tokio::test]
    async fn unacked_messages_return_on_close() {
        let broker = InMemoryBroker::new();
        let channel = declared(&broker, "orders").await;
        for body in [b"1", b"2"] {
            channel
                .publish("amq.direct", "orders", body, BasicProperties::default())
                .await
                .unwrap();
        }

        let first = channel.get("orders").await.unwrap().unwrap();
        assert!(!first.redelivered);
        assert_eq!(first.message_count, 1);

        broker.sever_connections();
        assert!(!channel.is_open());
        assert!(channel.get("orders").await.unwrap_err().is_transient());

        let again = broker.connect().await.unwrap();
        let redelivered = again.get("orders").await.unwrap().unwrap();
        assert!(redelivered.redelivered);
        assert_eq!(redelivered.body, b"1".to_vec());
    }

    #[tokio::test]
    async fn ack_and_reject_need_a_live_tag() {
        let broker = InMemoryBroker::new();
        let channel = declared(&broker, "orders").await;
        channel
            .publish("", "orders", b"x", BasicProperties::default())
            .await
            .unwrap();

        let delivery = channel.get("orders").await.unwrap().unwrap();
        channel.reject(delivery.delivery_tag, true).await.unwrap();
        assert_eq!(broker.message_count("orders"), 1);

        let delivery = channel.get("orders").await.unwrap().unwrap();
        channel.ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(
            channel.ack(delivery.delivery_tag).await,
            Err(TransportError::AckMessageError(delivery.delivery_tag))
        );
        assert_eq!(broker.acked_tags(), vec![delivery.delivery_tag]);
    }

    #[tokio::test]
    async fn passive_declare_of_missing_queue_fails() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect().await.unwrap();

        assert_eq!(
            channel
                .declare_queue("nowhere", QueueOptions::passive(), FieldTable::default())
                .await,
            Err(TransportError::QueueNotFound("nowhere".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_messages_are_dropped() {
        let broker = InMemoryBroker::new();
        let channel = declared(&broker, "orders").await;
        channel
            .publish(
                "amq.direct",
                "orders",
                b"x",
                BasicProperties::default().with_expiration(ShortString::from("1000")),
            )
            .await
            .unwrap();

        assert_eq!(broker.message_count("orders"), 1);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(broker.message_count("orders"), 0);
    }

    #[tokio::test]
    async fn fault_injection() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(1);
        assert!(broker.connect().await.err().unwrap().is_transient());

        let channel = declared(&broker, "orders").await;
        broker.nack_next_publishes(1);
        let slot = channel
            .publish("amq.direct", "orders", b"x", BasicProperties::default())
            .await
            .unwrap();
        assert_eq!(slot.wait().await, Ok(PublishOutcome::Nacked));
        assert_eq!(broker.message_count("orders"), 0);
    }
}
