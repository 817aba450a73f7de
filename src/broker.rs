// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Abstraction
//!
//! The transport never talks to an AMQP client directly. It consumes the two traits
//! in this module:
//!
//! - `BrokerConnector` opens a connection together with one channel on it;
//! - `BrokerChannel` is the set of broker operations readers and writers perform.
//!
//! The pair returned by a connector is owned as a unit: it is either usable or
//! closed as a whole. `crate::amqp` implements the traits over lapin and
//! `crate::memory` implements them in process.
//!
//! Publishing is always mandatory and yields a `ConfirmSlot`, a one-shot slot that
//! resolves with the broker's verdict on that single publish.

use crate::{errors::TransportError, exchange::ExchangeDefinition};
use async_trait::async_trait;
use lapin::{types::FieldTable, BasicProperties};
use tokio::sync::oneshot;

/// Flags a queue is declared with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Only check that the queue exists; fails when it does not.
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    pub fn passive() -> QueueOptions {
        QueueOptions {
            passive: true,
            ..QueueOptions::default()
        }
    }
}

/// Counters the broker reports for a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A message fetched with basic-get and not yet acknowledged.
#[derive(Debug, Clone)]
pub struct BrokerDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    /// Messages left in the queue after this one was taken.
    pub message_count: u32,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

/// The broker's verdict on a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Acked,
    Nacked,
    /// No queue was bound for the routing key.
    Returned,
}

/// One-shot slot resolved by the broker adapter when the confirmation arrives.
#[derive(Debug)]
pub struct ConfirmSlot {
    rx: oneshot::Receiver<Result<PublishOutcome, TransportError>>,
}

/// Resolving half of a `ConfirmSlot`.
#[derive(Debug)]
pub struct ConfirmResolver {
    tx: oneshot::Sender<Result<PublishOutcome, TransportError>>,
}

impl ConfirmSlot {
    pub fn pending() -> (ConfirmResolver, ConfirmSlot) {
        let (tx, rx) = oneshot::channel();
        (ConfirmResolver { tx }, ConfirmSlot { rx })
    }

    pub fn resolved(outcome: PublishOutcome) -> ConfirmSlot {
        let (resolver, slot) = ConfirmSlot::pending();
        resolver.resolve(Ok(outcome));
        slot
    }

    /// Waits for the verdict. A dropped resolver means the channel went away first.
    pub async fn wait(self) -> Result<PublishOutcome, TransportError> {
        match self.rx.await {
            Ok(res) => res,
            Err(_) => Err(TransportError::TransientBroker(
                "channel closed before the publish was confirmed".to_owned(),
            )),
        }
    }
}

impl ConfirmResolver {
    pub fn resolve(self, outcome: Result<PublishOutcome, TransportError>) {
        // the waiter may have given up already
        let _ = self.tx.send(outcome);
    }
}

/// Opens connection/channel pairs.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, TransportError>;
}

/// Operations on one live connection/channel pair.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Whether both the channel and its connection are still open.
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), TransportError>;

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Puts the channel in publisher-confirm mode.
    async fn enable_confirms(&self) -> Result<(), TransportError>;

    async fn get(&self, queue: &str) -> Result<Option<BrokerDelivery>, TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    /// Publishes with the mandatory flag set.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<ConfirmSlot, TransportError>;

    /// Closes the channel and then its connection.
    async fn close(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slot_returns_the_resolved_outcome() {
        let slot = ConfirmSlot::resolved(PublishOutcome::Nacked);
        assert_eq!(slot.wait().await, Ok(PublishOutcome::Nacked));
    }

    #[tokio::test]
    async fn dropped_resolver_is_transient() {
        let (resolver, slot) = ConfirmSlot::pending();
        drop(resolver);

        let err = slot.wait().await.unwrap_err();
        assert!(err.is_transient());
    }
}
