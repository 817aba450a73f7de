// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Transport
//!
//! This module provides the single error type shared by every layer of the transport,
//! from the broker adapters up to the channels. The `TransportError` enum separates
//! failures the resilient connection retries on its own (transient broker and I/O
//! failures) from the ones it surfaces to the caller.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur while moving messages through the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// A timeout budget ran out while waiting on the broker, a lock or a peer.
    #[error("operation did not complete within `{0:?}`")]
    TimedOut(Duration),

    /// An explicit cancellation token fired.
    #[error("operation was cancelled")]
    Cancelled,

    /// The component was disposed before or while the operation ran.
    #[error("object was disposed")]
    Disposed,

    /// The broker answered a publish with a negative confirmation.
    #[error("message was not acknowledged by the broker")]
    MessageNotAcknowledgedByBroker,

    /// The broker returned a mandatory publish: no queue was bound for it.
    #[error("remote queue `{0}` does not exist")]
    RemoteQueueDoesNotExist(String),

    /// Session level failure; terminal for the channel that raised it.
    #[error("communication error: {0}")]
    Communication(String),

    /// Operation not allowed in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A queue address could not be parsed.
    #[error("invalid queue address `{0}`")]
    InvalidAddress(String),

    /// Configuration could not be loaded.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Broker or I/O failure that goes away with a fresh connection
    #[error("transient broker failure: {0}")]
    TransientBroker(String),

    /// Broker failure that a reconnect will not fix
    #[error("broker failure: {0}")]
    Broker(String),

    /// A queue was not found by a passive declaration
    #[error("queue `{0}` was not found")]
    QueueNotFound(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error rejecting a message
    #[error("failure to reject message `{0}`")]
    RejectMessageError(u64),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),
}

impl TransportError {
    /// Whether the resilient connection should tear down its pair and retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::TransientBroker(_)
                | TransportError::ConnectionError(_)
                | TransportError::ChannelError(_)
        )
    }

    /// Errors an abort path expects and demotes to a log line.
    pub fn is_expected_on_abort(&self) -> bool {
        matches!(
            self,
            TransportError::RemoteQueueDoesNotExist(_)
                | TransportError::TimedOut(_)
                | TransportError::Disposed
                | TransportError::Cancelled
        )
    }
}
