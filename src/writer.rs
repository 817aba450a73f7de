// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Writer
//!
//! A `QueueWriter` publishes persistent messages with publisher confirms and the
//! mandatory flag. Each `enqueue` holds the writer's connection until the broker
//! answers, so a writer has at most one unconfirmed publish in flight:
//!
//! - ack: the message is stored;
//! - nack: `MessageNotAcknowledgedByBroker`, the caller decides whether to retry;
//! - return: `RemoteQueueDoesNotExist`, nothing was bound for the routing key.

use crate::{
    broker::{BrokerChannel, BrokerConnector, PublishOutcome},
    connection::{BrokerConnection, ChannelInitializer, ConnectionOptions, RetryPolicy},
    diagnostics::ProcessIdentity,
    errors::TransportError,
    otel,
    timeout::TimeoutBudget,
    tracker::ConcurrentOperationTracker,
};
use async_trait::async_trait;
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// AMQP delivery mode of messages surviving a broker restart.
const PERSISTENT: u8 = 2;

struct ConfirmSelect;

#[async_trait]
impl ChannelInitializer for ConfirmSelect {
    async fn initialize(&self, channel: &dyn BrokerChannel) -> Result<(), TransportError> {
        channel.enable_confirms().await
    }
}

#[derive(Debug, Clone, Default)]
pub struct WriterOptions {
    pub include_process_command_line: bool,
    pub retry: RetryPolicy,
}

/// Publishes messages to queues through exchanges.
pub struct QueueWriter {
    connection: BrokerConnection,
    tracker: ConcurrentOperationTracker,
    identity: ProcessIdentity,
    include_command_line: bool,
    disposed: AtomicBool,
}

impl QueueWriter {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        options: WriterOptions,
        identity: &ProcessIdentity,
    ) -> QueueWriter {
        QueueWriter {
            connection: BrokerConnection::new(
                connector,
                Arc::new(ConfirmSelect),
                ConnectionOptions {
                    retry: options.retry,
                    delete_queue_on_close: None,
                },
            ),
            tracker: ConcurrentOperationTracker::new(),
            identity: identity.clone(),
            include_command_line: options.include_process_command_line,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub async fn ensure_open(
        &self,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let _op = self.tracker.track()?;
        let linked = self.tracker.link(cancel);

        self.connection
            .ensure_connected(budget, linked.token())
            .await
            .map_err(|err| self.diagnose(err))
    }

    /// Publishes `body` to `exchange` under `queue_name` and waits for the broker's verdict.
    ///
    /// `time_to_live` of `None` means the message never expires.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue(
        &self,
        exchange: &str,
        queue_name: &str,
        body: &[u8],
        properties: BasicProperties,
        time_to_live: Option<Duration>,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let _op = self.tracker.track()?;
        let linked = self.tracker.link(cancel);
        let properties = self.decorate(properties, time_to_live);

        let outcome = self
            .connection
            .perform_action(
                |channel| {
                    let properties = properties.clone();
                    async move {
                        channel
                            .publish(exchange, queue_name, body, properties)
                            .await?
                            .wait()
                            .await
                    }
                },
                budget,
                linked.token(),
            )
            .await
            .map_err(|err| self.diagnose(err))?;

        match outcome {
            PublishOutcome::Acked => {
                debug!(exchange, queue = queue_name, "message published");
                Ok(())
            }
            PublishOutcome::Nacked => {
                error!(exchange, queue = queue_name, "broker refused the message");
                Err(TransportError::MessageNotAcknowledgedByBroker)
            }
            PublishOutcome::Returned => {
                debug!(exchange, queue = queue_name, "message returned as unroutable");
                Err(TransportError::RemoteQueueDoesNotExist(queue_name.to_owned()))
            }
        }
    }

    /// Drains in-flight publishes and closes the connection.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.tracker.dispose().await;
        self.connection.dispose().await;
        debug!("writer disposed");
    }

    fn decorate(
        &self,
        properties: BasicProperties,
        time_to_live: Option<Duration>,
    ) -> BasicProperties {
        let mut headers = properties.headers().clone().unwrap_or_default();
        extend(&mut headers, self.identity.to_table(self.include_command_line));
        otel::inject_current(&mut headers);

        let properties = properties
            .with_delivery_mode(PERSISTENT)
            .with_headers(headers);

        match time_to_live {
            Some(ttl) => properties.with_expiration(ShortString::from(ttl.as_millis().to_string())),
            None => properties,
        }
    }

    fn diagnose(&self, err: TransportError) -> TransportError {
        match err {
            TransportError::Cancelled if self.is_disposed() || self.tracker.is_disposed() => {
                TransportError::Disposed
            }
            err => err,
        }
    }
}

/// Copies `extra` into `headers` without overriding what is already there.
fn extend(headers: &mut FieldTable, extra: FieldTable) {
    for (key, value) in extra.inner() {
        if !headers.inner().contains_key(key) {
            headers.insert(key.clone(), value.clone());
        }
    }
}
