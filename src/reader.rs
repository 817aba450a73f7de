// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Reader
//!
//! A `QueueReader` pulls messages from one queue. On its first connection (and on
//! every reconnection) it declares the exchange and the queue, binds the queue to
//! the exchange under its own name, limits the prefetch to one message and enables
//! publisher confirms.
//!
//! Dequeuing polls the queue depth, asks the throttler, and takes one message with
//! basic-get. Empty polls back off exponentially up to a small ceiling, so an idle
//! reader neither spins nor adds much latency. The caller of `dequeue` owns the
//! returned delivery until it acknowledges or rejects it; anything still
//! unacknowledged when the reader is disposed goes back to the queue.

use crate::{
    address::{QueueAddress, SCHEME},
    broker::{BrokerChannel, BrokerConnector, BrokerDelivery, QueueInfo, QueueOptions},
    connection::{BrokerConnection, ChannelInitializer, ConnectionOptions, RetryPolicy},
    diagnostics::ProcessIdentity,
    errors::TransportError,
    exchange::ExchangeDefinition,
    otel,
    throttle::{NoOpThrottler, ThrottleDecision, Throttler},
    timeout::{sleep_or_cancel, TimeoutBudget},
    tracker::ConcurrentOperationTracker,
};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Idle lifetime of a queue
pub const AMQP_ARGUMENT_EXPIRES: &str = "x-expires";
/// Number of priority levels of a queue
pub const AMQP_ARGUMENT_MAX_PRIORITY: &str = "x-max-priority";
/// Address scheme of the transport owning a listener queue
pub const AMQP_ARGUMENT_SCHEME: &str = "x-scheme";
/// Marks the shared input queue of a listener
pub const AMQP_ARGUMENT_TASK_INPUT_QUEUE: &str = "x-task-input-queue";

/// Delay between empty polls: doubles from `initial` up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for PollBackoff {
    fn default() -> Self {
        PollBackoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(200),
        }
    }
}

/// Options of a `QueueReader`.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub address: QueueAddress,
    pub include_process_command_line: bool,
    /// Tags the queue as the shared input queue of a listener.
    pub listener_input_queue: bool,
    pub retry: RetryPolicy,
    pub poll: PollBackoff,
}

impl ReaderOptions {
    pub fn new(address: QueueAddress) -> ReaderOptions {
        ReaderOptions {
            address,
            include_process_command_line: false,
            listener_input_queue: false,
            retry: RetryPolicy::default(),
            poll: PollBackoff::default(),
        }
    }
}

/// A message taken from a queue and not yet acknowledged.
#[derive(Debug, Clone)]
pub struct DequeueResult {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    /// Queue depth observed right before the message was taken.
    pub queue_depth: u32,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

impl DequeueResult {
    fn from_delivery(delivery: BrokerDelivery, queue_depth: u32) -> DequeueResult {
        DequeueResult {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            queue_depth,
            properties: delivery.properties,
            body: delivery.body,
        }
    }

    /// Trace context the publisher attached to the message.
    pub fn trace_context(&self) -> Context {
        otel::extract(self.properties.headers().as_ref())
    }
}

/// Declares and binds the reader's queue on every fresh channel.
struct ReaderTopology {
    address: QueueAddress,
    arguments: FieldTable,
}

impl ReaderTopology {
    fn new(options: &ReaderOptions, identity: &ProcessIdentity) -> ReaderTopology {
        let address = &options.address;
        let mut arguments = identity.to_table(options.include_process_command_line);

        if let Some(ttl) = address.time_to_live() {
            arguments.insert(
                ShortString::from(AMQP_ARGUMENT_EXPIRES),
                AMQPValue::LongLongInt(ttl.as_millis().min(i64::MAX as u128) as LongLongInt),
            );
        }

        if let Some(priority) = address.priority_levels() {
            arguments.insert(
                ShortString::from(AMQP_ARGUMENT_MAX_PRIORITY),
                AMQPValue::ShortShortUInt(priority),
            );
        }

        if options.listener_input_queue {
            arguments.insert(
                ShortString::from(AMQP_ARGUMENT_SCHEME),
                AMQPValue::LongString(LongString::from(SCHEME)),
            );
            arguments.insert(
                ShortString::from(AMQP_ARGUMENT_TASK_INPUT_QUEUE),
                AMQPValue::Boolean(true),
            );
        }

        ReaderTopology {
            address: address.clone(),
            arguments,
        }
    }
}

#[async_trait]
impl ChannelInitializer for ReaderTopology {
    async fn initialize(&self, channel: &dyn BrokerChannel) -> Result<(), TransportError> {
        let queue = self.address.queue_name();
        let exchange = ExchangeDefinition::new(self.address.exchange_name());

        if !exchange.is_predeclared() {
            channel.declare_exchange(&exchange).await?;
        }

        debug!("creating queue: {}", queue);
        channel
            .declare_queue(
                queue,
                QueueOptions {
                    passive: false,
                    durable: self.address.is_durable(),
                    exclusive: false,
                    auto_delete: false,
                },
                self.arguments.clone(),
            )
            .await?;

        // the default exchange routes by queue name and refuses explicit bindings
        if !exchange.name().is_empty() {
            channel.bind_queue(queue, exchange.name(), queue).await?;
        }

        channel.set_prefetch(1).await?;
        channel.enable_confirms().await
    }
}

/// Reads messages from one queue.
pub struct QueueReader {
    address: QueueAddress,
    connection: BrokerConnection,
    tracker: ConcurrentOperationTracker,
    throttler: Arc<dyn Throttler>,
    poll: PollBackoff,
    soft_closed: AtomicBool,
    disposed: AtomicBool,
}

impl QueueReader {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        options: ReaderOptions,
        identity: &ProcessIdentity,
    ) -> QueueReader {
        QueueReader::with_throttler(connector, options, identity, Arc::new(NoOpThrottler))
    }

    pub fn with_throttler(
        connector: Arc<dyn BrokerConnector>,
        options: ReaderOptions,
        identity: &ProcessIdentity,
        throttler: Arc<dyn Throttler>,
    ) -> QueueReader {
        let topology = ReaderTopology::new(&options, identity);
        let delete_queue_on_close = options
            .address
            .is_delete_on_close()
            .then(|| options.address.queue_name().to_owned());

        QueueReader {
            connection: BrokerConnection::new(
                connector,
                Arc::new(topology),
                ConnectionOptions {
                    retry: options.retry,
                    delete_queue_on_close,
                },
            ),
            address: options.address,
            tracker: ConcurrentOperationTracker::new(),
            throttler,
            poll: options.poll,
            soft_closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &QueueAddress {
        &self.address
    }

    pub fn is_soft_closed(&self) -> bool {
        self.soft_closed.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Connects and declares the queue. A no-op once soft closed.
    pub async fn ensure_open(
        &self,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        if self.is_soft_closed() {
            return Ok(());
        }

        let _op = self.tracker.track()?;
        let linked = self.tracker.link(cancel);

        self.connection
            .ensure_connected(budget, linked.token())
            .await
            .map_err(|err| self.diagnose(err))
    }

    /// Depth and consumer count of the queue; zeroes once soft closed.
    pub async fn query_queue(
        &self,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<QueueInfo, TransportError> {
        if self.is_soft_closed() {
            return Ok(QueueInfo::default());
        }

        let _op = self.tracker.track()?;
        let linked = self.tracker.link(cancel);

        self.query(budget, linked.token())
            .await
            .map_err(|err| self.diagnose(err))
    }

    pub async fn message_count(
        &self,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<u32, TransportError> {
        Ok(self.query_queue(budget, cancel).await?.message_count)
    }

    /// Polls until the queue holds a message.
    ///
    /// Timeouts, cancellation and disposal yield `Ok(false)`.
    pub async fn wait_for_message(
        &self,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<bool, TransportError> {
        let mut delay = self.poll.initial;

        loop {
            match self.message_count(budget, cancel).await {
                Ok(count) if count > 0 => return Ok(true),
                Ok(_) if self.is_soft_closed() => return Ok(false),
                Ok(_) => {}
                Err(TransportError::TimedOut(_))
                | Err(TransportError::Cancelled)
                | Err(TransportError::Disposed) => return Ok(false),
                Err(err) => return Err(err),
            }

            if budget.expired() {
                return Ok(false);
            }

            if sleep_or_cancel(budget.remaining_capped(delay), cancel)
                .await
                .is_err()
            {
                return Ok(false);
            }
            delay = (delay * 2).min(self.poll.max);
        }
    }

    /// Takes the next message, waiting for one within the budget.
    pub async fn dequeue(
        &self,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<DequeueResult, TransportError> {
        let _op = self.tracker.track()?;
        let linked = self.tracker.link(cancel);
        let cancel = linked.token();
        let mut delay = self.poll.initial;

        loop {
            match self.try_take(budget, cancel).await {
                Ok(Some(message)) => return Ok(message),
                Ok(None) => {}
                Err(err) => return Err(self.diagnose(err)),
            }

            budget.check()?;
            sleep_or_cancel(budget.remaining_capped(delay), cancel)
                .await
                .map_err(|err| self.diagnose(err))?;
            budget.check()?;

            delay = (delay * 2).min(self.poll.max);
        }
    }

    pub async fn acknowledge_message(
        &self,
        delivery_tag: u64,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let _op = self.tracker.track()?;
        let linked = self.tracker.link(cancel);

        self.connection
            .perform_action(
                |channel| async move { channel.ack(delivery_tag).await },
                budget,
                linked.token(),
            )
            .await
            .map_err(|err| self.diagnose(err))
    }

    pub async fn reject_message(
        &self,
        delivery_tag: u64,
        requeue: bool,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let _op = self.tracker.track()?;
        let linked = self.tracker.link(cancel);

        self.connection
            .perform_action(
                |channel| async move { channel.reject(delivery_tag, requeue).await },
                budget,
                linked.token(),
            )
            .await
            .map_err(|err| self.diagnose(err))
    }

    /// Stops accepting new work now and disposes the reader in the background.
    pub fn soft_close(self: &Arc<Self>) {
        if self.soft_closed.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!(queue = self.address.queue_name(), "soft closing reader");
        let reader = self.clone();
        tokio::spawn(async move { reader.dispose().await });
    }

    /// Drains in-flight operations, then releases the connection and the throttler.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.tracker.dispose().await;
        self.connection.dispose().await;
        self.throttler.dispose().await;
        debug!(queue = self.address.queue_name(), "reader disposed");
    }

    async fn query(
        &self,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<QueueInfo, TransportError> {
        let queue = self.address.queue_name();

        self.connection
            .perform_action(
                |channel| async move {
                    channel
                        .declare_queue(queue, QueueOptions::passive(), FieldTable::default())
                        .await
                },
                budget,
                cancel,
            )
            .await
    }

    /// One dequeue round: depth, throttle, basic-get.
    async fn try_take(
        &self,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<Option<DequeueResult>, TransportError> {
        let info = self.query(budget, cancel).await?;
        if info.message_count == 0 {
            return Ok(None);
        }

        let decision = self
            .throttler
            .throttle(info.message_count, info.consumer_count, cancel)
            .await;
        if decision == ThrottleDecision::SkipMessage {
            return Ok(None);
        }

        let queue = self.address.queue_name();
        let delivery = self
            .connection
            .perform_action(
                |channel| async move { channel.get(queue).await },
                budget,
                cancel,
            )
            .await?;

        Ok(delivery.map(|delivery| DequeueResult::from_delivery(delivery, info.message_count)))
    }

    /// Disposal explains a cancellation better than the cancellation itself.
    fn diagnose(&self, err: TransportError) -> TransportError {
        match err {
            TransportError::Cancelled if self.is_disposed() || self.tracker.is_disposed() => {
                TransportError::Disposed
            }
            TransportError::QueueNotFound(queue) => {
                warn!(queue, "reader queue disappeared");
                TransportError::QueueNotFound(queue)
            }
            err => err,
        }
    }
}
