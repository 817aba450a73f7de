// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Factories and Listeners
//!
//! Entry points of the transport. A `ChannelFactory` creates client side channels
//! towards a remote listener address; a `ChannelListener` owns a well-known input
//! queue and accepts the server side of duplex sessions or hands out reply
//! channels competing for its requests.
//!
//! Both are built from a `TransportContext`, which bundles what every component
//! needs: the broker connector, the binding configuration, the process identity
//! and the recipe for the throttler of each listener input queue. Every listener
//! gets its own throttler and disposes it when it closes.

use crate::{
    address::QueueAddress,
    amqp::AmqpConnector,
    broker::BrokerConnector,
    configs::BindingConfigs,
    connection::RetryPolicy,
    diagnostics::ProcessIdentity,
    duplex::DuplexChannel,
    errors::TransportError,
    lifecycle::{CommunicationObject, CommunicationState, Lifecycle},
    message::{Action, Message},
    reader::{QueueReader, ReaderOptions},
    reply::ReplyChannel,
    request::RequestChannel,
    throttle::{NoOpThrottler, Throttler},
    timeout::TimeoutBudget,
    tracker::ConcurrentOperationTracker,
    writer::{QueueWriter, WriterOptions},
};
use async_trait::async_trait;
use std::{fmt, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Builds the throttler of one listener input queue.
pub type ThrottlerFactory = Arc<dyn Fn() -> Arc<dyn Throttler> + Send + Sync>;

/// Shared dependencies of every channel, factory and listener.
pub struct TransportContext {
    connector: Arc<dyn BrokerConnector>,
    configs: BindingConfigs,
    identity: ProcessIdentity,
    throttlers: ThrottlerFactory,
}

impl TransportContext {
    pub fn new(connector: Arc<dyn BrokerConnector>, configs: BindingConfigs) -> TransportContext {
        TransportContext {
            connector,
            configs,
            identity: ProcessIdentity::capture(),
            throttlers: Arc::new(|| Arc::new(NoOpThrottler) as Arc<dyn Throttler>),
        }
    }

    /// A context talking to the RabbitMQ server described by `configs`.
    pub fn amqp(configs: BindingConfigs) -> TransportContext {
        let connector = Arc::new(AmqpConnector::from_configs(&configs));
        TransportContext::new(connector, configs)
    }

    pub fn with_identity(mut self, identity: ProcessIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Throttlers consulted by listener input queues, one built per listener.
    pub fn with_throttler<F>(mut self, make: F) -> Self
    where
        F: Fn() -> Arc<dyn Throttler> + Send + Sync + 'static,
    {
        self.throttlers = Arc::new(make);
        self
    }

    pub fn configs(&self) -> &BindingConfigs {
        &self.configs
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    /// Address of a well-known queue, shaped by the configured defaults.
    pub fn queue_address(&self, queue: &str) -> QueueAddress {
        let address = QueueAddress::new(queue)
            .exchange(&self.configs.exchange)
            .durable(self.configs.durable)
            .delete_on_close(self.configs.delete_on_close);

        match self.configs.queue_ttl() {
            Some(ttl) => address.ttl(ttl),
            None => address,
        }
    }

    pub(crate) fn message_ttl(&self) -> Option<Duration> {
        self.configs.message_ttl()
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::with_max_delay(self.configs.max_reconnect_delay())
    }

    /// A fresh private queue on the configured exchange.
    pub(crate) fn private_address(&self) -> QueueAddress {
        let address =
            QueueAddress::private(&self.configs.private_queue_prefix, &self.configs.exchange);

        match self.configs.queue_ttl() {
            Some(ttl) => address.ttl(ttl),
            None => address,
        }
    }

    fn reader_options(&self, address: QueueAddress) -> ReaderOptions {
        ReaderOptions {
            include_process_command_line: self.configs.include_process_command_line,
            retry: self.retry(),
            ..ReaderOptions::new(address)
        }
    }

    pub(crate) fn session_reader(&self, address: QueueAddress) -> Arc<QueueReader> {
        Arc::new(QueueReader::new(
            self.connector.clone(),
            self.reader_options(address),
            &self.identity,
        ))
    }

    pub(crate) fn listener_reader(&self, address: QueueAddress) -> Arc<QueueReader> {
        let options = ReaderOptions {
            listener_input_queue: true,
            ..self.reader_options(address)
        };

        Arc::new(QueueReader::with_throttler(
            self.connector.clone(),
            options,
            &self.identity,
            (self.throttlers)(),
        ))
    }

    pub(crate) fn writer(&self) -> Arc<QueueWriter> {
        let options = WriterOptions {
            include_process_command_line: self.configs.include_process_command_line,
            retry: self.retry(),
        };

        Arc::new(QueueWriter::new(self.connector.clone(), options, &self.identity))
    }
}

/// Creates client channels.
pub struct ChannelFactory {
    context: Arc<TransportContext>,
    lifecycle: Lifecycle,
}

impl ChannelFactory {
    pub fn new(context: Arc<TransportContext>) -> ChannelFactory {
        ChannelFactory {
            context,
            lifecycle: Lifecycle::new("channel factory"),
        }
    }

    pub fn context(&self) -> &Arc<TransportContext> {
        &self.context
    }

    /// A duplex channel opening its session through the listener at `remote`.
    pub fn create_duplex_channel(
        &self,
        remote: &QueueAddress,
    ) -> Result<DuplexChannel, TransportError> {
        self.lifecycle.ensure_opened()?;
        Ok(DuplexChannel::client(self.context.clone(), remote.clone()))
    }

    /// A request channel sending to the listener at `remote`.
    pub fn create_request_channel(
        &self,
        remote: &QueueAddress,
    ) -> Result<RequestChannel, TransportError> {
        self.lifecycle.ensure_opened()?;
        Ok(RequestChannel::new(self.context.clone(), remote.clone()))
    }
}

#[async_trait]
impl CommunicationObject for ChannelFactory {
    fn state(&self) -> CommunicationState {
        self.lifecycle.state()
    }

    async fn open(&self, _timeout: Duration) -> Result<(), TransportError> {
        self.lifecycle.begin_open()?;
        self.lifecycle.complete_open()
    }

    /// Channels are owned by their callers and outlive the factory.
    async fn close(&self, _timeout: Duration) -> Result<(), TransportError> {
        if self.lifecycle.begin_close().is_some() {
            self.lifecycle.complete_close();
        }
        Ok(())
    }

    async fn abort(&self) {
        self.lifecycle.begin_close();
        self.lifecycle.force_close();
    }
}

/// Accepts channels on a well-known input queue.
pub struct ChannelListener {
    context: Arc<TransportContext>,
    address: QueueAddress,
    lifecycle: Lifecycle,
    reader: Arc<QueueReader>,
    ops: ConcurrentOperationTracker,
}

impl ChannelListener {
    pub fn new(context: Arc<TransportContext>, address: QueueAddress) -> ChannelListener {
        ChannelListener {
            reader: context.listener_reader(address.clone()),
            context,
            address,
            lifecycle: Lifecycle::new("channel listener"),
            ops: ConcurrentOperationTracker::new(),
        }
    }

    pub fn listen_address(&self) -> &QueueAddress {
        &self.address
    }

    /// Waits for the next session request and establishes its server channel.
    ///
    /// Returns `None` once the listener is closing. Requests that are not session
    /// requests, or whose session cannot be established, are dropped.
    pub async fn accept_duplex_channel(
        &self,
        timeout: Duration,
    ) -> Result<Option<DuplexChannel>, TransportError> {
        let Ok(_op) = self.ops.track() else {
            return Ok(None);
        };
        self.lifecycle.ensure_opened()?;

        let budget = TimeoutBudget::start(timeout);
        let cancel = self.ops.cancellation_token();

        loop {
            let dequeued = match self.reader.dequeue(&budget, cancel).await {
                Ok(dequeued) => dequeued,
                Err(TransportError::Disposed) | Err(TransportError::Cancelled) => return Ok(None),
                Err(err) => return Err(err),
            };
            let request = Message::from_dequeued(&dequeued);
            let tag = dequeued.delivery_tag;

            if request.control_action() != Some(Action::CreateSessionRequest) {
                warn!(action = ?request.action, "dropping non session message on listener queue");
                self.reader.reject_message(tag, false, &budget, cancel).await?;
                continue;
            }

            let channel = match DuplexChannel::server(self.context.clone(), &request) {
                Ok(channel) => channel,
                Err(err) => {
                    warn!(error = err.to_string(), "dropping malformed session request");
                    self.reader.reject_message(tag, false, &budget, cancel).await?;
                    continue;
                }
            };

            match channel.open(budget.remaining()).await {
                Ok(()) => {
                    self.reader.acknowledge_message(tag, &budget, cancel).await?;
                    debug!(session = channel.local_address().queue_name(), "session accepted");
                    return Ok(Some(channel));
                }
                Err(err) => {
                    warn!(error = err.to_string(), "failure to accept session");
                    self.reader.reject_message(tag, false, &budget, cancel).await?;
                    budget.check()?;
                }
            }
        }
    }

    /// A reply channel competing with its siblings for this listener's requests.
    pub fn accept_reply_channel(&self) -> Result<ReplyChannel, TransportError> {
        self.lifecycle.ensure_opened()?;
        Ok(ReplyChannel::new(self.context.clone(), self.reader.clone()))
    }

    /// Waits until the input queue holds a message.
    pub async fn wait_for_channel(&self, timeout: Duration) -> Result<bool, TransportError> {
        let Ok(_op) = self.ops.track() else {
            return Ok(false);
        };
        self.lifecycle.ensure_opened()?;

        self.reader
            .wait_for_message(&TimeoutBudget::start(timeout), self.ops.cancellation_token())
            .await
    }
}

#[async_trait]
impl CommunicationObject for ChannelListener {
    fn state(&self) -> CommunicationState {
        self.lifecycle.state()
    }

    /// Declares the input queue.
    async fn open(&self, timeout: Duration) -> Result<(), TransportError> {
        self.lifecycle.begin_open()?;

        let res = match self.ops.track() {
            Ok(_op) => {
                self.reader
                    .ensure_open(&TimeoutBudget::start(timeout), self.ops.cancellation_token())
                    .await
            }
            Err(err) => Err(err),
        };

        match res.and_then(|_| self.lifecycle.complete_open()) {
            Ok(()) => {
                debug!(queue = self.address.queue_name(), "listening");
                Ok(())
            }
            Err(err) => {
                self.lifecycle.fault(err.clone());
                self.reader.dispose().await;
                Err(err)
            }
        }
    }

    async fn close(&self, _timeout: Duration) -> Result<(), TransportError> {
        if self.lifecycle.begin_close().is_none() {
            return Ok(());
        }

        self.ops.dispose().await;
        self.reader.dispose().await;
        self.lifecycle.complete_close();
        Ok(())
    }

    async fn abort(&self) {
        self.lifecycle.begin_close();
        self.ops.dispose().await;
        self.reader.dispose().await;
        self.lifecycle.force_close();
    }
}

/// Kind of an `AnyChannel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Duplex,
    Request,
    Reply,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Any channel of the transport.
pub enum AnyChannel {
    Duplex(DuplexChannel),
    Request(RequestChannel),
    Reply(ReplyChannel),
}

impl AnyChannel {
    pub fn kind(&self) -> ChannelKind {
        match self {
            AnyChannel::Duplex(_) => ChannelKind::Duplex,
            AnyChannel::Request(_) => ChannelKind::Request,
            AnyChannel::Reply(_) => ChannelKind::Reply,
        }
    }

    fn inner(&self) -> &dyn CommunicationObject {
        match self {
            AnyChannel::Duplex(channel) => channel,
            AnyChannel::Request(channel) => channel,
            AnyChannel::Reply(channel) => channel,
        }
    }
}

impl From<DuplexChannel> for AnyChannel {
    fn from(channel: DuplexChannel) -> Self {
        AnyChannel::Duplex(channel)
    }
}

impl From<RequestChannel> for AnyChannel {
    fn from(channel: RequestChannel) -> Self {
        AnyChannel::Request(channel)
    }
}

impl From<ReplyChannel> for AnyChannel {
    fn from(channel: ReplyChannel) -> Self {
        AnyChannel::Reply(channel)
    }
}

#[async_trait]
impl CommunicationObject for AnyChannel {
    fn state(&self) -> CommunicationState {
        self.inner().state()
    }

    async fn open(&self, timeout: Duration) -> Result<(), TransportError> {
        self.inner().open(timeout).await
    }

    async fn close(&self, timeout: Duration) -> Result<(), TransportError> {
        self.inner().close(timeout).await
    }

    async fn abort(&self) {
        self.inner().abort().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::InMemoryBroker,
        throttle::{MockThrottler, ThrottleDecision},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(broker: &InMemoryBroker) -> Arc<TransportContext> {
        Arc::new(TransportContext::new(
            Arc::new(broker.clone()),
            BindingConfigs::default(),
        ))
    }

    #[tokio::test]
    async fn factory_creates_channels_only_while_open() {
        let broker = InMemoryBroker::new();
        let factory = ChannelFactory::new(context(&broker));
        let remote = QueueAddress::new("service");

        assert!(factory.create_duplex_channel(&remote).is_err());

        factory.open(Duration::from_secs(1)).await.unwrap();
        let channel = factory.create_request_channel(&remote).unwrap();
        assert_eq!(AnyChannel::from(channel).kind(), ChannelKind::Request);

        factory.close(Duration::from_secs(1)).await.unwrap();
        assert_eq!(factory.state(), CommunicationState::Closed);
        assert_eq!(
            factory.create_duplex_channel(&remote).err(),
            Some(TransportError::Disposed)
        );
    }

    #[tokio::test]
    async fn listener_declares_a_tagged_input_queue() {
        let broker = InMemoryBroker::new();
        let context = context(&broker);
        let listener = ChannelListener::new(context.clone(), context.queue_address("service"));

        listener.open(Duration::from_secs(5)).await.unwrap();

        let args = broker.queue_arguments("service").unwrap();
        assert!(args
            .inner()
            .contains_key(crate::reader::AMQP_ARGUMENT_TASK_INPUT_QUEUE));
        assert_eq!(broker.is_queue_durable("service"), Some(true));

        listener.close(Duration::from_secs(5)).await.unwrap();
        assert!(broker.queue_exists("service"));
        assert_eq!(listener.state(), CommunicationState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_the_listener_ends_a_pending_accept() {
        let broker = InMemoryBroker::new();
        let context = context(&broker);
        let listener = Arc::new(ChannelListener::new(
            context.clone(),
            context.queue_address("service"),
        ));
        listener.open(Duration::from_secs(5)).await.unwrap();

        let accepting = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept_duplex_channel(Duration::MAX).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        listener.close(Duration::from_secs(5)).await.unwrap();

        assert!(matches!(accepting.await.unwrap(), Ok(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn accept_times_out_without_requests() {
        let broker = InMemoryBroker::new();
        let context = context(&broker);
        let listener = ChannelListener::new(context.clone(), context.queue_address("service"));
        listener.open(Duration::from_secs(5)).await.unwrap();

        assert!(matches!(
            listener.accept_duplex_channel(Duration::from_secs(1)).await,
            Err(TransportError::TimedOut(_))
        ));
        assert_eq!(
            listener.wait_for_channel(Duration::from_secs(1)).await,
            Ok(false)
        );
    }

    #[tokio::test]
    async fn closing_a_listener_disposes_only_its_own_throttler() {
        let broker = InMemoryBroker::new();
        let built = Arc::new(AtomicUsize::new(0));
        let disposed = Arc::new(AtomicUsize::new(0));
        let context = {
            let built = built.clone();
            let disposed = disposed.clone();
            let context = TransportContext::new(Arc::new(broker.clone()), BindingConfigs::default())
                .with_throttler(move || {
                    built.fetch_add(1, Ordering::SeqCst);
                    let disposed = disposed.clone();
                    let mut throttler = MockThrottler::new();
                    throttler
                        .expect_throttle()
                        .returning(|_, _, _| ThrottleDecision::TakeMessage);
                    throttler.expect_dispose().times(1).returning(move || {
                        disposed.fetch_add(1, Ordering::SeqCst);
                    });
                    Arc::new(throttler) as Arc<dyn Throttler>
                });
            Arc::new(context)
        };

        let first = ChannelListener::new(context.clone(), context.queue_address("first"));
        let second = ChannelListener::new(context.clone(), context.queue_address("second"));
        assert_eq!(built.load(Ordering::SeqCst), 2);

        first.open(Duration::from_secs(5)).await.unwrap();
        second.open(Duration::from_secs(5)).await.unwrap();

        first.close(Duration::from_secs(5)).await.unwrap();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert_eq!(second.state(), CommunicationState::Opened);
        assert_eq!(
            second.wait_for_channel(Duration::from_millis(10)).await,
            Ok(false)
        );

        second.close(Duration::from_secs(5)).await.unwrap();
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }
}
