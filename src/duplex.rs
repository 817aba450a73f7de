// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Duplex Session Channels
//!
//! A duplex session links two private queues, one per side:
//!
//! 1. The client declares its queue and sends `CreateSessionRequest` to the
//!    listener's input queue, advertising its queue as reply-to and abort topic.
//! 2. The listener creates a server channel. It declares the server's session
//!    queue and answers `CreateSessionResponse` from there.
//! 3. Each side then sends to the other's session queue and receives on its own.
//!
//! Closing is asymmetric. The client sends `CloseSessionRequest` and waits for
//! `CloseSessionResponse`; a server closing first sends `InputSessionClosingRequest`
//! and does not wait. The side told about a close keeps delivering what is already
//! queued and reports the end of the session once its queue is empty, so nothing
//! sent before the close is lost.
//!
//! Aborting notifies the peer's abort topic with `AbortSession` in the background
//! and releases everything at once.

use crate::{
    address::QueueAddress,
    errors::TransportError,
    factory::TransportContext,
    lifecycle::{CommunicationObject, CommunicationState, Lifecycle},
    message::{Action, Message},
    reader::QueueReader,
    timeout::TimeoutBudget,
    tracker::ConcurrentOperationTracker,
    writer::QueueWriter,
};
use async_trait::async_trait;
use std::{
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const REMOTE_CLOSED: &str = "remote session was closed";
const REMOTE_ABORTED: &str = "remote session was aborted";

/// Which end of the session a channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Default)]
struct Session {
    /// The peer announced it sends nothing more.
    remote_closed: bool,
    /// Id of the peer's `CloseSessionRequest`, answered when closing.
    close_request: Option<Uuid>,
    remote_aborted: bool,
    end_of_session: bool,
}

/// One end of a duplex session.
pub struct DuplexChannel {
    role: Role,
    context: Arc<TransportContext>,
    lifecycle: Lifecycle,
    local: QueueAddress,
    /// Listener input queue the client opens its session through.
    listener: Option<QueueAddress>,
    /// `CreateSessionRequest` a server channel answers.
    handshake: Option<Uuid>,
    remote: OnceLock<QueueAddress>,
    remote_abort_topic: OnceLock<QueueAddress>,
    reader: Arc<QueueReader>,
    writer: Arc<QueueWriter>,
    ops: ConcurrentOperationTracker,
    session: Mutex<Session>,
}

impl DuplexChannel {
    /// A client channel opening sessions through `listener`.
    pub(crate) fn client(context: Arc<TransportContext>, listener: QueueAddress) -> DuplexChannel {
        DuplexChannel::build(Role::Client, context, Some(listener), None)
    }

    /// The server end of the session `request` asks for.
    pub(crate) fn server(
        context: Arc<TransportContext>,
        request: &Message,
    ) -> Result<DuplexChannel, TransportError> {
        let remote = request.reply_to.clone().ok_or_else(|| {
            TransportError::Communication("session request without reply address".to_owned())
        })?;
        let abort_topic = request.abort_topic.clone().unwrap_or_else(|| remote.clone());

        let channel = DuplexChannel::build(Role::Server, context, None, Some(request.message_id));
        let _ = channel.remote.set(remote);
        let _ = channel.remote_abort_topic.set(abort_topic);
        Ok(channel)
    }

    fn build(
        role: Role,
        context: Arc<TransportContext>,
        listener: Option<QueueAddress>,
        handshake: Option<Uuid>,
    ) -> DuplexChannel {
        let local = context.private_address();

        DuplexChannel {
            role,
            lifecycle: Lifecycle::new(match role {
                Role::Client => "client duplex channel",
                Role::Server => "server duplex channel",
            }),
            reader: context.session_reader(local.clone()),
            writer: context.writer(),
            local,
            listener,
            handshake,
            remote: OnceLock::new(),
            remote_abort_topic: OnceLock::new(),
            ops: ConcurrentOperationTracker::new(),
            session: Mutex::new(Session::default()),
            context,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The session queue this channel receives on.
    pub fn local_address(&self) -> &QueueAddress {
        &self.local
    }

    /// The peer's session queue, known once the session is established.
    pub fn remote_address(&self) -> Option<&QueueAddress> {
        self.remote.get()
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remote(&self) -> Result<QueueAddress, TransportError> {
        self.remote
            .get()
            .cloned()
            .ok_or_else(|| TransportError::InvalidState("session is not established".to_owned()))
    }

    /// Sends `message` to the peer.
    pub async fn send(&self, message: Message, timeout: Duration) -> Result<(), TransportError> {
        let _op = self.ops.track()?;
        self.lifecycle.ensure_opened()?;
        if self.session().remote_closed {
            return Err(TransportError::Communication(REMOTE_CLOSED.to_owned()));
        }

        let remote = self.remote()?;
        let budget = TimeoutBudget::start(timeout);

        match self
            .publish(&remote, message, &budget, self.ops.cancellation_token())
            .await
        {
            Err(err @ TransportError::RemoteQueueDoesNotExist(_)) => {
                warn!(queue = remote.queue_name(), "remote session queue is gone");
                self.lifecycle.fault(err.clone());
                Err(err)
            }
            res => res.map_err(|err| self.diagnose(err)),
        }
    }

    /// Next data message of the session.
    ///
    /// `None` means the peer closed the session and everything it sent before
    /// closing was delivered.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        let _op = self.ops.track()?;
        if self.session().end_of_session {
            return Ok(None);
        }
        self.lifecycle.ensure_opened()?;

        let budget = TimeoutBudget::start(timeout);
        let cancel = self.ops.cancellation_token();

        loop {
            let remote_closed = self.session().remote_closed;
            if remote_closed
                && self
                    .reader
                    .message_count(&budget, cancel)
                    .await
                    .map_err(|err| self.diagnose(err))?
                    == 0
            {
                return Ok(self.end_session());
            }

            let message = self
                .take(&budget, cancel)
                .await
                .map_err(|err| self.diagnose(err))?;
            let Some(action) = message.control_action() else {
                return Ok(Some(message));
            };

            match action {
                Action::CloseSessionRequest => {
                    debug!("peer requested to close the session");
                    let mut session = self.session();
                    session.remote_closed = true;
                    session.close_request = Some(message.message_id);
                }
                Action::InputSessionClosingRequest => {
                    debug!("peer closed its end of the session");
                    self.session().remote_closed = true;
                }
                Action::AbortSession => {
                    let err = TransportError::Communication(REMOTE_ABORTED.to_owned());
                    self.session().remote_aborted = true;
                    self.lifecycle.fault(err.clone());
                    self.reader.soft_close();
                    return Err(err);
                }
                Action::KeepAlive => {}
                action => warn!(action = action.as_str(), "ignoring unexpected control message"),
            }
        }
    }

    /// Waits until a receive would not block.
    pub async fn wait_for_message(&self, timeout: Duration) -> Result<bool, TransportError> {
        let _op = self.ops.track()?;
        {
            // a receive returns right away once the peer closed
            let session = self.session();
            if session.end_of_session || session.remote_closed {
                return Ok(true);
            }
        }
        self.lifecycle.ensure_opened()?;

        self.reader
            .wait_for_message(&TimeoutBudget::start(timeout), self.ops.cancellation_token())
            .await
    }

    /// Closing the channel explains a cancellation better than the cancellation itself.
    fn diagnose(&self, err: TransportError) -> TransportError {
        match err {
            TransportError::Cancelled if self.ops.is_disposed() => TransportError::Disposed,
            err => err,
        }
    }

    fn end_session(&self) -> Option<Message> {
        self.session().end_of_session = true;
        self.reader.soft_close();

        if self.role == Role::Client {
            self.lifecycle
                .fault(TransportError::Communication(REMOTE_CLOSED.to_owned()));
        }
        None
    }

    /// Dequeues, decodes and acknowledges the next message.
    async fn take(
        &self,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<Message, TransportError> {
        let dequeued = self.reader.dequeue(budget, cancel).await?;
        self.reader
            .acknowledge_message(dequeued.delivery_tag, budget, cancel)
            .await?;
        Ok(Message::from_dequeued(&dequeued))
    }

    fn stamp(&self, target: &QueueAddress, mut message: Message) -> Message {
        message.from = Some(self.local.to_uri());
        message.to = Some(target.to_uri());
        message
    }

    async fn publish(
        &self,
        target: &QueueAddress,
        message: Message,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let message = self.stamp(target, message);

        self.writer
            .enqueue(
                target.exchange_name(),
                target.queue_name(),
                &message.body,
                message.to_properties(),
                self.context.message_ttl(),
                budget,
                cancel,
            )
            .await
    }

    async fn open_client(
        &self,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let listener = self.listener.clone().ok_or_else(|| {
            TransportError::InvalidState("client channel without listener address".to_owned())
        })?;

        self.reader.ensure_open(budget, cancel).await?;

        let request = Message::control(Action::CreateSessionRequest)
            .replying_to(&self.local)
            .with_abort_topic(&self.local);
        let request_id = request.message_id;
        self.publish(&listener, request, budget, cancel).await?;

        loop {
            let message = self.take(budget, cancel).await?;
            if message.control_action() != Some(Action::CreateSessionResponse)
                || message.relates_to != Some(request_id)
            {
                warn!(action = ?message.action, "dropping message received while opening");
                continue;
            }

            let remote = message.reply_to.ok_or_else(|| {
                TransportError::Communication("session response without reply address".to_owned())
            })?;
            let abort_topic = message.abort_topic.unwrap_or_else(|| remote.clone());

            debug!(remote = remote.queue_name(), "session established");
            let _ = self.remote.set(remote);
            let _ = self.remote_abort_topic.set(abort_topic);
            return Ok(());
        }
    }

    async fn open_server(
        &self,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        // the client may send as soon as it has the response
        self.reader.ensure_open(budget, cancel).await?;

        let mut response = Message::control(Action::CreateSessionResponse)
            .replying_to(&self.local)
            .with_abort_topic(&self.local);
        response.relates_to = self.handshake;

        self.publish(&self.remote()?, response, budget, cancel).await
    }

    async fn close_client(
        &self,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        {
            let session = self.session();
            if session.remote_closed || session.remote_aborted {
                return Ok(());
            }
        }

        let remote = self.remote()?;

        // a server that closed first left its notice in our queue and may
        // already have deleted its own
        while self.reader.message_count(budget, cancel).await? > 0 {
            let message = self.take(budget, cancel).await?;
            if let Some(res) = self.closing_reply(&remote, message, budget, cancel).await {
                return res;
            }
        }

        let request = Message::control(Action::CloseSessionRequest);
        if !self.publish_closing(&remote, request, budget, cancel).await? {
            return Ok(());
        }

        loop {
            let message = self.take(budget, cancel).await?;
            if let Some(res) = self.closing_reply(&remote, message, budget, cancel).await {
                return res;
            }
        }
    }

    /// Handles one message received while the client closes; `Some` ends the close.
    async fn closing_reply(
        &self,
        remote: &QueueAddress,
        message: Message,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Option<Result<(), TransportError>> {
        match message.control_action() {
            Some(Action::CloseSessionResponse) => Some(Ok(())),
            Some(Action::CloseSessionRequest) => {
                let response =
                    Message::control(Action::CloseSessionResponse).relating_to(message.message_id);
                Some(
                    self.publish_closing(remote, response, budget, cancel)
                        .await
                        .map(|_| ()),
                )
            }
            Some(Action::InputSessionClosingRequest) => {
                debug!("peer closed its end of the session first");
                self.session().remote_closed = true;
                Some(Ok(()))
            }
            Some(Action::AbortSession) => {
                debug!("peer aborted the session while closing");
                self.session().remote_aborted = true;
                Some(Ok(()))
            }
            Some(Action::KeepAlive) => None,
            _ => {
                warn!(action = ?message.action, "dropping message received while closing");
                None
            }
        }
    }

    async fn close_server(
        &self,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let close_request = {
            let session = self.session();
            if session.remote_aborted {
                return Ok(());
            }
            session.close_request
        };

        let message = match close_request {
            Some(id) => Message::control(Action::CloseSessionResponse).relating_to(id),
            None => Message::control(Action::InputSessionClosingRequest),
        };

        self.publish_closing(&self.remote()?, message, budget, cancel)
            .await
            .map(|_| ())
    }

    /// Publishes a close handshake message; `false` when the peer's queue is already gone.
    async fn publish_closing(
        &self,
        remote: &QueueAddress,
        message: Message,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<bool, TransportError> {
        match self.publish(remote, message, budget, cancel).await {
            Ok(()) => Ok(true),
            Err(TransportError::RemoteQueueDoesNotExist(queue)) => {
                debug!(queue, "peer session queue is gone, session already closed");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn release(&self) {
        futures_util::join!(self.reader.dispose(), self.writer.dispose());
    }
}

#[async_trait]
impl CommunicationObject for DuplexChannel {
    fn state(&self) -> CommunicationState {
        self.lifecycle.state()
    }

    /// Establishes the session within `timeout`.
    ///
    /// On failure the channel is Faulted and its resources are released.
    async fn open(&self, timeout: Duration) -> Result<(), TransportError> {
        self.lifecycle.begin_open()?;
        let budget = TimeoutBudget::start(timeout);

        let res = match self.ops.track() {
            Ok(_op) => {
                let cancel = self.ops.cancellation_token();
                match self.role {
                    Role::Client => self.open_client(&budget, cancel).await,
                    Role::Server => self.open_server(&budget, cancel).await,
                }
            }
            Err(err) => Err(err),
        };

        match res.and_then(|_| self.lifecycle.complete_open()) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = err.to_string(), "failure to open duplex channel");
                self.lifecycle.fault(err.clone());
                self.release().await;
                Err(err)
            }
        }
    }

    /// Ends the session gracefully, then releases the queues and connections.
    ///
    /// Resources are released and the channel ends Closed even when the close
    /// handshake fails; the failure is returned.
    async fn close(&self, timeout: Duration) -> Result<(), TransportError> {
        let Some(previous) = self.lifecycle.begin_close() else {
            return Ok(());
        };

        match previous {
            CommunicationState::Opened => {}
            CommunicationState::Created => {
                self.ops.dispose().await;
                self.release().await;
                self.lifecycle.complete_close();
                return Ok(());
            }
            CommunicationState::Faulted => {
                self.ops.dispose().await;
                self.release().await;
                return Ok(());
            }
            _ => {
                self.abort().await;
                return Ok(());
            }
        }

        // pending receives would compete with the handshake for the reply
        self.ops.dispose().await;

        let budget = TimeoutBudget::start(timeout);
        let cancel = CancellationToken::new();
        let res = match self.role {
            Role::Client => self.close_client(&budget, &cancel).await,
            Role::Server => self.close_server(&budget, &cancel).await,
        };

        if let Err(err) = &res {
            warn!(error = err.to_string(), "duplex close handshake failed");
        }

        self.release().await;
        self.lifecycle.complete_close();
        res
    }

    async fn abort(&self) {
        let previous = self.lifecycle.begin_close();
        if previous.is_none() && self.lifecycle.state() == CommunicationState::Closed {
            return;
        }

        self.ops.dispose().await;
        self.reader.dispose().await;

        let remote_aborted = self.session().remote_aborted;
        let notify = match (previous, self.remote_abort_topic.get()) {
            (Some(CommunicationState::Opened), Some(topic)) if !remote_aborted => Some(topic.clone()),
            _ => None,
        };

        match notify {
            Some(topic) => {
                let message = self.stamp(&topic, Message::control(Action::AbortSession));
                let writer = self.writer.clone();
                let ttl = self.context.message_ttl();
                let budget = TimeoutBudget::start(self.context.configs().abort_notification_timeout());

                tokio::spawn(async move {
                    let res = writer
                        .enqueue(
                            topic.exchange_name(),
                            topic.queue_name(),
                            &message.body,
                            message.to_properties(),
                            ttl,
                            &budget,
                            &CancellationToken::new(),
                        )
                        .await;

                    match res {
                        Ok(()) => debug!(topic = topic.queue_name(), "peer notified of abort"),
                        Err(err) if err.is_expected_on_abort() => {
                            debug!(error = err.to_string(), "abort notification not delivered")
                        }
                        Err(err) => warn!(error = err.to_string(), "failure to notify abort"),
                    }
                    writer.dispose().await;
                });
            }
            None => self.writer.dispose().await,
        }

        self.lifecycle.force_close();
    }
}
