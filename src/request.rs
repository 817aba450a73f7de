// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request Channels
//!
//! A `RequestChannel` sends each request to a listener's input queue and waits for
//! the reply on its own private queue. There is no session: the reply is matched
//! to the request through `relates_to`. Requests on one channel are serialized, so
//! a reply never reaches the wrong caller; replies to requests that already timed
//! out are acknowledged and dropped.

use crate::{
    address::QueueAddress,
    errors::TransportError,
    factory::TransportContext,
    lifecycle::{CommunicationObject, CommunicationState, Lifecycle},
    message::Message,
    reader::QueueReader,
    timeout::TimeoutBudget,
    tracker::ConcurrentOperationTracker,
    writer::QueueWriter,
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct RequestChannel {
    context: Arc<TransportContext>,
    lifecycle: Lifecycle,
    remote: QueueAddress,
    local: QueueAddress,
    reader: Arc<QueueReader>,
    writer: Arc<QueueWriter>,
    ops: ConcurrentOperationTracker,
    in_flight: Mutex<()>,
}

impl RequestChannel {
    pub(crate) fn new(context: Arc<TransportContext>, remote: QueueAddress) -> RequestChannel {
        let local = context.private_address();

        RequestChannel {
            lifecycle: Lifecycle::new("request channel"),
            reader: context.session_reader(local.clone()),
            writer: context.writer(),
            remote,
            local,
            ops: ConcurrentOperationTracker::new(),
            in_flight: Mutex::new(()),
            context,
        }
    }

    pub fn remote_address(&self) -> &QueueAddress {
        &self.remote
    }

    /// Private queue replies arrive on.
    pub fn local_address(&self) -> &QueueAddress {
        &self.local
    }

    /// Sends `message` and waits for its reply within `timeout`.
    pub async fn request(
        &self,
        mut message: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let _op = self.ops.track()?;
        self.lifecycle.ensure_opened()?;

        let budget = TimeoutBudget::start(timeout);
        let cancel = self.ops.cancellation_token();

        let _turn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Disposed),
            turn = self.in_flight.lock() => turn,
            _ = tokio::time::sleep(budget.remaining()) => {
                return Err(TransportError::TimedOut(budget.total()))
            }
        };

        message.from = Some(self.local.to_uri());
        message.to = Some(self.remote.to_uri());
        message.reply_to = Some(self.local.clone());
        let request_id = message.message_id;

        self.writer
            .enqueue(
                self.remote.exchange_name(),
                self.remote.queue_name(),
                &message.body,
                message.to_properties(),
                self.request_ttl(&budget),
                &budget,
                cancel,
            )
            .await
            .map_err(|err| self.diagnose(err))?;

        self.await_reply(request_id, &budget, cancel)
            .await
            .map_err(|err| self.diagnose(err))
    }

    async fn await_reply(
        &self,
        request_id: uuid::Uuid,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<Message, TransportError> {
        loop {
            let dequeued = self.reader.dequeue(budget, cancel).await?;
            self.reader
                .acknowledge_message(dequeued.delivery_tag, budget, cancel)
                .await?;

            let reply = Message::from_dequeued(&dequeued);
            if reply.relates_to == Some(request_id) {
                debug!(request = %request_id, "reply received");
                return Ok(reply);
            }
            warn!(relates_to = ?reply.relates_to, "dropping stale reply");
        }
    }

    /// A request nobody answers in time should not outlive its caller.
    fn request_ttl(&self, budget: &TimeoutBudget) -> Option<Duration> {
        let configured = self.context.message_ttl();
        if budget.is_infinite() {
            return configured;
        }

        let total = budget.total();
        Some(configured.map_or(total, |ttl| ttl.min(total)))
    }

    fn diagnose(&self, err: TransportError) -> TransportError {
        match err {
            TransportError::Cancelled if self.ops.is_disposed() => TransportError::Disposed,
            err => err,
        }
    }

    async fn release(&self) {
        self.ops.dispose().await;
        futures_util::join!(self.reader.dispose(), self.writer.dispose());
    }
}

#[async_trait]
impl CommunicationObject for RequestChannel {
    fn state(&self) -> CommunicationState {
        self.lifecycle.state()
    }

    /// Declares the reply queue and connects the writer.
    async fn open(&self, timeout: Duration) -> Result<(), TransportError> {
        self.lifecycle.begin_open()?;
        let budget = TimeoutBudget::start(timeout);

        let res = match self.ops.track() {
            Ok(_op) => {
                let cancel = self.ops.cancellation_token();
                let (read, write) = futures_util::join!(
                    self.reader.ensure_open(&budget, cancel),
                    self.writer.ensure_open(&budget, cancel)
                );
                read.and(write)
            }
            Err(err) => Err(err),
        };

        match res.and_then(|_| self.lifecycle.complete_open()) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.lifecycle.fault(err.clone());
                self.release().await;
                Err(err)
            }
        }
    }

    async fn close(&self, _timeout: Duration) -> Result<(), TransportError> {
        if self.lifecycle.begin_close().is_none() {
            return Ok(());
        }

        self.release().await;
        self.lifecycle.complete_close();
        Ok(())
    }

    async fn abort(&self) {
        self.lifecycle.begin_close();
        self.release().await;
        self.lifecycle.force_close();
    }
}
