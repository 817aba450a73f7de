// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reply Channels
//!
//! Reply channels handed out by one listener compete for the requests of its
//! input queue. Each received request comes wrapped in a `RequestContext`, which
//! sends the reply to the requester's private queue and settles the request with
//! the broker according to the configured `AckMode`:
//!
//! - `BeforeReply` acknowledges as soon as the request is received, so a crash
//!   while handling it loses the request;
//! - `AfterReply` acknowledges once the reply is confirmed, so a crash redelivers
//!   the request to another channel.

use crate::{
    configs::AckMode,
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
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Server side channel answering requests from a shared input queue.
pub struct ReplyChannel {
    context: Arc<TransportContext>,
    lifecycle: Lifecycle,
    reader: Arc<QueueReader>,
    writer: Arc<QueueWriter>,
    ops: ConcurrentOperationTracker,
}

impl ReplyChannel {
    pub(crate) fn new(context: Arc<TransportContext>, reader: Arc<QueueReader>) -> ReplyChannel {
        ReplyChannel {
            lifecycle: Lifecycle::new("reply channel"),
            writer: context.writer(),
            reader,
            ops: ConcurrentOperationTracker::new(),
            context,
        }
    }

    /// Next request of the input queue.
    ///
    /// Returns `None` once this channel or its listener is closing.
    pub async fn receive_request(
        &self,
        timeout: Duration,
    ) -> Result<Option<RequestContext>, TransportError> {
        let Ok(_op) = self.ops.track() else {
            return Ok(None);
        };
        self.lifecycle.ensure_opened()?;

        let budget = TimeoutBudget::start(timeout);
        let cancel = self.ops.cancellation_token();
        let ack_mode = self.context.configs().ack_mode;

        loop {
            let dequeued = match self.reader.dequeue(&budget, cancel).await {
                Ok(dequeued) => dequeued,
                Err(TransportError::Disposed) | Err(TransportError::Cancelled) => return Ok(None),
                Err(err) => return Err(err),
            };
            let tag = dequeued.delivery_tag;
            let request = Message::from_dequeued(&dequeued);

            if let Some(action) = request.control_action() {
                warn!(action = action.as_str(), "dropping control message on request queue");
                self.reader.reject_message(tag, false, &budget, cancel).await?;
                continue;
            }

            if ack_mode == AckMode::BeforeReply {
                self.reader.acknowledge_message(tag, &budget, cancel).await?;
            }

            return Ok(Some(RequestContext {
                request,
                delivery_tag: tag,
                ack_mode,
                reader: self.reader.clone(),
                writer: self.writer.clone(),
                message_ttl: self.context.message_ttl(),
                settle_timeout: self.context.configs().send_timeout(),
                cancel: cancel.clone(),
                settled: AtomicBool::new(ack_mode == AckMode::BeforeReply),
                replied: AtomicBool::new(false),
            }));
        }
    }

    /// Waits until the input queue holds a request.
    pub async fn wait_for_request(&self, timeout: Duration) -> Result<bool, TransportError> {
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
impl CommunicationObject for ReplyChannel {
    fn state(&self) -> CommunicationState {
        self.lifecycle.state()
    }

    async fn open(&self, _timeout: Duration) -> Result<(), TransportError> {
        self.lifecycle.begin_open()?;
        self.lifecycle.complete_open()
    }

    /// Leaves the shared input queue to the listener.
    async fn close(&self, _timeout: Duration) -> Result<(), TransportError> {
        if self.lifecycle.begin_close().is_none() {
            return Ok(());
        }

        self.ops.dispose().await;
        self.writer.dispose().await;
        self.lifecycle.complete_close();
        Ok(())
    }

    async fn abort(&self) {
        self.lifecycle.begin_close();
        self.ops.dispose().await;
        self.writer.dispose().await;
        self.lifecycle.force_close();
    }
}

/// A received request waiting for its reply.
pub struct RequestContext {
    request: Message,
    delivery_tag: u64,
    ack_mode: AckMode,
    reader: Arc<QueueReader>,
    writer: Arc<QueueWriter>,
    message_ttl: Option<Duration>,
    settle_timeout: Duration,
    cancel: CancellationToken,
    /// The broker no longer holds the request for us.
    settled: AtomicBool,
    replied: AtomicBool,
}

impl RequestContext {
    pub fn request(&self) -> &Message {
        &self.request
    }

    /// Sends `message` as the reply, then settles the request.
    ///
    /// A request can be answered once. When the reply cannot be delivered the
    /// request is rejected under `AfterReply`: requeued unless the requester's
    /// queue is gone.
    pub async fn reply(
        &self,
        mut message: Message,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        if self.replied.swap(true, Ordering::AcqRel) {
            return Err(TransportError::InvalidState(
                "request was already answered".to_owned(),
            ));
        }

        let budget = TimeoutBudget::start(timeout);
        let Some(target) = self.request.reply_to.clone() else {
            self.settle(&budget).await?;
            return Err(TransportError::Communication(
                "request has no reply address".to_owned(),
            ));
        };

        message.relates_to = Some(self.request.message_id);
        message.to = Some(target.to_uri());

        let res = self
            .writer
            .enqueue(
                target.exchange_name(),
                target.queue_name(),
                &message.body,
                message.to_properties(),
                self.message_ttl,
                &budget,
                &self.cancel,
            )
            .await;

        match res {
            Ok(()) => {
                debug!(request = %self.request.message_id, "reply sent");
                self.settle(&budget).await
            }
            Err(err) => {
                warn!(error = err.to_string(), "failure to send reply");
                let requeue = !matches!(err, TransportError::RemoteQueueDoesNotExist(_));
                if let Err(settle) = self.settle_rejecting(requeue, &budget).await {
                    warn!(error = settle.to_string(), "failure to reject request");
                }
                Err(err)
            }
        }
    }

    /// Gives the request back to the queue without answering it.
    ///
    /// A no-op once the request is settled, always under `BeforeReply`.
    pub async fn abandon(&self) -> Result<(), TransportError> {
        self.replied.store(true, Ordering::Release);
        let budget = TimeoutBudget::start(self.settle_timeout);
        self.settle_rejecting(true, &budget).await
    }

    async fn settle(&self, budget: &TimeoutBudget) -> Result<(), TransportError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.reader
            .acknowledge_message(self.delivery_tag, budget, &self.cancel)
            .await
    }

    async fn settle_rejecting(
        &self,
        requeue: bool,
        budget: &TimeoutBudget,
    ) -> Result<(), TransportError> {
        if self.ack_mode == AckMode::BeforeReply || self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.reader
            .reject_message(self.delivery_tag, requeue, budget, &self.cancel)
            .await
    }
}
