// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dequeue Throttling
//!
//! Before a reader takes a message it asks its `Throttler` whether it should. A
//! throttler sees the current queue depth and consumer count and may delay its
//! answer or tell the reader to skip this round.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Verdict of a throttler for one dequeue round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    TakeMessage,
    SkipMessage,
}

/// Policy deciding whether a reader takes an available message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Throttler: Send + Sync {
    async fn throttle(
        &self,
        queue_depth: u32,
        consumer_count: u32,
        cancel: &CancellationToken,
    ) -> ThrottleDecision;

    /// Releases whatever the throttler holds; called when its reader is disposed.
    async fn dispose(&self) {}
}

/// Throttler that always takes the message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpThrottler;

#[async_trait]
impl Throttler for NoOpThrottler {
    async fn throttle(
        &self,
        _queue_depth: u32,
        _consumer_count: u32,
        _cancel: &CancellationToken,
    ) -> ThrottleDecision {
        ThrottleDecision::TakeMessage
    }
}
