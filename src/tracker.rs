// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Concurrent Operation Tracking
//!
//! Every long running operation of a reader, writer or channel registers itself with
//! the component's `ConcurrentOperationTracker`. Disposing the tracker refuses new
//! operations, fires the tracker's cancellation token and then waits until every
//! operation already registered has released its handle. Only then may the owner
//! release the broker resources those operations were using.

use crate::errors::TransportError;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
struct TrackerState {
    live: usize,
    disposed: bool,
}

/// Reference counted guard over in-flight operations.
#[derive(Debug)]
pub struct ConcurrentOperationTracker {
    state: Arc<watch::Sender<TrackerState>>,
    cancel: CancellationToken,
}

impl Default for ConcurrentOperationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrentOperationTracker {
    pub fn new() -> ConcurrentOperationTracker {
        let (state, _) = watch::channel(TrackerState::default());

        ConcurrentOperationTracker {
            state: Arc::new(state),
            cancel: CancellationToken::new(),
        }
    }

    /// Registers a new operation.
    ///
    /// Fails with `Disposed` once disposal has started.
    pub fn track(&self) -> Result<OperationHandle, TransportError> {
        let mut accepted = false;
        self.state.send_if_modified(|state| {
            if state.disposed {
                return false;
            }
            state.live += 1;
            accepted = true;
            true
        });

        if !accepted {
            return Err(TransportError::Disposed);
        }

        Ok(OperationHandle {
            state: self.state.clone(),
            released: AtomicBool::new(false),
        })
    }

    /// Fires exactly once, when disposal begins.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn live_operations(&self) -> usize {
        self.state.borrow().live
    }

    pub fn is_disposed(&self) -> bool {
        self.state.borrow().disposed
    }

    /// Refuses new operations, cancels the running ones and waits for them to drain.
    ///
    /// Calling it again is a no-op that still waits for the drain.
    pub async fn dispose(&self) {
        self.state.send_if_modified(|state| {
            if state.disposed {
                return false;
            }
            state.disposed = true;
            true
        });
        self.cancel.cancel();

        let mut rx = self.state.subscribe();
        let live = rx.borrow().live;
        if live > 0 {
            debug!(live, "waiting for in-flight operations to drain");
        }

        // the sender lives as long as `self`, so this only ends when drained
        let _ = rx.wait_for(|state| state.live == 0).await;
    }

    /// Token fired by either this tracker or `caller`.
    pub fn link(&self, caller: &CancellationToken) -> LinkedToken {
        LinkedToken::new(&self.cancel, caller)
    }
}

/// Registration of one running operation.
///
/// Releasing is idempotent and also happens on drop.
#[derive(Debug)]
pub struct OperationHandle {
    state: Arc<watch::Sender<TrackerState>>,
    released: AtomicBool,
}

impl OperationHandle {
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        self.state.send_modify(|state| state.live -= 1);
    }
}

impl Drop for OperationHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Cancellation token linked to a component token and a caller token.
///
/// Fires when either source fires. Dropping it stops the relay task.
#[derive(Debug)]
pub struct LinkedToken {
    token: CancellationToken,
    _guard: DropGuard,
}

impl LinkedToken {
    pub fn new(component: &CancellationToken, caller: &CancellationToken) -> LinkedToken {
        let token = component.child_token();

        if caller.is_cancelled() {
            token.cancel();
        } else {
            let relay = token.clone();
            let caller = caller.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = caller.cancelled() => relay.cancel(),
                    _ = relay.cancelled() => {}
                }
            });
        }

        LinkedToken {
            _guard: token.clone().drop_guard(),
            token,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test]
    async fn dispose_returns_immediately_without_operations() {
        let tracker = ConcurrentOperationTracker::new();
        tracker.dispose().await;

        assert!(tracker.is_disposed());
        assert!(tracker.cancellation_token().is_cancelled());
        assert_eq!(tracker.track().unwrap_err(), TransportError::Disposed);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_waits_for_every_handle() {
        let tracker = Arc::new(ConcurrentOperationTracker::new());
        let started = Instant::now();

        for i in 1..=3u64 {
            let handle = tracker.track().unwrap();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(i)).await;
                handle.release();
            });
        }
        assert_eq!(tracker.live_operations(), 3);

        tracker.dispose().await;

        assert_eq!(tracker.live_operations(), 0);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn release_and_dispose_are_idempotent() {
        let tracker = ConcurrentOperationTracker::new();
        let first = tracker.track().unwrap();
        let second = tracker.track().unwrap();

        first.release();
        first.release();
        drop(first);
        assert_eq!(tracker.live_operations(), 1);

        drop(second);
        tracker.dispose().await;
        tracker.dispose().await;
        assert_eq!(tracker.live_operations(), 0);
    }

    #[tokio::test]
    async fn dispose_signals_running_operations() {
        let tracker = Arc::new(ConcurrentOperationTracker::new());
        let handle = tracker.track().unwrap();
        let token = tracker.cancellation_token().clone();

        let worker = tokio::spawn(async move {
            token.cancelled().await;
            handle.release();
        });

        tracker.dispose().await;
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn linked_token_follows_either_source() {
        let tracker = ConcurrentOperationTracker::new();
        let caller = CancellationToken::new();

        let linked = tracker.link(&caller);
        caller.cancel();
        linked.token().cancelled().await;

        let other = tracker.link(&CancellationToken::new());
        assert!(!other.token().is_cancelled());
        tracker.dispose().await;
        assert!(other.token().is_cancelled());
    }
}
