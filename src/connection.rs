// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient Broker Connection
//!
//! `BrokerConnection` owns at most one live connection/channel pair and serializes
//! every use of it behind a lock. Each `perform_action` call:
//!
//! 1. acquires the lock within the caller's budget and cancellation;
//! 2. reconnects when there is no pair or the pair was found closed, running the
//!    owner's `ChannelInitializer` on every fresh pair;
//! 3. runs the action, tearing the pair down and retrying after a capped backoff
//!    when the action fails with a transient error;
//! 4. releases the lock on every exit path.
//!
//! Non-transient errors are returned at once. A caller running out of budget or
//! cancelled mid-action gets its error without touching the pair, so deliveries
//! other callers hold on it stay valid. Connect and initialization failures
//! are retried until the budget runs out or the token fires.

use crate::{
    broker::{BrokerChannel, BrokerConnector},
    errors::TransportError,
    timeout::{sleep_or_cancel, TimeoutBudget},
};
use async_trait::async_trait;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Budget for the queue deletion performed at dispose when no pair is live.
const DELETE_ON_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff between attempts: doubles from `initial_delay` up to `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_delay(max_delay: Duration) -> RetryPolicy {
        RetryPolicy {
            max_delay,
            ..RetryPolicy::default()
        }
    }

    /// Delay before retry number `attempt` (starting at 1), clamped to the budget.
    pub fn delay(&self, attempt: u32, budget: &TimeoutBudget) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        budget.remaining_capped(delay)
    }
}

/// Owner specific setup run on every fresh connection/channel pair.
#[async_trait]
pub trait ChannelInitializer: Send + Sync {
    async fn initialize(&self, channel: &dyn BrokerChannel) -> Result<(), TransportError>;
}

/// Initializer for pairs that need no setup.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInitialization;

#[async_trait]
impl ChannelInitializer for NoInitialization {
    async fn initialize(&self, _channel: &dyn BrokerChannel) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Options of a `BrokerConnection`.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub retry: RetryPolicy,
    /// Queue deleted when the connection is disposed.
    pub delete_queue_on_close: Option<String>,
}

type Pair = Option<Arc<dyn BrokerChannel>>;

/// Lazily (re)established, lock protected connection/channel pair.
pub struct BrokerConnection {
    connector: Arc<dyn BrokerConnector>,
    initializer: Arc<dyn ChannelInitializer>,
    options: ConnectionOptions,
    pair: Mutex<Pair>,
    connected_once: AtomicBool,
    disposed: AtomicBool,
}

impl BrokerConnection {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        initializer: Arc<dyn ChannelInitializer>,
        options: ConnectionOptions,
    ) -> BrokerConnection {
        BrokerConnection {
            connector,
            initializer,
            options,
            pair: Mutex::new(None),
            connected_once: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Establishes the pair without running an action.
    pub async fn ensure_connected(
        &self,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let mut guard = self.lock(budget, cancel).await?;
        self.connected(&mut guard, budget, cancel).await.map(|_| ())
    }

    /// Runs `action` on the live pair, reconnecting and retrying on transient failures.
    pub async fn perform_action<T, F, Fut>(
        &self,
        action: F,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<T, TransportError>
    where
        F: Fn(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut guard = self.lock(budget, cancel).await?;
        let mut attempt = 0;

        loop {
            let channel = self.connected(&mut guard, budget, cancel).await?;

            let err = match budget.run(action(channel), cancel).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            // a caller giving up leaves the pair alone: other callers still hold
            // deliveries on it, and `connected` replaces it once it is found closed
            match err {
                err if err.is_transient() => {
                    attempt += 1;
                    warn!(
                        error = err.to_string(),
                        attempt, "transient broker failure, reconnecting"
                    );
                    Self::teardown(&mut guard).await;

                    budget.check()?;
                    sleep_or_cancel(self.options.retry.delay(attempt, budget), cancel).await?;
                    budget.check()?;
                }
                err => return Err(err),
            }
        }
    }

    /// Deletes the configured queue, then closes the pair.
    ///
    /// Errors are logged, never returned. Later calls are no-ops.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut guard = self.pair.lock().await;

        if let Some(queue) = &self.options.delete_queue_on_close {
            let live = match guard.as_ref() {
                Some(channel) if channel.is_open() => Some(channel.clone()),
                _ => None,
            };

            // a queue is only ever declared on a pair that came up
            let res = match live {
                Some(channel) => Some(channel.delete_queue(queue).await),
                None if self.connected_once.load(Ordering::Acquire) => {
                    Some(self.delete_on_fresh_pair(queue).await)
                }
                None => None,
            };

            match res {
                Some(Ok(())) => debug!(queue, "queue deleted on close"),
                Some(Err(err)) => {
                    warn!(error = err.to_string(), queue, "failure to delete queue on close")
                }
                None => {}
            }
        }

        Self::teardown(&mut guard).await;
    }

    async fn delete_on_fresh_pair(&self, queue: &str) -> Result<(), TransportError> {
        let budget = TimeoutBudget::start(DELETE_ON_CLOSE_TIMEOUT);
        let cancel = CancellationToken::new();

        let channel = budget.run(self.connector.connect(), &cancel).await?;
        let res = budget.run(channel.delete_queue(queue), &cancel).await;
        let _ = channel.close().await;
        res
    }

    async fn lock(
        &self,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, Pair>, TransportError> {
        if self.is_disposed() {
            return Err(TransportError::Disposed);
        }

        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            guard = self.pair.lock() => guard,
            _ = tokio::time::sleep(budget.remaining()) => {
                return Err(TransportError::TimedOut(budget.total()))
            }
        };

        // dispose may have won the race for the lock
        if self.is_disposed() {
            return Err(TransportError::Disposed);
        }

        Ok(guard)
    }

    /// Returns the live pair, connecting first when there is none.
    async fn connected(
        &self,
        guard: &mut MutexGuard<'_, Pair>,
        budget: &TimeoutBudget,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        if let Some(channel) = guard.as_ref() {
            if channel.is_open() {
                return Ok(channel.clone());
            }
            debug!("broker channel found closed");
            Self::teardown(guard).await;
        }

        let mut attempt = 0;
        loop {
            match budget.run(self.connect_and_initialize(), cancel).await {
                Ok(channel) => {
                    self.connected_once.store(true, Ordering::Release);
                    **guard = Some(channel.clone());
                    return Ok(channel);
                }
                Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
                Err(TransportError::TimedOut(total)) => return Err(TransportError::TimedOut(total)),
                Err(err) => {
                    attempt += 1;
                    error!(error = err.to_string(), attempt, "failure to establish broker channel");

                    budget.check()?;
                    sleep_or_cancel(self.options.retry.delay(attempt, budget), cancel).await?;
                    budget.check()?;
                }
            }
        }
    }

    async fn connect_and_initialize(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let channel: Arc<dyn BrokerChannel> = Arc::from(self.connector.connect().await?);

        if let Err(err) = self.initializer.initialize(channel.as_ref()).await {
            // never keep a half initialized pair around
            let _ = channel.close().await;
            return Err(err);
        }

        Ok(channel)
    }

    async fn teardown(guard: &mut MutexGuard<'_, Pair>) {
        if let Some(channel) = guard.take() {
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "error closing broker channel");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{ConfirmSlot, QueueInfo, QueueOptions},
        memory::InMemoryBroker,
    };
    use lapin::types::FieldTable;
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    fn connection(broker: &InMemoryBroker, options: ConnectionOptions) -> BrokerConnection {
        BrokerConnection::new(
            Arc::new(broker.clone()),
            Arc::new(NoInitialization),
            options,
        )
    }

    async fn declare(channel: Arc<dyn BrokerChannel>) -> Result<QueueInfo, TransportError> {
        channel
            .declare_queue("work", QueueOptions::default(), FieldTable::default())
            .await
    }

    #[test]
    fn retry_delay_doubles_and_is_capped() {
        let policy = RetryPolicy::default();
        let budget = TimeoutBudget::infinite();

        assert_eq!(policy.delay(1, &budget), Duration::from_millis(100));
        assert_eq!(policy.delay(3, &budget), Duration::from_millis(400));
        assert_eq!(policy.delay(40, &budget), Duration::from_secs(5));

        let short = TimeoutBudget::start(Duration::from_millis(50));
        assert!(policy.delay(1, &short) <= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn connects_lazily_and_reuses_the_pair() {
        let broker = InMemoryBroker::new();
        let conn = connection(&broker, ConnectionOptions::default());
        let budget = TimeoutBudget::infinite();
        let cancel = CancellationToken::new();

        assert_eq!(broker.connects(), 0);
        conn.perform_action(declare, &budget, &cancel).await.unwrap();
        conn.perform_action(declare, &budget, &cancel).await.unwrap();
        assert_eq!(broker.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_the_pair_was_closed() {
        let broker = InMemoryBroker::new();
        let conn = connection(&broker, ConnectionOptions::default());
        let budget = TimeoutBudget::start(Duration::from_secs(30));
        let cancel = CancellationToken::new();

        conn.perform_action(declare, &budget, &cancel).await.unwrap();
        broker.sever_connections();

        conn.perform_action(declare, &budget, &cancel).await.unwrap();
        assert_eq!(broker.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_action_failures_are_retried() {
        let broker = InMemoryBroker::new();
        let conn = connection(&broker, ConnectionOptions::default());
        let budget = TimeoutBudget::start(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let res = conn
            .perform_action(
                |_channel| {
                    let call = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        match call {
                            0 => Err(TransportError::TransientBroker("reset".into())),
                            _ => Ok(call),
                        }
                    }
                },
                &budget,
                &cancel,
            )
            .await;

        assert_eq!(res, Ok(1));
        assert_eq!(broker.connects(), 2);
    }

    #[tokio::test]
    async fn fatal_action_failures_surface_immediately() {
        let broker = InMemoryBroker::new();
        let conn = connection(&broker, ConnectionOptions::default());
        let calls = AtomicU32::new(0);

        let res: Result<(), _> = conn
            .perform_action(
                |_channel| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TransportError::Broker("access refused".into())) }
                },
                &TimeoutBudget::infinite(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(res, Err(TransportError::Broker("access refused".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_action_keeps_deliveries_of_the_pair() {
        let broker = InMemoryBroker::new();
        let conn = connection(&broker, ConnectionOptions::default());
        let budget = TimeoutBudget::start(Duration::from_secs(5));
        let cancel = CancellationToken::new();

        conn.perform_action(declare, &budget, &cancel).await.unwrap();
        conn.perform_action(
            |channel| async move {
                channel
                    .publish("", "work", b"job", lapin::BasicProperties::default())
                    .await
                    .map(|_slot: ConfirmSlot| ())
            },
            &budget,
            &cancel,
        )
        .await
        .unwrap();
        let delivery = conn
            .perform_action(
                |channel| async move { channel.get("work").await },
                &budget,
                &cancel,
            )
            .await
            .unwrap()
            .unwrap();

        let res = conn
            .perform_action(
                |_channel| async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(())
                },
                &TimeoutBudget::start(Duration::from_millis(10)),
                &cancel,
            )
            .await;
        assert_eq!(res, Err(TransportError::TimedOut(Duration::from_millis(10))));
        assert_eq!(broker.message_count("work"), 0);

        let tag = delivery.delivery_tag;
        conn.perform_action(
            |channel| async move { channel.ack(tag).await },
            &budget,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(broker.acked_tags(), vec![tag]);
        assert_eq!(broker.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failures_retry_until_the_broker_answers() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(3);
        let conn = connection(&broker, ConnectionOptions::default());

        conn.perform_action(
            declare,
            &TimeoutBudget::start(Duration::from_secs(30)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(broker.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_broker_times_out_with_the_budget() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(u32::MAX);
        let conn = connection(&broker, ConnectionOptions::default());
        let started = Instant::now();

        let res = conn
            .perform_action(
                declare,
                &TimeoutBudget::start(Duration::from_secs(2)),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(res, Err(TransportError::TimedOut(Duration::from_secs(2))));
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_reconnect_loop() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(u32::MAX);
        let conn = connection(&broker, ConnectionOptions::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let res = conn
            .perform_action(declare, &TimeoutBudget::infinite(), &cancel)
            .await;
        assert_eq!(res, Err(TransportError::Cancelled));
    }

    #[tokio::test]
    async fn dispose_deletes_configured_queue_and_refuses_actions() {
        let broker = InMemoryBroker::new();
        let conn = connection(
            &broker,
            ConnectionOptions {
                delete_queue_on_close: Some("work".into()),
                ..ConnectionOptions::default()
            },
        );
        let budget = TimeoutBudget::infinite();
        let cancel = CancellationToken::new();

        conn.perform_action(declare, &budget, &cancel).await.unwrap();
        assert!(broker.queue_exists("work"));

        conn.dispose().await;
        conn.dispose().await;

        assert!(!broker.queue_exists("work"));
        assert_eq!(broker.open_channels(), 0);
        assert_eq!(broker.connects(), 1);
        assert_eq!(
            conn.perform_action(declare, &budget, &cancel).await,
            Err(TransportError::Disposed)
        );
    }

    #[tokio::test]
    async fn dispose_deletes_through_a_fresh_pair_after_a_drop() {
        let broker = InMemoryBroker::new();
        let options = ConnectionOptions {
            delete_queue_on_close: Some("work".into()),
            ..ConnectionOptions::default()
        };

        let never_used = connection(&broker, options.clone());
        never_used.dispose().await;
        assert_eq!(broker.connects(), 0);

        let conn = connection(&broker, options);
        conn.perform_action(declare, &TimeoutBudget::infinite(), &CancellationToken::new())
            .await
            .unwrap();
        broker.sever_connections();

        conn.dispose().await;
        assert!(!broker.queue_exists("work"));
        assert_eq!(broker.connects(), 2);
        assert_eq!(broker.open_channels(), 0);
    }

    struct FailingOnce(AtomicU32);

    #[async_trait]
    impl ChannelInitializer for FailingOnce {
        async fn initialize(&self, channel: &dyn BrokerChannel) -> Result<(), TransportError> {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(TransportError::DeclareQueueError("work".into()));
            }
            channel.enable_confirms().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initialization_closes_the_partial_pair() {
        let broker = InMemoryBroker::new();
        let conn = BrokerConnection::new(
            Arc::new(broker.clone()),
            Arc::new(FailingOnce(AtomicU32::new(0))),
            ConnectionOptions::default(),
        );

        conn.perform_action(
            |channel| async move {
                channel
                    .publish("", "nowhere", b"x", lapin::BasicProperties::default())
                    .await
                    .map(|_slot: ConfirmSlot| ())
            },
            &TimeoutBudget::start(Duration::from_secs(10)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(broker.connects(), 2);
        assert_eq!(broker.open_channels(), 1);
    }
}
