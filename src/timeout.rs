// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Timeout Budgets
//!
//! A `TimeoutBudget` is a wall-clock countdown created once per top-level call and
//! passed by reference through every nested call, so a caller supplied timeout is
//! never exceeded cumulatively across retries, reconnects and waits.
//!
//! `Duration::MAX` is the "never expires" sentinel and survives every operation
//! on the budget unchanged.
//!
//! The budget reads `tokio::time::Instant`, so tests running on a paused tokio clock
//! drive it deterministically.

use crate::errors::TransportError;
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Countdown shared across one call chain.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutBudget {
    total: Duration,
    started: Instant,
}

impl TimeoutBudget {
    /// Starts a new budget of `total` from now.
    pub fn start(total: Duration) -> TimeoutBudget {
        TimeoutBudget {
            total,
            started: Instant::now(),
        }
    }

    /// A budget that never expires.
    pub fn infinite() -> TimeoutBudget {
        TimeoutBudget::start(Duration::MAX)
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn is_infinite(&self) -> bool {
        self.total == Duration::MAX
    }

    /// Time left, clamped at zero. Infinite budgets always report `Duration::MAX`.
    pub fn remaining(&self) -> Duration {
        if self.is_infinite() {
            return Duration::MAX;
        }

        self.total.saturating_sub(self.started.elapsed())
    }

    /// Time left, but never more than `cap`.
    pub fn remaining_capped(&self, cap: Duration) -> Duration {
        self.remaining().min(cap)
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Fails with `TimedOut` once nothing is left.
    pub fn check(&self) -> Result<(), TransportError> {
        if self.expired() {
            return Err(TransportError::TimedOut(self.total));
        }

        Ok(())
    }

    /// Runs `fut` until it completes, the budget runs out or `cancel` fires.
    pub async fn run<T, F>(&self, fut: F, cancel: &CancellationToken) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            res = fut => res,
            _ = tokio::time::sleep(self.remaining()) => Err(TransportError::TimedOut(self.total)),
        }
    }
}

/// Sleeps for `delay` unless `cancel` fires first.
pub async fn sleep_or_cancel(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), TransportError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn remaining_counts_down_and_clamps_at_zero() {
        let budget = TimeoutBudget::start(Duration::from_secs(2));
        assert_eq!(budget.remaining(), Duration::from_secs(2));

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(budget.remaining(), Duration::from_millis(500));
        assert!(budget.check().is_ok());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(budget.remaining(), Duration::ZERO);
        assert!(budget.expired());
        assert_eq!(
            budget.check(),
            Err(TransportError::TimedOut(Duration::from_secs(2)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn infinite_budget_never_expires() {
        let budget = TimeoutBudget::infinite();
        tokio::time::advance(Duration::from_secs(3600 * 24)).await;

        assert_eq!(budget.remaining(), Duration::MAX);
        assert!(!budget.expired());
        assert_eq!(
            budget.remaining_capped(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_times_out_no_earlier_than_the_budget() {
        let budget = TimeoutBudget::start(Duration::from_secs(3));
        let started = Instant::now();
        let cancel = CancellationToken::new();

        let res: Result<(), _> = budget.run(std::future::pending(), &cancel).await;

        assert_eq!(res, Err(TransportError::TimedOut(Duration::from_secs(3))));
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancellation() {
        let budget = TimeoutBudget::infinite();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let res: Result<(), _> = budget.run(std::future::pending(), &cancel).await;
        assert_eq!(res, Err(TransportError::Cancelled));
    }

    #[tokio::test]
    async fn zero_budget_is_expired_immediately() {
        let budget = TimeoutBudget::start(Duration::ZERO);
        assert!(budget.expired());
        assert!(sleep_or_cancel(Duration::ZERO, &CancellationToken::new())
            .await
            .is_ok());
    }
}
