// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Communication Object Lifecycle
//!
//! Channels, factories and listeners share one state machine:
//!
//! ```text
//! Created -> Opening -> Opened -> Closing -> Closed
//!               \          \
//!                `----------`--> Faulted
//! ```
//!
//! Transitions only move forward. A faulted object keeps the error that faulted
//! it and reports it to every later operation.

use crate::errors::TransportError;
use async_trait::async_trait;
use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommunicationState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

impl fmt::Display for CommunicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Open/close/abort surface shared by channels, factories and listeners.
#[async_trait]
pub trait CommunicationObject: Send + Sync {
    fn state(&self) -> CommunicationState;

    async fn open(&self, timeout: Duration) -> Result<(), TransportError>;

    async fn close(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Closes without waiting for the remote side. Never fails.
    async fn abort(&self);
}

#[derive(Debug)]
struct Inner {
    state: CommunicationState,
    fault: Option<TransportError>,
}

/// Thread safe lifecycle state of one communication object.
#[derive(Debug)]
pub struct Lifecycle {
    name: &'static str,
    inner: Mutex<Inner>,
}

impl Lifecycle {
    pub fn new(name: &'static str) -> Lifecycle {
        Lifecycle {
            name,
            inner: Mutex::new(Inner {
                state: CommunicationState::Created,
                fault: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CommunicationState {
        self.lock().state
    }

    /// Created -> Opening.
    pub fn begin_open(&self) -> Result<(), TransportError> {
        let mut inner = self.lock();
        match inner.state {
            CommunicationState::Created => {
                inner.state = CommunicationState::Opening;
                Ok(())
            }
            state => Err(TransportError::InvalidState(format!(
                "cannot open {} in state {}",
                self.name, state
            ))),
        }
    }

    /// Opening -> Opened. Fails when the object was aborted while opening.
    pub fn complete_open(&self) -> Result<(), TransportError> {
        let mut inner = self.lock();
        match inner.state {
            CommunicationState::Opening => {
                inner.state = CommunicationState::Opened;
                debug!("{} opened", self.name);
                Ok(())
            }
            state => Err(TransportError::InvalidState(format!(
                "{} left the opening state for {}",
                self.name, state
            ))),
        }
    }

    /// Moves any live object to Faulted. The first fault reason wins.
    pub fn fault(&self, reason: TransportError) {
        let mut inner = self.lock();
        if inner.state == CommunicationState::Closed {
            return;
        }

        if inner.fault.is_none() {
            debug!(error = reason.to_string(), "{} faulted", self.name);
            inner.fault = Some(reason);
        }
        inner.state = CommunicationState::Faulted;
    }

    /// Enters Closing and returns the state the object was in.
    ///
    /// Returns `None` when the object is already closing or closed. A faulted
    /// object stays Faulted; its owner only releases resources.
    pub fn begin_close(&self) -> Option<CommunicationState> {
        let mut inner = self.lock();
        let previous = inner.state;
        match previous {
            CommunicationState::Closing | CommunicationState::Closed => None,
            CommunicationState::Faulted => Some(previous),
            _ => {
                inner.state = CommunicationState::Closing;
                Some(previous)
            }
        }
    }

    /// Closing -> Closed. Faulted objects stay Faulted.
    pub fn complete_close(&self) {
        let mut inner = self.lock();
        if inner.state == CommunicationState::Closing {
            inner.state = CommunicationState::Closed;
            debug!("{} closed", self.name);
        }
    }

    /// Moves a closing or faulted object to Closed; used by abort.
    pub fn force_close(&self) {
        let mut inner = self.lock();
        inner.state = CommunicationState::Closed;
        debug!("{} aborted", self.name);
    }

    /// Fails unless the object is Opened.
    pub fn ensure_opened(&self) -> Result<(), TransportError> {
        let inner = self.lock();
        match inner.state {
            CommunicationState::Opened => Ok(()),
            CommunicationState::Faulted => Err(inner.fault.clone().unwrap_or_else(|| {
                TransportError::Communication(format!("{} is faulted", self.name))
            })),
            CommunicationState::Closing | CommunicationState::Closed => {
                Err(TransportError::Disposed)
            }
            state => Err(TransportError::InvalidState(format!(
                "{} is not open ({})",
                self.name, state
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_the_happy_path() {
        let lifecycle = Lifecycle::new("channel");
        assert_eq!(lifecycle.state(), CommunicationState::Created);
        assert!(lifecycle.ensure_opened().is_err());

        lifecycle.begin_open().unwrap();
        lifecycle.complete_open().unwrap();
        assert!(lifecycle.ensure_opened().is_ok());

        assert_eq!(lifecycle.begin_close(), Some(CommunicationState::Opened));
        assert_eq!(lifecycle.begin_close(), None);
        assert_eq!(lifecycle.ensure_opened(), Err(TransportError::Disposed));

        lifecycle.complete_close();
        assert_eq!(lifecycle.state(), CommunicationState::Closed);
    }

    #[test]
    fn opens_only_once() {
        let lifecycle = Lifecycle::new("channel");
        lifecycle.begin_open().unwrap();
        assert!(matches!(
            lifecycle.begin_open(),
            Err(TransportError::InvalidState(_))
        ));
    }

    #[test]
    fn fault_is_sticky_and_reported() {
        let lifecycle = Lifecycle::new("channel");
        lifecycle.begin_open().unwrap();
        lifecycle.complete_open().unwrap();

        let closed = TransportError::Communication("remote session was closed".into());
        lifecycle.fault(closed.clone());
        lifecycle.fault(TransportError::Cancelled);

        assert_eq!(lifecycle.state(), CommunicationState::Faulted);
        assert_eq!(lifecycle.ensure_opened(), Err(closed));

        assert_eq!(lifecycle.begin_close(), Some(CommunicationState::Faulted));
        lifecycle.complete_close();
        assert_eq!(lifecycle.state(), CommunicationState::Faulted);

        lifecycle.force_close();
        assert_eq!(lifecycle.state(), CommunicationState::Closed);
    }

    #[test]
    fn abort_during_open_fails_completion() {
        let lifecycle = Lifecycle::new("channel");
        lifecycle.begin_open().unwrap();
        assert_eq!(lifecycle.begin_close(), Some(CommunicationState::Opening));
        lifecycle.force_close();

        assert!(lifecycle.complete_open().is_err());
        assert_eq!(lifecycle.state(), CommunicationState::Closed);
    }
}
