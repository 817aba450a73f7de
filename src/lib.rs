// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Transport Channels
//!
//! Session oriented duplex channels and request/reply channels on top of RabbitMQ
//! queues.
//!
//! The layers, bottom up:
//!
//! - [`broker`]: the broker client abstraction, implemented by [`amqp`] over lapin
//!   and by [`memory`] in process;
//! - [`connection`]: a lazily reconnecting, lock protected connection running
//!   broker actions with retries;
//! - [`reader`] and [`writer`]: one queue's consumer and a confirming publisher;
//! - [`duplex`], [`request`] and [`reply`]: the channels, created through the
//!   [`factory`] entry points.
//!
//! Every blocking operation takes a [`timeout::TimeoutBudget`] or a timeout and
//! a cancellation token; disposal drains in-flight work through
//! [`tracker::ConcurrentOperationTracker`].

mod otel;

pub mod address;
pub mod amqp;
pub mod broker;
pub mod configs;
pub mod connection;
pub mod diagnostics;
pub mod duplex;
pub mod errors;
pub mod exchange;
pub mod factory;
pub mod lifecycle;
pub mod memory;
pub mod message;
pub mod reader;
pub mod reply;
pub mod request;
pub mod throttle;
pub mod timeout;
pub mod tracker;
pub mod writer;
