// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Messages
//!
//! Channels exchange `Message`s. Correlation data travels in the AMQP properties:
//!
//! | field        | AMQP                       |
//! |--------------|----------------------------|
//! | `action`     | `type`                     |
//! | `message_id` | `message_id`               |
//! | `relates_to` | `correlation_id`           |
//! | `reply_to`   | `reply_to` (address URI)   |
//! | `from`, `to` | `from`, `to` headers       |
//! | `abort_topic`| `abort-topic` header       |
//!
//! Session control messages carry an `Action` and an empty body.

use crate::{address::QueueAddress, errors::TransportError, reader::DequeueResult};
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use std::{collections::BTreeMap, fmt, str::FromStr};
use tracing::warn;
use uuid::Uuid;

pub const HEADER_FROM: &str = "from";
pub const HEADER_TO: &str = "to";
pub const HEADER_ABORT_TOPIC: &str = "abort-topic";

/// Session control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    CreateSessionRequest,
    CreateSessionResponse,
    CloseSessionRequest,
    CloseSessionResponse,
    InputSessionClosingRequest,
    KeepAlive,
    /// Sent to the peer's abort topic when a channel is aborted.
    AbortSession,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CreateSessionRequest => "net.rabbitmq/session/create",
            Action::CreateSessionResponse => "net.rabbitmq/session/create-response",
            Action::CloseSessionRequest => "net.rabbitmq/session/close",
            Action::CloseSessionResponse => "net.rabbitmq/session/close-response",
            Action::InputSessionClosingRequest => "net.rabbitmq/session/input-closing",
            Action::KeepAlive => "net.rabbitmq/session/keep-alive",
            Action::AbortSession => "net.rabbitmq/session/abort",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = TransportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        [
            Action::CreateSessionRequest,
            Action::CreateSessionResponse,
            Action::CloseSessionRequest,
            Action::CloseSessionResponse,
            Action::InputSessionClosingRequest,
            Action::KeepAlive,
            Action::AbortSession,
        ]
        .into_iter()
        .find(|action| action.as_str() == value)
        .ok_or_else(|| TransportError::Communication(format!("unknown action `{}`", value)))
    }
}

/// A channel level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Control action or application action, carried as the AMQP type.
    pub action: Option<String>,
    pub message_id: Uuid,
    pub relates_to: Option<Uuid>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<QueueAddress>,
    pub abort_topic: Option<QueueAddress>,
    pub priority: Option<u8>,
    /// Application string headers.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// Set on received messages the broker delivered before.
    pub redelivered: bool,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Message {
        Message {
            action: None,
            message_id: Uuid::new_v4(),
            relates_to: None,
            from: None,
            to: None,
            reply_to: None,
            abort_topic: None,
            priority: None,
            headers: BTreeMap::new(),
            body: body.into(),
            redelivered: false,
        }
    }

    pub fn control(action: Action) -> Message {
        Message::new(Vec::new()).with_action(action.as_str())
    }

    pub fn with_action(mut self, action: &str) -> Self {
        self.action = Some(action.to_owned());
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn relating_to(mut self, message_id: Uuid) -> Self {
        self.relates_to = Some(message_id);
        self
    }

    pub fn replying_to(mut self, address: &QueueAddress) -> Self {
        self.reply_to = Some(address.clone());
        self
    }

    pub fn with_abort_topic(mut self, address: &QueueAddress) -> Self {
        self.abort_topic = Some(address.clone());
        self
    }

    /// The session control action, if this is a control message.
    pub fn control_action(&self) -> Option<Action> {
        self.action.as_deref().and_then(|a| a.parse().ok())
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub(crate) fn to_properties(&self) -> BasicProperties {
        let mut headers = FieldTable::default();
        for (key, value) in &self.headers {
            insert_str(&mut headers, key, value);
        }
        if let Some(from) = &self.from {
            insert_str(&mut headers, HEADER_FROM, from);
        }
        if let Some(to) = &self.to {
            insert_str(&mut headers, HEADER_TO, to);
        }
        if let Some(topic) = &self.abort_topic {
            insert_str(&mut headers, HEADER_ABORT_TOPIC, &topic.to_uri());
        }

        let mut properties = BasicProperties::default()
            .with_message_id(ShortString::from(self.message_id.to_string()))
            .with_headers(headers);

        if let Some(action) = &self.action {
            properties = properties.with_kind(ShortString::from(action.clone()));
        }
        if let Some(relates_to) = self.relates_to {
            properties = properties.with_correlation_id(ShortString::from(relates_to.to_string()));
        }
        if let Some(reply_to) = &self.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to.to_uri()));
        }
        if let Some(priority) = self.priority {
            properties = properties.with_priority(priority);
        }

        properties
    }

    /// Rebuilds a message from a dequeued delivery.
    ///
    /// Messages from foreign publishers are tolerated: a missing or malformed
    /// message id is replaced and malformed addresses are dropped with a warning.
    pub(crate) fn from_dequeued(result: &DequeueResult) -> Message {
        let properties = &result.properties;
        let mut headers = BTreeMap::new();
        let mut from = None;
        let mut to = None;
        let mut abort_topic = None;

        if let Some(table) = properties.headers() {
            for (key, value) in table.inner() {
                let Some(value) = as_string(value) else {
                    continue;
                };
                match key.as_str() {
                    HEADER_FROM => from = Some(value),
                    HEADER_TO => to = Some(value),
                    HEADER_ABORT_TOPIC => abort_topic = parse_address(&value),
                    key => {
                        headers.insert(key.to_owned(), value);
                    }
                }
            }
        }

        Message {
            action: properties.kind().as_ref().map(|kind| kind.to_string()),
            message_id: properties
                .message_id()
                .as_ref()
                .and_then(|id| Uuid::parse_str(id.as_str()).ok())
                .unwrap_or_else(Uuid::new_v4),
            relates_to: properties
                .correlation_id()
                .as_ref()
                .and_then(|id| Uuid::parse_str(id.as_str()).ok()),
            from,
            to,
            reply_to: properties
                .reply_to()
                .as_ref()
                .and_then(|uri| parse_address(uri.as_str())),
            abort_topic,
            priority: *properties.priority(),
            headers,
            body: result.body.clone(),
            redelivered: result.redelivered,
        }
    }
}

fn insert_str(headers: &mut FieldTable, key: &str, value: &str) {
    headers.insert(
        ShortString::from(key),
        AMQPValue::LongString(LongString::from(value)),
    );
}

fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
            .ok()
            .map(str::to_owned),
        AMQPValue::ShortString(value) => Some(value.to_string()),
        _ => None,
    }
}

fn parse_address(uri: &str) -> Option<QueueAddress> {
    match QueueAddress::parse(uri) {
        Ok(address) => Some(address),
        Err(err) => {
            warn!(error = err.to_string(), uri, "ignoring malformed address");
            None
        }
    }
}
