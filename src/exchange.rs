// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! Queue readers bind their queue to an exchange under the queue's own name. This
//! module describes the exchange a reader declares before binding. The default
//! exchange and the broker's reserved `amq.*` exchanges always exist and are never
//! declared.

/// Represents the types of exchanges a transport queue can be bound to.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of an exchange a reader declares during initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a durable direct exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: true,
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets whether the exchange survives broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// The default exchange and `amq.*` exchanges exist on every broker and
    /// refuse redeclaration by clients.
    pub fn is_predeclared(&self) -> bool {
        self.name.is_empty() || self.name.starts_with("amq.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_exchanges_are_predeclared() {
        assert!(ExchangeDefinition::new("").is_predeclared());
        assert!(ExchangeDefinition::new("amq.direct").is_predeclared());
        assert!(!ExchangeDefinition::new("sessions").is_predeclared());
    }

    #[test]
    fn builder_sets_kind_and_durability() {
        let def = ExchangeDefinition::new("events")
            .kind(ExchangeKind::Topic)
            .durable(false);

        assert_eq!(def.exchange_kind(), ExchangeKind::Topic);
        assert!(!def.is_durable());
    }
}
