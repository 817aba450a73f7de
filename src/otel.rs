// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context rides along with every message in its AMQP headers. The writer
//! injects the current context before publishing; a dequeued message hands the
//! extracted context to whoever processes it.

use lapin::types::{AMQPValue, FieldTable, ShortString};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    Context,
};
use std::collections::BTreeMap;
use tracing::error;

/// An adapter for injecting and extracting OpenTelemetry context from RabbitMQ headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Adds the current trace context to `headers`.
pub(crate) fn inject_current(headers: &mut FieldTable) {
    let mut btree = headers.inner().clone();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(
            &Context::current(),
            &mut RabbitMQTracePropagator::new(&mut btree),
        )
    });

    for (key, value) in btree {
        headers.insert(key, value);
    }
}

/// Trace context carried by `headers`, or an empty context.
pub(crate) fn extract(headers: Option<&FieldTable>) -> Context {
    let mut btree = headers
        .map(|table| table.inner().clone())
        .unwrap_or_default();

    global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut btree))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::LongString;

    #[test]
    fn extractor_reads_long_string_headers_only() {
        let mut btree = BTreeMap::new();
        btree.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString(LongString::from("00-abc-def-01")),
        );
        btree.insert(ShortString::from("count"), AMQPValue::LongLongInt(3));

        let propagator = RabbitMQTracePropagator::new(&mut btree);
        assert_eq!(propagator.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(propagator.get("count"), None);
        assert_eq!(propagator.keys().len(), 2);
    }

    #[test]
    fn injector_lowercases_keys() {
        let mut btree = BTreeMap::new();
        RabbitMQTracePropagator::new(&mut btree).set("TraceParent", "value".to_owned());
        assert!(btree.contains_key("traceparent"));
    }
}
