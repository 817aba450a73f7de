// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Addresses
//!
//! A `QueueAddress` names one queue and the exchange it is bound to, together with
//! the declaration options the queue is created with. Addresses travel between
//! peers (reply-to, abort topic) in their URI form:
//!
//! ```text
//! net.rabbitmq://<queue-name>?exchange=<e>&durable=<bool>&deleteonclose=<bool>&ttl=<iso-duration>&maxpriority=<n>
//! ```
//!
//! Missing `exchange` means the default exchange, missing `durable` means durable,
//! missing `deleteonclose` means the queue survives its reader and missing `ttl`
//! means the queue never expires.

use crate::errors::TransportError;
use std::{fmt, str::FromStr, time::Duration};
use url::Url;
use uuid::Uuid;

/// URI scheme of queue addresses
pub const SCHEME: &str = "net.rabbitmq";
/// Exchange queues are bound to when none is given
pub const DEFAULT_EXCHANGE: &str = "amq.direct";

const PARAM_EXCHANGE: &str = "exchange";
const PARAM_DURABLE: &str = "durable";
const PARAM_DELETE_ON_CLOSE: &str = "deleteonclose";
const PARAM_TTL: &str = "ttl";
const PARAM_MAX_PRIORITY: &str = "maxpriority";

/// One logical queue/binding pair on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueAddress {
    exchange: String,
    queue: String,
    durable: bool,
    delete_on_close: bool,
    ttl: Option<Duration>,
    max_priority: Option<u8>,
}

impl QueueAddress {
    /// Creates a durable address on the default exchange.
    pub fn new(queue: &str) -> QueueAddress {
        QueueAddress {
            exchange: DEFAULT_EXCHANGE.to_owned(),
            queue: queue.to_owned(),
            durable: true,
            delete_on_close: false,
            ttl: None,
            max_priority: None,
        }
    }

    /// Creates a uniquely named, non-durable, delete-on-close address.
    ///
    /// Every channel endpoint receives on one of these.
    pub fn private(prefix: &str, exchange: &str) -> QueueAddress {
        QueueAddress::new(&format!("{}-{}", prefix, Uuid::new_v4().simple()))
            .exchange(exchange)
            .durable(false)
            .delete_on_close(true)
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn delete_on_close(mut self, delete: bool) -> Self {
        self.delete_on_close = delete;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn max_priority(mut self, priority: u8) -> Self {
        self.max_priority = Some(priority);
        self
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_delete_on_close(&self) -> bool {
        self.delete_on_close
    }

    pub fn time_to_live(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn priority_levels(&self) -> Option<u8> {
        self.max_priority
    }

    /// Parses the URI form of an address.
    pub fn parse(uri: &str) -> Result<QueueAddress, TransportError> {
        let invalid = || TransportError::InvalidAddress(uri.to_owned());

        let url = Url::parse(uri).map_err(|_| invalid())?;
        if url.scheme() != SCHEME {
            return Err(invalid());
        }

        let queue = match url.host_str() {
            Some(host) if !host.is_empty() => host,
            _ => return Err(invalid()),
        };

        let mut address = QueueAddress::new(queue);
        for (key, value) in url.query_pairs() {
            match key.to_ascii_lowercase().as_str() {
                PARAM_EXCHANGE => address.exchange = value.into_owned(),
                PARAM_DURABLE => address.durable = parse_bool(&value).ok_or_else(invalid)?,
                PARAM_DELETE_ON_CLOSE => {
                    address.delete_on_close = parse_bool(&value).ok_or_else(invalid)?
                }
                PARAM_TTL => address.ttl = Some(parse_iso_duration(&value).ok_or_else(invalid)?),
                PARAM_MAX_PRIORITY => {
                    address.max_priority = Some(value.parse().map_err(|_| invalid())?)
                }
                _ => {}
            }
        }

        Ok(address)
    }

    /// URI form of the address.
    pub fn to_uri(&self) -> String {
        let mut uri = format!(
            "{}://{}?{}={}&{}={}&{}={}",
            SCHEME,
            self.queue,
            PARAM_EXCHANGE,
            self.exchange,
            PARAM_DURABLE,
            self.durable,
            PARAM_DELETE_ON_CLOSE,
            self.delete_on_close
        );

        if let Some(ttl) = self.ttl {
            uri.push_str(&format!("&{}={}", PARAM_TTL, format_iso_duration(ttl)));
        }

        if let Some(priority) = self.max_priority {
            uri.push_str(&format!("&{}={}", PARAM_MAX_PRIORITY, priority));
        }

        uri
    }
}

impl fmt::Display for QueueAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

impl FromStr for QueueAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueAddress::parse(s)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Parses the day/time subset of ISO 8601 durations, e.g. `PT30S` or `P1DT2H`.
///
/// Seconds may carry a fraction. Years, months and weeks are not accepted.
pub fn parse_iso_duration(value: &str) -> Option<Duration> {
    let rest = value.trim().strip_prefix(|c: char| c == 'P' || c == 'p')?;
    if rest.is_empty() {
        return None;
    }

    let (date, time) = match rest.find(|c: char| c == 'T' || c == 't') {
        Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
        None => (rest, None),
    };

    let mut millis: f64 = 0.0;

    if !date.is_empty() {
        let days = date.strip_suffix(|c: char| c == 'D' || c == 'd')?;
        millis += days.parse::<f64>().ok()? * 86_400_000.0;
    }

    if let Some(time) = time {
        if time.is_empty() {
            return None;
        }

        let mut number = String::new();
        for ch in time.chars() {
            let unit = match ch.to_ascii_uppercase() {
                'H' => 3_600_000.0,
                'M' => 60_000.0,
                'S' => 1_000.0,
                c if c.is_ascii_digit() || c == '.' => {
                    number.push(c);
                    continue;
                }
                _ => return None,
            };

            millis += number.parse::<f64>().ok()? * unit;
            number.clear();
        }

        if !number.is_empty() {
            return None;
        }
    }

    if !millis.is_finite() || millis < 0.0 {
        return None;
    }

    Some(Duration::from_millis(millis.round() as u64))
}

/// Formats a duration as `PT<seconds>S`, keeping millisecond precision.
pub fn format_iso_duration(value: Duration) -> String {
    let millis = value.as_millis();
    if millis % 1000 == 0 {
        format!("PT{}S", millis / 1000)
    } else {
        format!("PT{}.{:03}S", millis / 1000, millis % 1000)
    }
}
