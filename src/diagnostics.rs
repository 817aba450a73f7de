// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Diagnostic Identity
//!
//! Writers stamp every message, and readers every queue they declare, with the
//! identity of the process that produced them. Nothing reads these values back;
//! they exist so an operator looking at a queue in the broker console can tell who
//! owns it.

use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const HEADER_COMMAND_LINE: &str = "x-process-command-line";
pub const HEADER_PROCESS_START_TIME: &str = "x-process-start-time";
pub const HEADER_PROCESS_ID: &str = "x-process-id";
pub const HEADER_MACHINE_NAME: &str = "x-machine-name";
pub const HEADER_CREATION_TIME: &str = "x-creation-time";
pub const HEADER_USER_NAME: &str = "x-user-name";
pub const HEADER_USER_DOMAIN: &str = "x-user-domain";
pub const HEADER_APP_INSTANCE: &str = "x-app-instance";

/// Identity of the running process, captured once and handed to every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub command_line: String,
    pub process_id: u32,
    /// Unix milliseconds at which the identity was captured, normally process startup.
    pub started_at_ms: u64,
    pub machine_name: String,
    pub user_name: String,
    pub user_domain: String,
    /// Distinguishes transport hosts living in the same process.
    pub app_instance: Uuid,
}

impl ProcessIdentity {
    /// Reads the identity of the current process from its environment.
    pub fn capture() -> ProcessIdentity {
        ProcessIdentity {
            command_line: std::env::args().collect::<Vec<_>>().join(" "),
            process_id: std::process::id(),
            started_at_ms: unix_millis(),
            machine_name: env_or_unknown(&["HOSTNAME", "COMPUTERNAME"]),
            user_name: env_or_unknown(&["USER", "USERNAME"]),
            user_domain: env_or_unknown(&["USERDOMAIN"]),
            app_instance: Uuid::new_v4(),
        }
    }

    /// Diagnostic fields as an AMQP table.
    ///
    /// `x-creation-time` is the moment of the call, not of the capture.
    pub fn to_table(&self, include_command_line: bool) -> FieldTable {
        let mut table = FieldTable::default();

        if include_command_line {
            table.insert(
                ShortString::from(HEADER_COMMAND_LINE),
                AMQPValue::LongString(LongString::from(self.command_line.clone())),
            );
        }

        table.insert(
            ShortString::from(HEADER_PROCESS_START_TIME),
            AMQPValue::LongLongInt(self.started_at_ms as LongLongInt),
        );
        table.insert(
            ShortString::from(HEADER_PROCESS_ID),
            AMQPValue::LongLongInt(self.process_id as LongLongInt),
        );
        table.insert(
            ShortString::from(HEADER_MACHINE_NAME),
            AMQPValue::LongString(LongString::from(self.machine_name.clone())),
        );
        table.insert(
            ShortString::from(HEADER_CREATION_TIME),
            AMQPValue::LongLongInt(unix_millis() as LongLongInt),
        );
        table.insert(
            ShortString::from(HEADER_USER_NAME),
            AMQPValue::LongString(LongString::from(self.user_name.clone())),
        );
        table.insert(
            ShortString::from(HEADER_USER_DOMAIN),
            AMQPValue::LongString(LongString::from(self.user_domain.clone())),
        );
        table.insert(
            ShortString::from(HEADER_APP_INSTANCE),
            AMQPValue::LongString(LongString::from(self.app_instance.to_string())),
        );

        table
    }
}

fn env_or_unknown(keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "unknown".to_owned())
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
