// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy shared across the runtime substrate.
//!
//! Every store round trip is wrapped in [`RelayError::Store`] with an
//! operation tag naming the call site, so a failure in the logs reads
//! `store error in lock_acquire: ...` instead of a bare transport error.

use std::fmt;

/// Unified error type for the runtime substrate.
#[derive(Debug)]
pub enum RelayError {
    /// Transport or command failure talking to the store. The tag names
    /// the operation (`lock_acquire`, `queue_enqueue`, `marker_claim`, ...).
    Store {
        op: &'static str,
        source: redis::RedisError,
    },
    /// Lock acquisition exceeded its deadline. Carries the current
    /// holder's human-readable name when it could be read.
    LockContention { holder: Option<String> },
    /// The per-chat processing gate is already held.
    AlreadyProcessing,
    /// The pending queue is at capacity.
    QueueFull,
    /// The pending queue already contains this `(user, timestamp)` entry.
    QueueDuplicate,
    /// A script name was executed without ever being registered.
    ScriptMissing { name: String },
    /// A stored payload failed to decode against its schema.
    DataCorruption { what: String, detail: String },
    /// A downstream dependency the handler needs is unavailable.
    /// Surfaced to the user as a templated message.
    ExternalService { message: String },
}

impl RelayError {
    /// Wrap a store error with its operation tag.
    pub fn store(op: &'static str, source: redis::RedisError) -> Self {
        Self::Store { op, source }
    }

    /// Machine-readable code for logs and admin responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store { .. } => "STORE_ERROR",
            Self::LockContention { .. } => "LOCK_CONTENTION",
            Self::AlreadyProcessing => "ALREADY_PROCESSING",
            Self::QueueFull => "QUEUE_FULL",
            Self::QueueDuplicate => "QUEUE_DUPLICATE",
            Self::ScriptMissing { .. } => "SCRIPT_MISSING",
            Self::DataCorruption { .. } => "DATA_CORRUPTION",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE",
        }
    }

    /// Whether redelivery can be expected to succeed. Store errors are
    /// transient; the rest either succeed deterministically or not at all.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store { .. })
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store { op, source } => write!(f, "store error in {op}: {source}"),
            Self::LockContention { holder: Some(name) } => {
                write!(f, "lock contention (held by {name})")
            }
            Self::LockContention { holder: None } => write!(f, "lock contention"),
            Self::AlreadyProcessing => write!(f, "chat is already processing a command"),
            Self::QueueFull => write!(f, "pending queue is full"),
            Self::QueueDuplicate => write!(f, "pending queue already holds this entry"),
            Self::ScriptMissing { name } => write!(f, "script {name} was never registered"),
            Self::DataCorruption { what, detail } => {
                write!(f, "corrupt {what} payload: {detail}")
            }
            Self::ExternalService { message } => write!(f, "external service failure: {message}"),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
