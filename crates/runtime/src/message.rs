// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inbound, outbound, and pending message records.
//!
//! Inbound entries arrive as string-field maps from the log; decoding is
//! tolerant of the two historical names for the chat id (`room` and
//! `chatId`) and treats a missing/empty `text` or chat id as a reject
//! (the consumer logs, ACKs, and skips those).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A message read from the inbound log. Immutable after decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Entry id assigned by the log provider, echoed opaquely.
    pub entry_id: String,
    pub chat_id: String,
    pub user_id: String,
    pub text: String,
    pub thread_id: Option<String>,
    /// Display name, when the producer attached one.
    pub sender: Option<String>,
}

/// Reply type tag on the outbound log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyKind {
    Final,
    Partial,
}

impl ReplyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Final => "final",
            Self::Partial => "partial",
        }
    }
}

impl fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message bound for the outbound log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub chat_id: String,
    pub text: String,
    pub thread_id: Option<String>,
    pub kind: ReplyKind,
}

/// A deferred message buffered in the per-chat pending queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessage {
    pub user_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub enqueued_at_ms: u64,
}

impl PendingMessage {
    /// Queue entry id. Ordering ties on the timestamp break by user id
    /// because the id leads with it.
    pub fn entry_id(&self) -> String {
        format!("{}|{}", self.user_id, self.enqueued_at_ms)
    }
}

/// Why an inbound entry could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeReject {
    MissingChatId,
    MissingText,
}

impl fmt::Display for DecodeReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingChatId => f.write_str("missing chat id (room/chatId)"),
            Self::MissingText => f.write_str("missing or empty text"),
        }
    }
}

fn string_field(map: &HashMap<String, redis::Value>, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(value) = map.get(*name) {
            if let Ok(s) = redis::from_redis_value::<String>(value) {
                if !s.is_empty() {
                    return Some(s);
                }
            }
        }
    }
    None
}

impl InboundMessage {
    /// Decode a raw stream entry. `room` is accepted as an alias for
    /// `chatId`; a missing `userId` falls back to the display name so
    /// queue dedup still has a stable identity.
    pub fn from_entry(
        entry_id: &str,
        fields: &HashMap<String, redis::Value>,
    ) -> Result<Self, DecodeReject> {
        let chat_id =
            string_field(fields, &["room", "chatId"]).ok_or(DecodeReject::MissingChatId)?;
        let text = string_field(fields, &["text"]).ok_or(DecodeReject::MissingText)?;
        let sender = string_field(fields, &["sender"]);
        let user_id = string_field(fields, &["userId"])
            .or_else(|| sender.clone())
            .unwrap_or_else(|| "unknown".to_owned());

        Ok(Self {
            entry_id: entry_id.to_owned(),
            chat_id,
            user_id,
            text,
            thread_id: string_field(fields, &["threadId"]),
            sender,
        })
    }

    /// Milliseconds component of the log-assigned entry id
    /// (`<ms>-<seq>`). Stable across redeliveries of the same entry,
    /// which is what makes queue dedup effective: a redelivered message
    /// enqueues under the same `(user, timestamp)` entry id.
    pub fn log_timestamp_ms(&self) -> Option<u64> {
        self.entry_id.split('-').next()?.parse().ok()
    }

    /// Rebuild an inbound message from a dequeued pending record. The
    /// synthetic entry id marks it as queue-origin; it never reaches the
    /// idempotency layer (only the consumer claims markers).
    pub fn from_pending(chat_id: &str, pending: &PendingMessage) -> Self {
        Self {
            entry_id: format!("pending:{}", pending.entry_id()),
            chat_id: chat_id.to_owned(),
            user_id: pending.user_id.clone(),
            text: pending.content.clone(),
            thread_id: pending.thread_id.clone(),
            sender: pending.sender.clone(),
        }
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
