// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reply publisher: appends outbound messages to the capped reply log.
//!
//! Failures are reported, never retried here; the caller decides what a
//! lost reply means for its own protocol.

use crate::error::RelayError;
use crate::message::{OutboundMessage, ReplyKind};
use crate::store::Store;

/// Wire framing for one reply entry. `threadId` is always present,
/// empty when the reply is not threaded.
fn wire_fields(message: &OutboundMessage) -> [(&'static str, &str); 4] {
    [
        ("chatId", message.chat_id.as_str()),
        ("text", message.text.as_str()),
        ("threadId", message.thread_id.as_deref().unwrap_or("")),
        ("type", message.kind.as_str()),
    ]
}

/// Appends outbound messages with an approximate `MAXLEN` trim.
#[derive(Clone)]
pub struct ReplyPublisher {
    store: Store,
    stream_key: String,
    max_len: usize,
}

impl ReplyPublisher {
    pub fn new(store: Store, stream_key: &str, max_len: usize) -> Self {
        Self { store, stream_key: stream_key.to_owned(), max_len }
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Append one reply. Returns the entry id the log assigned.
    pub async fn publish(&self, message: &OutboundMessage) -> Result<String, RelayError> {
        let fields = wire_fields(message);
        let mut conn = self.store.conn();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*");
        for (name, value) in fields {
            cmd.arg(name).arg(value);
        }
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store("reply_publish", e))
    }

    /// Convenience for templated notifications.
    pub async fn publish_text(
        &self,
        chat_id: &str,
        thread_id: Option<&str>,
        text: &str,
        kind: ReplyKind,
    ) -> Result<String, RelayError> {
        self.publish(&OutboundMessage {
            chat_id: chat_id.to_owned(),
            text: text.to_owned(),
            thread_id: thread_id.map(str::to_owned),
            kind,
        })
        .await
    }
}

#[cfg(test)]
#[path = "publisher_tests.rs"]
mod tests;
