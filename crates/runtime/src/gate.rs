// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-chat processing gate.
//!
//! A gate key existing means a handler is in flight for that chat.
//! `start` is the only transition in, `finish` the only voluntary
//! transition out; the TTL is the crash-recovery exit. Callers must
//! pair `start` with `finish` on every path.

use crate::error::RelayError;
use crate::store::Store;

/// Outcome of a `start` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStart {
    Acquired,
    Busy,
}

/// Map the store's `SET NX` reply onto a gate outcome: any reply means
/// the key was written, nil means someone else holds it.
fn classify_set(reply: Option<String>) -> GateStart {
    if reply.is_some() {
        GateStart::Acquired
    } else {
        GateStart::Busy
    }
}

/// Per-chat "handler in flight" marker with TTL.
#[derive(Clone)]
pub struct ProcessingGate {
    store: Store,
    ttl_secs: u64,
}

impl ProcessingGate {
    pub fn new(store: Store, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    /// Atomically claim the gate for a chat.
    pub async fn start(&self, chat_id: &str) -> Result<GateStart, RelayError> {
        let key = self.store.keys().gate_key(chat_id);
        let mut conn = self.store.conn();
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store("gate_start", e))?;
        Ok(classify_set(set))
    }

    /// Unconditionally release the gate.
    pub async fn finish(&self, chat_id: &str) -> Result<(), RelayError> {
        let key = self.store.keys().gate_key(chat_id);
        let mut conn = self.store.conn();
        let _: i64 = redis::cmd("DEL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store("gate_finish", e))?;
        Ok(())
    }

    pub async fn is_processing(&self, chat_id: &str) -> Result<bool, RelayError> {
        let key = self.store.keys().gate_key(chat_id);
        let mut conn = self.store.conn();
        redis::cmd("EXISTS")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store("gate_check", e))
    }
}

#[cfg(test)]
#[path = "gate_tests.rs"]
mod tests;
