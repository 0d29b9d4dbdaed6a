// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared store handle and key layout.
//!
//! One [`Store`] is built per process and cloned into every component.
//! All keys for a deployment live under a single domain prefix; the
//! queue pair carries a `{chat}` hash tag so both keys land on the same
//! cluster shard (the queue scripts assume locality).

use redis::aio::ConnectionManager;

use crate::error::RelayError;

/// Key builders for every record kind, parameterized by domain prefix.
#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: &str) -> Self {
        Self { prefix: prefix.to_owned() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn session_key(&self, id: &str) -> String {
        format!("{}:session:{id}", self.prefix)
    }

    pub fn lock_key(&self, id: &str) -> String {
        format!("{}:lock:{id}", self.prefix)
    }

    pub fn lock_holder_key(&self, id: &str) -> String {
        format!("{}:lock:holder:{id}", self.prefix)
    }

    pub fn gate_key(&self, chat_id: &str) -> String {
        format!("{}:processing:{chat_id}", self.prefix)
    }

    /// Queue payload map. The `{...}` hash tag keeps it co-located with
    /// the order index on clustered stores.
    pub fn queue_data_key(&self, chat_id: &str) -> String {
        format!("{}:pending:data:{{{chat_id}}}", self.prefix)
    }

    /// Queue order index, co-located with the payload map.
    pub fn queue_order_key(&self, chat_id: &str) -> String {
        format!("{}:pending:order:{{{chat_id}}}", self.prefix)
    }

    /// Idempotency markers live in the shared message-queue namespace,
    /// not under the domain prefix.
    pub fn marker_key(&self, entry_id: &str) -> String {
        format!("mq:processed:{entry_id}")
    }
}

/// Store handle: connection manager plus the domain key layout.
#[derive(Clone)]
pub struct Store {
    manager: ConnectionManager,
    keys: KeyLayout,
}

impl Store {
    /// Connect to the store and build the shared handle.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, RelayError> {
        let client = redis::Client::open(url).map_err(|e| RelayError::store("connect", e))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| RelayError::store("connect", e))?;
        Ok(Self { manager, keys: KeyLayout::new(prefix) })
    }

    /// Build a handle from an existing connection manager (tests).
    pub fn from_manager(manager: ConnectionManager, prefix: &str) -> Self {
        Self { manager, keys: KeyLayout::new(prefix) }
    }

    /// Cheap per-call-site connection clone.
    pub fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub fn keys(&self) -> &KeyLayout {
        &self.keys
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
