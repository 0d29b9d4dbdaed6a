// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded per-chat FIFO of deferred messages.
//!
//! Two co-located keys per chat: a payload map (entry id → JSON) and an
//! order index sorted by enqueue timestamp. Both are only ever mutated
//! together inside one script, and both expire together, so neither can
//! dangle without the other.
//!
//! The dedup check runs before the capacity check: a duplicate press of
//! send on a full queue reports `duplicate`, keeping the reply stable
//! for identical user intent.

use std::sync::Arc;

use crate::error::RelayError;
use crate::message::PendingMessage;
use crate::scripts::ScriptRegistry;
use crate::store::{epoch_ms, Store};

const ENQUEUE_NAME: &str = "queue_enqueue";
const DEQUEUE_NAME: &str = "queue_dequeue";

// KEYS[1]=data KEYS[2]=order
// ARGV[1]=entry id ARGV[2]=score ms ARGV[3]=payload ARGV[4]=max size ARGV[5]=ttl secs
const ENQUEUE_SRC: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
  return 'duplicate'
end
if redis.call('ZCARD', KEYS[2]) >= tonumber(ARGV[4]) then
  return 'queue_full'
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[2], tonumber(ARGV[2]), ARGV[1])
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[5]))
redis.call('EXPIRE', KEYS[2], tonumber(ARGV[5]))
return 'queued'
"#;

// KEYS[1]=data KEYS[2]=order
// ARGV[1]=now ms ARGV[2]=stale threshold ms ARGV[3]=ttl secs
//
// If the oldest entry is stale the whole stale prefix is discarded and
// the queue reports empty: a backlog from a long outage is never replayed.
const DEQUEUE_SRC: &str = r#"
local head = redis.call('ZRANGE', KEYS[2], 0, 0, 'WITHSCORES')
if #head == 0 then
  return {'empty'}
end
local cutoff = tonumber(ARGV[1]) - tonumber(ARGV[2])
if tonumber(head[2]) < cutoff then
  local stale = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', '(' .. cutoff)
  for i = 1, #stale do
    redis.call('HDEL', KEYS[1], stale[i])
  end
  redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', '(' .. cutoff)
  return {'empty'}
end
local id = head[1]
local payload = redis.call('HGET', KEYS[1], id)
redis.call('ZREM', KEYS[2], id)
redis.call('HDEL', KEYS[1], id)
if redis.call('ZCARD', KEYS[2]) > 0 then
  redis.call('EXPIRE', KEYS[1], tonumber(ARGV[3]))
  redis.call('EXPIRE', KEYS[2], tonumber(ARGV[3]))
end
if not payload then
  return {'empty'}
end
return {'dequeued', payload}
"#;

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    Duplicate,
    Full,
}

/// Outcome of a dequeue attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dequeue {
    Item(PendingMessage),
    Empty,
    /// The drain iteration cap was hit before the store was consulted.
    Exhausted,
}

/// Client-side drain counter check; past the cap the store round trip
/// is skipped entirely.
fn drain_cap_reached(iteration: u32, max: u32) -> bool {
    iteration >= max
}

fn parse_enqueue(verdict: &str) -> Result<Enqueue, RelayError> {
    match verdict {
        "queued" => Ok(Enqueue::Queued),
        "duplicate" => Ok(Enqueue::Duplicate),
        "queue_full" => Ok(Enqueue::Full),
        other => Err(RelayError::DataCorruption {
            what: "queue".to_owned(),
            detail: format!("unexpected enqueue verdict {other:?}"),
        }),
    }
}

fn parse_dequeue(reply: Vec<String>) -> Result<Dequeue, RelayError> {
    match reply.first().map(String::as_str) {
        Some("dequeued") => {
            let payload = reply.get(1).ok_or_else(|| RelayError::DataCorruption {
                what: "queue".to_owned(),
                detail: "dequeued reply without payload".to_owned(),
            })?;
            let pending = serde_json::from_str(payload).map_err(|e| {
                RelayError::DataCorruption { what: "pending".to_owned(), detail: e.to_string() }
            })?;
            Ok(Dequeue::Item(pending))
        }
        Some("empty") | None => Ok(Dequeue::Empty),
        Some(other) => Err(RelayError::DataCorruption {
            what: "queue".to_owned(),
            detail: format!("unexpected dequeue verdict {other:?}"),
        }),
    }
}

/// Bounded FIFO of deferred messages for one domain prefix.
#[derive(Clone)]
pub struct PendingQueue {
    store: Store,
    registry: Arc<ScriptRegistry>,
    max_size: usize,
    stale_threshold_ms: u64,
    max_dequeue_iterations: u32,
    ttl_secs: u64,
}

impl PendingQueue {
    pub fn new(
        store: Store,
        registry: Arc<ScriptRegistry>,
        max_size: usize,
        stale_threshold_ms: u64,
        max_dequeue_iterations: u32,
        ttl_secs: u64,
    ) -> Self {
        registry.register(ENQUEUE_NAME, ENQUEUE_SRC);
        registry.register(DEQUEUE_NAME, DEQUEUE_SRC);
        Self { store, registry, max_size, stale_threshold_ms, max_dequeue_iterations, ttl_secs }
    }

    pub fn max_dequeue_iterations(&self) -> u32 {
        self.max_dequeue_iterations
    }

    fn pair(&self, chat_id: &str) -> [String; 2] {
        [
            self.store.keys().queue_data_key(chat_id),
            self.store.keys().queue_order_key(chat_id),
        ]
    }

    /// Buffer a message for later execution.
    pub async fn enqueue(
        &self,
        chat_id: &str,
        pending: &PendingMessage,
    ) -> Result<Enqueue, RelayError> {
        let payload =
            serde_json::to_string(pending).map_err(|e| RelayError::DataCorruption {
                what: "pending".to_owned(),
                detail: e.to_string(),
            })?;
        let keys = self.pair(chat_id);
        let args = [
            pending.entry_id(),
            pending.enqueued_at_ms.to_string(),
            payload,
            self.max_size.to_string(),
            self.ttl_secs.to_string(),
        ];
        let verdict: String =
            self.registry.exec("queue_enqueue", ENQUEUE_NAME, &keys, &args).await?;
        parse_enqueue(&verdict)
    }

    /// Pop the oldest entry. `iteration` is the caller's drain counter;
    /// past the configured cap the store is not consulted at all.
    pub async fn dequeue(&self, chat_id: &str, iteration: u32) -> Result<Dequeue, RelayError> {
        if drain_cap_reached(iteration, self.max_dequeue_iterations) {
            return Ok(Dequeue::Exhausted);
        }
        let keys = self.pair(chat_id);
        let args = [
            epoch_ms().to_string(),
            self.stale_threshold_ms.to_string(),
            self.ttl_secs.to_string(),
        ];
        let reply: Vec<String> =
            self.registry.exec("queue_dequeue", DEQUEUE_NAME, &keys, &args).await?;
        parse_dequeue(reply)
    }

    pub async fn size(&self, chat_id: &str) -> Result<usize, RelayError> {
        let order = self.store.keys().queue_order_key(chat_id);
        let mut conn = self.store.conn();
        redis::cmd("ZCARD")
            .arg(&order)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store("queue_size", e))
    }

    pub async fn has_pending(&self, chat_id: &str) -> Result<bool, RelayError> {
        Ok(self.size(chat_id).await? > 0)
    }

    /// Drop both keys. A single DEL keeps the pair atomic.
    pub async fn clear(&self, chat_id: &str) -> Result<(), RelayError> {
        let [data, order] = self.pair(chat_id);
        let mut conn = self.store.conn();
        let _: i64 = redis::cmd("DEL")
            .arg(&data)
            .arg(&order)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store("queue_clear", e))?;
        Ok(())
    }

    /// Raw payload map for maintenance tooling.
    pub async fn raw_entries(
        &self,
        chat_id: &str,
    ) -> Result<std::collections::HashMap<String, String>, RelayError> {
        let data = self.store.keys().queue_data_key(chat_id);
        let mut conn = self.store.conn();
        redis::cmd("HGETALL")
            .arg(&data)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store("queue_entries", e))
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
