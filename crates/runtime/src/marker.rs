// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Idempotency markers for at-least-once delivery.
//!
//! Each log entry id owns a tri-state marker: absent, `processing`, or
//! `completed`. The two scripts below are the only places an ACK is
//! ever issued, which keeps "no ACK without completion" a single-script
//! atomic fact rather than a client-side ordering hope.
//!
//! A handler failure leaves the marker at `processing`; its TTL expiry
//! re-opens the entry for the next delivery.

use std::sync::Arc;

use crate::error::RelayError;
use crate::scripts::ScriptRegistry;
use crate::store::Store;

const CLAIM_NAME: &str = "marker_claim";
const COMPLETE_NAME: &str = "marker_complete";

// KEYS[1]=marker KEYS[2]=stream ARGV[1]=group ARGV[2]=entry id ARGV[3]=processing ttl
const CLAIM_SRC: &str = r#"
local state = redis.call('GET', KEYS[1])
if state == 'completed' then
  redis.call('XACK', KEYS[2], ARGV[1], ARGV[2])
  return 'skip_completed'
end
if state then
  return 'skip_in_progress'
end
redis.call('SET', KEYS[1], 'processing', 'EX', tonumber(ARGV[3]))
return 'proceed'
"#;

// KEYS[1]=marker KEYS[2]=stream ARGV[1]=group ARGV[2]=entry id ARGV[3]=retention ttl
const COMPLETE_SRC: &str = r#"
redis.call('SET', KEYS[1], 'completed', 'EX', tonumber(ARGV[3]))
redis.call('XACK', KEYS[2], ARGV[1], ARGV[2])
return 1
"#;

/// Claim decision for one delivery of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Marker was absent; it is now `processing` and the handler runs.
    Proceed,
    /// Already completed; the script ACKed, skip without running.
    SkipCompleted,
    /// Another worker holds the `processing` marker. Do not ACK; the
    /// visibility timeout reclaims the entry if that worker dies.
    SkipInProgress,
}

/// Map the claim script's verdict string onto the tri-state decision.
fn parse_claim(verdict: &str) -> Result<Claim, RelayError> {
    match verdict {
        "proceed" => Ok(Claim::Proceed),
        "skip_completed" => Ok(Claim::SkipCompleted),
        "skip_in_progress" => Ok(Claim::SkipInProgress),
        other => Err(RelayError::DataCorruption {
            what: "marker".to_owned(),
            detail: format!("unexpected claim verdict {other:?}"),
        }),
    }
}

/// Marker store bound to one inbound stream + consumer group.
#[derive(Clone)]
pub struct MarkerStore {
    store: Store,
    registry: Arc<ScriptRegistry>,
    stream_key: String,
    group: String,
    processing_ttl_secs: u64,
    retention_ttl_secs: u64,
}

impl MarkerStore {
    pub fn new(
        store: Store,
        registry: Arc<ScriptRegistry>,
        stream_key: &str,
        group: &str,
        processing_ttl_secs: u64,
        retention_ttl_secs: u64,
    ) -> Self {
        registry.register(CLAIM_NAME, CLAIM_SRC);
        registry.register(COMPLETE_NAME, COMPLETE_SRC);
        Self {
            store,
            registry,
            stream_key: stream_key.to_owned(),
            group: group.to_owned(),
            processing_ttl_secs,
            retention_ttl_secs,
        }
    }

    /// Decide whether this delivery should run the handler.
    pub async fn claim_or_skip(&self, entry_id: &str) -> Result<Claim, RelayError> {
        let keys = [self.store.keys().marker_key(entry_id), self.stream_key.clone()];
        let args = [
            self.group.clone(),
            entry_id.to_owned(),
            self.processing_ttl_secs.to_string(),
        ];
        let verdict: String = self.registry.exec("marker_claim", CLAIM_NAME, &keys, &args).await?;
        parse_claim(&verdict)
    }

    /// Record success and ACK, atomically.
    pub async fn mark_completed(&self, entry_id: &str) -> Result<(), RelayError> {
        let keys = [self.store.keys().marker_key(entry_id), self.stream_key.clone()];
        let args = [
            self.group.clone(),
            entry_id.to_owned(),
            self.retention_ttl_secs.to_string(),
        ];
        let _: i64 = self.registry.exec("marker_complete", COMPLETE_NAME, &keys, &args).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "marker_tests.rs"]
mod tests;
