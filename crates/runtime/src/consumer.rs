// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stream consumer: blocking group reads feeding a bounded worker pool.
//!
//! The read runs under its own budget (block timeout + slack) so the
//! server-side block never races shutdown of the parent; shutdown is
//! observed between reads and while waiting for a pool slot. ACKs only
//! ever happen inside the idempotency scripts — a handler error leaves
//! the marker to expire and the entry to be redelivered.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::marker::{Claim, MarkerStore};
use crate::message::InboundMessage;
use crate::store::Store;

/// Slack added to the server-side block timeout for the read budget.
const READ_SLACK: Duration = Duration::from_secs(2);
/// How long shutdown waits for in-flight handlers.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);
/// Pause after creating a missing consumer group.
const GROUP_RETRY_BACKOFF: Duration = Duration::from_millis(500);
/// Pause after a transient read failure.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Boxed-future seam between the consumer and the dispatch pipeline.
pub trait StreamHandler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        message: &'a InboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send + 'a>>;
}

/// Consumer tuning; see the worker config for the env mapping.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub stream_key: String,
    pub group: String,
    pub consumer_name: String,
    pub batch_size: usize,
    pub block_timeout: Duration,
    pub concurrency: usize,
    /// Create a missing group at `0` (reprocess backlog) instead of `$`.
    pub reset_offset_on_start: bool,
    /// How long a delivery may sit unacked with another consumer before
    /// this one steals it.
    pub claim_min_idle: Duration,
    /// Cadence of the steal pass.
    pub claim_interval: Duration,
}

/// Reads the inbound log as a named group member and dispatches entries
/// to the handler under bounded concurrency.
pub struct StreamConsumer {
    store: Store,
    markers: MarkerStore,
    handler: Arc<dyn StreamHandler>,
    config: ConsumerConfig,
    inflight: Arc<Mutex<HashSet<String>>>,
}

/// Removes an entry id from the in-flight set when the worker exits,
/// panic included.
struct InflightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

fn is_nogroup(e: &redis::RedisError) -> bool {
    e.code() == Some("NOGROUP")
}

fn is_busygroup(e: &redis::RedisError) -> bool {
    e.code() == Some("BUSYGROUP")
}

impl StreamConsumer {
    pub fn new(
        store: Store,
        markers: MarkerStore,
        handler: Arc<dyn StreamHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self { store, markers, handler, config, inflight: Arc::new(Mutex::new(HashSet::new())) }
    }

    /// Consume until the token cancels, then drain workers up to the
    /// shutdown budget.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            stream = %self.config.stream_key,
            group = %self.config.group,
            consumer = %self.config.consumer_name,
            concurrency = self.config.concurrency,
            "consumer starting"
        );
        let mut workers: JoinSet<()> = JoinSet::new();
        let pool = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let read_budget = self.config.block_timeout + READ_SLACK;
        let mut reclaim = tokio::time::interval(self.config.claim_interval);
        reclaim.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            // Reap finished workers; surface panics.
            while let Some(result) = workers.try_join_next() {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!(err = %e, "worker panicked");
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                read = tokio::time::timeout(read_budget, self.read_batch()) => match read {
                    Err(_) => {
                        // The decoupled budget elapsed; treat as an empty read.
                        debug!("read exceeded block budget");
                    }
                    Ok(Err(e)) if is_nogroup(&e) => {
                        self.create_group().await;
                        tokio::time::sleep(GROUP_RETRY_BACKOFF).await;
                    }
                    Ok(Err(e)) => {
                        warn!(err = %e, "stream read failed");
                        tokio::time::sleep(READ_ERROR_BACKOFF).await;
                    }
                    Ok(Ok(entries)) => {
                        for (id, fields) in entries {
                            self.submit(&mut workers, &pool, &shutdown, id, fields).await;
                        }
                    }
                },
                _ = reclaim.tick() => match self.reclaim_batch().await {
                    Ok(entries) if !entries.is_empty() => {
                        info!(count = entries.len(), "reclaimed stale deliveries");
                        for (id, fields) in entries {
                            self.submit(&mut workers, &pool, &shutdown, id, fields).await;
                        }
                    }
                    Ok(_) => {}
                    // Nothing to steal from before the group exists.
                    Err(e) if is_nogroup(&e) => {}
                    Err(e) => {
                        warn!(err = %e, "reclaim pass failed");
                    }
                },
            }
        }

        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
            warn!("shutdown_timeout: abandoning in-flight workers");
        }
        info!("consumer stopped");
    }

    async fn read_batch(
        &self,
    ) -> Result<Vec<(String, HashMap<String, redis::Value>)>, redis::RedisError> {
        let opts = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer_name)
            .count(self.config.batch_size)
            .block(self.config.block_timeout.as_millis() as usize);
        let mut conn = self.store.conn();
        let reply: StreamReadReply =
            conn.xread_options(&[&self.config.stream_key], &[">"], &opts).await?;
        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                entries.push((id.id, id.map));
            }
        }
        Ok(entries)
    }

    /// Steal deliveries another consumer read but never acked. The
    /// idempotency marker still decides whether anything runs, so a
    /// slow-but-alive peer costs a skip, not a double execution.
    async fn reclaim_batch(
        &self,
    ) -> Result<Vec<(String, HashMap<String, redis::Value>)>, redis::RedisError> {
        let mut conn = self.store.conn();
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(&self.config.consumer_name)
            .arg(self.config.claim_min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(self.config.batch_size)
            .query_async(&mut conn)
            .await?;
        // Reply shape: [next-cursor, entries (XRANGE shape), deleted-ids].
        let parts: Vec<redis::Value> = redis::from_redis_value(&reply)?;
        let Some(claimed) = parts.get(1) else { return Ok(vec![]) };
        let entries: redis::streams::StreamRangeReply = redis::from_redis_value(claimed)?;
        Ok(entries.ids.into_iter().map(|entry| (entry.id, entry.map)).collect())
    }

    async fn create_group(&self) {
        let start = if self.config.reset_offset_on_start { "0" } else { "$" };
        let mut conn = self.store.conn();
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&self.config.stream_key, &self.config.group, start)
            .await;
        match created {
            Ok(()) => {
                info!(group = %self.config.group, start, "consumer group created");
            }
            Err(e) if is_busygroup(&e) => {}
            Err(e) => {
                warn!(err = %e, "consumer group create failed");
            }
        }
    }

    /// Hand one raw entry to the worker pool. Blocks while the pool is
    /// saturated, which is the read loop's backpressure.
    async fn submit(
        &self,
        workers: &mut JoinSet<()>,
        pool: &Arc<Semaphore>,
        shutdown: &CancellationToken,
        id: String,
        fields: HashMap<String, redis::Value>,
    ) {
        let msg = match InboundMessage::from_entry(&id, &fields) {
            Ok(msg) => msg,
            Err(reject) => {
                // Malformed producers must not wedge the group: ACK and move on.
                warn!(entry = %id, reason = %reject, "invalid entry, acking");
                self.ack_invalid(&id).await;
                return;
            }
        };

        {
            let Ok(mut inflight) = self.inflight.lock() else { return };
            if !inflight.insert(id.clone()) {
                debug!(entry = %id, "entry already in flight, skipping");
                return;
            }
        }
        let guard = InflightGuard { set: Arc::clone(&self.inflight), id: id.clone() };

        let permit = tokio::select! {
            _ = shutdown.cancelled() => return,
            permit = Arc::clone(pool).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let markers = self.markers.clone();
        let handler = Arc::clone(&self.handler);
        workers.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            match markers.claim_or_skip(&msg.entry_id).await {
                Ok(Claim::Proceed) => {}
                Ok(Claim::SkipCompleted) => {
                    debug!(entry = %msg.entry_id, "already completed, skipped");
                    return;
                }
                Ok(Claim::SkipInProgress) => {
                    debug!(entry = %msg.entry_id, "claimed elsewhere, skipped");
                    return;
                }
                Err(e) => {
                    warn!(entry = %msg.entry_id, err = %e, "claim failed");
                    return;
                }
            }
            match handler.handle(&msg).await {
                Ok(()) => {
                    if let Err(e) = markers.mark_completed(&msg.entry_id).await {
                        warn!(entry = %msg.entry_id, err = %e, "completion mark failed");
                    }
                }
                Err(e) => {
                    // No ACK: the processing marker expires and the
                    // entry is redelivered.
                    warn!(entry = %msg.entry_id, err = %e, "handler failed, leaving for redelivery");
                }
            }
        });
    }

    /// Plain ACK for entries that can never be processed (bad fields).
    async fn ack_invalid(&self, id: &str) {
        let mut conn = self.store.conn();
        let acked: Result<i64, redis::RedisError> =
            conn.xack(&self.config.stream_key, &self.config.group, &[id]).await;
        if let Err(e) = acked {
            warn!(entry = %id, err = %e, "ack of invalid entry failed");
        }
    }
}

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;
