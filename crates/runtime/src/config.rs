// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashSet;
use std::time::Duration;

use clap::Parser;

/// Worker configuration. Every option has an env mapping so deployments
/// can stay flag-free.
#[derive(Debug, Parser)]
#[command(name = "relay", version, about)]
pub struct Config {
    /// Store URL.
    #[arg(long, env = "RELAY_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Domain key prefix for every record this worker owns.
    #[arg(long, env = "RELAY_KEY_PREFIX", default_value = "relay")]
    pub key_prefix: String,

    /// Inbound message stream key.
    #[arg(long, env = "RELAY_INBOUND_STREAM", default_value = "chat:bot:inbound")]
    pub inbound_stream: String,

    /// Outbound reply stream key.
    #[arg(long, env = "RELAY_REPLY_STREAM", default_value = "chat:bot:reply")]
    pub reply_stream: String,

    /// Consumer group name.
    #[arg(long, env = "RELAY_GROUP", default_value = "relay-workers")]
    pub group: String,

    /// Consumer name within the group. Defaults to a per-process random
    /// name so replicas never collide.
    #[arg(long, env = "RELAY_CONSUMER_NAME")]
    pub consumer_name: Option<String>,

    /// Worker pool size for the consumer.
    #[arg(long, env = "RELAY_CONCURRENCY", default_value_t = 5)]
    pub concurrency: usize,

    /// Max entries per blocking read.
    #[arg(long, env = "RELAY_BATCH_SIZE", default_value_t = 10)]
    pub batch_size: usize,

    /// Blocking read budget in milliseconds.
    #[arg(long, env = "RELAY_BLOCK_TIMEOUT_MS", default_value_t = 5000)]
    pub block_timeout_ms: u64,

    /// Approximate cap on the reply log.
    #[arg(long, env = "RELAY_STREAM_MAXLEN", default_value_t = 1000)]
    pub stream_maxlen: usize,

    /// TTL for `processing` idempotency markers and the chat gate.
    #[arg(long, env = "RELAY_PROCESSING_TTL_SECS", default_value_t = 120)]
    pub processing_ttl_secs: u64,

    /// Retention for `completed` idempotency markers.
    #[arg(long, env = "RELAY_COMPLETED_TTL_SECS", default_value_t = 86_400)]
    pub completed_ttl_secs: u64,

    /// Session lock durability.
    #[arg(long, env = "RELAY_LOCK_TTL_SECS", default_value_t = 300)]
    pub lock_ttl_secs: u64,

    /// Lock contention budget.
    #[arg(long, env = "RELAY_LOCK_ACQUIRE_TIMEOUT_SECS", default_value_t = 60)]
    pub lock_acquire_timeout_secs: u64,

    /// Pending queue capacity per chat.
    #[arg(long, env = "RELAY_QUEUE_MAX_SIZE", default_value_t = 5)]
    pub queue_max_size: usize,

    /// Age past which a queued message is discarded instead of replayed.
    #[arg(long, env = "RELAY_QUEUE_STALE_THRESHOLD_MS", default_value_t = 3_600_000)]
    pub queue_stale_threshold_ms: u64,

    /// Drain cap per gate tenure.
    #[arg(long, env = "RELAY_QUEUE_MAX_DEQUEUE_ITERATIONS", default_value_t = 10)]
    pub queue_max_dequeue_iterations: u32,

    /// Joint TTL on the queue key pair.
    #[arg(long, env = "RELAY_QUEUE_TTL_SECS", default_value_t = 3600)]
    pub queue_ttl_secs: u64,

    /// Session record TTL.
    #[arg(long, env = "RELAY_SESSION_TTL_SECS", default_value_t = 86_400)]
    pub session_ttl_secs: u64,

    /// Comma-separated chat ids admitted to this worker. Unset = all.
    #[arg(long, env = "RELAY_ALLOWED_CHATS", value_delimiter = ',')]
    pub allowed_chats: Option<Vec<String>>,

    /// Create a missing consumer group at the stream start instead of
    /// its tail (reprocesses the backlog once).
    #[arg(long, env = "RELAY_RESET_OFFSET_ON_START")]
    pub reset_offset_on_start: bool,

    /// Idle time before a peer's unacked delivery is stolen.
    #[arg(long, env = "RELAY_CLAIM_MIN_IDLE_MS", default_value_t = 60_000)]
    pub claim_min_idle_ms: u64,

    /// Cadence of the reclaim pass.
    #[arg(long, env = "RELAY_CLAIM_INTERVAL_MS", default_value_t = 30_000)]
    pub claim_interval_ms: u64,

    /// Log format (json or text).
    #[arg(long, env = "RELAY_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch size must be at least 1");
        }
        if self.queue_max_size == 0 {
            anyhow::bail!("queue max size must be at least 1");
        }
        if self.log_format != "json" && self.log_format != "text" {
            anyhow::bail!("invalid log format: {}", self.log_format);
        }
        Ok(())
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_acquire_timeout_secs)
    }

    pub fn claim_min_idle(&self) -> Duration {
        Duration::from_millis(self.claim_min_idle_ms)
    }

    pub fn claim_interval(&self) -> Duration {
        Duration::from_millis(self.claim_interval_ms.max(1000))
    }

    /// Configured consumer name, or a fresh per-process one.
    pub fn effective_consumer_name(&self) -> String {
        self.consumer_name
            .clone()
            .unwrap_or_else(|| format!("relay-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn allowlist(&self) -> Option<HashSet<String>> {
        self.allowed_chats
            .as_ref()
            .map(|chats| chats.iter().map(|c| c.trim().to_owned()).collect())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
