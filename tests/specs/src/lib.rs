// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Harness for end-to-end substrate tests against a real store.
//!
//! Tests are gated on `RELAY_SPEC_REDIS_URL`; without it every test
//! returns early so the suite stays green on machines with no store.
//! Each context gets a random key prefix, so suites can run in
//! parallel against one server without touching each other's keys.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay::error::RelayError;
use relay::gate::ProcessingGate;
use relay::handler::{Command, CommandHandler, HandlerFuture, ReplySink};
use relay::lock::LockManager;
use relay::marker::MarkerStore;
use relay::message::InboundMessage;
use relay::publisher::ReplyPublisher;
use relay::queue::PendingQueue;
use relay::scripts::ScriptRegistry;
use relay::session::SessionStore;
use relay::store::Store;

pub const ENV_URL: &str = "RELAY_SPEC_REDIS_URL";

/// A connected store with a unique prefix, or `None` when the suite
/// should skip.
pub struct SpecContext {
    pub store: Store,
    pub registry: Arc<ScriptRegistry>,
    prefix: String,
}

impl SpecContext {
    pub async fn connect() -> anyhow::Result<Option<Self>> {
        let Ok(url) = std::env::var(ENV_URL) else {
            eprintln!("skipping: {ENV_URL} not set");
            return Ok(None);
        };
        let prefix = format!("spec:{}", uuid::Uuid::new_v4().simple());
        let store = Store::connect(&url, &prefix).await?;
        let registry = Arc::new(ScriptRegistry::new(store.clone()));
        Ok(Some(Self { store, registry, prefix }))
    }

    /// Namespaced stream key for this context.
    pub fn stream(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.prefix)
    }

    pub fn gate(&self, ttl_secs: u64) -> ProcessingGate {
        ProcessingGate::new(self.store.clone(), ttl_secs)
    }

    pub fn queue(&self, max_size: usize, stale_ms: u64, max_iters: u32) -> PendingQueue {
        PendingQueue::new(
            self.store.clone(),
            Arc::clone(&self.registry),
            max_size,
            stale_ms,
            max_iters,
            600,
        )
    }

    pub fn locks(&self, ttl_secs: u64, acquire_timeout: Duration) -> LockManager {
        LockManager::new(self.store.clone(), Arc::clone(&self.registry), ttl_secs, acquire_timeout)
    }

    pub fn publisher(&self, stream: &str, max_len: usize) -> ReplyPublisher {
        ReplyPublisher::new(self.store.clone(), stream, max_len)
    }

    pub fn markers(&self, stream: &str, group: &str) -> MarkerStore {
        MarkerStore::new(self.store.clone(), Arc::clone(&self.registry), stream, group, 120, 600)
    }

    pub fn sessions<T: serde::Serialize + serde::de::DeserializeOwned>(
        &self,
        ttl_secs: u64,
    ) -> SessionStore<T> {
        SessionStore::new(self.store.clone(), ttl_secs)
    }

    /// Append an inbound entry; returns the assigned entry id.
    pub async fn add_inbound(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
    ) -> anyhow::Result<String> {
        let mut conn = self.store.conn();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (name, value) in fields {
            cmd.arg(*name).arg(*value);
        }
        Ok(cmd.query_async(&mut conn).await?)
    }

    /// Full contents of a stream as field maps, oldest first.
    pub async fn stream_entries(
        &self,
        stream: &str,
    ) -> anyhow::Result<Vec<HashMap<String, String>>> {
        let mut conn = self.store.conn();
        let reply: redis::streams::StreamRangeReply =
            redis::cmd("XRANGE").arg(stream).arg("-").arg("+").query_async(&mut conn).await?;
        let mut entries = Vec::new();
        for id in reply.ids {
            let mut fields = HashMap::new();
            for (name, value) in id.map {
                if let Ok(text) = redis::from_redis_value::<String>(&value) {
                    fields.insert(name, text);
                }
            }
            entries.push(fields);
        }
        Ok(entries)
    }

    /// Raw string value of a key (e.g. an idempotency marker).
    pub async fn get_raw(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.store.conn();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    /// Write a raw string value (for corruption tests).
    pub async fn set_raw(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut conn = self.store.conn();
        let _: () = redis::cmd("SET").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(())
    }
}

/// Handler that records invocations and optionally delays and replies.
pub struct RecordingHandler {
    pub calls: Arc<Mutex<Vec<String>>>,
    pub delay: Duration,
    pub reply: Option<String>,
    pub fail_with: Option<fn() -> RelayError>,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(Self {
            calls: Arc::clone(&calls),
            delay: Duration::ZERO,
            reply: Some("done".to_owned()),
            fail_with: None,
        });
        (handler, calls)
    }

    pub fn slow(delay: Duration) -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(Self {
            calls: Arc::clone(&calls),
            delay,
            reply: Some("done".to_owned()),
            fail_with: None,
        });
        (handler, calls)
    }

    pub fn failing(fail_with: fn() -> RelayError) -> Arc<Self> {
        Arc::new(Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
            reply: None,
            fail_with: Some(fail_with),
        })
    }
}

impl CommandHandler for RecordingHandler {
    fn handle<'a>(
        &'a self,
        message: &'a InboundMessage,
        command: &'a Command,
        replies: ReplySink<'a>,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(format!("{}:{}", message.chat_id, command.args));
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(fail) = self.fail_with {
                return Err(fail());
            }
            if let Some(reply) = &self.reply {
                replies.reply(reply).await?;
            }
            Ok(())
        })
    }
}

/// Poll until `probe` returns true or the deadline passes.
pub async fn wait_until<F, Fut>(budget: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
