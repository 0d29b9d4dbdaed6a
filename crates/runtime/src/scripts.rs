// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Registry of server-side atomic scripts.
//!
//! Scripts are uploaded on first use and executed by digest. A store
//! that restarts (or an LRU-evicted script cache) answers `NOSCRIPT`;
//! the registry evicts its cached digest, re-uploads, and retries the
//! call exactly once. Loads are serialized per script name so a burst
//! of first calls uploads each script a single time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::RelayError;
use crate::store::Store;

fn is_noscript(e: &redis::RedisError) -> bool {
    e.kind() == redis::ErrorKind::NoScriptError
}

/// Process-local bookkeeping behind the registry: sources, cached
/// digests, and the per-name upload gates.
struct ScriptCatalog {
    sources: Mutex<HashMap<&'static str, &'static str>>,
    digests: Mutex<HashMap<&'static str, String>>,
    loads: Mutex<HashMap<&'static str, Arc<tokio::sync::Mutex<()>>>>,
}

impl ScriptCatalog {
    fn new() -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            digests: Mutex::new(HashMap::new()),
            loads: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotent; later registrations of the same name keep the first
    /// source.
    fn register(&self, name: &'static str, source: &'static str) {
        if let Ok(mut sources) = self.sources.lock() {
            sources.entry(name).or_insert(source);
        }
        if let Ok(mut loads) = self.loads.lock() {
            loads.entry(name).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())));
        }
    }

    fn source_of(&self, name: &str) -> Option<&'static str> {
        self.sources.lock().ok().and_then(|s| s.get(name).copied())
    }

    fn cached_digest(&self, name: &str) -> Option<String> {
        self.digests.lock().ok().and_then(|d| d.get(name).cloned())
    }

    fn store_digest(&self, name: &'static str, digest: String) {
        if let Ok(mut digests) = self.digests.lock() {
            digests.insert(name, digest);
        }
    }

    fn evict_digest(&self, name: &str) {
        if let Ok(mut digests) = self.digests.lock() {
            digests.remove(name);
        }
    }

    fn load_gate(&self, name: &str) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.loads.lock().ok().and_then(|l| l.get(name).cloned())
    }
}

/// Named script registry, safe for concurrent use behind an `Arc`.
pub struct ScriptRegistry {
    store: Store,
    catalog: ScriptCatalog,
}

impl ScriptRegistry {
    pub fn new(store: Store) -> Self {
        Self { store, catalog: ScriptCatalog::new() }
    }

    /// Register a script under a stable name. Idempotent; later
    /// registrations of the same name keep the first source.
    pub fn register(&self, name: &'static str, source: &'static str) {
        self.catalog.register(name, source);
    }

    /// Upload the script and cache its server-assigned digest.
    async fn load(&self, op: &'static str, name: &'static str) -> Result<String, RelayError> {
        let source = self
            .catalog
            .source_of(name)
            .ok_or_else(|| RelayError::ScriptMissing { name: name.to_owned() })?;

        let gate = self
            .catalog
            .load_gate(name)
            .ok_or_else(|| RelayError::ScriptMissing { name: name.to_owned() })?;
        let _serialized = gate.lock().await;

        // Another caller may have finished the upload while we waited.
        if let Some(digest) = self.catalog.cached_digest(name) {
            return Ok(digest);
        }

        let mut conn = self.store.conn();
        let digest: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(source)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store(op, e))?;

        tracing::debug!(script = name, digest = %digest, "script loaded");
        self.catalog.store_digest(name, digest.clone());
        Ok(digest)
    }

    async fn evalsha<T: redis::FromRedisValue>(
        &self,
        digest: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<T, redis::RedisError> {
        let mut conn = self.store.conn();
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(digest).arg(keys.len());
        for key in keys {
            cmd.arg(key);
        }
        for arg in args {
            cmd.arg(arg);
        }
        cmd.query_async(&mut conn).await
    }

    /// Execute a registered script by digest. `op` tags any store error
    /// with the caller's operation name.
    pub async fn exec<T: redis::FromRedisValue>(
        &self,
        op: &'static str,
        name: &'static str,
        keys: &[String],
        args: &[String],
    ) -> Result<T, RelayError> {
        let digest = match self.catalog.cached_digest(name) {
            Some(digest) => digest,
            None => self.load(op, name).await?,
        };

        match self.evalsha(&digest, keys, args).await {
            Ok(value) => Ok(value),
            Err(e) if is_noscript(&e) => {
                // Evicted server-side; reload and retry exactly once.
                self.catalog.evict_digest(name);
                let digest = self.load(op, name).await?;
                self.evalsha(&digest, keys, args)
                    .await
                    .map_err(|e| RelayError::store(op, e))
            }
            Err(e) => Err(RelayError::store(op, e)),
        }
    }
}

#[cfg(test)]
#[path = "scripts_tests.rs"]
mod tests;
