// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Distributed exclusive lock with re-entrancy and scoped release.
//!
//! `with_lock` is the primary surface: it acquires the session lock,
//! runs the body, and releases on every exit path. Release runs the
//! compare-and-delete script under its own 5 s budget so cancellation
//! of the caller can never strand a lock; if the task is cancelled or
//! panics mid-body, an RAII guard spawns the same release detached.
//!
//! Re-entrancy is tracked in a task-local scope (key → token + depth),
//! so nested `with_lock` calls for the same session run the body
//! directly and only the outermost frame touches the store.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::RelayError;
use crate::scripts::ScriptRegistry;
use crate::store::Store;

const RELEASE_NAME: &str = "lock_release";

// KEYS[1]=lock KEYS[2]=holder ARGV[1]=token
const RELEASE_SRC: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1], KEYS[2])
end
return 0
"#;

const BACKOFF_START: Duration = Duration::from_millis(50);
const BACKOFF_CAP: Duration = Duration::from_millis(500);
const RELEASE_BUDGET: Duration = Duration::from_secs(5);
const FALLBACK_HOLDER: &str = "unknown";

tokio::task_local! {
    static LOCK_SCOPE: RefCell<HashMap<String, HeldLock>>;
}

/// Depth of one held key in the task scope. The token itself stays in
/// the acquiring frame's release guard; inner frames only nest.
struct HeldLock {
    depth: u32,
}

/// 128-bit random token, hex-encoded.
fn fresh_token() -> String {
    let (hi, lo): (u64, u64) = rand::rng().random();
    format!("{hi:016x}{lo:016x}")
}

/// Next step of the acquisition backoff schedule (50 ms → 500 ms, ×2).
fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_CAP)
}

/// Extract the human-readable name from a stored `token|name` value.
fn parse_holder(raw: &str) -> Option<String> {
    raw.split_once('|').map(|(_, name)| name.to_owned())
}

/// Exclusive distributed lock manager for session-scoped critical
/// sections.
#[derive(Clone)]
pub struct LockManager {
    store: Store,
    registry: Arc<ScriptRegistry>,
    ttl_secs: u64,
    acquire_timeout: Duration,
}

impl LockManager {
    pub fn new(
        store: Store,
        registry: Arc<ScriptRegistry>,
        ttl_secs: u64,
        acquire_timeout: Duration,
    ) -> Self {
        registry.register(RELEASE_NAME, RELEASE_SRC);
        Self { store, registry, ttl_secs, acquire_timeout }
    }

    /// Run `body` with the session lock held.
    ///
    /// Re-entrant: a task already holding this session's lock runs the
    /// body directly with the scope depth bumped. A handler must never
    /// take a second, distinct session lock; re-entering the same one
    /// is the supported shape.
    pub async fn with_lock<T, F, Fut>(
        &self,
        session_id: &str,
        holder_name: Option<&str>,
        body: F,
    ) -> Result<T, RelayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let key = self.store.keys().lock_key(session_id);

        // Re-entrant fast path: same task, same key.
        let reentered = LOCK_SCOPE
            .try_with(|scope| {
                let mut held = scope.borrow_mut();
                if let Some(entry) = held.get_mut(&key) {
                    entry.depth += 1;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if reentered {
            let result = body().await;
            let _ = LOCK_SCOPE.try_with(|scope| {
                let mut held = scope.borrow_mut();
                if let Some(entry) = held.get_mut(&key) {
                    entry.depth = entry.depth.saturating_sub(1);
                }
            });
            return result;
        }

        let token = fresh_token();
        let holder_key = self.store.keys().lock_holder_key(session_id);
        let holder_value =
            format!("{token}|{}", holder_name.unwrap_or(FALLBACK_HOLDER));

        self.acquire(session_id, &key, &token).await?;

        if let Err(e) = self.write_holder(&holder_key, &holder_value).await {
            // Attribution record failed; back the lock out rather than
            // holding it anonymously.
            ReleaseInner {
                registry: Arc::clone(&self.registry),
                lock_key: key,
                holder_key,
                token,
            }
            .release()
            .await;
            return Err(e);
        }

        let guard = ReleaseGuard::new(
            Arc::clone(&self.registry),
            key.clone(),
            holder_key,
            token,
        );

        let result = if LOCK_SCOPE.try_with(|_| ()).is_ok() {
            // Nested under a different session's lock: record this key
            // in the existing scope for the duration of the body.
            LOCK_SCOPE.with(|scope| {
                scope.borrow_mut().insert(key.clone(), HeldLock { depth: 1 });
            });
            let result = body().await;
            let _ = LOCK_SCOPE.try_with(|scope| {
                scope.borrow_mut().remove(&key);
            });
            result
        } else {
            let mut held = HashMap::new();
            held.insert(key.clone(), HeldLock { depth: 1 });
            LOCK_SCOPE.scope(RefCell::new(held), body()).await
        };

        guard.finish().await;
        result
    }

    /// Who currently holds the session lock, if readable.
    pub async fn get_holder(&self, session_id: &str) -> Result<Option<String>, RelayError> {
        let key = self.store.keys().lock_holder_key(session_id);
        let mut conn = self.store.conn();
        let raw: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store("lock_get_holder", e))?;
        Ok(raw.as_deref().and_then(parse_holder))
    }

    /// Advisory, non-reentrant lock: no token, no holder record.
    /// Already-held is a normal `false`, not an error.
    pub async fn try_acquire_shared(&self, key_id: &str, ttl: Duration) -> Result<bool, RelayError> {
        let key = self.store.keys().lock_key(key_id);
        let mut conn = self.store.conn();
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store("lock_acquire", e))?;
        Ok(set.is_some())
    }

    /// Drop an advisory lock.
    pub async fn release_shared(&self, key_id: &str) -> Result<(), RelayError> {
        let key = self.store.keys().lock_key(key_id);
        let mut conn = self.store.conn();
        let _: i64 = redis::cmd("DEL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store("lock_release", e))?;
        Ok(())
    }

    async fn acquire(&self, session_id: &str, key: &str, token: &str) -> Result<(), RelayError> {
        let deadline = tokio::time::Instant::now() + self.acquire_timeout;
        let mut backoff = BACKOFF_START;
        loop {
            let mut conn = self.store.conn();
            let set: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(token)
                .arg("NX")
                .arg("EX")
                .arg(self.ttl_secs)
                .query_async(&mut conn)
                .await
                .map_err(|e| RelayError::store("lock_acquire", e))?;
            if set.is_some() {
                return Ok(());
            }
            if tokio::time::Instant::now() + backoff > deadline {
                let holder = self.get_holder(session_id).await.unwrap_or(None);
                return Err(RelayError::LockContention { holder });
            }
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }

    async fn write_holder(&self, holder_key: &str, value: &str) -> Result<(), RelayError> {
        let mut conn = self.store.conn();
        let _: () = redis::cmd("SET")
            .arg(holder_key)
            .arg(value)
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store("lock_set_holder", e))?;
        Ok(())
    }
}

struct ReleaseInner {
    registry: Arc<ScriptRegistry>,
    lock_key: String,
    holder_key: String,
    token: String,
}

impl ReleaseInner {
    /// Run the compare-and-delete script under the detached release
    /// budget. Outcomes are logged, never propagated: by this point the
    /// body's result is what the caller cares about.
    async fn release(self) {
        let keys = [self.lock_key.clone(), self.holder_key.clone()];
        let args = [self.token.clone()];
        let call = self.registry.exec::<i64>("lock_release", RELEASE_NAME, &keys, &args);
        match tokio::time::timeout(RELEASE_BUDGET, call).await {
            Ok(Ok(deleted)) if deleted == 0 => {
                // Token mismatch: TTL expired and someone else now holds it.
                tracing::warn!(key = %self.lock_key, "lock already rotated at release");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(key = %self.lock_key, err = %e, "lock release failed");
            }
            Err(_) => {
                tracing::warn!(key = %self.lock_key, "lock release timed out");
            }
        }
    }
}

/// Releases the lock when the owning frame exits, however it exits.
struct ReleaseGuard {
    inner: Option<ReleaseInner>,
}

impl ReleaseGuard {
    fn new(
        registry: Arc<ScriptRegistry>,
        lock_key: String,
        holder_key: String,
        token: String,
    ) -> Self {
        Self { inner: Some(ReleaseInner { registry, lock_key, holder_key, token }) }
    }

    /// Normal path: await the release inline, then disarm.
    async fn finish(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release().await;
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        // Cancellation or panic path: the release still has to happen,
        // on a fresh task the dying one cannot cancel.
        if let Some(inner) = self.inner.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { inner.release().await });
                }
                Err(_) => {
                    tracing::warn!(key = %inner.lock_key, "lock release dropped: no runtime");
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
