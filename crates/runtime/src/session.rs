// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed JSON session records with TTL refresh.
//!
//! `load` distinguishes three outcomes: a present record, an absent one
//! (`Ok(None)`, not an error), and a record that no longer decodes
//! against the expected type, which is classified as data corruption
//! rather than a miss.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RelayError;
use crate::store::Store;

/// Classify a raw read: absent is a normal miss, an undecodable value
/// is corruption.
fn decode_record<T: DeserializeOwned>(raw: Option<String>) -> Result<Option<T>, RelayError> {
    match raw {
        None => Ok(None),
        Some(json) => serde_json::from_str(&json).map(Some).map_err(|e| {
            RelayError::DataCorruption { what: "session".to_owned(), detail: e.to_string() }
        }),
    }
}

/// Session store for one record type `T`, addressed by session id.
pub struct SessionStore<T> {
    store: Store,
    ttl_secs: u64,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for SessionStore<T> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), ttl_secs: self.ttl_secs, _record: PhantomData }
    }
}

impl<T: Serialize + DeserializeOwned> SessionStore<T> {
    pub fn new(store: Store, ttl_secs: u64) -> Self {
        Self { store, ttl_secs, _record: PhantomData }
    }

    /// Write the record, refreshing its TTL.
    pub async fn save(&self, id: &str, value: &T) -> Result<(), RelayError> {
        let payload = serde_json::to_string(value).map_err(|e| RelayError::DataCorruption {
            what: "session".to_owned(),
            detail: e.to_string(),
        })?;
        let key = self.store.keys().session_key(id);
        let mut conn = self.store.conn();
        let _: () = redis::cmd("SET")
            .arg(&key)
            .arg(payload)
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store("session_save", e))?;
        Ok(())
    }

    /// Read the record. `Ok(None)` means absent; a decode failure is
    /// reported as corruption, not a miss.
    pub async fn load(&self, id: &str) -> Result<Option<T>, RelayError> {
        let key = self.store.keys().session_key(id);
        let mut conn = self.store.conn();
        let raw: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store("session_load", e))?;
        decode_record(raw)
    }

    pub async fn delete(&self, id: &str) -> Result<(), RelayError> {
        let key = self.store.keys().session_key(id);
        let mut conn = self.store.conn();
        let _: i64 = redis::cmd("DEL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store("session_delete", e))?;
        Ok(())
    }

    pub async fn exists(&self, id: &str) -> Result<bool, RelayError> {
        let key = self.store.keys().session_key(id);
        let mut conn = self.store.conn();
        redis::cmd("EXISTS")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store("session_exists", e))
    }

    /// Push the TTL out again. Returns false when the record is gone.
    pub async fn refresh_ttl(&self, id: &str) -> Result<bool, RelayError> {
        let key = self.store.keys().session_key(id);
        let mut conn = self.store.conn();
        redis::cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store("session_refresh", e))
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
