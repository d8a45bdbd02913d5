//! In-memory persistence backend.
//!
//! Keeps records for the lifetime of the process only. Suitable for
//! clean-session clients and tests; a restart loses all in-flight state.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::backend::ClientPersistence;
use super::error::Result;

/// Process-local persistence backend
#[derive(Default)]
pub struct MemoryPersistence {
    records: Mutex<HashMap<String, Bytes>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientPersistence for MemoryPersistence {
    async fn open(&self, _client_id: &str, _server_uri: &str) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.records.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.records.lock().get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.records.lock().remove(key);
        Ok(())
    }

    async fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.records.lock().contains_key(key))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.records.lock().keys().cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        self.records.lock().clear();
        Ok(())
    }
}
