//! Persistence trait for client session state.
//!
//! This trait defines the interface for persistence backends, allowing
//! different implementations (in-memory, fjall, application-provided).
//! Values are opaque byte sequences; the engine never requires the store to
//! understand MQTT framing.

use async_trait::async_trait;
use bytes::Bytes;

use super::error::Result;

/// Key-value store scoped to one `(client_id, server_uri)` session
#[async_trait]
pub trait ClientPersistence: Send + Sync {
    /// Open the store for the given client/server pair.
    ///
    /// Called once, before any other operation. Implementations must keep
    /// records from different client/server pairs separate.
    async fn open(&self, client_id: &str, server_uri: &str) -> Result<()>;

    /// Close the store, flushing anything pending
    async fn close(&self) -> Result<()>;

    /// Store a value under a key, replacing any existing value
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;

    /// Fetch the value under a key
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Remove a key; removing an absent key is not an error
    async fn remove(&self, key: &str) -> Result<()>;

    /// Check whether a key exists
    async fn contains_key(&self, key: &str) -> Result<bool>;

    /// List all keys in the store
    async fn keys(&self) -> Result<Vec<String>>;

    /// Remove all keys
    async fn clear(&self) -> Result<()>;
}
