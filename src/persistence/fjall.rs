//! Fjall-based persistence backend.
//!
//! Uses fjall (an LSM-tree based embedded database) so in-flight state
//! survives a process restart. One partition per `(client_id, server_uri)`
//! pair keeps concurrent clients sharing a keyspace isolated.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use parking_lot::Mutex;

use super::backend::ClientPersistence;
use super::error::{PersistenceError, Result};

/// Durable persistence backend backed by a fjall keyspace
pub struct FjallPersistence {
    path: PathBuf,
    state: Mutex<Option<Open>>,
}

struct Open {
    keyspace: Keyspace,
    partition: PartitionHandle,
}

impl FjallPersistence {
    /// Create a backend rooted at the given directory.
    ///
    /// The keyspace is opened lazily by [`ClientPersistence::open`], once the
    /// client/server pair is known.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            state: Mutex::new(None),
        }
    }

    /// Partition names allow a restricted character set, so the client and
    /// server identity is flattened conservatively.
    fn partition_name(client_id: &str, server_uri: &str) -> String {
        let mut name = String::with_capacity(client_id.len() + server_uri.len() + 1);
        for c in client_id.chars().chain("-".chars()).chain(server_uri.chars()) {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                name.push(c);
            } else {
                name.push('_');
            }
        }
        name.truncate(200);
        name
    }

    fn with_partition<T>(&self, f: impl FnOnce(&PartitionHandle) -> Result<T>) -> Result<T> {
        let state = self.state.lock();
        match state.as_ref() {
            Some(open) => f(&open.partition),
            None => Err(PersistenceError::NotOpen),
        }
    }
}

#[async_trait]
impl ClientPersistence for FjallPersistence {
    async fn open(&self, client_id: &str, server_uri: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Ok(());
        }

        let keyspace = Config::new(&self.path).open()?;
        let partition = keyspace.open_partition(
            &Self::partition_name(client_id, server_uri),
            PartitionCreateOptions::default(),
        )?;

        *state = Some(Open {
            keyspace,
            partition,
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(open) = state.take() {
            open.keyspace.persist(PersistMode::SyncAll)?;
        }
        Ok(())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.with_partition(|p| {
            p.insert(key, value.as_ref())?;
            Ok(())
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.with_partition(|p| {
            Ok(p.get(key)?.map(|slice| Bytes::copy_from_slice(&slice)))
        })
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.with_partition(|p| {
            p.remove(key)?;
            Ok(())
        })
    }

    async fn contains_key(&self, key: &str) -> Result<bool> {
        self.with_partition(|p| Ok(p.contains_key(key)?))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.with_partition(|p| {
            let mut keys = Vec::new();
            for item in p.iter() {
                let (key, _value) = item?;
                keys.push(String::from_utf8_lossy(&key).to_string());
            }
            Ok(keys)
        })
    }

    async fn clear(&self) -> Result<()> {
        self.with_partition(|p| {
            // fjall has no truncate; remove keys one by one
            let mut keys = Vec::new();
            for item in p.iter() {
                let (key, _value) = item?;
                keys.push(key);
            }
            for key in keys {
                p.remove(key)?;
            }
            Ok(())
        })
    }
}
