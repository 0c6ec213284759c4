//! Byte-level key-value backends
//!
//! The KV engine is written against the [`KeyValue`] trait so the same
//! store logic runs on disk (sled) and in memory (a plain map). Keys
//! are UTF-8 strings, values are opaque byte blobs.

use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;

/// Minimal byte-store contract the KV engine needs
///
/// `compare_and_swap` is the only atomic primitive; index blobs are
/// updated through it so concurrent writers cannot lose entries.
pub trait KeyValue {
    /// Backend name used in diagnostics and unsupported-entity errors
    const BACKEND: &'static str;

    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any existing value
    fn put(&mut self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove `key`; removing an absent key is a no-op
    fn remove(&mut self, key: &str) -> Result<()>;

    /// Atomically replace `old` with `new`
    ///
    /// Returns false when the current value no longer matches `old`,
    /// in which case the caller should reload and retry. `None` for
    /// `old` means "key must be absent"; `None` for `new` deletes.
    fn compare_and_swap(
        &mut self,
        key: &str,
        old: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool>;
}

/// Durable backend backed by a sled tree on disk
pub struct SledKv {
    db: sled::Db,
}

impl SledKv {
    /// Open (or create) the sled database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Flush dirty pages to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl KeyValue for SledKv {
    const BACKEND: &'static str = "kv";

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    fn compare_and_swap(
        &mut self,
        key: &str,
        old: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool> {
        let outcome = self.db.compare_and_swap(key, old, new)?;
        Ok(outcome.is_ok())
    }
}

/// Volatile backend over a plain map, for tests and ephemeral stores
#[derive(Debug, Default)]
pub struct MemoryKv {
    map: HashMap<String, Vec<u8>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValue for MemoryKv {
    const BACKEND: &'static str = "memory";

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }

    fn compare_and_swap(
        &mut self,
        key: &str,
        old: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool> {
        let current = self.map.get(key).map(|v| v.as_slice());
        if current != old {
            return Ok(false);
        }
        match new {
            Some(value) => {
                self.map.insert(key.to_string(), value.to_vec());
            }
            None => {
                self.map.remove(key);
            }
        }
        Ok(true)
    }
}
