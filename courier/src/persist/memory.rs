//! In-memory [`KeyValueStore`] for tests.
//!
//! Cloning a `MemoryKv` shares the same backing map, which lets a test drop
//! an outbox and build a new one over the same data to simulate a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{KeyValueStore, PersistError};

/// Shared in-memory key-value map with switchable failure injection.
#[derive(Clone, Default)]
pub struct MemoryKv {
    items: Arc<Mutex<HashMap<String, String>>>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryKv {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent reads fail (or succeed again).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Writes a raw value, bypassing failure injection.
    pub fn put_raw(&self, key: &str, value: &str) {
        self.items.lock().insert(key.to_string(), value.to_string());
    }

    /// Reads a raw value, bypassing failure injection.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<String> {
        self.items.lock().get(key).cloned()
    }
}

impl KeyValueStore for MemoryKv {
    async fn get_item(&self, key: &str) -> Result<Option<String>, PersistError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(PersistError::Unavailable("reads disabled".into()));
        }
        Ok(self.items.lock().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), PersistError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistError::Unavailable("writes disabled".into()));
        }
        self.items.lock().insert(key.to_string(), value);
        Ok(())
    }
}
