//! Durable store of messages that failed to send.
//!
//! [`FailedMessageStore`] keeps the whole collection as one JSON array under
//! a fixed key of a [`KeyValueStore`], mirrored in memory for observers.
//!
//! Every mutation is a full read-modify-persist cycle performed while holding
//! an async mutex, so two call sites appending at the same time cannot lose
//! each other's record. The in-memory mirror is updated in the same critical
//! section and observers are notified synchronously through a
//! [`tokio::sync::watch`] channel.
//!
//! # Failure semantics
//!
//! - A missing or corrupt blob reads as an empty collection.
//! - If the backing store cannot be read or written, the store logs a
//!   warning and switches to *degraded* mode for the rest of the session:
//!   reads are served from the in-memory mirror and mutations only update
//!   the mirror. Nothing is ever surfaced to the caller as an error.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, watch};

use courier_proto::failed::{FailedMessagePatch, FailedMessageRecord};
use courier_proto::message::{MessageId, ThreadId};

use crate::persist::KeyValueStore;

/// Key under which the failed-message array is persisted.
pub const FAILED_MESSAGES_KEY: &str = "@edudash/failed_messages";

/// Write-through store of [`FailedMessageRecord`]s.
pub struct FailedMessageStore<K: KeyValueStore> {
    /// Backing key-value store.
    kv: K,
    /// Key holding the JSON array.
    key: String,
    /// In-memory mirror; also the observer channel.
    mirror: watch::Sender<Vec<FailedMessageRecord>>,
    /// Serializes read-modify-persist cycles.
    write_lock: Mutex<()>,
    /// Set once the backing store has failed; reads then use the mirror.
    degraded: AtomicBool,
}

impl<K: KeyValueStore> FailedMessageStore<K> {
    /// Creates a store over `kv` using [`FAILED_MESSAGES_KEY`].
    ///
    /// The mirror starts empty; call [`load`](Self::load) to populate it
    /// from persisted data.
    pub fn new(kv: K) -> Self {
        Self::with_key(kv, FAILED_MESSAGES_KEY)
    }

    /// Creates a store over `kv` persisting under a custom key.
    pub fn with_key(kv: K, key: impl Into<String>) -> Self {
        let (mirror, _) = watch::channel(Vec::new());
        Self {
            kv,
            key: key.into(),
            mirror,
            write_lock: Mutex::new(()),
            degraded: AtomicBool::new(false),
        }
    }

    /// Read the persisted collection and refresh the mirror.
    ///
    /// Returns an empty collection if nothing is stored or the blob is
    /// corrupt. Never fails. Observers are only notified if the persisted
    /// collection differs from the mirror.
    pub async fn load(&self) -> Vec<FailedMessageRecord> {
        let _guard = self.write_lock.lock().await;
        let records = self.read_current().await;
        self.mirror.send_if_modified(|mirror| {
            if *mirror == records {
                return false;
            }
            mirror.clone_from(&records);
            true
        });
        records
    }

    /// Add a record and persist immediately.
    ///
    /// A record with the same local id is replaced in place rather than
    /// duplicated.
    pub async fn append(&self, record: FailedMessageRecord) {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read_current().await;
        if let Some(existing) = records.iter_mut().find(|r| r.local_id == record.local_id) {
            *existing = record;
        } else {
            records.push(record);
        }
        self.commit(records).await;
    }

    /// Merge `patch` into the record with `local_id`.
    ///
    /// Returns `false` (and writes nothing) if no such record exists.
    pub async fn update(&self, local_id: &MessageId, patch: &FailedMessagePatch) -> bool {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read_current().await;
        let Some(record) = records.iter_mut().find(|r| r.local_id == *local_id) else {
            tracing::debug!(local_id = %local_id, "update of absent failed message ignored");
            return false;
        };
        record.apply(patch);
        self.commit(records).await;
        true
    }

    /// Delete the record with `local_id`.
    ///
    /// Returns `false` (and writes nothing) if no such record exists.
    pub async fn remove(&self, local_id: &MessageId) -> bool {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read_current().await;
        let before = records.len();
        records.retain(|r| r.local_id != *local_id);
        if records.len() == before {
            tracing::debug!(local_id = %local_id, "remove of absent failed message ignored");
            return false;
        }
        self.commit(records).await;
        true
    }

    /// Delete every record.
    pub async fn clear(&self) {
        let _guard = self.write_lock.lock().await;
        self.commit(Vec::new()).await;
    }

    /// Look up one record, re-reading the persisted collection.
    pub async fn get(&self, local_id: &MessageId) -> Option<FailedMessageRecord> {
        self.load()
            .await
            .into_iter()
            .find(|r| r.local_id == *local_id)
    }

    /// Current in-memory view of the collection.
    #[must_use]
    pub fn snapshot(&self) -> Vec<FailedMessageRecord> {
        self.mirror.borrow().clone()
    }

    /// Records belonging to `thread_id`, in failure order.
    #[must_use]
    pub fn for_thread(&self, thread_id: &ThreadId) -> Vec<FailedMessageRecord> {
        self.mirror
            .borrow()
            .iter()
            .filter(|r| r.thread_id == *thread_id)
            .cloned()
            .collect()
    }

    /// Subscribe to changes of the collection.
    ///
    /// The receiver always holds the latest list.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<FailedMessageRecord>> {
        self.mirror.subscribe()
    }

    /// Whether the backing store has failed during this session.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Read the authoritative collection: persisted data, or the mirror
    /// once degraded.
    async fn read_current(&self) -> Vec<FailedMessageRecord> {
        if self.is_degraded() {
            return self.snapshot();
        }
        match self.kv.get_item(&self.key).await {
            Ok(None) => Vec::new(),
            Ok(Some(blob)) => serde_json::from_str(&blob).unwrap_or_else(|e| {
                tracing::warn!(key = %self.key, error = %e, "corrupt failed-message blob, treating as empty");
                Vec::new()
            }),
            Err(e) => {
                self.mark_degraded(&e);
                self.snapshot()
            }
        }
    }

    /// Persist `records` (unless degraded) and publish them to observers.
    async fn commit(&self, records: Vec<FailedMessageRecord>) {
        if !self.is_degraded() {
            match serde_json::to_string(&records) {
                Ok(blob) => {
                    if let Err(e) = self.kv.set_item(&self.key, blob).await {
                        self.mark_degraded(&e);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize failed-message list");
                }
            }
        }
        self.mirror.send_replace(records);
    }

    fn mark_degraded(&self, err: &crate::persist::PersistError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                key = %self.key,
                error = %err,
                "failed-message storage unavailable, keeping records in memory for this session"
            );
        }
    }
}
