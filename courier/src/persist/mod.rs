//! Local key-value persistence used by the failed-message outbox.
//!
//! Defines the [`KeyValueStore`] trait (string values under string keys,
//! surviving process restart) plus two implementations:
//! - [`memory::MemoryKv`]: in-memory store for tests
//! - [`file::FileKv`]: one file per key under a data directory

pub mod file;
pub mod memory;

/// Errors that can occur during key-value storage operations.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// The underlying storage is unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A read failed.
    #[error("read of {key} failed: {source}")]
    Read {
        /// Key being read.
        key: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A write failed.
    #[error("write of {key} failed: {source}")]
    Write {
        /// Key being written.
        key: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Durable string storage keyed by name.
///
/// Values are opaque to the store; the outbox writes a JSON array.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, or `None` if absent.
    fn get_item(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>, PersistError>> + Send;

    /// Store `value` under `key`, replacing any previous value.
    fn set_item(
        &self,
        key: &str,
        value: String,
    ) -> impl std::future::Future<Output = Result<(), PersistError>> + Send;
}
