//! File-backed [`KeyValueStore`].
//!
//! Each key maps to one file under the data directory. Writes go to a
//! temporary sibling file which is then renamed over the target, so a crash
//! mid-write leaves either the old or the new value, never a torn one.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::{KeyValueStore, PersistError};

/// Durable key-value store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    /// Creates a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the key files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `key`.
    ///
    /// Characters outside `[A-Za-z0-9._-]` are replaced with `_`, so keys
    /// such as `@edudash/failed_messages` map to a single flat file.
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl KeyValueStore for FileKv {
    async fn get_item(&self, key: &str) -> Result<Option<String>, PersistError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistError::Read {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), PersistError> {
        let write_err = |source| PersistError::Write {
            key: key.to_string(),
            source,
        };
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(write_err)?;

        let target = self.path_for(key);
        let tmp = self
            .dir
            .join(format!(".{}.tmp", Uuid::now_v7().simple()));
        tokio::fs::write(&tmp, value).await.map_err(write_err)?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(write_err(e));
        }
        Ok(())
    }
}
