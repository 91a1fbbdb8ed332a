//! Storage engine
//!
//! A storage engine persists named blobs. Implementations must make every
//! save atomic: readers observe either the previous version or the new one in
//! full, never a partially written file.

mod fs;

use std::io;
use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::record::FileRecord;
use crate::validation::ValidationError;

pub use fs::FsStorage;

/// Byte source consumed by a save
pub type DataSource = Box<dyn AsyncRead + Send + Unpin>;

/// Content stream returned by a lookup, positioned at offset 0
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Errors returned by a storage engine
#[derive(Debug, Error)]
pub enum StorageError {
    /// No record exists under the name
    #[error("file not found: {0}")]
    NotFound(String),
    /// The name cannot exist in the storage namespace
    #[error("invalid file name: {0}")]
    InvalidName(#[from] ValidationError),
    /// Any other I/O failure
    #[error("{context}: {source}")]
    Io {
        /// What the engine was doing
        context: String,
        /// The underlying error
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| StorageError::Io { context, source }
    }
}

/// A store of named blobs
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Consume `data` in full and atomically install it under `name`.
    ///
    /// `saved_at` becomes the record's timestamps. On failure the previous
    /// content under `name` (or its absence) is left untouched.
    async fn save(
        &self,
        name: &str,
        saved_at: SystemTime,
        data: DataSource,
    ) -> Result<FileRecord, StorageError>;

    /// Resolve `name` and open its current content.
    ///
    /// The returned reader stays on the version that was current at lookup
    /// time even if a concurrent save replaces it.
    async fn get(&self, name: &str) -> Result<(FileRecord, ByteReader), StorageError>;

    /// Every finalized record, newest first, ties broken by name.
    async fn list(&self) -> Result<Vec<FileRecord>, StorageError>;
}

/// Order records by `created_at` descending, then by name ascending.
pub(crate) fn sort_newest_first(records: &mut [FileRecord]) {
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.name.cmp(&b.name))
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn record(name: &str, secs: u64) -> FileRecord {
        FileRecord::new(name, 0, SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
    }

    #[test]
    fn test_sort_newest_first_with_name_tiebreak() {
        let mut records = vec![
            record("old", 1),
            record("b-tie", 5),
            record("new", 9),
            record("a-tie", 5),
        ];
        sort_newest_first(&mut records);

        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["new", "a-tie", "b-tie", "old"]);
    }
}
