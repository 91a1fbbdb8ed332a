//! Transfer orchestration
//!
//! The seam between protocol framing and raw storage: names are validated
//! before storage is touched and saves are time-stamped here.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;

use crate::record::FileRecord;
use crate::storage::{ByteReader, DataSource, FileStorage, StorageError};
use crate::validation::{ValidationError, validate_name};

/// Errors surfaced by the orchestrator
#[derive(Debug, Error)]
pub enum TransferError {
    /// The name broke a naming rule; nothing was written
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// No record exists under the name
    #[error("file not found: {0}")]
    NotFound(String),
    /// The storage engine failed
    #[error("storage failure: {0}")]
    Storage(#[source] StorageError),
}

impl From<StorageError> for TransferError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(name) => TransferError::NotFound(name),
            StorageError::InvalidName(e) => TransferError::Validation(e),
            other => TransferError::Storage(other),
        }
    }
}

/// Validates, stamps and delegates transfers to a storage engine
#[derive(Clone)]
pub struct TransferOrchestrator {
    storage: Arc<dyn FileStorage>,
}

impl fmt::Debug for TransferOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOrchestrator").finish_non_exhaustive()
    }
}

impl TransferOrchestrator {
    /// Create an orchestrator over `storage`.
    pub fn new(storage: Arc<dyn FileStorage>) -> Self {
        Self { storage }
    }

    /// Validate `name` and store `data` under it.
    ///
    /// Both timestamps of the returned record are the moment the save was
    /// issued. An invalid name never reaches storage.
    pub async fn upload(&self, name: &str, data: DataSource) -> Result<FileRecord, TransferError> {
        validate_name(name)?;
        let saved_at = SystemTime::now();
        let record = self.storage.save(name, saved_at, data).await?;
        tracing::info!(name = %record.name, size = record.size, "file uploaded");
        Ok(record.stamp(saved_at))
    }

    /// Open the current version of `name`.
    pub async fn download(&self, name: &str) -> Result<(FileRecord, ByteReader), TransferError> {
        Ok(self.storage.get(name).await?)
    }

    /// All records, newest first.
    pub async fn list(&self) -> Result<Vec<FileRecord>, TransferError> {
        Ok(self.storage.list().await?)
    }
}
