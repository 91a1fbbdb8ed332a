//! Filesystem storage engine.
//!
//! Records are plain files directly under the storage root. A save streams
//! into a uniquely named staging file in the same directory, syncs it, and
//! renames it over the final name. The rename is the only synchronization
//! primitive: there is no in-process lock on the namespace.
//!
//! Staging files are named `~<uuid>.partial`. `~` never appears in a valid
//! record name, so staging artifacts cannot collide with records and are
//! skipped by [`FsStorage::list`] without extra bookkeeping.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{ByteReader, DataSource, FileStorage, StorageError, sort_newest_first};
use crate::record::FileRecord;
use crate::validation::{ValidationError, validate_name};

const STAGING_PREFIX: &str = "~";
const STAGING_SUFFIX: &str = ".partial";

/// Storage engine backed by a flat directory
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Open (creating if needed) a storage root.
    ///
    /// Staging files left behind by an interrupted process are removed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(StorageError::io(format!(
                "create storage root {}",
                root.display()
            )))?;

        let storage = Self { root };
        let swept = storage.sweep_staging().await?;
        if swept > 0 {
            tracing::warn!(count = swept, "removed stale staging files");
        }
        tracing::info!(root = %storage.root.display(), "file storage opened");
        Ok(storage)
    }

    /// The storage root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn location(&self, name: &str) -> Result<PathBuf, ValidationError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    fn staging_path(&self) -> PathBuf {
        self.root.join(format!(
            "{STAGING_PREFIX}{}{STAGING_SUFFIX}",
            Uuid::new_v4().simple()
        ))
    }

    async fn sweep_staging(&self) -> Result<usize, StorageError> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(StorageError::io("read storage root"))?;
        let mut swept = 0;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(StorageError::io("read storage root"))?
        {
            let name = entry.file_name();
            if !name.to_str().is_some_and(is_staging) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => swept += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::io("remove stale staging file")(e)),
            }
        }
        Ok(swept)
    }

    /// Make the rename durable. Failures are logged, the rename already happened.
    async fn sync_root(&self) {
        #[cfg(unix)]
        {
            let root = self.root.clone();
            let synced =
                tokio::task::spawn_blocking(move || std::fs::File::open(&root)?.sync_all()).await;
            match synced {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "failed to sync storage root"),
                Err(e) => tracing::warn!(error = %e, "storage root sync task failed"),
            }
        }
    }
}

fn is_staging(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX) && name.ends_with(STAGING_SUFFIX)
}

/// Removes the staging file when dropped unless it was promoted.
///
/// Dropping covers every early return, and also a save future dropped
/// mid-flight because its call was cancelled.
#[derive(Debug)]
struct StagingFile {
    path: PathBuf,
    promoted: bool,
}

impl StagingFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            promoted: false,
        }
    }

    fn promoted(&mut self) {
        self.promoted = true;
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if self.promoted {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove staging file");
        }
    }
}

#[async_trait]
impl FileStorage for FsStorage {
    async fn save(
        &self,
        name: &str,
        saved_at: SystemTime,
        mut data: DataSource,
    ) -> Result<FileRecord, StorageError> {
        let location = self.location(name)?;
        let mut staging = StagingFile::new(self.staging_path());

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging.path)
            .await
            .map_err(StorageError::io("create staging file"))?;
        let size = tokio::io::copy(&mut data, &mut file)
            .await
            .map_err(StorageError::io("write staging file"))?;
        file.flush()
            .await
            .map_err(StorageError::io("write staging file"))?;

        let file = file.into_std().await;
        tokio::task::spawn_blocking(move || {
            file.set_modified(saved_at)?;
            file.sync_all()
        })
        .await
        .map_err(|e| StorageError::io("sync staging file")(io::Error::other(e)))?
        .map_err(StorageError::io("sync staging file"))?;

        tokio::fs::rename(&staging.path, &location)
            .await
            .map_err(StorageError::io(format!("promote staging file to {name}")))?;
        staging.promoted();
        self.sync_root().await;

        tracing::debug!(name = %name, size, "file saved");
        Ok(FileRecord::new(name, size, saved_at))
    }

    async fn get(&self, name: &str) -> Result<(FileRecord, ByteReader), StorageError> {
        // A name that fails validation can never have been stored.
        let Ok(location) = self.location(name) else {
            return Err(StorageError::NotFound(name.to_string()));
        };

        let file = match tokio::fs::File::open(&location).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(name.to_string()));
            }
            Err(e) => return Err(StorageError::io(format!("open {name}"))(e)),
        };
        // Metadata comes from the open handle so size matches the content it reads.
        let meta = file
            .metadata()
            .await
            .map_err(StorageError::io(format!("stat {name}")))?;
        if !meta.is_file() {
            return Err(StorageError::NotFound(name.to_string()));
        }
        let modified = meta
            .modified()
            .map_err(StorageError::io(format!("stat {name}")))?;

        let record = FileRecord::new(name, meta.len(), modified);
        Ok((record, Box::new(file)))
    }

    async fn list(&self) -> Result<Vec<FileRecord>, StorageError> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(StorageError::io("read storage root"))?;

        let mut records = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(StorageError::io("read storage root"))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if validate_name(&name).is_err() {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::io(format!("stat {name}"))(e)),
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()
                .map_err(StorageError::io(format!("stat {name}")))?;
            records.push(FileRecord::new(name, meta.len(), modified));
        }

        sort_newest_first(&mut records);
        Ok(records)
    }
}
