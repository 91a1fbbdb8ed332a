//! Upload accumulation buffer
//!
//! An upload is accumulated in full before it is handed to storage. Small
//! uploads stay in memory; once the buffered size would exceed the threshold
//! the content spills to an anonymous temporary file, so one large upload
//! cannot hold an unbounded amount of memory.

use std::io::{self, SeekFrom};

use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::storage::DataSource;

/// Default in-memory limit before spilling to disk (8 MiB).
pub const DEFAULT_SPOOL_THRESHOLD: usize = 8 * 1024 * 1024;

#[derive(Debug)]
enum Spool {
    Memory(Vec<u8>),
    Disk(tokio::fs::File),
}

/// Append-only byte buffer that spills to a temporary file.
#[derive(Debug)]
pub struct SpoolBuffer {
    threshold: usize,
    len: u64,
    spool: Spool,
}

impl SpoolBuffer {
    /// Create a buffer that keeps up to `threshold` bytes in memory.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            len: 0,
            spool: Spool::Memory(Vec::new()),
        }
    }

    /// Append a chunk. Empty chunks are accepted and change nothing.
    pub async fn append(&mut self, chunk: &[u8]) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }

        if let Spool::Memory(buf) = &mut self.spool {
            if buf.len() + chunk.len() <= self.threshold {
                buf.extend_from_slice(chunk);
                self.len += chunk.len() as u64;
                return Ok(());
            }
            let file = tokio::task::spawn_blocking(tempfile::tempfile)
                .await
                .map_err(io::Error::other)??;
            let mut file = tokio::fs::File::from_std(file);
            file.write_all(buf).await?;
            tracing::debug!(buffered = buf.len(), "upload spilled to disk");
            self.spool = Spool::Disk(file);
        }

        if let Spool::Disk(file) = &mut self.spool {
            file.write_all(chunk).await?;
        }
        self.len += chunk.len() as u64;
        Ok(())
    }

    /// Total bytes appended so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the content has moved to a temporary file.
    pub fn is_spilled(&self) -> bool {
        matches!(self.spool, Spool::Disk(_))
    }

    /// Turn the accumulated content into a byte source read from the start.
    pub async fn into_source(self) -> io::Result<DataSource> {
        match self.spool {
            Spool::Memory(buf) => Ok(Box::new(io::Cursor::new(buf))),
            Spool::Disk(mut file) => {
                file.flush().await?;
                file.seek(SeekFrom::Start(0)).await?;
                Ok(Box::new(file))
            }
        }
    }
}

impl Default for SpoolBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SPOOL_THRESHOLD)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    async fn drain(spool: SpoolBuffer) -> Vec<u8> {
        let mut source = spool.into_source().await.unwrap();
        let mut out = Vec::new();
        source.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_small_upload_stays_in_memory() {
        let mut spool = SpoolBuffer::new(16);
        spool.append(b"hello ").await.unwrap();
        spool.append(b"world").await.unwrap();

        assert!(!spool.is_spilled());
        assert_eq!(spool.len(), 11);
        assert_eq!(drain(spool).await, b"hello world");
    }

    #[tokio::test]
    async fn test_exact_threshold_stays_in_memory() {
        let mut spool = SpoolBuffer::new(5);
        spool.append(b"12345").await.unwrap();
        assert!(!spool.is_spilled());
    }

    #[tokio::test]
    async fn test_spills_past_threshold_and_preserves_order() {
        let mut spool = SpoolBuffer::new(8);
        spool.append(b"abcd").await.unwrap();
        spool.append(b"efgh").await.unwrap();
        assert!(!spool.is_spilled());

        spool.append(b"ijkl").await.unwrap();
        assert!(spool.is_spilled());
        spool.append(b"mnop").await.unwrap();

        assert_eq!(spool.len(), 16);
        assert_eq!(drain(spool).await, b"abcdefghijklmnop");
    }

    #[tokio::test]
    async fn test_empty_chunks_are_noops() {
        let mut spool = SpoolBuffer::new(0);
        spool.append(b"").await.unwrap();
        spool.append(b"").await.unwrap();

        assert!(spool.is_empty());
        assert!(!spool.is_spilled());
        assert!(drain(spool).await.is_empty());
    }

    #[tokio::test]
    async fn test_zero_threshold_spills_first_byte() {
        let mut spool = SpoolBuffer::new(0);
        spool.append(b"x").await.unwrap();
        assert!(spool.is_spilled());
        assert_eq!(drain(spool).await, b"x");
    }
}
