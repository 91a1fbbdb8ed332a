//! The stored file record

use std::time::SystemTime;

/// Description of one stored blob.
///
/// `name` is the only identity key; the namespace is flat. `size` always
/// matches the bytes retrievable for the record because it is taken from the
/// finalized file, never from anything a client declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Record name, unique within the storage namespace
    pub name: String,
    /// Size of the stored content in bytes
    pub size: u64,
    /// Time of the save that produced this version
    pub created_at: SystemTime,
    /// Time of the most recent save (equal to `created_at`, records are not versioned)
    pub updated_at: SystemTime,
}

impl FileRecord {
    /// Create a record saved at `saved_at`.
    pub fn new(name: impl Into<String>, size: u64, saved_at: SystemTime) -> Self {
        Self {
            name: name.into(),
            size,
            created_at: saved_at,
            updated_at: saved_at,
        }
    }

    /// Overwrite both timestamps.
    pub fn stamp(mut self, at: SystemTime) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_new_sets_both_timestamps() {
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let record = FileRecord::new("a.txt", 3, at);

        assert_eq!(record.created_at, at);
        assert_eq!(record.updated_at, at);
    }

    #[test]
    fn test_stamp_overwrites_timestamps() {
        let record = FileRecord::new("a.txt", 3, SystemTime::UNIX_EPOCH);
        let later = SystemTime::UNIX_EPOCH + Duration::from_secs(60);

        let record = record.stamp(later);
        assert_eq!(record.created_at, later);
        assert_eq!(record.updated_at, later);
    }
}
