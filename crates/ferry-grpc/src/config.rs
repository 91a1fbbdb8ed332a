//! Server configuration

use std::net::{Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ferry::{AdmissionLimits, DEFAULT_SPOOL_THRESHOLD};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

/// Default download chunk size (64 KiB)
pub const DEFAULT_DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk either side will put in one frame (1 MiB).
///
/// Keeps every frame well under tonic's default 4 MiB decode limit.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Errors loading or validating a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("cannot read config {path}: {source}")]
    Read {
        /// Path that was read
        path: PathBuf,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },
    /// The file was not valid JSON for a [`ServerConfig`]
    #[error("cannot parse config {path}: {source}")]
    Parse {
        /// Path that was parsed
        path: PathBuf,
        /// The underlying error
        #[source]
        source: serde_json::Error,
    },
    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Knobs for the streaming handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    /// Maximum payload of one download chunk
    pub download_chunk_size: usize,
    /// Upload bytes kept in memory before spilling to a temporary file
    pub spool_threshold: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            download_chunk_size: DEFAULT_DOWNLOAD_CHUNK_SIZE,
            spool_threshold: DEFAULT_SPOOL_THRESHOLD,
        }
    }
}

/// Everything a [`crate::FerryServer`] needs to start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub addr: SocketAddr,
    /// Directory holding stored files
    pub storage_root: PathBuf,
    /// Admission ceilings
    pub limits: AdmissionLimits,
    /// Streaming knobs
    pub transfer: TransferOptions,
    /// How long in-flight calls may drain after a shutdown signal
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv6Addr::LOCALHOST, 50051)),
            storage_root: PathBuf::from("./storage"),
            limits: AdmissionLimits::default(),
            transfer: TransferOptions::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, limit) in [
            ("limits.transfer", self.limits.transfer),
            ("limits.listing", self.limits.listing),
        ] {
            if limit == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be at least 1")));
            }
            if limit > Semaphore::MAX_PERMITS {
                return Err(ConfigError::Invalid(format!(
                    "{field} must be at most {}",
                    Semaphore::MAX_PERMITS
                )));
            }
        }
        if self.transfer.download_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "transfer.download_chunk_size must be at least 1".into(),
            ));
        }
        if self.transfer.download_chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "transfer.download_chunk_size must be at most {MAX_CHUNK_SIZE}"
            )));
        }
        Ok(())
    }
}

/// Helper for serializing Duration as milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.addr.port(), 50051);
        assert_eq!(config.limits.transfer, 10);
        assert_eq!(config.limits.listing, 100);
        assert_eq!(config.transfer.download_chunk_size, 64 * 1024);
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"limits": {"transfer": 2}, "shutdown_grace": 1500, "storage_root": "/srv/ferry"}"#,
        )
        .unwrap();

        assert_eq!(config.limits.transfer, 2);
        assert_eq!(config.limits.listing, 100);
        assert_eq!(config.shutdown_grace, Duration::from_millis(1500));
        assert_eq!(config.storage_root, PathBuf::from("/srv/ferry"));
        assert_eq!(config.transfer, TransferOptions::default());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = ServerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"shutdown_grace\":5000"));
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let mut config = ServerConfig::default();
        config.limits.listing = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ServerConfig::default();
        config.transfer.download_chunk_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ServerConfig::default();
        config.limits.transfer = Semaphore::MAX_PERMITS + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ServerConfig::default();
        config.transfer.download_chunk_size = 8 * 1024 * 1024;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.transfer.download_chunk_size = MAX_CHUNK_SIZE;
        config.validate().unwrap();
    }

    #[test]
    fn test_example_file_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("ferry.example.json");
        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"addr": "127.0.0.1:6000"}}"#).unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.addr, "127.0.0.1:6000".parse().unwrap());
    }

    #[test]
    fn test_from_file_errors() {
        let err = ServerConfig::from_file(Path::new("/nonexistent/ferry.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = ServerConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
