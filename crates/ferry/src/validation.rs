//! File name rules
//!
//! Names live in a flat namespace and map one-to-one onto files in the
//! storage root, so anything that could escape the root or confuse the
//! filesystem is rejected before storage is touched.

use thiserror::Error;

/// Maximum name length in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Reasons a name is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The name is empty
    #[error("file name is required")]
    Empty,
    /// The name is longer than [`MAX_NAME_LEN`] bytes
    #[error("file name is {0} bytes long, the limit is {MAX_NAME_LEN}")]
    TooLong(usize),
    /// The name contains `..`, `/`, `\` or `~`
    #[error("file name must not contain path components: {0:?}")]
    PathComponent(String),
    /// The name contains an ASCII control character
    #[error("file name contains control character {0:#04x}")]
    ControlCharacter(u32),
    /// The name refers to the storage directory itself
    #[error("file name must not be \".\"")]
    CurrentDir,
}

/// Check a name against the storage namespace rules.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong(name.len()));
    }
    if name.contains("..") || name.contains(['/', '\\', '~']) {
        return Err(ValidationError::PathComponent(name.to_string()));
    }
    if let Some(c) = name.chars().find(|c| c.is_ascii_control()) {
        return Err(ValidationError::ControlCharacter(c as u32));
    }
    if name == "." {
        return Err(ValidationError::CurrentDir);
    }
    Ok(())
}
