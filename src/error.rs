use failure::Fail;
use std::io;

/// Error type. It represents the ways a store operation could fail.
#[derive(Fail, Debug)]
pub enum StoreError {
    /// An IO error. Wraps a `std::io::Error`.
    #[fail(display = "{}", _0)]
    Io(#[fail(cause)] io::Error),
    /// Serialization or deserialization error.
    #[fail(display = "{}", _0)]
    Serde(#[fail(cause)] serde_json::Error),
    /// The id, key or path does not exist.
    #[fail(display = "not found: {}", _0)]
    NotFound(String),
    /// Create conflict, or a rename/move collision at the destination.
    #[fail(display = "already exists: {}", _0)]
    AlreadyExists(String),
    /// Bad keysize, an id passed in the wrong mode, or a malformed path.
    #[fail(display = "invalid argument: {}", _0)]
    InvalidArgument(String),
    /// A record or blob larger than the configured maximum.
    #[fail(display = "size exceeded: {}", _0)]
    SizeExceeded(String),
    /// CRC mismatch, truncated record or unknown encoding version.
    /// It indicates corrupted data on disk or a program bug.
    #[fail(display = "corrupt: {}", _0)]
    Corrupt(String),
    /// The entry at the target path is not a directory.
    #[fail(display = "not a directory: {}", _0)]
    NotDirectory(String),
    /// The entry at the target path is not a regular file.
    #[fail(display = "not a file: {}", _0)]
    NotFile(String),
    /// The entry at the target path is not a symlink.
    #[fail(display = "not a symlink: {}", _0)]
    NotSymlink(String),
}

impl From<io::Error> for StoreError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serde(error)
    }
}

/// Result type.
pub type Result<T> = std::result::Result<T, StoreError>;
