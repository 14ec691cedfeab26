// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Error types surfaced by the asset library.
//!
//! Most internal plumbing propagates [`anyhow::Error`] with context. The
//! variants here are what callers of the public API can match on: the fatal
//! startup conditions and the few synchronous failures.

use std::path::PathBuf;

/// Errors returned by the public asset library API.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    /// The asset root (or an asset directory) could not be created.
    #[error("cannot create asset directory {path}: {source}")]
    RootDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another process holds the cache root lock.
    #[error("cache root {0} is locked by another instance")]
    RootLocked(PathBuf),

    /// The metadata store could not be opened or migrated.
    #[error("metadata store error: {0}")]
    Store(String),

    /// Configuration could not be read or written.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem failure outside of the download path.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client construction failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The library (or one of its workers) has been shut down.
    #[error("asset library is shutting down")]
    ShuttingDown,
}

impl From<rusqlite::Error> for AssetError {
    fn from(err: rusqlite::Error) -> Self {
        AssetError::Store(err.to_string())
    }
}

/// Result alias for the public API.
pub type Result<T> = std::result::Result<T, AssetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_directory_message_names_path() {
        let err = AssetError::RootDirectory {
            path: PathBuf::from("/nonexistent/assets"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        let msg = err.to_string();
        assert!(msg.contains("/nonexistent/assets"), "{}", msg);
    }

    #[test]
    fn test_store_error_from_rusqlite() {
        let err: AssetError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, AssetError::Store(_)));
    }
}
