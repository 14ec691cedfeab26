// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! On-disk layout of the asset cache.
//!
//! ```text
//! <cache_root>/
//!     assets.lock
//!     assets/
//!         <asset-id>/
//!             cache/              consumer scratch space
//!             <ctime-us>-<etag>   one file per version
//! ```
//!
//! Every path is derived from ids and headers, never stored independently,
//! so a version row plus the root is enough to find its bytes.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::AssetError;

/// Name of the per-asset scratch directory. Never collected as an orphan.
pub const CACHE_DIR_NAME: &str = "cache";

/// Default timeout for acquiring the cache root lock
pub const ROOT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Deterministic mapping from asset ids and version headers to paths.
#[derive(Debug, Clone)]
pub struct AssetPaths {
    root: PathBuf,
    assets: PathBuf,
}

/// Exclusive lock on a cache root, released on drop.
#[derive(Debug)]
pub struct RootLock {
    _file: File,
    path: PathBuf,
}

impl RootLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AssetPaths {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        let root = cache_root.into();
        let assets = root.join("assets");
        Self { root, assets }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<cache_root>/assets`
    pub fn assets_root(&self) -> &Path {
        &self.assets
    }

    /// Create `<cache_root>/assets`. Failure here is fatal for the library.
    pub fn ensure_root(&self) -> Result<(), AssetError> {
        fs::create_dir_all(&self.assets).map_err(|source| AssetError::RootDirectory {
            path: self.assets.clone(),
            source,
        })
    }

    /// `<cache_root>/assets/<id>`
    pub fn asset_dir(&self, id: i64) -> PathBuf {
        self.assets.join(id.to_string())
    }

    /// `<cache_root>/assets/<id>/cache`
    pub fn cache_dir(&self, id: i64) -> PathBuf {
        self.asset_dir(id).join(CACHE_DIR_NAME)
    }

    /// Create the asset directory and its scratch subdirectory.
    pub fn ensure_asset_dir(&self, id: i64) -> io::Result<PathBuf> {
        let dir = self.asset_dir(id);
        fs::create_dir_all(dir.join(CACHE_DIR_NAME))?;
        Ok(dir)
    }

    /// `<asset-dir>/<ctime-micros>-<etag>` for one version.
    pub fn version_path(&self, id: i64, ctime_us: i64, etag: &str) -> PathBuf {
        self.asset_dir(id)
            .join(format!("{}-{}", ctime_us, file_etag(etag)))
    }

    /// Take the exclusive lock on this cache root, retrying until `timeout`.
    ///
    /// Two libraries sharing one root would race on file deletion, so a
    /// second instance is refused rather than allowed to corrupt the first.
    pub fn lock_root(&self, timeout: Duration) -> Result<RootLock, AssetError> {
        fs::create_dir_all(&self.root).map_err(|source| AssetError::RootDirectory {
            path: self.root.clone(),
            source,
        })?;
        let path = self.root.join("assets.lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(RootLock { _file: file, path }),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(AssetError::RootLocked(self.root.clone()));
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(AssetError::Io(e)),
            }
        }
    }
}

/// Strip surrounding quotes and whitespace from a server ETag.
pub fn normalize_etag(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c.is_whitespace())
        .to_string()
}

/// ETag as it appears in a version file name.
///
/// Quotes, whitespace and `-` are removed (the dash separates the ctime
/// prefix), as are path separators so a weak `W/"x"` tag stays one component.
pub fn file_etag(etag: &str) -> String {
    etag.chars()
        .filter(|c| !matches!(c, '"' | '\'' | '-' | '/' | '\\') && !c.is_whitespace())
        .collect()
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file_quiet(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove a directory tree, treating "already gone" as success.
pub fn remove_dir_quiet(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
