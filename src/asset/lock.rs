// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Asset, VersionSnapshot};

/// Read pin on one version of an asset.
///
/// While the lock lives, the version's file is not deleted, even if the
/// asset replaces or clears the version. The lock keeps the asset alive and
/// carries a copy of the version as it was when locked. Dropping it (on any
/// thread) releases the pin.
pub struct AssetLock {
    asset: Arc<Asset>,
    version: VersionSnapshot,
    cache_path: PathBuf,
}

impl AssetLock {
    pub(crate) fn new(asset: Arc<Asset>, version: VersionSnapshot) -> Self {
        let cache_path = asset.cache_path();
        Self {
            asset,
            version,
            cache_path,
        }
    }

    pub fn asset(&self) -> &Arc<Asset> {
        &self.asset
    }

    pub fn id(&self) -> i64 {
        self.version.id
    }

    pub fn ctime(&self) -> i64 {
        self.version.ctime
    }

    pub fn mtime(&self) -> i64 {
        self.version.mtime
    }

    pub fn size(&self) -> u64 {
        self.version.size
    }

    pub fn path(&self) -> &Path {
        &self.version.path
    }

    pub fn content_type(&self) -> &str {
        &self.version.content_type
    }

    pub fn etag(&self) -> &str {
        &self.version.etag
    }

    /// The asset's scratch directory.
    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn snapshot(&self) -> &VersionSnapshot {
        &self.version
    }
}

impl std::fmt::Debug for AssetLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetLock")
            .field("asset", &self.asset.id())
            .field("version", &self.version.id)
            .field("path", &self.version.path)
            .finish()
    }
}

impl Drop for AssetLock {
    fn drop(&mut self) {
        self.asset.release_lock(self.version.id, &self.version.path);
    }
}
