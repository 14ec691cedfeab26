// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;

use serde::Serialize;

use crate::paths::AssetPaths;
use crate::store::VersionRow;

/// One on-disk file variant of an asset, as the asset tracks it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct VersionData {
    pub id: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub size: u64,
    pub etag: String,
    pub content_type: String,
    pub path: PathBuf,
    pub complete: bool,
    /// Outstanding read locks
    pub locked: u32,
    /// Fraction in [0, 1], meaningful only while downloading
    pub progress: f32,
}

impl VersionData {
    pub fn from_row(row: &VersionRow, paths: &AssetPaths) -> Self {
        Self {
            id: row.id,
            ctime: row.ctime,
            mtime: row.mtime,
            size: u64::try_from(row.size).unwrap_or(0),
            etag: row.etag.clone(),
            content_type: row.content_type.clone(),
            path: paths.version_path(row.asset, row.ctime, &row.etag),
            complete: row.complete,
            locked: 0,
            progress: if row.complete { 1.0 } else { 0.0 },
        }
    }

    /// Complete and its file is still on disk.
    pub fn is_readable(&self) -> bool {
        self.complete && self.path.is_file()
    }

    pub fn snapshot(&self) -> VersionSnapshot {
        VersionSnapshot {
            id: self.id,
            ctime: self.ctime,
            mtime: self.mtime,
            size: self.size,
            etag: self.etag.clone(),
            content_type: self.content_type.clone(),
            path: self.path.clone(),
            complete: self.complete,
            locked: self.locked,
            progress: self.progress,
        }
    }
}

/// Value copy of a version at one moment. Times are microseconds since the
/// Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionSnapshot {
    pub id: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub size: u64,
    pub etag: String,
    pub content_type: String,
    pub path: PathBuf,
    pub complete: bool,
    pub locked: u32,
    pub progress: f32,
}

/// A version dropped from the asset while locks were still held on it.
/// Its file is removed when the last lock goes away.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RetiredVersion {
    pub id: i64,
    pub path: PathBuf,
    pub locked: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(complete: bool) -> VersionRow {
        VersionRow {
            id: 4,
            asset: 2,
            etag: "v1".into(),
            ctime: 1_704_067_200_000_000,
            mtime: 1,
            size: 3,
            content_type: "application/octet-stream".into(),
            complete,
        }
    }

    #[test]
    fn test_from_row_derives_path() {
        let paths = AssetPaths::new("/cache");
        let version = VersionData::from_row(&row(true), &paths);
        assert_eq!(
            version.path,
            PathBuf::from("/cache/assets/2/1704067200000000-v1")
        );
        assert_eq!(version.size, 3);
        assert_eq!(version.locked, 0);
    }

    #[test]
    fn test_readable_requires_complete_and_file() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let paths = AssetPaths::new(dir.path());
        let complete = VersionData::from_row(&row(true), &paths);
        assert!(!complete.is_readable());

        paths.ensure_asset_dir(2).unwrap();
        std::fs::write(&complete.path, b"abc").unwrap();
        assert!(complete.is_readable());

        let pending = VersionData::from_row(&row(false), &paths);
        assert!(!pending.is_readable());
    }
}
