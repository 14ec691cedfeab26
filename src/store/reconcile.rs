// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lookup-or-create of an asset row and reconstruction of its versions.
//!
//! Runs on the metadata worker inside the acquisition transaction. The
//! metadata rows and the files on disk may disagree after a crash; this is
//! where they are brought back in line:
//!
//! - a version row whose file is missing is erased;
//! - a second row pointing at an already claimed file is erased;
//! - at most one complete and one pending version survive, in id order;
//! - any file in the asset directory not claimed by a surviving version
//!   (other than `cache/`) is removed.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::Connection;

use super::schema::{self, AssetRow, VersionRow};
use crate::paths::{self, AssetPaths, CACHE_DIR_NAME};

/// An asset row together with the versions that survived reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetRecord {
    pub asset: AssetRow,
    pub versions: Vec<VersionRow>,
}

/// Find the row for `url` (creating it when absent or past its row-deletion
/// deadline), refresh its `touch`, and reconcile its versions with the disk.
pub fn acquire_record(
    conn: &Connection,
    paths: &AssetPaths,
    url: &str,
    ttl: i64,
    now: i64,
) -> Result<AssetRecord> {
    let asset = match schema::find_asset_by_url(conn, url)? {
        Some(row) if row.is_expired(now) => {
            tracing::debug!(asset = row.id, url, "asset row expired, recreating");
            schema::delete_asset(conn, row.id)?;
            if let Err(e) = paths::remove_dir_quiet(&paths.asset_dir(row.id)) {
                tracing::warn!(asset = row.id, "failed to remove expired asset directory: {}", e);
            }
            schema::insert_asset(conn, url, ttl, now)?
        }
        Some(mut row) => {
            schema::touch_asset(conn, row.id, ttl, now)?;
            row.touch = now;
            row.mtime = now;
            row.ttl = ttl;
            row
        }
        None => schema::insert_asset(conn, url, ttl, now)?,
    };

    paths
        .ensure_asset_dir(asset.id)
        .with_context(|| format!("Failed to create directory for asset #{}", asset.id))?;

    let versions = reconcile_versions(conn, paths, asset.id)?;
    Ok(AssetRecord { asset, versions })
}

/// Keep the versions of `asset_id` that still have their file, collapse
/// duplicates, and collect orphan files.
pub fn reconcile_versions(
    conn: &Connection,
    paths: &AssetPaths,
    asset_id: i64,
) -> Result<Vec<VersionRow>> {
    let mut kept = Vec::new();
    let mut claimed: HashSet<PathBuf> = HashSet::new();
    let mut have_complete = false;
    let mut have_pending = false;

    for row in schema::select_versions(conn, asset_id)? {
        let path = paths.version_path(asset_id, row.ctime, &row.etag);
        if !path.is_file() {
            tracing::warn!(asset = asset_id, version = row.id, "version file missing, erasing row");
            schema::delete_version(conn, row.id)?;
            continue;
        }
        if claimed.contains(&path) {
            tracing::warn!(asset = asset_id, version = row.id, "duplicate version path, erasing row");
            schema::delete_version(conn, row.id)?;
            continue;
        }
        let slot = if row.complete {
            &mut have_complete
        } else {
            &mut have_pending
        };
        if *slot {
            tracing::warn!(
                asset = asset_id,
                version = row.id,
                complete = row.complete,
                "surplus version, erasing"
            );
            schema::delete_version(conn, row.id)?;
            continue;
        }
        *slot = true;
        claimed.insert(path);
        kept.push(row);
    }

    let removed = collect_orphans(&paths.asset_dir(asset_id), &claimed);
    if removed > 0 {
        tracing::info!(asset = asset_id, removed, "removed orphan files");
    }
    Ok(kept)
}

/// Remove every entry of `dir` other than `cache/` and the claimed paths.
fn collect_orphans(dir: &Path, claimed: &HashSet<PathBuf>) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if entry.file_name() == CACHE_DIR_NAME || claimed.contains(&path) {
            continue;
        }
        let result = match entry.file_type() {
            Ok(ft) if ft.is_dir() => paths::remove_dir_quiet(&path),
            _ => paths::remove_file_quiet(&path),
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(path = %path.display(), "failed to remove orphan: {}", e),
        }
    }
    removed
}
