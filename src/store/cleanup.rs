// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Two-phase TTL sweep.
//!
//! Files go first: an idle asset whose `touch + ttl` has passed loses its
//! directory. The row stays until `touch + ttl * 2`, so a consumer coming
//! back inside that window finds its id, url and data intact and only has to
//! download again.

use std::collections::HashSet;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::paths::{self, AssetPaths};

/// What one sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub directories_removed: usize,
    pub rows_removed: usize,
}

/// Run the sweep at time `now` (microseconds).
///
/// Assets with an active download, `ttl == 0`, or an id in `live` (held in
/// memory by the library) are never touched.
pub fn sweep(
    conn: &Connection,
    paths: &AssetPaths,
    now: i64,
    live: &HashSet<i64>,
) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();

    let stale: Vec<i64> = {
        let mut stmt = conn
            .prepare("SELECT id FROM assets WHERE download = 0 AND ttl != 0 AND touch + ttl < ?1")
            .context("Failed to prepare cleanup query")?;
        let ids = stmt
            .query_map(params![now], |row| row.get(0))
            .context("Failed to query stale assets")?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to read stale assets")?;
        ids
    };

    for id in stale.into_iter().filter(|id| !live.contains(id)) {
        let dir = paths.asset_dir(id);
        if !dir.exists() {
            continue;
        }
        match paths::remove_dir_quiet(&dir) {
            Ok(()) => report.directories_removed += 1,
            Err(e) => tracing::warn!(asset = id, "failed to remove stale asset directory: {}", e),
        }
    }

    let expired: Vec<i64> = {
        let mut stmt = conn
            .prepare(
                "SELECT id FROM assets WHERE download = 0 AND ttl != 0 AND touch + ttl * 2 < ?1",
            )
            .context("Failed to prepare expiry query")?;
        let ids = stmt
            .query_map(params![now], |row| row.get(0))
            .context("Failed to query expired assets")?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to read expired assets")?;
        ids
    };

    for id in expired.into_iter().filter(|id| !live.contains(id)) {
        conn.execute("DELETE FROM assets WHERE id = ?1", params![id])
            .with_context(|| format!("Failed to delete expired asset #{}", id))?;
        report.rows_removed += 1;
    }

    if report.directories_removed > 0 || report.rows_removed > 0 {
        tracing::info!(
            directories = report.directories_removed,
            rows = report.rows_removed,
            "asset cleanup sweep"
        );
    }
    Ok(report)
}
