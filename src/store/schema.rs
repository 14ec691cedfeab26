// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Metadata schemes `assets` and `versions`, and the row operations the
//! asset library performs on them.
//!
//! All functions take a plain [`Connection`]; callers pass the worker's
//! open [`rusqlite::Transaction`], which derefs to one.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS assets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mtime INTEGER NOT NULL,
    touch INTEGER NOT NULL,
    ttl INTEGER NOT NULL DEFAULT 0,
    url TEXT NOT NULL UNIQUE,
    download INTEGER NOT NULL DEFAULT 0,
    data TEXT
);
CREATE INDEX IF NOT EXISTS assets_download ON assets(download);

CREATE TABLE IF NOT EXISTS versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    etag TEXT NOT NULL DEFAULT '',
    ctime INTEGER NOT NULL,
    mtime INTEGER NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    type TEXT NOT NULL DEFAULT '',
    complete INTEGER NOT NULL DEFAULT 0,
    asset INTEGER NOT NULL REFERENCES assets(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS versions_asset ON versions(asset);
"#;

/// One row of `assets`. Times and `ttl` are microseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetRow {
    pub id: i64,
    pub mtime: i64,
    pub touch: i64,
    pub ttl: i64,
    pub url: String,
    pub download: bool,
    pub data: Value,
}

impl AssetRow {
    /// Past the row-deletion deadline (`touch + ttl * 2`).
    pub fn is_expired(&self, now: i64) -> bool {
        self.ttl != 0 && self.touch.saturating_add(self.ttl.saturating_mul(2)) < now
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let data: Option<String> = row.get("data")?;
        Ok(Self {
            id: row.get("id")?,
            mtime: row.get("mtime")?,
            touch: row.get("touch")?,
            ttl: row.get("ttl")?,
            url: row.get("url")?,
            download: row.get("download")?,
            data: data
                .and_then(|d| serde_json::from_str(&d).ok())
                .unwrap_or(Value::Null),
        })
    }
}

/// One row of `versions`.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionRow {
    pub id: i64,
    pub asset: i64,
    pub etag: String,
    pub ctime: i64,
    pub mtime: i64,
    pub size: i64,
    pub content_type: String,
    pub complete: bool,
}

impl VersionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            asset: row.get("asset")?,
            etag: row.get("etag")?,
            ctime: row.get("ctime")?,
            mtime: row.get("mtime")?,
            size: row.get("size")?,
            content_type: row.get("type")?,
            complete: row.get("complete")?,
        })
    }
}

/// Fields of a version captured from response headers.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVersion {
    pub asset: i64,
    pub etag: String,
    pub ctime: i64,
    pub size: i64,
    pub content_type: String,
}

/// Persistable in-memory asset state, produced when an asset is dirty.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetUpdate {
    pub id: i64,
    pub touch: i64,
    pub ttl: i64,
    pub download: bool,
    pub data: Value,
}

pub fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)
        .context("Failed to initialize metadata schema")?;
    Ok(())
}

pub fn find_asset_by_url(conn: &Connection, url: &str) -> Result<Option<AssetRow>> {
    conn.query_row(
        "SELECT * FROM assets WHERE url = ?1",
        params![url],
        AssetRow::from_row,
    )
    .optional()
    .with_context(|| format!("Failed to look up asset {}", url))
}

pub fn find_asset(conn: &Connection, id: i64) -> Result<Option<AssetRow>> {
    conn.query_row("SELECT * FROM assets WHERE id = ?1", params![id], AssetRow::from_row)
        .optional()
        .with_context(|| format!("Failed to look up asset #{}", id))
}

pub fn insert_asset(conn: &Connection, url: &str, ttl: i64, now: i64) -> Result<AssetRow> {
    conn.execute(
        "INSERT INTO assets (mtime, touch, ttl, url, download, data) VALUES (?1, ?1, ?2, ?3, 0, NULL)",
        params![now, ttl, url],
    )
    .with_context(|| format!("Failed to create asset {}", url))?;
    Ok(AssetRow {
        id: conn.last_insert_rowid(),
        mtime: now,
        touch: now,
        ttl,
        url: url.to_string(),
        download: false,
        data: Value::Null,
    })
}

/// Record an acquisition: refresh `touch` and adopt the requested `ttl`.
pub fn touch_asset(conn: &Connection, id: i64, ttl: i64, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE assets SET touch = ?2, ttl = ?3, mtime = ?2 WHERE id = ?1",
        params![id, now, ttl],
    )
    .with_context(|| format!("Failed to touch asset #{}", id))?;
    Ok(())
}

pub fn update_asset(conn: &Connection, update: &AssetUpdate, now: i64) -> Result<()> {
    let data = match &update.data {
        Value::Null => None,
        other => Some(serde_json::to_string(other).context("Failed to serialize asset data")?),
    };
    conn.execute(
        "UPDATE assets SET touch = ?2, ttl = ?3, download = ?4, data = ?5, mtime = ?6 WHERE id = ?1",
        params![update.id, update.touch, update.ttl, update.download, data, now],
    )
    .with_context(|| format!("Failed to update asset #{}", update.id))?;
    Ok(())
}

/// Delete an asset row; its versions go with it (cascade).
pub fn delete_asset(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM assets WHERE id = ?1", params![id])
        .with_context(|| format!("Failed to delete asset #{}", id))?;
    Ok(())
}

/// Versions of an asset in creation order.
pub fn select_versions(conn: &Connection, asset: i64) -> Result<Vec<VersionRow>> {
    let mut stmt = conn
        .prepare("SELECT * FROM versions WHERE asset = ?1 ORDER BY id")
        .context("Failed to prepare version query")?;
    let rows = stmt
        .query_map(params![asset], VersionRow::from_row)
        .context("Failed to query versions")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to read version rows")?;
    Ok(rows)
}

pub fn insert_version(conn: &Connection, version: &NewVersion, now: i64) -> Result<VersionRow> {
    conn.execute(
        "INSERT INTO versions (etag, ctime, mtime, size, type, complete, asset) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        params![
            version.etag,
            version.ctime,
            now,
            version.size,
            version.content_type,
            version.asset
        ],
    )
    .with_context(|| format!("Failed to add version to asset #{}", version.asset))?;
    Ok(VersionRow {
        id: conn.last_insert_rowid(),
        asset: version.asset,
        etag: version.etag.clone(),
        ctime: version.ctime,
        mtime: now,
        size: version.size,
        content_type: version.content_type.clone(),
        complete: false,
    })
}

pub fn mark_version_complete(conn: &Connection, id: i64, size: i64, mtime: i64) -> Result<()> {
    conn.execute(
        "UPDATE versions SET complete = 1, size = ?2, mtime = ?3 WHERE id = ?1",
        params![id, size, mtime],
    )
    .with_context(|| format!("Failed to complete version #{}", id))?;
    Ok(())
}

pub fn delete_version(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM versions WHERE id = ?1", params![id])
        .with_context(|| format!("Failed to delete version #{}", id))?;
    Ok(())
}
