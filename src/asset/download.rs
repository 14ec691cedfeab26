// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Request handler that downloads one version of an asset.
//!
//! The handler lives on the network worker. On the first body chunk it opens
//! the version file and asks the metadata worker for a row; the row comes
//! back to the main thread and is appended to the asset. Completion goes
//! through the metadata worker once more so it can never overtake that
//! append.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use super::Asset;
use crate::http::{Request, RequestHandler, RequestPriority, RequestSetup, TransferOutcome};
use crate::paths::{self, normalize_etag};
use crate::store::{schema, NewVersion};
use crate::utils::{now_micros, parse_http_date};

/// How a download proceeds, decided when it starts.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DownloadPlan {
    /// Continue a partial version file from `offset`.
    Resume {
        version: i64,
        ctime: i64,
        etag: String,
        path: PathBuf,
        offset: u64,
    },
    /// Conditional GET against the readable version.
    Refresh { ctime: i64, etag: String },
    Fresh,
}

/// Start a download for `asset` unless one is already active.
pub(crate) fn start(asset: &Arc<Asset>, priority: RequestPriority) -> bool {
    let Some(plan) = asset.begin_download() else {
        return true;
    };
    tracing::debug!(asset = asset.id(), url = asset.url(), plan = ?plan, "starting download");

    let weak: Weak<Asset> = Arc::downgrade(asset);
    let request = Request::new(asset.url(), VersionDownload::new(Arc::clone(asset), plan))
        .with_priority(priority)
        .with_sharegroup(asset.ctx.sharegroup.clone())
        .on_progress(Arc::new(move |total, current| {
            if let Some(asset) = weak.upgrade() {
                asset.set_download_progress(total, current);
            }
        }));
    asset.ctx.engine.push(request)
}

/// Version metadata observed in response headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ResponseMeta {
    pub last_modified: Option<i64>,
    pub file_mtime: Option<i64>,
    pub etag: Option<String>,
    pub content_length: Option<u64>,
    pub file_size: Option<u64>,
    pub range_start: Option<u64>,
    pub range_total: Option<u64>,
    pub content_type: Option<String>,
}

impl ResponseMeta {
    pub fn observe(&mut self, name: &str, value: &str) {
        let value = value.trim();
        match name.to_ascii_lowercase().as_str() {
            "last-modified" => self.last_modified = parse_http_date(value),
            "x-filemodificationtime" => self.file_mtime = value.parse().ok(),
            "etag" => self.etag = Some(normalize_etag(value)),
            "content-length" => self.content_length = value.parse().ok(),
            "x-filesize" => self.file_size = value.parse().ok(),
            "content-range" => {
                let (start, total) = parse_content_range(value);
                self.range_start = start;
                self.range_total = total;
            }
            "content-type" => self.content_type = Some(value.to_string()),
            _ => {}
        }
    }

    /// Server creation time; `X-FileModificationTime` wins over
    /// `Last-Modified`.
    pub fn ctime(&self) -> Option<i64> {
        self.file_mtime.or(self.last_modified)
    }

    /// Full entity size, if announced.
    pub fn size(&self) -> Option<u64> {
        self.file_size.or(self.range_total).or(self.content_length)
    }
}

/// `bytes 100-199/1000` -> (Some(100), Some(1000)).
fn parse_content_range(value: &str) -> (Option<u64>, Option<u64>) {
    let Some(ranges) = value.strip_prefix("bytes") else {
        return (None, None);
    };
    let Some((range, total)) = ranges.trim().split_once('/') else {
        return (None, None);
    };
    let start = range
        .split_once('-')
        .and_then(|(start, _)| start.trim().parse().ok());
    (start, total.trim().parse().ok())
}

pub(crate) struct VersionDownload {
    asset: Arc<Asset>,
    plan: DownloadPlan,
    meta: ResponseMeta,
    status: u16,
    target: Option<PathBuf>,
    file: Option<File>,
    /// The response carries an entity the asset already holds.
    validated: bool,
    error: Option<String>,
}

impl VersionDownload {
    pub fn new(asset: Arc<Asset>, plan: DownloadPlan) -> Self {
        Self {
            asset,
            plan,
            meta: ResponseMeta::default(),
            status: 0,
            target: None,
            file: None,
            validated: false,
            error: None,
        }
    }

    /// A resumed response must be a 206 for the same entity at our offset.
    fn resume_matches(&self) -> bool {
        let DownloadPlan::Resume {
            ctime, etag, offset, ..
        } = &self.plan
        else {
            return true;
        };
        if self.status != 206 {
            return false;
        }
        if self.meta.etag.as_ref().is_some_and(|tag| tag != etag) {
            return false;
        }
        if self.meta.ctime().is_some_and(|server| server > *ctime) {
            return false;
        }
        self.meta.range_start.map_or(true, |start| start == *offset)
    }

    /// Open the output file; for new versions also request the row.
    fn open_target(&mut self) -> bool {
        let path = match &self.plan {
            DownloadPlan::Resume { path, .. } => {
                if !self.resume_matches() {
                    tracing::debug!(asset = self.asset.id(), "resume response does not match the partial version");
                    return false;
                }
                path.clone()
            }
            DownloadPlan::Refresh { .. } | DownloadPlan::Fresh => {
                let ctime = self.meta.ctime().unwrap_or_else(now_micros);
                let etag = self.meta.etag.clone().unwrap_or_default();
                let path = self.asset.ctx.paths.version_path(self.asset.id(), ctime, &etag);
                if self.asset.path_in_use(&path) {
                    self.validated = true;
                    return false;
                }
                if let Err(e) = self.asset.ctx.paths.ensure_asset_dir(self.asset.id()) {
                    self.error = Some(format!("cannot create asset directory: {}", e));
                    return false;
                }
                self.request_row(ctime, etag);
                path
            }
        };

        let opened = match self.plan {
            DownloadPlan::Resume { .. } => OpenOptions::new().append(true).open(&path),
            _ => File::create(&path),
        };
        match opened {
            Ok(file) => {
                self.file = Some(file);
                self.target = Some(path);
                true
            }
            Err(e) => {
                self.error = Some(format!("cannot open {}: {}", path.display(), e));
                // The row may already be requested; completion drops it.
                self.target = Some(path);
                false
            }
        }
    }

    fn request_row(&self, ctime: i64, etag: String) {
        let version = NewVersion {
            asset: self.asset.id(),
            etag,
            ctime,
            size: self
                .meta
                .size()
                .and_then(|s| i64::try_from(s).ok())
                .unwrap_or(0),
            content_type: self.meta.content_type.clone().unwrap_or_default(),
        };
        let asset = Arc::clone(&self.asset);
        self.asset.ctx.store.perform(
            move |tx| schema::insert_version(tx, &version, now_micros()),
            move |row| match row {
                Some(row) => asset.append_version(row),
                None => tracing::error!(asset = asset.id(), "failed to record new version"),
            },
        );
    }

    fn finish_new_version(mut self, success: bool) {
        let success = success && self.error.is_none();
        if success && self.target.is_none() && !self.open_target() && self.validated {
            // Empty 200 body for an entity we already hold
            self.asset.set_file_validated();
            return;
        }
        drop(self.file.take());

        let Some(path) = self.target.take() else {
            self.asset.set_download_complete(None, false);
            return;
        };
        let success = success && self.error.is_none();
        let asset = Arc::clone(&self.asset);
        let barrier_path = path.clone();
        let queued = self.asset.ctx.store.perform(
            |_| Ok(()),
            move |_: Option<()>| asset.finish_by_path(&barrier_path, success),
        );
        if !queued {
            if let Err(e) = paths::remove_file_quiet(&path) {
                tracing::warn!(path = %path.display(), "failed to remove partial download: {}", e);
            }
            self.asset.set_download_complete(None, false);
        }
    }
}

impl RequestHandler for VersionDownload {
    fn setup(&mut self, setup: &mut RequestSetup) -> bool {
        match &self.plan {
            DownloadPlan::Resume { offset, .. } => setup.resume_offset = *offset,
            DownloadPlan::Refresh { ctime, etag } => {
                setup.if_modified_since = Some(*ctime);
                if !etag.is_empty() {
                    setup.if_none_match = Some(etag.clone());
                }
            }
            DownloadPlan::Fresh => {}
        }
        true
    }

    fn on_status(&mut self, status: u16) {
        self.status = status;
    }

    fn on_header(&mut self, name: &str, value: &str) {
        self.meta.observe(name, value);
    }

    fn on_receive(&mut self, chunk: &[u8]) -> bool {
        if self.file.is_none() && (self.error.is_some() || !self.open_target()) {
            return false;
        }
        let Some(file) = self.file.as_mut() else {
            return false;
        };
        if let Err(e) = file.write_all(chunk) {
            self.error = Some(format!("write failed: {}", e));
            return false;
        }
        true
    }

    fn on_complete(self: Box<Self>, outcome: TransferOutcome) {
        let mut this = *self;
        if let DownloadPlan::Resume { version, .. } = this.plan {
            drop(this.file.take());
            let success = outcome.success
                && !outcome.is_not_modified()
                && this.error.is_none()
                && this.resume_matches();
            if !success {
                tracing::debug!(asset = this.asset.id(), status = ?outcome.status, "resume failed, dropping partial version");
            }
            this.asset.set_download_complete(Some(version), success);
            return;
        }

        if this.validated || outcome.is_not_modified() {
            drop(this.file.take());
            this.asset.set_file_validated();
            return;
        }
        this.finish_new_version(outcome.success);
    }
}
