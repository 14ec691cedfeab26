// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Asset object: the aggregate root for one URL.
//!
//! An asset owns its versions, coordinates downloads and read locks, tracks
//! whether its row needs flushing, and collects change notifications that
//! subscribers receive on the next library tick.
//!
//! Mutations happen on the main thread, with two exceptions: the download
//! handler reads the version list from the network worker, and an
//! [`AssetLock`] may be released on any thread. State therefore sits behind
//! an `RwLock`.

mod download;
mod lock;
mod update;
mod version;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::Value;

use crate::http::{HttpEngine, RequestPriority};
use crate::paths::{self, AssetPaths};
use crate::store::{schema, AssetRecord, AssetUpdate, MetadataStore};
use crate::sync::{resilient_lock, resilient_read, resilient_write};
use crate::utils::now_micros;

pub use lock::AssetLock;
pub use update::UpdateFlags;
pub use version::VersionSnapshot;

use download::DownloadPlan;
use version::{RetiredVersion, VersionData};

/// Handle returned by [`Asset::subscribe`].
pub type SubscriptionId = u64;

/// Subscriber callback, invoked on the main thread with the flags raised
/// since the previous tick.
pub type UpdateCallback = Arc<dyn Fn(&Asset, UpdateFlags) + Send + Sync>;

/// Collaborators shared by every asset of one library.
pub(crate) struct AssetContext {
    pub paths: AssetPaths,
    pub store: MetadataStore,
    pub engine: HttpEngine,
    pub sharegroup: String,
}

struct AssetState {
    ttl: i64,
    touch: i64,
    data: Value,
    versions: Vec<VersionData>,
    retired: Vec<RetiredVersion>,
    download_active: bool,
    dirty: bool,
    pending: UpdateFlags,
}

pub struct Asset {
    id: i64,
    url: String,
    ctx: Arc<AssetContext>,
    state: RwLock<AssetState>,
    subscribers: Mutex<Vec<(SubscriptionId, UpdateCallback)>>,
    next_subscription: AtomicU64,
}

impl std::fmt::Debug for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Asset")
            .field("id", &self.id)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl Asset {
    /// Build the in-memory asset from a reconciled metadata record.
    pub(crate) fn from_record(record: AssetRecord, ctx: Arc<AssetContext>) -> Arc<Self> {
        let versions = record
            .versions
            .iter()
            .map(|row| VersionData::from_row(row, &ctx.paths))
            .collect();
        let row = record.asset;
        Arc::new(Self {
            id: row.id,
            url: row.url,
            ctx,
            state: RwLock::new(AssetState {
                ttl: row.ttl,
                touch: row.touch,
                data: row.data,
                versions,
                retired: Vec::new(),
                download_active: false,
                // A row left with download=1 by a crash gets reset on first flush
                dirty: row.download,
                pending: UpdateFlags::NONE,
            }),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn ttl(&self) -> Duration {
        let ttl = resilient_read(&self.state).ttl;
        Duration::from_micros(u64::try_from(ttl).unwrap_or(0))
    }

    pub fn set_ttl(&self, ttl: Duration) {
        let mut state = resilient_write(&self.state);
        state.ttl = i64::try_from(ttl.as_micros()).unwrap_or(i64::MAX);
        state.dirty = true;
    }

    /// Last acquisition time, microseconds since the epoch.
    pub fn touch_time(&self) -> i64 {
        resilient_read(&self.state).touch
    }

    pub fn touch(&self, micros: i64) {
        let mut state = resilient_write(&self.state);
        state.touch = micros;
        state.dirty = true;
    }

    pub fn data(&self) -> Value {
        resilient_read(&self.state).data.clone()
    }

    pub fn set_data(&self, data: Value) {
        let mut state = resilient_write(&self.state);
        state.data = data;
        state.dirty = true;
    }

    pub fn is_download_active(&self) -> bool {
        resilient_read(&self.state).download_active
    }

    /// In-memory state differs from the metadata row.
    pub fn is_dirty(&self) -> bool {
        resilient_read(&self.state).dirty
    }

    /// Snapshots of every tracked version, oldest first.
    pub fn versions(&self) -> Vec<VersionSnapshot> {
        resilient_read(&self.state)
            .versions
            .iter()
            .map(VersionData::snapshot)
            .collect()
    }

    /// Directory holding this asset's version files.
    pub fn asset_dir(&self) -> PathBuf {
        self.ctx.paths.asset_dir(self.id)
    }

    /// Scratch directory for consumers (`<asset-dir>/cache`).
    pub fn cache_path(&self) -> PathBuf {
        self.ctx.paths.cache_dir(self.id)
    }

    /// The first complete version whose file is still on disk.
    pub fn readable_version(&self) -> Option<VersionSnapshot> {
        resilient_read(&self.state)
            .versions
            .iter()
            .find(|v| v.is_readable())
            .map(VersionData::snapshot)
    }

    /// Pin a complete version so its file survives replacement and expiry
    /// until the returned lock is dropped.
    pub fn lock_version(self: &Arc<Self>, version_id: i64) -> Option<AssetLock> {
        let snapshot = {
            let mut state = resilient_write(&self.state);
            let version = state
                .versions
                .iter_mut()
                .find(|v| v.id == version_id && v.complete)?;
            version.locked += 1;
            version.snapshot()
        };
        tracing::debug!(asset = self.id, version = version_id, "version locked");
        Some(AssetLock::new(Arc::clone(self), snapshot))
    }

    /// Start (or resume, or revalidate) a download. Returns true if one is
    /// now running, including when one already was.
    pub fn download(self: &Arc<Self>) -> bool {
        self.download_with_priority(RequestPriority::Normal)
    }

    pub fn download_with_priority(self: &Arc<Self>, priority: RequestPriority) -> bool {
        download::start(self, priority)
    }

    /// Drop every complete version. Locked files stay until released; a
    /// download in flight is left running.
    pub fn clear(&self) {
        let mut state = resilient_write(&self.state);
        let complete: Vec<i64> = state
            .versions
            .iter()
            .filter(|v| v.complete)
            .map(|v| v.id)
            .collect();
        for id in complete {
            self.drop_version(&mut state, id);
        }
        state.pending |= UpdateFlags::CACHE_DATA_UPDATED | UpdateFlags::DOWNLOAD_FAILED;
        tracing::debug!(asset = self.id, "asset cleared");
    }

    /// Register a callback for change notifications.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Asset, UpdateFlags) + Send + Sync + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        resilient_lock(&self.subscribers).push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = resilient_lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Deliver accumulated flags to subscribers. Returns what was delivered.
    pub(crate) fn dispatch_updates(&self) -> UpdateFlags {
        let flags = std::mem::take(&mut resilient_write(&self.state).pending);
        if flags.is_empty() {
            return flags;
        }
        // Callbacks may subscribe or touch the asset; run them unlocked.
        let callbacks: Vec<UpdateCallback> = resilient_lock(&self.subscribers)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(self, flags);
        }
        flags
    }

    /// Flags raised since the last dispatch, without consuming them.
    pub fn pending_updates(&self) -> UpdateFlags {
        resilient_read(&self.state).pending
    }

    /// Row image to persist if the asset is dirty; clears the flag.
    pub(crate) fn take_update(&self) -> Option<AssetUpdate> {
        let mut state = resilient_write(&self.state);
        if !state.dirty {
            return None;
        }
        state.dirty = false;
        Some(AssetUpdate {
            id: self.id,
            touch: state.touch,
            ttl: state.ttl,
            download: state.download_active,
            data: state.data.clone(),
        })
    }

    /// Decide how the next download proceeds and mark it active. `None`
    /// if one is already running.
    fn begin_download(&self) -> Option<DownloadPlan> {
        let mut state = resilient_write(&self.state);
        if state.download_active {
            return None;
        }

        let pending: Vec<(i64, PathBuf)> = state
            .versions
            .iter()
            .filter(|v| !v.complete)
            .map(|v| (v.id, v.path.clone()))
            .collect();
        let mut plan = None;
        for (id, path) in pending {
            let resumable = plan.is_none()
                && fs::metadata(&path)
                    .map(|m| m.is_file() && m.len() > 0)
                    .unwrap_or(false);
            if !resumable {
                tracing::debug!(asset = self.id, version = id, "dropping unresumable version");
                self.drop_version(&mut state, id);
                continue;
            }
            if let Some(v) = state.versions.iter().find(|v| v.id == id) {
                let offset = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                plan = Some(DownloadPlan::Resume {
                    version: id,
                    ctime: v.ctime,
                    etag: v.etag.clone(),
                    path,
                    offset,
                });
            }
        }

        let plan = plan.unwrap_or_else(|| {
            match state.versions.iter().find(|v| v.is_readable()) {
                Some(v) => DownloadPlan::Refresh {
                    ctime: v.ctime,
                    etag: v.etag.clone(),
                },
                None => DownloadPlan::Fresh,
            }
        });

        state.download_active = true;
        state.dirty = true;
        Some(plan)
    }

    /// True if a tracked version already owns `path`.
    pub(crate) fn path_in_use(&self, path: &Path) -> bool {
        resilient_read(&self.state)
            .versions
            .iter()
            .any(|v| v.path == path)
    }

    /// A new version row exists; start tracking it.
    pub(crate) fn append_version(&self, row: schema::VersionRow) {
        let version = VersionData::from_row(&row, &self.ctx.paths);
        tracing::debug!(asset = self.id, version = version.id, path = %version.path.display(), "version added");
        let mut state = resilient_write(&self.state);
        // A retired file at the same path now belongs to the new version.
        state.retired.retain(|r| r.path != version.path);
        state.versions.push(version);
        state.pending |= UpdateFlags::DOWNLOAD_STARTED;
    }

    pub(crate) fn set_download_progress(&self, total: u64, current: u64) {
        let mut state = resilient_write(&self.state);
        if let Some(version) = state.versions.iter_mut().rev().find(|v| !v.complete) {
            if total > 0 {
                let fraction = (current as f64 / total as f64).clamp(0.0, 1.0) as f32;
                version.progress = version.progress.max(fraction);
            }
        }
        state.pending |= UpdateFlags::DOWNLOAD_PROGRESS;
    }

    /// Finish the download that wrote `path`.
    pub(crate) fn finish_by_path(&self, path: &Path, success: bool) {
        let version = resilient_read(&self.state)
            .versions
            .iter()
            .find(|v| !v.complete && v.path == path)
            .map(|v| v.id);
        if version.is_none() {
            tracing::warn!(asset = self.id, path = %path.display(), "download finished without a version row");
            if !self.path_in_use(path) {
                if let Err(e) = paths::remove_file_quiet(path) {
                    tracing::warn!(path = %path.display(), "failed to remove untracked download: {}", e);
                }
            }
        }
        self.set_download_complete(version, success && version.is_some());
    }

    /// Close out the active download.
    ///
    /// On success the version becomes the only one the asset tracks; on
    /// failure it is dropped.
    pub(crate) fn set_download_complete(&self, version: Option<i64>, success: bool) {
        let mut state = resilient_write(&self.state);
        state.download_active = false;
        state.dirty = true;

        let completed = match version {
            Some(id) if success => self.complete_version(&mut state, id),
            _ => false,
        };
        if completed {
            state.pending |= UpdateFlags::CACHE_DATA_UPDATED
                | UpdateFlags::DOWNLOAD_COMPLETED
                | UpdateFlags::DOWNLOAD_SUCCESSFUL;
            tracing::info!(asset = self.id, url = %self.url, "download complete");
        } else {
            if let Some(id) = version {
                self.drop_version(&mut state, id);
            }
            state.pending |= UpdateFlags::DOWNLOAD_COMPLETED | UpdateFlags::DOWNLOAD_FAILED;
            tracing::warn!(asset = self.id, url = %self.url, "download failed");
        }
    }

    /// The server confirmed the cached copy (3xx, or the same entity again).
    pub(crate) fn set_file_validated(&self) {
        let mut state = resilient_write(&self.state);
        state.download_active = false;
        state.touch = now_micros();
        state.dirty = true;
        state.pending |= UpdateFlags::CACHE_DATA_UPDATED | UpdateFlags::DOWNLOAD_COMPLETED;
        tracing::debug!(asset = self.id, "cached copy still valid");
    }

    /// Undo one lock on `version_id`, deleting the file if the version is
    /// gone and this was its last lock.
    pub(crate) fn release_lock(&self, version_id: i64, path: &Path) {
        let mut state = resilient_write(&self.state);
        if let Some(version) = state.versions.iter_mut().find(|v| v.id == version_id) {
            version.locked = version.locked.saturating_sub(1);
            return;
        }
        if let Some(pos) = state.retired.iter().position(|r| r.id == version_id) {
            let retired = &mut state.retired[pos];
            retired.locked = retired.locked.saturating_sub(1);
            if retired.locked > 0 {
                return;
            }
            state.retired.remove(pos);
        }
        if state.versions.iter().any(|v| v.path == path) {
            return;
        }
        tracing::debug!(asset = self.id, version = version_id, "last lock released, removing file");
        if let Err(e) = paths::remove_file_quiet(path) {
            tracing::warn!(path = %path.display(), "failed to remove released version: {}", e);
        }
    }

    fn complete_version(&self, state: &mut AssetState, id: i64) -> bool {
        let now = now_micros();
        let Some(version) = state.versions.iter_mut().find(|v| v.id == id) else {
            return false;
        };
        let size = fs::metadata(&version.path)
            .map(|m| m.len())
            .unwrap_or(version.size);
        version.complete = true;
        version.size = size;
        version.mtime = now;
        version.progress = 1.0;

        let others: Vec<i64> = state
            .versions
            .iter()
            .filter(|v| v.id != id)
            .map(|v| v.id)
            .collect();
        for other in others {
            self.drop_version(state, other);
        }

        let size = i64::try_from(size).unwrap_or(i64::MAX);
        self.ctx
            .store
            .perform_detached(move |tx| schema::mark_version_complete(tx, id, size, now));
        state.touch = now;
        true
    }

    /// Remove a version from the vector and erase its row. The file goes
    /// now unless locked, in which case it waits for the last release.
    fn drop_version(&self, state: &mut AssetState, id: i64) {
        let Some(pos) = state.versions.iter().position(|v| v.id == id) else {
            return;
        };
        let version = state.versions.remove(pos);
        if version.locked == 0 {
            if let Err(e) = paths::remove_file_quiet(&version.path) {
                tracing::warn!(path = %version.path.display(), "failed to remove version file: {}", e);
            }
        } else {
            tracing::debug!(asset = self.id, version = id, locks = version.locked, "retiring locked version");
            state.retired.push(RetiredVersion {
                id,
                path: version.path,
                locked: version.locked,
            });
        }
        self.ctx
            .store
            .perform_detached(move |tx| schema::delete_version(tx, id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{EngineConfig, EngineWorker};
    use crate::main_loop::MainQueue;
    use crate::store::{reconcile, NewVersion, StoreWorker};
    use rusqlite::Transaction;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        queue: MainQueue,
        ctx: Arc<AssetContext>,
        workers: Option<(StoreWorker, EngineWorker)>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().expect("Failed to create temp dir");
            let queue = MainQueue::new();
            let paths = AssetPaths::new(dir.path());
            paths.ensure_root().unwrap();
            let (store, store_worker) =
                MetadataStore::open(&dir.path().join("assets.db"), queue.handle()).unwrap();
            let (engine, engine_worker) =
                HttpEngine::start(EngineConfig::default(), queue.handle()).unwrap();
            let ctx = Arc::new(AssetContext {
                paths,
                store,
                engine,
                sharegroup: "default".into(),
            });
            Self {
                _dir: dir,
                queue,
                ctx,
                workers: Some((store_worker, engine_worker)),
            }
        }

        fn perform<T, F>(&self, task: F) -> T
        where
            T: Send + 'static,
            F: FnOnce(&Transaction<'_>) -> anyhow::Result<T> + Send + 'static,
        {
            let slot = Arc::new(Mutex::new(None));
            let sink = Arc::clone(&slot);
            self.ctx
                .store
                .perform(task, move |value| *sink.lock().unwrap() = Some(value));
            for _ in 0..500 {
                if slot.lock().unwrap().is_some() {
                    break;
                }
                self.queue.wait(Duration::from_millis(10));
            }
            let value = slot.lock().unwrap().take();
            value.flatten().expect("transaction failed")
        }

        fn asset(&self, url: &str) -> Arc<Asset> {
            let paths = self.ctx.paths.clone();
            let url = url.to_string();
            let record = self.perform(move |tx| reconcile::acquire_record(tx, &paths, &url, 0, 1));
            Asset::from_record(record, Arc::clone(&self.ctx))
        }

        fn add_version(&self, asset: &Arc<Asset>, etag: &str, ctime: i64, body: &[u8]) -> i64 {
            let path = self.ctx.paths.version_path(asset.id(), ctime, etag);
            fs::write(&path, body).unwrap();
            let version = NewVersion {
                asset: asset.id(),
                etag: etag.into(),
                ctime,
                size: body.len() as i64,
                content_type: "application/octet-stream".into(),
            };
            let row = self.perform(move |tx| schema::insert_version(tx, &version, ctime));
            let id = row.id;
            asset.append_version(row);
            id
        }

        fn add_complete(&self, asset: &Arc<Asset>, etag: &str, ctime: i64, body: &[u8]) -> i64 {
            let id = self.add_version(asset, etag, ctime, body);
            asset.set_download_complete(Some(id), true);
            id
        }

        fn version_files(&self, asset: &Asset) -> Vec<String> {
            let mut names: Vec<String> = fs::read_dir(asset.asset_dir())
                .unwrap()
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name != paths::CACHE_DIR_NAME)
                .collect();
            names.sort();
            names
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.ctx.engine.shutdown();
            self.ctx.store.shutdown();
            if let Some((store, engine)) = self.workers.take() {
                engine.join();
                store.join();
            }
        }
    }

    #[test]
    fn test_readable_version_requires_file() {
        let h = Harness::new();
        let asset = h.asset("app://readable");
        assert!(asset.readable_version().is_none());

        h.add_complete(&asset, "v1", 10, b"abc");
        let readable = asset.readable_version().expect("complete version");
        assert_eq!(readable.size, 3);
        assert!(readable.complete);

        fs::remove_file(&readable.path).unwrap();
        assert!(asset.readable_version().is_none());
    }

    #[test]
    fn test_success_replaces_older_versions() {
        let h = Harness::new();
        let asset = h.asset("app://replace");
        h.add_complete(&asset, "v1", 10, b"abc");
        let v2 = h.add_complete(&asset, "v2", 20, b"defg");

        let versions = asset.versions();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].id, v2);
        assert_eq!(h.version_files(&asset), vec!["20-v2".to_string()]);
        let flags = asset.pending_updates();
        assert!(flags.contains(UpdateFlags::DOWNLOAD_COMPLETED | UpdateFlags::DOWNLOAD_SUCCESSFUL));
    }

    #[test]
    fn test_lock_pins_file_across_replacement() {
        let h = Harness::new();
        let asset = h.asset("app://locked");
        let v1 = h.add_complete(&asset, "v1", 10, b"\x01\x02\x03");
        let lock = asset.lock_version(v1).expect("lock complete version");
        assert_eq!(asset.versions()[0].locked, 1);

        h.add_complete(&asset, "v2", 20, b"\x04\x05\x06\x07");
        assert_eq!(asset.versions().len(), 1);
        assert_eq!(fs::read(lock.path()).unwrap(), b"\x01\x02\x03");

        let old_path = lock.path().to_path_buf();
        drop(lock);
        assert!(!old_path.exists());
        assert!(asset.readable_version().is_some());
    }

    #[test]
    fn test_retired_file_waits_for_last_lock() {
        let h = Harness::new();
        let asset = h.asset("app://two-locks");
        let v1 = h.add_complete(&asset, "v1", 10, b"abc");
        let first = asset.lock_version(v1).unwrap();
        let second = asset.lock_version(v1).unwrap();
        let path = first.path().to_path_buf();

        asset.clear();
        assert!(asset.versions().is_empty());
        drop(first);
        assert!(path.exists(), "second lock still pins the file");
        drop(second);
        assert!(!path.exists());
    }

    #[test]
    fn test_clear_without_locks_leaves_only_cache_dir() {
        let h = Harness::new();
        let asset = h.asset("app://clear");
        h.add_complete(&asset, "v1", 10, b"abc");
        asset.clear();

        assert!(h.version_files(&asset).is_empty());
        assert!(asset.cache_path().is_dir());
        let flags = asset.pending_updates();
        assert!(flags.contains(UpdateFlags::CACHE_DATA_UPDATED | UpdateFlags::DOWNLOAD_FAILED));
    }

    #[test]
    fn test_failed_download_drops_pending_version() {
        let h = Harness::new();
        let asset = h.asset("app://failed");
        let pending = h.add_version(&asset, "p1", 30, b"ab");
        assert!(asset.lock_version(pending).is_none(), "incomplete versions cannot be locked");

        asset.set_download_complete(Some(pending), false);
        assert!(asset.versions().is_empty());
        assert!(h.version_files(&asset).is_empty());
        assert!(asset.pending_updates().contains(UpdateFlags::DOWNLOAD_FAILED));
    }

    #[test]
    fn test_progress_keeps_maximum() {
        let h = Harness::new();
        let asset = h.asset("app://progress");
        h.add_version(&asset, "p1", 30, b"ab");

        asset.set_download_progress(100, 60);
        asset.set_download_progress(100, 40);
        assert!((asset.versions()[0].progress - 0.6).abs() < f32::EPSILON);
    }

    #[test]
    fn test_subscribers_receive_flags_once() {
        let h = Harness::new();
        let asset = h.asset("app://subscribe");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = asset.subscribe(move |_, flags| sink.lock().unwrap().push(flags));

        asset.clear();
        assert_eq!(asset.dispatch_updates(), UpdateFlags::CACHE_DATA_UPDATED | UpdateFlags::DOWNLOAD_FAILED);
        assert!(asset.dispatch_updates().is_empty());
        assert_eq!(seen.lock().unwrap().len(), 1);

        assert!(asset.unsubscribe(id));
        asset.clear();
        asset.dispatch_updates();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_take_update_clears_dirty() {
        let h = Harness::new();
        let asset = h.asset("app://dirty");
        assert!(!asset.is_dirty());

        asset.set_data(serde_json::json!({ "k": 1 }));
        asset.touch(99);
        let update = asset.take_update().expect("dirty asset");
        assert_eq!(update.touch, 99);
        assert_eq!(update.data["k"], 1);
        assert!(!update.download);
        assert!(asset.take_update().is_none());
    }
}
