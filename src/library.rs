// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Asset library: the registry consumers talk to.
//!
//! Acquisition is asynchronous. A request for a URL that is already live is
//! answered on the next pump of the main loop; otherwise the metadata worker
//! looks up (or creates) the row and reconciles its versions, and every
//! consumer that asked for the URL in the meantime gets the same asset.
//!
//! Nothing here blocks on a worker except [`AssetLibrary::wait_until`] and
//! [`AssetLibrary::shutdown`], which exist for tools and tests.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::asset::{Asset, AssetContext};
use crate::config::LibraryConfig;
use crate::error::{AssetError, Result};
use crate::http::{EngineConfig, EngineWorker, HttpEngine};
use crate::main_loop::MainQueue;
use crate::paths::{AssetPaths, RootLock, ROOT_LOCK_TIMEOUT};
use crate::store::{cleanup, reconcile, schema, AssetRecord, CleanupReport, MetadataStore, StoreWorker};
use crate::sync::resilient_lock;
use crate::utils::now_micros;

/// Called on the main thread with the acquired asset, or `None` for a
/// malformed URL or a failed lookup.
pub type AcquireCallback = Box<dyn FnOnce(Option<Arc<Asset>>) + Send + 'static>;

/// Called once with every result of a batch, in request order.
pub type BatchCallback = Box<dyn FnOnce(Vec<Option<Arc<Asset>>>) + Send + 'static>;

/// Opaque value kept alive until an acquisition resolves.
pub type Retained = Arc<dyn Any + Send + Sync>;

/// URL schemes accepted as-is.
const URL_SCHEMES: [&str; 5] = ["http", "https", "ftp", "ftps", "app"];

/// How long shutdown waits for the metadata worker to settle.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

/// One entry of a batch acquisition.
pub struct AssetRequest {
    pub url: String,
    pub ttl: Duration,
    pub callback: Option<AcquireCallback>,
}

impl AssetRequest {
    pub fn new(url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            url: url.into(),
            ttl,
            callback: None,
        }
    }

    pub fn on_acquired<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Option<Arc<Asset>>) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }
}

struct Waiter {
    callback: AcquireCallback,
    _retained: Option<Retained>,
}

impl Waiter {
    fn fire(self, asset: Option<Arc<Asset>>) {
        (self.callback)(asset);
    }
}

struct DeferredAcquire {
    url: String,
    ttl: Duration,
    waiter: Waiter,
}

#[derive(Default)]
struct LibraryState {
    loaded: bool,
    /// Requests made before the initial sweep finished
    deferred: Vec<DeferredAcquire>,
    /// In-flight lookups by canonical URL
    slots: HashMap<String, Vec<Waiter>>,
    live: HashMap<String, Arc<Asset>>,
    by_id: HashMap<i64, String>,
}

struct LibraryInner {
    ctx: Arc<AssetContext>,
    main: MainQueue,
    offline: AtomicBool,
    state: Mutex<LibraryState>,
}

struct Workers {
    store: StoreWorker,
    engine: EngineWorker,
}

/// Registry of live assets for one cache root.
///
/// The thread that calls [`AssetLibrary::update`] is the library's main
/// thread: acquisition callbacks and asset notifications run there.
pub struct AssetLibrary {
    inner: Arc<LibraryInner>,
    workers: Mutex<Option<Workers>>,
    _root_lock: RootLock,
}

impl AssetLibrary {
    /// Open the cache at `config.cache_root` and start the workers.
    ///
    /// Fails if the root cannot be created, another library holds it, or
    /// the metadata store cannot be opened.
    pub fn new(config: LibraryConfig) -> Result<Self> {
        if config.sharegroup.trim().is_empty() {
            return Err(AssetError::Config("sharegroup must not be empty".into()));
        }
        let paths = AssetPaths::new(&config.cache_root);
        let root_lock = paths.lock_root(ROOT_LOCK_TIMEOUT)?;
        paths.ensure_root()?;

        let main = MainQueue::new();
        let (store, store_worker) = MetadataStore::open(&config.database_path(), main.handle())?;
        let (engine, engine_worker) =
            match HttpEngine::start(EngineConfig::from_library(&config), main.handle()) {
                Ok(started) => started,
                Err(e) => {
                    store.shutdown();
                    store_worker.join();
                    return Err(e);
                }
            };

        let inner = Arc::new(LibraryInner {
            ctx: Arc::new(AssetContext {
                paths,
                store,
                engine,
                sharegroup: config.sharegroup.clone(),
            }),
            main,
            offline: AtomicBool::new(config.offline),
            state: Mutex::new(LibraryState::default()),
        });

        let library = Self {
            inner,
            workers: Mutex::new(Some(Workers {
                store: store_worker,
                engine: engine_worker,
            })),
            _root_lock: root_lock,
        };
        library.load();
        tracing::info!(root = %config.cache_root.display(), offline = config.offline, "asset library opened");
        Ok(library)
    }

    /// Initial sweep; deferred acquisitions replay once it is done.
    fn load(&self) {
        let inner = Arc::clone(&self.inner);
        let paths = self.inner.ctx.paths.clone();
        let offline = self.is_offline();
        let queued = self.inner.ctx.store.perform(
            move |tx| {
                if offline {
                    return Ok(None);
                }
                cleanup::sweep(tx, &paths, now_micros(), &HashSet::new()).map(Some)
            },
            move |report: Option<Option<CleanupReport>>| {
                if let Some(Some(report)) = report {
                    tracing::debug!(?report, "startup sweep finished");
                }
                inner.on_loaded();
            },
        );
        if !queued {
            self.inner.on_loaded();
        }
    }

    /// Request the asset for `url`. `callback` runs on the main thread.
    ///
    /// Returns false only if the library is shutting down.
    pub fn acquire_asset<F>(
        &self,
        url: &str,
        ttl: Duration,
        callback: F,
        retained: Option<Retained>,
    ) -> bool
    where
        F: FnOnce(Option<Arc<Asset>>) + Send + 'static,
    {
        self.inner.acquire(
            url,
            ttl,
            Waiter {
                callback: Box::new(callback),
                _retained: retained,
            },
        )
    }

    /// Request several assets. Each request's own callback fires as its URL
    /// resolves; `callback` fires once with all results in request order.
    pub fn acquire_assets(
        &self,
        requests: Vec<AssetRequest>,
        callback: Option<BatchCallback>,
        retained: Option<Retained>,
    ) -> bool {
        let group = callback.map(|cb| BatchGroup::new(requests.len(), cb));
        if requests.is_empty() {
            if let Some(group) = group {
                self.inner.main.post_task(move || group.finish());
            }
            return true;
        }

        let mut accepted = true;
        for (index, request) in requests.into_iter().enumerate() {
            let group = group.clone();
            let own = request.callback;
            let waiter = Waiter {
                callback: Box::new(move |asset: Option<Arc<Asset>>| {
                    if let Some(own) = own {
                        own(asset.clone());
                    }
                    if let Some(group) = group {
                        group.resolve(index, asset);
                    }
                }),
                _retained: retained.clone(),
            };
            accepted &= self.inner.acquire(&request.url, request.ttl, waiter);
        }
        accepted
    }

    /// Pump the main loop: run marshalled callbacks, deliver asset
    /// notifications, flush dirty assets and evict unreferenced ones.
    /// Returns the number of callbacks run.
    pub fn update(&self) -> usize {
        let ran = self.inner.main.drain();
        self.inner.tick();
        ran
    }

    /// Pump until `done` returns true or `timeout` elapses.
    pub fn wait_until<F>(&self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.update();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.inner
                .main
                .wait((deadline - now).min(Duration::from_millis(10)));
        }
    }

    /// Run the TTL sweep now. Skipped while offline: expired files could
    /// not be fetched again.
    pub fn cleanup(&self) -> bool {
        self.cleanup_with(|_| {})
    }

    /// Like [`cleanup`](Self::cleanup), reporting the result on the main
    /// thread (`None` if the sweep failed or was skipped).
    pub fn cleanup_with<F>(&self, callback: F) -> bool
    where
        F: FnOnce(Option<CleanupReport>) + Send + 'static,
    {
        if self.is_offline() {
            tracing::debug!("offline, skipping cleanup");
            self.inner.main.post_task(move || callback(None));
            return false;
        }
        let live: HashSet<i64> = resilient_lock(&self.inner.state)
            .by_id
            .keys()
            .copied()
            .collect();
        let paths = self.inner.ctx.paths.clone();
        self.inner.ctx.store.perform(
            move |tx| cleanup::sweep(tx, &paths, now_micros(), &live),
            callback,
        )
    }

    pub fn set_offline(&self, offline: bool) {
        if self.inner.offline.swap(offline, Ordering::SeqCst) != offline {
            tracing::info!(offline, "offline mode changed");
        }
    }

    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    /// The live asset for `url`, if one is currently held.
    pub fn get_live_asset(&self, url: &str) -> Option<Arc<Asset>> {
        let url = canonical_url(url)?;
        resilient_lock(&self.inner.state).live.get(&url).cloned()
    }

    pub fn get_live_asset_by_id(&self, id: i64) -> Option<Arc<Asset>> {
        let state = resilient_lock(&self.inner.state);
        let url = state.by_id.get(&id)?;
        state.live.get(url).cloned()
    }

    pub fn live_count(&self) -> usize {
        resilient_lock(&self.inner.state).live.len()
    }

    /// Whether the startup sweep has finished and acquisitions run directly.
    pub fn is_loaded(&self) -> bool {
        resilient_lock(&self.inner.state).loaded
    }

    /// Transfers the network worker has started since the library opened.
    pub fn requests_started(&self) -> usize {
        self.inner.ctx.engine.requests_started()
    }

    pub fn root(&self) -> &Path {
        self.inner.ctx.paths.root()
    }

    /// Stop both workers. In-flight downloads fail, dirty assets are
    /// flushed. Safe to call more than once.
    pub fn shutdown(&self) {
        let Some(workers) = resilient_lock(&self.workers).take() else {
            return;
        };
        tracing::info!("shutting down asset library");

        self.inner.ctx.engine.shutdown();
        workers.engine.join();
        // Completions posted by the engine may queue more metadata work.
        for _ in 0..2 {
            self.update();
            self.settle_store();
        }
        self.update();

        self.inner.ctx.store.shutdown();
        workers.store.join();
        self.inner.main.drain();
    }

    /// Wait until every metadata job queued so far has run and its callback
    /// has been pumped.
    fn settle_store(&self) {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let queued = self.inner.ctx.store.perform(
            |_| Ok(()),
            move |_: Option<()>| flag.store(true, Ordering::SeqCst),
        );
        if queued && !self.wait_until(SETTLE_TIMEOUT, || done.load(Ordering::SeqCst)) {
            tracing::warn!("metadata worker did not settle before shutdown");
        }
    }
}

impl Drop for AssetLibrary {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl LibraryInner {
    fn on_loaded(self: &Arc<Self>) {
        let deferred = {
            let mut state = resilient_lock(&self.state);
            state.loaded = true;
            std::mem::take(&mut state.deferred)
        };
        if !deferred.is_empty() {
            tracing::debug!(count = deferred.len(), "replaying deferred acquisitions");
        }
        for request in deferred {
            self.acquire(&request.url, request.ttl, request.waiter);
        }
    }

    fn acquire(self: &Arc<Self>, raw_url: &str, ttl: Duration, waiter: Waiter) -> bool {
        let mut state = resilient_lock(&self.state);
        if !state.loaded {
            state.deferred.push(DeferredAcquire {
                url: raw_url.to_string(),
                ttl,
                waiter,
            });
            return true;
        }

        let Some(url) = canonical_url(raw_url) else {
            drop(state);
            tracing::warn!(url = raw_url, "rejecting malformed asset URL");
            self.main.post_task(move || waiter.fire(None));
            return true;
        };

        if let Some(asset) = state.live.get(&url).cloned() {
            drop(state);
            asset.set_ttl(ttl);
            asset.touch(now_micros());
            self.main.post_task(move || waiter.fire(Some(asset)));
            return true;
        }

        if let Some(slot) = state.slots.get_mut(&url) {
            slot.push(waiter);
            return true;
        }
        state.slots.insert(url.clone(), vec![waiter]);
        drop(state);

        let inner = Arc::clone(self);
        let paths = self.ctx.paths.clone();
        let ttl_us = i64::try_from(ttl.as_micros()).unwrap_or(i64::MAX);
        let lookup_url = url.clone();
        let queued = self.ctx.store.perform(
            move |tx| reconcile::acquire_record(tx, &paths, &lookup_url, ttl_us, now_micros()),
            move |record| inner.on_record(&url, record),
        );
        if !queued {
            tracing::error!("metadata worker is gone, acquisition dropped");
        }
        queued
    }

    fn on_record(&self, url: &str, record: Option<AssetRecord>) {
        let (waiters, asset) = {
            let mut state = resilient_lock(&self.state);
            let waiters = state.slots.remove(url).unwrap_or_default();
            let asset = match record {
                Some(record) => {
                    let asset = Asset::from_record(record, Arc::clone(&self.ctx));
                    state.by_id.insert(asset.id(), url.to_string());
                    state.live.insert(url.to_string(), Arc::clone(&asset));
                    tracing::debug!(asset = asset.id(), url, "asset acquired");
                    Some(asset)
                }
                None => {
                    tracing::warn!(url, "asset lookup failed");
                    None
                }
            };
            (waiters, asset)
        };
        for waiter in waiters {
            waiter.fire(asset.clone());
        }
    }

    /// Deliver notifications, flush dirty rows, evict assets nobody holds.
    fn tick(&self) {
        let assets: Vec<Arc<Asset>> = resilient_lock(&self.state).live.values().cloned().collect();
        for asset in &assets {
            asset.dispatch_updates();
            if let Some(update) = asset.take_update() {
                self.ctx
                    .store
                    .perform_detached(move |tx| schema::update_asset(tx, &update, now_micros()));
            }
        }
        drop(assets);

        let mut state = resilient_lock(&self.state);
        let idle: Vec<String> = state
            .live
            .iter()
            .filter(|(_, asset)| Arc::strong_count(asset) == 1)
            .map(|(url, _)| url.clone())
            .collect();
        for url in idle {
            if let Some(asset) = state.live.remove(&url) {
                state.by_id.remove(&asset.id());
                tracing::debug!(asset = asset.id(), url = %url, "evicting unreferenced asset");
            }
        }
    }
}

/// Completion counter for a batch acquisition.
struct BatchGroup {
    results: Mutex<Vec<Option<Arc<Asset>>>>,
    remaining: AtomicUsize,
    callback: Mutex<Option<BatchCallback>>,
}

impl BatchGroup {
    fn new(count: usize, callback: BatchCallback) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(vec![None; count]),
            remaining: AtomicUsize::new(count),
            callback: Mutex::new(Some(callback)),
        })
    }

    fn resolve(&self, index: usize, asset: Option<Arc<Asset>>) {
        if let Some(slot) = resilient_lock(&self.results).get_mut(index) {
            *slot = asset;
        }
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        let callback = resilient_lock(&self.callback).take();
        if let Some(callback) = callback {
            let results = std::mem::take(&mut *resilient_lock(&self.results));
            callback(results);
        }
    }
}

/// Normalise a consumer-supplied location into the key assets are stored
/// under.
///
/// Known schemes pass through (scheme lowercased), `%`-prefixed locations
/// are kept verbatim, absolute paths are normalised lexically, and bare
/// names are placed under `app://`. Anything else is rejected.
pub fn canonical_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with('%') {
        return Some(raw.to_string());
    }
    if let Some((scheme, rest)) = raw.split_once("://") {
        let scheme = scheme.to_ascii_lowercase();
        if rest.is_empty() || !URL_SCHEMES.contains(&scheme.as_str()) {
            return None;
        }
        return Some(format!("{}://{}", scheme, rest));
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        return Some(normalize_path(path).to_string_lossy().into_owned());
    }
    if raw.contains(':') {
        return None;
    }
    Some(format!("app://{}", raw.trim_start_matches("./")))
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_canonical_url_schemes() {
        assert_eq!(
            canonical_url("https://example.org/a.bin").as_deref(),
            Some("https://example.org/a.bin")
        );
        assert_eq!(canonical_url("HTTP://x/y").as_deref(), Some("http://x/y"));
        assert_eq!(canonical_url("ftps://host/f").as_deref(), Some("ftps://host/f"));
        assert_eq!(canonical_url("app://icons/a.png").as_deref(), Some("app://icons/a.png"));
        assert_eq!(canonical_url("%PLATFORM%/a").as_deref(), Some("%PLATFORM%/a"));
    }

    #[test]
    fn test_canonical_url_paths_and_names() {
        assert_eq!(canonical_url("/tmp/./a/../b.bin").as_deref(), Some("/tmp/b.bin"));
        assert_eq!(canonical_url("icons/a.png").as_deref(), Some("app://icons/a.png"));
        assert_eq!(canonical_url("  name  ").as_deref(), Some("app://name"));
    }

    #[test]
    fn test_canonical_url_rejects_malformed() {
        assert_eq!(canonical_url(""), None);
        assert_eq!(canonical_url("   "), None);
        assert_eq!(canonical_url("gopher://x"), None);
        assert_eq!(canonical_url("https://"), None);
        assert_eq!(canonical_url("mailto:someone"), None);
    }

    fn open(dir: &TempDir) -> AssetLibrary {
        AssetLibrary::new(LibraryConfig::with_root(dir.path())).expect("open library")
    }

    #[test]
    fn test_second_library_on_same_root_is_refused() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let _first = open(&dir);
        let paths = AssetPaths::new(dir.path());
        let second = paths.lock_root(Duration::from_millis(100));
        assert!(matches!(second, Err(AssetError::RootLocked(_))));
    }

    #[test]
    fn test_empty_sharegroup_is_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut config = LibraryConfig::with_root(dir.path());
        config.sharegroup = " ".into();
        assert!(matches!(AssetLibrary::new(config), Err(AssetError::Config(_))));
    }

    #[test]
    fn test_malformed_url_resolves_to_none() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let library = open(&dir);
        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);
        assert!(library.acquire_asset(
            "gopher://nope",
            Duration::ZERO,
            move |asset| *sink.lock().unwrap() = Some(asset.is_none()),
            None,
        ));
        assert!(library.wait_until(Duration::from_secs(5), || result.lock().unwrap().is_some()));
        assert_eq!(*result.lock().unwrap(), Some(true));
    }

    #[test]
    fn test_same_url_coalesces_and_persists_data() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let first_id;
        {
            let library = open(&dir);
            let got = Arc::new(Mutex::new(Vec::new()));
            for _ in 0..3 {
                let sink = Arc::clone(&got);
                library.acquire_asset(
                    "app://coalesce",
                    Duration::ZERO,
                    move |asset| sink.lock().unwrap().push(asset),
                    None,
                );
            }
            assert!(library.wait_until(Duration::from_secs(5), || got.lock().unwrap().len() == 3));
            let assets: Vec<Arc<Asset>> = got.lock().unwrap().drain(..).flatten().collect();
            assert_eq!(assets.len(), 3);
            assert!(Arc::ptr_eq(&assets[0], &assets[1]));
            assert!(Arc::ptr_eq(&assets[1], &assets[2]));

            first_id = assets[0].id();
            assets[0].set_data(serde_json::json!({ "label": "kept" }));
            assert!(library.get_live_asset_by_id(first_id).is_some());
            drop(assets);
            // Flushes the row, then evicts the unheld asset
            library.update();
            assert!(library.get_live_asset("app://coalesce").is_none());
        }

        let library = open(&dir);
        let got = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&got);
        library.acquire_asset(
            "coalesce",
            Duration::ZERO,
            move |asset| *sink.lock().unwrap() = asset,
            None,
        );
        assert!(library.wait_until(Duration::from_secs(5), || got.lock().unwrap().is_some()));
        let asset = got.lock().unwrap().take().unwrap();
        assert_eq!(asset.id(), first_id);
        assert_eq!(asset.data()["label"], "kept");
    }

    #[test]
    fn test_batch_fires_once_in_request_order() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let library = open(&dir);
        let batch = Arc::new(Mutex::new(None));
        let individual = Arc::new(AtomicUsize::new(0));

        let sink = Arc::clone(&batch);
        let requests = ["app://b1", "app://b2", "gopher://bad"]
            .iter()
            .map(|url| {
                let counter = Arc::clone(&individual);
                AssetRequest::new(*url, Duration::ZERO).on_acquired(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        assert!(library.acquire_assets(
            requests,
            Some(Box::new(move |results| *sink.lock().unwrap() = Some(results))),
            None,
        ));

        assert!(library.wait_until(Duration::from_secs(5), || batch.lock().unwrap().is_some()));
        let results = batch.lock().unwrap().take().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().map(|a| a.url().to_string()).as_deref(), Some("app://b1"));
        assert_eq!(results[1].as_ref().map(|a| a.url().to_string()).as_deref(), Some("app://b2"));
        assert!(results[2].is_none());
        assert_eq!(individual.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_empty_batch_still_completes() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let library = open(&dir);
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        library.acquire_assets(
            Vec::new(),
            Some(Box::new(move |results| flag.store(results.is_empty(), Ordering::SeqCst))),
            None,
        );
        assert!(library.wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst)));
    }

    #[test]
    fn test_offline_skips_cleanup() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let library = open(&dir);
        library.set_offline(true);
        assert!(library.is_offline());

        let report = Arc::new(Mutex::new(Some(Some(CleanupReport::default()))));
        let sink = Arc::clone(&report);
        assert!(!library.cleanup_with(move |r| *sink.lock().unwrap() = Some(r)));
        library.update();
        assert_eq!(*report.lock().unwrap(), Some(None));
    }
}
