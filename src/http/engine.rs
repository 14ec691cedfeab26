// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Network worker.
//!
//! One OS thread runs a current-thread tokio runtime. Requests pushed from
//! any thread land in a priority queue; up to `max_active` transfers run at
//! once. Handler callbacks other than completion run on this thread;
//! progress and completion are posted to the main loop.

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::{IF_MODIFIED_SINCE, IF_NONE_MATCH, RANGE};
use tokio::sync::{mpsc, watch};

use super::request::{ProgressCallback, Queued, Request, RequestHandler, RequestSetup, TransferOutcome};
use super::signing::RequestSigner;
use crate::config::{LibraryConfig, DEFAULT_SHAREGROUP};
use crate::error::AssetError;
use crate::main_loop::MainLoop;
use crate::utils::{http_date, now_micros};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of transfers running at once (at least 1).
    pub max_active: usize,
    /// Minimum gap between two progress events of one request.
    pub progress_interval: Duration,
    /// Default per-request timeout; a handler may override it in `setup`.
    pub timeout: Option<Duration>,
    pub signer: Option<RequestSigner>,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_active: 4,
            progress_interval: Duration::from_millis(100),
            timeout: None,
            signer: None,
            user_agent: format!("assetlib/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl EngineConfig {
    pub fn from_library(config: &LibraryConfig) -> Self {
        Self {
            max_active: config.max_active_requests.max(1),
            progress_interval: config.progress_interval(),
            timeout: config.request_timeout(),
            signer: config.signing.clone().map(RequestSigner::new),
            ..Self::default()
        }
    }
}

enum EngineCommand {
    Push(Request),
    Shutdown,
}

#[derive(Debug, Default)]
struct EngineStats {
    started: AtomicUsize,
    finished: AtomicUsize,
}

/// Handle for pushing requests to the network worker. Cheap to clone.
#[derive(Clone)]
pub struct HttpEngine {
    tx: mpsc::UnboundedSender<EngineCommand>,
    main: Arc<dyn MainLoop>,
    stats: Arc<EngineStats>,
}

/// Join handle of the network worker thread.
pub struct EngineWorker {
    handle: Option<JoinHandle<()>>,
}

impl EngineWorker {
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("network worker panicked");
            }
        }
    }
}

impl HttpEngine {
    /// Build the runtime and start the network worker.
    pub fn start(
        config: EngineConfig,
        main: Arc<dyn MainLoop>,
    ) -> Result<(Self, EngineWorker), AssetError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| AssetError::Http(format!("failed to build network runtime: {}", e)))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(EngineStats::default());

        let worker_main = Arc::clone(&main);
        let worker_stats = Arc::clone(&stats);
        let handle = thread::Builder::new()
            .name("assetlib-net".into())
            .spawn(move || {
                runtime.block_on(run_engine(config, rx, worker_main, worker_stats));
                tracing::debug!("network worker stopped");
            })?;

        Ok((
            Self { tx, main, stats },
            EngineWorker {
                handle: Some(handle),
            },
        ))
    }

    /// Queue a request. If the worker is gone the request completes with
    /// failure on the main thread and false is returned.
    pub fn push(&self, request: Request) -> bool {
        tracing::debug!(url = %request.url, priority = ?request.priority, "queueing request");
        match self.tx.send(EngineCommand::Push(request)) {
            Ok(()) => true,
            Err(mpsc::error::SendError(command)) => {
                if let EngineCommand::Push(request) = command {
                    tracing::warn!(url = %request.url, "network worker is gone, failing request");
                    fail_request(&self.main, request, "network worker stopped");
                }
                false
            }
        }
    }

    /// Number of transfers that have been started so far.
    pub fn requests_started(&self) -> usize {
        self.stats.started.load(Ordering::SeqCst)
    }

    /// Number of transfers that have finished (either way).
    pub fn requests_finished(&self) -> usize {
        self.stats.finished.load(Ordering::SeqCst)
    }

    /// Stop the worker. Queued requests complete with failure, running
    /// transfers are interrupted.
    pub fn shutdown(&self) {
        let _ = self.tx.send(EngineCommand::Shutdown);
    }
}

struct TransferContext {
    main: Arc<dyn MainLoop>,
    signer: Option<RequestSigner>,
    progress_interval: Duration,
    timeout: Option<Duration>,
}

async fn run_engine(
    config: EngineConfig,
    mut rx: mpsc::UnboundedReceiver<EngineCommand>,
    main: Arc<dyn MainLoop>,
    stats: Arc<EngineStats>,
) {
    let max_active = config.max_active.max(1);
    let ctx = Arc::new(TransferContext {
        main: Arc::clone(&main),
        signer: config.signer.clone(),
        progress_interval: config.progress_interval,
        timeout: config.timeout,
    });
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();
    let mut clients: HashMap<String, reqwest::Client> = HashMap::new();
    let mut queue: BinaryHeap<Queued> = BinaryHeap::new();
    let mut seq = 0u64;
    let mut active = 0usize;

    loop {
        while active < max_active {
            let Some(Queued { request, .. }) = queue.pop() else {
                break;
            };
            let group = request
                .sharegroup
                .clone()
                .unwrap_or_else(|| DEFAULT_SHAREGROUP.to_string());
            let client = match client_for(&mut clients, &group, &config.user_agent) {
                Ok(client) => client,
                Err(e) => {
                    tracing::error!(sharegroup = %group, "failed to build HTTP client: {}", e);
                    fail_request(&main, request, format!("HTTP client unavailable: {}", e));
                    continue;
                }
            };

            active += 1;
            stats.started.fetch_add(1, Ordering::SeqCst);
            let ctx = Arc::clone(&ctx);
            let done = done_tx.clone();
            let cancel = cancel_rx.clone();
            let stats = Arc::clone(&stats);
            tokio::spawn(async move {
                transfer(client, request, &ctx, cancel).await;
                stats.finished.fetch_add(1, Ordering::SeqCst);
                let _ = done.send(());
            });
        }

        tokio::select! {
            command = rx.recv() => match command {
                Some(EngineCommand::Push(request)) => {
                    seq += 1;
                    queue.push(Queued { seq, request });
                }
                Some(EngineCommand::Shutdown) | None => break,
            },
            Some(()) = done_rx.recv() => {
                active = active.saturating_sub(1);
            }
        }
    }

    tracing::info!(queued = queue.len(), active, "network worker shutting down");
    let _ = cancel_tx.send(true);

    rx.close();
    while let Ok(command) = rx.try_recv() {
        if let EngineCommand::Push(request) = command {
            fail_request(&main, request, "network worker stopped");
        }
    }
    for Queued { request, .. } in queue.drain() {
        fail_request(&main, request, "network worker stopped");
    }
    while active > 0 {
        if done_rx.recv().await.is_none() {
            break;
        }
        active -= 1;
    }
}

fn client_for(
    clients: &mut HashMap<String, reqwest::Client>,
    group: &str,
    user_agent: &str,
) -> reqwest::Result<reqwest::Client> {
    if let Some(client) = clients.get(group) {
        return Ok(client.clone());
    }
    // Any 3xx goes to the handler as-is: it means the cached copy stands.
    let client = reqwest::Client::builder()
        .cookie_store(true)
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(user_agent)
        .build()?;
    tracing::debug!(sharegroup = group, "created sharegroup client");
    clients.insert(group.to_string(), client.clone());
    Ok(client)
}

fn fail_request(main: &Arc<dyn MainLoop>, request: Request, reason: impl Into<String>) {
    let handler = request.handler;
    let outcome = TransferOutcome::failed(None, 0, reason);
    main.post(Box::new(move || handler.on_complete(outcome)));
}

async fn transfer(
    client: reqwest::Client,
    request: Request,
    ctx: &TransferContext,
    mut cancel: watch::Receiver<bool>,
) {
    let Request {
        url,
        mut handler,
        progress,
        ..
    } = request;

    let mut setup = RequestSetup::new(url);
    setup.timeout = ctx.timeout;
    let outcome = if handler.setup(&mut setup) {
        run_transfer(&client, &mut *handler, &setup, progress.as_ref(), ctx, &mut cancel).await
    } else {
        TransferOutcome::failed(None, 0, "cancelled during setup")
    };

    match &outcome.error {
        Some(error) => tracing::debug!(url = %setup.url, status = ?outcome.status, "transfer failed: {}", error),
        None => tracing::debug!(url = %setup.url, status = ?outcome.status, received = outcome.received, "transfer finished"),
    }
    ctx.main.post(Box::new(move || handler.on_complete(outcome)));
}

async fn run_transfer(
    client: &reqwest::Client,
    handler: &mut dyn RequestHandler,
    setup: &RequestSetup,
    progress: Option<&ProgressCallback>,
    ctx: &TransferContext,
    cancel: &mut watch::Receiver<bool>,
) -> TransferOutcome {
    let mut builder = client.get(&setup.url);
    if let Some(timeout) = setup.timeout {
        builder = builder.timeout(timeout);
    }
    if setup.resume_offset > 0 {
        builder = builder.header(RANGE, format!("bytes={}-", setup.resume_offset));
    }
    if let Some(since) = setup.if_modified_since {
        builder = builder.header(IF_MODIFIED_SINCE, http_date(since));
    }
    if let Some(etag) = &setup.if_none_match {
        builder = builder.header(IF_NONE_MATCH, quote_etag(etag));
    }
    for (name, value) in &setup.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if setup.sign {
        if let Some(signer) = &ctx.signer {
            for (name, value) in signer.headers(&setup.url, now_micros()) {
                builder = builder.header(name, value);
            }
        }
    }

    let response = tokio::select! {
        response = builder.send() => response,
        _ = cancelled(cancel) => return TransferOutcome::failed(None, 0, "network worker stopped"),
    };
    let response = match response {
        Ok(response) => response,
        Err(e) => return TransferOutcome::failed(None, 0, e.to_string()),
    };

    let status = response.status().as_u16();
    handler.on_status(status);
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            handler.on_header(name.as_str(), value);
        }
    }

    if (300..400).contains(&status) {
        return TransferOutcome::succeeded(status, 0);
    }
    if !(200..300).contains(&status) {
        return TransferOutcome::failed(Some(status), 0, format!("HTTP {}", status));
    }

    let offset = if status == 206 { setup.resume_offset } else { 0 };
    let total = response.content_length().map(|len| len + offset).unwrap_or(0);
    let mut stream = response.bytes_stream();
    let mut received = 0u64;
    let mut last_progress: Option<Instant> = None;

    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = cancelled(cancel) => {
                return TransferOutcome::failed(Some(status), received, "network worker stopped");
            }
        };
        let chunk = match next {
            None => break,
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => return TransferOutcome::failed(Some(status), received, e.to_string()),
        };
        if !handler.on_receive(&chunk) {
            return TransferOutcome::failed(Some(status), received, "aborted by receiver");
        }
        received += chunk.len() as u64;

        if let Some(callback) = progress {
            let due = last_progress.map_or(true, |at| at.elapsed() >= ctx.progress_interval);
            if due {
                last_progress = Some(Instant::now());
                post_progress(&ctx.main, callback, total, offset + received);
            }
        }
    }

    if let Some(callback) = progress {
        let current = offset + received;
        post_progress(&ctx.main, callback, total.max(current), current);
    }
    TransferOutcome::succeeded(status, received)
}

fn post_progress(main: &Arc<dyn MainLoop>, callback: &ProgressCallback, total: u64, current: u64) {
    let callback = Arc::clone(callback);
    main.post(Box::new(move || callback(total, current)));
}

/// Resolves once the engine asks running transfers to stop.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        let stop = *cancel.borrow_and_update();
        if stop || cancel.changed().await.is_err() {
            return;
        }
    }
}

/// `If-None-Match` wants an entity-tag; stored tags are unquoted.
fn quote_etag(etag: &str) -> String {
    let trimmed = etag.trim();
    if trimmed.starts_with('"') || trimmed.starts_with("W/") || trimmed == "*" {
        trimmed.to_string()
    } else {
        format!("\"{}\"", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::BufferHandler;
    use crate::main_loop::MainQueue;
    use std::sync::Mutex;

    #[test]
    fn test_quote_etag() {
        assert_eq!(quote_etag("v1"), "\"v1\"");
        assert_eq!(quote_etag("\"v1\""), "\"v1\"");
        assert_eq!(quote_etag("W/\"v1\""), "W/\"v1\"");
        assert_eq!(quote_etag("*"), "*");
    }

    #[test]
    fn test_config_from_library_clamps_concurrency() {
        let mut library = LibraryConfig::with_root("/tmp/assets");
        library.max_active_requests = 0;
        library.request_timeout_secs = Some(9);
        let config = EngineConfig::from_library(&library);
        assert_eq!(config.max_active, 1);
        assert_eq!(config.timeout, Some(Duration::from_secs(9)));
        assert!(config.signer.is_none());
    }

    #[test]
    fn test_push_after_shutdown_fails_on_main_thread() {
        let queue = MainQueue::new();
        let (engine, worker) = HttpEngine::start(EngineConfig::default(), queue.handle()).unwrap();
        engine.shutdown();
        worker.join();

        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);
        let pushed = engine.push(Request::new(
            "http://127.0.0.1:9/unused",
            BufferHandler::new(move |outcome, _| *sink.lock().unwrap() = Some(outcome.success)),
        ));
        assert!(!pushed);
        assert!(result.lock().unwrap().is_none(), "completion must wait for the main loop");

        queue.drain();
        assert_eq!(*result.lock().unwrap(), Some(false));
        assert_eq!(engine.requests_started(), 0);
    }
}
