// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Request types for the download engine.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Priority level for requests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RequestPriority {
    /// Background refreshes
    Low = 0,
    #[default]
    Normal = 1,
    /// Served first
    High = 2,
}

/// Per-request configuration, filled in by [`RequestHandler::setup`] on the
/// network worker right before the transfer starts.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSetup {
    pub url: String,
    /// Extra request headers
    pub headers: Vec<(String, String)>,
    /// Byte offset to resume from; `0` requests the whole entity.
    pub resume_offset: u64,
    /// Sent as `If-Modified-Since` (microseconds since the epoch).
    pub if_modified_since: Option<i64>,
    /// Sent as `If-None-Match`; quoted if the value is not already.
    pub if_none_match: Option<String>,
    /// Attach signing headers when the engine has a signing key.
    pub sign: bool,
    pub timeout: Option<Duration>,
}

impl RequestSetup {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            resume_offset: 0,
            if_modified_since: None,
            if_none_match: None,
            sign: true,
            timeout: None,
        }
    }
}

/// How a transfer ended. Delivered to [`RequestHandler::on_complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub success: bool,
    /// Final HTTP status, if a response arrived.
    pub status: Option<u16>,
    /// Body bytes delivered to the handler.
    pub received: u64,
    pub error: Option<String>,
}

impl TransferOutcome {
    pub fn failed(status: Option<u16>, received: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            status,
            received,
            error: Some(error.into()),
        }
    }

    pub fn succeeded(status: u16, received: u64) -> Self {
        Self {
            success: true,
            status: Some(status),
            received,
            error: None,
        }
    }

    /// A 3xx response: the cached copy is still valid, no body was read.
    pub fn is_not_modified(&self) -> bool {
        self.success && matches!(self.status, Some(300..=399))
    }
}

/// Callbacks driving one request.
///
/// `setup`, `on_status`, `on_header` and `on_receive` run on the network
/// worker; `on_complete` runs on the main thread.
pub trait RequestHandler: Send + 'static {
    /// Configure the request. Returning false cancels it before any I/O.
    fn setup(&mut self, _setup: &mut RequestSetup) -> bool {
        true
    }

    fn on_status(&mut self, _status: u16) {}

    /// Called once per response header. Names are lowercase.
    fn on_header(&mut self, _name: &str, _value: &str) {}

    /// Consume one body chunk. Returning false aborts the transfer.
    fn on_receive(&mut self, chunk: &[u8]) -> bool;

    fn on_complete(self: Box<Self>, outcome: TransferOutcome);
}

/// Progress sink, called on the main thread with `(total, current)` bytes.
/// `total` is 0 when the server did not announce a length.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// A unit of work for the engine.
pub struct Request {
    pub url: String,
    pub priority: RequestPriority,
    /// Sharegroup whose client (cookies, TLS sessions) this request uses.
    pub sharegroup: Option<String>,
    pub(crate) handler: Box<dyn RequestHandler>,
    pub(crate) progress: Option<ProgressCallback>,
}

impl Request {
    pub fn new(url: impl Into<String>, handler: impl RequestHandler) -> Self {
        Self {
            url: url.into(),
            priority: RequestPriority::default(),
            sharegroup: None,
            handler: Box::new(handler),
            progress: None,
        }
    }

    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_sharegroup(mut self, sharegroup: impl Into<String>) -> Self {
        self.sharegroup = Some(sharegroup.into());
        self
    }

    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("url", &self.url)
            .field("priority", &self.priority)
            .field("sharegroup", &self.sharegroup)
            .finish_non_exhaustive()
    }
}

/// Queue entry: highest priority first, FIFO within a priority.
pub(crate) struct Queued {
    pub seq: u64,
    pub request: Request,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.request
            .priority
            .cmp(&other.request.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Handler that collects the body in memory and hands it to a main-thread
/// callback.
pub struct BufferHandler<F>
where
    F: FnOnce(TransferOutcome, Vec<u8>) + Send + 'static,
{
    buffer: Vec<u8>,
    headers: Vec<(String, String)>,
    callback: F,
}

impl<F> BufferHandler<F>
where
    F: FnOnce(TransferOutcome, Vec<u8>) + Send + 'static,
{
    pub fn new(callback: F) -> Self {
        Self {
            buffer: Vec::new(),
            headers: Vec::new(),
            callback,
        }
    }

    /// Send these headers with the request.
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }
}

impl<F> RequestHandler for BufferHandler<F>
where
    F: FnOnce(TransferOutcome, Vec<u8>) + Send + 'static,
{
    fn setup(&mut self, setup: &mut RequestSetup) -> bool {
        setup.headers.append(&mut self.headers);
        true
    }

    fn on_receive(&mut self, chunk: &[u8]) -> bool {
        self.buffer.extend_from_slice(chunk);
        true
    }

    fn on_complete(self: Box<Self>, outcome: TransferOutcome) {
        let this = *self;
        (this.callback)(outcome, this.buffer);
    }
}
