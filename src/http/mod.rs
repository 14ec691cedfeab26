// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download engine.
//!
//! Multiplexed HTTP GET with per-request header/body callbacks, throttled
//! progress, resume offsets, conditional revalidation and optional request
//! signing. Requests sharing a sharegroup share one client (cookie jar and
//! connection pool).

mod engine;
mod request;
pub mod signing;

pub use engine::{EngineConfig, EngineWorker, HttpEngine};
pub use request::{
    BufferHandler, ProgressCallback, Request, RequestHandler, RequestPriority, RequestSetup,
    TransferOutcome,
};
pub use signing::RequestSigner;
