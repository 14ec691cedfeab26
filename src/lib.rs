// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! assetlib - versioned, TTL-governed blob cache for remote files
//!
//! Consumers ask the [`AssetLibrary`] for a URL and get back a shared
//! [`Asset`]. The asset tracks the file versions it has on disk, downloads
//! new ones (resuming partial transfers and revalidating with conditional
//! requests), and hands out [`AssetLock`]s that keep a version's file alive
//! while it is being read.
//!
//! **Consumer** -> **Library** -> **Metadata store / HTTP engine**
//!
//! # Core Modules
//!
//! - [`library`] - Acquisition, request coalescing, TTL cleanup
//! - [`asset`] - Per-URL versions, downloads, locks, update notifications
//! - [`store`] - SQLite metadata store on its own worker thread
//! - [`http`] - Prioritised HTTP transfers with resume and signing
//! - [`main_loop`] - Marshaling worker results onto the consumer's thread
//! - [`config`] - JSON configuration
//! - [`error`] - Error type shared by the crate

pub mod asset;
pub mod config;
pub mod error;
pub mod http;
pub mod library;
pub mod main_loop;
pub mod paths;
pub mod store;
pub mod sync;
pub mod utils;

pub use asset::{Asset, AssetLock, SubscriptionId, UpdateCallback, UpdateFlags, VersionSnapshot};
pub use config::{LibraryConfig, SigningConfig, DEFAULT_SHAREGROUP};
pub use error::{AssetError, Result};
pub use http::{RequestPriority, RequestSigner};
pub use library::{
    canonical_url, AcquireCallback, AssetLibrary, AssetRequest, BatchCallback, Retained,
};
pub use main_loop::{MainLoop, MainQueue, MainTask};
pub use store::CleanupReport;
pub use utils::mask_sensitive;
