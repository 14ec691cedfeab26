// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transactional metadata store.
//!
//! One dedicated thread owns the SQLite connection. Everything else talks to
//! it through [`MetadataStore::perform`]: a closure runs on the worker inside
//! a transaction, and an optional callback receives the result back on the
//! main thread.
//!
//! ```text
//! ┌──────────────┐  job   ┌─────────────────┐  result   ┌─────────────┐
//! │ any thread   │───────▶│ store worker    │──────────▶│ main thread │
//! │ perform(f,g) │        │ BEGIN; f(tx);   │  post(g)  │ g(Some/None)│
//! └──────────────┘        │ COMMIT/ROLLBACK │           └─────────────┘
//!                         └─────────────────┘
//! ```

pub mod cleanup;
pub mod reconcile;
pub mod schema;

use std::path::Path;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use rusqlite::{Connection, Transaction};

use crate::error::AssetError;
use crate::main_loop::MainLoop;

pub use cleanup::CleanupReport;
pub use reconcile::AssetRecord;
pub use schema::{AssetRow, AssetUpdate, NewVersion, VersionRow};

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum StoreMessage {
    Job(Job),
    Shutdown,
}

/// Handle for submitting work to the metadata worker. Cheap to clone.
#[derive(Clone)]
pub struct MetadataStore {
    tx: Sender<StoreMessage>,
    main: Arc<dyn MainLoop>,
}

/// Join handle of the metadata worker thread.
pub struct StoreWorker {
    handle: Option<JoinHandle<()>>,
}

impl StoreWorker {
    /// Wait for the worker to finish its queue and exit.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("metadata worker panicked");
            }
        }
    }
}

impl MetadataStore {
    /// Open (or create) the store at `path` and start its worker.
    ///
    /// The connection is opened and migrated on the calling thread so that a
    /// corrupt or unreadable database is reported synchronously.
    pub fn open(path: &Path, main: Arc<dyn MainLoop>) -> Result<(Self, StoreWorker), AssetError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| AssetError::RootDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::init(&conn).map_err(|e| AssetError::Store(format!("{:#}", e)))?;

        let (tx, rx) = mpsc::channel::<StoreMessage>();
        let handle = thread::Builder::new()
            .name("assetlib-store".into())
            .spawn(move || {
                let mut conn = conn;
                while let Ok(message) = rx.recv() {
                    match message {
                        StoreMessage::Job(job) => job(&mut conn),
                        StoreMessage::Shutdown => break,
                    }
                }
                tracing::debug!("metadata worker stopped");
            })?;

        tracing::info!(path = %path.display(), "metadata store opened");
        Ok((Self { tx, main }, StoreWorker { handle: Some(handle) }))
    }

    /// Run `task` inside a transaction on the worker, then hand its result to
    /// `callback` on the main thread.
    ///
    /// A task returning `Err` is rolled back and `callback` receives `None`.
    /// Returns false if the worker has already stopped (the callback is then
    /// dropped without running).
    pub fn perform<T, F, C>(&self, task: F, callback: C) -> bool
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> anyhow::Result<T> + Send + 'static,
        C: FnOnce(Option<T>) + Send + 'static,
    {
        let main = Arc::clone(&self.main);
        self.submit(Box::new(move |conn| {
            let result = run_transaction(conn, task);
            main.post(Box::new(move || callback(result)));
        }))
    }

    /// Run `task` inside a transaction with no main-thread callback.
    pub fn perform_detached<T, F>(&self, task: F) -> bool
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> anyhow::Result<T> + Send + 'static,
    {
        self.submit(Box::new(move |conn| {
            let _ = run_transaction(conn, task);
        }))
    }

    /// Ask the worker to exit once the jobs queued so far have run.
    pub fn shutdown(&self) {
        let _ = self.tx.send(StoreMessage::Shutdown);
    }

    fn submit(&self, job: Job) -> bool {
        if self.tx.send(StoreMessage::Job(job)).is_err() {
            tracing::warn!("metadata worker is gone, dropping transaction");
            return false;
        }
        true
    }
}

fn run_transaction<T, F>(conn: &mut Connection, task: F) -> Option<T>
where
    F: FnOnce(&Transaction<'_>) -> anyhow::Result<T>,
{
    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => {
            tracing::error!("failed to begin metadata transaction: {}", e);
            return None;
        }
    };
    match task(&tx) {
        Ok(value) => match tx.commit() {
            Ok(()) => Some(value),
            Err(e) => {
                tracing::error!("failed to commit metadata transaction: {}", e);
                None
            }
        },
        Err(e) => {
            // Dropping the transaction rolls it back
            tracing::warn!("metadata transaction rolled back: {:#}", e);
            None
        }
    }
}
