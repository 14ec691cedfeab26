// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Main-thread marshaling.
//!
//! Workers never touch consumer-visible state directly. They post closures
//! through a [`MainLoop`] and the thread that owns the library runs them when
//! it pumps the queue (see `AssetLibrary::update`).

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::sync::resilient_lock;

/// A unit of work marshalled to the main thread.
pub type MainTask = Box<dyn FnOnce() + Send + 'static>;

/// Scheduler interface the store and network workers depend on.
pub trait MainLoop: Send + Sync {
    /// Queue `task` to run on the main thread.
    fn post(&self, task: MainTask);
}

/// Deterministic main-thread queue.
///
/// Tasks run only when the owner calls [`MainQueue::drain`] or
/// [`MainQueue::wait`], in the order they were posted.
#[derive(Clone)]
pub struct MainQueue {
    tx: Sender<MainTask>,
    rx: Arc<Mutex<Receiver<MainTask>>>,
}

impl MainQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// A posting handle that can be moved to worker threads.
    pub fn handle(&self) -> Arc<dyn MainLoop> {
        Arc::new(self.clone())
    }

    /// Run every task currently queued. Returns how many ran.
    ///
    /// Tasks posted by the tasks themselves run in the same call.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        loop {
            // Release the receiver before running the task so it may post.
            let next = resilient_lock(&self.rx).try_recv();
            match next {
                Ok(task) => {
                    task();
                    ran += 1;
                }
                Err(_) => return ran,
            }
        }
    }

    /// Queue a closure without boxing it at the call site.
    pub fn post_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(Box::new(task));
    }

    /// Block up to `timeout` for one task, run it, then drain the rest.
    pub fn wait(&self, timeout: Duration) -> usize {
        let first = resilient_lock(&self.rx).recv_timeout(timeout);
        match first {
            Ok(task) => {
                task();
                1 + self.drain()
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }
}

impl Default for MainQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MainLoop for MainQueue {
    fn post(&self, task: MainTask) {
        // The receiver lives as long as any clone of the queue, including this one.
        let _ = self.tx.send(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_tasks_run_in_post_order() {
        let queue = MainQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            queue.post(Box::new(move || log.lock().unwrap().push(i)));
        }
        assert!(log.lock().unwrap().is_empty(), "nothing runs before drain");
        assert_eq!(queue.drain(), 5);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_task_may_post_more_work() {
        let queue = MainQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let inner_queue = queue.clone();
        let inner_count = Arc::clone(&count);
        queue.post(Box::new(move || {
            inner_count.fetch_add(1, Ordering::SeqCst);
            let again = Arc::clone(&inner_count);
            inner_queue.post(Box::new(move || {
                again.fetch_add(1, Ordering::SeqCst);
            }));
        }));
        assert_eq!(queue.drain(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_wait_receives_from_worker_thread() {
        let queue = MainQueue::new();
        let handle = queue.handle();
        let hit = Arc::new(AtomicUsize::new(0));
        let worker_hit = Arc::clone(&hit);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.post(Box::new(move || {
                worker_hit.fetch_add(1, Ordering::SeqCst);
            }));
        });
        assert_eq!(queue.wait(Duration::from_secs(5)), 1);
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_times_out_when_idle() {
        let queue = MainQueue::new();
        assert_eq!(queue.wait(Duration::from_millis(10)), 0);
    }
}
