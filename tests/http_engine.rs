// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use assetlib::http::{
    BufferHandler, EngineConfig, HttpEngine, Request, RequestPriority, TransferOutcome,
};
use assetlib::MainQueue;
use common::{Entity, Origin};

const JAN_1: &str = "Mon, 01 Jan 2024 00:00:00 GMT";

fn pump_until<F: FnMut() -> bool>(queue: &MainQueue, mut done: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        queue.wait(Duration::from_millis(10));
        if done() {
            return true;
        }
    }
    false
}

type Results = Arc<Mutex<Vec<(String, TransferOutcome, Vec<u8>)>>>;

fn collect(results: &Results, label: &str) -> BufferHandler<impl FnOnce(TransferOutcome, Vec<u8>) + Send + 'static> {
    let sink = Arc::clone(results);
    let label = label.to_string();
    BufferHandler::new(move |outcome, body| sink.lock().unwrap().push((label, outcome, body)))
}

#[test]
fn test_buffered_get_with_progress() {
    let origin = Origin::start();
    origin.set_entity(Entity::new(&[7; 4096], "b1", JAN_1));
    let queue = MainQueue::new();
    let (engine, worker) = HttpEngine::start(EngineConfig::default(), queue.handle()).unwrap();

    let results: Results = Arc::default();
    let last_progress = Arc::new(AtomicU64::new(0));
    let progress = Arc::clone(&last_progress);
    assert!(engine.push(
        Request::new(origin.url("blob.bin"), collect(&results, "blob"))
            .on_progress(Arc::new(move |_total, current| progress.store(current, Ordering::SeqCst))),
    ));

    assert!(pump_until(&queue, || results.lock().unwrap().len() == 1));
    let (_, outcome, body) = results.lock().unwrap().remove(0);
    assert!(outcome.success);
    assert_eq!(outcome.status, Some(200));
    assert_eq!(outcome.received, 4096);
    assert_eq!(body.len(), 4096);
    assert_eq!(last_progress.load(Ordering::SeqCst), 4096);
    assert!(pump_until(&queue, || engine.requests_finished() == 1));

    engine.shutdown();
    worker.join();
}

#[test]
fn test_error_status_fails_request() {
    let origin = Origin::start();
    let queue = MainQueue::new();
    let (engine, worker) = HttpEngine::start(EngineConfig::default(), queue.handle()).unwrap();

    let results: Results = Arc::default();
    engine.push(Request::new(origin.url("nothing.bin"), collect(&results, "missing")));
    assert!(pump_until(&queue, || results.lock().unwrap().len() == 1));
    let (_, outcome, _) = results.lock().unwrap().remove(0);
    assert!(!outcome.success);
    assert_eq!(outcome.status, Some(404));
    assert!(outcome.error.is_some());

    engine.shutdown();
    worker.join();
}

#[test]
fn test_queued_requests_start_by_priority() {
    let origin = Origin::start();
    origin.set_entity(Entity::new(b"x", "p", JAN_1));
    origin.set_stall(Duration::from_millis(300));
    let queue = MainQueue::new();
    let config = EngineConfig {
        max_active: 1,
        ..EngineConfig::default()
    };
    let (engine, worker) = HttpEngine::start(config, queue.handle()).unwrap();

    let results: Results = Arc::default();
    // Occupies the only slot while the others queue up
    engine.push(Request::new(origin.url("slow/first"), collect(&results, "first")));
    engine.push(
        Request::new(origin.url("low"), collect(&results, "low")).with_priority(RequestPriority::Low),
    );
    engine.push(Request::new(origin.url("normal"), collect(&results, "normal")));
    engine.push(
        Request::new(origin.url("high"), collect(&results, "high")).with_priority(RequestPriority::High),
    );

    assert!(pump_until(&queue, || results.lock().unwrap().len() == 4));
    assert_eq!(origin.served(), vec!["slow/first", "high", "normal", "low"]);
    let order: Vec<String> = results.lock().unwrap().iter().map(|(l, _, _)| l.clone()).collect();
    assert_eq!(order, vec!["first", "high", "normal", "low"]);

    engine.shutdown();
    worker.join();
}

#[test]
fn test_shutdown_fails_queued_requests() {
    let origin = Origin::start();
    origin.set_entity(Entity::new(b"x", "s", JAN_1));
    origin.set_stall(Duration::from_secs(5));
    let queue = MainQueue::new();
    let config = EngineConfig {
        max_active: 1,
        ..EngineConfig::default()
    };
    let (engine, worker) = HttpEngine::start(config, queue.handle()).unwrap();

    let results: Results = Arc::default();
    engine.push(Request::new(origin.url("slow/running"), collect(&results, "running")));
    engine.push(Request::new(origin.url("queued"), collect(&results, "queued")));
    assert!(pump_until(&queue, || engine.requests_started() == 1));

    engine.shutdown();
    worker.join();
    queue.drain();

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, outcome, _)| !outcome.success));
}
