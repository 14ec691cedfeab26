// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scripted HTTP origin shared by the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Response, StatusCode};
use axum::routing::get;
use axum::Router;
use tokio::runtime::Runtime;

/// The entity the origin currently serves.
#[derive(Debug, Clone)]
pub struct Entity {
    pub body: Vec<u8>,
    pub etag: String,
    pub last_modified: String,
}

impl Entity {
    pub fn new(body: &[u8], etag: &str, last_modified: &str) -> Self {
        Self {
            body: body.to_vec(),
            etag: etag.to_string(),
            last_modified: last_modified.to_string(),
        }
    }
}

#[derive(Default)]
pub struct OriginState {
    pub entity: Option<Entity>,
    pub requests: usize,
    pub last_headers: HeaderMap,
    pub served: Vec<String>,
    /// Delay before answering paths under `slow/`
    pub stall: Duration,
    /// When set, every request is answered with a 302 to this path
    pub redirect: Option<String>,
}

type Shared = Arc<Mutex<OriginState>>;

/// Origin on a private tokio runtime; dropped with the test.
pub struct Origin {
    state: Shared,
    base: String,
    _runtime: Runtime,
}

impl Origin {
    pub fn start() -> Self {
        let runtime = Runtime::new().expect("origin runtime");
        let state: Shared = Arc::new(Mutex::new(OriginState::default()));

        let app = Router::new()
            .route("/*path", get(serve))
            .with_state(Arc::clone(&state));

        let listener = runtime
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .expect("bind origin");
        let addr = listener.local_addr().expect("origin address");
        runtime.spawn(async move {
            axum::serve(listener, app).await.expect("origin server");
        });

        Self {
            state,
            base: format!("http://{}", addr),
            _runtime: runtime,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    pub fn set_entity(&self, entity: Entity) {
        self.state.lock().unwrap().entity = Some(entity);
    }

    pub fn set_stall(&self, stall: Duration) {
        self.state.lock().unwrap().stall = stall;
    }

    pub fn set_redirect(&self, target: Option<&str>) {
        self.state.lock().unwrap().redirect = target.map(str::to_string);
    }

    pub fn requests(&self) -> usize {
        self.state.lock().unwrap().requests
    }

    /// Request paths in the order they were answered.
    pub fn served(&self) -> Vec<String> {
        self.state.lock().unwrap().served.clone()
    }

    pub fn last_header(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .last_headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

async fn serve(
    State(state): State<Shared>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response<Body> {
    if path.starts_with("slow/") {
        let stall = state.lock().unwrap().stall;
        tokio::time::sleep(stall).await;
    }
    let mut state = state.lock().unwrap();
    state.requests += 1;
    state.last_headers = headers.clone();
    state.served.push(path);

    if let Some(target) = state.redirect.clone() {
        return Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, format!("/{}", target.trim_start_matches('/')))
            .body(Body::empty())
            .unwrap();
    }

    let Some(entity) = state.entity.clone() else {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap();
    };
    let quoted = format!("\"{}\"", entity.etag);

    let header_value = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let not_modified = match header_value(header::IF_NONE_MATCH) {
        Some(tag) => tag == quoted,
        None => header_value(header::IF_MODIFIED_SINCE).is_some_and(|since| since == entity.last_modified),
    };
    let builder = Response::builder()
        .header(header::ETAG, &quoted)
        .header(header::LAST_MODIFIED, &entity.last_modified)
        .header(header::CONTENT_TYPE, "application/octet-stream");
    if not_modified {
        return builder
            .status(StatusCode::NOT_MODIFIED)
            .body(Body::empty())
            .unwrap();
    }

    let range_start = header_value(header::RANGE)
        .and_then(|r| r.strip_prefix("bytes=").map(str::to_string))
        .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok())
        .filter(|start| *start < entity.body.len());
    match range_start {
        Some(start) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, entity.body.len() - 1, entity.body.len()),
            )
            .body(Body::from(entity.body[start..].to_vec()))
            .unwrap(),
        None => builder
            .status(StatusCode::OK)
            .body(Body::from(entity.body))
            .unwrap(),
    }
}
