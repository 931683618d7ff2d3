#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::extract::{Path, Request};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tower::ServiceExt;

use mini_profiler::config::Environment;
use mini_profiler::{
    server, MemoryStore, ProfileContext, ProfileRecord, ProfileStore, Profiler, ProfilerConfig,
    RequestId, StoreError,
};

/// Memory store that counts how often it is used.
pub struct CountingStore {
    inner: MemoryStore,
    written: Mutex<Vec<RequestId>>,
    pub puts: AtomicUsize,
    pub gets: AtomicUsize,
}

impl CountingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(1_000),
            written: Mutex::new(Vec::new()),
            puts: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
        })
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Every live record written so far, in write order.
    pub async fn written(&self) -> Vec<ProfileRecord> {
        let ids = self.written.lock().clone();
        self.inner
            .get(&ids)
            .await
            .unwrap()
            .into_iter()
            .flatten()
            .collect()
    }
}

#[async_trait]
impl ProfileStore for CountingStore {
    async fn put(
        &self,
        id: &RequestId,
        record: &ProfileRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.written.lock().push(id.clone());
        self.inner.put(id, record, ttl).await
    }

    async fn get(&self, ids: &[RequestId]) -> Result<Vec<Option<ProfileRecord>>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(ids).await
    }
}

/// Store whose writes fail, either at once or by never answering.
pub struct BrokenStore {
    pub hang: bool,
    pub puts: AtomicUsize,
}

impl BrokenStore {
    pub fn new(hang: bool) -> Arc<Self> {
        Arc::new(Self {
            hang,
            puts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ProfileStore for BrokenStore {
    async fn put(&self, _: &RequestId, _: &ProfileRecord, _: Duration) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        Err(StoreError::Backend(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        ))))
    }

    async fn get(&self, ids: &[RequestId]) -> Result<Vec<Option<ProfileRecord>>, StoreError> {
        Ok(vec![None; ids.len()])
    }
}

pub fn dev_config() -> ProfilerConfig {
    ProfilerConfig {
        environment: Environment::Development,
        ..ProfilerConfig::default()
    }
}

pub fn profiler(config: ProfilerConfig, store: Arc<CountingStore>) -> Arc<Profiler> {
    profiler_with(config, store)
}

pub fn profiler_with(config: ProfilerConfig, store: Arc<dyn ProfileStore>) -> Arc<Profiler> {
    Arc::new(Profiler::builder(config).with_store(store).build())
}

// ─── Application under test ──────────────────────────────────────

async fn hop(Path(n): Path<u32>) -> Response {
    if n == 0 {
        return "landed".into_response();
    }
    (
        StatusCode::FOUND,
        [(header::LOCATION, format!("/hop/{}", n - 1))],
    )
        .into_response()
}

async fn twice(profile: ProfileContext) -> &'static str {
    for _ in 0..2 {
        profile
            .time_rpc("redis", "GET k", Some("GET k"), async {
                tokio::task::yield_now().await;
            })
            .await;
    }
    profile
        .time_rpc("redis", "GET other", Some("GET other"), async {})
        .await;
    "ok"
}

#[tracing::instrument]
async fn render_page() -> &'static str {
    tracing::info!("rendering page");
    "page"
}

async fn logged(profile: ProfileContext) -> &'static str {
    tracing::info!(user = "ada", "loading note");
    tracing::debug!("cache miss\nfetching from redis");
    profile.time_rpc("redis", "HGETALL note:1", None, async {}).await;
    render_page().await
}

async fn boom() -> &'static str {
    panic!("handler exploded");
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(60)).await;
    "late"
}

async fn failing() -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

pub fn app_routes() -> Router {
    Router::new()
        .route("/hop/:n", get(hop))
        .route("/twice", get(twice))
        .route("/logged", get(logged))
        .route("/boom", get(boom))
        .route("/failing", get(failing))
        .route("/slow", get(slow))
}

pub fn app(profiler: Arc<Profiler>) -> Router {
    server::install(app_routes(), profiler)
}

// ─── Client helpers ──────────────────────────────────────────────

pub async fn send(app: &Router, uri: &str) -> Response {
    send_with(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

pub async fn send_with(app: &Router, req: Request) -> Response {
    app.clone().oneshot(req).await.unwrap()
}

pub fn location(response: &Response) -> String {
    response.headers()[header::LOCATION]
        .to_str()
        .unwrap()
        .to_owned()
}

pub fn chain_header(response: &Response) -> String {
    response.headers()["x-miniprofiler-ids"]
        .to_str()
        .unwrap()
        .to_owned()
}

pub async fn text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn json(response: Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Follow redirects from `uri` like a browser, returning every response.
pub async fn follow(app: &Router, uri: &str) -> Vec<Response> {
    let mut responses = Vec::new();
    let mut next = uri.to_owned();
    loop {
        let response = send(app, &next).await;
        let redirected = response.status().is_redirection();
        if redirected {
            next = location(&response);
        }
        responses.push(response);
        if !redirected {
            return responses;
        }
    }
}

/// Records for a comma separated chain, via the query route.
pub async fn fetch(app: &Router, chain: &str) -> serde_json::Value {
    let response = send(app, &format!("/mini_profiler/request?request_ids={chain}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    json(response).await
}
