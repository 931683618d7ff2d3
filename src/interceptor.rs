use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use futures::FutureExt;
use tracing::Instrument;

use crate::capture::scope::{FallbackStore, ScopeParams};
use crate::capture::{CaptureLayer, CaptureScope, CpuBackend, SinkRegistry, SpanBackend};
use crate::config::{ProfilerConfig, ROUTE_PREFIX};
use crate::correlation;
use crate::id::RequestId;
use crate::mode::Mode;
use crate::policy::{AuthenticatedUser, CallerInfo, DefaultPolicy, ProfilingPolicy};
use crate::record::{Outcome, ProfileRecord};
use crate::store::{MemoryStore, ProfileStore};

/// Everything the interceptor and the query routes share.
///
/// Build one per application with [`Profiler::builder`], wrap it in an
/// `Arc` and hand it to both [`profile_middleware`] and
/// [`server::routes`](crate::server::routes).
pub struct Profiler {
    config: ProfilerConfig,
    policy: Arc<dyn ProfilingPolicy>,
    store: Arc<dyn ProfileStore>,
    backend: Arc<dyn CpuBackend>,
    sinks: SinkRegistry,
}

pub struct ProfilerBuilder {
    config: ProfilerConfig,
    policy: Option<Arc<dyn ProfilingPolicy>>,
    store: Option<Arc<dyn ProfileStore>>,
    backend: Option<Arc<dyn CpuBackend>>,
    sinks: Option<SinkRegistry>,
}

impl ProfilerBuilder {
    /// Replaces the environment/allow-list policy from the config.
    pub fn with_policy(mut self, policy: impl ProfilingPolicy + 'static) -> ProfilerBuilder {
        self.policy = Some(Arc::new(policy));
        self
    }

    /// Defaults to a [`MemoryStore`] sized from the config.
    pub fn with_store(mut self, store: Arc<dyn ProfileStore>) -> ProfilerBuilder {
        self.store = Some(store);
        self
    }

    /// Defaults to [`SpanBackend`].
    pub fn with_backend(mut self, backend: impl CpuBackend + 'static) -> ProfilerBuilder {
        self.backend = Some(Arc::new(backend));
        self
    }

    /// Share a registry with a [`CaptureLayer`] built elsewhere.
    pub fn with_sinks(mut self, sinks: SinkRegistry) -> ProfilerBuilder {
        self.sinks = Some(sinks);
        self
    }

    pub fn build(self) -> Profiler {
        let config = self.config;
        Profiler {
            policy: self
                .policy
                .unwrap_or_else(|| Arc::new(DefaultPolicy::from_config(&config))),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryStore::new(config.max_entries))),
            backend: self
                .backend
                .unwrap_or_else(|| Arc::new(SpanBackend::default())),
            sinks: self.sinks.unwrap_or_default(),
            config,
        }
    }
}

impl Profiler {
    pub fn builder(config: ProfilerConfig) -> ProfilerBuilder {
        ProfilerBuilder {
            config,
            policy: None,
            store: None,
            backend: None,
            sinks: None,
        }
    }

    /// Tracing layer feeding this profiler's captures. Install it on the
    /// global subscriber once.
    pub fn capture_layer(&self) -> CaptureLayer {
        CaptureLayer::new(self.sinks.clone())
    }

    pub fn store(&self) -> &Arc<dyn ProfileStore> {
        &self.store
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// The mode to profile `req` in, or `None` to leave it alone.
    pub fn decide(&self, req: &Request) -> Option<Mode> {
        let path = req.uri().path();
        if is_profiler_route(path) {
            return None;
        }
        let mut caller =
            CallerInfo::from_request(req.headers(), path, &self.config.identity_header);
        if let Some(AuthenticatedUser(user)) = req.extensions().get::<AuthenticatedUser>() {
            caller.identity = Some(user.as_str());
        }
        self.policy
            .should_profile(&caller)
            .then(|| Mode::requested(req.headers(), self.config.default_mode))
    }

    /// Write `record`. Failures are logged and dropped; the response has
    /// already been decided.
    async fn persist(&self, record: ProfileRecord) {
        let id = record.id.clone();
        let timeout = self.config.query_timeout();
        match tokio::time::timeout(timeout, self.store.put(&id, &record, self.config.ttl())).await
        {
            Ok(Ok(())) => tracing::debug!(%id, total_ms = record.total_ms, "profile stored"),
            Ok(Err(err)) => tracing::warn!(%id, ?err, "failed to store profile"),
            Err(_) => tracing::warn!(%id, ?timeout, "timed out storing profile"),
        }
    }
}

fn is_profiler_route(path: &str) -> bool {
    path.strip_prefix(ROUTE_PREFIX)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Axum middleware profiling the requests the policy selects.
///
/// Requests that are not selected pass through untouched. Selected ones run
/// inside a capture scope; the response is annotated with the request's
/// id chain and the record is stored before the response is returned. A
/// panic in the handler is recorded and then resumed.
pub async fn profile_middleware(
    State(profiler): State<Arc<Profiler>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(mode) = profiler.decide(&req) else {
        return next.run(req).await;
    };

    let id = RequestId::generate();
    let chain = correlation::chain_with(
        correlation::extract_chain_ids(req.uri().query()),
        id.clone(),
    );
    let url = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());
    let query_string = req.uri().query().map(str::to_owned);

    let scope = CaptureScope::begin(
        ScopeParams {
            id: id.clone(),
            mode,
            method: req.method().to_string(),
            url,
            max_logs: profiler.config.max_logs,
            duplicate_policy: profiler.config.duplicate_policy,
        },
        &profiler.sinks,
        profiler.backend.as_ref(),
        Some(FallbackStore {
            store: profiler.store.clone(),
            ttl: profiler.config.ttl(),
        }),
    );
    req.extensions_mut().insert(scope.context());

    let span = tracing::info_span!("profiled_request", profile_id = %id, mode = %mode);
    let result = AssertUnwindSafe(next.run(req).instrument(span))
        .catch_unwind()
        .await;

    match result {
        Ok(mut response) => {
            let redirect = correlation::annotate(&mut response, &chain, query_string.as_deref());
            let status = response.status().as_u16();
            let elapsed = scope.elapsed();
            let record = scope.finish(Outcome::Completed { status }, redirect);

            let server_timing = format!("total;dur={:.3}", elapsed.as_secs_f64() * 1000.0);
            if let Ok(val) = HeaderValue::from_str(&server_timing) {
                response.headers_mut().append("server-timing", val);
            }

            profiler.persist(record).await;
            response
        }
        Err(panic) => {
            let record = scope.finish(Outcome::Panicked, None);
            tracing::warn!(%id, "handler panicked; storing partial profile");
            profiler.persist(record).await;
            std::panic::resume_unwind(panic)
        }
    }
}
