pub mod adapters;
pub mod layer;
pub mod scope;
pub mod sink;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::id::RequestId;
use crate::record::RpcCall;

pub use adapters::{CpuBackend, SpanBackend};
pub use layer::CaptureLayer;
pub use scope::CaptureScope;
pub use sink::{ScopeSink, SinkRegistry};

// ─── Duplicate detection ─────────────────────────────────────────

/// What makes two RPCs in one request "the same call".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Same category and same normalized parameters.
    #[default]
    CategoryAndParams,
    /// Same category, whatever the parameters.
    CategoryOnly,
}

impl DuplicatePolicy {
    /// Identity of a call. Without explicit parameters the call label
    /// stands in for them.
    fn key(self, category: &str, call: &str, params: Option<&str>) -> (String, u64) {
        match self {
            DuplicatePolicy::CategoryOnly => (category.to_owned(), 0),
            DuplicatePolicy::CategoryAndParams => {
                let mut hasher = DefaultHasher::new();
                for word in params.unwrap_or(call).split_whitespace() {
                    word.hash(&mut hasher);
                }
                (category.to_owned(), hasher.finish())
            }
        }
    }
}

// ─── RPC recording ───────────────────────────────────────────────

/// Raw timing of one RPC, as reported by the RPC layer.
#[derive(Debug, Clone)]
pub struct RpcEvent {
    pub category: String,
    pub call: String,
    /// Parameters identifying the call, used for duplicate detection.
    pub params: Option<String>,
    /// Since the request started.
    pub start_offset: Duration,
    pub duration: Duration,
    /// Outermost frame first.
    pub stack: Option<Vec<String>>,
}

/// Calls arrive in completion order; duplicates are decided in start order
/// once the request is done.
#[derive(Debug)]
struct RpcRecorder {
    policy: DuplicatePolicy,
    events: Vec<RpcEvent>,
}

impl RpcRecorder {
    fn new(policy: DuplicatePolicy) -> Self {
        Self {
            policy,
            events: Vec::new(),
        }
    }

    fn record(&mut self, event: RpcEvent) {
        self.events.push(event);
    }

    fn take_calls(&mut self) -> Vec<RpcCall> {
        let mut events = std::mem::take(&mut self.events);
        events.sort_by_key(|e| e.start_offset);
        let mut seen = HashSet::new();
        events
            .into_iter()
            .map(|event| {
                let key = self
                    .policy
                    .key(&event.category, &event.call, event.params.as_deref());
                RpcCall {
                    duplicate: !seen.insert(key),
                    category: event.category,
                    call: event.call,
                    start_offset_ms: event.start_offset.as_secs_f64() * 1000.0,
                    duration_ms: event.duration.as_secs_f64() * 1000.0,
                    stack: event.stack,
                }
            })
            .collect()
    }
}

// ─── Request-scoped context ──────────────────────────────────────

/// Handle a handler uses to report into the profile of its own request.
///
/// Inserted into the request extensions by the interceptor and extractable
/// in any handler. On requests that are not profiled the extractor yields
/// an inert context and every method is a no-op.
#[derive(Debug, Clone, Default)]
pub struct ProfileContext {
    inner: Option<Arc<ContextInner>>,
}

#[derive(Debug)]
struct ContextInner {
    sink: Arc<ScopeSink>,
    rpc: Option<Mutex<RpcRecorder>>,
}

impl ProfileContext {
    pub(crate) fn new(sink: Arc<ScopeSink>, rpc: Option<DuplicatePolicy>) -> Self {
        Self {
            inner: Some(Arc::new(ContextInner {
                sink,
                rpc: rpc.map(|policy| Mutex::new(RpcRecorder::new(policy))),
            })),
        }
    }

    /// Context of a request that is not being profiled.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_profiling(&self) -> bool {
        self.inner.is_some()
    }

    pub fn id(&self) -> Option<&RequestId> {
        self.inner.as_ref().map(|inner| inner.sink.id())
    }

    /// Time since the profiled request started.
    pub fn elapsed(&self) -> Option<Duration> {
        self.inner.as_ref().map(|inner| inner.sink.offset())
    }

    pub fn record_rpc(&self, event: RpcEvent) {
        if let Some(rpc) = self.inner.as_ref().and_then(|inner| inner.rpc.as_ref()) {
            rpc.lock().record(event);
        }
    }

    /// Await `fut`, recording it as one RPC.
    pub async fn time_rpc<F: Future>(
        &self,
        category: &str,
        call: impl Into<String>,
        params: Option<&str>,
        fut: F,
    ) -> F::Output {
        let Some(inner) = self.inner.as_ref().filter(|inner| inner.rpc.is_some()) else {
            return fut.await;
        };
        let start_offset = inner.sink.offset();
        let stack = inner.sink.stack_snapshot();
        let output = fut.await;
        let duration = inner.sink.offset().saturating_sub(start_offset);
        self.record_rpc(RpcEvent {
            category: category.to_owned(),
            call: call.into(),
            params: params.map(str::to_owned),
            start_offset,
            duration,
            stack: (!stack.is_empty()).then(|| stack.into_iter().map(str::to_owned).collect()),
        });
        output
    }

    pub(crate) fn take_rpc_calls(&self) -> Vec<RpcCall> {
        self.inner
            .as_ref()
            .and_then(|inner| inner.rpc.as_ref())
            .map(|rpc| rpc.lock().take_calls())
            .unwrap_or_default()
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ProfileContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<ProfileContext>()
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(policy: DuplicatePolicy) -> ProfileContext {
        let sink = Arc::new(ScopeSink::new(RequestId::generate(), true, 10));
        ProfileContext::new(sink, Some(policy))
    }

    fn event(category: &str, params: &str) -> RpcEvent {
        RpcEvent {
            category: category.into(),
            call: format!("{category} {params}"),
            params: Some(params.into()),
            start_offset: Duration::ZERO,
            duration: Duration::from_millis(1),
            stack: None,
        }
    }

    fn started_at(ms: u64, params: &str) -> RpcEvent {
        RpcEvent {
            start_offset: Duration::from_millis(ms),
            ..event("redis", params)
        }
    }

    fn flags(ctx: &ProfileContext) -> Vec<(f64, bool)> {
        ctx.take_rpc_calls()
            .iter()
            .map(|c| (c.start_offset_ms, c.duplicate))
            .collect()
    }

    #[test]
    fn repeated_calls_are_flagged_from_the_second_on() {
        let ctx = context(DuplicatePolicy::CategoryAndParams);
        ctx.record_rpc(event("redis", "GET a"));
        ctx.record_rpc(event("redis", "GET  a "));
        ctx.record_rpc(event("redis", "GET b"));
        ctx.record_rpc(event("redis", "GET a"));
        let flags: Vec<bool> = ctx.take_rpc_calls().iter().map(|c| c.duplicate).collect();
        assert_eq!(flags, vec![false, true, false, true]);
    }

    #[test]
    fn first_started_call_is_the_original_when_calls_finish_out_of_order() {
        let ctx = context(DuplicatePolicy::CategoryAndParams);
        ctx.record_rpc(started_at(5, "GET k"));
        ctx.record_rpc(started_at(1, "GET k"));
        ctx.record_rpc(started_at(3, "GET other"));
        assert_eq!(flags(&ctx), vec![(1.0, false), (3.0, false), (5.0, true)]);
    }

    #[test]
    fn calls_without_params_are_told_apart_by_label() {
        let ctx = context(DuplicatePolicy::CategoryAndParams);
        for (ms, label) in [(1, "HGETALL note:1"), (2, "HGETALL note:2"), (3, "HGETALL  note:1")] {
            ctx.record_rpc(RpcEvent {
                call: label.into(),
                params: None,
                ..started_at(ms, "")
            });
        }
        assert_eq!(flags(&ctx), vec![(1.0, false), (2.0, false), (3.0, true)]);
    }

    #[test]
    fn category_only_policy_ignores_params() {
        let ctx = context(DuplicatePolicy::CategoryOnly);
        ctx.record_rpc(event("redis", "GET a"));
        ctx.record_rpc(event("redis", "GET b"));
        ctx.record_rpc(event("http", "GET b"));
        let flags: Vec<bool> = ctx.take_rpc_calls().iter().map(|c| c.duplicate).collect();
        assert_eq!(flags, vec![false, true, false]);
    }

    #[test]
    fn same_params_in_other_category_is_not_a_duplicate() {
        let ctx = context(DuplicatePolicy::CategoryAndParams);
        ctx.record_rpc(event("redis", "k"));
        ctx.record_rpc(event("memcache", "k"));
        assert!(ctx.take_rpc_calls().iter().all(|c| !c.duplicate));
    }

    #[tokio::test]
    async fn time_rpc_records_call_with_stack() {
        let sink = Arc::new(ScopeSink::new(RequestId::generate(), true, 10));
        sink.enter("handler");
        let ctx = ProfileContext::new(sink, Some(DuplicatePolicy::default()));
        let value = ctx
            .time_rpc("redis", "GET k", Some("GET k"), async { 7 })
            .await;
        assert_eq!(value, 7);
        let calls = ctx.take_rpc_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call, "GET k");
        assert_eq!(calls[0].stack.as_deref(), Some(&["handler".to_string()][..]));
    }

    #[tokio::test]
    async fn disabled_context_is_inert() {
        let ctx = ProfileContext::disabled();
        assert!(!ctx.is_profiling());
        assert_eq!(ctx.time_rpc("redis", "GET k", None, async { 1 }).await, 1);
        ctx.record_rpc(event("redis", "x"));
        assert!(ctx.take_rpc_calls().is_empty());
    }

    #[tokio::test]
    async fn rpc_disabled_mode_drops_calls() {
        let sink = Arc::new(ScopeSink::new(RequestId::generate(), true, 10));
        let ctx = ProfileContext::new(sink, None);
        assert!(ctx.is_profiling());
        ctx.time_rpc("redis", "GET k", None, async {}).await;
        assert!(ctx.take_rpc_calls().is_empty());
    }
}
