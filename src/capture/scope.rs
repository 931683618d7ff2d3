use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::id::RequestId;
use crate::mode::{CpuMode, Mode};
use crate::record::{CpuProfile, Outcome, ProfileRecord, RpcProfile};
use crate::store::ProfileStore;

use super::adapters::{CallTracer, CallTracerAdapter, CpuBackend, SamplerAdapter, StackSampler};
use super::sink::{Registration, ScopeSink, SinkRegistry};
use super::{DuplicatePolicy, ProfileContext};

/// What a scope needs to know about the request it wraps.
#[derive(Debug, Clone)]
pub struct ScopeParams {
    pub id: RequestId,
    pub mode: Mode,
    pub method: String,
    pub url: String,
    pub max_logs: usize,
    pub duplicate_policy: DuplicatePolicy,
}

/// Where a scope that is dropped unfinished writes its partial record.
pub struct FallbackStore {
    pub store: Arc<dyn ProfileStore>,
    pub ttl: Duration,
}

/// Owns every capture resource of one profiled request.
///
/// Opening the scope registers the request's log sink and starts the CPU
/// profiler its mode asks for. [`finish`](Self::finish) stops them and
/// assembles the record. If the scope is dropped without finishing (the
/// request future was cancelled) the resources are still released and a
/// partial record is written to the fallback store in the background.
pub struct CaptureScope {
    params: ScopeParams,
    started_at: DateTime<Utc>,
    started: Instant,
    context: ProfileContext,
    sink: Arc<ScopeSink>,
    sampler: Option<Box<dyn StackSampler>>,
    tracer: Option<Box<dyn CallTracer>>,
    errors: Vec<String>,
    fallback: Option<FallbackStore>,
    _registration: Registration,
}

impl CaptureScope {
    pub fn begin(
        params: ScopeParams,
        sinks: &SinkRegistry,
        backend: &dyn CpuBackend,
        fallback: Option<FallbackStore>,
    ) -> Self {
        let mode = params.mode;
        let sink = Arc::new(ScopeSink::new(
            params.id.clone(),
            mode.logs_enabled(),
            params.max_logs,
        ));
        let registration = sinks.register(sink.clone());
        let context = ProfileContext::new(
            sink.clone(),
            mode.rpc_enabled().then_some(params.duplicate_policy),
        );

        let mut errors = Vec::new();
        let mut sampler = None;
        let mut tracer = None;
        match mode.cpu() {
            Some(CpuMode::Sampling) => match backend.sampler(&sink) {
                Ok(s) => sampler = Some(s),
                Err(err) => errors.push(err.to_string()),
            },
            Some(CpuMode::Instrumented) => match backend.tracer(&sink) {
                Ok(t) => tracer = Some(t),
                Err(err) => errors.push(err.to_string()),
            },
            None => {}
        }

        Self {
            params,
            started_at: Utc::now(),
            started: Instant::now(),
            context,
            sink,
            sampler,
            tracer,
            errors,
            fallback,
            _registration: registration,
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.params.id
    }

    /// The handle handlers report RPCs through.
    pub fn context(&self) -> ProfileContext {
        self.context.clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Stop capturing and assemble the record.
    pub fn finish(mut self, outcome: Outcome, redirect: Option<String>) -> ProfileRecord {
        self.fallback = None;
        self.build(outcome, redirect)
    }

    fn build(&mut self, outcome: Outcome, redirect: Option<String>) -> ProfileRecord {
        let total = self.started.elapsed();

        let cpu = if let Some(sampler) = self.sampler.take() {
            match sampler.stop() {
                Ok(samples) => CpuProfile::Sampled(SamplerAdapter::histogram(samples)),
                Err(err) => {
                    self.errors.push(err.to_string());
                    CpuProfile::None
                }
            }
        } else if let Some(tracer) = self.tracer.take() {
            match tracer.stop() {
                Ok(events) => {
                    CpuProfile::Instrumented(CallTracerAdapter::call_graph(events, self.sink.offset()))
                }
                Err(err) => {
                    self.errors.push(err.to_string());
                    CpuProfile::None
                }
            }
        } else {
            CpuProfile::None
        };

        let (logs, dropped_logs) = self.sink.take_logs();

        ProfileRecord {
            id: self.params.id.clone(),
            method: self.params.method.clone(),
            url: self.params.url.clone(),
            mode: self.params.mode,
            started_at: self.started_at,
            total_ms: total.as_secs_f64() * 1000.0,
            outcome,
            rpc: RpcProfile::from_calls(self.context.take_rpc_calls()),
            cpu,
            logs,
            dropped_logs,
            redirect,
            capture_errors: std::mem::take(&mut self.errors),
        }
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        let Some(fallback) = self.fallback.take() else {
            return;
        };
        let record = self.build(Outcome::Cancelled, None);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let id = record.id.clone();
                    if let Err(err) = fallback.store.put(&id, &record, fallback.ttl).await {
                        tracing::warn!(%id, ?err, "failed to store cancelled profile");
                    }
                });
            }
            Err(_) => {
                tracing::debug!(id = %record.id, "no runtime to store cancelled profile");
            }
        }
    }
}
