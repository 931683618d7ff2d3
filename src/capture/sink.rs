use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::Level;

use crate::id::RequestId;
use crate::record::LogLine;

use super::adapters::{CallEvent, CallEventKind};

/// Per-request buffer the tracing layer writes into.
///
/// Holds the log lines and the live span stack of one profiled request.
/// Only that request's spans ever point at it.
#[derive(Debug)]
pub struct ScopeSink {
    id: RequestId,
    started: Instant,
    logs_enabled: bool,
    max_logs: usize,
    logs: Mutex<Vec<LogLine>>,
    dropped_logs: AtomicUsize,
    stack: Mutex<Vec<&'static str>>,
    /// `Some` while a call tracer is attached.
    trace: Mutex<Option<Vec<CallEvent>>>,
}

impl ScopeSink {
    pub fn new(id: RequestId, logs_enabled: bool, max_logs: usize) -> Self {
        Self {
            id,
            started: Instant::now(),
            logs_enabled,
            max_logs,
            logs: Mutex::new(Vec::new()),
            dropped_logs: AtomicUsize::new(0),
            stack: Mutex::new(Vec::new()),
            trace: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Time since the scope opened.
    pub fn offset(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn logs_enabled(&self) -> bool {
        self.logs_enabled
    }

    pub fn push_log(&self, level: &Level, target: &str, message: String) {
        if !self.logs_enabled {
            return;
        }
        let line = LogLine {
            level: level.to_string(),
            target: target.to_owned(),
            message,
            offset_ms: self.offset().as_secs_f64() * 1000.0,
        };
        let mut logs = self.logs.lock();
        if logs.len() < self.max_logs {
            logs.push(line);
        } else {
            self.dropped_logs.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn enter(&self, name: &'static str) {
        self.stack.lock().push(name);
        self.trace_event(CallEventKind::Enter, name);
    }

    pub fn exit(&self, name: &'static str) {
        {
            let mut stack = self.stack.lock();
            // Async spans can exit out of order; drop the innermost match.
            if let Some(pos) = stack.iter().rposition(|n| *n == name) {
                stack.remove(pos);
            }
        }
        self.trace_event(CallEventKind::Exit, name);
    }

    /// Current span stack, outermost first.
    pub fn stack_snapshot(&self) -> Vec<&'static str> {
        self.stack.lock().clone()
    }

    pub fn start_trace(&self) {
        *self.trace.lock() = Some(Vec::new());
    }

    /// Stop tracing and hand back what was recorded.
    pub fn take_trace(&self) -> Vec<CallEvent> {
        self.trace.lock().take().unwrap_or_default()
    }

    pub fn take_logs(&self) -> (Vec<LogLine>, usize) {
        let logs = std::mem::take(&mut *self.logs.lock());
        (logs, self.dropped_logs.swap(0, Ordering::Relaxed))
    }

    fn trace_event(&self, kind: CallEventKind, name: &'static str) {
        let mut trace = self.trace.lock();
        if let Some(events) = trace.as_mut() {
            events.push(CallEvent {
                kind,
                function: name.to_owned(),
                at: self.offset(),
            });
        }
    }
}

/// Sinks of the requests currently being profiled, by id.
///
/// Shared between the interceptor, which registers a sink when a scope
/// opens, and [`CaptureLayer`](super::CaptureLayer), which looks it up
/// when the request span is created.
#[derive(Debug, Clone, Default)]
pub struct SinkRegistry {
    sinks: Arc<Mutex<HashMap<RequestId, Arc<ScopeSink>>>>,
}

impl SinkRegistry {
    pub fn register(&self, sink: Arc<ScopeSink>) -> Registration {
        let id = sink.id().clone();
        self.sinks.lock().insert(id.clone(), sink);
        Registration {
            registry: self.clone(),
            id,
        }
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<ScopeSink>> {
        self.sinks.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sinks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes the sink from the registry when dropped.
#[derive(Debug)]
pub struct Registration {
    registry: SinkRegistry,
    id: RequestId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.sinks.lock().remove(&self.id);
    }
}
