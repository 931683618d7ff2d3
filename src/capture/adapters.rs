//! Seams to the CPU profiling facilities.
//!
//! A [`CpuBackend`] hands out a [`StackSampler`] or a [`CallTracer`] for one
//! request scope. Both produce raw events; [`SamplerAdapter`] and
//! [`CallTracerAdapter`] turn those into the payload stored on the record.
//! [`SpanBackend`] is the built-in facility, which profiles the tracing span
//! stack of the request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::CaptureError;
use crate::record::{CallGraph, FunctionStats, Sample, StackCount, StackHistogram};

use super::sink::ScopeSink;

/// One snapshot of a call stack.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    /// Since the scope opened.
    pub at: Duration,
    /// Outermost frame first.
    pub stack: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEventKind {
    Enter,
    Exit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallEvent {
    pub kind: CallEventKind,
    pub function: String,
    /// Since the scope opened.
    pub at: Duration,
}

/// A running sampler. Sampling starts when it is created.
pub trait StackSampler: Send {
    fn stop(self: Box<Self>) -> Result<Vec<RawSample>, CaptureError>;
}

/// A running call tracer. Tracing starts when it is created.
pub trait CallTracer: Send {
    fn stop(self: Box<Self>) -> Result<Vec<CallEvent>, CaptureError>;
}

pub trait CpuBackend: Send + Sync {
    fn sampler(&self, sink: &Arc<ScopeSink>) -> Result<Box<dyn StackSampler>, CaptureError>;
    fn tracer(&self, sink: &Arc<ScopeSink>) -> Result<Box<dyn CallTracer>, CaptureError>;
}

// ─── Adapters ────────────────────────────────────────────────────

/// Folds raw samples into a stack-count histogram.
pub struct SamplerAdapter;

impl SamplerAdapter {
    pub fn histogram(samples: Vec<RawSample>) -> StackHistogram {
        let mut frame_names: Vec<String> = Vec::new();
        let mut frame_index: HashMap<String, usize> = HashMap::new();
        let mut stacks: Vec<StackCount> = Vec::new();
        let mut stack_index: HashMap<Vec<usize>, usize> = HashMap::new();
        let mut timeline = Vec::with_capacity(samples.len());

        for sample in &samples {
            let frames: Vec<usize> = sample
                .stack
                .iter()
                .map(|name| {
                    *frame_index.entry(name.clone()).or_insert_with(|| {
                        frame_names.push(name.clone());
                        frame_names.len() - 1
                    })
                })
                .collect();
            let idx = *stack_index.entry(frames.clone()).or_insert_with(|| {
                stacks.push(StackCount { frames, count: 0 });
                stacks.len() - 1
            });
            stacks[idx].count += 1;
            timeline.push(Sample {
                timestamp_ms: sample.at.as_secs_f64() * 1000.0,
                stack: idx,
            });
        }

        // Most frequent first; samples have to follow the new order.
        let mut order: Vec<usize> = (0..stacks.len()).collect();
        order.sort_by(|&a, &b| stacks[b].count.cmp(&stacks[a].count).then(a.cmp(&b)));
        let mut remap = vec![0; stacks.len()];
        for (new, &old) in order.iter().enumerate() {
            remap[old] = new;
        }
        let stacks = order.iter().map(|&old| stacks[old].clone()).collect();
        for sample in &mut timeline {
            sample.stack = remap[sample.stack];
        }

        StackHistogram {
            frame_names,
            stacks,
            samples: timeline,
            total_samples: samples.len(),
        }
    }
}

/// Folds enter/exit events into per-function cumulative and self time.
pub struct CallTracerAdapter;

impl CallTracerAdapter {
    /// Frames still open at the end are closed at `end`.
    pub fn call_graph(events: Vec<CallEvent>, end: Duration) -> CallGraph {
        struct Open {
            function: String,
            entered: Duration,
            children: Duration,
        }

        #[derive(Default)]
        struct Totals {
            calls: u64,
            cumulative: Duration,
            own: Duration,
        }

        let mut totals: HashMap<String, Totals> = HashMap::new();
        let mut open: Vec<Open> = Vec::new();

        fn close(totals: &mut HashMap<String, Totals>, open: &mut [Open], frame: Open, at: Duration) {
            let elapsed = at.saturating_sub(frame.entered);
            let entry = totals.entry(frame.function).or_default();
            entry.cumulative += elapsed;
            entry.own += elapsed.saturating_sub(frame.children);
            if let Some(parent) = open.last_mut() {
                parent.children += elapsed;
            }
        }

        for event in events {
            match event.kind {
                CallEventKind::Enter => {
                    totals.entry(event.function.clone()).or_default().calls += 1;
                    open.push(Open {
                        function: event.function,
                        entered: event.at,
                        children: Duration::ZERO,
                    });
                }
                CallEventKind::Exit => {
                    // Close everything above the matching frame; an exit
                    // with no matching enter is ignored.
                    let Some(pos) = open.iter().rposition(|f| f.function == event.function) else {
                        continue;
                    };
                    while open.len() > pos {
                        if let Some(frame) = open.pop() {
                            close(&mut totals, &mut open, frame, event.at);
                        }
                    }
                }
            }
        }
        while let Some(frame) = open.pop() {
            close(&mut totals, &mut open, frame, end);
        }

        let mut functions: Vec<FunctionStats> = totals
            .into_iter()
            .map(|(name, t)| FunctionStats {
                name,
                calls: t.calls,
                cumulative_ms: t.cumulative.as_secs_f64() * 1000.0,
                self_ms: t.own.as_secs_f64() * 1000.0,
            })
            .collect();
        functions.sort_by(|a, b| {
            b.cumulative_ms
                .total_cmp(&a.cumulative_ms)
                .then_with(|| a.name.cmp(&b.name))
        });
        CallGraph { functions }
    }
}

// ─── Built-in span-stack facility ────────────────────────────────

/// Samples and traces the tracing spans entered by the request.
#[derive(Debug, Clone)]
pub struct SpanBackend {
    samples_per_second: u32,
}

impl SpanBackend {
    pub const SAMPLES_PER_SECOND: u32 = 250;

    pub fn new(samples_per_second: u32) -> Self {
        Self {
            samples_per_second: samples_per_second.max(1),
        }
    }
}

impl Default for SpanBackend {
    fn default() -> Self {
        Self::new(Self::SAMPLES_PER_SECOND)
    }
}

impl CpuBackend for SpanBackend {
    fn sampler(&self, sink: &Arc<ScopeSink>) -> Result<Box<dyn StackSampler>, CaptureError> {
        let interval = Duration::from_secs(1) / self.samples_per_second;
        Ok(Box::new(SpanStackSampler::spawn(sink.clone(), interval)?))
    }

    fn tracer(&self, sink: &Arc<ScopeSink>) -> Result<Box<dyn CallTracer>, CaptureError> {
        sink.start_trace();
        Ok(Box::new(SpanCallTracer { sink: sink.clone() }))
    }
}

/// Background thread snapshotting the span stack at a fixed rate.
struct SpanStackSampler {
    stop: Arc<AtomicBool>,
    samples: Arc<Mutex<Vec<RawSample>>>,
    thread: Option<JoinHandle<()>>,
}

impl SpanStackSampler {
    fn spawn(sink: Arc<ScopeSink>, interval: Duration) -> Result<Self, CaptureError> {
        let stop = Arc::new(AtomicBool::new(false));
        let samples = Arc::new(Mutex::new(Vec::new()));
        let thread = std::thread::Builder::new()
            .name(format!("mp-sampler-{}", sink.id()))
            .spawn({
                let stop = stop.clone();
                let samples = samples.clone();
                move || {
                    // Stay on schedule: if we fall behind we sample faster
                    // to catch up rather than drift.
                    let mut next = Instant::now();
                    while !stop.load(Ordering::Acquire) {
                        let stack = sink.stack_snapshot();
                        if !stack.is_empty() {
                            samples.lock().push(RawSample {
                                at: sink.offset(),
                                stack: stack.into_iter().map(str::to_owned).collect(),
                            });
                        }
                        next += interval;
                        if let Some(wait) = next.checked_duration_since(Instant::now()) {
                            std::thread::sleep(wait);
                        }
                    }
                }
            })
            .map_err(|e| CaptureError::Sampler(e.to_string()))?;
        Ok(Self {
            stop,
            samples,
            thread: Some(thread),
        })
    }

    fn halt(&mut self) -> Result<(), CaptureError> {
        self.stop.store(true, Ordering::Release);
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| CaptureError::Sampler("sampling thread panicked".into())),
            None => Ok(()),
        }
    }
}

impl StackSampler for SpanStackSampler {
    fn stop(mut self: Box<Self>) -> Result<Vec<RawSample>, CaptureError> {
        self.halt()?;
        Ok(std::mem::take(&mut *self.samples.lock()))
    }
}

impl Drop for SpanStackSampler {
    fn drop(&mut self) {
        if let Err(err) = self.halt() {
            tracing::warn!(?err, "sampler did not shut down cleanly");
        }
    }
}

struct SpanCallTracer {
    sink: Arc<ScopeSink>,
}

impl CallTracer for SpanCallTracer {
    fn stop(self: Box<Self>) -> Result<Vec<CallEvent>, CaptureError> {
        Ok(self.sink.take_trace())
    }
}

impl Drop for SpanCallTracer {
    fn drop(&mut self) {
        // Detach if stop() was never called.
        self.sink.take_trace();
    }
}
