use std::fmt::{self, Write as _};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use super::sink::{ScopeSink, SinkRegistry};

/// Name of the span the interceptor opens around a profiled request.
pub const CAPTURE_SPAN: &str = "profiled_request";
/// Field on [`CAPTURE_SPAN`] carrying the request id.
pub const CAPTURE_FIELD: &str = "profile_id";

/// Routes events and span activity of profiled requests into their sinks.
///
/// The request span looks its sink up in the [`SinkRegistry`] by id; every
/// span opened beneath it inherits the same sink, so later lookups are a
/// single extension read. Spans and events outside profiled requests are
/// ignored.
#[derive(Debug, Clone)]
pub struct CaptureLayer {
    sinks: SinkRegistry,
}

impl CaptureLayer {
    pub fn new(sinks: SinkRegistry) -> Self {
        Self { sinks }
    }
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let sink = if attrs.metadata().name() == CAPTURE_SPAN {
            let mut visitor = ProfileIdVisitor::default();
            attrs.record(&mut visitor);
            visitor.0.and_then(|profile_id| self.sinks.lookup(&profile_id))
        } else {
            match span.parent() {
                Some(parent) => {
                    let inherited = parent.extensions().get::<Arc<ScopeSink>>().cloned();
                    inherited
                }
                None => None,
            }
        };
        if let Some(sink) = sink {
            span.extensions_mut().insert(sink);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let span = if event.is_root() {
            None
        } else if let Some(parent) = event.parent() {
            ctx.span(parent)
        } else {
            ctx.lookup_current()
        };
        let Some(span) = span else {
            return;
        };
        let Some(sink) = span.extensions().get::<Arc<ScopeSink>>().cloned() else {
            return;
        };
        if !sink.logs_enabled() {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let meta = event.metadata();
        sink.push_log(
            meta.level(),
            meta.module_path().unwrap_or_else(|| meta.target()),
            visitor.finish(),
        );
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            if let Some(sink) = span.extensions().get::<Arc<ScopeSink>>() {
                sink.enter(span.name());
            }
        }
    }

    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            if let Some(sink) = span.extensions().get::<Arc<ScopeSink>>() {
                sink.exit(span.name());
            }
        }
    }
}

#[derive(Default)]
struct ProfileIdVisitor(Option<String>);

impl Visit for ProfileIdVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == CAPTURE_FIELD {
            self.0 = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == CAPTURE_FIELD {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

/// Flattens an event into `message key=value ...`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields.trim_start().to_owned(),
            (false, false) => self.message + &self.fields,
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
