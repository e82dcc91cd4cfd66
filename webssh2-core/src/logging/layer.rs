//! Bridge from `tracing` into the structured-log pipeline: events under
//! the `webssh2` target namespace that carry an `event` field are turned
//! into [`LogRecord`]s and published asynchronously.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use tracing::field::Visit;
use tracing::{Event, Subscriber};
use tracing_core::Field;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;
use webssh2_common::LogLevel;

use super::pipeline::LogPipeline;
use super::record::LogRecord;

#[derive(Clone, Default)]
struct CapturedValues(HashMap<&'static str, String>);

struct CaptureVisitor<'a> {
    values: &'a mut CapturedValues,
}

impl<'a> Visit for CaptureVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.values.0.insert(field.name(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        self.values.0.insert(field.name(), format!("{value:?}"));
    }
}

pub struct PipelineLogLayer {
    pipeline: Arc<LogPipeline>,
}

impl<S> Layer<S> for PipelineLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        attrs: &tracing_core::span::Attributes<'_>,
        id: &tracing_core::span::Id,
        ctx: Context<'_, S>,
    ) {
        let Some(span) = ctx.span(id) else { return };
        if !span.metadata().target().starts_with("webssh2") {
            return;
        }
        let mut values = CapturedValues::default();
        attrs.record(&mut CaptureVisitor {
            values: &mut values,
        });
        span.extensions_mut().replace(values);
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if !event.metadata().target().starts_with("webssh2") {
            return;
        }

        let mut values = CapturedValues::default();

        let current = ctx.current_span();
        let parent_id = event.parent().or_else(|| current.id());
        if let Some(parent_id) = parent_id {
            if let Some(span) = ctx.span(parent_id) {
                for span in span.scope().from_root() {
                    if let Some(other) = span.extensions().get::<CapturedValues>() {
                        values.0.extend(other.0.clone());
                    }
                }
            }
        }

        event.record(&mut CaptureVisitor {
            values: &mut values,
        });

        // Only structured gateway events enter the pipeline; plain text
        // logs stay on the console layer.
        let Some(event_name) = values.0.remove("event") else {
            return;
        };

        let level = match *event.metadata().level() {
            tracing::Level::TRACE | tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        };

        let mut record = LogRecord::new(level, event_name);
        record.message = values.0.remove("message");
        let context = &mut record.context;
        context.session_id = values.0.remove("session_id");
        context.request_id = values.0.remove("request_id");
        context.username = values.0.remove("username");
        context.client_ip = values.0.remove("client_ip");
        context.client_port = values.0.remove("client_port").and_then(|v| v.parse().ok());
        context.user_agent = values.0.remove("user_agent");
        context.target_host = values.0.remove("target_host");
        context.target_port = values.0.remove("target_port").and_then(|v| v.parse().ok());
        context.reason = values.0.remove("reason");
        context.error_code = values.0.remove("error_code");
        context.duration_ms = values.0.remove("duration_ms").and_then(|v| v.parse().ok());
        context.bytes_in = values.0.remove("bytes_in").and_then(|v| v.parse().ok());
        context.bytes_out = values.0.remove("bytes_out").and_then(|v| v.parse().ok());
        context.connection_id = values.0.remove("connection_id");
        if !values.0.is_empty() {
            record.extra = Some(serde_json::json!(values.0));
        }

        if let Err(error) = self.pipeline.publish(record) {
            eprintln!("dropping malformed structured log entry: {error}");
        }
    }
}

pub fn make_pipeline_logger_layer<S>(pipeline: Arc<LogPipeline>) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    PipelineLogLayer { pipeline }
}
