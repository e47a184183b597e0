//! Generation telemetry for chat calls
//!
//! Adapters receive a [`Telemetry`] handle at construction and open one
//! generation span per chat call. Telemetry is a side channel: failures and
//! panics raised by a backend are logged and dropped, never surfaced to the
//! chat caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, field, warn};
use uuid::Uuid;

use crate::vision::{ChatError, ChatResponse};

/// Telemetry error types
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Telemetry backend unavailable: {0}")]
    Unavailable(String),

    #[error("Telemetry event rejected: {0}")]
    Rejected(String),
}

/// Caller's trace position, used to parent the generation span
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: Option<String>,
    pub parent_observation_id: Option<String>,
}

impl TraceContext {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            parent_observation_id: None,
        }
    }

    pub fn with_parent(mut self, observation_id: impl Into<String>) -> Self {
        self.parent_observation_id = Some(observation_id.into());
        self
    }
}

/// Attributes recorded when a generation span opens
#[derive(Debug, Clone, Serialize)]
pub struct GenerationStart {
    pub name: String,
    pub backend: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub trace: Option<TraceContext>,
}

impl GenerationStart {
    pub fn chat(backend: &str, model: &str, max_tokens: u32, temperature: f32) -> Self {
        Self {
            name: "chat_generation".to_string(),
            backend: backend.to_string(),
            model: model.to_string(),
            max_tokens,
            temperature,
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: Option<TraceContext>) -> Self {
        self.trace = trace;
        self
    }
}

/// Telemetry backend
pub trait Telemetry: Send + Sync {
    /// Open a generation span
    fn start_generation(
        &self,
        start: &GenerationStart,
    ) -> Result<Box<dyn GenerationSpan>, TelemetryError>;
}

/// An open generation span, closed exactly once
pub trait GenerationSpan: Send {
    fn end_ok(self: Box<Self>, output: &str) -> Result<(), TelemetryError>;

    fn end_err(self: Box<Self>, error: &str) -> Result<(), TelemetryError>;
}

/// Telemetry that records nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

struct NoopSpan;

impl Telemetry for NoopTelemetry {
    fn start_generation(
        &self,
        _start: &GenerationStart,
    ) -> Result<Box<dyn GenerationSpan>, TelemetryError> {
        Ok(Box::new(NoopSpan))
    }
}

impl GenerationSpan for NoopSpan {
    fn end_ok(self: Box<Self>, _output: &str) -> Result<(), TelemetryError> {
        Ok(())
    }

    fn end_err(self: Box<Self>, _error: &str) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Telemetry emitted as `tracing` spans
///
/// A successful generation closes with the response text in the `output`
/// field; a failed one with the error message in `error`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TracingTelemetry {
    pub fn new() -> Self {
        Self
    }
}

struct TracingSpan {
    span: tracing::Span,
    started: Instant,
}

impl Telemetry for TracingTelemetry {
    fn start_generation(
        &self,
        start: &GenerationStart,
    ) -> Result<Box<dyn GenerationSpan>, TelemetryError> {
        let span = tracing::info_span!(
            "chat_generation",
            generation = %start.name,
            backend = %start.backend,
            model = %start.model,
            max_tokens = start.max_tokens,
            temperature = start.temperature as f64,
            trace_id = field::Empty,
            parent_observation_id = field::Empty,
            output = field::Empty,
            output_len = field::Empty,
            error = field::Empty,
            elapsed_ms = field::Empty,
        );

        if let Some(trace) = &start.trace {
            if let Some(trace_id) = &trace.trace_id {
                span.record("trace_id", trace_id.as_str());
            }
            if let Some(parent) = &trace.parent_observation_id {
                span.record("parent_observation_id", parent.as_str());
            }
        }

        Ok(Box::new(TracingSpan {
            span,
            started: Instant::now(),
        }))
    }
}

impl GenerationSpan for TracingSpan {
    fn end_ok(self: Box<Self>, output: &str) -> Result<(), TelemetryError> {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        self.span.record("elapsed_ms", elapsed_ms);
        self.span.record("output_len", output.len() as u64);
        self.span.record("output", output);
        self.span.in_scope(|| debug!("generation completed"));
        Ok(())
    }

    fn end_err(self: Box<Self>, error: &str) -> Result<(), TelemetryError> {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        self.span.record("elapsed_ms", elapsed_ms);
        self.span.record("error", error);
        self.span.in_scope(|| warn!(error, "generation failed"));
        Ok(())
    }
}

/// A finished generation, as captured by [`InMemoryTelemetry`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: Uuid,
    pub name: String,
    pub backend: String,
    pub model: String,
    pub input: serde_json::Value,
    pub trace_id: Option<String>,
    pub parent_observation_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Telemetry that keeps finished generations in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryTelemetry {
    records: Arc<Mutex<Vec<GenerationRecord>>>,
}

impl InMemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all finished generations, oldest first
    pub fn records(&self) -> Vec<GenerationRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

struct InMemorySpan {
    pending: GenerationRecord,
    sink: Arc<Mutex<Vec<GenerationRecord>>>,
}

impl InMemorySpan {
    fn finish(mut self, output: Option<String>, error: Option<String>) -> Result<(), TelemetryError> {
        self.pending.end_time = Utc::now();
        self.pending.output = output;
        self.pending.error = error;
        self.sink
            .lock()
            .map_err(|_| TelemetryError::Unavailable("record store poisoned".to_string()))?
            .push(self.pending);
        Ok(())
    }
}

impl Telemetry for InMemoryTelemetry {
    fn start_generation(
        &self,
        start: &GenerationStart,
    ) -> Result<Box<dyn GenerationSpan>, TelemetryError> {
        let now = Utc::now();
        let trace = start.trace.clone().unwrap_or_default();

        Ok(Box::new(InMemorySpan {
            pending: GenerationRecord {
                id: Uuid::new_v4(),
                name: start.name.clone(),
                backend: start.backend.clone(),
                model: start.model.clone(),
                input: serde_json::json!({
                    "max_tokens": start.max_tokens,
                    "temperature": start.temperature,
                }),
                trace_id: trace.trace_id,
                parent_observation_id: trace.parent_observation_id,
                start_time: now,
                end_time: now,
                output: None,
                error: None,
            },
            sink: Arc::clone(&self.records),
        }))
    }
}

impl GenerationSpan for InMemorySpan {
    fn end_ok(self: Box<Self>, output: &str) -> Result<(), TelemetryError> {
        (*self).finish(Some(output.to_string()), None)
    }

    fn end_err(self: Box<Self>, error: &str) -> Result<(), TelemetryError> {
        (*self).finish(None, Some(error.to_string()))
    }
}

/// Opens a generation span and closes it with the chat outcome.
///
/// Every telemetry call is isolated: errors and panics are logged and the
/// span is abandoned. A guard dropped before `finish` (the chat future was
/// cancelled) closes its span as failed with `cancelled`.
pub(crate) struct GenerationGuard {
    span: Option<Box<dyn GenerationSpan>>,
}

impl GenerationGuard {
    pub(crate) fn start(telemetry: &dyn Telemetry, start: &GenerationStart) -> Self {
        let span = match panic::catch_unwind(AssertUnwindSafe(|| telemetry.start_generation(start))) {
            Ok(Ok(span)) => Some(span),
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to open generation span");
                None
            }
            Err(_) => {
                warn!("Telemetry panicked while opening generation span");
                None
            }
        };

        Self { span }
    }

    pub(crate) fn finish(mut self, outcome: &Result<ChatResponse, ChatError>) {
        if let Some(span) = self.span.take() {
            close_span(span, |span| match outcome {
                Ok(response) => span.end_ok(&response.text),
                Err(e) => span.end_err(&e.to_string()),
            });
        }
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            debug!("Chat cancelled before completion");
            close_span(span, |span| span.end_err("cancelled"));
        }
    }
}

fn close_span<F>(span: Box<dyn GenerationSpan>, end: F)
where
    F: FnOnce(Box<dyn GenerationSpan>) -> Result<(), TelemetryError>,
{
    match panic::catch_unwind(AssertUnwindSafe(move || end(span))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Failed to close generation span"),
        Err(_) => warn!("Telemetry panicked while closing generation span"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenTelemetry;

    impl Telemetry for BrokenTelemetry {
        fn start_generation(
            &self,
            _start: &GenerationStart,
        ) -> Result<Box<dyn GenerationSpan>, TelemetryError> {
            Err(TelemetryError::Unavailable("connection refused".to_string()))
        }
    }

    struct PanickingSpan;

    impl GenerationSpan for PanickingSpan {
        fn end_ok(self: Box<Self>, _output: &str) -> Result<(), TelemetryError> {
            panic!("span exporter crashed")
        }

        fn end_err(self: Box<Self>, _error: &str) -> Result<(), TelemetryError> {
            panic!("span exporter crashed")
        }
    }

    struct PanicOnEnd;

    impl Telemetry for PanicOnEnd {
        fn start_generation(
            &self,
            _start: &GenerationStart,
        ) -> Result<Box<dyn GenerationSpan>, TelemetryError> {
            Ok(Box::new(PanickingSpan))
        }
    }

    fn start() -> GenerationStart {
        GenerationStart::chat("openai", "gpt-4o", 300, 0.1)
    }

    #[test]
    fn test_in_memory_records_success() {
        let telemetry = InMemoryTelemetry::new();
        let trace = TraceContext::new("trace-1").with_parent("obs-7");

        let guard = GenerationGuard::start(&telemetry, &start().with_trace(Some(trace)));
        guard.finish(&Ok(ChatResponse::single_turn("q", "red".to_string())));

        let records = telemetry.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "chat_generation");
        assert_eq!(records[0].model, "gpt-4o");
        assert_eq!(records[0].input["max_tokens"], 300);
        assert_eq!(records[0].trace_id.as_deref(), Some("trace-1"));
        assert_eq!(records[0].parent_observation_id.as_deref(), Some("obs-7"));
        assert_eq!(records[0].output.as_deref(), Some("red"));
        assert!(records[0].error.is_none());
    }

    #[test]
    fn test_in_memory_records_error() {
        let telemetry = InMemoryTelemetry::new();
        let guard = GenerationGuard::start(&telemetry, &start());
        guard.finish(&Err(ChatError::Transport("connection reset".to_string())));

        let records = telemetry.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].output.is_none());
        assert!(records[0].error.as_deref().unwrap().contains("connection reset"));
    }

    #[test]
    fn test_broken_telemetry_is_contained() {
        let guard = GenerationGuard::start(&BrokenTelemetry, &start());
        guard.finish(&Ok(ChatResponse::single_turn("q", "a".to_string())));
    }

    #[test]
    fn test_panicking_span_is_contained() {
        let guard = GenerationGuard::start(&PanicOnEnd, &start());
        guard.finish(&Err(ChatError::MalformedResponse("no choices".to_string())));
    }

    #[test]
    fn test_dropped_guard_records_cancellation() {
        let telemetry = InMemoryTelemetry::new();
        let guard = GenerationGuard::start(&telemetry, &start());
        drop(guard);

        let records = telemetry.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].output.is_none());
        assert_eq!(records[0].error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_finished_guard_records_once() {
        let telemetry = InMemoryTelemetry::new();
        let guard = GenerationGuard::start(&telemetry, &start());
        guard.finish(&Ok(ChatResponse::single_turn("q", "red".to_string())));

        let records = telemetry.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].error.is_none());
    }

    mod capture {
        use std::collections::HashMap;
        use std::fmt;
        use std::sync::{Arc, Mutex};
        use tracing::field::{Field, Visit};
        use tracing::span::{Attributes, Id, Record};
        use tracing::Subscriber;
        use tracing_subscriber::layer::{Context, Layer};

        /// Collects every span field value, keyed by field name
        #[derive(Clone, Default)]
        pub struct FieldCapture(pub Arc<Mutex<HashMap<String, String>>>);

        struct Collect<'a>(&'a mut HashMap<String, String>);

        impl Visit for Collect<'_> {
            fn record_str(&mut self, field: &Field, value: &str) {
                self.0.insert(field.name().to_string(), value.to_string());
            }

            fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
                self.0.insert(field.name().to_string(), format!("{:?}", value));
            }
        }

        impl<S: Subscriber> Layer<S> for FieldCapture {
            fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
                attrs.record(&mut Collect(&mut self.0.lock().unwrap()));
            }

            fn on_record(&self, _id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
                values.record(&mut Collect(&mut self.0.lock().unwrap()));
            }
        }
    }

    #[test]
    fn test_tracing_span_records_response_text() {
        use tracing_subscriber::layer::SubscriberExt;

        let capture = capture::FieldCapture::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());

        tracing::subscriber::with_default(subscriber, || {
            let trace = TraceContext::new("trace-9").with_parent("obs-2");
            let start = start().with_trace(Some(trace));
            let guard = GenerationGuard::start(&TracingTelemetry::new(), &start);
            let answer = "The BLEU score is 27.3".to_string();
            guard.finish(&Ok(ChatResponse::single_turn("q", answer)));
        });

        let fields = capture.0.lock().unwrap();
        assert_eq!(fields.get("output").map(String::as_str), Some("The BLEU score is 27.3"));
        assert_eq!(fields.get("trace_id").map(String::as_str), Some("trace-9"));
        assert_eq!(fields.get("parent_observation_id").map(String::as_str), Some("obs-2"));
        assert_eq!(fields.get("model").map(String::as_str), Some("gpt-4o"));
        assert!(fields.contains_key("elapsed_ms"));
        assert!(!fields.contains_key("error"));
    }

    #[test]
    fn test_tracing_span_records_error() {
        use tracing_subscriber::layer::SubscriberExt;

        let capture = capture::FieldCapture::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());

        tracing::subscriber::with_default(subscriber, || {
            let guard = GenerationGuard::start(&TracingTelemetry::new(), &start());
            guard.finish(&Err(ChatError::Transport("connection reset".to_string())));
        });

        let fields = capture.0.lock().unwrap();
        assert!(fields["error"].contains("connection reset"));
        assert!(!fields.contains_key("output"));
    }
}
