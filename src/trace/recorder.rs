//! Trace recorder.
//!
//! Open traces are held in memory and persisted to the tenant's `traces`
//! collection when closed. When disabled every call is a no-op; recording
//! never fails the caller.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::TraceConfig;
use crate::store::{Collection, TenantStore};
use crate::trace::model::{Span, SpanDescriptor, SpanOutcome, SpanStatus, Trace, TraceSeed};
use crate::trace::redact::{redact, truncate_payload};

pub struct TraceRecorder {
    config: TraceConfig,
    store: Option<TenantStore>,
    open: Mutex<HashMap<String, Trace>>,
}

impl TraceRecorder {
    pub fn new(config: TraceConfig, store: TenantStore) -> Self {
        Self {
            config,
            store: Some(store),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// A recorder that records nothing.
    pub fn disabled() -> Self {
        Self {
            config: TraceConfig {
                enabled: false,
                ..TraceConfig::default()
            },
            store: None,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.store.is_some()
    }

    /// Whether request/response payloads are attached to spans.
    pub fn captures_payloads(&self) -> bool {
        self.is_enabled() && self.config.verbose
    }

    /// Open a trace. Returns an empty id when disabled.
    pub async fn begin_trace(&self, seed: TraceSeed) -> String {
        if !self.is_enabled() {
            return String::new();
        }
        let id = Uuid::new_v4().to_string();
        let trace = Trace {
            id: id.clone(),
            seed,
            started_at: Utc::now(),
            ended_at: None,
            spans: Vec::new(),
            dropped_spans: 0,
        };
        self.open.lock().await.insert(id.clone(), trace);
        id
    }

    /// Open a span. Returns an empty id when disabled, when the trace is
    /// unknown, or when the span cap is reached.
    pub async fn begin_span(&self, trace_id: &str, descriptor: SpanDescriptor) -> String {
        if !self.is_enabled() || trace_id.is_empty() {
            return String::new();
        }
        let request = descriptor.request.and_then(|r| self.capture(r));

        let mut open = self.open.lock().await;
        let Some(trace) = open.get_mut(trace_id) else {
            return String::new();
        };
        if trace.spans.len() >= self.config.max_spans {
            trace.dropped_spans += 1;
            if trace.dropped_spans == 1 {
                warn!(trace_id, max_spans = self.config.max_spans, "Span cap reached");
            }
            return String::new();
        }

        let id = Uuid::new_v4().to_string();
        trace.spans.push(Span {
            id: id.clone(),
            parent_id: descriptor.parent_id,
            kind: descriptor.kind,
            name: descriptor.name,
            status: SpanStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            request,
            response: None,
            error: None,
            annotations: descriptor.annotations,
        });
        id
    }

    /// Close a span with its outcome.
    pub async fn end_span(&self, trace_id: &str, span_id: &str, outcome: SpanOutcome) {
        if !self.is_enabled() || trace_id.is_empty() || span_id.is_empty() {
            return;
        }
        let response = outcome.response.and_then(|r| self.capture(r));

        let mut open = self.open.lock().await;
        let Some(span) = open
            .get_mut(trace_id)
            .and_then(|t| t.spans.iter_mut().find(|s| s.id == span_id))
        else {
            return;
        };
        let now = Utc::now();
        span.status = outcome.status;
        span.ended_at = Some(now);
        span.duration_ms = Some((now - span.started_at).num_milliseconds().max(0));
        span.error = outcome.error;
        if response.is_some() {
            span.response = response;
        }
        span.annotations.extend(outcome.annotations);
    }

    /// Close and persist a trace. Running spans are closed as errors.
    pub async fn end_trace(&self, trace_id: &str) {
        if !self.is_enabled() || trace_id.is_empty() {
            return;
        }
        let Some(mut trace) = self.open.lock().await.remove(trace_id) else {
            return;
        };
        let now = Utc::now();
        trace.ended_at = Some(now);
        for span in trace
            .spans
            .iter_mut()
            .filter(|s| s.status == SpanStatus::Running)
        {
            span.status = SpanStatus::Error;
            span.error = Some("span not closed before trace end".to_string());
            span.ended_at = Some(now);
            span.duration_ms = Some((now - span.started_at).num_milliseconds().max(0));
        }

        if let Err(e) = self.persist(trace).await {
            warn!(trace_id, error = %e, "Failed to persist trace");
        }
    }

    /// Copy of an open trace.
    pub async fn open_trace(&self, trace_id: &str) -> Option<Trace> {
        self.open.lock().await.get(trace_id).cloned()
    }

    /// Redact and size-cap a payload if payload capture is on.
    fn capture(&self, payload: Value) -> Option<Value> {
        if !self.config.verbose {
            return None;
        }
        let redacted = redact(&payload, &self.config.sensitive_fields);
        Some(truncate_payload(redacted, self.config.max_payload_bytes))
    }

    async fn persist(&self, trace: Trace) -> Result<(), crate::error::StoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut traces: Vec<Value> = store.load(Collection::Traces).await?;
        let value = serde_json::to_value(&trace).map_err(|e| {
            crate::error::StoreError::Serialization {
                collection: Collection::Traces.to_string(),
                reason: e.to_string(),
            }
        })?;
        traces.push(value);
        if traces.len() > self.config.max_traces {
            let excess = traces.len() - self.config.max_traces;
            traces.drain(..excess);
        }
        store.save(Collection::Traces, &traces).await?;
        debug!(trace_id = %trace.id, spans = trace.spans.len(), "Trace persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::trace::model::{SpanKind, TraceKind};
    use crate::trace::redact::REDACTED;
    use serde_json::json;
    use std::sync::Arc;

    fn recorder(config: TraceConfig) -> (TraceRecorder, TenantStore) {
        let store = TenantStore::new(Arc::new(MemoryStore::new()), "t1");
        (TraceRecorder::new(config, store.clone()), store)
    }

    #[tokio::test]
    async fn disabled_recorder_is_noop() {
        let recorder = TraceRecorder::disabled();
        let trace_id = recorder
            .begin_trace(TraceSeed::new(TraceKind::EmailRun, "t1"))
            .await;
        assert!(trace_id.is_empty());
        let span = recorder
            .begin_span(&trace_id, SpanDescriptor::new(SpanKind::LlmCall, "x"))
            .await;
        assert!(span.is_empty());
        recorder.end_span(&trace_id, &span, SpanOutcome::ok()).await;
        recorder.end_trace(&trace_id).await;
    }

    #[tokio::test]
    async fn spans_nest_and_persist() {
        let (recorder, store) = recorder(TraceConfig::default());
        let trace_id = recorder
            .begin_trace(TraceSeed::new(TraceKind::EmailRun, "t1").email("m1"))
            .await;
        let parent = recorder
            .begin_span(
                &trace_id,
                SpanDescriptor::new(SpanKind::FilterEvaluation, "filters"),
            )
            .await;
        let child = recorder
            .begin_span(
                &trace_id,
                SpanDescriptor::new(SpanKind::DirectorSelection, "select").child_of(&parent),
            )
            .await;
        recorder
            .end_span(&trace_id, &child, SpanOutcome::ok().annotate("selected", 1))
            .await;
        recorder
            .end_span(&trace_id, &parent, SpanOutcome::error("boom"))
            .await;

        let open = recorder.open_trace(&trace_id).await.unwrap();
        assert_eq!(open.spans.len(), 2);
        assert_eq!(open.spans[1].parent_id.as_deref(), Some(parent.as_str()));
        assert_eq!(open.spans[0].status, SpanStatus::Error);
        assert_eq!(open.spans[1].annotations["selected"], 1);
        assert!(open.spans[1].duration_ms.is_some());

        recorder.end_trace(&trace_id).await;
        assert!(recorder.open_trace(&trace_id).await.is_none());

        let persisted: Vec<Trace> = store.load(Collection::Traces).await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].seed.email_id.as_deref(), Some("m1"));
        assert!(persisted[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn span_cap_returns_empty_id() {
        let (recorder, _) = recorder(TraceConfig {
            max_spans: 2,
            ..TraceConfig::default()
        });
        let trace_id = recorder
            .begin_trace(TraceSeed::new(TraceKind::FetchPass, "t1"))
            .await;
        for _ in 0..2 {
            let id = recorder
                .begin_span(&trace_id, SpanDescriptor::new(SpanKind::ToolCall, "t"))
                .await;
            assert!(!id.is_empty());
        }
        let over = recorder
            .begin_span(&trace_id, SpanDescriptor::new(SpanKind::ToolCall, "t"))
            .await;
        assert!(over.is_empty());
        assert_eq!(recorder.open_trace(&trace_id).await.unwrap().dropped_spans, 1);

        let unknown = recorder
            .begin_span("nope", SpanDescriptor::new(SpanKind::ToolCall, "t"))
            .await;
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn verbose_payloads_are_redacted_and_capped() {
        let (recorder, _) = recorder(TraceConfig {
            verbose: true,
            max_payload_bytes: 64,
            ..TraceConfig::default()
        });
        let trace_id = recorder
            .begin_trace(TraceSeed::new(TraceKind::EmailRun, "t1"))
            .await;
        let span = recorder
            .begin_span(
                &trace_id,
                SpanDescriptor::new(SpanKind::TokenRefresh, "refresh")
                    .with_request(json!({"access_token": "secret"})),
            )
            .await;
        recorder
            .end_span(
                &trace_id,
                &span,
                SpanOutcome::ok().with_response(json!({"body": "y".repeat(500)})),
            )
            .await;

        let trace = recorder.open_trace(&trace_id).await.unwrap();
        let span = &trace.spans[0];
        assert_eq!(span.request.as_ref().unwrap()["access_token"], REDACTED);
        let response = span.response.as_ref().unwrap().as_str().unwrap();
        assert!(response.ends_with(crate::trace::redact::TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn payloads_dropped_when_not_verbose() {
        let (recorder, _) = recorder(TraceConfig::default());
        let trace_id = recorder
            .begin_trace(TraceSeed::new(TraceKind::EmailRun, "t1"))
            .await;
        let span = recorder
            .begin_span(
                &trace_id,
                SpanDescriptor::new(SpanKind::LlmCall, "llm").with_request(json!({"a": 1})),
            )
            .await;
        let trace = recorder.open_trace(&trace_id).await.unwrap();
        assert!(trace.spans.iter().find(|s| s.id == span).unwrap().request.is_none());
    }

    #[tokio::test]
    async fn persisted_traces_are_capped() {
        let (recorder, store) = recorder(TraceConfig {
            max_traces: 3,
            ..TraceConfig::default()
        });
        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = recorder
                .begin_trace(TraceSeed::new(TraceKind::FetchPass, "t1"))
                .await;
            recorder.end_trace(&id).await;
            ids.push(id);
        }
        let persisted: Vec<Trace> = store.load(Collection::Traces).await.unwrap();
        let kept: Vec<&str> = persisted.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(kept, vec![ids[2].as_str(), ids[3].as_str(), ids[4].as_str()]);
    }
}
