//! Trace and span records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    TokenRefresh,
    ProviderFetch,
    FilterEvaluation,
    DirectorSelection,
    LlmCall,
    ToolCall,
    StateUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Running,
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub kind: SpanKind,
    pub name: String,
    pub status: SpanStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub annotations: Map<String, Value>,
}

/// What a trace correlates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// One account listing within a fetch cycle.
    FetchPass,
    /// One envelope through filters and directors.
    EmailRun,
}

/// Attributes a trace starts with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSeed {
    pub kind: TraceKind,
    pub tenant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl TraceSeed {
    pub fn new(kind: TraceKind, tenant: impl Into<String>) -> Self {
        Self {
            kind,
            tenant: tenant.into(),
            account_id: None,
            email_id: None,
            attributes: Map::new(),
        }
    }

    pub fn account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn email(mut self, email_id: impl Into<String>) -> Self {
        self.email_id = Some(email_id.into());
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub id: String,
    #[serde(flatten)]
    pub seed: TraceSeed,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub spans: Vec<Span>,
    /// Spans refused because the cap was reached.
    #[serde(default)]
    pub dropped_spans: usize,
}

/// Everything needed to open a span.
#[derive(Debug, Clone)]
pub struct SpanDescriptor {
    pub kind: SpanKind,
    pub name: String,
    pub parent_id: Option<String>,
    pub request: Option<Value>,
    pub annotations: Map<String, Value>,
}

impl SpanDescriptor {
    pub fn new(kind: SpanKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            parent_id: None,
            request: None,
            annotations: Map::new(),
        }
    }

    /// Nest under another span. Empty ids (tracing off) are ignored.
    pub fn child_of(mut self, parent_id: &str) -> Self {
        if !parent_id.is_empty() {
            self.parent_id = Some(parent_id.to_string());
        }
        self
    }

    pub fn with_request(mut self, request: Value) -> Self {
        self.request = Some(request);
        self
    }

    pub fn annotate(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

/// How a span ended.
#[derive(Debug, Clone)]
pub struct SpanOutcome {
    pub status: SpanStatus,
    pub error: Option<String>,
    pub response: Option<Value>,
    pub annotations: Map<String, Value>,
}

impl SpanOutcome {
    pub fn ok() -> Self {
        Self {
            status: SpanStatus::Ok,
            error: None,
            response: None,
            annotations: Map::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: SpanStatus::Error,
            error: Some(message.into()),
            ..Self::ok()
        }
    }

    pub fn with_response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }

    pub fn annotate(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}
