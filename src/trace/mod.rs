//! Hierarchical trace/span recording with redaction and size caps.

pub mod model;
pub mod recorder;
pub mod redact;

pub use model::{
    Span, SpanDescriptor, SpanKind, SpanOutcome, SpanStatus, Trace, TraceKind, TraceSeed,
};
pub use recorder::TraceRecorder;
pub use redact::{REDACTED, TRUNCATION_MARKER, redact, truncate_payload};
