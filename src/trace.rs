//! Optional distributed-tracing collaborator.
//!
//! The router reports spans to an external tracing service when one is
//! wired in. Tracing is instrumentation, not a dependency: every call is
//! best-effort and the default no-op implementation makes the router behave
//! identically without a collaborator.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

#[async_trait]
pub trait Tracer: std::fmt::Debug + Send + Sync {
    /// Open a span and return its id. Implementations must swallow their
    /// own errors; a failed write still returns a usable span id.
    async fn start_span(
        &self,
        trace_id: &str,
        parent_span_id: Option<&str>,
        service: &str,
        operation: &str,
        metadata: Value,
    ) -> String;

    /// Close a span with its final status.
    async fn complete_span(
        &self,
        span_id: &str,
        status: &str,
        error_message: Option<&str>,
        error_type: Option<&str>,
    );
}

/// The default collaborator: records nothing, hands out dummy span ids.
#[derive(Debug, Clone, Default)]
pub struct NoopTracer;

#[async_trait]
impl Tracer for NoopTracer {
    async fn start_span(
        &self,
        _trace_id: &str,
        _parent_span_id: Option<&str>,
        _service: &str,
        _operation: &str,
        _metadata: Value,
    ) -> String {
        Uuid::new_v4().to_string()
    }

    async fn complete_span(
        &self,
        _span_id: &str,
        _status: &str,
        _error_message: Option<&str>,
        _error_type: Option<&str>,
    ) {
    }
}
