use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::dispatch::types::{FunctionTarget, InvocationMetrics, ResponseSource};

pub const TRACE_HEADER: &str = "fx-trace-id";
pub const RESPONSE_SOURCE_HEADER: &str = "x-fx-response-source";

/// Trace correlation carried as `<traceId>.<spanId>` in [`TRACE_HEADER`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub span_id: String,
}

impl TraceContext {
    /// Continues the caller's trace under a fresh span, or starts a new trace.
    #[must_use]
    pub fn continue_from(header: Option<&str>) -> Self {
        let parsed = header.and_then(|value| {
            let (trace_id, span_id) = value.trim().split_once('.')?;
            let valid = |id: &str| !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit());
            (valid(trace_id) && valid(span_id)).then(|| (trace_id.to_string(), span_id.to_string()))
        });
        match parsed {
            Some((trace_id, parent_span_id)) => Self {
                trace_id,
                parent_span_id: Some(parent_span_id),
                span_id: random_id::<8>(),
            },
            None => Self {
                trace_id: random_id::<16>(),
                parent_span_id: None,
                span_id: random_id::<8>(),
            },
        }
    }

    #[must_use]
    pub fn header_value(&self) -> String {
        format!("{}.{}", self.trace_id, self.span_id)
    }
}

fn random_id<const N: usize>() -> String {
    hex::encode(rand::random::<[u8; N]>())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionKey {
    pub subscription_id: String,
    pub boundary_id: String,
    pub function_id: String,
}

impl From<&FunctionTarget> for ExecutionKey {
    fn from(target: &FunctionTarget) -> Self {
        Self {
            subscription_id: target.subscription_id.clone(),
            boundary_id: target.boundary_id.clone(),
            function_id: target.function_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub method: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEvent {
    pub request_id: Option<String>,
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub span_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub request: RequestSummary,
    pub status_code: u16,
    pub target: FunctionTarget,
    pub source: ResponseSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub metrics: InvocationMetrics,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
}

/// Receives usage counts and dispatch events. Callers never wait on it.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn count_execution(&self, key: ExecutionKey);

    async fn dispatch_event(&self, event: DispatchEvent);
}

pub fn tracing_sink() -> Arc<dyn AnalyticsSink> {
    Arc::new(TracingAnalyticsSink)
}

pub struct TracingAnalyticsSink;

#[async_trait]
impl AnalyticsSink for TracingAnalyticsSink {
    async fn count_execution(&self, key: ExecutionKey) {
        tracing::info!(
            target: "analytics",
            subscription_id = %key.subscription_id,
            boundary_id = %key.boundary_id,
            function_id = %key.function_id,
            "execution counted"
        );
    }

    async fn dispatch_event(&self, event: DispatchEvent) {
        let duration_ms = (event.end_time - event.start_time).num_milliseconds();
        tracing::info!(
            target: "analytics",
            request_id = event.request_id.as_deref().unwrap_or_default(),
            trace_id = %event.trace_id,
            span_id = %event.span_id,
            account_id = %event.target.account_id,
            function_id = %event.target.function_id,
            method = %event.request.method,
            url = %event.request.url,
            status = event.status_code,
            source = event.source.as_str(),
            duration_ms,
            has_error = event.error.is_some(),
            "dispatch completed"
        );
    }
}

#[derive(Default)]
pub struct MemoryAnalyticsSink {
    executions: Mutex<Vec<ExecutionKey>>,
    events: Mutex<Vec<DispatchEvent>>,
}

impl MemoryAnalyticsSink {
    pub async fn executions(&self) -> Vec<ExecutionKey> {
        self.executions.lock().await.clone()
    }

    pub async fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl AnalyticsSink for MemoryAnalyticsSink {
    async fn count_execution(&self, key: ExecutionKey) {
        self.executions.lock().await.push(key);
    }

    async fn dispatch_event(&self, event: DispatchEvent) {
        self.events.lock().await.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::TraceContext;

    #[test]
    fn caller_trace_is_continued_under_a_new_span() {
        let trace = TraceContext::continue_from(Some("abc123.0011"));
        assert_eq!(trace.trace_id, "abc123");
        assert_eq!(trace.parent_span_id.as_deref(), Some("0011"));
        assert_eq!(trace.span_id.len(), 16);
        assert_eq!(trace.header_value(), format!("abc123.{}", trace.span_id));
    }

    #[test]
    fn malformed_or_missing_header_starts_a_trace() {
        for header in [None, Some("no-dot"), Some("zz.yy"), Some(".1")] {
            let trace = TraceContext::continue_from(header);
            assert_eq!(trace.trace_id.len(), 32);
            assert!(trace.parent_span_id.is_none());
        }
    }
}
