use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use super::compute::ComputeBackend;
use super::functions::FunctionRegistry;
use super::logs::{TailLog, parse_tail_log};
use super::redirect::RedirectClient;
use super::types::{
    Authentication, CallerContext, DispatchOutcome, FunctionResponse, FunctionSummary,
    FunctionTarget, InvocationError, InvocationOptions, PlatformContext, ResponseBody,
    ResponseSource, RouteDescriptor,
};
use crate::analytics::{
    AnalyticsSink, DispatchEvent, ExecutionKey, RequestSummary, TRACE_HEADER, TraceContext,
};
use crate::permissions::{PermissionError, PermissionResolver, ResolvedAgent};
use crate::tasks::types::{TASK_ID_HEADER, TASK_ROUTE_HEADER, TASK_SCHEDULED_AT_HEADER};
use crate::tasks::{Task, TaskConfiguration, TaskScheduler, check_not_before, create_task_id};

/// An inbound call to a function, already split out of the HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    pub target: FunctionTarget,
    pub method: String,
    /// Path below the function, always starting with `/`.
    pub path: String,
    /// Request URL below `/v1`, query included; forwarded verbatim to redirect targets.
    pub url: String,
    /// Lower-cased header names.
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Value,
    pub request_id: Option<String>,
}

#[derive(Debug)]
pub struct DispatchReport {
    pub result: Result<DispatchOutcome, InvocationError>,
    pub trace: TraceContext,
}

impl DispatchReport {
    #[must_use]
    pub fn source(&self) -> ResponseSource {
        match &self.result {
            Ok(outcome) => outcome.source(),
            Err(error) => error.source(),
        }
    }

    #[must_use]
    pub fn status_code(&self) -> u16 {
        match &self.result {
            Ok(outcome) => outcome.status_code(),
            Err(error) => error.status(),
        }
    }
}

pub struct DispatcherSettings {
    pub public_base_url: String,
    pub realtime_logs_enabled: bool,
}

pub struct InvocationDispatcher {
    functions: Arc<dyn FunctionRegistry>,
    permissions: Arc<PermissionResolver>,
    scheduler: Arc<TaskScheduler>,
    compute: Arc<dyn ComputeBackend>,
    redirect: Arc<RedirectClient>,
    analytics: Arc<dyn AnalyticsSink>,
    settings: DispatcherSettings,
}

impl InvocationDispatcher {
    pub fn new(
        functions: Arc<dyn FunctionRegistry>,
        permissions: Arc<PermissionResolver>,
        scheduler: Arc<TaskScheduler>,
        compute: Arc<dyn ComputeBackend>,
        redirect: Arc<RedirectClient>,
        analytics: Arc<dyn AnalyticsSink>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            functions,
            permissions,
            scheduler,
            compute,
            redirect,
            analytics,
            settings,
        }
    }

    /// Runs one invocation and reports the outcome. Usage counting and the
    /// analytics event are spawned and never delay the caller.
    pub async fn dispatch(&self, request: InvocationRequest) -> DispatchReport {
        let started = Utc::now();
        let result = self.run(&request).await;
        self.finish(&request, result, started)
    }

    /// Reports a request refused before it reached any execution strategy.
    /// It is counted and recorded like every other dispatch.
    pub fn reject(&self, request: &InvocationRequest, error: InvocationError) -> DispatchReport {
        self.finish(request, Err(error), Utc::now())
    }

    fn finish(
        &self,
        request: &InvocationRequest,
        result: Result<DispatchOutcome, InvocationError>,
        started: DateTime<Utc>,
    ) -> DispatchReport {
        let trace =
            TraceContext::continue_from(request.headers.get(TRACE_HEADER).map(String::as_str));
        let report = DispatchReport { result, trace };

        match &report.result {
            Ok(outcome) => info!(
                account_id = %request.target.account_id,
                function_id = %request.target.function_id,
                status = outcome.status_code(),
                source = outcome.source().as_str(),
                "dispatch completed"
            ),
            Err(failure) if failure.source() == ResponseSource::Proxy && failure.status() >= 500 => {
                error!(
                    reason_code = %failure.code(),
                    account_id = %request.target.account_id,
                    function_id = %request.target.function_id,
                    error = %failure,
                    "dispatch failed"
                );
            }
            Err(failure) => warn!(
                reason_code = %failure.code(),
                account_id = %request.target.account_id,
                function_id = %request.target.function_id,
                status = failure.status(),
                source = failure.source().as_str(),
                "dispatch failed"
            ),
        }

        self.emit(request, &report, started);
        report
    }

    fn emit(&self, request: &InvocationRequest, report: &DispatchReport, started: DateTime<Utc>) {
        let (metrics, logs) = match &report.result {
            Ok(DispatchOutcome::Direct { metrics, logs, .. })
            | Err(InvocationError::FunctionFailed { metrics, logs, .. }) => {
                (*metrics, logs.clone())
            }
            _ => Default::default(),
        };
        let error = report.result.as_ref().err().map(|failure| {
            failure
                .detail()
                .unwrap_or_else(|| json!({"code": failure.code(), "message": failure.to_string()}))
        });
        let event = DispatchEvent {
            request_id: request.request_id.clone(),
            trace_id: report.trace.trace_id.clone(),
            parent_span_id: report.trace.parent_span_id.clone(),
            span_id: report.trace.span_id.clone(),
            start_time: started,
            end_time: Utc::now(),
            request: RequestSummary {
                method: request.method.clone(),
                url: request.url.clone(),
            },
            status_code: report.status_code(),
            target: request.target.clone(),
            source: report.source(),
            error,
            metrics,
            logs,
        };
        let key = ExecutionKey::from(&request.target);
        let analytics = self.analytics.clone();
        tokio::spawn(async move {
            analytics.count_execution(key).await;
            analytics.dispatch_event(event).await;
        });
    }

    async fn run(&self, request: &InvocationRequest) -> Result<DispatchOutcome, InvocationError> {
        let target = &request.target;
        let summary = self
            .functions
            .get_summary(target)
            .await?
            .ok_or_else(|| InvocationError::FunctionNotFound(target.clone()))?;
        let route = summary.match_route(&request.path);

        let caller = self.authorize(request, &summary).await?;
        let options = self.build_options(request, &summary, caller.as_ref());

        let task_route = route
            .filter(|_| request.method.eq_ignore_ascii_case("POST"))
            .and_then(|route| route.task.as_ref().map(|config| (route, config)));
        if let Some((route, config)) = task_route {
            return self.schedule(route, config, options).await;
        }

        let payload = serde_json::to_value(&options)
            .map_err(|error| InvocationError::InvalidPayload(error.to_string()))?;
        match summary.redirect_url.as_deref() {
            Some(redirect_url) => {
                let timeout = Duration::from_secs(summary.compute_timeout_seconds);
                let redirected = self
                    .redirect
                    .invoke(redirect_url, &request.url, &payload, timeout)
                    .await?;
                Ok(DispatchOutcome::Redirect {
                    response: function_response(&redirected.payload)?,
                    duration_ms: redirected.duration_ms,
                })
            }
            None => self.invoke_direct(target, &summary, &payload).await,
        }
    }

    /// Applies the function's authentication mode, then every authorization
    /// template, each check audited.
    async fn authorize(
        &self,
        request: &InvocationRequest,
        summary: &FunctionSummary,
    ) -> Result<Option<(ResolvedAgent, String)>, InvocationError> {
        let target = &request.target;
        let header = request.headers.get("authorization").map(String::as_str);
        let caller = match (summary.security.authentication, header) {
            (Authentication::None, _) | (Authentication::Optional, None) => None,
            (_, header) => {
                let token = PermissionResolver::extract_bearer_token(header)?;
                let agent = self
                    .permissions
                    .resolve(&target.account_id, token, false)
                    .await?;
                Some((agent, token.to_string()))
            }
        };

        if summary.security.authorization.is_empty() {
            return Ok(caller);
        }
        let Some((agent, _)) = caller.as_ref() else {
            return Err(PermissionError::MissingCredential.into());
        };
        for entry in &summary.security.authorization {
            agent
                .ensure_authorized(
                    &target.render_template(&entry.action),
                    &target.render_template(&entry.resource),
                )
                .await?;
        }
        Ok(caller)
    }

    fn build_options(
        &self,
        request: &InvocationRequest,
        summary: &FunctionSummary,
        caller: Option<&(ResolvedAgent, String)>,
    ) -> InvocationOptions {
        let caller = caller.map_or_else(CallerContext::default, |(agent, token)| CallerContext {
            permissions: Some(agent.access().clone()),
            caller_access_token: Some(token.clone()),
        });
        InvocationOptions {
            target: request.target.clone(),
            path: request.path.clone(),
            method: request.method.clone(),
            body: request.body.clone(),
            headers: request.headers.clone(),
            query: request.query.clone(),
            platform: PlatformContext {
                function_access_token: summary.function_access_token.clone(),
                endpoint: self.settings.public_base_url.clone(),
            },
            caller,
        }
    }

    async fn schedule(
        &self,
        route: &RouteDescriptor,
        config: &TaskConfiguration,
        mut options: InvocationOptions,
    ) -> Result<DispatchOutcome, InvocationError> {
        let scheduled_at = Utc::now();
        check_not_before(&options.headers, scheduled_at)?;
        self.scheduler.admit(config).await?;

        let task_id = create_task_id();
        options
            .headers
            .insert(TASK_ID_HEADER.to_string(), task_id.clone());
        options
            .headers
            .insert(TASK_ROUTE_HEADER.to_string(), route.path.clone());
        options.headers.insert(
            TASK_SCHEDULED_AT_HEADER.to_string(),
            scheduled_at.timestamp_millis().to_string(),
        );
        let location = format!(
            "{}{}/task/{task_id}",
            self.settings.public_base_url,
            options.target.api_path()
        );
        let task = Task {
            task_id,
            scheduled_at,
            matching_route_path: route.path.clone(),
            ctx: options,
        };
        let status = self.scheduler.schedule(config, &task).await?;
        Ok(DispatchOutcome::Task { status, location })
    }

    async fn invoke_direct(
        &self,
        target: &FunctionTarget,
        summary: &FunctionSummary,
        payload: &Value,
    ) -> Result<DispatchOutcome, InvocationError> {
        let invocation = self.compute.invoke(&target.compute_name(), payload).await?;
        let collect = summary.persist_logs || !self.settings.realtime_logs_enabled;
        let tail = invocation
            .log_result
            .as_deref()
            .map(|encoded| parse_tail_log(encoded, collect))
            .unwrap_or_default();

        let body = if invocation.payload.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&invocation.payload)
                .map_err(|error| InvocationError::InvalidPayload(error.to_string()))?
        };
        if invocation.function_error.is_some() {
            return Err(function_failure(&body, tail));
        }
        let TailLog { lines, metrics } = tail;
        Ok(DispatchOutcome::Direct {
            response: function_response(&body)?,
            logs: lines,
            metrics,
        })
    }
}

/// Classifies a provider-reported function error; "timed out" marks an
/// infrastructure timeout rather than an application failure. The tail log
/// travels with the failure so the analytics event keeps its metrics.
fn function_failure(payload: &Value, tail: TailLog) -> InvocationError {
    let text = |name: &str| payload.get(name).and_then(Value::as_str).map(ToString::to_string);
    let message = text("errorMessage")
        .or_else(|| text("message"))
        .unwrap_or_default();
    let stack = match payload.get("trace").or_else(|| payload.get("stack")) {
        Some(Value::Array(frames)) => Some(
            frames
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        Some(Value::String(stack)) => Some(stack.clone()),
        _ => None,
    };
    InvocationError::FunctionFailed {
        error_type: text("errorType"),
        timed_out: message.contains("timed out"),
        message,
        stack,
        logs: tail.lines,
        metrics: tail.metrics,
    }
}

/// Reads the `{status, headers, body, bodyEncoding}` shape functions reply with.
pub fn function_response(payload: &Value) -> Result<FunctionResponse, InvocationError> {
    let object = match payload {
        Value::Null => {
            return Ok(FunctionResponse {
                status: 200,
                headers: BTreeMap::new(),
                body: ResponseBody::Empty,
            });
        }
        Value::Object(object) => object,
        other => {
            return Err(InvocationError::InvalidPayload(format!(
                "expected an object, got {other}"
            )));
        }
    };

    let status = object
        .get("status")
        .and_then(Value::as_u64)
        .and_then(|status| u16::try_from(status).ok())
        .filter(|status| (100..=599).contains(status))
        .unwrap_or(200);

    let headers = object
        .get("headers")
        .and_then(Value::as_object)
        .map(|headers| {
            headers
                .iter()
                .map(|(name, value)| {
                    let value = value
                        .as_str()
                        .map_or_else(|| value.to_string(), ToString::to_string);
                    (name.to_ascii_lowercase(), value)
                })
                .collect()
        })
        .unwrap_or_default();

    let encoding = object.get("bodyEncoding").and_then(Value::as_str);
    let body = match (object.get("body"), encoding) {
        (None | Some(Value::Null), _) => ResponseBody::Empty,
        (Some(Value::String(text)), Some("base64")) => {
            ResponseBody::Bytes(STANDARD.decode(text).map_err(|error| {
                InvocationError::InvalidPayload(format!("body is not base64: {error}"))
            })?)
        }
        (Some(Value::String(text)), Some(_)) => ResponseBody::Text(text.clone()),
        (Some(value), _) => ResponseBody::Json(value.clone()),
    };

    Ok(FunctionResponse {
        status,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{function_failure, function_response};
    use crate::dispatch::logs::TailLog;
    use crate::dispatch::types::{InvocationError, InvocationMetrics, ResponseBody};

    #[test]
    fn function_payload_shapes_the_response() -> anyhow::Result<()> {
        let response = function_response(&json!({
            "status": 201,
            "headers": {"X-Custom": "yes", "x-count": 3},
            "body": {"ok": true},
        }))?;
        assert_eq!(response.status, 201);
        assert_eq!(response.headers.get("x-custom").map(String::as_str), Some("yes"));
        assert_eq!(response.headers.get("x-count").map(String::as_str), Some("3"));
        assert_eq!(response.body, ResponseBody::Json(json!({"ok": true})));

        let text = function_response(&json!({"body": "<p>hi</p>", "bodyEncoding": "utf8"}))?;
        assert_eq!(text.status, 200);
        assert_eq!(text.body, ResponseBody::Text("<p>hi</p>".to_string()));

        let bytes = function_response(&json!({"body": "aGk=", "bodyEncoding": "base64"}))?;
        assert_eq!(bytes.body, ResponseBody::Bytes(b"hi".to_vec()));

        assert_eq!(function_response(&json!(null))?.body, ResponseBody::Empty);
        assert!(function_response(&json!([1, 2])).is_err());
        Ok(())
    }

    #[test]
    fn provider_timeouts_are_distinguished() -> anyhow::Result<()> {
        let tail = TailLog {
            lines: vec!["working".to_string()],
            metrics: InvocationMetrics {
                duration_ms: Some(30_030.5),
                max_memory_mb: Some(128),
            },
        };
        let timeout = function_failure(
            &json!({
                "errorMessage": "2024-01-01T00:00:00Z 8f5 Task timed out after 30.03 seconds",
            }),
            tail,
        );
        assert_eq!(timeout.status(), 522);

        let InvocationError::FunctionFailed { logs, metrics, .. } = &timeout else {
            anyhow::bail!("unexpected classification: {timeout:?}");
        };
        assert_eq!(logs, &vec!["working".to_string()]);
        assert_eq!(metrics.duration_ms, Some(30_030.5));

        let failure = function_failure(
            &json!({
                "errorType": "TypeError",
                "errorMessage": "x is undefined",
                "trace": ["TypeError: x is undefined", "    at handler"],
            }),
            TailLog::default(),
        );
        assert_eq!(failure.status(), 500);
        let InvocationError::FunctionFailed {
            error_type, stack, ..
        } = &failure
        else {
            anyhow::bail!("unexpected classification: {failure:?}");
        };
        assert_eq!(error_type.as_deref(), Some("TypeError"));
        assert_eq!(
            stack.as_deref(),
            Some("TypeError: x is undefined\n    at handler")
        );
        Ok(())
    }
}
