use std::{collections::BTreeMap, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::{
    analytics::{RESPONSE_SOURCE_HEADER, TRACE_HEADER},
    api_envelope::{ApiErrorCode, error_response_with_detail},
    config::Config,
    dispatch::{
        DispatchOutcome, DispatchReport, FunctionRegistry, FunctionRegistryError,
        FunctionTarget, InvocationDispatcher, InvocationError, InvocationRequest, ResponseBody,
        types::{FunctionResponse, RESOURCE_NOT_FOUND, TOO_LARGE_DELAY, TOO_MANY_REQUESTS},
    },
    permissions::{PermissionError, PermissionResolver, ResolvedAgent},
    tasks::{TaskError, TaskScheduler, TaskState, TaskStatistics, TaskStatus, TaskStatusUpdate},
};

pub const LOGS_HEADER: &str = "x-fx-logs";

const HOP_BY_HOP_HEADERS: [&str; 4] = [
    "connection",
    "content-length",
    "keep-alive",
    "transfer-encoding",
];

#[derive(Clone)]
pub struct AppState {
    config: Config,
    dispatcher: Arc<InvocationDispatcher>,
    permissions: Arc<PermissionResolver>,
    scheduler: Arc<TaskScheduler>,
    functions: Arc<dyn FunctionRegistry>,
    started_at: chrono::DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        dispatcher: Arc<InvocationDispatcher>,
        permissions: Arc<PermissionResolver>,
        scheduler: Arc<TaskScheduler>,
        functions: Arc<dyn FunctionRegistry>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            permissions,
            scheduler,
            functions,
            started_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    build_sha: String,
    uptime_seconds: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionPathParams {
    account_id: String,
    subscription_id: String,
    boundary_id: String,
    function_id: String,
}

impl FunctionPathParams {
    fn target(&self) -> FunctionTarget {
        FunctionTarget::new(
            &self.account_id,
            &self.subscription_id,
            &self.boundary_id,
            &self.function_id,
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionSubPathParams {
    account_id: String,
    subscription_id: String,
    boundary_id: String,
    function_id: String,
    path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskPathParams {
    account_id: String,
    subscription_id: String,
    boundary_id: String,
    function_id: String,
    task_id: String,
}

impl TaskPathParams {
    fn target(&self) -> FunctionTarget {
        FunctionTarget::new(
            &self.account_id,
            &self.subscription_id,
            &self.boundary_id,
            &self.function_id,
        )
    }
}

#[derive(Debug, Deserialize)]
struct TaskStatusReport {
    status: TaskState,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    output: Option<Value>,
}

#[derive(Debug, Serialize)]
struct RouteTaskStatistics {
    stats: TaskStatistics,
}

#[derive(Debug, Serialize)]
struct RouteStatistics {
    path: String,
    task: RouteTaskStatistics,
}

#[derive(Debug, Serialize)]
struct TaskStatisticsResponse {
    routes: Vec<RouteStatistics>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route(
            "/v1/run/:accountId/:subscriptionId/:boundaryId/:functionId",
            any(run_function),
        )
        .route(
            "/v1/run/:accountId/:subscriptionId/:boundaryId/:functionId/*path",
            any(run_function_path),
        )
        .route(
            "/v1/account/:accountId/subscription/:subscriptionId/boundary/:boundaryId/function/:functionId/task/:taskId",
            get(get_task_status),
        )
        .route(
            "/v1/account/:accountId/subscription/:subscriptionId/boundary/:boundaryId/function/:functionId/task-statistics",
            get(get_task_statistics),
        )
        .route(
            "/internal/v1/account/:accountId/subscription/:subscriptionId/boundary/:boundaryId/function/:functionId/task/:taskId/status",
            post(report_task_status),
        )
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name,
        build_sha: state.config.build_sha,
        uptime_seconds,
    })
}

async fn run_function(
    State(state): State<AppState>,
    Path(params): Path<FunctionPathParams>,
    query: Option<Query<BTreeMap<String, String>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let call = IncomingCall {
        target: params.target(),
        path: "/".to_string(),
        query: query.map(|Query(query)| query).unwrap_or_default(),
        method,
        uri,
        headers,
        body,
    };
    run(state, call).await
}

async fn run_function_path(
    State(state): State<AppState>,
    Path(params): Path<FunctionSubPathParams>,
    query: Option<Query<BTreeMap<String, String>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let call = IncomingCall {
        target: FunctionTarget::new(
            params.account_id,
            params.subscription_id,
            params.boundary_id,
            params.function_id,
        ),
        path: format!("/{}", params.path.trim_start_matches('/')),
        query: query.map(|Query(query)| query).unwrap_or_default(),
        method,
        uri,
        headers,
        body,
    };
    run(state, call).await
}

struct IncomingCall {
    target: FunctionTarget,
    path: String,
    query: BTreeMap<String, String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

async fn run(state: AppState, call: IncomingCall) -> Response {
    let (body, malformed) = match request_body(&call.headers, &call.body) {
        Ok(body) => (body, None),
        Err(message) => (Value::Null, Some(message)),
    };
    let url = call
        .uri
        .path_and_query()
        .map_or_else(|| call.uri.path(), |value| value.as_str());
    let headers = lowercase_headers(&call.headers);
    let request = InvocationRequest {
        request_id: headers.get("x-request-id").cloned(),
        target: call.target,
        method: call.method.as_str().to_string(),
        path: call.path,
        url: url.strip_prefix("/v1").unwrap_or(url).to_string(),
        headers,
        query: call.query,
        body,
    };
    let report = match malformed {
        Some(message) => state
            .dispatcher
            .reject(&request, InvocationError::InvalidRequest(message)),
        None => state.dispatcher.dispatch(request).await,
    };
    dispatch_response(report)
}

/// JSON bodies are parsed, anything else reaches the function as a string.
fn request_body(headers: &HeaderMap, bytes: &[u8]) -> Result<Value, String> {
    if bytes.is_empty() {
        return Ok(json!({}));
    }
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("json"));
    if is_json {
        serde_json::from_slice(bytes)
            .map_err(|error| format!("malformed JSON body: {error}"))
    } else {
        Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
    }
}

fn lowercase_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}

fn dispatch_response(report: DispatchReport) -> Response {
    let source = report.source();
    let trace = report.trace.header_value();
    let mut response = match report.result {
        Ok(DispatchOutcome::Direct { response, logs, .. }) => {
            let mut http = function_http_response(response);
            if !logs.is_empty() {
                let encoded = STANDARD.encode(logs.join("\n"));
                if let Ok(value) = HeaderValue::from_str(&encoded) {
                    http.headers_mut().insert(LOGS_HEADER, value);
                }
            }
            http
        }
        Ok(DispatchOutcome::Redirect { response, .. }) => function_http_response(response),
        Ok(DispatchOutcome::Task { status, location }) => {
            let mut http = (StatusCode::ACCEPTED, Json(status)).into_response();
            if let Ok(value) = HeaderValue::from_str(&location) {
                http.headers_mut().insert(header::LOCATION, value);
            }
            http
        }
        Err(error) => ApiError::Invocation(error).into_response(),
    };

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&trace) {
        headers.insert(TRACE_HEADER, value);
    }
    headers.insert(
        RESPONSE_SOURCE_HEADER,
        HeaderValue::from_static(source.as_str()),
    );
    response
}

fn function_http_response(response: FunctionResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
    let mut http = match response.body {
        ResponseBody::Empty => status.into_response(),
        ResponseBody::Json(value) => (status, Json(value)).into_response(),
        ResponseBody::Text(text) => (status, text).into_response(),
        ResponseBody::Bytes(bytes) => (status, bytes).into_response(),
    };
    for (name, value) in response.headers {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            http.headers_mut().insert(name, value);
        }
    }
    http
}

async fn authenticate(
    state: &AppState,
    account_id: &str,
    headers: &HeaderMap,
) -> Result<ResolvedAgent, ApiError> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let token = PermissionResolver::extract_bearer_token(header)?;
    Ok(state.permissions.resolve(account_id, token, false).await?)
}

async fn get_task_status(
    State(state): State<AppState>,
    Path(params): Path<TaskPathParams>,
    headers: HeaderMap,
) -> Result<Json<TaskStatus>, ApiError> {
    let target = params.target();
    let caller = authenticate(&state, &target.account_id, &headers).await?;
    caller
        .ensure_authorized("function:get", &target.resource())
        .await?;
    let status = state
        .scheduler
        .get_task(&target, &params.task_id)
        .await?
        .ok_or(TaskError::NotFound {
            task_id: params.task_id,
        })?;
    Ok(Json(status))
}

async fn get_task_statistics(
    State(state): State<AppState>,
    Path(params): Path<FunctionPathParams>,
    headers: HeaderMap,
) -> Result<Json<TaskStatisticsResponse>, ApiError> {
    let target = params.target();
    let caller = authenticate(&state, &target.account_id, &headers).await?;
    caller
        .ensure_authorized("function:get", &target.resource())
        .await?;
    let summary = state
        .functions
        .get_summary(&target)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("function {} not found", target.function_id)))?;

    let lookups = summary.task_routes().map(|(route, config)| {
        let scheduler = state.scheduler.clone();
        let path = route.path.clone();
        let queue = config.queue.clone();
        async move {
            let stats = scheduler.get_task_statistics(&queue).await?;
            Ok::<_, TaskError>(RouteStatistics {
                path,
                task: RouteTaskStatistics { stats },
            })
        }
    });
    let routes = futures::future::try_join_all(lookups).await?;
    Ok(Json(TaskStatisticsResponse { routes }))
}

/// Executor callback. Internal routes sit behind the network boundary, so the
/// caller acts as the account's root agent.
async fn report_task_status(
    State(state): State<AppState>,
    Path(params): Path<TaskPathParams>,
    Json(report): Json<TaskStatusReport>,
) -> Result<Json<TaskStatus>, ApiError> {
    let target = params.target();
    let executor = state.permissions.root(Some(&target.account_id));
    executor
        .ensure_authorized("function:execute", &target.resource())
        .await?;
    if state
        .scheduler
        .get_task(&target, &params.task_id)
        .await?
        .is_none()
    {
        return Err(TaskError::NotFound {
            task_id: params.task_id,
        }
        .into());
    }

    let mut update = TaskStatusUpdate::new(target, params.task_id, report.status);
    update.error = report.error;
    update.output = report.output;
    Ok(Json(state.scheduler.update_task_status(update).await?))
}

#[derive(Debug)]
pub enum ApiError {
    Invocation(InvocationError),
    Permission(PermissionError),
    Task(TaskError),
    NotFound(String),
    Internal(String),
}

impl From<PermissionError> for ApiError {
    fn from(error: PermissionError) -> Self {
        Self::Permission(error)
    }
}

impl From<TaskError> for ApiError {
    fn from(error: TaskError) -> Self {
        Self::Task(error)
    }
}

impl From<FunctionRegistryError> for ApiError {
    fn from(error: FunctionRegistryError) -> Self {
        Self::Internal(error.to_string())
    }
}

fn permission_code(error: &PermissionError) -> ApiErrorCode {
    match error {
        PermissionError::MissingCredential | PermissionError::InvalidCredential(_) => {
            ApiErrorCode::InvalidCredential
        }
        PermissionError::UnknownIssuer { .. } => ApiErrorCode::UnknownIssuer,
        PermissionError::SignatureInvalid => ApiErrorCode::SignatureInvalid,
        PermissionError::UnresolvedAgent { .. } => ApiErrorCode::UnresolvedAgent,
        PermissionError::Unauthorized { .. } => ApiErrorCode::Unauthorized,
        PermissionError::KeyUnavailable(_) | PermissionError::AccountData(_) => {
            ApiErrorCode::InternalError
        }
    }
}

fn task_code(error: &TaskError) -> ApiErrorCode {
    match error {
        TaskError::InvalidScheduling => ApiErrorCode::InvalidScheduling,
        TaskError::TooManyPendingTasks => ApiErrorCode::TooManyPendingTasks,
        TaskError::NotFound { .. } => ApiErrorCode::NotFound,
        TaskError::Store(_) | TaskError::Queue(_) | TaskError::Serialization(_) => {
            ApiErrorCode::InternalError
        }
    }
}

fn invocation_code(error: &InvocationError) -> ApiErrorCode {
    match error {
        InvocationError::FunctionNotFound(_) => ApiErrorCode::NotFound,
        InvocationError::InvalidRequest(_) => ApiErrorCode::InvalidRequest,
        InvocationError::Permission(error) => permission_code(error),
        InvocationError::Task(error) => task_code(error),
        InvocationError::Registry(_) | InvocationError::InvalidPayload(_) => {
            ApiErrorCode::InternalError
        }
        InvocationError::Upstream { code, .. } => match code.as_str() {
            RESOURCE_NOT_FOUND => ApiErrorCode::ResourceNotFoundException,
            TOO_MANY_REQUESTS => ApiErrorCode::TooManyRequestsException,
            TOO_LARGE_DELAY => ApiErrorCode::TooLargeDelayException,
            _ => ApiErrorCode::InternalError,
        },
        InvocationError::FunctionFailed {
            timed_out: true, ..
        } => ApiErrorCode::FunctionTimeout,
        InvocationError::FunctionFailed { .. } => ApiErrorCode::FunctionError,
        InvocationError::RedirectStatus { .. } => ApiErrorCode::ResourceNotFoundException,
        InvocationError::RedirectTransport { .. } => ApiErrorCode::TransportError,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, detail) = match self {
            Self::Invocation(error) => (
                StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                invocation_code(&error),
                error.to_string(),
                error.detail(),
            ),
            Self::Permission(error) => {
                let code = permission_code(&error);
                (code.default_status(), code, error.to_string(), None)
            }
            Self::Task(error) => {
                let code = task_code(&error);
                (code.default_status(), code, error.to_string(), None)
            }
            Self::NotFound(message) => (StatusCode::NOT_FOUND, ApiErrorCode::NotFound, message, None),
            Self::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiErrorCode::InternalError,
                message,
                None,
            ),
        };
        error_response_with_detail(status, code, message, detail).into_response()
    }
}
