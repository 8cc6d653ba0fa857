use std::collections::BTreeMap;

use fx_access_policy::{AccessEntry, AccessGrants};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use super::compute::ComputeError;
use super::functions::FunctionRegistryError;
use super::redirect::RedirectError;
use crate::permissions::PermissionError;
use crate::tasks::{TaskConfiguration, TaskError, TaskStatus};

/// The four ids that address a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionTarget {
    pub account_id: String,
    pub subscription_id: String,
    pub boundary_id: String,
    pub function_id: String,
}

impl FunctionTarget {
    #[must_use]
    pub fn new(
        account_id: impl Into<String>,
        subscription_id: impl Into<String>,
        boundary_id: impl Into<String>,
        function_id: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            subscription_id: subscription_id.into(),
            boundary_id: boundary_id.into(),
            function_id: function_id.into(),
        }
    }

    /// Resource path used for authorization checks against this function.
    #[must_use]
    pub fn resource(&self) -> String {
        format!(
            "/account/{}/subscription/{}/boundary/{}/function/{}/",
            self.account_id, self.subscription_id, self.boundary_id, self.function_id
        )
    }

    /// Name under which the compute backend knows this function.
    #[must_use]
    pub fn compute_name(&self) -> String {
        let description = format!(
            "function:{}:{}:{}",
            self.subscription_id, self.boundary_id, self.function_id
        );
        hex::encode(Sha256::digest(description.as_bytes()))
    }

    #[must_use]
    pub fn api_path(&self) -> String {
        format!(
            "/v1/account/{}/subscription/{}/boundary/{}/function/{}",
            self.account_id, self.subscription_id, self.boundary_id, self.function_id
        )
    }

    #[must_use]
    pub fn run_path(&self) -> String {
        format!(
            "/v1/run/{}/{}/{}/{}",
            self.account_id, self.subscription_id, self.boundary_id, self.function_id
        )
    }

    /// Expands `{{accountId}}`-style placeholders in an authorization template.
    #[must_use]
    pub fn render_template(&self, template: &str) -> String {
        template
            .replace("{{accountId}}", &self.account_id)
            .replace("{{subscriptionId}}", &self.subscription_id)
            .replace("{{boundaryId}}", &self.boundary_id)
            .replace("{{functionId}}", &self.function_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_access_token: Option<String>,
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<AccessGrants>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_access_token: Option<String>,
}

/// The envelope handed to a function, whether it runs now or later as a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationOptions {
    #[serde(flatten)]
    pub target: FunctionTarget,
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(rename = "fusebit")]
    pub platform: PlatformContext,
    #[serde(default)]
    pub caller: CallerContext,
}

impl InvocationOptions {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDescriptor {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskConfiguration>,
}

impl RouteDescriptor {
    fn covers(&self, path: &str) -> bool {
        let route = self.path.trim_end_matches('/');
        route.is_empty()
            || path == route
            || path
                .strip_prefix(route)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Authentication {
    #[default]
    None,
    Optional,
    Required,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSecurity {
    #[serde(default)]
    pub authentication: Authentication,
    #[serde(default)]
    pub authorization: Vec<AccessEntry>,
}

const fn default_compute_timeout_seconds() -> u64 {
    30
}

/// What the dispatcher needs to know about a deployed function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(default = "default_compute_timeout_seconds")]
    pub compute_timeout_seconds: u64,
    #[serde(default)]
    pub persist_logs: bool,
    #[serde(default)]
    pub routes: Vec<RouteDescriptor>,
    #[serde(default)]
    pub security: FunctionSecurity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_access_token: Option<String>,
}

impl Default for FunctionSummary {
    fn default() -> Self {
        Self {
            redirect_url: None,
            compute_timeout_seconds: default_compute_timeout_seconds(),
            persist_logs: false,
            routes: Vec::new(),
            security: FunctionSecurity::default(),
            function_access_token: None,
        }
    }
}

impl FunctionSummary {
    /// Longest declared route covering `path`.
    #[must_use]
    pub fn match_route(&self, path: &str) -> Option<&RouteDescriptor> {
        self.routes
            .iter()
            .filter(|route| route.covers(path))
            .max_by_key(|route| route.path.trim_end_matches('/').len())
    }

    pub fn task_routes(&self) -> impl Iterator<Item = (&RouteDescriptor, &TaskConfiguration)> {
        self.routes
            .iter()
            .filter_map(|route| route.task.as_ref().map(|task| (route, task)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    Proxy,
    Provider,
    Function,
    Redirect,
}

impl ResponseSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Provider => "provider",
            Self::Function => "function",
            Self::Redirect => "redirect",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
}

/// One variant per execution strategy, each carrying only what that strategy produces.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Direct {
        response: FunctionResponse,
        logs: Vec<String>,
        metrics: InvocationMetrics,
    },
    Redirect {
        response: FunctionResponse,
        duration_ms: u64,
    },
    Task {
        status: TaskStatus,
        location: String,
    },
}

impl DispatchOutcome {
    #[must_use]
    pub fn source(&self) -> ResponseSource {
        match self {
            Self::Direct { .. } => ResponseSource::Function,
            Self::Redirect { .. } => ResponseSource::Redirect,
            Self::Task { .. } => ResponseSource::Proxy,
        }
    }

    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Direct { response, .. } | Self::Redirect { response, .. } => response.status,
            Self::Task { .. } => 202,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("function {} not found", .0.function_id)]
    FunctionNotFound(FunctionTarget),
    #[error("malformed request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Registry(#[from] FunctionRegistryError),
    #[error("{code}: {message}")]
    Upstream { code: String, message: String },
    #[error("function failed: {message}")]
    FunctionFailed {
        error_type: Option<String>,
        message: String,
        stack: Option<String>,
        timed_out: bool,
        logs: Vec<String>,
        metrics: InvocationMetrics,
    },
    #[error("function returned an unreadable payload: {0}")]
    InvalidPayload(String),
    #[error("redirect target responded with {status}")]
    RedirectStatus { status: u16, body: Value },
    #[error("redirect transport failure: {message}")]
    RedirectTransport { message: String },
}

pub const RESOURCE_NOT_FOUND: &str = "ResourceNotFoundException";
pub const TOO_MANY_REQUESTS: &str = "TooManyRequestsException";
pub const TOO_LARGE_DELAY: &str = "TooLargeDelayException";

impl InvocationError {
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::FunctionNotFound(_) => 404,
            Self::InvalidRequest(_) => 400,
            Self::Permission(error) if error.is_unauthenticated() => 401,
            Self::Permission(
                PermissionError::UnresolvedAgent { .. } | PermissionError::Unauthorized { .. },
            ) => 403,
            Self::Permission(_) => 500,
            Self::Task(error) => error.status(),
            Self::Registry(_) => 500,
            Self::Upstream { code, .. } => match code.as_str() {
                RESOURCE_NOT_FOUND => 404,
                TOO_MANY_REQUESTS => 503,
                TOO_LARGE_DELAY => 400,
                _ => 500,
            },
            Self::FunctionFailed { timed_out: true, .. } => 522,
            Self::FunctionFailed { .. } | Self::InvalidPayload(_) => 500,
            Self::RedirectStatus { .. } => 404,
            Self::RedirectTransport { .. } => 502,
        }
    }

    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::FunctionNotFound(_) => "not_found".to_string(),
            Self::InvalidRequest(_) => "invalid_request".to_string(),
            Self::Permission(error) => error.code().to_string(),
            Self::Task(error) => error.code().to_string(),
            Self::Registry(_) => "function_registry_unavailable".to_string(),
            Self::Upstream { code, .. } => code.clone(),
            Self::FunctionFailed { timed_out: true, .. } => "function_timeout".to_string(),
            Self::FunctionFailed { .. } => "function_error".to_string(),
            Self::InvalidPayload(_) => "invalid_payload".to_string(),
            Self::RedirectStatus { .. } => RESOURCE_NOT_FOUND.to_string(),
            Self::RedirectTransport { .. } => "transport_error".to_string(),
        }
    }

    #[must_use]
    pub fn source(&self) -> ResponseSource {
        match self {
            Self::FunctionNotFound(_)
            | Self::InvalidRequest(_)
            | Self::Permission(_)
            | Self::Task(_)
            | Self::Registry(_)
            | Self::Upstream { .. }
            | Self::InvalidPayload(_) => ResponseSource::Proxy,
            Self::FunctionFailed { .. } => ResponseSource::Provider,
            Self::RedirectStatus { .. } | Self::RedirectTransport { .. } => ResponseSource::Redirect,
        }
    }

    /// Client-visible detail beyond `{code, message}`.
    #[must_use]
    pub fn detail(&self) -> Option<Value> {
        match self {
            Self::FunctionFailed {
                error_type,
                message,
                stack,
                ..
            } => Some(json!({
                "errorType": error_type,
                "errorMessage": message,
                "stack": stack,
            })),
            Self::RedirectStatus { status, body } => Some(json!({
                "mode": "redirect",
                "status": status,
                "body": body,
            })),
            _ => None,
        }
    }
}

impl From<ComputeError> for InvocationError {
    fn from(error: ComputeError) -> Self {
        let code = error.code().to_string();
        let message = match error {
            ComputeError::Service { message, .. } => message,
            ComputeError::Transport(message) => message,
        };
        Self::Upstream { code, message }
    }
}

impl From<RedirectError> for InvocationError {
    fn from(error: RedirectError) -> Self {
        match error {
            RedirectError::Status { status, body } => Self::RedirectStatus { status, body },
            transport @ RedirectError::Transport { .. } => Self::RedirectTransport {
                message: transport.to_string(),
            },
        }
    }
}
