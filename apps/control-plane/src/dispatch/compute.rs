use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tokio::sync::Mutex;

pub const FUNCTION_ERROR_HEADER: &str = "x-amz-function-error";
pub const LOG_RESULT_HEADER: &str = "x-amz-log-result";
pub const ERROR_TYPE_HEADER: &str = "x-amzn-errortype";
const DEFAULT_ERROR_CODE: &str = "ServiceException";

/// Raw result of a synchronous invocation, before any classification.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeInvocation {
    pub status_code: u16,
    pub payload: Vec<u8>,
    pub log_result: Option<String>,
    pub function_error: Option<String>,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ComputeError {
    /// The backend refused the call; `code` keeps the provider's spelling.
    #[error("{code}: {message}")]
    Service { code: String, message: String },
    #[error("compute backend unreachable: {0}")]
    Transport(String),
}

impl ComputeError {
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Service { code, .. } => code,
            Self::Transport(_) => "compute_unreachable",
        }
    }
}

#[async_trait]
pub trait ComputeBackend: Send + Sync {
    async fn invoke(&self, name: &str, payload: &Value) -> Result<ComputeInvocation, ComputeError>;
}

/// Speaks the Lambda Invoke HTTP API against a configurable base URL.
///
/// Only connection setup is bounded. A running invocation ends when the
/// backend enforces the function's own timeout and reports it.
pub struct HttpComputeBackend {
    http: reqwest::Client,
    base_url: String,
}

impl HttpComputeBackend {
    pub fn new(
        base_url: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

fn service_error(headers: &HeaderMap, body: &[u8]) -> ComputeError {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    let field = |names: &[&str]| {
        parsed.as_ref().and_then(|value| {
            names
                .iter()
                .find_map(|name| value.get(*name).and_then(Value::as_str))
                .map(ToString::to_string)
        })
    };
    let code = header_value(headers, ERROR_TYPE_HEADER)
        .map(|value| value.split(':').next().unwrap_or_default().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| field(&["__type", "Type", "code"]))
        .unwrap_or_else(|| DEFAULT_ERROR_CODE.to_string());
    let message = field(&["message", "Message"])
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
    ComputeError::Service { code, message }
}

#[async_trait]
impl ComputeBackend for HttpComputeBackend {
    async fn invoke(&self, name: &str, payload: &Value) -> Result<ComputeInvocation, ComputeError> {
        let url = format!("{}/2015-03-31/functions/{name}/invocations", self.base_url);
        let response = self
            .http
            .post(url)
            .header("X-Amz-Invocation-Type", "RequestResponse")
            .header("X-Amz-Log-Type", "Tail")
            .json(payload)
            .send()
            .await
            .map_err(|error| ComputeError::Transport(error.to_string()))?;

        let status_code = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|error| ComputeError::Transport(error.to_string()))?;

        if !(200..300).contains(&status_code) {
            return Err(service_error(&headers, &body));
        }
        Ok(ComputeInvocation {
            status_code,
            payload: body.to_vec(),
            log_result: header_value(&headers, LOG_RESULT_HEADER),
            function_error: header_value(&headers, FUNCTION_ERROR_HEADER),
        })
    }
}

type Handler =
    Arc<dyn Fn(&Value) -> Result<ComputeInvocation, ComputeError> + Send + Sync + 'static>;

pub fn memory() -> Arc<MemoryComputeBackend> {
    Arc::new(MemoryComputeBackend::default())
}

/// Functions registered as closures; unknown names fail like a missing deployment.
#[derive(Default)]
pub struct MemoryComputeBackend {
    handlers: Mutex<HashMap<String, Handler>>,
    invocations: Mutex<Vec<(String, Value)>>,
}

impl MemoryComputeBackend {
    pub async fn register(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&Value) -> Result<ComputeInvocation, ComputeError> + Send + Sync + 'static,
    ) {
        self.handlers
            .lock()
            .await
            .insert(name.into(), Arc::new(handler));
    }

    pub async fn invocations(&self) -> Vec<(String, Value)> {
        self.invocations.lock().await.clone()
    }
}

#[async_trait]
impl ComputeBackend for MemoryComputeBackend {
    async fn invoke(&self, name: &str, payload: &Value) -> Result<ComputeInvocation, ComputeError> {
        self.invocations
            .lock()
            .await
            .push((name.to_string(), payload.clone()));
        let handler = self.handlers.lock().await.get(name).cloned();
        match handler {
            Some(handler) => handler(payload),
            None => Err(ComputeError::Service {
                code: super::types::RESOURCE_NOT_FOUND.to_string(),
                message: format!("function not found: {name}"),
            }),
        }
    }
}
