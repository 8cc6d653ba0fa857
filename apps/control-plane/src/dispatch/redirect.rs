use std::time::{Duration, Instant};

use serde_json::Value;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum RedirectError {
    #[error("redirect target responded with {status}")]
    Status { status: u16, body: Value },
    #[error("failed to complete request to {url}: {message}")]
    Transport { url: String, message: String },
}

impl RedirectError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Status { .. } => "redirect_status",
            Self::Transport { .. } => "transport_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedirectResponse {
    pub payload: Value,
    pub duration_ms: u64,
}

/// Forwards invocation envelopes to a function's redirect target.
///
/// Redirects are never followed and every HTTP status counts as a completed
/// exchange; only a 200 is success. Each invocation is posted exactly once.
pub struct RedirectClient {
    http: reqwest::Client,
    max_response_bytes: usize,
}

impl RedirectClient {
    pub fn new(max_response_bytes: usize) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            max_response_bytes,
        })
    }

    /// Posts `payload` to `{redirect_url}/v1{request_url}` within `timeout`.
    pub async fn invoke(
        &self,
        redirect_url: &str,
        request_url: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<RedirectResponse, RedirectError> {
        let url = format!("{}/v1{request_url}", redirect_url.trim_end_matches('/'));
        let started = Instant::now();
        let payload = self.attempt(&url, payload, timeout).await?;
        Ok(RedirectResponse {
            payload,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn attempt(
        &self,
        url: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Value, RedirectError> {
        let transport = |message: String| RedirectError::Transport {
            url: url.to_string(),
            message,
        };
        if timeout.is_zero() {
            return Err(transport("deadline exceeded".to_string()));
        }

        let mut response = self
            .http
            .post(url)
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(|error| transport(error.to_string()))?;
        let status = response.status().as_u16();

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|error| transport(error.to_string()))?
        {
            if body.len() + chunk.len() > self.max_response_bytes {
                return Err(transport(format!(
                    "response exceeds {} bytes",
                    self.max_response_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        let body = parse_body(&body);
        if status == 200 {
            Ok(body)
        } else {
            Err(RedirectError::Status { status, body })
        }
    }
}

fn parse_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::Result;
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::Redirect;
    use axum::routing::post;
    use serde_json::{Value, json};

    use super::{RedirectClient, RedirectError};

    async fn spawn_target() -> Result<(SocketAddr, Arc<AtomicUsize>)> {
        let failures = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/v1/run/ok",
                post(|axum::Json(body): axum::Json<Value>| async move {
                    axum::Json(json!({"status": 201, "body": {"seen": body["method"]}}))
                }),
            )
            .route(
                "/v1/run/fail",
                post(|State(failures): State<Arc<AtomicUsize>>| async move {
                    failures.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(json!({"oops": true})))
                }),
            )
            .route(
                "/v1/run/moved",
                post(|| async { Redirect::temporary("/v1/run/ok") }),
            )
            .route(
                "/v1/run/large",
                post(|| async { "x".repeat(4096) }),
            )
            .with_state(failures.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok((addr, failures))
    }

    fn client() -> Result<RedirectClient> {
        Ok(RedirectClient::new(1024)?)
    }

    #[tokio::test]
    async fn successful_exchange_returns_payload() -> Result<()> {
        let (addr, _) = spawn_target().await?;
        let response = client()?
            .invoke(
                &format!("http://{addr}"),
                "/run/ok",
                &json!({"method": "GET"}),
                Duration::from_secs(2),
            )
            .await?;
        assert_eq!(response.payload["status"], 201);
        assert_eq!(response.payload["body"]["seen"], "GET");
        Ok(())
    }

    #[tokio::test]
    async fn non_200_is_posted_once_and_carries_status_and_body() -> Result<()> {
        let (addr, failures) = spawn_target().await?;
        let result = client()?
            .invoke(
                &format!("http://{addr}/"),
                "/run/fail",
                &json!({}),
                Duration::from_secs(2),
            )
            .await;
        assert_eq!(
            result,
            Err(RedirectError::Status {
                status: 500,
                body: json!({"oops": true}),
            })
        );
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        let moved = client()?
            .invoke(
                &format!("http://{addr}"),
                "/run/moved",
                &json!({}),
                Duration::from_millis(50),
            )
            .await;
        assert!(matches!(moved, Err(RedirectError::Status { status: 307, .. })));
        Ok(())
    }

    #[tokio::test]
    async fn oversized_and_unreachable_targets_are_transport_errors() -> Result<()> {
        let (addr, _) = spawn_target().await?;
        let large = client()?
            .invoke(
                &format!("http://{addr}"),
                "/run/large",
                &json!({}),
                Duration::from_millis(50),
            )
            .await;
        assert!(matches!(large, Err(RedirectError::Transport { .. })));

        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let closed = unused.local_addr()?;
        drop(unused);
        let unreachable = client()?
            .invoke(
                &format!("http://{closed}"),
                "/run/ok",
                &json!({}),
                Duration::from_millis(50),
            )
            .await;
        assert!(matches!(unreachable, Err(RedirectError::Transport { .. })));
        Ok(())
    }
}
