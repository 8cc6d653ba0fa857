use std::{
    env,
    net::{AddrParseError, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use thiserror::Error;

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub build_sha: String,
    pub public_base_url: String,
    pub jwt_audience: String,
    pub realtime_logs_enabled: bool,
    pub redirect_max_response_bytes: usize,
    pub task_stats_cache_ttl_ms: u64,
    pub default_max_running: u32,
    pub compute_base_url: Option<String>,
    pub compute_connect_timeout_ms: u64,
    pub seed_path: Option<PathBuf>,
    pub log_filter: String,
    pub log_json: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid CONTROL_PLANE_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid CONTROL_PLANE_PUBLIC_BASE_URL: {0}")]
    InvalidPublicBaseUrl(String),
    #[error("invalid CONTROL_PLANE_REALTIME_LOGS_ENABLED: {0}")]
    InvalidRealtimeLogsEnabled(String),
    #[error("invalid CONTROL_PLANE_REDIRECT_MAX_RESPONSE_BYTES: {0}")]
    InvalidRedirectMaxResponseBytes(String),
    #[error("invalid CONTROL_PLANE_TASK_STATS_CACHE_TTL_MS: {0}")]
    InvalidTaskStatsCacheTtlMs(String),
    #[error("invalid CONTROL_PLANE_DEFAULT_MAX_RUNNING: {0}")]
    InvalidDefaultMaxRunning(String),
    #[error("invalid CONTROL_PLANE_COMPUTE_CONNECT_TIMEOUT_MS: {0}")]
    InvalidComputeConnectTimeoutMs(String),
    #[error("invalid CONTROL_PLANE_LOG_JSON: {0}")]
    InvalidLogJson(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let value_or = |key: &str, default: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let optional = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind_addr = value_or("CONTROL_PLANE_BIND_ADDR", "127.0.0.1:4200").parse()?;
        let service_name = value_or("CONTROL_PLANE_SERVICE_NAME", "control-plane");
        let build_sha = value_or("CONTROL_PLANE_BUILD_SHA", "dev");

        let public_base_url = value_or("CONTROL_PLANE_PUBLIC_BASE_URL", "http://127.0.0.1:4200")
            .trim_end_matches('/')
            .to_string();
        if !(public_base_url.starts_with("http://") || public_base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidPublicBaseUrl(public_base_url));
        }

        let jwt_audience = value_or("CONTROL_PLANE_JWT_AUDIENCE", "https://api.fx.local");
        let realtime_logs_enabled =
            parse_bool(&value_or("CONTROL_PLANE_REALTIME_LOGS_ENABLED", "true"))
                .map_err(ConfigError::InvalidRealtimeLogsEnabled)?;
        let redirect_max_response_bytes =
            value_or("CONTROL_PLANE_REDIRECT_MAX_RESPONSE_BYTES", "5242880")
                .parse::<usize>()
                .map_err(|error| ConfigError::InvalidRedirectMaxResponseBytes(error.to_string()))?
                .max(1);
        let task_stats_cache_ttl_ms = value_or("CONTROL_PLANE_TASK_STATS_CACHE_TTL_MS", "2000")
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidTaskStatsCacheTtlMs(error.to_string()))?
            .max(1);
        let default_max_running = value_or("CONTROL_PLANE_DEFAULT_MAX_RUNNING", "10")
            .parse::<u32>()
            .map_err(|error| ConfigError::InvalidDefaultMaxRunning(error.to_string()))?
            .max(1);

        let compute_base_url = optional("CONTROL_PLANE_COMPUTE_BASE_URL")
            .map(|value| value.trim_end_matches('/').to_string());
        let compute_connect_timeout_ms =
            value_or("CONTROL_PLANE_COMPUTE_CONNECT_TIMEOUT_MS", "5000")
                .parse::<u64>()
                .map_err(|error| ConfigError::InvalidComputeConnectTimeoutMs(error.to_string()))?
                .clamp(100, 60_000);

        let seed_path = optional("CONTROL_PLANE_SEED_PATH").map(PathBuf::from);
        let log_filter = value_or("CONTROL_PLANE_LOG_FILTER", "info");
        let log_json = parse_bool(&value_or("CONTROL_PLANE_LOG_JSON", "false"))
            .map_err(ConfigError::InvalidLogJson)?;

        Ok(Self {
            service_name,
            bind_addr,
            build_sha,
            public_base_url,
            jwt_audience,
            realtime_logs_enabled,
            redirect_max_response_bytes,
            task_stats_cache_ttl_ms,
            default_max_running,
            compute_base_url,
            compute_connect_timeout_ms,
            seed_path,
            log_filter,
            log_json,
        })
    }

    #[must_use]
    pub fn task_stats_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.task_stats_cache_ttl_ms)
    }

    #[must_use]
    pub fn compute_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.compute_connect_timeout_ms)
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(other.to_string()),
    }
}
