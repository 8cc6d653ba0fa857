#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    config::Config,
    dispatch::{
        ComputeBackend, DispatcherSettings, HttpComputeBackend, InvocationDispatcher,
        RedirectClient,
    },
    jwks::JwksCache,
    permissions::PermissionResolver,
    seed::Seed,
    server::{AppState, build_router},
    tasks::{QueueBackend, TaskScheduler, TaskStatisticsCache},
};

pub mod accounts;
pub mod analytics;
pub mod api_envelope;
pub mod audit;
pub mod config;
pub mod dispatch;
pub mod jwks;
pub mod permissions;
pub mod seed;
pub mod server;
pub mod tasks;

const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn build_app_state(config: Config) -> Result<AppState> {
    let accounts = accounts::memory();
    let functions = dispatch::functions::memory();
    if let Some(path) = config.seed_path.as_deref() {
        Seed::load(path)?.apply(&accounts, &functions).await?;
    }

    let permissions = Arc::new(PermissionResolver::new(
        accounts,
        audit::tracing_sink(),
        Arc::new(JwksCache::new(JWKS_FETCH_TIMEOUT)?),
        config.jwt_audience.clone(),
    ));

    let queues: Arc<dyn QueueBackend> = tasks::queue::memory();
    let stats = Arc::new(TaskStatisticsCache::new(
        queues.clone(),
        config.task_stats_cache_ttl(),
    ));
    TaskStatisticsCache::spawn_sweeper(Arc::downgrade(&stats), config.task_stats_cache_ttl());
    let scheduler = Arc::new(TaskScheduler::new(
        tasks::store::memory(),
        queues,
        stats,
        config.default_max_running,
    ));

    let compute: Arc<dyn ComputeBackend> = match config.compute_base_url.as_deref() {
        Some(base_url) => Arc::new(HttpComputeBackend::new(
            base_url,
            config.compute_connect_timeout(),
        )?),
        None => dispatch::compute::memory(),
    };
    let redirect = Arc::new(RedirectClient::new(config.redirect_max_response_bytes)?);
    let dispatcher = Arc::new(InvocationDispatcher::new(
        functions.clone(),
        permissions.clone(),
        scheduler.clone(),
        compute,
        redirect,
        analytics::tracing_sink(),
        DispatcherSettings {
            public_base_url: config.public_base_url.clone(),
            realtime_logs_enabled: config.realtime_logs_enabled,
        },
    ));

    Ok(AppState::new(
        config,
        dispatcher,
        permissions,
        scheduler,
        functions,
    ))
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_app_state(config).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        "control plane listening"
    );
    axum::serve(listener, build_app(config).await?).await?;
    Ok(())
}
