//! HTTP surface for the job runner.
//!
//! - [`push`] serves build output as a push-framed `text/event-stream` body.
//! - [`api`] holds the routes, including the pull-style submit and status.
//! - [`auth`] is the bearer-token gate in front of every `/jobs` route.

pub mod api;
pub mod auth;
pub mod push;

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::DevJobsToml;
use crate::jobs::{CommandRunner, JobRegistry};
use auth::{SharedVerifier, StaticTokenVerifier};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub runner: CommandRunner,
    pub config: Arc<DevJobsToml>,
    /// Base directory for relative command `cwd`s and the coverage file.
    pub project_dir: PathBuf,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: DevJobsToml, project_dir: PathBuf) -> Self {
        let registry = Arc::new(JobRegistry::new(config.retention_policy()));
        let runner = CommandRunner::new(registry, config.runner_settings());
        Self {
            runner,
            config: Arc::new(config),
            project_dir,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        self.runner.registry()
    }
}

/// Build the full application router.
pub fn build_router(state: SharedState, verifier: SharedVerifier, dev_mode: bool) -> Router {
    let mut app = api::api_router(verifier)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Periodically evict finished jobs until `shutdown` fires.
pub fn spawn_sweeper(
    registry: Arc<JobRegistry>,
    every: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let every = every.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = registry.prune();
                    if evicted > 0 {
                        debug!(evicted, remaining = registry.len(), "Swept finished jobs");
                    }
                }
            }
        }
    })
}

/// Serve on an already-bound listener until `shutdown` resolves, then
/// cancel every unfinished job.
pub async fn serve<F>(
    listener: TcpListener,
    state: SharedState,
    verifier: SharedVerifier,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let dev_mode = state.config.dev_mode();
    let sweep_every = Duration::from_secs(state.config.server.sweep_interval_secs);
    let stop_sweeper = CancellationToken::new();
    let sweeper = spawn_sweeper(state.registry().clone(), sweep_every, stop_sweeper.clone());

    let app = build_router(state.clone(), verifier, dev_mode);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error");

    stop_sweeper.cancel();
    let _ = sweeper.await;
    state.runner.shutdown();
    result
}

/// Bind to the configured address and serve until Ctrl+C.
pub async fn start_server(config: DevJobsToml, project_dir: PathBuf) -> Result<()> {
    let token = config
        .server_token()
        .context("Refusing to start without an auth token; set [auth] token or DEVJOBS_TOKEN")?;
    for warning in config.validate() {
        warn!("{warning}");
    }

    let host = if config.dev_mode() {
        "0.0.0.0".to_string()
    } else {
        config.server.host.clone()
    };
    let addr = format!("{}:{}", host, config.port());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr: SocketAddr = listener.local_addr()?;
    info!(address = %local_addr, project_dir = %project_dir.display(), "devjobs server listening");

    let state = Arc::new(AppState::new(config, project_dir));
    let verifier: SharedVerifier = Arc::new(StaticTokenVerifier::new(token));
    serve(listener, state, verifier, shutdown_signal()).await?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C; shutting down");
    }
    info!("Shutting down...");
}
