use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use hazel_runtime::{
    start_usage_telemetry, HubConfig, SessionHub, TelemetryLaunch, UsageTelemetry,
    SESSION_RPC_TIMEOUT,
};
use tokio::net::TcpListener;
use tracing::info;

mod endpoints;
mod history_handlers;
mod session_handlers;
mod types;

use endpoints::{
    CODEX_APPROVAL_ENDPOINT, CODEX_HISTORY_ENDPOINT, CODEX_SESSION_POLL_ENDPOINT,
    CODEX_SESSION_START_ENDPOINT, CODEX_SESSION_STOP_ENDPOINT, CODEX_TURN_ENDPOINT,
    CODEX_USAGE_ENDPOINT,
};
use history_handlers::{handle_codex_history, handle_codex_usage};
use session_handlers::{
    handle_codex_approval, handle_codex_session_poll, handle_codex_session_start,
    handle_codex_session_stop, handle_codex_turn,
};

pub const DEFAULT_GATEWAY_BIND: &str = "127.0.0.1:8765";

/// Settings for one `hazel-nexus` server process.
#[derive(Debug, Clone)]
pub struct GatewayServerConfig {
    /// Hazel state root holding `.hazel/`.
    pub root: PathBuf,
    pub bind: String,
    /// Replaces the app-server command from `.hazel/config.yaml` for every process.
    pub agent_command: Option<String>,
    pub rpc_timeout: Duration,
    pub telemetry_enabled: bool,
}

impl GatewayServerConfig {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            bind: DEFAULT_GATEWAY_BIND.to_string(),
            agent_command: None,
            rpc_timeout: SESSION_RPC_TIMEOUT,
            telemetry_enabled: true,
        }
    }
}

#[derive(Clone)]
pub struct GatewayState {
    root: PathBuf,
    hub: Arc<SessionHub>,
    usage: Arc<UsageTelemetry>,
}

impl GatewayState {
    pub fn new(root: PathBuf, hub: Arc<SessionHub>, usage: Arc<UsageTelemetry>) -> Self {
        Self { root, hub, usage }
    }

    pub fn hub(&self) -> &Arc<SessionHub> {
        &self.hub
    }
}

pub fn build_gateway_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route(
            CODEX_SESSION_START_ENDPOINT,
            post(handle_codex_session_start),
        )
        .route(CODEX_SESSION_POLL_ENDPOINT, get(handle_codex_session_poll))
        .route(CODEX_TURN_ENDPOINT, post(handle_codex_turn))
        .route(CODEX_APPROVAL_ENDPOINT, post(handle_codex_approval))
        .route(CODEX_SESSION_STOP_ENDPOINT, post(handle_codex_session_stop))
        .route(CODEX_USAGE_ENDPOINT, get(handle_codex_usage))
        .route(CODEX_HISTORY_ENDPOINT, get(handle_codex_history))
        .with_state(state)
}

/// Serves the chat API until ctrl-c, then stops telemetry and every session.
pub async fn run_gateway_server(config: GatewayServerConfig) -> Result<()> {
    let bind_addr = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid --bind '{}'", config.bind))?;

    let hub = Arc::new(SessionHub::new(HubConfig {
        command_override: config.agent_command.clone(),
        rpc_timeout: config.rpc_timeout,
    }));
    let usage = Arc::new(UsageTelemetry::new());
    let mut telemetry_handle = if config.telemetry_enabled {
        let mut launch = TelemetryLaunch::new(config.root.clone());
        launch.command_override = config.agent_command.clone();
        Some(start_usage_telemetry(Arc::clone(&usage), launch)?)
    } else {
        None
    };

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind hazel nexus server on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound hazel nexus server address")?;
    info!(
        addr = %local_addr,
        root = %config.root.display(),
        telemetry = config.telemetry_enabled,
        "hazel nexus server listening"
    );

    let state = Arc::new(GatewayState::new(
        config.root.clone(),
        Arc::clone(&hub),
        usage,
    ));
    let app = build_gateway_router(state);
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    if let Some(handle) = telemetry_handle.as_mut() {
        handle.shutdown().await;
    }
    hub.shutdown();
    serve_result.context("hazel nexus server exited unexpectedly")?;
    info!("hazel nexus server stopped");
    Ok(())
}
