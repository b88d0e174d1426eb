//! Background rate-limit monitor on a dedicated app-server connection.
//!
//! The loop never ends on its own: spawn failures, handshake failures, a lost
//! stdout stream and process exits only degrade the published hint and
//! schedule a reconnect.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::app_server_transport_runtime::{
    spawn_app_server, AppServerConnection, AppServerHandler, AppServerLaunchSpec, AppServerMode,
};
use crate::hazel_config::{load_hazel_config, resolve_repo_root};
use crate::lock_or_recover;
use crate::notification_router::RATE_LIMITS_UPDATED_METHOD;
use crate::usage_projection::{
    local_usage_hint, record_sample, usage_percent, usage_projection_hint, RateLimitsPayload,
    UsageSample,
};

pub const TELEMETRY_RPC_TIMEOUT: Duration = Duration::from_secs(20);
pub const TELEMETRY_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const TELEMETRY_SPAWN_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const TELEMETRY_RECONNECT_DELAY: Duration = Duration::from_secs(2);

const RATE_LIMITS_READ_METHOD: &str = "account/rateLimits/read";
const HINT_UNAVAILABLE: &str = "Usage metrics unavailable";
const HINT_CONNECTED: &str = "Connected to Codex telemetry";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_pct: Option<u8>,
    pub usage_hint: String,
}

#[derive(Debug, Default)]
struct TelemetryState {
    connected: bool,
    usage_pct: Option<u8>,
    usage_hint: String,
    updated_at: Option<DateTime<Utc>>,
    last_error: String,
    samples: Vec<UsageSample>,
}

/// Shared, read-mostly usage state published by the telemetry loop.
#[derive(Debug, Default)]
pub struct UsageTelemetry {
    state: Mutex<TelemetryState>,
}

impl UsageTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> UsageSnapshot {
        let state = lock_or_recover(&self.state);
        let mut hint = if state.usage_hint.is_empty() {
            HINT_UNAVAILABLE.to_string()
        } else {
            state.usage_hint.clone()
        };
        if state.connected {
            if state.updated_at.is_none() {
                hint = HINT_CONNECTED.to_string();
            }
        } else if !state.last_error.trim().is_empty() {
            hint = format!("Telemetry offline: {}", state.last_error);
        }
        if let Some(projection) = usage_projection_hint(&state.samples, now) {
            hint = format!("{hint} | {projection}").trim().to_string();
        }
        UsageSnapshot {
            usage_pct: state.usage_pct,
            usage_hint: hint,
        }
    }

    pub fn is_connected(&self) -> bool {
        lock_or_recover(&self.state).connected
    }

    pub fn set_connected(&self, connected: bool) {
        lock_or_recover(&self.state).connected = connected;
    }

    /// Records a failure and marks the monitor disconnected.
    pub fn set_error(&self, error: &str) {
        let mut state = lock_or_recover(&self.state);
        state.last_error = error.trim().to_string();
        state.usage_hint = format!("Telemetry offline: {}", state.last_error);
        state.connected = false;
    }

    /// Applies a rate-limit payload. Returns false when it carried no window.
    pub fn apply_rate_limits(&self, payload: &Value) -> bool {
        self.apply_rate_limits_at(payload, Utc::now())
    }

    pub fn apply_rate_limits_at(&self, payload: &Value, now: DateTime<Utc>) -> bool {
        let Ok(payload) = serde_json::from_value::<RateLimitsPayload>(payload.clone()) else {
            return false;
        };
        let Some(snapshot) = payload.rate_limits else {
            return false;
        };
        let Some(window) = snapshot.worst_window() else {
            return false;
        };
        let pct = usage_percent(window);
        let hint = local_usage_hint(window, pct);

        let mut state = lock_or_recover(&self.state);
        state.connected = true;
        state.usage_pct = Some(pct);
        state.usage_hint = hint;
        state.updated_at = Some(now);
        state.last_error.clear();
        record_sample(&mut state.samples, UsageSample { at: now, pct });
        true
    }
}

/// Where the telemetry app-server runs and which command launches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryLaunch {
    pub root: PathBuf,
    pub command_override: Option<String>,
    pub poll_interval: Duration,
}

impl TelemetryLaunch {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            command_override: None,
            poll_interval: TELEMETRY_POLL_INTERVAL,
        }
    }

    fn launch_spec(&self) -> Result<AppServerLaunchSpec> {
        let command_line = match self
            .command_override
            .as_deref()
            .map(str::trim)
            .filter(|command| !command.is_empty())
        {
            Some(command) => command.to_string(),
            None => load_hazel_config(&self.root)
                .context("failed to load telemetry config")?
                .app_server_command(),
        };
        Ok(AppServerLaunchSpec {
            command_line,
            mode: AppServerMode::Telemetry,
            repo_root: resolve_repo_root(&self.root),
            state_root: self.root.clone(),
            task_id: String::new(),
        })
    }
}

struct TelemetryHandler {
    telemetry: Arc<UsageTelemetry>,
    exited: Arc<Notify>,
}

impl AppServerHandler for TelemetryHandler {
    fn on_notification(&self, method: &str, params: Value) {
        if method == RATE_LIMITS_UPDATED_METHOD {
            self.telemetry.apply_rate_limits(&params);
        }
    }

    fn on_stderr_line(&self, line: &str) {
        self.telemetry.set_error(line);
    }

    fn on_read_error(&self, error: &std::io::Error) {
        self.telemetry
            .set_error(&format!("app-server read error: {error}"));
        self.exited.notify_one();
    }

    fn on_stdout_closed(&self) {
        self.telemetry.set_error("app-server stdout closed");
        self.exited.notify_one();
    }

    fn on_exit(&self, exit_code: i32) {
        debug!(exit_code, "telemetry app-server exited");
        self.exited.notify_one();
    }
}

#[derive(Debug)]
pub struct UsageTelemetryHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl UsageTelemetryHandle {
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Spawns the reconnecting telemetry loop on the current Tokio runtime.
pub fn start_usage_telemetry(
    telemetry: Arc<UsageTelemetry>,
    launch: TelemetryLaunch,
) -> Result<UsageTelemetryHandle> {
    let handle = tokio::runtime::Handle::try_current()
        .context("usage telemetry requires an active Tokio runtime")?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = handle.spawn(run_usage_telemetry_loop(telemetry, launch, shutdown_rx));
    Ok(UsageTelemetryHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

enum CycleEnd {
    Shutdown,
    Retry(Duration),
}

async fn run_usage_telemetry_loop(
    telemetry: Arc<UsageTelemetry>,
    launch: TelemetryLaunch,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        let delay = match run_telemetry_cycle(&telemetry, &launch, &mut shutdown_rx).await {
            CycleEnd::Shutdown => return,
            CycleEnd::Retry(delay) => delay,
        };
        tokio::select! {
            _ = &mut shutdown_rx => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_telemetry_cycle(
    telemetry: &Arc<UsageTelemetry>,
    launch: &TelemetryLaunch,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> CycleEnd {
    let exited = Arc::new(Notify::new());
    let handler = Arc::new(TelemetryHandler {
        telemetry: Arc::clone(telemetry),
        exited: Arc::clone(&exited),
    });
    let spawned = launch
        .launch_spec()
        .and_then(|spec| spawn_app_server(&spec, handler).map_err(anyhow::Error::from));
    let connection = match spawned {
        Ok(connection) => connection,
        Err(error) => {
            let message = format!("{error:#}");
            warn!(error = message.as_str(), "telemetry app-server spawn failed");
            telemetry.set_error(&message);
            return CycleEnd::Retry(TELEMETRY_SPAWN_RETRY_DELAY);
        }
    };
    telemetry.set_connected(true);

    let handshake = connection.send_request(
        "initialize",
        Some(json!({
            "clientInfo": {
                "name": "hazel-telemetry",
                "title": "Hazel Telemetry",
                "version": crate::codex_session_runtime::CLIENT_VERSION,
            },
            "capabilities": {"experimentalApi": true},
        })),
        TELEMETRY_RPC_TIMEOUT,
    );
    tokio::select! {
        _ = &mut *shutdown_rx => {
            connection.shutdown();
            return CycleEnd::Shutdown;
        }
        _ = exited.notified() => {
            warn!("telemetry app-server lost during handshake");
            connection.shutdown();
            return CycleEnd::Retry(TELEMETRY_RECONNECT_DELAY);
        }
        reply = handshake => {
            if let Err(error) = reply {
                warn!(error = %error, "telemetry handshake failed");
                telemetry.set_error(&error.to_string());
                connection.shutdown();
                return CycleEnd::Retry(TELEMETRY_RECONNECT_DELAY);
            }
        }
    }
    let _ = connection.send_notification("initialized", None).await;
    info!(app_server = connection.label(), "telemetry connected");

    let mut ticker = tokio::time::interval(launch.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = &mut *shutdown_rx => {
                connection.shutdown();
                return CycleEnd::Shutdown;
            }
            _ = exited.notified() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    _ = &mut *shutdown_rx => {
                        connection.shutdown();
                        return CycleEnd::Shutdown;
                    }
                    _ = exited.notified() => break,
                    _ = fetch_rate_limits(telemetry, &connection) => {}
                }
            }
        }
    }

    // Stdout can close while the process lingers; it is useless either way.
    connection.shutdown();
    telemetry.set_connected(false);
    warn!("telemetry app-server disconnected; reconnecting");
    CycleEnd::Retry(TELEMETRY_RECONNECT_DELAY)
}

async fn fetch_rate_limits(telemetry: &UsageTelemetry, connection: &AppServerConnection) {
    match connection
        .send_request(
            RATE_LIMITS_READ_METHOD,
            Some(json!({})),
            TELEMETRY_RPC_TIMEOUT,
        )
        .await
    {
        Ok(result) => {
            telemetry.apply_rate_limits(&result);
        }
        Err(error) => telemetry.set_error(&error.to_string()),
    }
}
