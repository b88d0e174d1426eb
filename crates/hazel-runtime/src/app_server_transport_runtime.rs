//! Stdio transport for one agent app-server subprocess.
//!
//! Each spawned process gets three tokio tasks: a stdout reader that classifies
//! and dispatches inbound lines, a stderr reader, and a wait task that records
//! the exit code and flushes every pending request with a termination outcome
//! once stdout has drained.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::app_server_protocol::{
    encode_error_response, encode_notification, encode_request, encode_result_response,
    parse_inbound_line, InboundFrame, ProtocolError, RpcErrorObject, RpcId, RpcOutcome,
};
use crate::lock_or_recover;
use crate::rpc_correlator::RpcCorrelator;

pub const DEFAULT_APP_SERVER_COMMAND: &str = "codex app-server";
/// Default per-call timeout for chat session requests.
pub const SESSION_RPC_TIMEOUT: Duration = Duration::from_secs(90);
/// Upper bound on waiting for buffered stdout after the process exits.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const MODE_ENV: &str = "HAZEL_MODE";
const ROOT_ENV: &str = "HAZEL_ROOT";
const STATE_ROOT_ENV: &str = "HAZEL_STATE_ROOT";
const REPO_ROOT_ENV: &str = "HAZEL_REPO_ROOT";
const TASK_ID_ENV: &str = "HAZEL_TASK_ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppServerMode {
    Chat,
    Telemetry,
}

impl AppServerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Telemetry => "telemetry",
        }
    }
}

/// How to launch an app-server and what environment contract it receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppServerLaunchSpec {
    /// Shell command line, run through `sh -c`.
    pub command_line: String,
    pub mode: AppServerMode,
    pub repo_root: PathBuf,
    pub state_root: PathBuf,
    pub task_id: String,
}

#[derive(Debug, Error)]
pub enum AppServerError {
    #[error("app-server command must be non-empty")]
    EmptyCommand,
    #[error("failed to spawn app-server '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("app-server {0} pipe unavailable")]
    MissingPipe(&'static str),
    #[error("app-server stdin is closed")]
    StdinClosed,
    #[error("failed to write to app-server stdin: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to encode app-server message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("request timeout: {method}")]
    Timeout { method: String },
    #[error("{message} ({code})")]
    Rpc { code: i64, message: String },
    #[error("session terminated")]
    Terminated,
}

/// Receives everything a connection reads that is not a reply to our own
/// requests.
#[async_trait]
pub trait AppServerHandler: Send + Sync + 'static {
    /// Server-initiated request. Implementations answer through `connection`.
    async fn on_server_request(
        &self,
        _connection: &AppServerConnection,
        _id: RpcId,
        _method: String,
        _params: Value,
    ) {
    }

    fn on_notification(&self, method: &str, params: Value);

    fn on_protocol_error(&self, _error: &ProtocolError) {}

    fn on_read_error(&self, _error: &std::io::Error) {}

    /// Stdout reached end of file. The process may still be running.
    fn on_stdout_closed(&self) {}

    fn on_stderr_line(&self, _line: &str) {}

    fn on_exit(&self, exit_code: i32);
}

/// Write side and request bookkeeping of a running app-server.
#[derive(Debug)]
pub struct AppServerConnection {
    label: String,
    process_id: Option<u32>,
    stdin: AsyncMutex<Option<ChildStdin>>,
    correlator: RpcCorrelator,
    kill_switch: Mutex<Option<oneshot::Sender<()>>>,
    exited: AtomicBool,
}

/// Spawns the app-server and starts its read/wait loops.
pub fn spawn_app_server(
    spec: &AppServerLaunchSpec,
    handler: Arc<dyn AppServerHandler>,
) -> Result<Arc<AppServerConnection>, AppServerError> {
    let command_line = spec.command_line.trim();
    if command_line.is_empty() {
        return Err(AppServerError::EmptyCommand);
    }

    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line);
    command.current_dir(&spec.repo_root);
    command.kill_on_drop(true);
    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.env(MODE_ENV, spec.mode.as_str());
    command.env(ROOT_ENV, &spec.repo_root);
    command.env(STATE_ROOT_ENV, &spec.state_root);
    command.env(REPO_ROOT_ENV, &spec.repo_root);
    command.env(TASK_ID_ENV, spec.task_id.trim());

    let mut child = command.spawn().map_err(|source| AppServerError::Spawn {
        command: command_line.to_string(),
        source,
    })?;
    let stdin = child.stdin.take().ok_or(AppServerError::MissingPipe("stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or(AppServerError::MissingPipe("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(AppServerError::MissingPipe("stderr"))?;

    let label = if spec.task_id.trim().is_empty() {
        spec.mode.as_str().to_string()
    } else {
        format!("{}:{}", spec.mode.as_str(), spec.task_id.trim())
    };
    let (kill_tx, kill_rx) = oneshot::channel();
    let (drained_tx, drained_rx) = oneshot::channel();
    let connection = Arc::new(AppServerConnection {
        label,
        process_id: child.id(),
        stdin: AsyncMutex::new(Some(stdin)),
        correlator: RpcCorrelator::new(),
        kill_switch: Mutex::new(Some(kill_tx)),
        exited: AtomicBool::new(false),
    });
    info!(
        app_server = connection.label.as_str(),
        pid = ?connection.process_id,
        command = command_line,
        "spawned app-server"
    );

    tokio::spawn(run_stdout_loop(
        Arc::clone(&connection),
        Arc::clone(&handler),
        stdout,
        drained_tx,
    ));
    tokio::spawn(run_stderr_loop(Arc::clone(&handler), stderr));
    tokio::spawn(run_wait_loop(
        Arc::clone(&connection),
        handler,
        child,
        kill_rx,
        drained_rx,
    ));
    Ok(connection)
}

impl AppServerConnection {
    pub fn label(&self) -> &str {
        self.label.as_str()
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process_id
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn correlator(&self) -> &RpcCorrelator {
        &self.correlator
    }

    /// Sends a request and waits up to `timeout` for its reply.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, AppServerError> {
        let call = self
            .correlator
            .register()
            .ok_or(AppServerError::Terminated)?;
        let line = match encode_request(call.id, method, params.as_ref()) {
            Ok(line) => line,
            Err(error) => {
                self.correlator.cancel(call.key.as_str());
                return Err(error.into());
            }
        };
        if let Err(error) = self.write_line(line.as_str()).await {
            self.correlator.cancel(call.key.as_str());
            return Err(error);
        }

        match self.correlator.wait(call, timeout).await {
            Some(RpcOutcome::Result(result)) => Ok(result),
            Some(RpcOutcome::Error(error)) => Err(AppServerError::Rpc {
                code: error.code,
                message: error.message,
            }),
            Some(RpcOutcome::Terminated) => Err(AppServerError::Terminated),
            None => {
                debug!(
                    app_server = self.label.as_str(),
                    method, "app-server request timed out"
                );
                Err(AppServerError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), AppServerError> {
        let line = encode_notification(method, params.as_ref())?;
        self.write_line(line.as_str()).await
    }

    pub async fn respond(&self, id: &RpcId, result: &Value) -> Result<(), AppServerError> {
        let line = encode_result_response(id, result)?;
        self.write_line(line.as_str()).await
    }

    pub async fn respond_error(
        &self,
        id: &RpcId,
        error: &RpcErrorObject,
    ) -> Result<(), AppServerError> {
        let line = encode_error_response(id, error)?;
        self.write_line(line.as_str()).await
    }

    /// Closes stdin and force-kills the process if it is still running.
    ///
    /// Never blocks: a writer stuck on a full pipe keeps the stdin lock, in
    /// which case the kill alone ends the process and the wait loop releases
    /// the pipe.
    pub fn shutdown(&self) {
        if let Ok(mut stdin) = self.stdin.try_lock() {
            stdin.take();
        }
        if self.has_exited() {
            return;
        }
        if let Some(kill_switch) = lock_or_recover(&self.kill_switch).take() {
            let _ = kill_switch.send(());
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), AppServerError> {
        let mut stdin = self.stdin.lock().await;
        let Some(writer) = stdin.as_mut() else {
            return Err(AppServerError::StdinClosed);
        };
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(AppServerError::Write)?;
        writer
            .write_all(b"\n")
            .await
            .map_err(AppServerError::Write)?;
        writer.flush().await.map_err(AppServerError::Write)
    }

    async fn dispatch_line(&self, line: &[u8], handler: &dyn AppServerHandler) {
        match parse_inbound_line(line) {
            Err(error) => {
                warn!(
                    app_server = self.label.as_str(),
                    error = %error,
                    "dropping malformed app-server line"
                );
                handler.on_protocol_error(&error);
            }
            Ok(InboundFrame::Reply { id, outcome }) => {
                if !self.correlator.complete(&id, outcome) {
                    debug!(
                        app_server = self.label.as_str(),
                        id = id.correlation_key().as_str(),
                        "dropping reply without a pending request"
                    );
                }
            }
            Ok(InboundFrame::ServerRequest { id, method, params }) => {
                handler.on_server_request(self, id, method, params).await;
            }
            Ok(InboundFrame::Notification { method, params }) => {
                handler.on_notification(method.as_str(), params);
            }
            Ok(InboundFrame::Unroutable) => {}
        }
    }
}

async fn run_stdout_loop(
    connection: Arc<AppServerConnection>,
    handler: Arc<dyn AppServerHandler>,
    stdout: ChildStdout,
    drained: oneshot::Sender<()>,
) {
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                debug!(app_server = connection.label(), "app-server stdout closed");
                handler.on_stdout_closed();
                break;
            }
            Ok(_) => {
                let trimmed = line.trim_ascii();
                if trimmed.is_empty() {
                    continue;
                }
                connection.dispatch_line(trimmed, handler.as_ref()).await;
            }
            Err(error) => {
                warn!(
                    app_server = connection.label(),
                    error = %error,
                    "app-server stdout read failed"
                );
                handler.on_read_error(&error);
                break;
            }
        }
    }
    let _ = drained.send(());
}

async fn run_stderr_loop<R>(handler: Arc<dyn AppServerHandler>, stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    handler.on_stderr_line(trimmed);
                }
            }
        }
    }
}

async fn run_wait_loop(
    connection: Arc<AppServerConnection>,
    handler: Arc<dyn AppServerHandler>,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    stdout_drained: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let exit_code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(error) => {
            warn!(
                app_server = connection.label(),
                error = %error,
                "failed to wait for app-server"
            );
            1
        }
    };
    // Replies and events still buffered in the pipe are dispatched first.
    if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, stdout_drained)
        .await
        .is_err()
    {
        debug!(
            app_server = connection.label(),
            "app-server stdout still open after exit"
        );
    }
    connection.exited.store(true, Ordering::SeqCst);
    connection.stdin.lock().await.take();
    let flushed = connection.correlator.terminate_all();
    info!(
        app_server = connection.label(),
        exit_code,
        flushed_requests = flushed,
        "app-server exited"
    );
    handler.on_exit(exit_code);
}
