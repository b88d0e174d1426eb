//! One chat conversation with an agent app-server.
//!
//! A [`CodexSession`] owns the subprocess connection, the bounded event log,
//! the pending approval table and the current thread id. Everything read from
//! the subprocess lands in the event log; HTTP callers drain it with
//! [`CodexSession::poll`].

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hazel_core::{clip_text, current_unix_timestamp_nanos};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::app_server_protocol::{ProtocolError, RpcErrorObject, RpcId};
use crate::app_server_transport_runtime::{
    spawn_app_server, AppServerConnection, AppServerError, AppServerHandler, AppServerLaunchSpec,
    AppServerMode,
};
use crate::hazel_config::ApprovalPolicy;
use crate::lock_or_recover;
use crate::notification_router::{
    route_notification, route_server_request, AppServerNotification, AppServerRequest,
    ThreadStartedParams, TurnParams, AGENT_MESSAGE_ITEM_TYPE,
};
use crate::session_event_log::{
    session_log_path, EventDraft, SessionEvent, SessionEventKind, SessionEventLog,
};
use crate::task_context::build_task_context;
use crate::thread_index::{read_thread_id, write_thread_id};

pub const CLIENT_NAME: &str = "hazel";
pub const CLIENT_TITLE: &str = "Hazel Nexus";
pub const CLIENT_VERSION: &str = "0.1.0";

const USER_MESSAGE_CONTEXT_LIMIT: usize = 2_600;
const UNSUPPORTED_REQUEST_MESSAGE: &str = "unsupported server request in hazel";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session_id is required")]
    MissingSessionId,
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("prompt is required")]
    EmptyPrompt,
    #[error("session has no thread id")]
    NoThreadId,
    #[error("request_id is required")]
    MissingRequestId,
    #[error("approval request not found: {0}")]
    ApprovalNotFound(String),
    #[error("unsupported decision {0:?}")]
    UnsupportedDecision(String),
    #[error("failed to load hazel config: {0:#}")]
    Config(anyhow::Error),
    #[error("initialize failed: {0}")]
    Initialize(#[source] AppServerError),
    #[error("initialized notification failed: {0}")]
    InitializedNotification(#[source] AppServerError),
    #[error("thread/start failed: {0}")]
    ThreadStart(#[source] AppServerError),
    #[error("thread/start returned empty thread id")]
    EmptyThreadId,
    #[error(transparent)]
    Transport(#[from] AppServerError),
}

/// Bootstrap progress of a session. `Done` is entered when the process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Uninitialized,
    Handshaking,
    Resuming,
    Starting,
    Active,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Accept,
    AcceptForSession,
    Decline,
    Cancel,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::AcceptForSession => "acceptForSession",
            Self::Decline => "decline",
            Self::Cancel => "cancel",
        }
    }
}

impl FromStr for ApprovalDecision {
    type Err = SessionError;

    /// Blank input means `decline`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "" | "decline" => Ok(Self::Decline),
            "accept" => Ok(Self::Accept),
            "acceptForSession" => Ok(Self::AcceptForSession),
            "cancel" => Ok(Self::Cancel),
            other => Err(SessionError::UnsupportedDecision(other.to_string())),
        }
    }
}

/// A server-initiated approval request awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    /// Id exactly as the app-server sent it, echoed in the response.
    #[serde(skip)]
    pub wire_id: RpcId,
    pub method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cwd: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollResult {
    pub session_id: String,
    pub cursor: usize,
    pub events: Vec<SessionEvent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub approvals: Vec<ApprovalRequest>,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnResult {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub turn_id: String,
}

/// Everything needed to launch one chat session process.
#[derive(Debug, Clone)]
pub struct SessionLaunch {
    pub session_id: String,
    pub key: String,
    pub root: PathBuf,
    pub repo_root: PathBuf,
    pub task_id: String,
    pub command_line: String,
    pub approval_policy: ApprovalPolicy,
    pub rpc_timeout: Duration,
}

#[derive(Debug)]
struct SessionState {
    phase: SessionPhase,
    thread_id: String,
    events: SessionEventLog,
    approvals: Vec<ApprovalRequest>,
    done: bool,
    exit_code: Option<i32>,
}

/// Session state shared with the transport loops.
#[derive(Debug)]
struct SessionCore {
    session_id: String,
    root: PathBuf,
    task_id: String,
    state: Mutex<SessionState>,
}

impl SessionCore {
    fn append(&self, draft: EventDraft) -> SessionEvent {
        lock_or_recover(&self.state).events.append(draft)
    }

    fn thread_id(&self) -> String {
        lock_or_recover(&self.state).thread_id.clone()
    }

    fn set_phase(&self, phase: SessionPhase) {
        let mut state = lock_or_recover(&self.state);
        if state.phase == SessionPhase::Done || state.phase == phase {
            return;
        }
        debug!(
            session_id = self.session_id.as_str(),
            from = ?state.phase,
            to = ?phase,
            "session phase transition"
        );
        state.phase = phase;
    }

    fn adopt_thread_id(&self, thread_id: &str) {
        lock_or_recover(&self.state).thread_id = thread_id.trim().to_string();
    }

    fn persist_thread_id(&self, thread_id: &str) {
        if let Err(error) = write_thread_id(&self.root, &self.task_id, thread_id) {
            warn!(
                session_id = self.session_id.as_str(),
                error = %error,
                "failed to persist thread id"
            );
            self.append(
                EventDraft::new(SessionEventKind::Warning)
                    .with_text(format!("failed to persist thread id: {error:#}")),
            );
        }
    }

    fn record_approval(&self, approval: ApprovalRequest, draft: EventDraft) {
        let mut state = lock_or_recover(&self.state);
        state
            .approvals
            .retain(|pending| pending.request_id != approval.request_id);
        state.approvals.push(approval);
        state.events.append(draft);
    }

    fn handle_notification(&self, notification: AppServerNotification) {
        match notification {
            AppServerNotification::ThreadStarted(params) => {
                let thread_id = params.thread_id().to_string();
                if thread_id.is_empty() {
                    return;
                }
                self.adopt_thread_id(&thread_id);
                self.persist_thread_id(&thread_id);
                self.append(
                    EventDraft::new(SessionEventKind::ThreadStarted)
                        .with_text("thread started")
                        .with_thread_id(thread_id),
                );
            }
            AppServerNotification::AgentMessageDelta(params) => {
                self.append(
                    EventDraft::new(SessionEventKind::AssistantDelta)
                        .with_text(params.delta)
                        .with_thread_id(params.thread_id)
                        .with_turn_id(params.turn_id)
                        .with_item_id(params.item_id),
                );
            }
            AppServerNotification::CommandOutputDelta(params) => {
                self.append(
                    EventDraft::new(SessionEventKind::ToolOutput)
                        .with_text(params.delta)
                        .with_thread_id(params.thread_id)
                        .with_turn_id(params.turn_id)
                        .with_item_id(params.item_id),
                );
            }
            AppServerNotification::CommandStarted(params) => {
                let command = params.command.trim();
                if command.is_empty() {
                    return;
                }
                self.append(
                    EventDraft::new(SessionEventKind::ToolCommand)
                        .with_text(command)
                        .with_thread_id(params.thread_id)
                        .with_turn_id(params.turn_id)
                        .with_item_id(params.item_id),
                );
            }
            AppServerNotification::ItemCompleted(params) => {
                let Some(item) = params.item else {
                    return;
                };
                if item.kind != AGENT_MESSAGE_ITEM_TYPE || item.text.trim().is_empty() {
                    return;
                }
                self.append(
                    EventDraft::new(SessionEventKind::AssistantMessage)
                        .with_text(item.text)
                        .with_thread_id(params.thread_id)
                        .with_turn_id(params.turn_id)
                        .with_item_id(item.id),
                );
            }
            AppServerNotification::TurnStarted(params) => {
                let turn = params.turn();
                self.append(
                    EventDraft::new(SessionEventKind::TurnStarted)
                        .with_thread_id(params.thread_id)
                        .with_turn_id(turn.id),
                );
            }
            AppServerNotification::TurnCompleted(params) => {
                let turn = params.turn();
                self.append(
                    EventDraft::new(SessionEventKind::TurnCompleted)
                        .with_text(turn.status)
                        .with_thread_id(params.thread_id)
                        .with_turn_id(turn.id),
                );
            }
            AppServerNotification::Error(params) => {
                let message = params.error.map(|error| error.message).unwrap_or_default();
                self.append(
                    EventDraft::new(SessionEventKind::Error)
                        .with_text(message)
                        .with_thread_id(params.thread_id)
                        .with_turn_id(params.turn_id),
                );
            }
            AppServerNotification::RateLimitsUpdated(_) => {}
            AppServerNotification::Malformed { method, error } => {
                debug!(
                    session_id = self.session_id.as_str(),
                    method = method.as_str(),
                    error = error.as_str(),
                    "dropping notification with undecodable params"
                );
            }
            AppServerNotification::Ignored { method } => {
                debug!(
                    session_id = self.session_id.as_str(),
                    method = method.as_str(),
                    "ignoring app-server notification"
                );
            }
        }
    }
}

#[async_trait]
impl AppServerHandler for SessionCore {
    async fn on_server_request(
        &self,
        connection: &AppServerConnection,
        id: RpcId,
        method: String,
        params: Value,
    ) {
        let request_id = id.correlation_key();
        match route_server_request(&method, params) {
            AppServerRequest::CommandExecutionApproval(params) => {
                let command = params.command.trim().to_string();
                self.record_approval(
                    ApprovalRequest {
                        request_id: request_id.clone(),
                        wire_id: id.clone(),
                        method: method.clone(),
                        reason: params.reason.trim().to_string(),
                        command: command.clone(),
                        cwd: params.cwd.trim().to_string(),
                    },
                    EventDraft::new(SessionEventKind::ApprovalRequested)
                        .with_text(format!("{method}: {command}"))
                        .with_item_id(request_id),
                );
                if !command.is_empty() {
                    self.append(
                        EventDraft::new(SessionEventKind::ToolCommand)
                            .with_text(command)
                            .with_thread_id(params.thread_id)
                            .with_turn_id(params.turn_id)
                            .with_item_id(params.item_id),
                    );
                }
            }
            AppServerRequest::FileChangeApproval(params) => {
                self.record_approval(
                    ApprovalRequest {
                        request_id,
                        wire_id: id.clone(),
                        method: method.clone(),
                        reason: params.reason.trim().to_string(),
                        command: String::new(),
                        cwd: String::new(),
                    },
                    EventDraft::new(SessionEventKind::ApprovalRequested).with_text(method),
                );
            }
            AppServerRequest::ToolRequestUserInput => {
                if let Err(error) = connection.respond(&id, &json!({"answers": {}})).await {
                    warn!(
                        session_id = self.session_id.as_str(),
                        error = %error,
                        "failed to auto-answer user input request"
                    );
                }
                self.append(
                    EventDraft::new(SessionEventKind::Notice)
                        .with_text(format!("{method} auto-answered")),
                );
            }
            AppServerRequest::Unsupported => {
                let error = RpcErrorObject::method_not_found(UNSUPPORTED_REQUEST_MESSAGE);
                if let Err(write_error) = connection.respond_error(&id, &error).await {
                    warn!(
                        session_id = self.session_id.as_str(),
                        error = %write_error,
                        "failed to reject unsupported server request"
                    );
                }
                self.append(
                    EventDraft::new(SessionEventKind::Warning)
                        .with_text(format!("unsupported server request: {method}")),
                );
            }
        }
    }

    fn on_notification(&self, method: &str, params: Value) {
        self.handle_notification(route_notification(method, params));
    }

    fn on_protocol_error(&self, error: &ProtocolError) {
        self.append(
            EventDraft::new(SessionEventKind::Warning)
                .with_text(format!("invalid app-server json: {error}")),
        );
    }

    fn on_read_error(&self, error: &std::io::Error) {
        self.append(
            EventDraft::new(SessionEventKind::Error)
                .with_text(format!("app-server read error: {error}")),
        );
    }

    fn on_stderr_line(&self, line: &str) {
        self.append(EventDraft::new(SessionEventKind::Stderr).with_text(line));
    }

    fn on_exit(&self, exit_code: i32) {
        let mut state = lock_or_recover(&self.state);
        state.done = true;
        state.exit_code = Some(exit_code);
        state.phase = SessionPhase::Done;
        state.events.append(
            EventDraft::new(SessionEventKind::SessionDone)
                .with_text(format!("codex app-server exited ({exit_code})")),
        );
    }
}

/// A live chat session bound to one (state root, task) key.
#[derive(Debug)]
pub struct CodexSession {
    key: String,
    repo_root: PathBuf,
    approval_policy: ApprovalPolicy,
    rpc_timeout: Duration,
    core: Arc<SessionCore>,
    connection: Arc<AppServerConnection>,
}

impl CodexSession {
    /// Starts the app-server process and its read loops. Call
    /// [`CodexSession::bootstrap`] before sending user messages.
    pub fn spawn(launch: SessionLaunch) -> Result<Arc<Self>, SessionError> {
        let mut events = SessionEventLog::new();
        let log_path = session_log_path(&launch.root, &launch.task_id, current_unix_timestamp_nanos());
        if let Err(error) = events.attach_sink(&log_path) {
            warn!(
                session_id = launch.session_id.as_str(),
                error = %error,
                "session log mirroring disabled"
            );
        }
        let task_id = launch.task_id.trim().to_string();
        let core = Arc::new(SessionCore {
            session_id: launch.session_id.clone(),
            root: launch.root.clone(),
            task_id: task_id.clone(),
            state: Mutex::new(SessionState {
                phase: SessionPhase::Uninitialized,
                thread_id: String::new(),
                events,
                approvals: Vec::new(),
                done: false,
                exit_code: None,
            }),
        });

        let spec = AppServerLaunchSpec {
            command_line: launch.command_line.clone(),
            mode: AppServerMode::Chat,
            repo_root: launch.repo_root.clone(),
            state_root: launch.root.clone(),
            task_id,
        };
        let connection = spawn_app_server(&spec, Arc::clone(&core) as Arc<dyn AppServerHandler>)?;
        info!(
            session_id = launch.session_id.as_str(),
            key = launch.key.as_str(),
            pid = ?connection.process_id(),
            "chat session started"
        );
        Ok(Arc::new(Self {
            key: launch.key,
            repo_root: launch.repo_root,
            approval_policy: launch.approval_policy,
            rpc_timeout: launch.rpc_timeout,
            core,
            connection,
        }))
    }

    pub fn id(&self) -> &str {
        self.core.session_id.as_str()
    }

    pub fn key(&self) -> &str {
        self.key.as_str()
    }

    pub fn task_id(&self) -> &str {
        self.core.task_id.as_str()
    }

    pub fn root(&self) -> &Path {
        &self.core.root
    }

    pub fn thread_id(&self) -> String {
        self.core.thread_id()
    }

    pub fn phase(&self) -> SessionPhase {
        lock_or_recover(&self.core.state).phase
    }

    pub fn is_done(&self) -> bool {
        lock_or_recover(&self.core.state).done
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        lock_or_recover(&self.core.state)
            .events
            .sink_path()
            .map(Path::to_path_buf)
    }

    /// Handshake, then resume the persisted thread or start a new one.
    pub async fn bootstrap(&self, restart: bool) -> Result<(), SessionError> {
        let developer_instructions = build_task_context(&self.core.root, &self.core.task_id)
            .trim()
            .to_string();

        self.core.set_phase(SessionPhase::Handshaking);
        self.connection
            .send_request(
                "initialize",
                Some(json!({
                    "clientInfo": {
                        "name": CLIENT_NAME,
                        "title": CLIENT_TITLE,
                        "version": CLIENT_VERSION,
                    },
                    "capabilities": {"experimentalApi": true},
                })),
                self.rpc_timeout,
            )
            .await
            .map_err(SessionError::Initialize)?;
        self.connection
            .send_notification("initialized", None)
            .await
            .map_err(SessionError::InitializedNotification)?;

        let mut thread_id = String::new();
        if !restart {
            let persisted = read_thread_id(&self.core.root, &self.core.task_id);
            if !persisted.is_empty() {
                self.core.set_phase(SessionPhase::Resuming);
                thread_id = self.resume_thread(persisted).await;
            }
        }

        if thread_id.is_empty() {
            self.core.set_phase(SessionPhase::Starting);
            let result = self
                .connection
                .send_request(
                    "thread/start",
                    Some(json!({
                        "cwd": self.repo_root.display().to_string(),
                        "approvalPolicy": self.approval_policy.as_str(),
                        "experimentalRawEvents": false,
                        "developerInstructions": developer_instructions,
                    })),
                    self.rpc_timeout,
                )
                .await
                .map_err(SessionError::ThreadStart)?;
            thread_id = thread_id_from_result(result);
            if thread_id.is_empty() {
                return Err(SessionError::EmptyThreadId);
            }
            self.core.adopt_thread_id(&thread_id);
            self.core.append(
                EventDraft::new(SessionEventKind::ThreadStarted)
                    .with_text("started new thread")
                    .with_thread_id(thread_id.as_str()),
            );
        }

        self.core.persist_thread_id(&thread_id);
        self.core.set_phase(SessionPhase::Active);
        Ok(())
    }

    /// Returns the resumed thread id, or empty when a new thread is needed.
    async fn resume_thread(&self, persisted: String) -> String {
        let reply = self
            .connection
            .send_request(
                "thread/resume",
                Some(json!({"threadId": persisted})),
                self.rpc_timeout,
            )
            .await;
        match reply {
            Ok(result) => {
                let resumed = thread_id_from_result(result);
                let thread_id = if resumed.is_empty() { persisted } else { resumed };
                self.core.adopt_thread_id(&thread_id);
                self.core.append(
                    EventDraft::new(SessionEventKind::ThreadResumed)
                        .with_text("resumed existing thread")
                        .with_thread_id(thread_id.as_str()),
                );
                thread_id
            }
            Err(error) => {
                warn!(
                    session_id = self.id(),
                    error = %error,
                    "thread resume failed"
                );
                self.core.append(
                    EventDraft::new(SessionEventKind::Warning)
                        .with_text("failed to resume thread; starting new thread"),
                );
                String::new()
            }
        }
    }

    /// Events after `cursor` plus the pending approvals and exit status.
    pub fn poll(&self, cursor: i64) -> PollResult {
        let state = lock_or_recover(&self.core.state);
        let page = state.events.since(cursor);
        PollResult {
            session_id: self.core.session_id.clone(),
            cursor: page.cursor,
            events: page.events,
            approvals: state.approvals.clone(),
            done: state.done,
            exit_code: state.exit_code,
        }
    }

    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        lock_or_recover(&self.core.state).approvals.clone()
    }

    /// Records the prompt and starts a turn on the current thread.
    pub async fn send_user_message(&self, prompt: &str) -> Result<TurnResult, SessionError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(SessionError::EmptyPrompt);
        }
        let thread_id = self.thread_id();
        if thread_id.is_empty() {
            return Err(SessionError::NoThreadId);
        }

        self.core.append(
            EventDraft::new(SessionEventKind::UserMessage)
                .with_text(prompt)
                .with_thread_id(thread_id.as_str()),
        );
        let context = build_task_context(&self.core.root, &self.core.task_id);
        let payload = compose_user_payload(&context, prompt);
        let reply = self
            .connection
            .send_request(
                "turn/start",
                Some(json!({
                    "threadId": thread_id,
                    "input": [{
                        "type": "text",
                        "text": payload,
                        "text_elements": [],
                    }],
                })),
                self.rpc_timeout,
            )
            .await;
        match reply {
            Ok(result) => Ok(TurnResult {
                turn_id: serde_json::from_value::<TurnParams>(result)
                    .map(|params| params.turn().id)
                    .unwrap_or_default(),
            }),
            Err(error) => {
                self.core.append(
                    EventDraft::new(SessionEventKind::Error)
                        .with_text(error.to_string())
                        .with_thread_id(thread_id.as_str()),
                );
                Err(error.into())
            }
        }
    }

    /// Answers a pending approval exactly once.
    ///
    /// Validation failures leave the pending table untouched.
    pub async fn resolve_approval(
        &self,
        request_id: &str,
        decision: &str,
    ) -> Result<(), SessionError> {
        let request_id = request_id.trim();
        if request_id.is_empty() {
            return Err(SessionError::MissingRequestId);
        }
        if !self
            .pending_approvals()
            .iter()
            .any(|pending| pending.request_id == request_id)
        {
            return Err(SessionError::ApprovalNotFound(request_id.to_string()));
        }
        let decision = decision.parse::<ApprovalDecision>()?;

        let (position, approval) = {
            let mut state = lock_or_recover(&self.core.state);
            let Some(position) = state
                .approvals
                .iter()
                .position(|pending| pending.request_id == request_id)
            else {
                return Err(SessionError::ApprovalNotFound(request_id.to_string()));
            };
            (position, state.approvals.remove(position))
        };

        if let Err(error) = self
            .connection
            .respond(&approval.wire_id, &json!({"decision": decision.as_str()}))
            .await
        {
            let mut state = lock_or_recover(&self.core.state);
            let position = position.min(state.approvals.len());
            state.approvals.insert(position, approval);
            return Err(error.into());
        }

        self.core.append(
            EventDraft::new(SessionEventKind::ApprovalResolved)
                .with_text(format!("{} => {}", approval.method, decision.as_str())),
        );
        Ok(())
    }

    /// Closes stdin and kills the process if it is still running. Idempotent.
    pub fn stop(&self) {
        if !self.is_done() {
            info!(session_id = self.id(), key = self.key(), "stopping chat session");
        }
        self.connection.shutdown();
    }
}

fn thread_id_from_result(result: Value) -> String {
    serde_json::from_value::<ThreadStartedParams>(result)
        .map(|params| params.thread_id().to_string())
        .unwrap_or_default()
}

/// Prompt text sent to the agent, prefixed with the clipped task context.
pub fn compose_user_payload(context: &str, prompt: &str) -> String {
    let context = context.trim();
    if context.is_empty() {
        return prompt.to_string();
    }
    format!(
        "[Hazel task context]\n{}\n[/Hazel task context]\n\nUser message:\n{prompt}",
        clip_text(context, USER_MESSAGE_CONTEXT_LIMIT)
    )
}
