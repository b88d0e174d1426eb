//! Agent session protocol engine for Hazel Nexus.
//!
//! Launches agent app-servers over stdio, correlates JSON-RPC style requests
//! and replies, turns the inbound stream into a bounded per-session event log
//! for polling clients, brokers approvals, and runs the independent usage
//! telemetry connection.

use std::sync::{Mutex, MutexGuard};

pub mod app_server_protocol;
pub mod app_server_transport_runtime;
pub mod chat_history;
pub mod codex_session_runtime;
pub mod hazel_config;
pub mod hazel_paths;
pub mod notification_router;
pub mod rpc_correlator;
pub mod session_event_log;
pub mod session_hub_runtime;
pub mod task_context;
pub mod thread_index;
pub mod usage_projection;
pub mod usage_telemetry_runtime;

#[cfg(all(test, unix))]
mod fake_app_server;

pub use app_server_protocol::{
    parse_inbound_line, InboundFrame, ProtocolError, RpcErrorObject, RpcId, RpcOutcome,
};
pub use app_server_transport_runtime::{
    spawn_app_server, AppServerConnection, AppServerError, AppServerHandler, AppServerLaunchSpec,
    AppServerMode, DEFAULT_APP_SERVER_COMMAND, SESSION_RPC_TIMEOUT,
};
pub use chat_history::{
    latest_chat_session_for_task, list_chat_sessions, load_chat_session_events,
    ChatSessionSummary,
};
pub use codex_session_runtime::{
    ApprovalDecision, ApprovalRequest, CodexSession, PollResult, SessionError, SessionPhase,
    TurnResult,
};
pub use hazel_config::{load_hazel_config, resolve_repo_root, ApprovalPolicy, HazelConfig};
pub use session_event_log::{EventDraft, SessionEvent, SessionEventKind, SessionEventLog};
pub use session_hub_runtime::{HubConfig, SessionHub, SessionStartResult};
pub use usage_telemetry_runtime::{
    start_usage_telemetry, TelemetryLaunch, UsageSnapshot, UsageTelemetry, UsageTelemetryHandle,
};

pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
