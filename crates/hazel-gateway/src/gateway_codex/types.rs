use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hazel_runtime::SessionError;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug)]
pub(super) struct GatewayApiError {
    pub(super) status: StatusCode,
    pub(super) code: &'static str,
    pub(super) message: String,
}

impl GatewayApiError {
    pub(super) fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub(super) fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub(super) fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub(super) fn gateway_failure(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "agent_runtime_error", message)
    }

    pub(super) fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_server_error",
            message,
        )
    }
}

impl IntoResponse for GatewayApiError {
    fn into_response(self) -> Response {
        let error_type = if self.status.is_client_error() {
            "invalid_request_error"
        } else {
            "server_error"
        };
        (
            self.status,
            Json(json!({
                "error": {
                    "type": error_type,
                    "code": self.code,
                    "message": self.message,
                }
            })),
        )
            .into_response()
    }
}

impl From<SessionError> for GatewayApiError {
    fn from(error: SessionError) -> Self {
        let message = error.to_string();
        match error {
            SessionError::MissingSessionId => Self::bad_request("missing_session_id", message),
            SessionError::EmptyPrompt => Self::bad_request("missing_prompt", message),
            SessionError::MissingRequestId => Self::bad_request("missing_request_id", message),
            SessionError::UnsupportedDecision(_) => {
                Self::bad_request("unsupported_decision", message)
            }
            SessionError::NoThreadId => Self::bad_request("session_not_ready", message),
            SessionError::UnknownSession(_) => Self::not_found("session_not_found", message),
            SessionError::ApprovalNotFound(_) => Self::not_found("approval_not_found", message),
            SessionError::Config(_) => Self::internal(message),
            SessionError::Initialize(_)
            | SessionError::InitializedNotification(_)
            | SessionError::ThreadStart(_)
            | SessionError::EmptyThreadId
            | SessionError::Transport(_) => Self::gateway_failure(message),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct SessionStartForm {
    #[serde(default)]
    pub(super) task_id: String,
    #[serde(default)]
    pub(super) restart: String,
}

impl SessionStartForm {
    pub(super) fn restart_requested(&self) -> bool {
        self.restart.trim() == "1"
    }
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct SessionPollQuery {
    #[serde(default)]
    pub(super) session_id: String,
    #[serde(default)]
    pub(super) cursor: String,
}

impl SessionPollQuery {
    /// Non-numeric cursors read as 0.
    pub(super) fn cursor_value(&self) -> i64 {
        self.cursor.trim().parse::<i64>().unwrap_or(0)
    }
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct TurnForm {
    #[serde(default)]
    pub(super) session_id: String,
    #[serde(default)]
    pub(super) prompt: String,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct ApprovalForm {
    #[serde(default)]
    pub(super) session_id: String,
    #[serde(default)]
    pub(super) request_id: String,
    #[serde(default)]
    pub(super) decision: String,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct SessionStopForm {
    #[serde(default)]
    pub(super) session_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct HistoryQuery {
    #[serde(default)]
    pub(super) task_id: String,
}
