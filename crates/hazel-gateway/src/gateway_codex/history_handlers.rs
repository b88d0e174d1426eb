use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hazel_runtime::list_chat_sessions;
use serde_json::json;

use super::types::{GatewayApiError, HistoryQuery};
use super::GatewayState;

pub(super) async fn handle_codex_usage(State(state): State<Arc<GatewayState>>) -> Response {
    (StatusCode::OK, Json(state.usage.snapshot())).into_response()
}

/// Lists persisted chat transcripts, newest first, optionally for one task.
pub(super) async fn handle_codex_history(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let mut sessions = match list_chat_sessions(&state.root) {
        Ok(sessions) => sessions,
        Err(error) => {
            return GatewayApiError::internal(format!("failed to list chat sessions: {error:#}"))
                .into_response()
        }
    };
    let task_id = query.task_id.trim();
    if !task_id.is_empty() {
        sessions.retain(|summary| summary.task_id == task_id);
    }
    (StatusCode::OK, Json(json!({ "sessions": sessions }))).into_response()
}
