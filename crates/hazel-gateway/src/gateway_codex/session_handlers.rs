use std::sync::Arc;

use axum::extract::rejection::{FormRejection, QueryRejection};
use axum::extract::{Form, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::debug;

use super::types::{
    ApprovalForm, GatewayApiError, SessionPollQuery, SessionStartForm, SessionStopForm, TurnForm,
};
use super::GatewayState;

pub(super) async fn handle_codex_session_start(
    State(state): State<Arc<GatewayState>>,
    form: Result<Form<SessionStartForm>, FormRejection>,
) -> Response {
    let request = match parse_form(form) {
        Ok(request) => request,
        Err(error) => return error.into_response(),
    };
    match state
        .hub
        .start(&state.root, &request.task_id, request.restart_requested())
        .await
    {
        Ok(started) => (StatusCode::OK, Json(started)).into_response(),
        Err(error) => GatewayApiError::from(error).into_response(),
    }
}

pub(super) async fn handle_codex_session_poll(
    State(state): State<Arc<GatewayState>>,
    query: Result<Query<SessionPollQuery>, QueryRejection>,
) -> Response {
    let query = match query {
        Ok(Query(query)) => query,
        Err(rejection) => {
            return GatewayApiError::bad_request("invalid_query", rejection.body_text())
                .into_response()
        }
    };
    match state.hub.poll(&query.session_id, query.cursor_value()) {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(error) => GatewayApiError::from(error).into_response(),
    }
}

pub(super) async fn handle_codex_turn(
    State(state): State<Arc<GatewayState>>,
    form: Result<Form<TurnForm>, FormRejection>,
) -> Response {
    let request = match parse_form(form) {
        Ok(request) => request,
        Err(error) => return error.into_response(),
    };
    match state
        .hub
        .send_user_message(&request.session_id, &request.prompt)
        .await
    {
        Ok(turn) => (StatusCode::OK, Json(turn)).into_response(),
        Err(error) => GatewayApiError::from(error).into_response(),
    }
}

pub(super) async fn handle_codex_approval(
    State(state): State<Arc<GatewayState>>,
    form: Result<Form<ApprovalForm>, FormRejection>,
) -> Response {
    let request = match parse_form(form) {
        Ok(request) => request,
        Err(error) => return error.into_response(),
    };
    match state
        .hub
        .resolve_approval(&request.session_id, &request.request_id, &request.decision)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => GatewayApiError::from(error).into_response(),
    }
}

pub(super) async fn handle_codex_session_stop(
    State(state): State<Arc<GatewayState>>,
    form: Result<Form<SessionStopForm>, FormRejection>,
) -> Response {
    let request = match parse_form(form) {
        Ok(request) => request,
        Err(error) => return error.into_response(),
    };
    match state.hub.stop(&request.session_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => GatewayApiError::from(error).into_response(),
    }
}

fn parse_form<T>(form: Result<Form<T>, FormRejection>) -> Result<T, GatewayApiError> {
    match form {
        Ok(Form(request)) => Ok(request),
        Err(rejection) => {
            debug!(status = %rejection.status(), "rejected form body");
            Err(GatewayApiError::bad_request(
                "invalid_form_body",
                rejection.body_text(),
            ))
        }
    }
}
