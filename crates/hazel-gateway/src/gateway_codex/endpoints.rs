//! Route paths served by the chat gateway.

pub(super) const CODEX_SESSION_START_ENDPOINT: &str = "/api/codex/session/start";
pub(super) const CODEX_SESSION_POLL_ENDPOINT: &str = "/api/codex/session/poll";
pub(super) const CODEX_SESSION_STOP_ENDPOINT: &str = "/api/codex/session/stop";
pub(super) const CODEX_TURN_ENDPOINT: &str = "/api/codex/turn";
pub(super) const CODEX_APPROVAL_ENDPOINT: &str = "/api/codex/approval";
pub(super) const CODEX_USAGE_ENDPOINT: &str = "/api/codex/usage";
pub(super) const CODEX_HISTORY_ENDPOINT: &str = "/api/codex/history";
