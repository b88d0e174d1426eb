//! Method routing for app-server notifications and server-initiated requests.
//!
//! Only the methods listed here reach the event stream. Everything else lands
//! in the `Ignored` / `Unsupported` arms; new upstream methods must be added to
//! the tables deliberately.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

pub const THREAD_STARTED_METHOD: &str = "thread/started";
pub const AGENT_MESSAGE_DELTA_METHOD: &str = "item/agentMessage/delta";
pub const COMMAND_OUTPUT_DELTA_METHOD: &str = "item/commandExecution/outputDelta";
pub const COMMAND_STARTED_METHOD: &str = "item/commandExecution/started";
pub const ITEM_COMPLETED_METHOD: &str = "item/completed";
pub const TURN_STARTED_METHOD: &str = "turn/started";
pub const TURN_COMPLETED_METHOD: &str = "turn/completed";
pub const ERROR_METHOD: &str = "error";
pub const RATE_LIMITS_UPDATED_METHOD: &str = "account/rateLimits/updated";

pub const COMMAND_APPROVAL_METHOD: &str = "item/commandExecution/requestApproval";
pub const FILE_CHANGE_APPROVAL_METHOD: &str = "item/fileChange/requestApproval";
pub const TOOL_USER_INPUT_METHOD: &str = "item/tool/requestUserInput";

pub const AGENT_MESSAGE_ITEM_TYPE: &str = "agentMessage";

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ThreadRef {
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ThreadStartedParams {
    pub thread: Option<ThreadRef>,
}

impl ThreadStartedParams {
    pub fn thread_id(&self) -> &str {
        self.thread
            .as_ref()
            .map(|thread| thread.id.trim())
            .unwrap_or_default()
    }
}

/// Streaming delta for an agent message or command output item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ItemDeltaParams {
    #[serde(deserialize_with = "lenient_string")]
    pub thread_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub turn_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub item_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub delta: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CommandStartedParams {
    #[serde(deserialize_with = "lenient_string")]
    pub thread_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub turn_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub item_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CompletedItem {
    #[serde(rename = "type", deserialize_with = "lenient_string")]
    pub kind: String,
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ItemCompletedParams {
    #[serde(deserialize_with = "lenient_string")]
    pub thread_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub turn_id: String,
    pub item: Option<CompletedItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TurnRef {
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TurnParams {
    #[serde(deserialize_with = "lenient_string")]
    pub thread_id: String,
    pub turn: Option<TurnRef>,
}

impl TurnParams {
    pub fn turn(&self) -> TurnRef {
        self.turn.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ErrorDetail {
    #[serde(deserialize_with = "lenient_string")]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorNotificationParams {
    #[serde(deserialize_with = "lenient_string")]
    pub thread_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub turn_id: String,
    pub error: Option<ErrorDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CommandApprovalParams {
    #[serde(deserialize_with = "lenient_string")]
    pub thread_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub turn_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub item_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub reason: String,
    #[serde(deserialize_with = "lenient_string")]
    pub command: String,
    #[serde(deserialize_with = "lenient_string")]
    pub cwd: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileChangeApprovalParams {
    #[serde(deserialize_with = "lenient_string")]
    pub reason: String,
}

/// Typed view of an inbound notification.
#[derive(Debug, Clone, PartialEq)]
pub enum AppServerNotification {
    ThreadStarted(ThreadStartedParams),
    AgentMessageDelta(ItemDeltaParams),
    CommandOutputDelta(ItemDeltaParams),
    CommandStarted(CommandStartedParams),
    ItemCompleted(ItemCompletedParams),
    TurnStarted(TurnParams),
    TurnCompleted(TurnParams),
    Error(ErrorNotificationParams),
    RateLimitsUpdated(Value),
    /// A routed method whose params did not decode; dropped like unknown ones.
    Malformed { method: String, error: String },
    /// Any method outside the table. Dropped on purpose.
    Ignored { method: String },
}

/// Typed view of a server-initiated request.
#[derive(Debug, Clone, PartialEq)]
pub enum AppServerRequest {
    CommandExecutionApproval(CommandApprovalParams),
    FileChangeApproval(FileChangeApprovalParams),
    ToolRequestUserInput,
    Unsupported,
}

pub fn route_notification(method: &str, params: Value) -> AppServerNotification {
    fn decode<T, F>(method: &str, params: Value, wrap: F) -> AppServerNotification
    where
        T: for<'de> Deserialize<'de>,
        F: FnOnce(T) -> AppServerNotification,
    {
        match serde_json::from_value::<T>(params) {
            Ok(decoded) => wrap(decoded),
            Err(error) => AppServerNotification::Malformed {
                method: method.to_string(),
                error: error.to_string(),
            },
        }
    }

    match method {
        THREAD_STARTED_METHOD => decode(method, params, AppServerNotification::ThreadStarted),
        AGENT_MESSAGE_DELTA_METHOD => {
            decode(method, params, AppServerNotification::AgentMessageDelta)
        }
        COMMAND_OUTPUT_DELTA_METHOD => {
            decode(method, params, AppServerNotification::CommandOutputDelta)
        }
        COMMAND_STARTED_METHOD => decode(method, params, AppServerNotification::CommandStarted),
        ITEM_COMPLETED_METHOD => decode(method, params, AppServerNotification::ItemCompleted),
        TURN_STARTED_METHOD => decode(method, params, AppServerNotification::TurnStarted),
        TURN_COMPLETED_METHOD => decode(method, params, AppServerNotification::TurnCompleted),
        ERROR_METHOD => decode(method, params, AppServerNotification::Error),
        RATE_LIMITS_UPDATED_METHOD => AppServerNotification::RateLimitsUpdated(params),
        _ => AppServerNotification::Ignored {
            method: method.to_string(),
        },
    }
}

/// Approval params decode leniently: a malformed payload still yields an
/// approval with empty descriptive fields.
pub fn route_server_request(method: &str, params: Value) -> AppServerRequest {
    match method {
        COMMAND_APPROVAL_METHOD => AppServerRequest::CommandExecutionApproval(
            serde_json::from_value(params).unwrap_or_default(),
        ),
        FILE_CHANGE_APPROVAL_METHOD => {
            AppServerRequest::FileChangeApproval(serde_json::from_value(params).unwrap_or_default())
        }
        TOOL_USER_INPUT_METHOD => AppServerRequest::ToolRequestUserInput,
        _ => AppServerRequest::Unsupported,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn functional_route_notification_decodes_known_methods() {
        let delta = route_notification(
            AGENT_MESSAGE_DELTA_METHOD,
            json!({"threadId": "th", "turnId": "tu", "itemId": "it", "delta": "Hel"}),
        );
        assert_eq!(
            delta,
            AppServerNotification::AgentMessageDelta(ItemDeltaParams {
                thread_id: "th".to_string(),
                turn_id: "tu".to_string(),
                item_id: "it".to_string(),
                delta: "Hel".to_string(),
            })
        );

        let completed = route_notification(
            TURN_COMPLETED_METHOD,
            json!({"threadId": "th", "turn": {"id": "tu", "status": "completed"}}),
        );
        let AppServerNotification::TurnCompleted(params) = completed else {
            panic!("expected turn completed");
        };
        assert_eq!(params.turn().status, "completed");

        let started = route_notification(THREAD_STARTED_METHOD, json!({"thread": {"id": " t1 "}}));
        let AppServerNotification::ThreadStarted(params) = started else {
            panic!("expected thread started");
        };
        assert_eq!(params.thread_id(), "t1");
    }

    #[test]
    fn functional_route_notification_ignores_unknown_methods() {
        assert_eq!(
            route_notification("item/reasoning/delta", json!({"delta": "x"})),
            AppServerNotification::Ignored {
                method: "item/reasoning/delta".to_string()
            }
        );
    }

    #[test]
    fn regression_route_notification_tolerates_null_fields_but_not_missing_params() {
        let routed = route_notification(
            COMMAND_STARTED_METHOD,
            json!({"threadId": null, "turnId": "tu", "itemId": "it", "command": "ls"}),
        );
        let AppServerNotification::CommandStarted(params) = routed else {
            panic!("expected command started");
        };
        assert_eq!(params.thread_id, "");
        assert_eq!(params.command, "ls");

        assert!(matches!(
            route_notification(TURN_STARTED_METHOD, Value::Null),
            AppServerNotification::Malformed { .. }
        ));
    }

    #[test]
    fn unit_route_server_request_maps_approvals_and_defaults() {
        let routed = route_server_request(
            COMMAND_APPROVAL_METHOD,
            json!({"command": "cargo test", "cwd": "/repo", "reason": null}),
        );
        let AppServerRequest::CommandExecutionApproval(params) = routed else {
            panic!("expected command approval");
        };
        assert_eq!(params.command, "cargo test");
        assert_eq!(params.cwd, "/repo");
        assert_eq!(params.reason, "");

        assert_eq!(
            route_server_request(FILE_CHANGE_APPROVAL_METHOD, json!("garbage")),
            AppServerRequest::FileChangeApproval(FileChangeApprovalParams::default())
        );
        assert_eq!(
            route_server_request(TOOL_USER_INPUT_METHOD, Value::Null),
            AppServerRequest::ToolRequestUserInput
        );
        assert_eq!(
            route_server_request("item/unknown/request", Value::Null),
            AppServerRequest::Unsupported
        );
    }
}
