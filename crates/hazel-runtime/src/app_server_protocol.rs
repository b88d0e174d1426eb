//! Newline-delimited JSON frames spoken with the agent app-server over stdio.
//!
//! Outgoing frames are requests (`{id, method, params?}`), notifications
//! (`{method, params?}`) and responses to server-initiated requests
//! (`{id, result}` / `{id, error}`). Inbound lines are classified by shape into
//! replies, server requests and notifications before any method routing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const METHOD_NOT_FOUND_ERROR_CODE: i64 = -32601;

/// Request identifier as it appeared on the wire.
///
/// Internal bookkeeping uses [`RpcId::correlation_key`]; the original
/// representation is kept only to echo it back in a response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(i64),
    Text(String),
}

impl RpcId {
    pub fn correlation_key(&self) -> String {
        match self {
            Self::Number(value) => value.to_string(),
            Self::Text(value) => value.trim().to_string(),
        }
    }

    /// Rebuilds the wire id for a correlation key, preferring integers.
    pub fn from_correlation_key(key: &str) -> Self {
        let trimmed = key.trim();
        match trimmed.parse::<i64>() {
            Ok(value) if value.to_string() == trimmed => Self::Number(value),
            _ => Self::Text(trimmed.to_string()),
        }
    }

    fn from_wire(value: Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Number(number) => Some(match number.as_i64() {
                Some(value) => Self::Number(value),
                None => Self::Text(number.to_string()),
            }),
            Value::String(text) => Some(Self::Text(text)),
            other => Some(Self::Text(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self {
            code: METHOD_NOT_FOUND_ERROR_CODE,
            message: message.into(),
            data: None,
        }
    }
}

/// Outcome delivered to a pending request slot.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcOutcome {
    Result(Value),
    Error(RpcErrorObject),
    /// Synthetic outcome injected when the subprocess exits first.
    Terminated,
}

/// One inbound line after shape classification.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Reply {
        id: RpcId,
        outcome: RpcOutcome,
    },
    ServerRequest {
        id: RpcId,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    /// Neither a reply nor carrying a method.
    Unroutable,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a JSON object, found {0}")]
    NotAnObject(&'static str),
}

#[derive(Serialize)]
struct OutgoingRequest<'a> {
    id: i64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Serialize)]
struct OutgoingNotification<'a> {
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Serialize)]
struct OutgoingResponse<'a> {
    id: &'a RpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a RpcErrorObject>,
}

pub fn encode_request(id: i64, method: &str, params: Option<&Value>) -> serde_json::Result<String> {
    serde_json::to_string(&OutgoingRequest { id, method, params })
}

pub fn encode_notification(method: &str, params: Option<&Value>) -> serde_json::Result<String> {
    serde_json::to_string(&OutgoingNotification { method, params })
}

pub fn encode_result_response(id: &RpcId, result: &Value) -> serde_json::Result<String> {
    serde_json::to_string(&OutgoingResponse {
        id,
        result: Some(result),
        error: None,
    })
}

pub fn encode_error_response(id: &RpcId, error: &RpcErrorObject) -> serde_json::Result<String> {
    serde_json::to_string(&OutgoingResponse {
        id,
        result: None,
        error: Some(error),
    })
}

/// Classifies one raw inbound line.
///
/// An id plus a `result` member (any value) or a non-null `error` object is a
/// reply; an id with a method is a server request; a method without an id is
/// a notification.
pub fn parse_inbound_line(line: &[u8]) -> Result<InboundFrame, ProtocolError> {
    let value: Value = serde_json::from_slice(line)?;
    let kind = json_kind(&value);
    let Value::Object(mut frame) = value else {
        return Err(ProtocolError::NotAnObject(kind));
    };

    let id = frame.remove("id").and_then(RpcId::from_wire);
    let method = take_method(&mut frame);
    let params = frame.remove("params").unwrap_or(Value::Null);
    let error = match frame.remove("error") {
        Some(Value::Null) | None => None,
        Some(raw) => Some(serde_json::from_value::<RpcErrorObject>(raw)?),
    };

    if let Some(id) = id.as_ref() {
        if let Some(error) = error {
            return Ok(InboundFrame::Reply {
                id: id.clone(),
                outcome: RpcOutcome::Error(error),
            });
        }
        if let Some(result) = frame.remove("result") {
            return Ok(InboundFrame::Reply {
                id: id.clone(),
                outcome: RpcOutcome::Result(result),
            });
        }
    }

    if method.is_empty() {
        return Ok(InboundFrame::Unroutable);
    }
    Ok(match id {
        Some(id) => InboundFrame::ServerRequest { id, method, params },
        None => InboundFrame::Notification { method, params },
    })
}

fn take_method(frame: &mut Map<String, Value>) -> String {
    match frame.remove("method") {
        Some(Value::String(method)) => method,
        _ => String::new(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
