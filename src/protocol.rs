//! Wire protocol types for the phone ↔ host bridge.
//!
//! Every message is a JSON object:
//!   request  `{ "id": 1, "kind": "SEND_MESSAGE", "payload": { .. } }`
//!   response `{ "id": 1, "result": { .. } }` or `{ "id": 1, "error": { "message": ".." } }`
//!
//! A response carries exactly one of `result` / `error`. Successful results
//! are always JSON objects, never `null`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::contact::Character;
use crate::error::{BridgeError, ErrorKind, Result};

/// Unique per-request id so the client can match replies.
pub type RefId = u64;

// ── Requests ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    /// Inject a user message into the host chat.
    SendMessage,

    /// List the characters known to the host.
    GetCharacters,

    /// Read the host's chat variables.
    GetVariables,

    /// Show a toast in the host UI.
    ShowNotification,

    /// Snapshot of host capability flags.
    Diagnostics,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::SendMessage => "SEND_MESSAGE",
            RequestKind::GetCharacters => "GET_CHARACTERS",
            RequestKind::GetVariables => "GET_VARIABLES",
            RequestKind::ShowNotification => "SHOW_NOTIFICATION",
            RequestKind::Diagnostics => "DIAGNOSTICS",
        }
    }

    /// Check that `payload` has the shape this kind requires.
    pub fn validate_payload(self, payload: &Value) -> Result<()> {
        if !payload.is_object() {
            return Err(BridgeError::Validation(format!(
                "{} payload must be an object",
                self.as_str()
            )));
        }
        match self {
            RequestKind::SendMessage => {
                SendMessage::from_payload(payload)?;
            }
            RequestKind::ShowNotification => {
                Notification::from_payload(payload)?;
            }
            RequestKind::GetCharacters | RequestKind::GetVariables | RequestKind::Diagnostics => {}
        }
        Ok(())
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RefId,
    pub kind: RequestKind,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

impl Request {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(frame)?)
    }
}

// ── Responses ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RefId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn ok(id: RefId, result: impl Serialize) -> Self {
        let result = match serde_json::to_value(result) {
            Ok(Value::Null) => empty_object(),
            Ok(v) => v,
            Err(e) => return Self::failed(id, &BridgeError::Validation(e.to_string())),
        };
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(id: RefId, err: &BridgeError) -> Self {
        let message = match err {
            BridgeError::ActionFailed(m) | BridgeError::Validation(m) | BridgeError::Transport(m) => {
                m.clone()
            }
            other => other.to_string(),
        };
        Self {
            id,
            result: None,
            error: Some(WireError {
                message,
                kind: Some(err.kind()),
            }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_some()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and check that exactly one of `result` / `error` is present.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let response: Response = serde_json::from_slice(frame)?;
        match (&response.result, &response.error) {
            (Some(_), None) | (None, Some(_)) => Ok(response),
            (Some(_), Some(_)) => Err(BridgeError::Validation(format!(
                "response {} carries both result and error",
                response.id
            ))),
            (None, None) => Err(BridgeError::Validation(format!(
                "response {} carries neither result nor error",
                response.id
            ))),
        }
    }

    pub fn into_result(self) -> Result<Value> {
        match (self.result, self.error) {
            (Some(v), None) => Ok(v),
            (_, Some(e)) => Err(BridgeError::from_remote(
                e.kind.unwrap_or(ErrorKind::ActionFailed),
                e.message,
            )),
            (None, None) => Err(BridgeError::Validation(format!(
                "response {} carries neither result nor error",
                self.id
            ))),
        }
    }
}

// ── Payloads ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessage {
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SendMessage {
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let msg: SendMessage = serde_json::from_value(payload.clone())?;
        if msg.text.trim().is_empty() {
            return Err(BridgeError::Validation("message text is empty".into()));
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub message: String,
    #[serde(default)]
    pub level: NotificationLevel,
}

impl Notification {
    pub fn from_payload(payload: &Value) -> Result<Self> {
        Ok(serde_json::from_value(payload.clone())?)
    }
}

// ── Results ───────────────────────────────────────────────────────────

/// Result of `SEND_MESSAGE`: the strategy that delivered the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterList {
    pub characters: Vec<Character>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variables {
    pub variables: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    Host,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationReceipt {
    pub delivered: Delivery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub host_helper: bool,
    pub composer: bool,
    pub host_version: Option<String>,
    pub requests_in_flight: usize,
}

pub(crate) fn empty_object() -> Value {
    Value::Object(Map::new())
}
