//! JSON-RPC shapes exchanged with HTTP callers and with the upstream worker.
//!
//! The bridge does not interpret params or results. It only needs the envelope
//! members that drive routing (`id`, `method`) and passes everything else through.
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::BridgeError;

/// A JSON-RPC request identifier. `1` and `"1"` are different identifiers.
///
/// Any JSON number is kept as written, including fractions and values past `i64`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(Number),
    String(String),
}

impl RequestId {
    /// A fresh opaque identifier for requests that arrive without one.
    pub fn generate() -> Self {
        RequestId::String(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value.into())
    }
}

/// A request body as received on the relay endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// `params` and any other members, forwarded untouched.
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl JsonRpcMessage {
    pub fn from_slice(body: &[u8]) -> Result<Self, BridgeError> {
        serde_json::from_slice(body).map_err(|e| BridgeError::InvalidRequest(e.to_string()))
    }

    /// Serialize as a single newline-terminated line for the upstream stream.
    pub fn to_line(&self) -> Result<String, BridgeError> {
        let mut line =
            serde_json::to_string(self).map_err(|e| BridgeError::InvalidRequest(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    pub fn method_name(&self) -> &str {
        self.method.as_deref().unwrap_or_default()
    }
}

/// One structured message read from the upstream worker.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub id: Option<RequestId>,
    /// Responses carry no `method`; requests and notifications from the worker do.
    pub is_response: bool,
    pub body: Value,
}

impl InboundMessage {
    /// Returns `None` for anything that is not a JSON object (worker log output).
    pub fn parse(line: &str) -> Option<Self> {
        let body: Value = serde_json::from_str(line).ok()?;
        let object = body.as_object()?;
        let id = object
            .get("id")
            .and_then(|id| RequestId::deserialize(id).ok());
        let is_response = !object.contains_key("method");

        Some(Self {
            id,
            is_response,
            body,
        })
    }
}
