/// Line-delimited JSON-RPC framing for the Electrum protocol
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

pub type RequestId = u32;

#[derive(Debug, Clone, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: &'a str,
    pub params: &'a [Value],
}

impl<'a> Request<'a> {
    pub fn new(id: RequestId, method: &'a str, params: &'a [Value]) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }

    /// One line, newline-terminated.
    pub fn encode(&self) -> Result<String, SyncError> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| SyncError::Client(format!("failed to encode request: {}", e)))?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// A decoded line from the server
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response {
        id: RequestId,
        result: Result<Value, RpcError>,
    },
    Notification {
        method: String,
        params: Vec<Value>,
    },
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

pub fn decode(line: &str) -> Result<Incoming, SyncError> {
    let raw: RawMessage = serde_json::from_str(line)
        .map_err(|e| SyncError::Protocol(format!("malformed message: {}", e)))?;

    match (raw.id, raw.method) {
        (Some(id), _) if !id.is_null() => {
            let id = id
                .as_u64()
                .and_then(|id| RequestId::try_from(id).ok())
                .ok_or_else(|| SyncError::Protocol(format!("unexpected response id {}", id)))?;
            let result = match raw.error {
                Some(err) if !err.is_null() => Err(parse_rpc_error(err)),
                _ => Ok(raw.result.unwrap_or(Value::Null)),
            };
            Ok(Incoming::Response { id, result })
        }
        (_, Some(method)) => {
            let params = match raw.params {
                Some(Value::Array(params)) => params,
                Some(Value::Null) | None => Vec::new(),
                Some(other) => vec![other],
            };
            Ok(Incoming::Notification { method, params })
        }
        _ => Err(SyncError::Protocol(
            "message has neither an id nor a method".into(),
        )),
    }
}

fn parse_rpc_error(err: Value) -> RpcError {
    match err {
        Value::String(message) => RpcError { code: 0, message },
        other => serde_json::from_value(other.clone()).unwrap_or(RpcError {
            code: 0,
            message: other.to_string(),
        }),
    }
}
