//! Helper protocol types for NDJSON communication over the UNIX socket.
//!
//! Request format:
//! ```json
//! {"id": "uuid", "v": 1, "method": "setFanMode", "params": {"id": 1, "mode": 2}}
//! ```
//!
//! Response format:
//! ```json
//! {"id": "uuid", "ok": true, "result": "...", "error": null, "meta": {...}}
//! ```
//!
//! RPC outcomes always travel as `ok: true` with an optional result. `ok:
//! false` is reserved for requests the helper could not understand.
//!
//! CHANGELOG:
//! - 10/17/2026 - Initial implementation

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;

pub const PROTOCOL_VERSION: u8 = 1;

/// Error codes carried in `ErrorInfo::code`.
pub mod codes {
    pub const INVALID_JSON: &str = "INVALID_JSON";
    pub const UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
}

/// NDJSON request from client to helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique request ID (UUID)
    pub id: String,
    /// Protocol version (currently 1)
    pub v: u8,
    /// Method name (e.g., "version", "setFanMode", "powermetrics")
    pub method: String,
    /// Method parameters
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

/// NDJSON response from helper to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Request ID (matches request)
    pub id: String,
    /// False only for malformed or unknown requests
    pub ok: bool,
    /// Result data; `null` when the operation produced no result
    pub result: Option<serde_json::Value>,
    /// Error information (if the request was rejected)
    pub error: Option<ErrorInfo>,
    /// Response metadata
    pub meta: ResponseMeta,
}

/// Error details in response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error code (see [`codes`])
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

/// Response metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    /// Server execution time in milliseconds
    pub server_ms: f64,
    /// Protocol version
    pub protocol_v: u8,
}

impl Request {
    /// Create a new request with a fresh id.
    pub fn new(method: impl Into<String>, params: HashMap<String, serde_json::Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            v: PROTOCOL_VERSION,
            method: method.into(),
            params,
        }
    }

    /// Parse request from NDJSON line.
    pub fn from_ndjson_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// Serialize request to NDJSON line.
    pub fn to_ndjson_line(&self) -> Result<String> {
        Ok(format!("{}\n", serde_json::to_string(self)?))
    }
}

impl Response {
    /// Create a success response.
    pub fn success(id: String, result: Option<serde_json::Value>, server_ms: f64) -> Self {
        Self {
            id,
            ok: true,
            result,
            error: None,
            meta: ResponseMeta {
                server_ms,
                protocol_v: PROTOCOL_VERSION,
            },
        }
    }

    /// Create an error response.
    pub fn error(id: String, code: &str, message: String, server_ms: f64) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ErrorInfo {
                code: code.to_string(),
                message,
            }),
            meta: ResponseMeta {
                server_ms,
                protocol_v: PROTOCOL_VERSION,
            },
        }
    }

    /// Parse response from NDJSON line.
    pub fn from_ndjson_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// Serialize response to NDJSON line.
    pub fn to_ndjson_line(&self) -> Result<String> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{}\n", json))
    }
}
