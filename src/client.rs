//! Unix socket client for the helper.
//!
//! Keeps one connection open for its whole lifetime: the helper counts live
//! connections and shuts down once the last one closes.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

use crate::helper::protocol::{ErrorInfo, Request, Response};

/// Errors that can occur when communicating with the helper.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Socket not found: {0}")]
    SocketNotFound(PathBuf),

    #[error("Connection failed: {0}")]
    ConnectionFailed(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed by helper")]
    Closed,

    #[error("Response id {got} does not match request {expected}")]
    IdMismatch { expected: String, got: String },

    #[error("Helper rejected request ({code}): {message}")]
    Rejected { code: String, message: String },
}

/// A connected helper client.
pub struct HelperClient {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl HelperClient {
    /// Connect to the helper socket. `timeout` bounds each read and write.
    pub fn connect(socket_path: impl AsRef<Path>, timeout: Option<Duration>) -> Result<Self, ClientError> {
        let path = socket_path.as_ref();
        if !path.exists() {
            return Err(ClientError::SocketNotFound(path.to_path_buf()));
        }

        let stream = UnixStream::connect(path)?;
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    /// Send a request and wait for its response.
    pub fn call(&mut self, request: &Request) -> Result<Response, ClientError> {
        self.writer.write_all(request.to_ndjson_line().map_err(json_err)?.as_bytes())?;
        self.writer.flush()?;

        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(ClientError::Closed);
        }
        let response = Response::from_ndjson_line(&line).map_err(json_err)?;
        if response.id != request.id && !response.id.is_empty() {
            return Err(ClientError::IdMismatch {
                expected: request.id.clone(),
                got: response.id,
            });
        }
        Ok(response)
    }

    /// Call a method and unwrap the optional result.
    pub fn invoke(&mut self, method: &str, params: Value) -> Result<Option<Value>, ClientError> {
        let params: HashMap<String, Value> = match params {
            Value::Object(map) => map.into_iter().collect(),
            _ => HashMap::new(),
        };
        let response = self.call(&Request::new(method, params))?;
        match response.error {
            Some(ErrorInfo { code, message }) if !response.ok => {
                Err(ClientError::Rejected { code, message })
            }
            _ => Ok(response.result),
        }
    }

    fn invoke_string(&mut self, method: &str, params: Value) -> Result<Option<String>, ClientError> {
        Ok(self
            .invoke(method, params)?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    pub fn version(&mut self) -> Result<Option<String>, ClientError> {
        self.invoke_string("version", json!({}))
    }

    pub fn set_smc_path(&mut self, path: &str) -> Result<(), ClientError> {
        self.invoke("setSMCPath", json!({ "path": path }))?;
        Ok(())
    }

    pub fn set_fan_mode(&mut self, id: i64, mode: i64) -> Result<Option<String>, ClientError> {
        self.invoke_string("setFanMode", json!({ "id": id, "mode": mode }))
    }

    pub fn set_fan_speed(&mut self, id: i64, value: i64) -> Result<Option<String>, ClientError> {
        self.invoke_string("setFanSpeed", json!({ "id": id, "value": value }))
    }

    pub fn powermetrics(&mut self, samplers: &[&str]) -> Result<Option<String>, ClientError> {
        self.invoke_string("powermetrics", json!({ "samplers": samplers }))
    }

    /// Ask the helper to remove itself. The helper exits without a reliable
    /// reply, so a closed connection counts as success.
    pub fn uninstall(&mut self) -> Result<(), ClientError> {
        match self.invoke("uninstall", json!({})) {
            Ok(_) | Err(ClientError::Closed) => Ok(()),
            Err(ClientError::ConnectionFailed(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
                ) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn json_err(e: crate::error::HelperError) -> ClientError {
    match e {
        crate::error::HelperError::Json(e) => ClientError::Json(e),
        crate::error::HelperError::Io(e) => ClientError::ConnectionFailed(e),
        other => ClientError::ConnectionFailed(std::io::Error::other(other.to_string())),
    }
}
