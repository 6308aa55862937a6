//! Helper service - the privileged operation set exposed to authorized peers.
//!
//! Every operation is safe to call concurrently from different connections;
//! the only shared mutable data is the tool path held in `ServiceState`.
//!
//! CHANGELOG:
//! - 10/17/2026 - Initial implementation

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};

use crate::config::HelperConfig;
use crate::error::{HelperError, Result};
use crate::helper::executor::{CommandSpec, Executor};
use crate::helper::protocol::codes;
use crate::helper::state::ServiceState;

/// Result text for fan commands issued before a tool path was configured.
pub const MISSING_TOOL: &str = "missing smc tool";

/// Second phase of the uninstall protocol: start the uninstaller for the given
/// pid and end the current process.
pub trait UninstallHandoff: Send + Sync {
    fn hand_off(&self, pid: u32) -> Result<()>;
}

/// Request the helper could not interpret. Maps onto `ok: false` responses.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownMethod(_) => codes::UNKNOWN_METHOD,
            Self::InvalidParams(_) => codes::INVALID_PARAMS,
        }
    }
}

type Params = HashMap<String, Value>;

/// Privileged operations behind the socket.
pub struct HelperService {
    state: Arc<ServiceState>,
    executor: Executor,
    sampler: String,
    handoff: Box<dyn UninstallHandoff>,
    started_at: String,
}

impl HelperService {
    pub fn new(
        state: Arc<ServiceState>,
        config: &HelperConfig,
        handoff: Box<dyn UninstallHandoff>,
    ) -> Self {
        Self {
            state,
            executor: Executor::new(config.exec_mode),
            sampler: config.sampler_program.clone(),
            handoff,
            started_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Dispatch request to appropriate handler.
    pub fn dispatch(
        &self,
        method: &str,
        params: &Params,
    ) -> std::result::Result<Option<Value>, DispatchError> {
        match method {
            "version" => Ok(Some(Value::String(self.version()))),
            "health" => Ok(Some(self.health())),
            "setSMCPath" => {
                self.set_tool_path(str_param(params, "path")?);
                Ok(None)
            }
            "setFanMode" => {
                let id = int_param(params, "id")?;
                let mode = int_param(params, "mode")?;
                Ok(self.set_fan_mode(id, mode).map(Value::String))
            }
            "setFanSpeed" => {
                let id = int_param(params, "id")?;
                let value = int_param(params, "value")?;
                Ok(self.set_fan_speed(id, value).map(Value::String))
            }
            "powermetrics" => {
                let samplers = string_list_param(params, "samplers")?;
                Ok(self.powermetrics(&samplers).map(Value::String))
            }
            "uninstall" => {
                self.uninstall();
                Ok(None)
            }
            _ => Err(DispatchError::UnknownMethod(method.to_string())),
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    pub fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// Store the hardware-control tool path. Existence is checked on first use
    /// by the spawn itself.
    pub fn set_tool_path(&self, path: &str) {
        info!(path, "tool path set");
        self.state.set_tool_path(path);
    }

    pub fn set_fan_mode(&self, id: i64, mode: i64) -> Option<String> {
        match self.fan_command(id, "-m", mode) {
            Ok(spec) => self.executor.run("set fan mode", &spec),
            Err(e) => Some(e.to_string()),
        }
    }

    pub fn set_fan_speed(&self, id: i64, value: i64) -> Option<String> {
        match self.fan_command(id, "-v", value) {
            Ok(spec) => self.executor.run("set fan speed", &spec),
            Err(e) => Some(e.to_string()),
        }
    }

    pub fn powermetrics(&self, samplers: &[String]) -> Option<String> {
        self.executor
            .run("call powermetrics", &self.sampler_command(samplers))
    }

    /// Start the uninstaller and terminate. A failed handoff keeps the service
    /// running so the client can retry.
    pub fn uninstall(&self) {
        info!("uninstall requested");
        if let Err(e) = self.handoff.hand_off(std::process::id()) {
            error!("uninstall handoff failed: {}", e);
        }
    }

    pub fn health(&self) -> Value {
        serde_json::json!({
            "pid": std::process::id(),
            "started_at": self.started_at,
            "version": self.version(),
            "connections": self.state.connection_count(),
            "tool_path_set": self.state.tool_path().is_some(),
            "exec_mode": format!("{:?}", self.executor.mode()),
        })
    }

    // ========================================================================
    // Command assembly
    // ========================================================================

    /// `<tool> fan <id> <flag> <value>`, or `MissingTool` when no path is set.
    pub fn fan_command(&self, id: i64, flag: &str, value: i64) -> Result<CommandSpec> {
        let tool = self.state.tool_path().ok_or(HelperError::MissingTool)?;
        Ok(CommandSpec::new(tool.to_string_lossy())
            .arg("fan")
            .arg(id)
            .arg(flag)
            .arg(value))
    }

    /// `powermetrics -n 1 -s <samplers> --sample-rate 1000`
    pub fn sampler_command(&self, samplers: &[String]) -> CommandSpec {
        CommandSpec::new(self.sampler.as_str())
            .arg("-n")
            .arg(1)
            .arg("-s")
            .arg(samplers.join(","))
            .arg("--sample-rate")
            .arg(1000)
    }
}

fn str_param<'a>(params: &'a Params, key: &str) -> std::result::Result<&'a str, DispatchError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| DispatchError::InvalidParams(format!("`{}` must be a string", key)))
}

fn int_param(params: &Params, key: &str) -> std::result::Result<i64, DispatchError> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| DispatchError::InvalidParams(format!("`{}` must be an integer", key)))
}

fn string_list_param(params: &Params, key: &str) -> std::result::Result<Vec<String>, DispatchError> {
    let invalid = || DispatchError::InvalidParams(format!("`{}` must be a list of strings", key));
    params
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(invalid)?
        .iter()
        .map(|v| v.as_str().map(str::to_string).ok_or_else(invalid))
        .collect()
}
