//! Error types for the helper service.
//!
//! CHANGELOG:
//! - 10/17/2026 - Initial implementation

use std::path::PathBuf;
use thiserror::Error;

/// Failures inside the helper. None of these cross the process boundary as
/// errors: RPC outcomes are reported as optional results and the details stay
/// in the local log.
#[derive(Error, Debug)]
pub enum HelperError {
    #[error("failed to bind listener at {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("peer rejected: {0}")]
    Authorization(String),

    #[error("missing smc tool")]
    MissingTool,

    #[error("`{command}` wrote to stderr: {stderr}")]
    Execution { command: String, stderr: String },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("code signature: {0}")]
    Signature(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = HelperError> = std::result::Result<T, E>;
