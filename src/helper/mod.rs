//! Privileged helper: listener, authorization, registry, command execution
//! and lifecycle.
//!
//! CHANGELOG:
//! - 10/17/2026 - Initial module structure

pub mod auth;
pub mod executor;
pub mod lifecycle;
pub mod protocol;
pub mod server;
pub mod service;
pub mod state;
