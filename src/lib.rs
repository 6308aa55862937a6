//! smc-helper library
//!
//! Exposes modules for use by the helper and client binaries.
//!
//! CHANGELOG:
//! - 10/17/2026 - Initial library structure

pub mod client;
pub mod config;
pub mod error;
pub mod helper;

pub use error::{HelperError, Result};
