//! smc-helper - privileged helper for fan control and power sampling.
//!
//! With no subcommand the helper runs as a service until its last client
//! disconnects. `uninstall <pid>` waits for `pid` to exit and then removes
//! the installed service.
//!
//! CHANGELOG:
//! - 10/17/2026 - Initial implementation

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use smc_helper::config::{expand_path, HelperConfig};
use smc_helper::helper::auth::{CodeSignatureAuthorizer, CodesignInspector};
use smc_helper::helper::executor::ExecMode;
use smc_helper::helper::lifecycle::{self, ReexecHandoff};

/// Privileged helper for fan control and power metrics sampling.
#[derive(Parser, Debug)]
#[command(name = "smc-helper")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Socket path (default: /var/run/<service-name>.sock)
    #[arg(long, global = true)]
    socket: Option<String>,

    /// Run commands through `/bin/sh -c` as a single string (legacy behavior)
    #[arg(long)]
    legacy_shell: bool,

    /// Fork into the background and write a pid file next to the socket
    #[arg(long)]
    detach: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Remove the installed helper once process <pid> has exited
    Uninstall {
        /// Process to wait for before removing anything (ignored if not a pid)
        pid: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .init();

    let mut config = HelperConfig::from_env();
    if let Some(socket) = &cli.socket {
        config.socket_path = expand_path(socket);
    }
    if cli.legacy_shell {
        config.exec_mode = ExecMode::LegacyShell;
    }

    match cli.command {
        Some(Command::Uninstall { pid }) => {
            let caller = lifecycle::parse_caller_pid(pid.as_deref());
            let report = lifecycle::run_uninstall(&config, caller);
            if !report.succeeded() {
                tracing::warn!(failed = ?report.failed_steps(), "uninstall finished with errors");
            }
            Ok(())
        }
        None => cmd_service(&config, cli.detach),
    }
}

/// `RUST_LOG` when set and valid, `info` otherwise.
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn cmd_service(config: &HelperConfig, detach: bool) -> Result<()> {
    if detach {
        use daemonize::Daemonize;

        // Removed by the service loop once the helper goes idle.
        let pid_file = config.pid_file_path();
        Daemonize::new()
            .pid_file(&pid_file)
            .working_directory("/")
            .start()
            .context("Failed to daemonize")?;
    }

    let authorizer = Arc::new(CodeSignatureAuthorizer::new(CodesignInspector::default()));
    let handoff = Box::new(ReexecHandoff::new(&config.executable_path));

    lifecycle::run_service(config, authorizer, handoff)
        .with_context(|| format!("helper service on {}", config.socket_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn test_uninstall_accepts_any_pid_argument() {
        let cli = Cli::try_parse_from(["smc-helper", "uninstall", "abc"]).unwrap();
        match cli.command {
            Some(Command::Uninstall { pid }) => {
                assert_eq!(pid.as_deref(), Some("abc"));
                assert_eq!(lifecycle::parse_caller_pid(pid.as_deref()), None);
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let cli = Cli::try_parse_from(["smc-helper", "uninstall"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Uninstall { pid: None })));
    }

    #[test]
    fn test_log_filter_follows_rust_log() {
        std::env::remove_var("RUST_LOG");
        assert_eq!(log_filter().max_level_hint(), Some(LevelFilter::INFO));

        std::env::set_var("RUST_LOG", "debug");
        assert_eq!(log_filter().max_level_hint(), Some(LevelFilter::DEBUG));
        std::env::remove_var("RUST_LOG");
    }
}
