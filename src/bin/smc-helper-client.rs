//! smc-helper-client - Thin client for the helper socket.
//!
//! CHANGELOG:
//! - 10/17/2026 - Initial implementation

use anyhow::Result;
use clap::Parser;
use std::time::Duration;

use smc_helper::client::HelperClient;
use smc_helper::config::{expand_path, HelperConfig};

#[derive(Parser)]
#[command(name = "smc-helper-client")]
#[command(about = "Thin client for the smc-helper service")]
struct Cli {
    /// Method to call (version, setSMCPath, setFanMode, setFanSpeed, powermetrics, uninstall, health)
    method: String,

    /// Socket path
    #[arg(long)]
    socket: Option<String>,

    /// JSON parameters (as string)
    #[arg(long)]
    params: Option<String>,

    /// Request timeout (seconds)
    #[arg(long, default_value = "30.0")]
    timeout: f64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Parse params JSON
    let params: serde_json::Value = match cli.params {
        Some(p) => serde_json::from_str(&p)?,
        None => serde_json::json!({}),
    };

    let socket_path = match cli.socket {
        Some(s) => expand_path(&s),
        None => HelperConfig::from_env().socket_path,
    };
    let mut client =
        HelperClient::connect(&socket_path, Some(Duration::from_secs_f64(cli.timeout)))?;

    if cli.method == "uninstall" {
        client.uninstall()?;
        println!("uninstall requested");
        return Ok(());
    }

    match client.invoke(&cli.method, params) {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
