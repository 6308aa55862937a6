//! Helper configuration: fixed identities, installed artifact paths and
//! polling intervals.
//!
//! Paths default per platform and can be overridden through environment
//! variables (tilde-expanded) and then through command-line flags.
//!
//! CHANGELOG:
//! - 10/17/2026 - Initial implementation

use std::path::PathBuf;
use std::time::Duration;

use crate::helper::executor::ExecMode;

/// Reverse-DNS service name shared by the helper and its client at build time.
pub const SERVICE_NAME: &str = "eu.exelban.Stats.SMC.Helper";

/// System sampler invoked by the `powermetrics` method (resolved on PATH).
pub const SAMPLER_PROGRAM: &str = "powermetrics";

pub const SOCKET_ENV: &str = "SMC_HELPER_SOCKET";
pub const DESCRIPTOR_ENV: &str = "SMC_HELPER_DESCRIPTOR";
pub const EXECUTABLE_ENV: &str = "SMC_HELPER_EXECUTABLE";

/// Runtime configuration for both invocation modes.
#[derive(Debug, Clone)]
pub struct HelperConfig {
    pub service_name: String,
    /// Unix socket the listener binds.
    pub socket_path: PathBuf,
    /// Service manager descriptor removed on uninstall.
    pub descriptor_path: PathBuf,
    /// Installed helper executable; re-spawned for the uninstall handoff and
    /// removed on uninstall.
    pub executable_path: PathBuf,
    /// Command that unregisters the service from the service manager.
    pub unregister_command: Vec<String>,
    pub sampler_program: String,
    pub exec_mode: ExecMode,
    /// Interval between idle-shutdown checks in service mode.
    pub idle_poll: Duration,
    /// Interval between liveness checks of the caller in uninstall mode.
    pub uninstall_poll: Duration,
}

impl Default for HelperConfig {
    fn default() -> Self {
        let descriptor_path = default_descriptor_path(SERVICE_NAME);
        Self {
            service_name: SERVICE_NAME.to_string(),
            socket_path: PathBuf::from(format!("/var/run/{}.sock", SERVICE_NAME)),
            unregister_command: default_unregister_command(SERVICE_NAME, &descriptor_path),
            descriptor_path,
            executable_path: default_executable_path(SERVICE_NAME),
            sampler_program: SAMPLER_PROGRAM.to_string(),
            exec_mode: ExecMode::Direct,
            idle_poll: Duration::from_secs(1),
            uninstall_poll: Duration::from_millis(50),
        }
    }
}

impl HelperConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = env_path(SOCKET_ENV) {
            config.socket_path = path;
        }
        if let Some(path) = env_path(DESCRIPTOR_ENV) {
            config.unregister_command = default_unregister_command(&config.service_name, &path);
            config.descriptor_path = path;
        }
        if let Some(path) = env_path(EXECUTABLE_ENV) {
            config.executable_path = path;
        }
        config
    }

    /// Pid file written next to the socket by a detached service.
    pub fn pid_file_path(&self) -> PathBuf {
        let mut path = self.socket_path.clone().into_os_string();
        path.push(".pid");
        PathBuf::from(path)
    }
}

/// Expand a user-supplied path (`~/...`) into an absolute one.
pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).to_string())
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(|v| expand_path(&v))
}

#[cfg(target_os = "macos")]
fn default_descriptor_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/Library/LaunchDaemons/{}.plist", name))
}

#[cfg(not(target_os = "macos"))]
fn default_descriptor_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/etc/systemd/system/{}.service", name))
}

#[cfg(target_os = "macos")]
fn default_executable_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/Library/PrivilegedHelperTools/{}", name))
}

#[cfg(not(target_os = "macos"))]
fn default_executable_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/usr/local/libexec/{}", name))
}

#[cfg(target_os = "macos")]
fn default_unregister_command(_name: &str, descriptor: &std::path::Path) -> Vec<String> {
    vec![
        "/bin/launchctl".to_string(),
        "unload".to_string(),
        descriptor.to_string_lossy().to_string(),
    ]
}

#[cfg(not(target_os = "macos"))]
fn default_unregister_command(name: &str, _descriptor: &std::path::Path) -> Vec<String> {
    vec![
        "systemctl".to_string(),
        "disable".to_string(),
        "--now".to_string(),
        format!("{}.service", name),
    ]
}
