//! Service loop and self-uninstallation.
//!
//! Uninstalling is a two-phase handoff. The running service spawns the
//! installed executable as `uninstall <pid>` and exits at once; the new
//! process waits for that pid to disappear before it removes any artifact, so
//! deletion never races the running service.
//!
//! CHANGELOG:
//! - 10/17/2026 - Initial implementation

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::HelperConfig;
use crate::error::{HelperError, Result};
use crate::helper::auth::Authorize;
use crate::helper::server::HelperServer;
use crate::helper::service::{HelperService, UninstallHandoff};
use crate::helper::state::ServiceState;

// ============================================================================
// Service mode
// ============================================================================

/// Bind, serve, and return once the last connection is gone.
pub fn run_service(
    config: &HelperConfig,
    authorizer: Arc<dyn Authorize>,
    handoff: Box<dyn UninstallHandoff>,
) -> Result<()> {
    let state = ServiceState::new();
    let service = Arc::new(HelperService::new(Arc::clone(&state), config, handoff));
    let server = HelperServer::bind(&config.socket_path, Arc::clone(&state), service, authorizer)?;
    server.spawn()?;

    wait_until_idle(&state, config.idle_poll);

    info!("idle, shutting down");
    if let Err(e) = std::fs::remove_file(&config.socket_path) {
        warn!("socket cleanup: {}", e);
    }
    remove_pid_file(config);
    Ok(())
}

/// Drop the detached-mode pid file, if one was written.
fn remove_pid_file(config: &HelperConfig) {
    let pid_file = config.pid_file_path();
    match std::fs::remove_file(&pid_file) {
        Ok(()) => info!("removed {}", pid_file.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("pid file cleanup: {}", e),
    }
}

/// Poll the shutdown flag once per interval until it is raised.
pub fn wait_until_idle(state: &ServiceState, interval: Duration) {
    while !state.wait_for_quit(interval) {}
}

/// Production handoff: re-spawn the installed helper in uninstall mode, then
/// terminate this process.
#[derive(Debug, Clone)]
pub struct ReexecHandoff {
    executable: PathBuf,
}

impl ReexecHandoff {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// `<executable> uninstall <pid>`, in its own process group.
    pub fn command(&self, pid: u32) -> Command {
        use std::os::unix::process::CommandExt;

        let mut cmd = Command::new(&self.executable);
        cmd.arg("uninstall").arg(pid.to_string()).process_group(0);
        cmd
    }
}

impl UninstallHandoff for ReexecHandoff {
    fn hand_off(&self, pid: u32) -> Result<()> {
        let child = self
            .command(pid)
            .spawn()
            .map_err(|source| HelperError::Spawn {
                command: format!("{} uninstall {}", self.executable.display(), pid),
                source,
            })?;
        info!(uninstaller = child.id(), "uninstaller started, exiting");
        std::process::exit(0);
    }
}

// ============================================================================
// Uninstall mode
// ============================================================================

/// Interpret the `uninstall` argument. Anything that is not a positive pid
/// is logged and ignored, so cleanup runs without waiting.
pub fn parse_caller_pid(arg: Option<&str>) -> Option<i32> {
    let raw = arg?;
    match raw.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Some(pid),
        _ => {
            warn!(arg = raw, "ignoring invalid caller pid");
            None
        }
    }
}

/// True while a process with this pid exists.
pub fn process_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid), None).is_ok()
}

/// Block until `pid` is gone. There is no timeout: if the process never
/// exits, neither does this.
pub fn wait_for_exit(pid: i32, interval: Duration) {
    while process_alive(pid) {
        thread::sleep(interval);
    }
}

/// Cleanup steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallStep {
    Unregister,
    RemoveDescriptor,
    RemoveExecutable,
}

impl fmt::Display for UninstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unregister => "unregister service",
            Self::RemoveDescriptor => "descriptor deletion",
            Self::RemoveExecutable => "helper deletion",
        };
        f.write_str(name)
    }
}

/// What happened to each cleanup step. Failures never stop later steps.
#[derive(Debug, Default)]
pub struct UninstallReport {
    pub outcomes: Vec<(UninstallStep, std::result::Result<(), String>)>,
}

impl UninstallReport {
    fn record(&mut self, step: UninstallStep, result: Result<()>) {
        match &result {
            Ok(()) => info!("{}: done", step),
            Err(e) => error!("{}: {}", step, e),
        }
        self.outcomes.push((step, result.map_err(|e| e.to_string())));
    }

    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(|(_, r)| r.is_ok())
    }

    pub fn failed_steps(&self) -> Vec<UninstallStep> {
        self.outcomes
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(step, _)| *step)
            .collect()
    }
}

/// Uninstall mode: wait for the caller to exit, then remove the service.
pub fn run_uninstall(config: &HelperConfig, caller: Option<i32>) -> UninstallReport {
    info!("detected uninstall command");
    if let Some(pid) = caller {
        wait_for_exit(pid, config.uninstall_poll);
        info!(pid, "caller exited");
    }

    if let Some(label) = descriptor_label(&config.descriptor_path) {
        info!(label = %label, "removing service");
    }

    let mut report = UninstallReport::default();
    report.record(
        UninstallStep::Unregister,
        unregister(&config.unregister_command),
    );
    report.record(
        UninstallStep::RemoveDescriptor,
        remove_artifact(&config.descriptor_path),
    );
    report.record(
        UninstallStep::RemoveExecutable,
        remove_artifact(&config.executable_path),
    );
    remove_pid_file(config);
    report
}

fn unregister(command: &[String]) -> Result<()> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| HelperError::Io(std::io::Error::other("empty unregister command")))?;

    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|source| HelperError::Spawn {
            command: command.join(" "),
            source,
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(HelperError::Execution {
            command: command.join(" "),
            stderr: format!("termination code: {}", status.code().unwrap_or(-1)),
        })
    }
}

fn remove_artifact(path: &Path) -> Result<()> {
    std::fs::remove_file(path)?;
    Ok(())
}

/// `Label` declared by a launchd property list descriptor, if readable.
pub fn descriptor_label(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("plist") {
        return None;
    }
    match plist::Value::from_file(path) {
        Ok(value) => value
            .as_dictionary()
            .and_then(|dict| dict.get("Label"))
            .and_then(|label| label.as_string())
            .map(str::to_string),
        Err(e) => {
            warn!("descriptor {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>eu.exelban.Stats.SMC.Helper</string>
    <key>MachServices</key>
    <dict>
        <key>eu.exelban.Stats.SMC.Helper</key>
        <true/>
    </dict>
</dict>
</plist>
"#;

    fn dead_pid() -> i32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        pid
    }

    fn config_in(dir: &Path) -> HelperConfig {
        HelperConfig {
            descriptor_path: dir.join("helper.plist"),
            executable_path: dir.join("helper"),
            unregister_command: vec!["true".to_string()],
            ..HelperConfig::default()
        }
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(process_alive(std::process::id() as i32));
    }

    #[test]
    fn test_reaped_child_is_not_alive() {
        assert!(!process_alive(dead_pid()));
    }

    #[test]
    fn test_uninstall_with_dead_caller_cleans_up_without_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::write(&config.descriptor_path, PLIST).unwrap();
        std::fs::write(&config.executable_path, b"binary").unwrap();

        let start = Instant::now();
        let report = run_uninstall(&config, Some(dead_pid()));
        assert!(start.elapsed() < Duration::from_secs(5));

        assert!(report.succeeded(), "{:?}", report);
        assert_eq!(report.outcomes.len(), 3);
        assert!(!config.descriptor_path.exists());
        assert!(!config.executable_path.exists());
    }

    #[test]
    fn test_uninstall_waits_for_caller() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::write(&config.executable_path, b"binary").unwrap();

        let mut child = Command::new("sleep").arg("0.3").spawn().unwrap();
        let pid = child.id() as i32;
        let reaper = thread::spawn(move || child.wait());

        let start = Instant::now();
        run_uninstall(&config, Some(pid));
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert!(!config.executable_path.exists());
        reaper.join().unwrap().unwrap();
    }

    #[test]
    fn test_failed_steps_do_not_stop_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.unregister_command = vec!["false".to_string()];
        // Descriptor missing, executable present.
        std::fs::write(&config.executable_path, b"binary").unwrap();

        let report = run_uninstall(&config, None);
        assert!(!report.succeeded());
        assert_eq!(
            report.failed_steps(),
            vec![UninstallStep::Unregister, UninstallStep::RemoveDescriptor]
        );
        assert!(!config.executable_path.exists());
    }

    #[test]
    fn test_parse_caller_pid() {
        assert_eq!(parse_caller_pid(Some("4242")), Some(4242));
        assert_eq!(parse_caller_pid(Some(" 17\n")), Some(17));
        assert_eq!(parse_caller_pid(None), None);
        assert_eq!(parse_caller_pid(Some("abc")), None);
        assert_eq!(parse_caller_pid(Some("")), None);
        assert_eq!(parse_caller_pid(Some("0")), None);
        assert_eq!(parse_caller_pid(Some("-1")), None);
    }

    #[test]
    fn test_unparsable_caller_pid_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::write(&config.descriptor_path, PLIST).unwrap();
        std::fs::write(&config.executable_path, b"binary").unwrap();

        let start = Instant::now();
        let report = run_uninstall(&config, parse_caller_pid(Some("abc")));
        assert!(start.elapsed() < Duration::from_secs(5));

        assert!(report.succeeded(), "{:?}", report);
        assert!(!config.descriptor_path.exists());
        assert!(!config.executable_path.exists());
    }

    #[test]
    fn test_uninstall_removes_leftover_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = HelperConfig {
            socket_path: dir.path().join("helper.sock"),
            ..config_in(dir.path())
        };
        std::fs::write(config.pid_file_path(), b"123\n").unwrap();

        run_uninstall(&config, None);
        assert!(!config.pid_file_path().exists());
    }

    #[test]
    fn test_service_removes_socket_and_pid_file_when_idle() {
        struct AllowAll;
        impl Authorize for AllowAll {
            fn validate(&self, _pid: i32) -> bool {
                true
            }
        }
        struct NoHandoff;
        impl UninstallHandoff for NoHandoff {
            fn hand_off(&self, _pid: u32) -> Result<()> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let config = HelperConfig {
            socket_path: dir.path().join("helper.sock"),
            idle_poll: Duration::from_millis(10),
            ..config_in(dir.path())
        };
        std::fs::write(config.pid_file_path(), b"123\n").unwrap();

        let service = {
            let config = config.clone();
            thread::spawn(move || run_service(&config, Arc::new(AllowAll), Box::new(NoHandoff)))
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while !config.socket_path.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        {
            use std::io::{BufRead, BufReader, Write};
            use std::os::unix::net::UnixStream;

            let mut stream = UnixStream::connect(&config.socket_path).unwrap();
            stream
                .write_all(b"{\"id\":\"1\",\"v\":1,\"method\":\"version\"}\n")
                .unwrap();
            let mut line = String::new();
            BufReader::new(&stream).read_line(&mut line).unwrap();
            assert!(line.contains("\"ok\":true"));
        }

        service.join().unwrap().unwrap();
        assert!(!config.socket_path.exists());
        assert!(!config.pid_file_path().exists());
    }

    #[test]
    fn test_unspawnable_unregister_command_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.unregister_command = vec!["/nonexistent/launchctl".to_string()];

        let report = run_uninstall(&config, None);
        assert_eq!(report.outcomes[0].0, UninstallStep::Unregister);
        assert!(report.outcomes[0].1.is_err());
        assert_eq!(report.outcomes.len(), 3);
    }

    #[test]
    fn test_descriptor_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helper.plist");
        std::fs::write(&path, PLIST).unwrap();
        assert_eq!(
            descriptor_label(&path).as_deref(),
            Some("eu.exelban.Stats.SMC.Helper")
        );

        std::fs::write(&path, "not a plist").unwrap();
        assert_eq!(descriptor_label(&path), None);
        assert_eq!(descriptor_label(&dir.path().join("helper.service")), None);
    }

    #[test]
    fn test_reexec_command_carries_pid() {
        let cmd = ReexecHandoff::new("/Library/PrivilegedHelperTools/helper").command(4242);
        assert_eq!(cmd.get_program(), "/Library/PrivilegedHelperTools/helper");
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, ["uninstall", "4242"]);
    }

    #[test]
    fn test_wait_until_idle_returns_after_last_removal() {
        let state = ServiceState::new();
        let id = state.add();
        let remover = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                state.remove(id);
            })
        };
        wait_until_idle(&state, Duration::from_millis(10));
        assert!(state.should_quit());
        remover.join().unwrap();
    }
}
