//! Subprocess execution for privileged tools.
//!
//! Commands are assembled as program + argument list. By default the argument
//! vector goes straight to the program. `ExecMode::LegacyShell` keeps the old
//! contract of handing the whole command line to `/bin/sh -c` as one string,
//! which exposes callers to shell metacharacters in any argument.
//!
//! Success is decided by stderr alone: empty stderr means the captured stdout
//! is the result whatever the exit code was; any stderr output means no result.
//!
//! CHANGELOG:
//! - 10/17/2026 - Initial implementation

use std::fmt;
use std::process::{Command, Stdio};

use tracing::{debug, error, warn};

use crate::error::{HelperError, Result};

const LEGACY_SHELL: &str = "/bin/sh";

/// How an assembled command reaches the operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// Program and arguments passed as a vector, no shell involved.
    #[default]
    Direct,
    /// Joined command line passed to `/bin/sh -c`.
    LegacyShell,
}

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Command line as the legacy shell mode hands it to `/bin/sh -c`.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Build the `std::process::Command` for the given mode.
    pub fn to_command(&self, mode: ExecMode) -> Command {
        match mode {
            ExecMode::Direct => {
                let mut cmd = Command::new(&self.program);
                cmd.args(&self.args);
                cmd
            }
            ExecMode::LegacyShell => {
                let mut cmd = Command::new(LEGACY_SHELL);
                cmd.arg("-c").arg(self.command_line());
                cmd
            }
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Captured output of a finished subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Apply the stderr-only success rule.
    pub fn into_result(self, command: &CommandSpec) -> Result<String> {
        if self.stderr.is_empty() {
            Ok(self.stdout)
        } else {
            Err(HelperError::Execution {
                command: command.to_string(),
                stderr: self.stderr,
            })
        }
    }
}

/// Runs command specs. Stateless, safe to share across connection threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct Executor {
    mode: ExecMode,
}

impl Executor {
    pub fn new(mode: ExecMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    /// Run to completion and capture both streams. Blocks until the tool exits.
    pub fn capture(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec, mode = ?self.mode, "spawning");
        let output = spec
            .to_command(self.mode)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| HelperError::Spawn {
                command: spec.to_string(),
                source,
            })?;

        debug!(command = %spec, status = ?output.status, "finished");
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run and reduce to the optional result returned to clients. Failures are
    /// logged here and never leave the process.
    pub fn run(&self, context: &str, spec: &CommandSpec) -> Option<String> {
        match self.capture(spec).and_then(|out| out.into_result(spec)) {
            Ok(stdout) => Some(stdout),
            Err(HelperError::Execution { stderr, .. }) => {
                warn!("error {}: {}", context, stderr.trim_end());
                None
            }
            Err(e) => {
                error!("error {}: {}", context, e);
                None
            }
        }
    }
}
