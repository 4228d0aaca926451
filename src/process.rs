//! Centralized command execution with consistent error handling.
//!
//! Every external tool the provisioner and the services depend on goes
//! through [`Cmd`]. Callers that need to be testable take a
//! [`CommandRunner`] instead of spawning directly, so tests can swap in a
//! [`ScriptedRunner`] that records command lines without touching the host.

use anyhow::{bail, Context, Result};
use std::cell::RefCell;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout as a string.
    pub stdout: String,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Get stdout, trimmed of whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Get stderr, trimmed of whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for configuring command execution.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    /// Text written to the child's stdin.
    input: Option<String>,
    /// Inherit the terminal instead of capturing output.
    interactive: bool,
    /// Custom error message prefix.
    error_prefix: Option<String>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            input: None,
            interactive: false,
            error_prefix: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Feed `text` to the command's stdin.
    pub fn input(mut self, text: impl AsRef<str>) -> Self {
        self.input = Some(text.as_ref().to_string());
        self
    }

    /// Stream output straight to the terminal (long-running commands
    /// whose progress the operator should see).
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// The command line as a single space-joined string (for logs).
    pub fn display(&self) -> String {
        self.argv().join(" ")
    }

    /// Same command run through `sudo`.
    pub fn elevated(&self) -> Self {
        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(self.program.clone());
        args.extend(self.args.iter().cloned());
        Self {
            program: "sudo".to_string(),
            args,
            ..self.clone()
        }
    }

    /// Spawn the command and wait, without judging the exit status.
    ///
    /// Only a failure to start the program is an error here.
    pub fn output(&self) -> Result<CommandResult> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        if self.interactive {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }
        cmd.stdin(match (&self.input, self.interactive) {
            (Some(_), _) => Stdio::piped(),
            (None, true) => Stdio::inherit(),
            (None, false) => Stdio::null(),
        });

        let mut child = cmd.spawn().with_context(|| {
            format!("Failed to execute '{}'. Is it installed?", self.program)
        })?;

        if let Some(ref input) = self.input {
            // Dropping the handle closes stdin so the child sees EOF.
            let mut stdin = child
                .stdin
                .take()
                .context("child stdin was not captured")?;
            stdin
                .write_all(input.as_bytes())
                .with_context(|| format!("Failed to write stdin of '{}'", self.program))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for '{}'", self.program))?;

        Ok(CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Turn a non-zero exit into an error carrying stderr.
    pub fn check(&self, result: &CommandResult) -> Result<()> {
        if result.success() {
            return Ok(());
        }
        let prefix = self
            .error_prefix
            .clone()
            .unwrap_or_else(|| format!("'{}' failed", self.program));

        let stderr = result.stderr_trimmed();
        if stderr.is_empty() {
            bail!("{} (exit code {})", prefix, result.code());
        } else {
            bail!("{} (exit code {}):\n{}", prefix, result.code(), stderr);
        }
    }
}

// =============================================================================
// Runners
// =============================================================================

/// Seam between code that decides which commands to run and the host.
pub trait CommandRunner {
    /// Execute `cmd` and report how it exited. Only failing to start the
    /// program is an `Err`; non-zero exits come back in the result.
    fn execute(&self, cmd: &Cmd) -> Result<CommandResult>;

    /// Execute and fail on non-zero exit.
    fn run(&self, cmd: &Cmd) -> Result<CommandResult> {
        let result = self.execute(cmd)?;
        cmd.check(&result)?;
        Ok(result)
    }
}

/// Runs commands on the host, optionally through `sudo`.
#[derive(Debug, Clone, Copy)]
pub struct SystemRunner {
    sudo: bool,
}

impl SystemRunner {
    pub fn new(sudo: bool) -> Self {
        Self { sudo }
    }

    /// Elevate with `sudo` only when asked to and not already root.
    pub fn for_host(use_sudo: bool) -> Self {
        Self::new(use_sudo && !crate::is_privileged())
    }
}

impl CommandRunner for SystemRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CommandResult> {
        if self.sudo {
            let elevated = cmd.elevated();
            log::debug!("$ {}", elevated.display());
            elevated.output()
        } else {
            log::debug!("$ {}", cmd.display());
            cmd.output()
        }
    }
}

/// Canned response for a [`ScriptedRunner`].
#[derive(Debug, Clone)]
struct Response {
    prefix: String,
    code: i32,
    stdout: String,
    stderr: String,
}

/// Records every command line and answers from a script instead of
/// spawning anything. Commands without a scripted answer succeed with
/// empty output.
#[doc(hidden)]
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    responses: Vec<Response>,
    calls: RefCell<Vec<Vec<String>>>,
    inputs: RefCell<Vec<Option<String>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands whose command line starts with `prefix` with a
    /// successful exit and `stdout`.
    pub fn respond(mut self, prefix: &str, stdout: &str) -> Self {
        self.responses.push(Response {
            prefix: prefix.to_string(),
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        });
        self
    }

    /// Answer commands whose command line starts with `prefix` with exit
    /// `code` and `stderr`.
    pub fn fail(mut self, prefix: &str, code: i32, stderr: &str) -> Self {
        self.responses.push(Response {
            prefix: prefix.to_string(),
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        });
        self
    }

    /// Every command line executed so far.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.borrow().clone()
    }

    /// Command lines joined with spaces.
    pub fn lines(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.join(" ")).collect()
    }

    /// Stdin fed to each executed command, in call order.
    pub fn inputs(&self) -> Vec<Option<String>> {
        self.inputs.borrow().clone()
    }

    /// True if any executed command line starts with `prefix`.
    pub fn ran(&self, prefix: &str) -> bool {
        self.lines().iter().any(|l| l.starts_with(prefix))
    }
}

impl CommandRunner for ScriptedRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CommandResult> {
        let line = cmd.display();
        self.calls.borrow_mut().push(cmd.argv());
        self.inputs.borrow_mut().push(cmd.input.clone());

        // Later registrations win so tests can override a broad prefix.
        let response = self
            .responses
            .iter()
            .rev()
            .find(|r| line.starts_with(&r.prefix));

        Ok(match response {
            Some(r) => CommandResult {
                status: ExitStatus::from_raw((r.code & 0xff) << 8),
                stdout: r.stdout.clone(),
                stderr: r.stderr.clone(),
            },
            None => CommandResult {
                status: ExitStatus::from_raw(0),
                stdout: String::new(),
                stderr: String::new(),
            },
        })
    }
}

// =============================================================================
// Convenience functions
// =============================================================================

/// Location of `program` in PATH, if it is installed.
pub fn find_program(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

// =============================================================================
// Tests
// =============================================================================
