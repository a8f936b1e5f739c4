//! Command Executor
//!
//! Runs external OS commands with a timeout and hands back exit status and
//! captured output. Everything that touches the interface or the driver goes
//! through the `CommandRunner` trait:
//!
//! - `SystemCommandRunner` spawns real processes (tokio process + timeout)
//! - `FakeCommandRunner` replays scripted replies keyed by command line,
//!   with call recording for assertions

use async_trait::async_trait;
use nexwatch_common::CommandError;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

// ============================================================================
// Command description and result
// ============================================================================

/// A program, its arguments and how long it may run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    /// Run `script` through `sh -c`.
    pub fn shell(script: impl Into<String>, timeout: Duration) -> Self {
        Self::new("sh", timeout).arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Program and arguments joined by single spaces.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Exit status and captured text of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// None when the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Best human-readable failure text: stderr, else stdout.
    pub fn detail(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }

    /// Turn a non-zero exit into `CommandError::NonZeroExit`.
    pub fn into_result(self, program: &str) -> Result<CommandOutput, CommandError> {
        if self.success() {
            Ok(self)
        } else {
            Err(CommandError::NonZeroExit {
                program: program.to_string(),
                code: self.code,
                detail: self.detail(),
            })
        }
    }
}

// ============================================================================
// Runner trait
// ============================================================================

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command. Any exit status is returned as output; only spawn
    /// failures and timeouts are errors.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;

    /// Run the command and treat a non-zero exit as an error.
    async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.run(spec).await?.into_result(&spec.program)
    }
}

// ============================================================================
// System runner (production)
// ============================================================================

/// Runs real processes. A command that outlives its timeout is killed.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        debug!("exec: {}", spec);

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(spec.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CommandError::NotFound {
                    program: spec.program.clone(),
                });
            }
            Ok(Err(e)) => {
                return Err(CommandError::Spawn {
                    program: spec.program.clone(),
                    source: e,
                });
            }
            Err(_) => {
                warn!("Command timed out after {:?}: {}", spec.timeout, spec);
                return Err(CommandError::Timeout {
                    program: spec.program.clone(),
                    after: spec.timeout,
                });
            }
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ============================================================================
// Fake runner (testing)
// ============================================================================

/// Scripted reply for a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeReply {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    Timeout,
    NotFound,
}

impl FakeReply {
    /// Exit 0 with the given stdout
    pub fn ok(stdout: &str) -> Self {
        FakeReply::Exit {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    /// Non-zero exit with the given stderr
    pub fn fail(code: i32, stderr: &str) -> Self {
        FakeReply::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

#[derive(Default)]
struct FakeState {
    sticky: HashMap<String, FakeReply>,
    queued: HashMap<String, VecDeque<FakeReply>>,
    delays: HashMap<String, Duration>,
    calls: Vec<String>,
}

/// Fake runner for deterministic testing.
///
/// Replies are looked up by exact command line: a queued one-shot reply
/// first, then a sticky reply, then a plain exit 0 with empty output.
/// Delays use tokio's clock, so tests on a paused runtime never wait; a
/// delay at or beyond the command's timeout yields `CommandError::Timeout`.
///
/// ```rust,ignore
/// let fake = FakeCommandRunner::new();
/// fake.respond("modprobe -r brcmfmac", FakeReply::fail(1, "in use"));
/// fake.respond_once("ip link show wlan0", FakeReply::fail(1, "does not exist"));
/// ```
#[derive(Clone, Default)]
pub struct FakeCommandRunner {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reply to every call of `command_line`.
    pub fn respond(&self, command_line: &str, reply: FakeReply) {
        self.lock().sticky.insert(command_line.to_string(), reply);
    }

    /// Reply to the next call of `command_line` only. Queues in order.
    pub fn respond_once(&self, command_line: &str, reply: FakeReply) {
        self.lock()
            .queued
            .entry(command_line.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Make every call of `command_line` take `delay`.
    pub fn delay(&self, command_line: &str, delay: Duration) {
        self.lock().delays.insert(command_line.to_string(), delay);
    }

    /// Every command line run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, command_line: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == command_line).count()
    }

    /// Position of the first call of `command_line`, for ordering checks.
    pub fn position(&self, command_line: &str) -> Option<usize> {
        self.lock().calls.iter().position(|c| c == command_line)
    }
}

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let line = spec.command_line();
        let (reply, delay) = {
            let mut state = self.lock();
            state.calls.push(line.clone());
            let queued = state.queued.get_mut(&line).and_then(|q| q.pop_front());
            let reply = queued
                .or_else(|| state.sticky.get(&line).cloned())
                .unwrap_or_else(|| FakeReply::ok(""));
            (reply, state.delays.get(&line).copied())
        };

        if let Some(delay) = delay {
            if delay >= spec.timeout {
                tokio::time::sleep(spec.timeout).await;
                return Err(CommandError::Timeout {
                    program: spec.program.clone(),
                    after: spec.timeout,
                });
            }
            tokio::time::sleep(delay).await;
        }

        match reply {
            FakeReply::Exit {
                code,
                stdout,
                stderr,
            } => Ok(CommandOutput {
                code: Some(code),
                stdout,
                stderr,
            }),
            FakeReply::Timeout => Err(CommandError::Timeout {
                program: spec.program.clone(),
                after: spec.timeout,
            }),
            FakeReply::NotFound => Err(CommandError::NotFound {
                program: spec.program.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_joins_args() {
        let spec = CommandSpec::new("iw", Duration::from_secs(5))
            .args(["dev", "wlan0mon", "set", "channel"])
            .arg("6");
        assert_eq!(spec.command_line(), "iw dev wlan0mon set channel 6");
        assert_eq!(
            CommandSpec::shell("echo hi", Duration::from_secs(1)).args,
            vec!["-c".to_string(), "echo hi".to_string()]
        );
    }

    #[test]
    fn test_into_result_uses_stderr_detail() {
        let output = CommandOutput {
            code: Some(1),
            stdout: "ignored".to_string(),
            stderr: "FATAL: Module brcmfmac is in use.\n".to_string(),
        };
        let err = output.into_result("modprobe").unwrap_err();
        assert_eq!(err.summary(), "FATAL: Module brcmfmac is in use.");
    }

    #[tokio::test]
    async fn test_fake_reply_order() {
        let fake = FakeCommandRunner::new();
        let spec = CommandSpec::new("lsmod", Duration::from_secs(5));
        fake.respond("lsmod", FakeReply::ok("brcmfmac 1 0"));
        fake.respond_once("lsmod", FakeReply::fail(2, "boom"));

        let first = fake.run(&spec).await.unwrap();
        assert_eq!(first.code, Some(2));
        let second = fake.run(&spec).await.unwrap();
        assert_eq!(second.stdout, "brcmfmac 1 0");
        assert_eq!(fake.call_count("lsmod"), 2);
    }

    #[tokio::test]
    async fn test_fake_unscripted_command_succeeds() {
        let fake = FakeCommandRunner::new();
        let spec = CommandSpec::new("depmod", Duration::from_secs(5)).arg("-a");
        assert!(fake.run_checked(&spec).await.is_ok());
        assert_eq!(fake.calls(), vec!["depmod -a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fake_delay_past_timeout_is_timeout() {
        let fake = FakeCommandRunner::new();
        fake.delay("iw dev wlan0mon info", Duration::from_secs(60));
        let spec = CommandSpec::new("iw", Duration::from_secs(5)).args(["dev", "wlan0mon", "info"]);

        let started = tokio::time::Instant::now();
        let err = fake.run(&spec).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_system_runner_reports_missing_program() {
        let runner = SystemCommandRunner::new();
        let spec = CommandSpec::new("nexwatch-no-such-binary", Duration::from_secs(5));
        let err = runner.run(&spec).await.unwrap_err();
        assert!(matches!(err, CommandError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_system_runner_captures_exit_code() {
        let runner = SystemCommandRunner::new();
        let output = runner
            .run(&CommandSpec::shell("echo out; echo err >&2; exit 3", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.detail(), "err");
    }
}
