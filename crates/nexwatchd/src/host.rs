//! Host application control surface.
//!
//! The watchdog asks the host to pause, resume or restart its scanning
//! around repairs. The daemon drives a host through configured shell
//! commands; tests use `FakeHost`.

use crate::executor::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use nexwatch_common::{CommandError, HostConfig};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Each call returns `Ok(false)` when the host has no way to perform it.
#[async_trait]
pub trait HostControl: Send + Sync {
    /// Stop higher-level scanning before the interface goes away
    async fn pause_scanning(&self) -> Result<bool, CommandError>;

    async fn resume_scanning(&self) -> Result<bool, CommandError>;

    /// Switch scanning off and on again
    async fn toggle_scanning(&self) -> Result<bool, CommandError>;

    /// Restart the host service
    async fn restart(&self) -> Result<bool, CommandError>;
}

// ============================================================================
// Command-driven host
// ============================================================================

pub struct CommandHost {
    runner: Arc<dyn CommandRunner>,
    config: HostConfig,
}

impl CommandHost {
    pub fn new(runner: Arc<dyn CommandRunner>, config: HostConfig) -> Self {
        Self { runner, config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }

    async fn run_optional(&self, what: &str, script: Option<&String>) -> Result<bool, CommandError> {
        let Some(script) = script else {
            debug!("No host {} command configured", what);
            return Ok(false);
        };
        self.runner
            .run_checked(&CommandSpec::shell(script.as_str(), self.timeout()))
            .await
            .map(|_| true)
    }

    pub fn can_observe(&self) -> bool {
        self.config.observe_command.is_some()
    }

    /// Run the observe command and parse the result count from its output.
    /// None when no observe command is configured.
    pub async fn observe(&self) -> Option<Result<u32, CommandError>> {
        let script = self.config.observe_command.as_ref()?;
        let spec = CommandSpec::shell(script.as_str(), self.timeout());
        let result = self.runner.run_checked(&spec).await.and_then(|output| {
            parse_observed_count(&output.stdout).ok_or_else(|| CommandError::NonZeroExit {
                program: "observe".to_string(),
                code: Some(0),
                detail: format!("no count in output: {}", output.stdout.trim()),
            })
        });
        Some(result)
    }
}

#[async_trait]
impl HostControl for CommandHost {
    async fn pause_scanning(&self) -> Result<bool, CommandError> {
        self.run_optional("pause", self.config.pause_command.as_ref()).await
    }

    async fn resume_scanning(&self) -> Result<bool, CommandError> {
        self.run_optional("resume", self.config.resume_command.as_ref()).await
    }

    async fn toggle_scanning(&self) -> Result<bool, CommandError> {
        self.run_optional("toggle", self.config.toggle_command.as_ref()).await
    }

    async fn restart(&self) -> Result<bool, CommandError> {
        self.run_optional("restart", self.config.restart_command.as_ref()).await
    }
}

/// First unsigned integer in `text`.
pub fn parse_observed_count(text: &str) -> Option<u32> {
    text.split(|c: char| !c.is_ascii_digit())
        .find(|token| !token.is_empty())
        .and_then(|token| token.parse().ok())
}

// ============================================================================
// Fake host (testing)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostCall {
    Pause,
    Resume,
    Toggle,
    Restart,
}

#[derive(Default)]
struct FakeHostState {
    calls: Vec<HostCall>,
    failing: HashSet<HostCall>,
}

/// Records every call; calls marked with `fail` return an error.
#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<FakeHostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeHostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail(&self, call: HostCall) {
        self.lock().failing.insert(call);
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, call: HostCall) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }

    fn record(&self, call: HostCall) -> Result<bool, CommandError> {
        let mut state = self.lock();
        state.calls.push(call);
        if state.failing.contains(&call) {
            Err(CommandError::NonZeroExit {
                program: "host".to_string(),
                code: Some(1),
                detail: format!("{:?} failed", call),
            })
        } else {
            Ok(true)
        }
    }
}

#[async_trait]
impl HostControl for FakeHost {
    async fn pause_scanning(&self) -> Result<bool, CommandError> {
        self.record(HostCall::Pause)
    }

    async fn resume_scanning(&self) -> Result<bool, CommandError> {
        self.record(HostCall::Resume)
    }

    async fn toggle_scanning(&self) -> Result<bool, CommandError> {
        self.record(HostCall::Toggle)
    }

    async fn restart(&self) -> Result<bool, CommandError> {
        self.record(HostCall::Restart)
    }
}
