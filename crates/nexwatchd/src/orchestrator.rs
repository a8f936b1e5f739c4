//! Recovery Orchestrator
//!
//! Central state machine of the watchdog:
//!
//! ```text
//! HEALTHY -> DEGRADED -> RECOVERING -> HEALTHY   (verified)
//!                                   -> FAILED    (awaits next trigger)
//! ```
//!
//! A recovery is admitted only through `Shared::admit`, which checks the
//! in-progress flag, the post-success cool-down and the sliding attempt
//! window under one lock and sets the flag in the same critical section.
//! Admission hands out a `RecoveryPermit`; dropping the permit is the only
//! way the flag is cleared, so every exit path (including a panic inside
//! the repair task) releases it.

use crate::commands::{is_monitor_mode, InterfaceCommands};
use crate::executor::{CommandRunner, CommandSpec};
use crate::host::HostControl;
use chrono::Utc;
use nexwatch_common::{
    BoundedHistory, HealthState, LogAction, RecoveryAttempt, RecoveryConfig, RecoveryOutcome,
    RecoveryReason, RecoveryStats, Verdict,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

struct OrchestratorState {
    phase: HealthState,
    blind_epochs: u32,
    recovering: bool,
    /// Start times of admitted recoveries inside the rate-limit window
    attempt_window: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
    last_attempt_started: Option<Instant>,
    last_success_at: Option<Instant>,
    stats: RecoveryStats,
    history: BoundedHistory<RecoveryAttempt>,
    rejections: BoundedHistory<RecoveryAttempt>,
}

impl OrchestratorState {
    fn prune_window(&mut self, now: Instant, window: std::time::Duration) {
        while let Some(oldest) = self.attempt_window.front() {
            if now.duration_since(*oldest) >= window {
                self.attempt_window.pop_front();
            } else {
                break;
            }
        }
    }
}

struct Shared {
    config: RecoveryConfig,
    runner: Arc<dyn CommandRunner>,
    commands: Arc<InterfaceCommands>,
    host: Arc<dyn HostControl>,
    state: Mutex<OrchestratorState>,
}

/// Outcome of a recovery request.
#[derive(Debug)]
pub enum Trigger {
    /// Admitted; the repair sequence runs on its own task
    Started(JoinHandle<RecoveryOutcome>),
    /// Turned away by the admission guard
    Rejected(RecoveryOutcome),
}

impl Trigger {
    pub fn is_started(&self) -> bool {
        matches!(self, Trigger::Started(_))
    }

    /// Wait for the repair to finish, or return the rejection.
    pub async fn wait(self) -> RecoveryOutcome {
        match self {
            Trigger::Started(handle) => handle.await.unwrap_or_else(|e| {
                error!("Recovery task ended abnormally: {}", e);
                RecoveryOutcome::Failure
            }),
            Trigger::Rejected(outcome) => outcome,
        }
    }
}

/// What the orchestrator did about a scanner verdict.
#[derive(Debug)]
pub enum LogResponse {
    /// Full driver reload requested
    Recovery(Trigger),
    /// Host scanning toggled off and on
    ScanToggled,
    /// Toggle failed, full recovery requested instead
    Escalated(Trigger),
    HostRestarted,
    HostRestartFailed,
    /// The host offers no command for the light repair
    Unconfigured,
    /// A recovery was running; light repairs wait
    Skipped,
}

/// Held for the duration of exactly one repair sequence.
struct RecoveryPermit {
    shared: Arc<Shared>,
    reason: RecoveryReason,
    finished: bool,
}

impl RecoveryPermit {
    fn finish(mut self, outcome: RecoveryOutcome, detail: Option<String>) {
        self.finished = true;
        self.shared.complete(self.reason, outcome, detail);
    }
}

impl Drop for RecoveryPermit {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Recovery ended without an outcome, recording failure");
            self.shared.complete(
                self.reason,
                RecoveryOutcome::Failure,
                Some("recovery interrupted".to_string()),
            );
        }
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The single admission decision point.
    fn admit(self: &Arc<Self>, reason: RecoveryReason) -> Result<RecoveryPermit, RecoveryOutcome> {
        let now = Instant::now();
        let mut state = self.lock_state();
        state.prune_window(now, self.config.window());

        let rejection = if state.recovering {
            Some(RecoveryOutcome::AbortedConcurrent)
        } else if state.cooldown_until.is_some_and(|until| now < until) {
            Some(RecoveryOutcome::AbortedCooldown)
        } else if state.attempt_window.len() >= self.config.max_recoveries {
            Some(RecoveryOutcome::AbortedRateLimit)
        } else {
            None
        };

        if let Some(outcome) = rejection {
            state.stats.rejected_recoveries += 1;
            state
                .rejections
                .push(RecoveryAttempt::new(reason, outcome, None));
            info!(
                "Recovery request ({:?}) not admitted: {:?} ({} of {} in window)",
                reason,
                outcome,
                state.attempt_window.len(),
                self.config.max_recoveries
            );
            return Err(outcome);
        }

        state.recovering = true;
        state.attempt_window.push_back(now);
        state.last_attempt_started = Some(now);
        state.phase = HealthState::Recovering;
        state.stats.total_recoveries += 1;
        info!(
            "Recovery admitted ({:?}), attempt {} of {} in window",
            reason,
            state.attempt_window.len(),
            self.config.max_recoveries
        );

        Ok(RecoveryPermit {
            shared: Arc::clone(self),
            reason,
            finished: false,
        })
    }

    fn complete(&self, reason: RecoveryReason, outcome: RecoveryOutcome, detail: Option<String>) {
        let now = Instant::now();
        let mut state = self.lock_state();
        state.recovering = false;
        match outcome {
            RecoveryOutcome::Success => {
                state.stats.successful_recoveries += 1;
                state.blind_epochs = 0;
                state.phase = HealthState::Healthy;
                state.last_success_at = Some(now);
                state.stats.last_recovery = Some(Utc::now());
                state.cooldown_until = Some(now + self.config.cooldown());
                info!("Recovery ({:?}) succeeded", reason);
            }
            _ => {
                state.stats.failed_recoveries += 1;
                state.phase = HealthState::Failed;
                error!(
                    "Recovery ({:?}) failed: {}",
                    reason,
                    detail.as_deref().unwrap_or("unknown")
                );
            }
        }
        state
            .history
            .push(RecoveryAttempt::new(reason, outcome, detail));
    }

    async fn run(&self, permit: RecoveryPermit) -> RecoveryOutcome {
        let (outcome, detail) = self.repair().await;

        match self.host.resume_scanning().await {
            Ok(true) => info!("Host scanning resumed"),
            Ok(false) => debug!("No host resume command, nothing to resume"),
            Err(e) => warn!("Resuming host scanning failed: {}", e.summary()),
        }

        permit.finish(outcome, detail);
        outcome
    }

    async fn soft_step(&self, step: &str, spec: &CommandSpec) -> bool {
        match self.runner.run_checked(spec).await {
            Ok(_) => {
                info!("{}: ok", step);
                true
            }
            Err(e) => {
                warn!("{}: {} (continuing)", step, e.summary());
                false
            }
        }
    }

    async fn settle(&self) {
        tokio::time::sleep(self.config.settle_delay()).await;
    }

    /// The fixed repair recipe. Only the driver unload is fatal; every other
    /// step is best effort and the final verification decides the outcome.
    async fn repair(&self) -> (RecoveryOutcome, Option<String>) {
        let cmds = &self.commands;

        match self.host.pause_scanning().await {
            Ok(true) => info!("[1/7] host scanning paused"),
            Ok(false) => debug!("[1/7] no host pause command, skipped"),
            Err(e) => warn!("[1/7] pausing host scanning failed: {} (continuing)", e.summary()),
        }

        self.soft_step("[2/7] monitor interface down", &cmds.monitor_down())
            .await;
        self.soft_step("[2/7] monitor interface removed", &cmds.delete_monitor())
            .await;
        self.settle().await;

        if let Err(e) = self.runner.run_checked(&cmds.unload_driver()).await {
            error!("[3/7] unloading {} failed: {}", cmds.driver_module(), e.summary());
            return (
                RecoveryOutcome::Failure,
                Some(format!("driver unload failed: {}", e.summary())),
            );
        }
        info!("[3/7] driver {} unloaded", cmds.driver_module());
        self.settle().await;

        self.soft_step("[4/7] module dependencies rebuilt", &cmds.rebuild_module_deps())
            .await;

        self.soft_step("[5/7] driver reloaded", &cmds.load_driver()).await;
        let mut appeared = self.wait_for_base_interface().await;
        if !appeared {
            if let Some(device) = self.config.sdio_device.clone() {
                appeared = self.sdio_reset(&device).await;
            }
        }
        if appeared {
            info!("[5/7] {} is back", cmds.base_interface());
        } else {
            warn!(
                "[5/7] {} did not reappear after {} checks (continuing)",
                cmds.base_interface(),
                self.config.interface_poll_attempts
            );
        }

        self.soft_step("[6/7] monitor interface created", &cmds.create_monitor())
            .await;
        self.soft_step("[6/7] monitor interface up", &cmds.monitor_up())
            .await;

        match self.runner.run_checked(&cmds.monitor_info()).await {
            Ok(output) if is_monitor_mode(&output.stdout) => {
                info!("[7/7] {} verified in monitor mode", cmds.monitor_interface());
                (RecoveryOutcome::Success, None)
            }
            Ok(_) => {
                error!("[7/7] {} is not in monitor mode", cmds.monitor_interface());
                (
                    RecoveryOutcome::Failure,
                    Some("monitor interface not in monitor mode".to_string()),
                )
            }
            Err(e) => {
                error!("[7/7] verifying {} failed: {}", cmds.monitor_interface(), e.summary());
                (
                    RecoveryOutcome::Failure,
                    Some(format!("verification failed: {}", e.summary())),
                )
            }
        }
    }

    async fn wait_for_base_interface(&self) -> bool {
        let spec = self.commands.show_base();
        let base = self.commands.base_interface();
        for attempt in 1..=self.config.interface_poll_attempts {
            match self.runner.run(&spec).await {
                Ok(output) if output.success() => return true,
                Ok(_) => debug!("{} not present yet ({})", base, attempt),
                Err(e) => debug!("Polling {} failed: {}", base, e.summary()),
            }
            if attempt < self.config.interface_poll_attempts {
                tokio::time::sleep(self.config.poll_interval()).await;
            }
        }
        false
    }

    /// Unbind and rebind the SDIO device, then reload the driver.
    async fn sdio_reset(&self, device: &str) -> bool {
        let cmds = &self.commands;
        let path = &self.config.sdio_driver_path;
        warn!("[5/7] resetting SDIO device {}", device);

        self.soft_step("[5/7] driver unloaded for bus reset", &cmds.unload_driver())
            .await;
        self.soft_step("[5/7] SDIO device unbound", &cmds.sdio_unbind(path, device))
            .await;
        self.settle().await;
        self.soft_step("[5/7] SDIO device bound", &cmds.sdio_bind(path, device))
            .await;
        self.soft_step("[5/7] driver reloaded after bus reset", &cmds.load_driver())
            .await;
        self.wait_for_base_interface().await
    }
}

/// Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct RecoveryOrchestrator {
    shared: Arc<Shared>,
}

impl RecoveryOrchestrator {
    pub fn new(
        config: RecoveryConfig,
        runner: Arc<dyn CommandRunner>,
        commands: Arc<InterfaceCommands>,
        host: Arc<dyn HostControl>,
    ) -> Self {
        let history = BoundedHistory::new(config.history_len);
        let rejections = BoundedHistory::new(config.history_len);
        Self {
            shared: Arc::new(Shared {
                config,
                runner,
                commands,
                host,
                state: Mutex::new(OrchestratorState {
                    phase: HealthState::Healthy,
                    blind_epochs: 0,
                    recovering: false,
                    attempt_window: VecDeque::new(),
                    cooldown_until: None,
                    last_attempt_started: None,
                    last_success_at: None,
                    stats: RecoveryStats::default(),
                    history,
                    rejections,
                }),
            }),
        }
    }

    /// Record one observation cycle. Returns true when the blind streak has
    /// reached the threshold and a recovery should be requested.
    pub fn on_cycle(&self, observed: u32) -> bool {
        let mut state = self.shared.lock_state();
        if observed > 0 {
            if state.blind_epochs > 0 {
                debug!("Observed {} results, blind streak of {} reset", observed, state.blind_epochs);
            }
            state.blind_epochs = 0;
            if matches!(state.phase, HealthState::Degraded | HealthState::Failed) {
                state.phase = HealthState::Healthy;
            }
            return false;
        }

        state.blind_epochs += 1;
        state.stats.total_blind_epochs += 1;
        if state.phase == HealthState::Healthy {
            state.phase = HealthState::Degraded;
        }
        let requested = state.blind_epochs >= self.shared.config.blind_epoch_threshold;
        if requested {
            warn!(
                "{} blind epochs (threshold {}), requesting recovery",
                state.blind_epochs, self.shared.config.blind_epoch_threshold
            );
        } else {
            debug!("Blind epoch {}", state.blind_epochs);
        }
        requested
    }

    /// Request a recovery; an admitted one runs on its own task.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn trigger(&self, reason: RecoveryReason) -> Trigger {
        match self.shared.admit(reason) {
            Ok(permit) => {
                let shared = Arc::clone(&self.shared);
                Trigger::Started(tokio::spawn(async move { shared.run(permit).await }))
            }
            Err(outcome) => Trigger::Rejected(outcome),
        }
    }

    /// Request a recovery and run it on the calling task.
    pub async fn recover(&self, reason: RecoveryReason) -> RecoveryOutcome {
        match self.shared.admit(reason) {
            Ok(permit) => self.shared.run(permit).await,
            Err(outcome) => outcome,
        }
    }

    /// Run the repair branch selected by a scanner verdict.
    pub async fn handle_verdict(&self, verdict: &Verdict) -> LogResponse {
        info!(
            "Log rule {} matched {} times in {} log ({:?})",
            verdict.rule,
            verdict.occurrences,
            verdict.source.as_str(),
            verdict.action
        );

        if verdict.action.requires_full_recovery() {
            return LogResponse::Recovery(self.trigger(RecoveryReason::LogPattern));
        }
        if self.is_recovering() {
            debug!("Recovery in progress, skipping light repair for {}", verdict.rule);
            return LogResponse::Skipped;
        }

        match verdict.action {
            LogAction::HostPanic => match self.shared.host.restart().await {
                Ok(true) => {
                    self.shared.lock_state().stats.host_restarts += 1;
                    info!("Host restarted after {}", verdict.rule);
                    LogResponse::HostRestarted
                }
                Ok(false) => {
                    warn!(
                        "{} calls for a host restart but no restart command is configured",
                        verdict.rule
                    );
                    LogResponse::Unconfigured
                }
                Err(e) => {
                    warn!("Host restart failed: {}", e.summary());
                    LogResponse::HostRestartFailed
                }
            },
            _ => match self.shared.host.toggle_scanning().await {
                Ok(true) => {
                    self.shared.lock_state().stats.scan_toggles += 1;
                    info!("Host scanning toggled after {}", verdict.rule);
                    LogResponse::ScanToggled
                }
                Ok(false) => {
                    warn!(
                        "{} calls for a scan toggle but no toggle command is configured",
                        verdict.rule
                    );
                    LogResponse::Unconfigured
                }
                Err(e) => {
                    warn!(
                        "Toggling host scanning failed: {}, escalating to full recovery",
                        e.summary()
                    );
                    LogResponse::Escalated(self.trigger(RecoveryReason::LogPattern))
                }
            },
        }
    }

    pub fn is_recovering(&self) -> bool {
        self.shared.lock_state().recovering
    }

    pub fn blind_epochs(&self) -> u32 {
        self.shared.lock_state().blind_epochs
    }

    pub fn phase(&self) -> HealthState {
        self.shared.lock_state().phase
    }

    pub fn stats(&self) -> RecoveryStats {
        self.shared.lock_state().stats.clone()
    }

    /// Admitted attempts with their outcomes, oldest first.
    pub fn history(&self) -> Vec<RecoveryAttempt> {
        self.shared.lock_state().history.to_vec()
    }

    /// Requests the admission guard turned away, oldest first.
    pub fn rejections(&self) -> Vec<RecoveryAttempt> {
        self.shared.lock_state().rejections.to_vec()
    }

    pub fn last_attempt_started(&self) -> Option<Instant> {
        self.shared.lock_state().last_attempt_started
    }

    pub fn seconds_since_recovery(&self) -> Option<u64> {
        self.shared
            .lock_state()
            .last_success_at
            .map(|at| at.elapsed().as_secs())
    }
}
