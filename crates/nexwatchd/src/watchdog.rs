//! Watchdog: the callback surface offered to the host application.
//!
//! Composes hopper, scanner, orchestrator and diagnostics collector, and
//! produces the status and diagnostics reports for the reporting surface.

use crate::commands::InterfaceCommands;
use crate::diagnostics::DiagnosticsCollector;
use crate::executor::CommandRunner;
use crate::host::HostControl;
use crate::hopper::ChannelHopper;
use crate::logs::{LogReader, RefreshGate};
use crate::orchestrator::{LogResponse, RecoveryOrchestrator, Trigger};
use crate::scanner::{LogExcerpt, LogScanner};
use chrono::{DateTime, Utc};
use nexwatch_common::{
    BoundedHistory, Channel, CycleRecord, DiagnosticsReport, HardwareInfo, RecoveryReason,
    ScannerError, StatusCode, WatchdogConfig, WatchdogStatus,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Result of one `on_cycle` call.
#[derive(Debug)]
pub struct CycleReport {
    pub observed: u32,
    pub blind_epochs: u32,
    /// Set when the blind streak reached the threshold
    pub recovery: Option<Trigger>,
}

impl CycleReport {
    pub fn recovery_requested(&self) -> bool {
        self.recovery.is_some()
    }
}

struct Telemetry {
    total_cycles: u64,
    hop_requests: u64,
    hop_failures: u64,
    signal_history: BoundedHistory<CycleRecord>,
}

pub struct Watchdog {
    config: WatchdogConfig,
    hardware: HardwareInfo,
    started_at: DateTime<Utc>,
    hopper: Arc<ChannelHopper>,
    scanner: LogScanner,
    logs: Arc<LogReader>,
    orchestrator: RecoveryOrchestrator,
    diagnostics: Arc<DiagnosticsCollector>,
    telemetry: Mutex<Telemetry>,
    log_gate: Mutex<RefreshGate>,
}

impl Watchdog {
    pub fn new(
        config: WatchdogConfig,
        runner: Arc<dyn CommandRunner>,
        host: Arc<dyn HostControl>,
        hardware: HardwareInfo,
    ) -> Result<Self, ScannerError> {
        let scanner = LogScanner::new(&config.scanner.rules)?;
        let commands = Arc::new(InterfaceCommands::new(
            &config.interface,
            Duration::from_secs(config.hopper.hop_timeout_secs),
        ));
        let hopper = Arc::new(ChannelHopper::new(
            config.hopper.clone(),
            Arc::clone(&commands),
            Arc::clone(&runner),
        ));
        let logs = Arc::new(LogReader::new(
            Arc::clone(&runner),
            Arc::clone(&commands),
            config.scanner.tail_lines,
            config.scanner.application_log.clone(),
        ));
        let diagnostics = Arc::new(DiagnosticsCollector::new(
            Arc::clone(&runner),
            Arc::clone(&commands),
            Arc::clone(&logs),
            Duration::from_secs(config.diagnostics.interval_secs),
            config.diagnostics.driver_error_lines,
        ));
        let orchestrator =
            RecoveryOrchestrator::new(config.recovery.clone(), runner, commands, host);

        Ok(Self {
            telemetry: Mutex::new(Telemetry {
                total_cycles: 0,
                hop_requests: 0,
                hop_failures: 0,
                signal_history: BoundedHistory::new(config.diagnostics.signal_history_len),
            }),
            log_gate: Mutex::new(RefreshGate::new(Duration::from_secs(
                config.scanner.refresh_interval_secs,
            ))),
            config,
            hardware,
            started_at: Utc::now(),
            hopper,
            scanner,
            logs,
            orchestrator,
            diagnostics,
        })
    }

    fn telemetry(&self) -> MutexGuard<'_, Telemetry> {
        self.telemetry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// An external adapter owns the base interface; nothing is managed.
    pub fn is_disabled(&self) -> bool {
        self.hardware.external_adapter
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn hardware(&self) -> &HardwareInfo {
        &self.hardware
    }

    pub fn hopper(&self) -> &Arc<ChannelHopper> {
        &self.hopper
    }

    pub fn orchestrator(&self) -> &RecoveryOrchestrator {
        &self.orchestrator
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticsCollector> {
        &self.diagnostics
    }

    /// Start the diagnostics loop and, if channels are configured, auto-hop.
    pub fn start(&self) {
        if self.is_disabled() {
            info!("Watchdog disabled, background loops not started");
            return;
        }
        self.diagnostics.start();
        let channels: Vec<Channel> = self
            .config
            .hopper
            .auto_hop_channels
            .iter()
            .copied()
            .map(Channel::new)
            .collect();
        if !channels.is_empty() {
            self.hopper.start_auto_hop(
                channels,
                Duration::from_millis(self.config.hopper.auto_hop_interval_ms),
            );
        }
    }

    pub async fn shutdown(&self) {
        self.hopper.stop().await;
        self.diagnostics.stop().await;
    }

    /// Report one observation cycle from the host.
    ///
    /// # Panics
    ///
    /// A cycle that requests a recovery spawns it onto the current tokio
    /// runtime, so it must be called from within one.
    pub fn on_cycle(&self, observed: u32) -> CycleReport {
        if self.is_disabled() {
            return CycleReport {
                observed,
                blind_epochs: 0,
                recovery: None,
            };
        }

        {
            let mut telemetry = self.telemetry();
            telemetry.total_cycles += 1;
            telemetry.signal_history.push(CycleRecord {
                timestamp: Utc::now(),
                observed,
                blind: observed == 0,
            });
        }

        let requested = self.orchestrator.on_cycle(observed);
        let recovery = requested.then(|| self.orchestrator.trigger(RecoveryReason::BlindEpochs));
        CycleReport {
            observed,
            blind_epochs: self.orchestrator.blind_epochs(),
            recovery,
        }
    }

    /// Hop on behalf of the host.
    pub async fn on_channel_hop_requested(&self, channel: Channel) -> bool {
        if self.is_disabled() {
            debug!("Hop to {} ignored: watchdog disabled", channel);
            return false;
        }
        self.telemetry().hop_requests += 1;
        let ok = self.hopper.hop_to(channel, false).await;
        if !ok {
            self.telemetry().hop_failures += 1;
        }
        ok
    }

    /// Manual recovery; `Trigger::is_started` tells whether it was accepted.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn trigger_manual_recovery(&self) -> Trigger {
        info!("Manual recovery requested");
        self.orchestrator.trigger(RecoveryReason::Manual)
    }

    /// Classify externally supplied log excerpts and act on a match.
    pub async fn on_log_excerpts(&self, excerpts: &[LogExcerpt]) -> Option<LogResponse> {
        if self.is_disabled() {
            return None;
        }
        let verdict = self.scanner.classify_excerpts(excerpts)?;
        Some(self.orchestrator.handle_verdict(&verdict).await)
    }

    /// React to a single line the host just logged.
    pub async fn on_host_log_line(&self, line: &str) -> Option<LogResponse> {
        if self.is_disabled() {
            return None;
        }
        let verdict = self.scanner.classify_event(line)?;
        Some(self.orchestrator.handle_verdict(&verdict).await)
    }

    /// Read and classify the configured log sources, at most once per
    /// refresh interval and never within the quiet period after a recovery
    /// started.
    pub async fn check_logs(&self) -> Option<LogResponse> {
        if self.is_disabled() || !self.config.scanner.enabled {
            return None;
        }

        let now = Instant::now();
        let quiet = Duration::from_secs(self.config.scanner.quiet_period_secs);
        if let Some(started) = self.orchestrator.last_attempt_started() {
            if now.duration_since(started) < quiet {
                debug!("Log check skipped: within quiet period after recovery");
                return None;
            }
        }
        if !self
            .log_gate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .try_pass(now)
        {
            return None;
        }

        let excerpts = self.logs.read_all().await;
        self.on_log_excerpts(&excerpts).await
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::derive(
            self.orchestrator.is_recovering(),
            self.orchestrator.blind_epochs(),
        )
    }

    pub fn get_status(&self) -> WatchdogStatus {
        WatchdogStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: self.orchestrator.phase(),
            recovering: self.orchestrator.is_recovering(),
            disabled: self.is_disabled(),
            blind_epochs: self.orchestrator.blind_epochs(),
            status_code: self.status_code().to_string(),
            stats: self.orchestrator.stats(),
            hopper: self.hopper.get_stats(),
            diagnostics: self.diagnostics.snapshot(),
            hardware: self.hardware.clone(),
            seconds_since_recovery: self.orchestrator.seconds_since_recovery(),
        }
    }

    pub fn diagnostics_report(&self) -> DiagnosticsReport {
        let (total_cycles, hop_requests, hop_request_failures, signal_history) = {
            let telemetry = self.telemetry();
            (
                telemetry.total_cycles,
                telemetry.hop_requests,
                telemetry.hop_failures,
                telemetry.signal_history.to_vec(),
            )
        };
        DiagnosticsReport {
            generated_at: Utc::now(),
            started_at: self.started_at,
            hardware: self.hardware.clone(),
            total_cycles,
            hop_requests,
            hop_request_failures,
            stats: self.orchestrator.stats(),
            snapshot: self.diagnostics.snapshot(),
            signal_history,
            recovery_history: self.orchestrator.history(),
            rejected_requests: self.orchestrator.rejections(),
            hop_history: self.hopper.history(),
        }
    }
}
