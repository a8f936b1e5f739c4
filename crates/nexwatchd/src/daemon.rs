//! Standalone daemon wiring: builds the watchdog against the real system
//! and runs the periodic loops until Ctrl-C.

use crate::commands::InterfaceCommands;
use crate::display::DisplayClient;
use crate::executor::{CommandRunner, SystemCommandRunner};
use crate::hardware;
use crate::host::CommandHost;
use crate::orchestrator::LogResponse;
use crate::watchdog::Watchdog;
use anyhow::{Context, Result};
use nexwatch_common::WatchdogConfig;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const SYS_ROOT: &str = "/sys";

/// Run `tick` every `period` until `stop` flips. The first tick comes one
/// period after start.
pub async fn periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => tick().await,
            _ = stop.changed() => break,
        }
    }
    debug!("{} loop stopped", name);
}

pub async fn run(config: WatchdogConfig) -> Result<()> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new());
    let commands = InterfaceCommands::new(
        &config.interface,
        Duration::from_secs(config.hopper.hop_timeout_secs),
    );
    let hardware = hardware::detect(runner.as_ref(), &commands, Path::new(SYS_ROOT)).await;

    let host = Arc::new(CommandHost::new(Arc::clone(&runner), config.host.clone()));
    let watchdog = Arc::new(
        Watchdog::new(config.clone(), runner, host.clone(), hardware)
            .context("Failed to compile log rules")?,
    );

    if watchdog.is_disabled() {
        info!("External adapter detected, nexwatchd idle until shutdown");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        return Ok(());
    }

    watchdog.start();

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if config.scanner.enabled {
        let wd = Arc::clone(&watchdog);
        tasks.push(tokio::spawn(periodic(
            "log check",
            Duration::from_secs(config.scanner.refresh_interval_secs),
            stop_rx.clone(),
            move || {
                let wd = Arc::clone(&wd);
                async move {
                    match wd.check_logs().await {
                        Some(LogResponse::Recovery(trigger)) | Some(LogResponse::Escalated(trigger)) => {
                            debug!("Log-triggered recovery started: {}", trigger.is_started());
                        }
                        Some(other) => debug!("Log check: {:?}", other),
                        None => {}
                    }
                }
            },
        )));
    }

    if config.display.enabled {
        let wd = Arc::clone(&watchdog);
        let display = DisplayClient::new(
            config.display.socket_path.clone(),
            Duration::from_millis(config.display.timeout_ms),
        );
        tasks.push(tokio::spawn(periodic(
            "display",
            Duration::from_secs(config.display.push_interval_secs),
            stop_rx.clone(),
            move || {
                let wd = Arc::clone(&wd);
                let display = display.clone();
                async move {
                    if let Err(e) = display.push_status(wd.status_code()).await {
                        debug!("Display push failed: {}", e);
                    }
                }
            },
        )));
    }

    if host.can_observe() {
        let wd = Arc::clone(&watchdog);
        let host = Arc::clone(&host);
        tasks.push(tokio::spawn(periodic(
            "observation",
            Duration::from_secs(config.host.cycle_interval_secs),
            stop_rx.clone(),
            move || {
                let wd = Arc::clone(&wd);
                let host = Arc::clone(&host);
                async move {
                    match host.observe().await {
                        Some(Ok(observed)) => {
                            let report = wd.on_cycle(observed);
                            if report.recovery_requested() {
                                info!("Blind threshold reached after {} epochs", report.blind_epochs);
                            }
                        }
                        Some(Err(e)) => warn!("Observation failed: {}", e),
                        None => {}
                    }
                }
            },
        )));
    } else {
        info!("No host observe command configured, blind-epoch tracking relies on the host");
    }

    info!("nexwatchd ready");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down gracefully");

    let _ = stop_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }
    watchdog.shutdown().await;
    Ok(())
}
