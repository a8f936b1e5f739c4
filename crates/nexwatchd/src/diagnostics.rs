//! Diagnostics Collector
//!
//! Samples driver and interface status on a fixed interval and swaps in a
//! fresh `DiagnosticsSnapshot`. A failed sample leaves the previous snapshot
//! in place; the collector never triggers recovery itself.

use crate::commands::{is_monitor_mode, link_is_up, module_loaded, parse_channel, InterfaceCommands};
use crate::executor::CommandRunner;
use crate::logs::LogReader;
use chrono::Utc;
use nexwatch_common::{CommandError, DiagnosticsSnapshot};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Loop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct DiagnosticsCollector {
    runner: Arc<dyn CommandRunner>,
    commands: Arc<InterfaceCommands>,
    logs: Arc<LogReader>,
    interval: Duration,
    driver_error_lines: usize,
    snapshot: RwLock<Option<Arc<DiagnosticsSnapshot>>>,
    task: Mutex<Option<Loop>>,
}

impl DiagnosticsCollector {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        commands: Arc<InterfaceCommands>,
        logs: Arc<LogReader>,
        interval: Duration,
        driver_error_lines: usize,
    ) -> Self {
        Self {
            runner,
            commands,
            logs,
            interval,
            driver_error_lines,
            snapshot: RwLock::new(None),
            task: Mutex::new(None),
        }
    }

    /// Take one sample. Timeouts and missing tools are errors; a command
    /// that runs and reports "no" is a sample.
    pub async fn sample(&self) -> Result<DiagnosticsSnapshot, CommandError> {
        let lsmod = self.runner.run_checked(&self.commands.list_modules()).await?;
        let driver_loaded = module_loaded(&lsmod.stdout, self.commands.driver_module());

        let link = self.runner.run(&self.commands.show_monitor()).await?;
        let interface_up = link.success() && link_is_up(&link.stdout);

        let info = self.runner.run(&self.commands.monitor_info()).await?;
        let (operating_mode_correct, current_channel) = if info.success() {
            (is_monitor_mode(&info.stdout), parse_channel(&info.stdout))
        } else {
            (false, None)
        };

        let recent_driver_errors = match self.logs.recent_driver_errors(self.driver_error_lines).await {
            Ok(lines) => lines,
            Err(e) => {
                debug!("Driver error lines unavailable: {}", e);
                Vec::new()
            }
        };

        Ok(DiagnosticsSnapshot {
            driver_loaded,
            interface_up,
            operating_mode_correct,
            current_channel,
            sampled_at: Utc::now(),
            recent_driver_errors,
        })
    }

    /// Sample and swap the snapshot in. Returns whether a new one was stored.
    pub async fn refresh(&self) -> bool {
        match self.sample().await {
            Ok(snapshot) => {
                debug!(
                    "Diagnostics: driver={} up={} monitor={} channel={:?}",
                    snapshot.driver_loaded,
                    snapshot.interface_up,
                    snapshot.operating_mode_correct,
                    snapshot.current_channel
                );
                *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(snapshot));
                true
            }
            Err(e) => {
                debug!("Diagnostics sample failed, keeping previous snapshot: {}", e);
                false
            }
        }
    }

    pub fn snapshot(&self) -> Option<DiagnosticsSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
            .cloned()
    }

    /// Start the sampling loop. Returns false if it already runs.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return false;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let collector = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                collector.refresh().await;
                tokio::select! {
                    _ = tokio::time::sleep(collector.interval) => {}
                    _ = stop_rx.changed() => break,
                }
            }
        });
        info!("Diagnostics collector started (every {:?})", self.interval);
        *task = Some(Loop {
            stop: stop_tx,
            handle,
        });
        true
    }

    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.stop.send(true);
            if let Err(e) = task.handle.await {
                warn!("Diagnostics task ended abnormally: {}", e);
            }
            info!("Diagnostics collector stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{FakeCommandRunner, FakeReply};
    use nexwatch_common::{Channel, InterfaceConfig};

    fn collector(fake: &FakeCommandRunner) -> Arc<DiagnosticsCollector> {
        let runner: Arc<dyn CommandRunner> = Arc::new(fake.clone());
        let commands = Arc::new(InterfaceCommands::new(
            &InterfaceConfig::default(),
            Duration::from_secs(5),
        ));
        let logs = Arc::new(LogReader::new(
            Arc::clone(&runner),
            Arc::clone(&commands),
            10,
            "/var/log/host.log".to_string(),
        ));
        Arc::new(DiagnosticsCollector::new(
            runner,
            commands,
            logs,
            Duration::from_secs(10),
            20,
        ))
    }

    fn healthy(fake: &FakeCommandRunner) {
        fake.respond("lsmod", FakeReply::ok("Module Size Used by\nbrcmfmac 331776 0\n"));
        fake.respond(
            "ip link show wlan0mon",
            FakeReply::ok("4: wlan0mon: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500"),
        );
        fake.respond(
            "iw dev wlan0mon info",
            FakeReply::ok("Interface wlan0mon\n\ttype monitor\n\tchannel 11 (2462 MHz), width: 20 MHz\n"),
        );
        fake.respond(
            "journalctl -k -n 200 --no-pager",
            FakeReply::ok("brcmfmac: brcmf_sdio_bus_rxctl: resumed on timeout\n"),
        );
    }

    #[tokio::test]
    async fn test_sample_healthy_interface() {
        let fake = FakeCommandRunner::new();
        healthy(&fake);
        let snapshot = collector(&fake).sample().await.unwrap();
        assert!(snapshot.driver_loaded);
        assert!(snapshot.interface_up);
        assert!(snapshot.operating_mode_correct);
        assert_eq!(snapshot.current_channel, Some(Channel::new(11)));
        assert_eq!(snapshot.recent_driver_errors.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_interface_is_a_sample() {
        let fake = FakeCommandRunner::new();
        healthy(&fake);
        fake.respond("ip link show wlan0mon", FakeReply::fail(1, "Device \"wlan0mon\" does not exist."));
        fake.respond("iw dev wlan0mon info", FakeReply::fail(237, "No such device"));

        let snapshot = collector(&fake).sample().await.unwrap();
        assert!(snapshot.driver_loaded);
        assert!(!snapshot.interface_up);
        assert!(!snapshot.operating_mode_correct);
        assert_eq!(snapshot.current_channel, None);
    }

    #[tokio::test]
    async fn test_failed_sample_keeps_stale_snapshot() {
        let fake = FakeCommandRunner::new();
        healthy(&fake);
        let collector = collector(&fake);
        assert!(collector.snapshot().is_none());
        assert!(collector.refresh().await);
        let first = collector.snapshot().unwrap();

        fake.respond("lsmod", FakeReply::Timeout);
        assert!(!collector.refresh().await);
        assert_eq!(collector.snapshot().unwrap(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_samples_until_stopped() {
        let fake = FakeCommandRunner::new();
        healthy(&fake);
        let collector = collector(&fake);
        assert!(collector.start());
        assert!(!collector.start());

        tokio::time::sleep(Duration::from_secs(25)).await;
        collector.stop().await;
        let samples = fake.call_count("lsmod");
        assert_eq!(samples, 3);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fake.call_count("lsmod"), samples);
        collector.stop().await;
    }
}
