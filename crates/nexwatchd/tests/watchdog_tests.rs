//! Watchdog end-to-end tests
//!
//! Drive the host callback surface against a scripted command runner and a
//! recording host. Everything runs on tokio's paused clock, so settle
//! delays, rate-limit windows and cool-downs cost no wall time.

use nexwatch_common::{
    Channel, HardwareInfo, HealthState, LogAction, LogSource, RecoveryOutcome, RecoveryReason,
    StatusCode, WatchdogConfig,
};
use nexwatchd::host::CommandHost;
use nexwatchd::{
    FakeCommandRunner, FakeHost, FakeReply, HostCall, LogExcerpt, LogResponse, Watchdog,
};
use std::sync::Arc;
use std::time::Duration;

const MONITOR_INFO: &str =
    "Interface wlan0mon\n\tifindex 4\n\ttype monitor\n\twiphy 0\n\tchannel 1 (2412 MHz), width: 20 MHz\n";

// ============================================================================
// Harness
// ============================================================================

struct Rig {
    watchdog: Arc<Watchdog>,
    fake: FakeCommandRunner,
    host: FakeHost,
}

fn rig_with(config: WatchdogConfig) -> Rig {
    let fake = FakeCommandRunner::new();
    fake.respond("iw dev wlan0mon info", FakeReply::ok(MONITOR_INFO));
    let host = FakeHost::new();
    let watchdog = Watchdog::new(
        config,
        Arc::new(fake.clone()),
        Arc::new(host.clone()),
        HardwareInfo::default(),
    )
    .expect("default rules compile");
    Rig {
        watchdog: Arc::new(watchdog),
        fake,
        host,
    }
}

fn rig() -> Rig {
    rig_with(WatchdogConfig::default())
}

fn threshold(n: u32) -> WatchdogConfig {
    let mut config = WatchdogConfig::default();
    config.recovery.blind_epoch_threshold = n;
    config
}

// ============================================================================
// Blind epochs
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_blind_threshold_end_to_end() {
    let rig = rig_with(threshold(3));

    assert!(!rig.watchdog.on_cycle(0).recovery_requested());
    assert!(!rig.watchdog.on_cycle(0).recovery_requested());
    let report = rig.watchdog.on_cycle(0);
    assert!(report.recovery_requested());
    assert_eq!(report.blind_epochs, 3);

    let trigger = report.recovery.unwrap();
    assert!(trigger.is_started());
    assert_eq!(rig.watchdog.status_code(), StatusCode::Recovering);
    assert_eq!(trigger.wait().await, RecoveryOutcome::Success);

    let status = rig.watchdog.get_status();
    assert_eq!(status.stats.successful_recoveries, 1);
    assert_eq!(status.blind_epochs, 0);
    assert!(!status.recovering);
    assert_eq!(status.state, HealthState::Healthy);
    assert_eq!(rig.watchdog.status_code(), StatusCode::Ok);
    assert!(status.seconds_since_recovery.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_blind_count_restarts_after_recovery() {
    let rig = rig_with(threshold(2));
    rig.watchdog.on_cycle(0);
    let trigger = rig.watchdog.on_cycle(0).recovery.unwrap();
    assert_eq!(trigger.wait().await, RecoveryOutcome::Success);

    let report = rig.watchdog.on_cycle(0);
    assert_eq!(report.blind_epochs, 1);
    assert!(!report.recovery_requested());
}

#[tokio::test(start_paused = true)]
async fn test_observation_resets_streak() {
    let rig = rig_with(threshold(3));
    rig.watchdog.on_cycle(0);
    rig.watchdog.on_cycle(0);
    rig.watchdog.on_cycle(12);
    rig.watchdog.on_cycle(0);
    assert!(!rig.watchdog.on_cycle(0).recovery_requested());
    assert_eq!(rig.watchdog.get_status().stats.total_recoveries, 0);
    assert_eq!(rig.watchdog.get_status().stats.total_blind_epochs, 4);
}

// ============================================================================
// Admission guard
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_simultaneous_manual_triggers_run_once() {
    let rig = rig();
    let (first, second) = {
        let a = Arc::clone(&rig.watchdog);
        let b = Arc::clone(&rig.watchdog);
        tokio::join!(
            async move { a.trigger_manual_recovery() },
            async move { b.trigger_manual_recovery() }
        )
    };

    let started = [first.is_started(), second.is_started()];
    assert_eq!(started.iter().filter(|s| **s).count(), 1);

    let outcomes = [first.wait().await, second.wait().await];
    assert!(outcomes.contains(&RecoveryOutcome::Success));
    assert!(outcomes.contains(&RecoveryOutcome::AbortedConcurrent));
    assert_eq!(rig.fake.call_count("modprobe -r brcmfmac"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_then_window_expiry() {
    let mut config = WatchdogConfig::default();
    config.recovery.max_recoveries = 3;
    config.recovery.cooldown_secs = 0;
    let rig = rig_with(config);
    let orchestrator = rig.watchdog.orchestrator();

    let first_at = tokio::time::Instant::now();
    for _ in 0..3 {
        assert_eq!(
            rig.watchdog.trigger_manual_recovery().wait().await,
            RecoveryOutcome::Success
        );
    }
    assert_eq!(
        rig.watchdog.trigger_manual_recovery().wait().await,
        RecoveryOutcome::AbortedRateLimit
    );
    assert!(!orchestrator.is_recovering());

    tokio::time::advance((first_at + Duration::from_secs(3600)) - tokio::time::Instant::now()).await;
    assert_eq!(
        rig.watchdog.trigger_manual_recovery().wait().await,
        RecoveryOutcome::Success
    );

    let stats = orchestrator.stats();
    assert_eq!(stats.total_recoveries, 4);
    assert_eq!(stats.rejected_recoveries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failure_survives_rejected_blind_cycles() {
    let mut config = threshold(1);
    config.recovery.max_recoveries = 1;
    let rig = rig_with(config);
    rig.fake
        .respond("modprobe -r brcmfmac", FakeReply::fail(1, "Module brcmfmac is in use"));

    let trigger = rig.watchdog.on_cycle(0).recovery.unwrap();
    assert_eq!(trigger.wait().await, RecoveryOutcome::Failure);

    for _ in 0..60 {
        let trigger = rig.watchdog.on_cycle(0).recovery.unwrap();
        assert!(!trigger.is_started());
    }

    let orchestrator = rig.watchdog.orchestrator();
    let history = orchestrator.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, RecoveryOutcome::Failure);
    assert_eq!(orchestrator.stats().rejected_recoveries, 60);
    assert_eq!(orchestrator.rejections().len(), 50);

    let report = rig.watchdog.diagnostics_report();
    assert_eq!(report.recovery_history.len(), 1);
    assert!(report
        .rejected_requests
        .iter()
        .all(|r| r.outcome == RecoveryOutcome::AbortedRateLimit));
}

#[tokio::test(start_paused = true)]
async fn test_forced_unload_failure() {
    let rig = rig();
    rig.fake.respond_once(
        "modprobe -r brcmfmac",
        FakeReply::fail(1, "modprobe: FATAL: Module brcmfmac is in use."),
    );

    assert!(!rig.watchdog.get_status().recovering);
    let before = rig.watchdog.get_status().stats.failed_recoveries;
    let outcome = rig.watchdog.trigger_manual_recovery().wait().await;

    assert_eq!(outcome, RecoveryOutcome::Failure);
    let status = rig.watchdog.get_status();
    assert!(!status.recovering);
    assert_eq!(status.stats.failed_recoveries, before + 1);
    assert_eq!(status.state, HealthState::Failed);
    assert_eq!(rig.host.count(HostCall::Resume), 1);
}

// ============================================================================
// Log-driven repairs
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_crash_excerpt_triggers_full_recovery() {
    let rig = rig();
    let excerpts = vec![LogExcerpt::new(
        LogSource::System,
        "kernel: brcmfmac: brcmf_sdio_hostmail: Firmware has halted or crashed",
    )];

    let Some(LogResponse::Recovery(trigger)) = rig.watchdog.on_log_excerpts(&excerpts).await else {
        panic!("expected a full recovery");
    };
    assert_eq!(trigger.wait().await, RecoveryOutcome::Success);

    let history = rig.watchdog.orchestrator().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].reason, RecoveryReason::LogPattern);
}

#[tokio::test(start_paused = true)]
async fn test_scanner_priority_across_sources() {
    let rig = rig();
    // Interface validation (rule 1) outranks the set-channel errors (rule 9)
    let kernel = "\
brcmfmac: brcmf_cfg80211_nexmon_set_channel: Set Channel failed: chspec=0x1001
brcmfmac: brcmf_cfg80211_nexmon_set_channel: Set Channel failed: chspec=0x1002
brcmfmac: brcmf_cfg80211_nexmon_set_channel: Set Channel failed: chspec=0x1003
brcmfmac: brcmf_cfg80211_add_iface: iface validation failed: err=-95
";
    let response = rig
        .watchdog
        .on_log_excerpts(&[LogExcerpt::new(LogSource::Kernel, kernel)])
        .await;
    assert!(matches!(response, Some(LogResponse::Recovery(_))));
    assert_eq!(rig.host.count(HostCall::Toggle), 0);
}

#[tokio::test(start_paused = true)]
async fn test_kernel_log_check_toggles_on_hop_errors() {
    let rig = rig();
    let line = "brcmfmac: brcmf_run_escan: error (-110)\n";
    rig.fake.respond(
        "journalctl -k -n 10 --no-pager",
        FakeReply::ok(&line.repeat(3)),
    );

    let response = rig.watchdog.check_logs().await;
    assert!(matches!(response, Some(LogResponse::ScanToggled)));
    assert_eq!(rig.host.count(HostCall::Toggle), 1);
    assert_eq!(rig.watchdog.get_status().stats.scan_toggles, 1);
    assert_eq!(rig.fake.call_count("modprobe -r brcmfmac"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hop_errors_without_toggle_command() {
    let config = WatchdogConfig::default();
    let fake = FakeCommandRunner::new();
    let host = CommandHost::new(Arc::new(fake.clone()), config.host.clone());
    let watchdog = Watchdog::new(
        config,
        Arc::new(fake.clone()),
        Arc::new(host),
        HardwareInfo::default(),
    )
    .expect("default rules compile");
    let line = "brcmfmac: brcmf_run_escan: error (-110)\n";
    fake.respond(
        "journalctl -k -n 10 --no-pager",
        FakeReply::ok(&line.repeat(3)),
    );

    let response = watchdog.check_logs().await;
    assert!(matches!(response, Some(LogResponse::Unconfigured)));
    assert_eq!(watchdog.get_status().stats.scan_toggles, 0);
    assert!(fake.calls().iter().all(|c| !c.starts_with("sh -c")));
}

#[tokio::test(start_paused = true)]
async fn test_host_event_toggle_failure_escalates() {
    let rig = rig();
    rig.host.fail(HostCall::Toggle);

    let response = rig
        .watchdog
        .on_host_log_line("wifi error while hopping to channel 13: operation not supported")
        .await;
    let Some(LogResponse::Escalated(trigger)) = response else {
        panic!("expected escalation to a full recovery");
    };
    assert_eq!(trigger.wait().await, RecoveryOutcome::Success);
    assert_eq!(rig.fake.call_count("modprobe brcmfmac"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_host_panic_restarts_host() {
    let rig = rig();
    let response = rig
        .watchdog
        .on_host_log_line("panic: runtime error: invalid memory address or nil pointer dereference")
        .await;
    assert!(matches!(response, Some(LogResponse::HostRestarted)));
    assert_eq!(rig.host.count(HostCall::Restart), 1);
}

// ============================================================================
// Channel hops through the host surface
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_hop_stats_stay_consistent() {
    let mut config = WatchdogConfig::default();
    config.hopper.max_consecutive_errors = 2;
    let rig = rig_with(config);
    rig.fake.respond("iw dev wlan0mon set channel 149", FakeReply::Timeout);

    let plan = [1, 6, 149, 149, 11, 36, 149];
    for n in plan {
        rig.watchdog.on_channel_hop_requested(Channel::new(n)).await;
        let stats = rig.watchdog.hopper().get_stats();
        assert_eq!(stats.total_hops, stats.successful_hops + stats.failed_hops);
    }

    // The two timeouts paused the hopper, so the following hops fast-failed
    // without reaching the hopper's counters
    let stats = rig.watchdog.hopper().get_stats();
    assert_eq!(stats.recovery_pauses, 1);
    assert_eq!(stats.failed_hops, 2);
    let report = rig.watchdog.diagnostics_report();
    assert_eq!(report.hop_requests, plan.len() as u64);
    assert!(report.hop_request_failures >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_report_lists_hardware_and_history() {
    let rig = rig();
    rig.watchdog.on_cycle(3);
    rig.watchdog.trigger_manual_recovery().wait().await;

    let report = rig.watchdog.diagnostics_report();
    assert_eq!(report.hardware.chip_type, "unknown");
    assert_eq!(report.recovery_history.len(), 1);
    assert_eq!(report.signal_history.len(), 1);
    assert_eq!(report.stats.successful_recoveries, 1);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["recovery_history"][0]["outcome"], "success");
    assert_eq!(json["recovery_history"][0]["reason"], "manual");
}

#[test]
fn test_log_actions_select_branch() {
    assert!(LogAction::BusDown.requires_full_recovery());
    assert!(!LogAction::HopError.requires_full_recovery());
}
