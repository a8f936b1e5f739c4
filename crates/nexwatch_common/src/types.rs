//! Core data model shared by the watchdog daemon and its reporting surface.
//!
//! Everything here is a plain value: the components that own the live state
//! hand these out as copies, never as references into their locked state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 2.4GHz channels.
pub const CHANNELS_LOW_BAND: [u16; 13] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13];

/// 5GHz channels. DFS channels in here need longer dwell times.
pub const CHANNELS_HIGH_BAND: [u16; 24] = [
    36, 40, 44, 48, 52, 56, 60, 64, 100, 104, 108, 112, 116, 120, 124, 128, 132, 136, 140, 149,
    153, 157, 161, 165,
];

// ============================================================================
// Channels
// ============================================================================

/// Frequency range of a channel; selects the hop timing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Low,
    High,
}

/// A channel number. The band is derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(u16);

impl Channel {
    pub const fn new(number: u16) -> Self {
        Self(number)
    }

    pub fn number(self) -> u16 {
        self.0
    }

    /// Channels 14 and below live in the 2.4GHz band, everything else is
    /// treated as 5GHz. Unrecognized numbers still get a band so the hopper
    /// can time them; the OS decides whether they exist.
    pub fn band(self) -> Band {
        if self.0 <= 14 {
            Band::Low
        } else {
            Band::High
        }
    }

    pub fn is_recognized(self) -> bool {
        self.0 == 14 || CHANNELS_LOW_BAND.contains(&self.0) || CHANNELS_HIGH_BAND.contains(&self.0)
    }
}

impl From<u16> for Channel {
    fn from(number: u16) -> Self {
        Self(number)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Channel hopper records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopRecord {
    pub timestamp: DateTime<Utc>,
    pub channel: Channel,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Read-only copy of the hopper counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopStats {
    pub current_channel: Option<Channel>,
    pub total_hops: u64,
    pub successful_hops: u64,
    pub failed_hops: u64,
    pub recovery_pauses: u64,
    pub consecutive_errors: u32,
    pub in_recovery_pause: bool,
    pub last_error: Option<String>,
    /// Percentage of successful hops; 100 when nothing was attempted yet.
    pub success_rate: f64,
}

impl HopStats {
    pub fn success_rate(successful: u64, total: u64) -> f64 {
        if total == 0 {
            100.0
        } else {
            successful as f64 / total as f64 * 100.0
        }
    }
}

// ============================================================================
// Log classification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    /// Kernel ring buffer (`journalctl -k`)
    Kernel,
    /// General system journal
    System,
    /// Host application log file
    Application,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Kernel => "kernel",
            LogSource::System => "system",
            LogSource::Application => "application",
        }
    }
}

/// Repair branch selected by a matched log rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    /// Firmware halted or crashed
    Crash,
    /// SDIO bus went away
    BusDown,
    /// Monitor interface vanished or could not be validated
    InterfaceMissing,
    /// Transient channel-set failures
    HopError,
    /// The host application itself panicked
    HostPanic,
}

impl LogAction {
    /// Whether this branch runs the full driver reload sequence.
    pub fn requires_full_recovery(self) -> bool {
        matches!(
            self,
            LogAction::Crash | LogAction::BusDown | LogAction::InterfaceMissing
        )
    }
}

/// Result of classifying log text: the first rule whose threshold was met.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub rule: String,
    pub source: LogSource,
    pub action: LogAction,
    pub occurrences: usize,
}

// ============================================================================
// Recovery
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryReason {
    BlindEpochs,
    LogPattern,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Success,
    Failure,
    AbortedConcurrent,
    AbortedRateLimit,
    /// Rejected inside the short window that follows a successful recovery.
    AbortedCooldown,
}

impl RecoveryOutcome {
    /// Admission rejections: policy outcomes, never errors.
    pub fn is_aborted(self) -> bool {
        matches!(
            self,
            RecoveryOutcome::AbortedConcurrent
                | RecoveryOutcome::AbortedRateLimit
                | RecoveryOutcome::AbortedCooldown
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub reason: RecoveryReason,
    pub outcome: RecoveryOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RecoveryAttempt {
    pub fn new(reason: RecoveryReason, outcome: RecoveryOutcome, detail: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            reason,
            outcome,
            detail,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStats {
    /// Admitted repair sequences
    pub total_recoveries: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    /// Requests turned away by the admission guard
    pub rejected_recoveries: u64,
    /// Light repairs: host scanning switched off and on again
    pub scan_toggles: u64,
    pub host_restarts: u64,
    pub total_blind_epochs: u64,
    pub last_recovery: Option<DateTime<Utc>>,
}

/// Watchdog state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Recovering,
    Failed,
}

// ============================================================================
// Diagnostics
// ============================================================================

/// One sample of interface and driver status. Replaced wholesale each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsSnapshot {
    pub driver_loaded: bool,
    pub interface_up: bool,
    pub operating_mode_correct: bool,
    pub current_channel: Option<Channel>,
    pub sampled_at: DateTime<Utc>,
    #[serde(default)]
    pub recent_driver_errors: Vec<String>,
}

/// Per-cycle observation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub timestamp: DateTime<Utc>,
    pub observed: u32,
    pub blind: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub chip_type: String,
    pub firmware_version: String,
    pub driver: Option<String>,
    /// A different adapter drives the base interface; the watchdog stands down.
    pub external_adapter: bool,
}

impl Default for HardwareInfo {
    fn default() -> Self {
        Self {
            chip_type: "unknown".to_string(),
            firmware_version: "unknown".to_string(),
            driver: None,
            external_adapter: false,
        }
    }
}

// ============================================================================
// Reporting
// ============================================================================

/// Short code pushed to the display daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    Recovering,
    Blind(u32),
}

impl StatusCode {
    pub fn derive(recovering: bool, blind_epochs: u32) -> Self {
        if recovering {
            StatusCode::Recovering
        } else if blind_epochs > 0 {
            StatusCode::Blind(blind_epochs)
        } else {
            StatusCode::Ok
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Ok => write!(f, "OK"),
            StatusCode::Recovering => write!(f, "RECOVERING"),
            StatusCode::Blind(n) => write!(f, "BLIND:{}", n),
        }
    }
}

/// JSON-shaped status returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogStatus {
    pub version: String,
    pub state: HealthState,
    pub recovering: bool,
    pub disabled: bool,
    pub blind_epochs: u32,
    pub status_code: String,
    pub stats: RecoveryStats,
    pub hopper: HopStats,
    pub diagnostics: Option<DiagnosticsSnapshot>,
    pub hardware: HardwareInfo,
    pub seconds_since_recovery: Option<u64>,
}

/// Full diagnostics report for the reporting surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub generated_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub hardware: HardwareInfo,
    pub total_cycles: u64,
    pub hop_requests: u64,
    pub hop_request_failures: u64,
    pub stats: RecoveryStats,
    pub snapshot: Option<DiagnosticsSnapshot>,
    pub signal_history: Vec<CycleRecord>,
    pub recovery_history: Vec<RecoveryAttempt>,
    /// Requests turned away by the admission guard, kept apart so they
    /// never evict real attempts
    pub rejected_requests: Vec<RecoveryAttempt>,
    pub hop_history: Vec<HopRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_band() {
        assert_eq!(Channel::new(1).band(), Band::Low);
        assert_eq!(Channel::new(13).band(), Band::Low);
        assert_eq!(Channel::new(14).band(), Band::Low);
        assert_eq!(Channel::new(36).band(), Band::High);
        assert_eq!(Channel::new(165).band(), Band::High);
    }

    #[test]
    fn test_unrecognized_channel_still_has_band() {
        let bogus = Channel::new(200);
        assert!(!bogus.is_recognized());
        assert_eq!(bogus.band(), Band::High);
        assert!(Channel::new(149).is_recognized());
        assert!(!Channel::new(0).is_recognized());
    }

    #[test]
    fn test_success_rate_idle_is_full() {
        assert_eq!(HopStats::success_rate(0, 0), 100.0);
        assert_eq!(HopStats::success_rate(3, 4), 75.0);
    }

    #[test]
    fn test_status_code_text() {
        assert_eq!(StatusCode::derive(false, 0).to_string(), "OK");
        assert_eq!(StatusCode::derive(false, 4).to_string(), "BLIND:4");
        // Recovering wins over a blind streak
        assert_eq!(StatusCode::derive(true, 4).to_string(), "RECOVERING");
    }

    #[test]
    fn test_full_recovery_actions() {
        assert!(LogAction::Crash.requires_full_recovery());
        assert!(LogAction::BusDown.requires_full_recovery());
        assert!(LogAction::InterfaceMissing.requires_full_recovery());
        assert!(!LogAction::HopError.requires_full_recovery());
        assert!(!LogAction::HostPanic.requires_full_recovery());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&RecoveryOutcome::AbortedRateLimit).unwrap();
        assert_eq!(json, "\"aborted_rate_limit\"");
        assert!(RecoveryOutcome::AbortedCooldown.is_aborted());
        assert!(!RecoveryOutcome::Failure.is_aborted());
    }
}
