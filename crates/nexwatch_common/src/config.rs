//! Nexwatch configuration.
//!
//! Configuration lives in /etc/nexwatch/config.toml. Every section and field
//! has a default, so an empty or missing file yields a working watchdog for
//! the stock brcmfmac/nexmon setup.

use crate::error::ConfigError;
use crate::types::{LogAction, LogSource};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// System configuration directory
pub const SYSTEM_CONFIG_DIR: &str = "/etc/nexwatch";
const CONFIG_FILE: &str = "config.toml";

/// Environment override for the config file location
pub const CONFIG_ENV: &str = "NEXWATCH_CONFIG";

/// Default config file path
pub fn config_path() -> PathBuf {
    PathBuf::from(SYSTEM_CONFIG_DIR).join(CONFIG_FILE)
}

/// Pick the config file: explicit flag, then environment, then system path.
pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => config_path(),
    }
}

// ============================================================================
// [interface]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Monitor-mode interface the host captures on
    #[serde(default = "default_monitor_interface")]
    pub monitor_interface: String,

    /// Managed interface created by the driver
    #[serde(default = "default_base_interface")]
    pub base_interface: String,

    #[serde(default = "default_phy")]
    pub phy: String,

    #[serde(default = "default_driver_module")]
    pub driver_module: String,

    /// Timeout for quick commands (ip, iw, journalctl)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Timeout for modprobe
    #[serde(default = "default_module_timeout")]
    pub module_timeout_secs: u64,

    /// Timeout for interface creation and link changes
    #[serde(default = "default_link_timeout")]
    pub link_timeout_secs: u64,
}

fn default_monitor_interface() -> String {
    "wlan0mon".to_string()
}

fn default_base_interface() -> String {
    "wlan0".to_string()
}

fn default_phy() -> String {
    "phy0".to_string()
}

fn default_driver_module() -> String {
    "brcmfmac".to_string()
}

fn default_command_timeout() -> u64 {
    5
}

fn default_module_timeout() -> u64 {
    30
}

fn default_link_timeout() -> u64 {
    10
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            monitor_interface: default_monitor_interface(),
            base_interface: default_base_interface(),
            phy: default_phy(),
            driver_module: default_driver_module(),
            command_timeout_secs: default_command_timeout(),
            module_timeout_secs: default_module_timeout(),
            link_timeout_secs: default_link_timeout(),
        }
    }
}

// ============================================================================
// [hopper]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopperConfig {
    /// Minimum dwell between hops
    #[serde(default = "default_hop_delay")]
    pub hop_delay_ms: u64,

    /// Dwell when the target is a 5GHz channel
    #[serde(default = "default_high_band_delay")]
    pub high_band_delay_ms: u64,

    /// Dwell when crossing between bands
    #[serde(default = "default_band_switch_delay")]
    pub band_switch_delay_ms: u64,

    /// Consecutive failures before the hopper pauses itself
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    #[serde(default = "default_recovery_pause")]
    pub recovery_pause_ms: u64,

    #[serde(default = "default_hop_history")]
    pub history_len: usize,

    #[serde(default = "default_hop_timeout")]
    pub hop_timeout_secs: u64,

    /// Channels for the background hop loop; empty disables it
    #[serde(default)]
    pub auto_hop_channels: Vec<u16>,

    #[serde(default = "default_auto_hop_interval")]
    pub auto_hop_interval_ms: u64,
}

fn default_hop_delay() -> u64 {
    150
}

fn default_high_band_delay() -> u64 {
    250
}

fn default_band_switch_delay() -> u64 {
    300
}

fn default_max_consecutive_errors() -> u32 {
    3
}

fn default_recovery_pause() -> u64 {
    2000
}

fn default_hop_history() -> usize {
    100
}

fn default_hop_timeout() -> u64 {
    5
}

fn default_auto_hop_interval() -> u64 {
    500
}

impl Default for HopperConfig {
    fn default() -> Self {
        Self {
            hop_delay_ms: default_hop_delay(),
            high_band_delay_ms: default_high_band_delay(),
            band_switch_delay_ms: default_band_switch_delay(),
            max_consecutive_errors: default_max_consecutive_errors(),
            recovery_pause_ms: default_recovery_pause(),
            history_len: default_hop_history(),
            hop_timeout_secs: default_hop_timeout(),
            auto_hop_channels: Vec::new(),
            auto_hop_interval_ms: default_auto_hop_interval(),
        }
    }
}

impl HopperConfig {
    pub fn hop_delay(&self) -> Duration {
        Duration::from_millis(self.hop_delay_ms)
    }

    pub fn high_band_delay(&self) -> Duration {
        Duration::from_millis(self.high_band_delay_ms)
    }

    pub fn band_switch_delay(&self) -> Duration {
        Duration::from_millis(self.band_switch_delay_ms)
    }

    pub fn recovery_pause(&self) -> Duration {
        Duration::from_millis(self.recovery_pause_ms)
    }
}

// ============================================================================
// [recovery]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Consecutive empty cycles before a recovery is requested
    #[serde(default = "default_blind_threshold")]
    pub blind_epoch_threshold: u32,

    /// Admitted recoveries allowed per window
    #[serde(default = "default_max_recoveries")]
    pub max_recoveries: usize,

    #[serde(default = "default_window")]
    pub window_secs: u64,

    /// Requests are rejected for this long after a successful recovery
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Pause between repair steps that touch the driver
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,

    #[serde(default = "default_poll_attempts")]
    pub interface_poll_attempts: u32,

    #[serde(default = "default_poll_interval")]
    pub interface_poll_interval_ms: u64,

    #[serde(default = "default_recovery_history")]
    pub history_len: usize,

    /// SDIO device id for the bus reset fallback, e.g. "mmc1:0001:1"
    #[serde(default)]
    pub sdio_device: Option<String>,

    #[serde(default = "default_sdio_driver_path")]
    pub sdio_driver_path: String,
}

fn default_blind_threshold() -> u32 {
    10
}

fn default_max_recoveries() -> usize {
    5
}

fn default_window() -> u64 {
    3600 // 1 hour
}

fn default_cooldown() -> u64 {
    120
}

fn default_settle_delay() -> u64 {
    5
}

fn default_poll_attempts() -> u32 {
    10
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_recovery_history() -> usize {
    50
}

fn default_sdio_driver_path() -> String {
    "/sys/bus/sdio/drivers/brcmfmac".to_string()
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            blind_epoch_threshold: default_blind_threshold(),
            max_recoveries: default_max_recoveries(),
            window_secs: default_window(),
            cooldown_secs: default_cooldown(),
            settle_delay_secs: default_settle_delay(),
            interface_poll_attempts: default_poll_attempts(),
            interface_poll_interval_ms: default_poll_interval(),
            history_len: default_recovery_history(),
            sdio_device: None,
            sdio_driver_path: default_sdio_driver_path(),
        }
    }
}

impl RecoveryConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.interface_poll_interval_ms)
    }
}

// ============================================================================
// [scanner]
// ============================================================================

/// One log signature as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRuleConfig {
    pub name: String,
    /// Regular expression
    pub pattern: String,
    pub source: LogSource,
    #[serde(default = "default_min_occurrences")]
    pub min_occurrences: usize,
    pub action: LogAction,
}

fn default_min_occurrences() -> usize {
    1
}

impl LogRuleConfig {
    fn new(
        name: &str,
        pattern: &str,
        source: LogSource,
        min_occurrences: usize,
        action: LogAction,
    ) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            source,
            min_occurrences,
            action,
        }
    }
}

/// Known brcmfmac/nexmon failure signatures, highest priority first.
pub fn default_rules() -> Vec<LogRuleConfig> {
    use LogAction::*;
    use LogSource::*;
    vec![
        LogRuleConfig::new(
            "iface_validation",
            r"brcmf_cfg80211_add_iface: iface validation failed: err=-95",
            Kernel,
            1,
            InterfaceMissing,
        ),
        LogRuleConfig::new(
            "hop_error",
            r"wifi error while hopping to channel",
            System,
            5,
            HopError,
        ),
        LogRuleConfig::new(
            "firmware_crash",
            r"Firmware has halted or crashed",
            System,
            1,
            Crash,
        ),
        LogRuleConfig::new(
            "monitor_missing",
            r"error 400: could not find interface wlan0mon",
            Application,
            3,
            InterfaceMissing,
        ),
        LogRuleConfig::new(
            "concurrent_map",
            r"fatal error: concurrent map iteration and map write",
            Application,
            1,
            HostPanic,
        ),
        LogRuleConfig::new(
            "runtime_panic",
            r"panic: runtime error",
            Application,
            1,
            HostPanic,
        ),
        LogRuleConfig::new(
            "allmulti_timeout",
            r"_brcmf_set_multicast_list: Setting allmulti failed, -110",
            Application,
            1,
            HopError,
        ),
        LogRuleConfig::new(
            "sdio_init",
            r"Failed to initialize a non-removable card|error -22 whilst initialising SDIO card",
            Kernel,
            1,
            BusDown,
        ),
        LogRuleConfig::new(
            "set_channel",
            r"brcmf_cfg80211_nexmon_set_channel: Set Channel failed",
            Kernel,
            3,
            HopError,
        ),
        LogRuleConfig::new(
            "escan_timeout",
            r"brcmf_run_escan: error \(-110\)",
            Kernel,
            3,
            HopError,
        ),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_scanner_enabled")]
    pub enabled: bool,

    /// Minimum time between two log reads
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Logs are not read for this long after a recovery started
    #[serde(default = "default_quiet_period")]
    pub quiet_period_secs: u64,

    /// Lines read from the tail of each source
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,

    #[serde(default = "default_application_log")]
    pub application_log: String,

    /// Ordered rule list; first match wins
    #[serde(default = "default_rules")]
    pub rules: Vec<LogRuleConfig>,
}

fn default_scanner_enabled() -> bool {
    true
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_quiet_period() -> u64 {
    180
}

fn default_tail_lines() -> usize {
    10
}

fn default_application_log() -> String {
    "/etc/pwnagotchi/log/pwnagotchi.log".to_string()
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scanner_enabled(),
            refresh_interval_secs: default_refresh_interval(),
            quiet_period_secs: default_quiet_period(),
            tail_lines: default_tail_lines(),
            application_log: default_application_log(),
            rules: default_rules(),
        }
    }
}

// ============================================================================
// [diagnostics]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_diag_interval")]
    pub interval_secs: u64,

    /// Per-cycle observation records kept for reports
    #[serde(default = "default_signal_history")]
    pub signal_history_len: usize,

    /// Driver error lines kept in each snapshot
    #[serde(default = "default_driver_error_lines")]
    pub driver_error_lines: usize,
}

fn default_diag_interval() -> u64 {
    10
}

fn default_signal_history() -> usize {
    100
}

fn default_driver_error_lines() -> usize {
    20
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_diag_interval(),
            signal_history_len: default_signal_history(),
            driver_error_lines: default_driver_error_lines(),
        }
    }
}

// ============================================================================
// [display]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_display_enabled")]
    pub enabled: bool,

    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    #[serde(default = "default_push_interval")]
    pub push_interval_secs: u64,

    #[serde(default = "default_display_timeout")]
    pub timeout_ms: u64,
}

fn default_display_enabled() -> bool {
    true
}

fn default_socket_path() -> String {
    "/var/run/pwnaui.sock".to_string()
}

fn default_push_interval() -> u64 {
    5
}

fn default_display_timeout() -> u64 {
    500
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: default_display_enabled(),
            socket_path: default_socket_path(),
            push_interval_secs: default_push_interval(),
            timeout_ms: default_display_timeout(),
        }
    }
}

// ============================================================================
// [host]
// ============================================================================

/// Shell commands that drive the host application. Unset commands are
/// skipped and reported as not configured; without `observe_command` the
/// observation loop does not run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub pause_command: Option<String>,

    #[serde(default)]
    pub resume_command: Option<String>,

    /// Switch host scanning off and on again
    #[serde(default)]
    pub toggle_command: Option<String>,

    #[serde(default)]
    pub restart_command: Option<String>,

    /// Prints the number of results seen since the previous call
    #[serde(default)]
    pub observe_command: Option<String>,

    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,

    #[serde(default = "default_host_timeout")]
    pub command_timeout_secs: u64,
}

fn default_cycle_interval() -> u64 {
    30
}

fn default_host_timeout() -> u64 {
    10
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            pause_command: None,
            resume_command: None,
            toggle_command: None,
            restart_command: None,
            observe_command: None,
            cycle_interval_secs: default_cycle_interval(),
            command_timeout_secs: default_host_timeout(),
        }
    }
}

// ============================================================================
// Root
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default)]
    pub interface: InterfaceConfig,

    #[serde(default)]
    pub hopper: HopperConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    #[serde(default)]
    pub display: DisplayConfig,

    #[serde(default)]
    pub host: HostConfig,
}

impl WatchdogConfig {
    /// Load from `path`. A missing file yields the defaults; a file that
    /// exists but cannot be read or parsed is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Reject settings that would make the watchdog spin or never act.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let iface = &self.interface;
        for (name, value) in [
            ("interface.monitor_interface", &iface.monitor_interface),
            ("interface.base_interface", &iface.base_interface),
            ("interface.phy", &iface.phy),
            ("interface.driver_module", &iface.driver_module),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} must not be empty", name)));
            }
        }

        let positive = [
            ("interface.command_timeout_secs", iface.command_timeout_secs),
            ("interface.module_timeout_secs", iface.module_timeout_secs),
            ("interface.link_timeout_secs", iface.link_timeout_secs),
            ("hopper.hop_timeout_secs", self.hopper.hop_timeout_secs),
            ("hopper.auto_hop_interval_ms", self.hopper.auto_hop_interval_ms),
            (
                "recovery.blind_epoch_threshold",
                u64::from(self.recovery.blind_epoch_threshold),
            ),
            ("recovery.max_recoveries", self.recovery.max_recoveries as u64),
            ("recovery.window_secs", self.recovery.window_secs),
            (
                "recovery.interface_poll_attempts",
                u64::from(self.recovery.interface_poll_attempts),
            ),
            ("scanner.tail_lines", self.scanner.tail_lines as u64),
            ("scanner.refresh_interval_secs", self.scanner.refresh_interval_secs),
            ("diagnostics.interval_secs", self.diagnostics.interval_secs),
            ("display.push_interval_secs", self.display.push_interval_secs),
            ("host.cycle_interval_secs", self.host.cycle_interval_secs),
            ("host.command_timeout_secs", self.host.command_timeout_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }

        if self.hopper.max_consecutive_errors == 0 {
            return Err(ConfigError::Invalid(
                "hopper.max_consecutive_errors must be greater than 0".to_string(),
            ));
        }

        for rule in &self.scanner.rules {
            if rule.min_occurrences == 0 {
                return Err(ConfigError::Invalid(format!(
                    "scanner rule {} needs min_occurrences >= 1",
                    rule.name
                )));
            }
        }

        Ok(())
    }
}
