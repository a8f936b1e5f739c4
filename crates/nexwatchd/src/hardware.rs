//! Startup hardware detection: which driver owns the base interface, which
//! Broadcom chip it is and what firmware it runs.

use crate::commands::InterfaceCommands;
use crate::executor::CommandRunner;
use nexwatch_common::HardwareInfo;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Chips supported by nexmon, as they appear in the kernel log.
pub const KNOWN_CHIPS: &[&str] = &["BCM43455C0", "BCM43430A1", "BCM43436B0"];

/// Driver bound to `iface`, via `<sys_root>/class/net/<iface>/device/driver`.
pub fn driver_for_interface(sys_root: &Path, iface: &str) -> Option<String> {
    let link = sys_root
        .join("class/net")
        .join(iface)
        .join("device/driver");
    let target = fs::read_link(&link).ok()?;
    target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
}

/// Module version from `<sys_root>/module/<driver>/version`.
pub fn module_version(sys_root: &Path, driver: &str) -> Option<String> {
    let path = sys_root.join("module").join(driver).join("version");
    let version = fs::read_to_string(path).ok()?;
    let version = version.trim();
    (!version.is_empty()).then(|| version.to_string())
}

pub fn classify_chip(kernel_log: &str) -> Option<&'static str> {
    KNOWN_CHIPS
        .iter()
        .copied()
        .find(|chip| kernel_log.contains(chip))
}

/// Firmware version from the driver's banner, e.g.
/// `Firmware: BCM4345/6 wl0: Feb 27 2018 03:15:32 version 7.45.154 (r684107 CY)`.
pub fn firmware_from_banner(kernel_log: &str) -> Option<String> {
    kernel_log
        .lines()
        .filter(|line| line.contains("Firmware:"))
        .find_map(|line| {
            let rest = line.split(" version ").nth(1)?;
            rest.split_whitespace().next().map(|v| v.to_string())
        })
}

pub async fn detect(
    runner: &dyn CommandRunner,
    commands: &InterfaceCommands,
    sys_root: &Path,
) -> HardwareInfo {
    let driver = driver_for_interface(sys_root, commands.base_interface());
    let external_adapter = match &driver {
        Some(name) if name != commands.driver_module() => {
            warn!(
                "{} is driven by {}, not {}: external adapter, watchdog disabled",
                commands.base_interface(),
                name,
                commands.driver_module()
            );
            true
        }
        Some(_) => false,
        None => {
            debug!("No driver link for {}", commands.base_interface());
            false
        }
    };

    let kernel_log = match runner.run_checked(&commands.kernel_ring()).await {
        Ok(output) => output.stdout,
        Err(e) => {
            debug!("Kernel ring buffer unavailable: {}", e);
            String::new()
        }
    };

    let chip_type = classify_chip(&kernel_log).unwrap_or("unknown").to_string();
    let firmware_version = module_version(sys_root, commands.driver_module())
        .or_else(|| firmware_from_banner(&kernel_log))
        .unwrap_or_else(|| "unknown".to_string());

    info!(
        "Hardware: chip={} firmware={} driver={}",
        chip_type,
        firmware_version,
        driver.as_deref().unwrap_or("none")
    );

    HardwareInfo {
        chip_type,
        firmware_version,
        driver,
        external_adapter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{FakeCommandRunner, FakeReply};
    use nexwatch_common::InterfaceConfig;
    use std::os::unix::fs::symlink;
    use std::time::Duration;

    fn sysfs_with_driver(driver: &str) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let drivers = root.path().join("bus/sdio/drivers").join(driver);
        fs::create_dir_all(&drivers).unwrap();
        let device = root.path().join("class/net/wlan0/device");
        fs::create_dir_all(&device).unwrap();
        symlink(&drivers, device.join("driver")).unwrap();
        root
    }

    fn commands() -> InterfaceCommands {
        InterfaceCommands::new(&InterfaceConfig::default(), Duration::from_secs(5))
    }

    #[test]
    fn test_driver_link_resolution() {
        let root = sysfs_with_driver("brcmfmac");
        assert_eq!(
            driver_for_interface(root.path(), "wlan0").as_deref(),
            Some("brcmfmac")
        );
        assert_eq!(driver_for_interface(root.path(), "wlan1"), None);
    }

    #[test]
    fn test_chip_and_banner() {
        let log = "[    5.1] brcmfmac: brcmf_fw_alloc_request: using brcm/brcmfmac43455-sdio for chip BCM43455C0\n[    5.4] brcmfmac: brcmf_c_preinit_dcmds: Firmware: BCM4345/6 wl0: Feb 27 2018 03:15:32 version 7.45.154 (r684107 CY) FWID 01-4fbe0b04\n";
        assert_eq!(classify_chip(log), Some("BCM43455C0"));
        assert_eq!(firmware_from_banner(log).as_deref(), Some("7.45.154"));
        assert_eq!(classify_chip("usb 1-1: new device"), None);
    }

    #[tokio::test]
    async fn test_detect_onboard_chip() {
        let root = sysfs_with_driver("brcmfmac");
        fs::create_dir_all(root.path().join("module/brcmfmac")).unwrap();
        fs::write(root.path().join("module/brcmfmac/version"), "7.45.241\n").unwrap();
        let fake = FakeCommandRunner::new();
        fake.respond("dmesg", FakeReply::ok("brcmfmac: ... chip BCM43436B0 rev 1"));

        let info = detect(&fake, &commands(), root.path()).await;
        assert_eq!(info.chip_type, "BCM43436B0");
        assert_eq!(info.firmware_version, "7.45.241");
        assert!(!info.external_adapter);
    }

    #[tokio::test]
    async fn test_detect_external_adapter() {
        let root = sysfs_with_driver("rt2800usb");
        let fake = FakeCommandRunner::new();
        fake.respond("dmesg", FakeReply::NotFound);

        let info = detect(&fake, &commands(), root.path()).await;
        assert!(info.external_adapter);
        assert_eq!(info.driver.as_deref(), Some("rt2800usb"));
        assert_eq!(info.chip_type, "unknown");
        assert_eq!(info.firmware_version, "unknown");
    }
}
