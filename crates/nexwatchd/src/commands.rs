//! OS command vocabulary for the monitor interface and its driver, plus
//! parsers for the status commands' output.

use crate::executor::CommandSpec;
use nexwatch_common::{Channel, InterfaceConfig};
use std::time::Duration;

/// Builds every interface/driver command from the configured names.
#[derive(Debug, Clone)]
pub struct InterfaceCommands {
    monitor: String,
    base: String,
    phy: String,
    driver: String,
    quick: Duration,
    module: Duration,
    link: Duration,
    hop: Duration,
}

impl InterfaceCommands {
    pub fn new(config: &InterfaceConfig, hop_timeout: Duration) -> Self {
        Self {
            monitor: config.monitor_interface.clone(),
            base: config.base_interface.clone(),
            phy: config.phy.clone(),
            driver: config.driver_module.clone(),
            quick: Duration::from_secs(config.command_timeout_secs),
            module: Duration::from_secs(config.module_timeout_secs),
            link: Duration::from_secs(config.link_timeout_secs),
            hop: hop_timeout,
        }
    }

    pub fn monitor_interface(&self) -> &str {
        &self.monitor
    }

    pub fn base_interface(&self) -> &str {
        &self.base
    }

    pub fn driver_module(&self) -> &str {
        &self.driver
    }

    pub fn set_channel(&self, channel: Channel) -> CommandSpec {
        CommandSpec::new("iw", self.hop)
            .args(["dev", self.monitor.as_str(), "set", "channel"])
            .arg(channel.number().to_string())
    }

    pub fn monitor_down(&self) -> CommandSpec {
        CommandSpec::new("ip", self.link).args(["link", "set", self.monitor.as_str(), "down"])
    }

    pub fn monitor_up(&self) -> CommandSpec {
        CommandSpec::new("ip", self.link).args(["link", "set", self.monitor.as_str(), "up"])
    }

    pub fn delete_monitor(&self) -> CommandSpec {
        CommandSpec::new("iw", self.link).args(["dev", self.monitor.as_str(), "del"])
    }

    pub fn create_monitor(&self) -> CommandSpec {
        CommandSpec::new("iw", self.link).args([
            "phy",
            self.phy.as_str(),
            "interface",
            "add",
            self.monitor.as_str(),
            "type",
            "monitor",
        ])
    }

    pub fn unload_driver(&self) -> CommandSpec {
        CommandSpec::new("modprobe", self.module).args(["-r", self.driver.as_str()])
    }

    pub fn load_driver(&self) -> CommandSpec {
        CommandSpec::new("modprobe", self.module).arg(self.driver.as_str())
    }

    pub fn rebuild_module_deps(&self) -> CommandSpec {
        CommandSpec::new("depmod", self.module).arg("-a")
    }

    pub fn show_base(&self) -> CommandSpec {
        CommandSpec::new("ip", self.quick).args(["link", "show", self.base.as_str()])
    }

    pub fn show_monitor(&self) -> CommandSpec {
        CommandSpec::new("ip", self.quick).args(["link", "show", self.monitor.as_str()])
    }

    pub fn monitor_info(&self) -> CommandSpec {
        CommandSpec::new("iw", self.quick).args(["dev", self.monitor.as_str(), "info"])
    }

    pub fn list_modules(&self) -> CommandSpec {
        CommandSpec::new("lsmod", self.quick)
    }

    pub fn kernel_log(&self, lines: usize) -> CommandSpec {
        CommandSpec::new("journalctl", self.quick)
            .args(["-k", "-n"])
            .arg(lines.to_string())
            .arg("--no-pager")
    }

    pub fn system_log(&self, lines: usize) -> CommandSpec {
        CommandSpec::new("journalctl", self.quick)
            .arg("-n")
            .arg(lines.to_string())
            .arg("--no-pager")
    }

    pub fn tail_file(&self, path: &str, lines: usize) -> CommandSpec {
        CommandSpec::new("tail", self.quick)
            .arg("-n")
            .arg(lines.to_string())
            .arg(path)
    }

    pub fn kernel_ring(&self) -> CommandSpec {
        CommandSpec::new("dmesg", self.quick)
    }

    pub fn sdio_unbind(&self, driver_path: &str, device: &str) -> CommandSpec {
        CommandSpec::shell(
            format!("echo {} > {}/unbind", device, driver_path.trim_end_matches('/')),
            self.quick,
        )
    }

    pub fn sdio_bind(&self, driver_path: &str, device: &str) -> CommandSpec {
        CommandSpec::shell(
            format!("echo {} > {}/bind", device, driver_path.trim_end_matches('/')),
            self.quick,
        )
    }
}

// ============================================================================
// Output parsers
// ============================================================================

/// Channel from `iw dev <iface> info`, e.g. `channel 6 (2437 MHz), width: 20 MHz`.
pub fn parse_channel(iw_info: &str) -> Option<Channel> {
    iw_info.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("channel ")?;
        let number = rest.split_whitespace().next()?;
        number.parse::<u16>().ok().map(Channel::new)
    })
}

/// Whether `iw dev <iface> info` reports `type monitor`.
pub fn is_monitor_mode(iw_info: &str) -> bool {
    iw_info.lines().any(|line| line.trim() == "type monitor")
}

/// Whether `ip link show` lists the UP flag, e.g. `<BROADCAST,MULTICAST,UP,LOWER_UP>`.
pub fn link_is_up(ip_link: &str) -> bool {
    let Some(start) = ip_link.find('<') else {
        return false;
    };
    let Some(len) = ip_link[start..].find('>') else {
        return false;
    };
    ip_link[start + 1..start + len]
        .split(',')
        .any(|flag| flag == "UP")
}

/// Whether `lsmod` output lists `module`.
pub fn module_loaded(lsmod: &str, module: &str) -> bool {
    lsmod
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|name| name == module)
}
