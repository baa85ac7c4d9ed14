//! Local network interface state, read from sysfs.
//!
//! Interface selection needs to know whether a candidate exists and is
//! administratively up; the router API (when enabled) adds connectivity.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

const SYSFS_NET: &str = "/sys/class/net";

/// IFF_UP
const IFF_UP: u32 = 0x1;

/// Type of network interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Loopback,
    Bridge,
    Ppp,
    TunTap,
    WireGuard,
    Vlan,
    Unknown,
}

impl InterfaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceType::Ethernet => "ethernet",
            InterfaceType::Wireless => "wireless",
            InterfaceType::Loopback => "loopback",
            InterfaceType::Bridge => "bridge",
            InterfaceType::Ppp => "ppp",
            InterfaceType::TunTap => "tun/tap",
            InterfaceType::WireGuard => "wireguard",
            InterfaceType::Vlan => "vlan",
            InterfaceType::Unknown => "unknown",
        }
    }
}

/// Link state of one local interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkState {
    pub admin_up: bool,
    /// Carrier present (operstate `up`, or `unknown` for tunnels that don't report it)
    pub link_up: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalInterface {
    pub name: String,
    pub interface_type: InterfaceType,
    pub state: LinkState,
}

/// Reader over a sysfs `class/net` directory.
#[derive(Debug, Clone)]
pub struct Sysfs {
    root: PathBuf,
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new(SYSFS_NET)
    }
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `None` when the interface does not exist.
    pub fn link_state(&self, name: &str) -> Option<LinkState> {
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return None;
        }

        let flags = read_trimmed(&dir.join("flags"))
            .and_then(|f| u32::from_str_radix(f.trim_start_matches("0x"), 16).ok())
            .unwrap_or(0);
        let operstate = read_trimmed(&dir.join("operstate")).unwrap_or_default();
        let admin_up = flags & IFF_UP != 0;

        Some(LinkState {
            admin_up,
            link_up: admin_up && matches!(operstate.as_str(), "up" | "unknown"),
        })
    }

    /// All interfaces, sorted by name
    pub fn list(&self) -> Result<Vec<LocalInterface>> {
        let mut interfaces = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read {:?}", self.root))?
        {
            let name = entry?.file_name().to_string_lossy().to_string();
            if let Some(state) = self.link_state(&name) {
                interfaces.push(LocalInterface {
                    interface_type: self.detect_type(&name),
                    name,
                    state,
                });
            }
        }
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(interfaces)
    }

    fn detect_type(&self, name: &str) -> InterfaceType {
        if self.root.join(name).join("bridge").exists() {
            return InterfaceType::Bridge;
        }
        detect_interface_type(name)
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Detect interface type from its name
fn detect_interface_type(name: &str) -> InterfaceType {
    if name == "lo" {
        return InterfaceType::Loopback;
    }
    if name.starts_with("wg") || name.starts_with("nwg") {
        return InterfaceType::WireGuard;
    }
    if name.starts_with("ppp") {
        return InterfaceType::Ppp;
    }
    if name.starts_with("tun") || name.starts_with("tap") {
        return InterfaceType::TunTap;
    }
    if name.contains('.') || name.starts_with("vlan") {
        return InterfaceType::Vlan;
    }
    if name.starts_with("br") {
        return InterfaceType::Bridge;
    }
    if name.starts_with("wlan") || name.starts_with("wlp") || name.starts_with("ra") {
        return InterfaceType::Wireless;
    }
    if name.starts_with("eth")
        || name.starts_with("enp")
        || name.starts_with("eno")
        || name.starts_with("ens")
    {
        return InterfaceType::Ethernet;
    }
    InterfaceType::Unknown
}

/// Format the interface table shown by the CLI
pub fn format_report(interfaces: &[LocalInterface]) -> String {
    let mut output = String::new();
    output.push_str(&format!(
        "{:<15} {:<10} {:<6} {}\n",
        "Interface", "Type", "Admin", "Link"
    ));
    output.push_str(&format!(
        "{:<15} {:<10} {:<6} {}\n",
        "-".repeat(15),
        "-".repeat(10),
        "-".repeat(6),
        "-".repeat(4)
    ));
    let updown = |b: bool| if b { "up" } else { "down" };
    for iface in interfaces {
        output.push_str(&format!(
            "{:<15} {:<10} {:<6} {}\n",
            iface.name,
            iface.interface_type.as_str(),
            updown(iface.state.admin_up),
            updown(iface.state.link_up)
        ));
    }
    output
}


#[cfg(test)]
mod tests {
    use super::fake::add_iface;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_link_state_from_sysfs() {
        let dir = TempDir::new().unwrap();
        add_iface(dir.path(), "eth0", true, "up");
        add_iface(dir.path(), "eth1", true, "down");
        add_iface(dir.path(), "eth2", false, "down");
        add_iface(dir.path(), "wg0", true, "unknown");
        let sysfs = Sysfs::new(dir.path());

        assert_eq!(
            sysfs.link_state("eth0"),
            Some(LinkState {
                admin_up: true,
                link_up: true
            })
        );
        assert!(!sysfs.link_state("eth1").unwrap().link_up);
        assert!(!sysfs.link_state("eth2").unwrap().admin_up);
        assert!(sysfs.link_state("wg0").unwrap().link_up);
        assert_eq!(sysfs.link_state("eth9"), None);
    }

    #[test]
    fn test_list_sorted_with_types() {
        let dir = TempDir::new().unwrap();
        add_iface(dir.path(), "ppp0", true, "unknown");
        add_iface(dir.path(), "eth0", true, "up");
        let list = Sysfs::new(dir.path()).list().unwrap();
        assert_eq!(list[0].name, "eth0");
        assert_eq!(list[1].interface_type, InterfaceType::Ppp);

        let report = format_report(&list);
        assert!(report.contains("ppp0"));
    }

    #[test]
    fn test_detect_interface_type() {
        assert_eq!(detect_interface_type("lo"), InterfaceType::Loopback);
        assert_eq!(detect_interface_type("nwg0"), InterfaceType::WireGuard);
        assert_eq!(detect_interface_type("eth2.100"), InterfaceType::Vlan);
        assert_eq!(detect_interface_type("tun0"), InterfaceType::TunTap);
        assert_eq!(detect_interface_type("enp0s3"), InterfaceType::Ethernet);
        assert_eq!(detect_interface_type("foo"), InterfaceType::Unknown);
    }
}
