//! Interface inventory and link control.
//!
//! Interfaces are enumerated from sysfs (`/sys/class/net/<if>/address`);
//! link state and addresses are changed with `ip link set dev ...`, one
//! independently fallible command per step.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::error::{Result, ShieldError};
use crate::host::{exec_require, CommandRunner};

/// ARPHRD_LOOPBACK from `<linux/if_arp.h>`
const ARPHRD_LOOPBACK: u32 = 772;

/// 48-bit link-layer address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Bit 1 of the first octet: software-assigned address
    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    /// Bit 0 of the first octet: group address
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = ShieldError;

    fn from_str(s: &str) -> Result<Self> {
        let cleaned = s.trim();
        let parts: Vec<&str> = cleaned.split(':').collect();
        if parts.len() != 6 {
            return Err(ShieldError::InvalidMac(cleaned.to_string()));
        }
        let mut mac = [0u8; 6];
        for (idx, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(ShieldError::InvalidMac(cleaned.to_string()));
            }
            mac[idx] = u8::from_str_radix(part, 16)
                .map_err(|_| ShieldError::InvalidMac(cleaned.to_string()))?;
        }
        Ok(MacAddr(mac))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Link enumeration and the three link-control primitives.
pub trait LinkControl: Send + Sync {
    /// Every interface name, loopback included.
    fn interfaces(&self) -> Result<Vec<String>>;
    fn is_loopback(&self, name: &str) -> bool;
    /// Current address, `None` when unreadable.
    fn mac_address(&self, name: &str) -> Option<MacAddr>;
    fn set_down(&self, name: &str) -> Result<()>;
    fn set_address(&self, name: &str, mac: MacAddr) -> Result<()>;
    fn set_up(&self, name: &str) -> Result<()>;
}

/// sysfs for reads, `ip link` for writes
pub struct SysfsLink {
    sysfs_root: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl SysfsLink {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_root("/sys/class/net", runner)
    }

    pub fn with_root(sysfs_root: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            runner,
        }
    }

    fn read_attr(&self, name: &str, attr: &str) -> Option<String> {
        if !valid_interface_name(name) {
            return None;
        }
        std::fs::read_to_string(self.sysfs_root.join(name).join(attr))
            .ok()
            .map(|v| v.trim().to_string())
    }

    fn ip_link(&self, name: &str, args: &[&str]) -> Result<()> {
        if !valid_interface_name(name) {
            return Err(ShieldError::Command {
                program: "ip".into(),
                args: format!("link set dev {name}"),
                detail: "invalid interface name".into(),
            });
        }
        let mut full = vec!["link", "set", "dev", name];
        full.extend_from_slice(args);
        exec_require(self.runner.as_ref(), "ip", &full)
    }
}

impl LinkControl for SysfsLink {
    fn interfaces(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = std::fs::read_dir(&self.sysfs_root)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    fn is_loopback(&self, name: &str) -> bool {
        name == "lo"
            || self
                .read_attr(name, "type")
                .and_then(|t| t.parse::<u32>().ok())
                .is_some_and(|t| t == ARPHRD_LOOPBACK)
    }

    fn mac_address(&self, name: &str) -> Option<MacAddr> {
        self.read_attr(name, "address")
            .and_then(|raw| raw.parse().ok())
    }

    fn set_down(&self, name: &str) -> Result<()> {
        self.ip_link(name, &["down"])
    }

    fn set_address(&self, name: &str, mac: MacAddr) -> Result<()> {
        let mac = mac.to_string();
        self.ip_link(name, &["address", &mac])
    }

    fn set_up(&self, name: &str) -> Result<()> {
        self.ip_link(name, &["up"])
    }
}

/// Reject names that could escape sysfs or confuse `ip`.
pub fn valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 15
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
        && name != "."
        && name != ".."
}

/// A non-loopback interface and its current address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub mac: Option<MacAddr>,
}

/// Interface as shown in a status snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceDescriptor {
    pub name: String,
    pub mac: Option<MacAddr>,
    /// An original address for this interface is on record
    pub randomized: bool,
}

/// Non-loopback interfaces, with their address when readable.
pub fn scan(link: &dyn LinkControl) -> Result<Vec<InterfaceInfo>> {
    let interfaces = link
        .interfaces()?
        .into_iter()
        .filter(|name| !link.is_loopback(name))
        .map(|name| {
            let mac = link.mac_address(&name).filter(|m| !m.is_zero());
            debug!(interface = %name, mac = ?mac, "inventory");
            InterfaceInfo { name, mac }
        })
        .collect();
    Ok(interfaces)
}
