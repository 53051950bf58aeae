//! Recognised configuration keys, their defaults, and typed views.

use std::net::IpAddr;
use std::time::Duration;

use crate::error::{Result, ShieldError};

use super::bridge::BridgeKind;
use super::ConfigRecord;

/// `(section, key, default)` for every key the engine reads.
pub const DEFAULTS: &[(&str, &str, &str)] = &[
    ("general", "mac_randomization", "true"),
    ("general", "dns_protection", "true"),
    ("general", "kill_switch", "true"),
    ("general", "i2p_enabled", "false"),
    ("tor", "binary", "tor"),
    ("tor", "service", "tor"),
    ("tor", "user", "debian-tor"),
    ("tor", "socks_port", "9050"),
    ("tor", "control_port", "9051"),
    ("tor", "trans_port", "9040"),
    ("tor", "dns_port", "53"),
    ("tor", "or_port", "9001"),
    ("tor", "dir_port", "9030"),
    ("tor", "web_ports", "80,443"),
    ("tor", "use_bridges", "false"),
    ("tor", "bridge_type", "none"),
    ("tor", "bridges", ""),
    ("tor", "obfs4proxy_path", "/usr/bin/obfs4proxy"),
    ("tor", "snowflake_path", "/usr/bin/snowflake-client"),
    ("tor", "stealth_mode", "false"),
    ("i2p", "service", "i2pd"),
    ("i2p", "http_proxy_port", "4444"),
    ("i2p", "socks_port", "4447"),
    ("dns", "primary", "127.0.0.1"),
    ("dns", "secondary", "1.1.1.1"),
    ("dns", "fallback", "9.9.9.9"),
    ("performance", "circuit_build_timeout", "60"),
    ("performance", "num_entry_guards", "3"),
    ("performance", "keepalive_period", "60"),
    ("performance", "new_circuit_period", "30"),
    ("performance", "max_circuit_dirtiness", "600"),
    ("performance", "connection_padding", "true"),
    ("performance", "readiness_attempts", "30"),
    ("performance", "readiness_interval_ms", "1000"),
    ("performance", "secondary_settle_secs", "10"),
    ("performance", "restart_delay_secs", "2"),
];

/// Whether `section.key` is part of the schema.
pub fn is_known(section: &str, key: &str) -> bool {
    DEFAULTS.iter().any(|(s, k, _)| *s == section && *k == key)
}

/// Feature toggles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralSettings {
    pub mac_randomization: bool,
    pub dns_protection: bool,
    pub kill_switch: bool,
    pub i2p_enabled: bool,
}

/// Primary proxy (Tor) settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorSettings {
    pub binary: String,
    pub service: String,
    /// Process owner the kill switch admits
    pub user: String,
    pub socks_port: u16,
    pub control_port: u16,
    pub trans_port: u16,
    pub dns_port: u16,
    pub or_port: u16,
    pub dir_port: u16,
    pub web_ports: Vec<u16>,
    pub use_bridges: bool,
    pub bridge_type: BridgeKind,
    pub bridges: Vec<String>,
    pub obfs4proxy_path: String,
    pub snowflake_path: String,
    pub stealth_mode: bool,
}

/// Secondary proxy (I2P) settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2pSettings {
    pub service: String,
    pub http_proxy_port: u16,
    pub socks_port: u16,
}

/// Replacement resolvers, in preference order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsSettings {
    pub primary: IpAddr,
    pub secondary: IpAddr,
    pub fallback: IpAddr,
}

impl DnsSettings {
    pub fn servers(&self) -> [IpAddr; 3] {
        [self.primary, self.secondary, self.fallback]
    }
}

/// Circuit tuning and the engine's wait budgets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerformanceSettings {
    pub circuit_build_timeout: u32,
    pub num_entry_guards: u32,
    pub keepalive_period: u32,
    pub new_circuit_period: u32,
    pub max_circuit_dirtiness: u32,
    pub connection_padding: bool,
    pub readiness_attempts: u32,
    pub readiness_interval: Duration,
    pub secondary_settle: Duration,
    pub restart_delay: Duration,
}

/// Typed, validated view over a [`ConfigRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShieldSettings {
    pub general: GeneralSettings,
    pub tor: TorSettings,
    pub i2p: I2pSettings,
    pub dns: DnsSettings,
    pub performance: PerformanceSettings,
}

impl Default for ShieldSettings {
    fn default() -> Self {
        let mut record = ConfigRecord::new();
        super::merge_defaults(&mut record);
        // The built-in defaults always parse.
        match Self::from_record(&record) {
            Ok(settings) => settings,
            Err(e) => unreachable!("built-in defaults rejected: {e}"),
        }
    }
}

impl ShieldSettings {
    /// Parse every recognised key. Missing keys fall back to the default.
    pub fn from_record(record: &ConfigRecord) -> Result<Self> {
        let r = Reader { record };
        Ok(Self {
            general: GeneralSettings {
                mac_randomization: r.bool("general", "mac_randomization")?,
                dns_protection: r.bool("general", "dns_protection")?,
                kill_switch: r.bool("general", "kill_switch")?,
                i2p_enabled: r.bool("general", "i2p_enabled")?,
            },
            tor: TorSettings {
                binary: r.non_empty("tor", "binary")?,
                service: r.non_empty("tor", "service")?,
                user: r.non_empty("tor", "user")?,
                socks_port: r.port("tor", "socks_port")?,
                control_port: r.port("tor", "control_port")?,
                trans_port: r.port("tor", "trans_port")?,
                dns_port: r.port("tor", "dns_port")?,
                or_port: r.port("tor", "or_port")?,
                dir_port: r.port("tor", "dir_port")?,
                web_ports: r.port_list("tor", "web_ports")?,
                use_bridges: r.bool("tor", "use_bridges")?,
                bridge_type: r.parsed("tor", "bridge_type")?,
                bridges: r.lines("tor", "bridges"),
                obfs4proxy_path: r.string("tor", "obfs4proxy_path"),
                snowflake_path: r.string("tor", "snowflake_path"),
                stealth_mode: r.bool("tor", "stealth_mode")?,
            },
            i2p: I2pSettings {
                service: r.non_empty("i2p", "service")?,
                http_proxy_port: r.port("i2p", "http_proxy_port")?,
                socks_port: r.port("i2p", "socks_port")?,
            },
            dns: DnsSettings {
                primary: r.parsed("dns", "primary")?,
                secondary: r.parsed("dns", "secondary")?,
                fallback: r.parsed("dns", "fallback")?,
            },
            performance: PerformanceSettings {
                circuit_build_timeout: r.parsed("performance", "circuit_build_timeout")?,
                num_entry_guards: r.parsed("performance", "num_entry_guards")?,
                keepalive_period: r.parsed("performance", "keepalive_period")?,
                new_circuit_period: r.parsed("performance", "new_circuit_period")?,
                max_circuit_dirtiness: r.parsed("performance", "max_circuit_dirtiness")?,
                connection_padding: r.bool("performance", "connection_padding")?,
                readiness_attempts: r.parsed("performance", "readiness_attempts")?,
                readiness_interval: Duration::from_millis(
                    r.parsed("performance", "readiness_interval_ms")?,
                ),
                secondary_settle: Duration::from_secs(
                    r.parsed("performance", "secondary_settle_secs")?,
                ),
                restart_delay: Duration::from_secs(r.parsed("performance", "restart_delay_secs")?),
            },
        })
    }
}

/// Parse a configparser-style boolean.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

struct Reader<'a> {
    record: &'a ConfigRecord,
}

impl Reader<'_> {
    fn string(&self, section: &str, key: &str) -> String {
        self.record
            .get(section)
            .and_then(|s| s.get(key))
            .cloned()
            .or_else(|| {
                DEFAULTS
                    .iter()
                    .find(|(s, k, _)| *s == section && *k == key)
                    .map(|(_, _, v)| v.to_string())
            })
            .unwrap_or_default()
    }

    fn non_empty(&self, section: &str, key: &str) -> Result<String> {
        let value = self.string(section, key).trim().to_string();
        if value.is_empty() {
            return Err(ShieldError::config(section, key, "must not be empty"));
        }
        Ok(value)
    }

    fn bool(&self, section: &str, key: &str) -> Result<bool> {
        let raw = self.string(section, key);
        parse_bool(&raw)
            .ok_or_else(|| ShieldError::config(section, key, format!("not a boolean: {raw:?}")))
    }

    fn parsed<T>(&self, section: &str, key: &str) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.string(section, key);
        raw.trim()
            .parse()
            .map_err(|e| ShieldError::config(section, key, format!("{raw:?}: {e}")))
    }

    fn port(&self, section: &str, key: &str) -> Result<u16> {
        let port: u16 = self.parsed(section, key)?;
        if port == 0 {
            return Err(ShieldError::config(section, key, "port 0 is not allowed"));
        }
        Ok(port)
    }

    fn port_list(&self, section: &str, key: &str) -> Result<Vec<u16>> {
        let raw = self.string(section, key);
        let mut ports = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let port: u16 = part
                .parse()
                .map_err(|e| ShieldError::config(section, key, format!("{part:?}: {e}")))?;
            if port == 0 {
                return Err(ShieldError::config(section, key, "port 0 is not allowed"));
            }
            ports.push(port);
        }
        Ok(ports)
    }

    fn lines(&self, section: &str, key: &str) -> Vec<String> {
        self.string(section, key)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()
    }
}
