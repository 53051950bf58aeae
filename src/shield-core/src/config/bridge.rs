//! Bridge selection as a pure configuration mutation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ConfigRecord;

/// Pluggable transport family for Tor bridges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BridgeKind {
    /// Connect to public relays directly
    #[default]
    None,
    /// Plain bridge lines, no transport plugin
    Vanilla,
    Obfs4,
    Snowflake,
    /// meek_lite, served by the obfs4proxy binary
    Meek,
}

impl BridgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeKind::None => "none",
            BridgeKind::Vanilla => "vanilla",
            BridgeKind::Obfs4 => "obfs4",
            BridgeKind::Snowflake => "snowflake",
            BridgeKind::Meek => "meek",
        }
    }

    /// Transport name as it appears in `Bridge` / `ClientTransportPlugin` lines.
    pub fn transport(&self) -> Option<&'static str> {
        match self {
            BridgeKind::None | BridgeKind::Vanilla => None,
            BridgeKind::Obfs4 => Some("obfs4"),
            BridgeKind::Snowflake => Some("snowflake"),
            BridgeKind::Meek => Some("meek_lite"),
        }
    }
}

impl fmt::Display for BridgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BridgeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Ok(BridgeKind::None),
            "vanilla" | "plain" => Ok(BridgeKind::Vanilla),
            "obfs4" => Ok(BridgeKind::Obfs4),
            "snowflake" => Ok(BridgeKind::Snowflake),
            "meek" | "meek_lite" | "meek-azure" => Ok(BridgeKind::Meek),
            other => Err(format!("unknown bridge type {other:?}")),
        }
    }
}

/// A chosen bridge type plus the bridge lines that go with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSelection {
    pub kind: BridgeKind,
    pub lines: Vec<String>,
}

impl BridgeSelection {
    pub fn disabled() -> Self {
        Self {
            kind: BridgeKind::None,
            lines: Vec::new(),
        }
    }
}

/// Return a copy of `record` configured for `selection`.
///
/// Lines that do not already start with the transport name get it
/// prepended, so users can paste either `1.2.3.4:443 FPR ...` or
/// `obfs4 1.2.3.4:443 FPR ...`. Selecting [`BridgeKind::None`] turns bridges
/// off but keeps any previously stored lines.
pub fn apply_bridge(record: &ConfigRecord, selection: &BridgeSelection) -> ConfigRecord {
    let mut updated = record.clone();
    let tor = updated.entry("tor".to_string()).or_default();

    if selection.kind == BridgeKind::None {
        tor.insert("use_bridges".into(), "false".into());
        tor.insert("bridge_type".into(), BridgeKind::None.to_string());
        return updated;
    }

    let lines: Vec<String> = selection
        .lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|l| normalize_line(selection.kind, l))
        .collect();

    tor.insert("use_bridges".into(), "true".into());
    tor.insert("bridge_type".into(), selection.kind.to_string());
    tor.insert("bridges".into(), lines.join("\n"));
    updated
}

fn normalize_line(kind: BridgeKind, line: &str) -> String {
    let line = line.strip_prefix("Bridge ").unwrap_or(line).trim();
    match kind.transport() {
        Some(transport) if !line.starts_with(transport) => format!("{transport} {line}"),
        _ => line.to_string(),
    }
}
