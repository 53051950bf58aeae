//! Persistent configuration store.
//!
//! The on-disk format is TOML with one table per section and string values:
//!
//! ```toml
//! [general]
//! mac_randomization = "true"
//!
//! [tor]
//! socks_port = "9050"
//! ```
//!
//! Unquoted integers and booleans are accepted and normalised to strings.
//! Defaults for every recognised key are merged in on load and the file is
//! rewritten, so a freshly created file documents every option. Unknown keys
//! survive the rewrite untouched.

pub mod bridge;
pub mod schema;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Result, ShieldError};
use crate::paths::atomic_write;

pub use bridge::{apply_bridge, BridgeKind, BridgeSelection};
pub use schema::{
    DnsSettings, GeneralSettings, I2pSettings, PerformanceSettings, ShieldSettings, TorSettings,
};

/// section -> key -> value
pub type ConfigRecord = BTreeMap<String, BTreeMap<String, String>>;

/// Insert defaults for every recognised key that has no value yet.
/// Returns the number of keys added.
pub fn merge_defaults(record: &mut ConfigRecord) -> usize {
    let mut added = 0;
    for (section, key, default) in schema::DEFAULTS {
        let entries = record.entry(section.to_string()).or_default();
        if !entries.contains_key(*key) {
            entries.insert(key.to_string(), default.to_string());
            added += 1;
        }
    }
    added
}

/// Configuration record bound to an optional backing file
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    record: ConfigRecord,
}

impl ConfigStore {
    /// Load `path` (creating it if missing), merge defaults, and rewrite it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut record = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            parse_record(&content)?
        } else {
            info!(path = %path.display(), "creating default configuration");
            ConfigRecord::new()
        };

        let added = merge_defaults(&mut record);
        debug!(path = %path.display(), added, "configuration loaded");

        let store = Self {
            path: Some(path.to_path_buf()),
            record,
        };
        store.save()?;
        Ok(store)
    }

    /// Defaults only, never written anywhere.
    pub fn in_memory() -> Self {
        let mut record = ConfigRecord::new();
        merge_defaults(&mut record);
        Self { path: None, record }
    }

    /// Wrap an existing record (defaults merged), without a backing file.
    pub fn from_record(mut record: ConfigRecord) -> Self {
        merge_defaults(&mut record);
        Self { path: None, record }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self) -> &ConfigRecord {
        &self.record
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.record
            .get(section)
            .and_then(|s| s.get(key))
            .map(String::as_str)
    }

    /// Set a value. Recognised keys are validated by re-parsing the whole
    /// record; unknown keys are stored as-is.
    pub fn set(&mut self, section: &str, key: &str, value: &str) -> Result<()> {
        let mut candidate = self.record.clone();
        candidate
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());

        if schema::is_known(section, key) {
            ShieldSettings::from_record(&candidate)?;
        } else {
            warn!(section, key, "storing unrecognised configuration key");
        }
        self.record = candidate;
        Ok(())
    }

    /// Replace the whole record, e.g. with the output of [`apply_bridge`].
    pub fn replace(&mut self, record: ConfigRecord) -> Result<()> {
        let mut record = record;
        merge_defaults(&mut record);
        ShieldSettings::from_record(&record)?;
        self.record = record;
        Ok(())
    }

    /// Typed view of the current record.
    pub fn settings(&self) -> Result<ShieldSettings> {
        ShieldSettings::from_record(&self.record)
    }

    /// Write back to the backing file, if any.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = toml::to_string_pretty(&self.record)?;
        atomic_write(path, content.as_bytes())?;
        debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Parse TOML into a record, stringifying scalar values.
pub fn parse_record(content: &str) -> Result<ConfigRecord> {
    let table: toml::Table = toml::from_str(content)?;
    let mut record = ConfigRecord::new();

    for (section, value) in table {
        let toml::Value::Table(entries) = value else {
            warn!(key = %section, "ignoring top-level value outside any section");
            continue;
        };
        let target = record.entry(section.clone()).or_default();
        for (key, value) in entries {
            let text = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                other => {
                    return Err(ShieldError::config(
                        &section,
                        &key,
                        format!("unsupported value type {}", other.type_str()),
                    ))
                }
            };
            target.insert(key, text);
        }
    }
    Ok(record)
}
