//! Persistent session state and the running-session marker.
//!
//! `session.json` is rewritten after every component step, so a crashed or
//! restarted process can still report what is in effect. The `mac` and `dns`
//! flags are never trusted from the file: on load they are recomputed from
//! the original-MAC map and the DNS backup, which are the canonical facts.
//!
//! `shield.pid` exists only while a session is Active and holds the pid of
//! the managing process. A marker whose process is gone is *orphaned*.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::component::ComponentKind;
use crate::error::Result;
use crate::host::ProcessControl;
use crate::paths::{atomic_write, ShieldPaths};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    #[default]
    Inactive,
    Transitioning,
    Active,
}

/// Which host mutations are currently in effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentFlags {
    pub mac: bool,
    pub dns: bool,
    pub firewall: bool,
    pub tor: bool,
    pub i2p: bool,
}

impl ComponentFlags {
    pub fn get(&self, kind: ComponentKind) -> bool {
        match kind {
            ComponentKind::Mac => self.mac,
            ComponentKind::Dns => self.dns,
            ComponentKind::Tor => self.tor,
            ComponentKind::I2p => self.i2p,
            ComponentKind::Firewall => self.firewall,
        }
    }

    pub fn set(&mut self, kind: ComponentKind, value: bool) {
        let slot = match kind {
            ComponentKind::Mac => &mut self.mac,
            ComponentKind::Dns => &mut self.dns,
            ComponentKind::Tor => &mut self.tor,
            ComponentKind::I2p => &mut self.i2p,
            ComponentKind::Firewall => &mut self.firewall,
        };
        *slot = value;
    }

    pub fn any(&self) -> bool {
        ComponentKind::ACTIVATION_ORDER.iter().any(|k| self.get(*k))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub phase: SessionPhase,
    /// Managing process while not Inactive
    pub pid: Option<u32>,
    pub activated_at: Option<DateTime<Utc>>,
    pub flags: ComponentFlags,
}

/// What the marker file says about the managing process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerStatus {
    Absent,
    Live(u32),
    /// Marker left behind; the pid is `None` when the file is unreadable
    Orphaned(Option<u32>),
}

impl MarkerStatus {
    pub fn pid(&self) -> Option<u32> {
        match self {
            MarkerStatus::Absent => None,
            MarkerStatus::Live(pid) => Some(*pid),
            MarkerStatus::Orphaned(pid) => *pid,
        }
    }
}

/// Loads and saves [`SessionState`] and the marker
#[derive(Debug, Clone)]
pub struct SessionStore {
    state_path: PathBuf,
    marker_path: PathBuf,
    mac_map_path: PathBuf,
    dns_backup_path: PathBuf,
}

impl SessionStore {
    pub fn new(paths: &ShieldPaths) -> Self {
        Self {
            state_path: paths.session_file(),
            marker_path: paths.marker_file(),
            mac_map_path: paths.mac_map_file(),
            dns_backup_path: paths.dns_backup_file(),
        }
    }

    /// Load the state, falling back to a fresh one when the file is missing
    /// or unreadable, then reconcile the disk-backed flags.
    pub fn load(&self) -> SessionState {
        let mut state = match std::fs::read_to_string(&self.state_path) {
            Ok(content) => match serde_json::from_str::<SessionState>(&content) {
                Ok(state) => state,
                Err(e) => {
                    warn!(%e, path = %self.state_path.display(), "corrupt session state, starting fresh");
                    SessionState::default()
                }
            },
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(%e, path = %self.state_path.display(), "cannot read session state");
                }
                SessionState::default()
            }
        };
        self.reconcile(&mut state);
        state
    }

    /// Overwrite the `mac` and `dns` flags with what is on disk.
    pub fn reconcile(&self, state: &mut SessionState) {
        state.flags.mac = self.mac_map_path.exists();
        state.flags.dns = self.dns_backup_path.exists();
    }

    pub fn save(&self, state: &SessionState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        atomic_write(&self.state_path, json.as_bytes())?;
        debug!(phase = ?state.phase, flags = ?state.flags, "session state persisted");
        Ok(())
    }

    pub fn write_marker(&self, pid: u32) -> Result<()> {
        atomic_write(&self.marker_path, format!("{pid}\n").as_bytes())?;
        Ok(())
    }

    pub fn remove_marker(&self) -> Result<()> {
        match std::fs::remove_file(&self.marker_path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    pub fn marker_exists(&self) -> bool {
        self.marker_path.exists()
    }

    pub fn marker_status(&self, processes: &dyn ProcessControl) -> MarkerStatus {
        let raw = match std::fs::read_to_string(&self.marker_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return MarkerStatus::Absent,
            Err(e) => {
                warn!(%e, "cannot read session marker");
                return MarkerStatus::Orphaned(None);
            }
        };
        match raw.trim().parse::<u32>() {
            Ok(pid) if processes.is_alive(pid) => MarkerStatus::Live(pid),
            Ok(pid) => MarkerStatus::Orphaned(Some(pid)),
            Err(_) => MarkerStatus::Orphaned(None),
        }
    }
}
