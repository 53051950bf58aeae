//! MAC address randomization with crash-safe restoration.
//!
//! Originals are written to the map file *before* any interface is touched,
//! so an interrupted run can always be undone. The map is the only record of
//! "randomization active": it is never overwritten while present and is
//! consumed by [`MacManager::restore`] whether or not every entry could be
//! put back.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::component::{ComponentKind, ShieldComponent, StepReport};
use crate::error::{Result, ShieldError};
use crate::inventory::{self, LinkControl, MacAddr};
use crate::paths::{atomic_write, ShieldPaths};

/// interface name -> original address
pub type OriginalMacMap = BTreeMap<String, MacAddr>;

/// Random locally administered unicast address.
pub fn random_mac<R: RngCore + ?Sized>(rng: &mut R) -> MacAddr {
    let mut octets = [0u8; 6];
    rng.fill_bytes(&mut octets);
    octets[0] = (octets[0] & 0xFC) | 0x02;
    MacAddr(octets)
}

/// One interface whose address was replaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacChange {
    pub interface: String,
    pub from: MacAddr,
    pub to: MacAddr,
}

/// Per-interface results of a randomize or restore pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacReport {
    pub changed: Vec<MacChange>,
    /// `"<interface>: <reason>"`
    pub failures: Vec<String>,
    /// Set when the call was a no-op
    pub noop: Option<String>,
}

impl MacReport {
    fn noop(reason: impl Into<String>) -> Self {
        Self {
            noop: Some(reason.into()),
            ..Default::default()
        }
    }

    fn to_step(&self, verb: &str) -> StepReport {
        let kind = ComponentKind::Mac;
        if let Some(reason) = &self.noop {
            return StepReport::skipped(kind, reason.clone());
        }
        let summary = format!("{} interface(s) {verb}", self.changed.len());
        let mut step = match (self.changed.is_empty(), self.failures.is_empty()) {
            (_, true) => StepReport::applied(kind, summary),
            (true, false) => StepReport::failed(kind, summary),
            (false, false) => StepReport::degraded(kind, summary),
        };
        for change in &self.changed {
            step = step.with_detail(format!("{}: {} -> {}", change.interface, change.from, change.to));
        }
        for failure in &self.failures {
            step = step.with_detail(failure.clone());
        }
        step
    }
}

/// Randomizes and restores link-layer addresses
pub struct MacManager {
    enabled: bool,
    map_path: PathBuf,
    link: Arc<dyn LinkControl>,
}

impl MacManager {
    pub fn new(enabled: bool, paths: &ShieldPaths, link: Arc<dyn LinkControl>) -> Self {
        Self {
            enabled,
            map_path: paths.mac_map_file(),
            link,
        }
    }

    /// The original map exists on disk
    pub fn is_active(&self) -> bool {
        self.map_path.exists()
    }

    pub fn original_map(&self) -> Result<Option<OriginalMacMap>> {
        load_original_map(&self.map_path)
    }

    /// Give every non-loopback interface with a readable address a fresh
    /// random one.
    pub fn randomize(&self) -> Result<MacReport> {
        if !self.enabled {
            return Ok(MacReport::noop("MAC randomization disabled"));
        }
        if let Some(existing) = self.original_map()? {
            if !existing.is_empty() {
                info!(
                    interfaces = existing.len(),
                    "MAC randomization already active, keeping recorded originals"
                );
                return Ok(MacReport::noop(format!(
                    "already randomized ({} original address(es) on record)",
                    existing.len()
                )));
            }
        }

        let mut originals = OriginalMacMap::new();
        for iface in inventory::scan(self.link.as_ref())? {
            match iface.mac {
                Some(mac) => {
                    originals.insert(iface.name, mac);
                }
                None => debug!(interface = %iface.name, "no readable address, skipping"),
            }
        }
        if originals.is_empty() {
            return Ok(MacReport::noop("no interfaces with a readable address"));
        }

        // Record first: a crash from here on is still restorable.
        persist_original_map(&self.map_path, &originals)?;

        let mut report = MacReport::default();
        let mut rng = OsRng;
        for (name, original) in &originals {
            let mut replacement = random_mac(&mut rng);
            while replacement == *original {
                replacement = random_mac(&mut rng);
            }
            match apply_address(self.link.as_ref(), name, replacement) {
                Ok(()) => {
                    info!(interface = %name, from = %original, to = %replacement, "MAC randomized");
                    report.changed.push(MacChange {
                        interface: name.clone(),
                        from: *original,
                        to: replacement,
                    });
                }
                Err(e) => {
                    warn!(interface = %name, %e, "MAC randomization failed");
                    report.failures.push(format!("{name}: {e}"));
                }
            }
        }
        Ok(report)
    }

    /// Put every recorded original back and consume the map.
    pub fn restore(&self) -> Result<MacReport> {
        let map = match self.original_map() {
            Ok(Some(map)) => map,
            Ok(None) => return Ok(MacReport::noop("no original addresses recorded")),
            Err(e) => {
                warn!(%e, path = %self.map_path.display(), "unreadable MAC map, discarding");
                remove_map(&self.map_path);
                return Err(e);
            }
        };

        let mut report = MacReport::default();
        for (name, original) in &map {
            let current = self.link.mac_address(name);
            match apply_address(self.link.as_ref(), name, *original) {
                Ok(()) => {
                    info!(interface = %name, mac = %original, "MAC restored");
                    report.changed.push(MacChange {
                        interface: name.clone(),
                        from: current.unwrap_or(*original),
                        to: *original,
                    });
                }
                Err(e) => {
                    warn!(interface = %name, %e, "MAC restore failed");
                    report.failures.push(format!("{name}: {e}"));
                }
            }
        }

        // Consumed even when some entries failed, so it is never reapplied stale.
        remove_map(&self.map_path);
        Ok(report)
    }
}

impl ShieldComponent for MacManager {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Mac
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn activate(&mut self) -> StepReport {
        match self.randomize() {
            Ok(report) => report.to_step("randomized"),
            Err(e) => StepReport::from_error(ComponentKind::Mac, &e),
        }
    }

    fn deactivate(&mut self) -> StepReport {
        match self.restore() {
            Ok(report) => report.to_step("restored"),
            Err(e) => StepReport::from_error(ComponentKind::Mac, &e),
        }
    }

    fn observed_active(&self) -> Option<bool> {
        Some(self.is_active())
    }
}

/// down -> address -> up; the link is brought back up even if the address
/// change is refused.
fn apply_address(link: &dyn LinkControl, name: &str, mac: MacAddr) -> Result<()> {
    link.set_down(name)?;
    if let Err(e) = link.set_address(name, mac) {
        if let Err(up_err) = link.set_up(name) {
            warn!(interface = %name, %up_err, "could not bring link back up");
        }
        return Err(e);
    }
    link.set_up(name)
}

/// Read the map; `None` when there is no file.
pub fn load_original_map(path: &std::path::Path) -> Result<Option<OriginalMacMap>> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let map: OriginalMacMap = serde_json::from_str(&content).map_err(|e| {
                ShieldError::Serialization(format!("{}: {e}", path.display()))
            })?;
            Ok(Some(map))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn persist_original_map(path: &std::path::Path, map: &OriginalMacMap) -> Result<()> {
    let json = serde_json::to_string_pretty(map)?;
    atomic_write(path, json.as_bytes())?;
    debug!(path = %path.display(), entries = map.len(), "original MAC map persisted");
    Ok(())
}

fn remove_map(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(%e, path = %path.display(), "could not remove MAC map");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn random_mac_bits() {
        let mut rng = StepRng::new(u64::MAX, 0);
        let mac = random_mac(&mut rng);
        assert_eq!(mac.octets()[0], 0xFE);
        assert!(mac.is_locally_administered());
        assert!(!mac.is_multicast());

        let mut rng = StepRng::new(0, 0);
        assert_eq!(random_mac(&mut rng).octets()[0], 0x02);
    }

    #[test]
    fn report_status_mapping() {
        let change = MacChange {
            interface: "eth0".into(),
            from: MacAddr([0x52, 0, 0, 0, 0, 1]),
            to: MacAddr([0x02, 0, 0, 0, 0, 2]),
        };
        let ok = MacReport {
            changed: vec![change.clone()],
            ..Default::default()
        };
        assert_eq!(ok.to_step("randomized").status, crate::component::StepStatus::Applied);

        let partial = MacReport {
            changed: vec![change],
            failures: vec!["wlan0: busy".into()],
            noop: None,
        };
        assert_eq!(partial.to_step("randomized").status, crate::component::StepStatus::Degraded);

        let none = MacReport {
            failures: vec!["wlan0: busy".into()],
            ..Default::default()
        };
        assert_eq!(none.to_step("randomized").status, crate::component::StepStatus::Failed);

        assert_eq!(
            MacReport::noop("disabled").to_step("randomized").status,
            crate::component::StepStatus::Skipped
        );
    }

    #[test]
    fn missing_map_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_original_map(&dir.path().join("absent.json")).unwrap().is_none());
    }

    #[test]
    fn corrupt_map_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.json");
        std::fs::write(&path, "{\"eth0\": \"nope\"}").unwrap();
        assert!(load_original_map(&path).is_err());
    }
}
