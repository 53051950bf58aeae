//! Shield session orchestrator.
//!
//! Drives the components through activation and deactivation:
//!
//! ```text
//! activate:    mac -> dns -> tor -> i2p -> firewall   (then marker written)
//! deactivate:  firewall -> i2p -> tor -> dns -> mac   (then marker removed)
//! ```
//!
//! A failing step is counted and the sequence carries on. Session state is
//! persisted after every step, so `status` from another process, or recovery
//! after a crash, sees exactly what is in effect.
//!
//! A [`Shield`] that activated and is dropped before deactivating restores
//! the host from its `Drop` impl.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::component::{ComponentKind, ShieldComponent, StepReport, StepStatus};
use crate::config::ShieldSettings;
use crate::dns::DnsManager;
use crate::error::{Result, ShieldError};
use crate::firewall::{KillSwitch, KillSwitchPolicy};
use crate::host::Host;
use crate::inventory::{self, InterfaceDescriptor};
use crate::mac::{load_original_map, MacManager};
use crate::paths::ShieldPaths;
use crate::proxy::{I2pController, TorController};
use crate::session::{MarkerStatus, SessionPhase, SessionState, SessionStore};

/// Raised by a signal handler; checked between activation steps.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Activate,
    Deactivate,
}

/// Ordered step outcomes of one activation or deactivation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionReport {
    pub direction: Direction,
    pub steps: Vec<StepReport>,
    /// Remaining steps were skipped because shutdown was requested
    pub cancelled: bool,
    /// An orphaned session was rolled back before activating
    pub recovered_orphan: bool,
}

impl TransitionReport {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            steps: Vec::new(),
            cancelled: false,
            recovered_orphan: false,
        }
    }

    pub fn failures(&self) -> usize {
        self.steps.iter().filter(|s| s.is_failure()).count()
    }

    /// Degraded steps: warnings that do not count as failures
    pub fn warnings(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Degraded)
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.failures() == 0 && !self.cancelled
    }

    pub fn step(&self, kind: ComponentKind) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.component == kind)
    }

    /// Order the components ran in
    pub fn order(&self) -> Vec<ComponentKind> {
        self.steps.iter().map(|s| s.component).collect()
    }

    pub fn summary(&self) -> String {
        let verb = match self.direction {
            Direction::Activate => "activated",
            Direction::Deactivate => "deactivated",
        };
        if self.cancelled {
            return format!(
                "activation cancelled after {} step(s), {} issue(s)",
                self.steps.len(),
                self.failures()
            );
        }
        match (self.failures(), self.warnings()) {
            (0, 0) => format!("{verb} successfully"),
            (0, w) => format!("{verb} successfully ({w} warning(s))"),
            (n, _) => format!("{verb} with {n} issue(s)"),
        }
    }
}

/// Point-in-time view for `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub orphaned: bool,
    pub pid: Option<u32>,
    pub phase: SessionPhase,
    pub activated_at: Option<DateTime<Utc>>,
    pub primary_proxy_listening: bool,
    pub secondary_proxy_listening: bool,
    pub mac_randomized: bool,
    pub dns_secured: bool,
    pub kill_switch: bool,
    pub interfaces: Vec<InterfaceDescriptor>,
}

pub struct Shield {
    settings: ShieldSettings,
    paths: ShieldPaths,
    host: Host,
    store: SessionStore,
    state: SessionState,
    components: Vec<Box<dyn ShieldComponent>>,
    /// Set once this instance has mutated the host
    armed: bool,
}

impl Shield {
    /// Wire the standard components against `host`.
    pub fn new(settings: ShieldSettings, paths: ShieldPaths, host: Host) -> Self {
        let general = &settings.general;
        let components: Vec<Box<dyn ShieldComponent>> = vec![
            Box::new(MacManager::new(
                general.mac_randomization,
                &paths,
                host.link.clone(),
            )),
            Box::new(DnsManager::new(
                general.dns_protection,
                settings.dns.clone(),
                &paths,
                host.runner.clone(),
            )),
            Box::new(TorController::new(&settings, &paths, &host)),
            Box::new(I2pController::new(&settings, &host)),
            Box::new(KillSwitch::new(
                general.kill_switch,
                KillSwitchPolicy::from_settings(&settings.tor),
                host.firewall.clone(),
            )),
        ];
        Self::with_components(settings, paths, host, components)
    }

    /// Use caller-supplied components. They run in activation order
    /// regardless of the order given.
    pub fn with_components(
        settings: ShieldSettings,
        paths: ShieldPaths,
        host: Host,
        mut components: Vec<Box<dyn ShieldComponent>>,
    ) -> Self {
        components.sort_by_key(|c| c.kind());
        let store = SessionStore::new(&paths);
        let state = store.load();
        Self {
            settings,
            paths,
            host,
            store,
            state,
            components,
            armed: false,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn settings(&self) -> &ShieldSettings {
        &self.settings
    }

    pub fn marker(&self) -> MarkerStatus {
        self.store.marker_status(self.host.processes.as_ref())
    }

    /// Apply every component in order. Fails only on a precondition (a live
    /// manager already owns the session, or the state root is unusable);
    /// step failures are in the report.
    pub fn activate(&mut self, shutdown: &ShutdownFlag) -> Result<TransitionReport> {
        let recovered_orphan = self.recover_if_needed()?;
        self.paths.ensure_root()?;

        let mut report = TransitionReport::new(Direction::Activate);
        report.recovered_orphan = recovered_orphan;

        self.state.phase = SessionPhase::Transitioning;
        self.state.pid = Some(std::process::id());
        self.store.save(&self.state)?;
        self.armed = true;
        info!(pid = std::process::id(), "activating shield");

        for idx in 0..self.components.len() {
            if shutdown.is_raised() {
                warn!(completed = report.steps.len(), "shutdown requested, skipping remaining steps");
                report.cancelled = true;
                break;
            }
            let component = &mut self.components[idx];
            let kind = component.kind();
            let step = if component.enabled() {
                component.activate()
            } else {
                StepReport::skipped(kind, "disabled in configuration")
            };
            log_step(&step);

            let in_effect = component
                .observed_active()
                .unwrap_or(step.status == StepStatus::Applied);
            self.state.flags.set(kind, in_effect);
            self.persist();
            report.steps.push(step);
        }

        self.state.phase = SessionPhase::Active;
        self.state.activated_at = Some(Utc::now());
        if let Err(e) = self.store.write_marker(std::process::id()) {
            error!(%e, "could not write session marker");
        }
        self.persist();

        info!(failures = report.failures(), "{}", report.summary());
        Ok(report)
    }

    /// Reverse every component, newest first. Never fails: each step is
    /// independent and the marker is removed regardless.
    pub fn deactivate(&mut self) -> TransitionReport {
        let mut report = TransitionReport::new(Direction::Deactivate);
        info!("deactivating shield");
        self.state.phase = SessionPhase::Transitioning;
        self.persist();

        for idx in (0..self.components.len()).rev() {
            let component = &mut self.components[idx];
            let kind = component.kind();
            let was_active = self.state.flags.get(kind);
            let step = if !component.enabled() && !was_active {
                StepReport::skipped(kind, "disabled and not applied")
            } else {
                component.deactivate()
            };
            log_step(&step);

            let in_effect = component
                .observed_active()
                .unwrap_or(was_active && step.is_failure());
            self.state.flags.set(kind, in_effect);
            self.persist();
            report.steps.push(step);
        }

        if let Err(e) = self.store.remove_marker() {
            error!(%e, "could not remove session marker");
        }
        self.state.phase = SessionPhase::Inactive;
        self.state.pid = None;
        self.state.activated_at = None;
        self.persist();
        self.armed = false;

        info!(failures = report.failures(), "{}", report.summary());
        report
    }

    /// Deactivate, wait the configured delay, activate again.
    pub fn restart(&mut self, shutdown: &ShutdownFlag) -> Result<(TransitionReport, TransitionReport)> {
        let down = self.deactivate();
        self.host.sleeper.sleep(self.settings.performance.restart_delay);
        if shutdown.is_raised() {
            let mut up = TransitionReport::new(Direction::Activate);
            up.cancelled = true;
            return Ok((down, up));
        }
        let up = self.activate(shutdown)?;
        Ok((down, up))
    }

    /// Roll back an orphaned or half-finished session. Returns `None` when
    /// there is nothing to repair.
    pub fn repair(&mut self) -> Result<Option<TransitionReport>> {
        match self.marker() {
            MarkerStatus::Live(pid) => Err(ShieldError::AlreadyActive(pid)),
            MarkerStatus::Orphaned(pid) => {
                warn!(pid = ?pid, "orphaned session marker, restoring host");
                Ok(Some(self.deactivate()))
            }
            MarkerStatus::Absent if self.needs_recovery() => {
                warn!(phase = ?self.state.phase, flags = ?self.state.flags, "leftover host mutations, restoring");
                Ok(Some(self.deactivate()))
            }
            MarkerStatus::Absent => Ok(None),
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        let state = self.store.load();
        let marker = self.marker();
        let originals = match load_original_map(&self.paths.mac_map_file()) {
            Ok(map) => map.unwrap_or_default(),
            Err(e) => {
                warn!(%e, "unreadable MAC map");
                Default::default()
            }
        };
        let interfaces = match inventory::scan(self.host.link.as_ref()) {
            Ok(found) => found
                .into_iter()
                .map(|iface| InterfaceDescriptor {
                    randomized: originals.contains_key(&iface.name),
                    name: iface.name,
                    mac: iface.mac,
                })
                .collect(),
            Err(e) => {
                warn!(%e, "cannot enumerate interfaces");
                Vec::new()
            }
        };

        StatusSnapshot {
            running: matches!(marker, MarkerStatus::Live(_)),
            orphaned: matches!(marker, MarkerStatus::Orphaned(_)),
            pid: marker.pid(),
            phase: state.phase,
            activated_at: state.activated_at,
            primary_proxy_listening: self.host.ports.is_listening(self.settings.tor.socks_port),
            secondary_proxy_listening: self
                .host
                .ports
                .is_listening(self.settings.i2p.http_proxy_port),
            mac_randomized: state.flags.mac,
            dns_secured: state.flags.dns,
            kill_switch: state.flags.firewall,
            interfaces,
        }
    }

    fn needs_recovery(&self) -> bool {
        self.state.phase != SessionPhase::Inactive || self.state.flags.any()
    }

    fn recover_if_needed(&mut self) -> Result<bool> {
        match self.repair()? {
            Some(recovery) => {
                info!(failures = recovery.failures(), "previous session rolled back");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.state) {
            warn!(%e, "could not persist session state");
        }
    }
}

impl Drop for Shield {
    fn drop(&mut self) {
        if self.armed && self.state.phase != SessionPhase::Inactive {
            error!("shield dropped while active, restoring host");
            let report = self.deactivate();
            debug!(summary = %report.summary(), "emergency deactivation finished");
        }
    }
}

fn log_step(step: &StepReport) {
    let detail = step.details.join("; ");
    match step.status {
        StepStatus::Applied | StepStatus::Skipped => {
            info!(component = %step.component, status = %step.status, %detail, "step finished")
        }
        StepStatus::Degraded => {
            warn!(component = %step.component, status = %step.status, %detail, "step degraded")
        }
        StepStatus::Failed => {
            error!(component = %step.component, status = %step.status, %detail, "step failed")
        }
    }
}
