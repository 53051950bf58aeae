//! Resolver override with verbatim restoration.
//!
//! # Design
//! - **Backup first**: the resolver file is copied byte-for-byte before any
//!   write, and an existing backup is never overwritten
//! - **Atomic writes**: replacement goes through a temp file and rename()
//! - **Immutability**: `chattr +i` after writing so DHCP clients and
//!   NetworkManager cannot rewrite it; best-effort only
//! - **Symlinks**: a symlinked resolv.conf (systemd-resolved) is replaced by
//!   a regular file and the link is recreated on restore

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::component::{ComponentKind, ShieldComponent, StepReport};
use crate::config::DnsSettings;
use crate::error::Result;
use crate::host::{exec_warn, CommandRunner};
use crate::paths::{atomic_write, ShieldPaths};

/// Outcome of a secure/restore call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsReport {
    /// Non-fatal remarks (attribute tooling unavailable, ...)
    pub notes: Vec<String>,
    pub noop: Option<String>,
}

impl DnsReport {
    fn noop(reason: impl Into<String>) -> Self {
        Self {
            notes: Vec::new(),
            noop: Some(reason.into()),
        }
    }

    fn to_step(&self, summary: &str) -> StepReport {
        let mut step = match &self.noop {
            Some(reason) => StepReport::skipped(ComponentKind::Dns, reason.clone()),
            None => StepReport::applied(ComponentKind::Dns, summary),
        };
        for note in &self.notes {
            step = step.with_detail(note.clone());
        }
        step
    }
}

/// Render the replacement resolver file.
pub fn render_resolv_conf(settings: &DnsSettings) -> String {
    let mut content = String::from("# Generated by privshield\n");
    content.push_str("# Original configuration is backed up and restored on deactivate\n");
    let mut seen = Vec::new();
    for server in settings.servers() {
        if !seen.contains(&server) {
            content.push_str(&format!("nameserver {server}\n"));
            seen.push(server);
        }
    }
    content.push_str("options edns0 single-request-reopen timeout:2 attempts:2\n");
    content
}

/// Backs up, replaces and restores the resolver configuration
pub struct DnsManager {
    enabled: bool,
    settings: DnsSettings,
    resolv_conf: PathBuf,
    backup_path: PathBuf,
    link_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl DnsManager {
    pub fn new(
        enabled: bool,
        settings: DnsSettings,
        paths: &ShieldPaths,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            enabled,
            settings,
            resolv_conf: paths.resolv_conf().to_path_buf(),
            backup_path: paths.dns_backup_file(),
            link_path: paths.dns_link_file(),
            runner,
        }
    }

    /// A backup exists, so the override is in effect
    pub fn is_secured(&self) -> bool {
        self.backup_path.exists()
    }

    pub fn secure(&self) -> Result<DnsReport> {
        if !self.enabled {
            return Ok(DnsReport::noop("DNS protection disabled"));
        }
        if self.is_secured() {
            info!(backup = %self.backup_path.display(), "DNS backup already present, leaving it");
            return Ok(DnsReport::noop("already secured; existing backup kept"));
        }

        let mut report = DnsReport::default();
        let original = match std::fs::read(&self.resolv_conf) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                report
                    .notes
                    .push(format!("{} did not exist", self.resolv_conf.display()));
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        if is_symlink(&self.resolv_conf) {
            let target = std::fs::read_link(&self.resolv_conf)?;
            atomic_write(&self.link_path, target.to_string_lossy().as_bytes())?;
            report
                .notes
                .push(format!("resolver was a symlink to {}", target.display()));
        }
        atomic_write(&self.backup_path, &original)?;
        debug!(backup = %self.backup_path.display(), bytes = original.len(), "resolver backed up");

        self.set_immutable(false, &mut report);
        let content = render_resolv_conf(&self.settings);
        if let Err(e) = atomic_write(&self.resolv_conf, content.as_bytes()) {
            // Nothing was replaced; drop the backup so state matches the host.
            discard(&self.backup_path);
            discard(&self.link_path);
            return Err(e.into());
        }
        self.set_immutable(true, &mut report);

        info!(servers = ?self.settings.servers(), "DNS override applied");
        Ok(report)
    }

    /// Put the backed-up resolver back. The backup and link files are
    /// consumed even when the write-back fails, so a stale backup is never
    /// replayed by a later session; the write error is still returned.
    pub fn restore(&self) -> Result<DnsReport> {
        if !self.is_secured() {
            return Ok(DnsReport::noop("no DNS backup recorded"));
        }

        let mut report = DnsReport::default();
        self.set_immutable(false, &mut report);

        let link_target = match std::fs::read_to_string(&self.link_path) {
            Ok(target) if !target.trim().is_empty() => Some(PathBuf::from(target.trim())),
            _ => None,
        };

        let written = match &link_target {
            Some(target) => self.relink(target),
            None => std::fs::read(&self.backup_path)
                .and_then(|original| atomic_write(&self.resolv_conf, &original)),
        };

        discard(&self.backup_path);
        discard(&self.link_path);

        if let Err(e) = written {
            error!(%e, resolver = %self.resolv_conf.display(), "DNS restore failed, backup discarded");
            return Err(e.into());
        }
        if let Some(target) = link_target {
            report
                .notes
                .push(format!("symlink to {} recreated", target.display()));
        }
        info!("DNS configuration restored from backup");
        Ok(report)
    }

    fn relink(&self, target: &Path) -> std::io::Result<()> {
        remove_if_exists(&self.resolv_conf)?;
        std::os::unix::fs::symlink(target, &self.resolv_conf)
    }

    fn set_immutable(&self, immutable: bool, report: &mut DnsReport) {
        if is_symlink(&self.resolv_conf) || !self.resolv_conf.exists() {
            return;
        }
        let flag = if immutable { "+i" } else { "-i" };
        let path = self.resolv_conf.to_string_lossy();
        if !exec_warn(self.runner.as_ref(), "chattr", &[flag, &path]) {
            report
                .notes
                .push(format!("chattr {flag} failed; immutability attribute unchanged"));
        }
    }
}

impl ShieldComponent for DnsManager {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Dns
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn activate(&mut self) -> StepReport {
        match self.secure() {
            Ok(report) => report.to_step("resolver override applied"),
            Err(e) => StepReport::from_error(ComponentKind::Dns, &e),
        }
    }

    fn deactivate(&mut self) -> StepReport {
        match self.restore() {
            Ok(report) => report.to_step("resolver restored"),
            Err(e) => StepReport::from_error(ComponentKind::Dns, &e),
        }
    }

    fn observed_active(&self) -> Option<bool> {
        Some(self.is_secured())
    }
}

fn is_symlink(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Best-effort removal of a state file.
fn discard(path: &Path) {
    if let Err(e) = remove_if_exists(path) {
        warn!(%e, path = %path.display(), "could not remove DNS state file");
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
