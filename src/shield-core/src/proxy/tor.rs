//! Primary proxy (Tor) controller.
//!
//! Tor is launched directly with a generated torrc so the ports, bridges and
//! tuning always match the configuration. When the direct launch fails, or the
//! launched process never opens its SOCKS port, the system service is started
//! instead. Either way the SOCKS port has to come up within the readiness
//! budget.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::component::{ComponentKind, ShieldComponent, StepReport};
use crate::config::ShieldSettings;
use crate::error::{Result, ShieldError};
use crate::host::{is_root, Host, PortCheck, ProcessControl, ServiceManager, Sleeper};
use crate::paths::{atomic_write, ShieldPaths};

use super::torrc::{render_torrc, TorrcOptions};
use super::wait_until_listening;

/// How the running Tor instance came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorLaunch {
    /// A tracked instance was already up
    AlreadyRunning(u32),
    /// Launched by us with the generated torrc
    Direct(u32),
    /// System service started by the service manager
    Service,
}

/// Result of [`TorController::stop_primary`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TorStop {
    pub terminated: Option<u32>,
    pub notes: Vec<String>,
}

pub struct TorController {
    settings: ShieldSettings,
    data_dir: PathBuf,
    torrc_path: PathBuf,
    pid_path: PathBuf,
    cookie_path: PathBuf,
    processes: Arc<dyn ProcessControl>,
    services: Arc<dyn ServiceManager>,
    ports: Arc<dyn PortCheck>,
    sleeper: Arc<dyn Sleeper>,
}

impl TorController {
    pub fn new(settings: &ShieldSettings, paths: &ShieldPaths, host: &Host) -> Self {
        Self {
            settings: settings.clone(),
            data_dir: paths.tor_data_dir(),
            torrc_path: paths.torrc_file(),
            pid_path: paths.tor_pid_file(),
            cookie_path: paths.tor_cookie_file(),
            processes: host.processes.clone(),
            services: host.services.clone(),
            ports: host.ports.clone(),
            sleeper: host.sleeper.clone(),
        }
    }

    /// Pid from the pid file, if one is recorded
    pub fn tracked_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.pid_path)
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
    }

    pub fn is_listening(&self) -> bool {
        self.ports.is_listening(self.settings.tor.socks_port)
    }

    pub fn start_primary(&self) -> Result<TorLaunch> {
        let socks_port = self.settings.tor.socks_port;
        if let Some(pid) = self.tracked_pid() {
            if self.processes.is_alive(pid) && self.is_listening() {
                info!(pid, socks_port, "tor already running");
                return Ok(TorLaunch::AlreadyRunning(pid));
            }
            debug!(pid, "stale tor pid file");
            self.forget_pid();
        }

        match self.launch_direct() {
            Ok(pid) => {
                if self.await_socks() {
                    info!(pid, socks_port, "tor is ready");
                    return Ok(TorLaunch::Direct(pid));
                }
                warn!(pid, service = %self.settings.tor.service, "launched tor never became ready, starting system service");
                self.processes.terminate(pid);
                self.forget_pid();
            }
            Err(e) => {
                warn!(%e, service = %self.settings.tor.service, "direct tor launch failed, starting system service");
            }
        }

        self.services.start(&self.settings.tor.service)?;
        if !self.await_socks() {
            return Err(ShieldError::NotReady {
                service: "tor".into(),
                port: socks_port,
                attempts: self.settings.performance.readiness_attempts.max(1),
            });
        }
        info!(socks_port, "tor service is ready");
        Ok(TorLaunch::Service)
    }

    /// One readiness budget on the SOCKS port
    fn await_socks(&self) -> bool {
        let perf = &self.settings.performance;
        wait_until_listening(
            self.ports.as_ref(),
            self.sleeper.as_ref(),
            self.settings.tor.socks_port,
            perf.readiness_attempts,
            perf.readiness_interval,
        )
    }

    /// Stop the tracked instance and the system service. Both are attempted
    /// every time.
    pub fn stop_primary(&self) -> Result<TorStop> {
        let mut stop = TorStop::default();
        if let Some(pid) = self.tracked_pid() {
            if self.processes.is_alive(pid) {
                if !self.processes.terminate(pid) && self.processes.is_alive(pid) {
                    return Err(ShieldError::Command {
                        program: "kill".into(),
                        args: format!("-TERM {pid}"),
                        detail: "tor process did not accept SIGTERM".into(),
                    });
                }
                info!(pid, "tor terminated");
                stop.terminated = Some(pid);
            } else {
                stop.notes.push(format!("tracked pid {pid} already gone"));
            }
            self.forget_pid();
        }

        if let Err(e) = self.services.stop(&self.settings.tor.service) {
            debug!(%e, "tor service stop failed");
            stop.notes.push(format!("service stop: {e}"));
        }
        Ok(stop)
    }

    fn launch_direct(&self) -> Result<u32> {
        let run_as = self.prepare_data_dir()?;
        let torrc = render_torrc(
            &self.settings,
            &TorrcOptions {
                data_dir: &self.data_dir,
                cookie_file: &self.cookie_path,
                run_as: run_as.as_deref(),
            },
        );
        atomic_write(&self.torrc_path, torrc.as_bytes())?;

        let torrc_arg = self.torrc_path.to_string_lossy();
        let pid = self
            .processes
            .spawn(&self.settings.tor.binary, &["-f", &torrc_arg])?;
        atomic_write(&self.pid_path, format!("{pid}\n").as_bytes())?;
        info!(pid, torrc = %self.torrc_path.display(), "tor launched");
        Ok(pid)
    }

    /// Create the private data directory. When running as root it is handed
    /// to the proxy user, which is returned so the torrc can drop to it.
    fn prepare_data_dir(&self) -> Result<Option<String>> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::set_permissions(&self.data_dir, std::fs::Permissions::from_mode(0o700))?;
        if !is_root() {
            return Ok(None);
        }

        let user = &self.settings.tor.user;
        if let Some(blocked) = untraversable_ancestor(&self.data_dir) {
            warn!(
                user = %user,
                dir = %blocked.display(),
                "proxy user cannot reach the data dir, tor keeps running as root"
            );
            return Ok(None);
        }
        match nix::unistd::User::from_name(user) {
            Ok(Some(account)) => {
                nix::unistd::chown(&self.data_dir, Some(account.uid), Some(account.gid))
                    .map_err(std::io::Error::from)?;
                debug!(user = %user, dir = %self.data_dir.display(), "data dir handed to proxy user");
                Ok(Some(user.clone()))
            }
            Ok(None) => {
                warn!(user = %user, "proxy user does not exist, tor keeps running as root");
                Ok(None)
            }
            Err(e) => {
                warn!(%e, user = %user, "proxy user lookup failed");
                Ok(None)
            }
        }
    }

    fn forget_pid(&self) {
        if let Err(e) = std::fs::remove_file(&self.pid_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(%e, "could not remove tor pid file");
            }
        }
    }
}

/// First ancestor of `dir` that other users cannot search (no `o+x`).
pub(crate) fn untraversable_ancestor(dir: &Path) -> Option<PathBuf> {
    dir.ancestors().skip(1).find_map(|ancestor| {
        let mode = std::fs::metadata(ancestor).ok()?.permissions().mode();
        (mode & 0o001 == 0).then(|| ancestor.to_path_buf())
    })
}

impl ShieldComponent for TorController {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Tor
    }

    fn enabled(&self) -> bool {
        true
    }

    fn activate(&mut self) -> StepReport {
        let port = self.settings.tor.socks_port;
        match self.start_primary() {
            Ok(TorLaunch::AlreadyRunning(pid)) => StepReport::applied(
                ComponentKind::Tor,
                format!("already running (pid {pid}), SOCKS on {port}"),
            ),
            Ok(TorLaunch::Direct(pid)) => StepReport::applied(
                ComponentKind::Tor,
                format!("launched (pid {pid}), SOCKS on {port}"),
            ),
            Ok(TorLaunch::Service) => StepReport::applied(
                ComponentKind::Tor,
                format!("system service started, SOCKS on {port}"),
            ),
            Err(e) => StepReport::from_error(ComponentKind::Tor, &e),
        }
    }

    fn deactivate(&mut self) -> StepReport {
        match self.stop_primary() {
            Ok(stop) => {
                let summary = match stop.terminated {
                    Some(pid) => format!("stopped (pid {pid})"),
                    None => "stopped".to_string(),
                };
                stop.notes
                    .into_iter()
                    .fold(StepReport::applied(ComponentKind::Tor, summary), |step, note| {
                        step.with_detail(note)
                    })
            }
            Err(e) => StepReport::from_error(ComponentKind::Tor, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_ancestor_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        let data = home.join(".config").join("privshield").join("tor");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::set_permissions(&home, std::fs::Permissions::from_mode(0o700)).unwrap();

        assert_eq!(untraversable_ancestor(&data), Some(home.clone()));

        std::fs::set_permissions(&home, std::fs::Permissions::from_mode(0o755)).unwrap();
        let open = untraversable_ancestor(&data);
        assert!(open.map_or(true, |p| !p.starts_with(&home)));
    }
}
