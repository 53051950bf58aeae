//! Host collaborators.
//!
//! Everything that touches the live system goes through one of these traits:
//! running a command, the service manager, daemon processes, TCP port checks
//! and sleeping. Components hold them as `Arc<dyn ...>` so tests can swap in
//! in-memory doubles and so the readiness wait never needs real time.
//!
//! All commands are built from argument arrays, never from formatted shell
//! strings.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Result, ShieldError};
use crate::firewall::{FirewallBackend, Iptables};
use crate::inventory::{LinkControl, SysfsLink};

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs to completion.
pub trait CommandRunner: Send + Sync {
    /// `Err` only when the program could not be started at all.
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `std::process::Command`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        debug!(cmd = %program, args = ?args, "executing");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a command and return an error unless it started and exited zero.
pub fn exec_require(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> Result<()> {
    let command_error = |detail: String| ShieldError::Command {
        program: program.to_string(),
        args: args.join(" "),
        detail,
    };
    let output = runner
        .run(program, args)
        .map_err(|e| command_error(e.to_string()))?;
    if !output.success {
        let stderr = output.stderr.trim();
        debug!(cmd = %program, stderr = %stderr, "command failed");
        return Err(command_error(if stderr.is_empty() {
            "exited with non-zero status".to_string()
        } else {
            stderr.to_string()
        }));
    }
    Ok(())
}

/// Run a command, only logging a warning on failure.
pub fn exec_warn(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> bool {
    match exec_require(runner, program, args) {
        Ok(()) => true,
        Err(e) => {
            warn!(%e, cmd = %program, "command failed");
            false
        }
    }
}

/// Host service manager (systemd, sysvinit, ...)
pub trait ServiceManager: Send + Sync {
    fn start(&self, service: &str) -> Result<()>;
    fn stop(&self, service: &str) -> Result<()>;
}

/// `systemctl`, falling back to `service` when systemd is absent
pub struct Systemctl {
    runner: Arc<dyn CommandRunner>,
}

impl Systemctl {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn control(&self, service: &str, action: &str) -> Result<()> {
        match exec_require(self.runner.as_ref(), "systemctl", &[action, service]) {
            Ok(()) => Ok(()),
            Err(systemctl_err) => {
                debug!(%systemctl_err, service, "systemctl failed, trying service(8)");
                exec_require(self.runner.as_ref(), "service", &[service, action])
                    .map_err(|_| systemctl_err)
            }
        }
    }
}

impl ServiceManager for Systemctl {
    fn start(&self, service: &str) -> Result<()> {
        self.control(service, "start")
    }

    fn stop(&self, service: &str) -> Result<()> {
        self.control(service, "stop")
    }
}

/// Launches and terminates daemon processes.
pub trait ProcessControl: Send + Sync {
    /// Start `program` in the background and return its pid.
    fn spawn(&self, program: &str, args: &[&str]) -> Result<u32>;
    /// Ask `pid` to exit. Returns whether a signal was delivered.
    fn terminate(&self, pid: u32) -> bool;
    fn is_alive(&self, pid: u32) -> bool;
}

/// Real processes; children are kept so they can be reaped after SIGTERM.
#[derive(Default)]
pub struct SystemProcesses {
    children: Mutex<HashMap<u32, Child>>,
}

impl SystemProcesses {
    fn resolve(program: &str) -> Result<PathBuf> {
        which::which(program).map_err(|e| ShieldError::Command {
            program: program.to_string(),
            args: String::new(),
            detail: format!("not found in PATH: {e}"),
        })
    }

    fn reap(&self, pid: u32) {
        let Ok(mut children) = self.children.lock() else {
            return;
        };
        if let Some(mut child) = children.remove(&pid) {
            for _ in 0..50 {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(pid, exit_code = ?status.code(), "daemon exited");
                        return;
                    }
                    Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                    Err(e) => {
                        warn!(%e, pid, "error waiting for daemon");
                        return;
                    }
                }
            }
            warn!(pid, "daemon did not exit after SIGTERM, killing");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl ProcessControl for SystemProcesses {
    fn spawn(&self, program: &str, args: &[&str]) -> Result<u32> {
        let binary = Self::resolve(program)?;
        let child = Command::new(&binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ShieldError::Command {
                program: binary.display().to_string(),
                args: args.join(" "),
                detail: e.to_string(),
            })?;
        let pid = child.id();
        if let Ok(mut children) = self.children.lock() {
            children.insert(pid, child);
        }
        Ok(pid)
    }

    fn terminate(&self, pid: u32) -> bool {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let delivered = match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                debug!(%e, pid, "SIGTERM not delivered");
                false
            }
        };
        self.reap(pid);
        delivered
    }

    fn is_alive(&self, pid: u32) -> bool {
        process_exists(pid)
    }
}

/// Whether `pid` names a live process (signal 0).
pub fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match signal::kill(Pid::from_raw(pid as i32), None::<Signal>) {
        Ok(()) => true,
        // exists, owned by someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Local TCP listener check.
pub trait PortCheck: Send + Sync {
    fn is_listening(&self, port: u16) -> bool;
}

/// Connects to `127.0.0.1:port` with a short timeout
#[derive(Debug, Clone, Copy)]
pub struct TcpCheck {
    pub timeout: Duration,
}

impl Default for TcpCheck {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
        }
    }
}

impl PortCheck for TcpCheck {
    fn is_listening(&self, port: u16) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        TcpStream::connect_timeout(&addr, self.timeout).is_ok()
    }
}

/// Blocking sleep, injectable so bounded waits are testable.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Check if running as root
pub fn is_root() -> bool {
    // SAFETY: geteuid() takes no arguments, cannot fail and has no side effects.
    unsafe { libc::geteuid() == 0 }
}

/// Every host collaborator the components need, bundled for wiring.
#[derive(Clone)]
pub struct Host {
    pub runner: Arc<dyn CommandRunner>,
    pub link: Arc<dyn LinkControl>,
    pub firewall: Arc<dyn FirewallBackend>,
    pub services: Arc<dyn ServiceManager>,
    pub processes: Arc<dyn ProcessControl>,
    pub ports: Arc<dyn PortCheck>,
    pub sleeper: Arc<dyn Sleeper>,
}

impl Host {
    /// Collaborators backed by the live system.
    pub fn system() -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        Self {
            link: Arc::new(SysfsLink::new(runner.clone())),
            firewall: Arc::new(Iptables::new(runner.clone())),
            services: Arc::new(Systemctl::new(runner.clone())),
            processes: Arc::new(SystemProcesses::default()),
            ports: Arc::new(TcpCheck::default()),
            sleeper: Arc::new(ThreadSleeper),
            runner,
        }
    }
}
