//! In-memory host doubles shared by the integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shield_core::component::{ComponentKind, ShieldComponent, StepReport, StepStatus};
use shield_core::error::{Result, ShieldError};
use shield_core::firewall::{Chain, FirewallBackend, FirewallRule, Policy};
use shield_core::host::{
    CommandOutput, CommandRunner, Host, PortCheck, ProcessControl, ServiceManager, Sleeper,
};
use shield_core::inventory::{LinkControl, MacAddr};
use shield_core::ShieldPaths;

pub fn mac(s: &str) -> MacAddr {
    s.parse().unwrap()
}

fn command_failed(program: &str, args: String, detail: &str) -> ShieldError {
    ShieldError::Command {
        program: program.into(),
        args,
        detail: detail.into(),
    }
}

/// Links held in memory; every write is appended to `trace`
#[derive(Default)]
pub struct FakeLink {
    pub addresses: Mutex<BTreeMap<String, Option<MacAddr>>>,
    pub loopback: Mutex<HashSet<String>>,
    /// Interfaces whose address change is refused
    pub refuse: Mutex<HashSet<String>>,
    pub trace: Mutex<Vec<String>>,
}

impl FakeLink {
    pub fn with(interfaces: &[(&str, Option<&str>)]) -> Self {
        let link = Self::default();
        link.loopback.lock().unwrap().insert("lo".into());
        let mut addresses = link.addresses.lock().unwrap();
        addresses.insert("lo".into(), Some(mac("00:00:00:00:00:00")));
        for (name, addr) in interfaces {
            addresses.insert(name.to_string(), addr.map(mac));
        }
        drop(addresses);
        link
    }

    pub fn address(&self, name: &str) -> Option<MacAddr> {
        self.addresses.lock().unwrap().get(name).copied().flatten()
    }

    pub fn refuse(&self, name: &str) {
        self.refuse.lock().unwrap().insert(name.into());
    }

    pub fn trace(&self) -> Vec<String> {
        self.trace.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.trace.lock().unwrap().push(entry);
    }
}

impl LinkControl for FakeLink {
    fn interfaces(&self) -> Result<Vec<String>> {
        Ok(self.addresses.lock().unwrap().keys().cloned().collect())
    }

    fn is_loopback(&self, name: &str) -> bool {
        self.loopback.lock().unwrap().contains(name)
    }

    fn mac_address(&self, name: &str) -> Option<MacAddr> {
        self.address(name)
    }

    fn set_down(&self, name: &str) -> Result<()> {
        self.record(format!("{name} down"));
        Ok(())
    }

    fn set_address(&self, name: &str, mac: MacAddr) -> Result<()> {
        self.record(format!("{name} address {mac}"));
        if self.refuse.lock().unwrap().contains(name) {
            return Err(command_failed("ip", format!("link set dev {name} address {mac}"), "Device or resource busy"));
        }
        self.addresses
            .lock()
            .unwrap()
            .insert(name.to_string(), Some(mac));
        Ok(())
    }

    fn set_up(&self, name: &str) -> Result<()> {
        self.record(format!("{name} up"));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FirewallTable {
    pub rules: Vec<FirewallRule>,
    pub policies: HashMap<Chain, Policy>,
    pub flushes: usize,
}

/// Rule table in memory; optionally refuses appends past a limit
#[derive(Default)]
pub struct MemoryFirewall {
    pub table: Mutex<FirewallTable>,
    pub fail_after: Mutex<Option<usize>>,
}

impl MemoryFirewall {
    pub fn failing_after(appends: usize) -> Self {
        let fw = Self::default();
        *fw.fail_after.lock().unwrap() = Some(appends);
        fw
    }

    pub fn rules(&self) -> Vec<FirewallRule> {
        self.table.lock().unwrap().rules.clone()
    }

    pub fn policy(&self, chain: Chain) -> Policy {
        self.table
            .lock()
            .unwrap()
            .policies
            .get(&chain)
            .copied()
            .unwrap_or(Policy::Accept)
    }

    pub fn flushes(&self) -> usize {
        self.table.lock().unwrap().flushes
    }

    /// Empty table with every default policy ACCEPT
    pub fn is_open(&self) -> bool {
        self.rules().is_empty() && Chain::BUILTIN.iter().all(|c| self.policy(*c) == Policy::Accept)
    }
}

impl FirewallBackend for MemoryFirewall {
    fn flush(&self) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        table.rules.clear();
        table.flushes += 1;
        Ok(())
    }

    fn set_policy(&self, chain: Chain, policy: Policy) -> Result<()> {
        self.table.lock().unwrap().policies.insert(chain, policy);
        Ok(())
    }

    fn append(&self, rule: &FirewallRule) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if table.rules.len() >= limit {
                return Err(ShieldError::Firewall(format!("rejected: {rule}")));
            }
        }
        table.rules.push(rule.clone());
        Ok(())
    }
}

/// Records `start <svc>` / `stop <svc>`
#[derive(Default)]
pub struct FakeServices {
    pub calls: Mutex<Vec<String>>,
    pub failing: Mutex<HashSet<String>>,
}

impl FakeServices {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail(&self, service: &str) {
        self.failing.lock().unwrap().insert(service.into());
    }

    fn control(&self, action: &str, service: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("{action} {service}"));
        if self.failing.lock().unwrap().contains(service) {
            return Err(command_failed("systemctl", format!("{action} {service}"), "unit not found"));
        }
        Ok(())
    }
}

impl ServiceManager for FakeServices {
    fn start(&self, service: &str) -> Result<()> {
        self.control("start", service)
    }

    fn stop(&self, service: &str) -> Result<()> {
        self.control("stop", service)
    }
}

/// Fake process table. The test process itself always counts as alive.
pub struct FakeProcesses {
    next_pid: AtomicU32,
    pub alive: Mutex<HashSet<u32>>,
    pub spawned: Mutex<Vec<String>>,
    pub terminated: Mutex<Vec<u32>>,
    pub refuse_spawn: Mutex<bool>,
}

impl Default for FakeProcesses {
    fn default() -> Self {
        let alive = HashSet::from([std::process::id()]);
        Self {
            next_pid: AtomicU32::new(7000),
            alive: Mutex::new(alive),
            spawned: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
            refuse_spawn: Mutex::new(false),
        }
    }
}

impl FakeProcesses {
    pub fn set_alive(&self, pid: u32) {
        self.alive.lock().unwrap().insert(pid);
    }

    pub fn refuse_spawn(&self) {
        *self.refuse_spawn.lock().unwrap() = true;
    }

    pub fn spawned(&self) -> Vec<String> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().unwrap().clone()
    }
}

impl ProcessControl for FakeProcesses {
    fn spawn(&self, program: &str, args: &[&str]) -> Result<u32> {
        if *self.refuse_spawn.lock().unwrap() {
            return Err(command_failed(program, args.join(" "), "not found in PATH"));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.spawned
            .lock()
            .unwrap()
            .push(format!("{program} {}", args.join(" ")));
        self.alive.lock().unwrap().insert(pid);
        Ok(pid)
    }

    fn terminate(&self, pid: u32) -> bool {
        self.terminated.lock().unwrap().push(pid);
        self.alive.lock().unwrap().remove(&pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }
}

/// Ports listed here answer checks
#[derive(Default)]
pub struct FakePorts {
    pub listening: Mutex<HashSet<u16>>,
    /// port -> number of checks (of any port) before it starts answering
    pub delayed: Mutex<HashMap<u16, u32>>,
    pub checks: AtomicU32,
}

impl FakePorts {
    pub fn listen(&self, port: u16) {
        self.listening.lock().unwrap().insert(port);
    }

    /// `port` answers from check number `after + 1` on.
    pub fn listen_after(&self, port: u16, after: u32) {
        self.delayed.lock().unwrap().insert(port, after);
    }

    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }
}

impl PortCheck for FakePorts {
    fn is_listening(&self, port: u16) -> bool {
        let seen = self.checks.fetch_add(1, Ordering::SeqCst);
        if let Some(after) = self.delayed.lock().unwrap().get(&port) {
            if seen >= *after {
                return true;
            }
        }
        self.listening.lock().unwrap().contains(&port)
    }
}

/// Never sleeps; remembers what it was asked for
#[derive(Default)]
pub struct NoSleep {
    pub naps: Mutex<Vec<Duration>>,
}

impl NoSleep {
    pub fn naps(&self) -> Vec<Duration> {
        self.naps.lock().unwrap().clone()
    }
}

impl Sleeper for NoSleep {
    fn sleep(&self, duration: Duration) {
        self.naps.lock().unwrap().push(duration);
    }
}

/// Succeeds for every program except the ones marked missing
#[derive(Default)]
pub struct RecordingRunner {
    pub commands: Mutex<Vec<String>>,
    pub missing: Mutex<HashSet<String>>,
}

impl RecordingRunner {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn mark_missing(&self, program: &str) {
        self.missing.lock().unwrap().insert(program.into());
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        if self.missing.lock().unwrap().contains(program) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "No such file or directory"));
        }
        self.commands
            .lock()
            .unwrap()
            .push(format!("{program} {}", args.join(" ")));
        Ok(CommandOutput {
            success: true,
            ..Default::default()
        })
    }
}

/// Every fake, kept typed so tests can inspect them after wiring a [`Host`]
#[derive(Clone)]
pub struct Fakes {
    pub link: Arc<FakeLink>,
    pub firewall: Arc<MemoryFirewall>,
    pub services: Arc<FakeServices>,
    pub processes: Arc<FakeProcesses>,
    pub ports: Arc<FakePorts>,
    pub sleeper: Arc<NoSleep>,
    pub runner: Arc<RecordingRunner>,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            link: Arc::new(FakeLink::with(&[
                ("eth0", Some("52:54:00:12:34:56")),
                ("wlan0", Some("a4:5e:60:aa:bb:cc")),
            ])),
            firewall: Arc::new(MemoryFirewall::default()),
            services: Arc::new(FakeServices::default()),
            processes: Arc::new(FakeProcesses::default()),
            ports: Arc::new(FakePorts::default()),
            sleeper: Arc::new(NoSleep::default()),
            runner: Arc::new(RecordingRunner::default()),
        }
    }

    pub fn host(&self) -> Host {
        Host {
            runner: self.runner.clone(),
            link: self.link.clone(),
            firewall: self.firewall.clone(),
            services: self.services.clone(),
            processes: self.processes.clone(),
            ports: self.ports.clone(),
            sleeper: self.sleeper.clone(),
        }
    }
}

/// State root plus a private resolver file
pub struct Sandbox {
    pub dir: tempfile::TempDir,
    pub paths: ShieldPaths,
    pub resolv_conf: PathBuf,
}

pub const ORIGINAL_RESOLV: &str =
    "# managed by NetworkManager\nnameserver 192.168.1.1\nsearch lan\n\toptions  rotate \n";

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let resolv_conf = dir.path().join("etc").join("resolv.conf");
        std::fs::create_dir_all(resolv_conf.parent().unwrap()).unwrap();
        std::fs::write(&resolv_conf, ORIGINAL_RESOLV).unwrap();
        let paths = ShieldPaths::new(dir.path().join("state")).with_resolv_conf(&resolv_conf);
        Self {
            dir,
            paths,
            resolv_conf,
        }
    }
}

/// Component that only writes `"<verb>:<kind>"` to a shared journal
pub struct Journaled {
    pub kind: ComponentKind,
    pub enabled: bool,
    pub activate_status: StepStatus,
    pub journal: Arc<Mutex<Vec<String>>>,
}

impl Journaled {
    pub fn new(kind: ComponentKind, journal: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            kind,
            enabled: true,
            activate_status: StepStatus::Applied,
            journal: journal.clone(),
        }
    }

    pub fn failing(mut self) -> Self {
        self.activate_status = StepStatus::Failed;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl ShieldComponent for Journaled {
    fn kind(&self) -> ComponentKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn activate(&mut self) -> StepReport {
        self.journal
            .lock()
            .unwrap()
            .push(format!("activate:{}", self.kind));
        StepReport::new(self.kind, self.activate_status).with_detail("journaled")
    }

    fn deactivate(&mut self) -> StepReport {
        self.journal
            .lock()
            .unwrap()
            .push(format!("deactivate:{}", self.kind));
        StepReport::applied(self.kind, "journaled")
    }
}

/// One journaled component per kind, shuffled to prove ordering is by kind
pub fn journaled_set(journal: &Arc<Mutex<Vec<String>>>) -> Vec<Box<dyn ShieldComponent>> {
    [
        ComponentKind::Firewall,
        ComponentKind::Tor,
        ComponentKind::Mac,
        ComponentKind::I2p,
        ComponentKind::Dns,
    ]
    .into_iter()
    .map(|kind| Box::new(Journaled::new(kind, journal)) as Box<dyn ShieldComponent>)
    .collect()
}
