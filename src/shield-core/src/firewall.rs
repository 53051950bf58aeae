//! Kill switch on top of an ordered rule-table firewall.
//!
//! # Security Design
//! - **Validated first**: the policy is checked before any table is touched
//! - **All or nothing**: if any rule fails to apply the half-built table is
//!   torn down again, so the host never runs with a partial kill switch
//! - **Command array args**: rules are rendered to argument vectors, never
//!   formatted into a shell string
//! - **Ordering**: "owner may send anything" and the final DROP are always the
//!   last two OUTPUT rules
//!
//! Disabling is a full reversal (flush everything, policies back to ACCEPT),
//! not a rule-by-rule undo.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::component::{ComponentKind, ShieldComponent, StepReport};
use crate::config::TorSettings;
use crate::error::{Result, ShieldError};
use crate::host::{exec_require, CommandRunner};

/// DNS is admitted on this port for the proxy owner only
const DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Input,
    Forward,
    Output,
}

impl Chain {
    pub const BUILTIN: [Chain; 3] = [Chain::Input, Chain::Forward, Chain::Output];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Input => "INPUT",
            Chain::Forward => "FORWARD",
            Chain::Output => "OUTPUT",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default chain policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    Accept,
    Drop,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Accept => "ACCEPT",
            Policy::Drop => "DROP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Packet match criteria, rendered in the order they are listed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Match {
    InInterface(String),
    OutInterface(String),
    /// ESTABLISHED,RELATED conntrack state
    Established,
    Protocol(Protocol),
    /// Requires a preceding [`Match::Protocol`]
    DestPort(u16),
    /// Locally generated by this user
    Owner(String),
    NotOwner(String),
}

impl Match {
    fn push_args(&self, args: &mut Vec<String>) {
        let parts: Vec<String> = match self {
            Match::InInterface(name) => vec!["-i".into(), name.clone()],
            Match::OutInterface(name) => vec!["-o".into(), name.clone()],
            Match::Established => vec![
                "-m".into(),
                "conntrack".into(),
                "--ctstate".into(),
                "ESTABLISHED,RELATED".into(),
            ],
            Match::Protocol(proto) => vec!["-p".into(), proto.as_str().into()],
            Match::DestPort(port) => vec!["--dport".into(), port.to_string()],
            Match::Owner(user) => vec![
                "-m".into(),
                "owner".into(),
                "--uid-owner".into(),
                user.clone(),
            ],
            Match::NotOwner(user) => vec![
                "-m".into(),
                "owner".into(),
                "!".into(),
                "--uid-owner".into(),
                user.clone(),
            ],
        };
        args.extend(parts);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Accept,
    Drop,
    /// NAT redirect to a local port
    Redirect(u16),
}

/// One appended rule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    pub table: Table,
    pub chain: Chain,
    pub matches: Vec<Match>,
    pub verdict: Verdict,
}

impl FirewallRule {
    pub fn filter(chain: Chain, matches: Vec<Match>, verdict: Verdict) -> Self {
        Self {
            table: Table::Filter,
            chain,
            matches,
            verdict,
        }
    }

    pub fn nat(chain: Chain, matches: Vec<Match>, verdict: Verdict) -> Self {
        Self {
            table: Table::Nat,
            chain,
            matches,
            verdict,
        }
    }

    /// iptables arguments for appending this rule
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.table != Table::Filter {
            args.push("-t".to_string());
            args.push(self.table.as_str().to_string());
        }
        args.push("-A".to_string());
        args.push(self.chain.as_str().to_string());
        for m in &self.matches {
            m.push_args(&mut args);
        }
        args.push("-j".to_string());
        match self.verdict {
            Verdict::Accept => args.push("ACCEPT".to_string()),
            Verdict::Drop => args.push("DROP".to_string()),
            Verdict::Redirect(port) => {
                args.push("REDIRECT".to_string());
                args.push("--to-ports".to_string());
                args.push(port.to_string());
            }
        }
        args
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_args().join(" "))
    }
}

/// Ordered rule-table firewall
pub trait FirewallBackend: Send + Sync {
    /// Remove every rule and user chain from the filter and NAT tables.
    fn flush(&self) -> Result<()>;
    fn set_policy(&self, chain: Chain, policy: Policy) -> Result<()>;
    fn append(&self, rule: &FirewallRule) -> Result<()>;
}

/// [`FirewallBackend`] driving the `iptables` binary
pub struct Iptables {
    runner: Arc<dyn CommandRunner>,
}

impl Iptables {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn ipt(&self, args: &[&str]) -> Result<()> {
        exec_require(self.runner.as_ref(), "iptables", args)
    }
}

impl FirewallBackend for Iptables {
    fn flush(&self) -> Result<()> {
        self.ipt(&["-F"])?;
        self.ipt(&["-X"])?;
        self.ipt(&["-t", "nat", "-F"])?;
        self.ipt(&["-t", "nat", "-X"])
    }

    fn set_policy(&self, chain: Chain, policy: Policy) -> Result<()> {
        self.ipt(&["-P", chain.as_str(), policy.as_str()])
    }

    fn append(&self, rule: &FirewallRule) -> Result<()> {
        let args = rule.to_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.ipt(&args)
    }
}

/// What the kill switch lets through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillSwitchPolicy {
    /// User the proxy daemon runs as
    pub owner: String,
    pub or_port: u16,
    pub dir_port: u16,
    /// Outbound TCP ports admitted and transparently redirected
    pub web_ports: Vec<u16>,
    /// Proxy's transparent listener
    pub trans_port: u16,
}

impl KillSwitchPolicy {
    pub fn from_settings(tor: &TorSettings) -> Self {
        Self {
            owner: tor.user.clone(),
            or_port: tor.or_port,
            dir_port: tor.dir_port,
            web_ports: tor.web_ports.clone(),
            trans_port: tor.trans_port,
        }
    }

    /// Reject policies that would render broken or over-broad rules.
    pub fn validate(&self) -> Result<()> {
        let owner = self.owner.trim();
        if owner.is_empty() {
            return Err(ShieldError::Firewall("proxy owner must be set".into()));
        }
        if owner.starts_with('-') || owner.chars().any(char::is_whitespace) {
            return Err(ShieldError::Firewall(format!(
                "invalid proxy owner {owner:?}"
            )));
        }
        let named_ports = [
            ("or_port", self.or_port),
            ("dir_port", self.dir_port),
            ("trans_port", self.trans_port),
        ];
        for (name, port) in named_ports {
            if port == 0 {
                return Err(ShieldError::Firewall(format!("{name} must not be 0")));
            }
        }
        if self.web_ports.contains(&0) {
            return Err(ShieldError::Firewall("web port 0 is not allowed".into()));
        }
        Ok(())
    }
}

/// Default policies plus rules, in application order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallPlan {
    pub policies: Vec<(Chain, Policy)>,
    pub rules: Vec<FirewallRule>,
}

impl FirewallPlan {
    /// filter/OUTPUT rules only, in order
    pub fn output_rules(&self) -> impl Iterator<Item = &FirewallRule> {
        self.rules
            .iter()
            .filter(|r| r.table == Table::Filter && r.chain == Chain::Output)
    }
}

/// Compute the kill-switch plan for `policy`. Pure; validates first.
pub fn kill_switch_plan(policy: &KillSwitchPolicy) -> Result<FirewallPlan> {
    policy.validate()?;
    let owner = policy.owner.trim().to_string();
    let tcp = || Match::Protocol(Protocol::Tcp);

    let policies = Chain::BUILTIN.iter().map(|c| (*c, Policy::Drop)).collect();
    let mut rules = vec![
        FirewallRule::filter(
            Chain::Input,
            vec![Match::InInterface("lo".into())],
            Verdict::Accept,
        ),
        FirewallRule::filter(
            Chain::Output,
            vec![Match::OutInterface("lo".into())],
            Verdict::Accept,
        ),
        FirewallRule::filter(Chain::Input, vec![Match::Established], Verdict::Accept),
        FirewallRule::filter(Chain::Output, vec![Match::Established], Verdict::Accept),
    ];

    let mut relay_ports = vec![policy.or_port, policy.dir_port];
    relay_ports.extend(policy.web_ports.iter().copied());
    let mut seen = Vec::new();
    for port in relay_ports {
        if seen.contains(&port) {
            continue;
        }
        seen.push(port);
        rules.push(FirewallRule::filter(
            Chain::Output,
            vec![tcp(), Match::DestPort(port)],
            Verdict::Accept,
        ));
    }

    for proto in [Protocol::Udp, Protocol::Tcp] {
        rules.push(FirewallRule::filter(
            Chain::Output,
            vec![
                Match::Protocol(proto),
                Match::DestPort(DNS_PORT),
                Match::Owner(owner.clone()),
            ],
            Verdict::Accept,
        ));
    }

    let mut redirected = Vec::new();
    for port in &policy.web_ports {
        if redirected.contains(port) {
            continue;
        }
        redirected.push(*port);
        rules.push(FirewallRule::nat(
            Chain::Output,
            vec![tcp(), Match::DestPort(*port), Match::NotOwner(owner.clone())],
            Verdict::Redirect(policy.trans_port),
        ));
    }

    rules.push(FirewallRule::filter(
        Chain::Output,
        vec![Match::Owner(owner)],
        Verdict::Accept,
    ));
    rules.push(FirewallRule::filter(Chain::Output, Vec::new(), Verdict::Drop));

    Ok(FirewallPlan { policies, rules })
}

/// Applies and removes the kill switch
pub struct KillSwitch {
    enabled: bool,
    policy: KillSwitchPolicy,
    backend: Arc<dyn FirewallBackend>,
}

impl KillSwitch {
    pub fn new(enabled: bool, policy: KillSwitchPolicy, backend: Arc<dyn FirewallBackend>) -> Self {
        Self {
            enabled,
            policy,
            backend,
        }
    }

    pub fn policy(&self) -> &KillSwitchPolicy {
        &self.policy
    }

    /// Apply the full plan. Returns the number of rules appended.
    pub fn enable_kill_switch(&self) -> Result<usize> {
        let plan = kill_switch_plan(&self.policy)?;
        info!(
            owner = %self.policy.owner,
            web_ports = ?self.policy.web_ports,
            trans_port = self.policy.trans_port,
            "enabling kill switch"
        );

        if let Err(e) = self.apply(&plan) {
            warn!(%e, "kill switch incomplete, reverting");
            if let Err(revert_err) = self.disable() {
                warn!(%revert_err, "kill switch revert failed");
            }
            return Err(e);
        }

        info!(rules = plan.rules.len(), "kill switch enabled");
        Ok(plan.rules.len())
    }

    fn apply(&self, plan: &FirewallPlan) -> Result<()> {
        self.backend.flush()?;
        for (chain, policy) in &plan.policies {
            self.backend.set_policy(*chain, *policy)?;
        }
        for rule in &plan.rules {
            debug!(%rule, "appending rule");
            self.backend.append(rule)?;
        }
        Ok(())
    }

    /// Flush everything and reopen the default policies. Every step is
    /// attempted; the first error is returned.
    pub fn disable(&self) -> Result<()> {
        let mut first_error = None;
        if let Err(e) = self.backend.flush() {
            warn!(%e, "firewall flush failed");
            first_error = Some(e);
        }
        for chain in Chain::BUILTIN {
            if let Err(e) = self.backend.set_policy(chain, Policy::Accept) {
                warn!(%e, %chain, "could not reset default policy");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!("kill switch disabled, default policies ACCEPT");
                Ok(())
            }
        }
    }
}

impl ShieldComponent for KillSwitch {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Firewall
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn activate(&mut self) -> StepReport {
        if !self.enabled {
            return StepReport::skipped(ComponentKind::Firewall, "kill switch disabled");
        }
        match self.enable_kill_switch() {
            Ok(count) => StepReport::applied(
                ComponentKind::Firewall,
                format!("kill switch enabled ({count} rules)"),
            ),
            Err(e) => StepReport::from_error(ComponentKind::Firewall, &e),
        }
    }

    fn deactivate(&mut self) -> StepReport {
        match self.disable() {
            Ok(()) => StepReport::applied(ComponentKind::Firewall, "firewall reset to allow-all"),
            Err(e) => StepReport::from_error(ComponentKind::Firewall, &e),
        }
    }
}
