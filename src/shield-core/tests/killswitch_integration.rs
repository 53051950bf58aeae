//! Kill switch application, rollback and teardown against an in-memory table.

mod common;

use std::sync::Arc;

use common::{MemoryFirewall, RecordingRunner};
use shield_core::component::{ShieldComponent, StepStatus};
use shield_core::config::ShieldSettings;
use shield_core::firewall::{
    kill_switch_plan, Chain, Iptables, KillSwitch, KillSwitchPolicy, Match, Policy, Verdict,
};

fn default_policy() -> KillSwitchPolicy {
    KillSwitchPolicy::from_settings(&ShieldSettings::default().tor)
}

#[test]
fn enable_applies_whole_plan() {
    let firewall = Arc::new(MemoryFirewall::default());
    let switch = KillSwitch::new(true, default_policy(), firewall.clone());

    let count = switch.enable_kill_switch().unwrap();
    let plan = kill_switch_plan(&default_policy()).unwrap();
    assert_eq!(count, plan.rules.len());
    assert_eq!(firewall.rules(), plan.rules);
    for chain in Chain::BUILTIN {
        assert_eq!(firewall.policy(chain), Policy::Drop);
    }

    let rules = firewall.rules();
    let last = rules.last().unwrap();
    assert_eq!(last.chain, Chain::Output);
    assert_eq!(last.verdict, Verdict::Drop);
}

#[test]
fn disable_leaves_table_open() {
    let firewall = Arc::new(MemoryFirewall::default());
    let mut switch = KillSwitch::new(true, default_policy(), firewall.clone());

    assert_eq!(switch.activate().status, StepStatus::Applied);
    assert!(!firewall.is_open());

    let step = switch.deactivate();
    assert_eq!(step.status, StepStatus::Applied);
    assert!(firewall.is_open());
}

#[test]
fn partial_apply_is_rolled_back() {
    let firewall = Arc::new(MemoryFirewall::failing_after(5));
    let mut switch = KillSwitch::new(true, default_policy(), firewall.clone());

    let step = switch.activate();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.details[0].contains("rejected"));
    assert!(firewall.is_open());
    // one flush to start clean, one for the rollback
    assert_eq!(firewall.flushes(), 2);
}

#[test]
fn invalid_policy_never_touches_table() {
    let firewall = Arc::new(MemoryFirewall::default());
    let mut policy = default_policy();
    policy.owner = String::new();
    let switch = KillSwitch::new(true, policy, firewall.clone());

    assert!(switch.enable_kill_switch().is_err());
    assert_eq!(firewall.flushes(), 0);
    assert!(firewall.is_open());
}

#[test]
fn disabled_switch_skips_activation() {
    let firewall = Arc::new(MemoryFirewall::default());
    let mut switch = KillSwitch::new(false, default_policy(), firewall.clone());

    assert_eq!(switch.activate().status, StepStatus::Skipped);
    assert_eq!(firewall.flushes(), 0);
}

#[test]
fn owner_is_admitted_before_final_drop() {
    let firewall = Arc::new(MemoryFirewall::default());
    let switch = KillSwitch::new(true, default_policy(), firewall.clone());
    switch.enable_kill_switch().unwrap();

    let output: Vec<_> = firewall
        .rules()
        .into_iter()
        .filter(|r| r.chain == Chain::Output && r.table == shield_core::firewall::Table::Filter)
        .collect();
    let n = output.len();
    assert_eq!(output[n - 2].matches, vec![Match::Owner("debian-tor".into())]);
    assert_eq!(output[n - 1].verdict, Verdict::Drop);
}

#[test]
fn iptables_backend_command_sequence() {
    let runner = Arc::new(RecordingRunner::default());
    let switch = KillSwitch::new(true, default_policy(), Arc::new(Iptables::new(runner.clone())));
    switch.enable_kill_switch().unwrap();

    let commands = runner.commands();
    assert_eq!(
        &commands[..4],
        &[
            "iptables -F",
            "iptables -X",
            "iptables -t nat -F",
            "iptables -t nat -X",
        ]
    );
    assert_eq!(commands[4], "iptables -P INPUT DROP");
    assert!(commands.contains(
        &"iptables -t nat -A OUTPUT -p tcp --dport 80 -m owner ! --uid-owner debian-tor -j REDIRECT --to-ports 9040"
            .to_string()
    ));
    assert_eq!(commands.last().unwrap(), "iptables -A OUTPUT -j DROP");

    switch.disable().unwrap();
    let commands = runner.commands();
    assert_eq!(commands.last().unwrap(), "iptables -P OUTPUT ACCEPT");
}

#[test]
fn missing_iptables_fails_cleanly() {
    let runner = Arc::new(RecordingRunner::default());
    runner.mark_missing("iptables");
    let mut switch = KillSwitch::new(true, default_policy(), Arc::new(Iptables::new(runner.clone())));

    let step = switch.activate();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(runner.commands().is_empty());
}
