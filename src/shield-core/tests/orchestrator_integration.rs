//! Activation ordering, failure isolation, cancellation, crash recovery and a
//! full round trip with the real components on fake host collaborators.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{journaled_set, mac, Fakes, Journaled, Sandbox, ORIGINAL_RESOLV};
use shield_core::component::{ComponentKind, ShieldComponent, StepStatus};
use shield_core::config::ShieldSettings;
use shield_core::error::ShieldError;
use shield_core::session::{MarkerStatus, SessionPhase, SessionStore};
use shield_core::{Shield, ShutdownFlag};

type Journal = Arc<Mutex<Vec<String>>>;

fn journaled_shield(
    sandbox: &Sandbox,
    fakes: &Fakes,
    components: Vec<Box<dyn ShieldComponent>>,
) -> Shield {
    Shield::with_components(
        ShieldSettings::default(),
        sandbox.paths.clone(),
        fakes.host(),
        components,
    )
}

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

#[test]
fn activation_order_then_exact_reverse() {
    let sandbox = Sandbox::new();
    let fakes = Fakes::new();
    let journal = Journal::default();
    let mut shield = journaled_shield(&sandbox, &fakes, journaled_set(&journal));

    let up = shield.activate(&ShutdownFlag::new()).unwrap();
    assert_eq!(up.order(), ComponentKind::ACTIVATION_ORDER.to_vec());
    assert!(up.is_success());
    assert_eq!(up.summary(), "activated successfully");

    let down = shield.deactivate();
    let mut reversed = ComponentKind::ACTIVATION_ORDER.to_vec();
    reversed.reverse();
    assert_eq!(down.order(), reversed);

    assert_eq!(
        entries(&journal),
        vec![
            "activate:mac",
            "activate:dns",
            "activate:tor",
            "activate:i2p",
            "activate:firewall",
            "deactivate:firewall",
            "deactivate:i2p",
            "deactivate:tor",
            "deactivate:dns",
            "deactivate:mac",
        ]
    );
}

#[test]
fn failing_step_does_not_stop_later_steps() {
    let sandbox = Sandbox::new();
    let fakes = Fakes::new();
    let journal = Journal::default();
    let components: Vec<Box<dyn ShieldComponent>> = vec![
        Box::new(Journaled::new(ComponentKind::Mac, &journal)),
        Box::new(Journaled::new(ComponentKind::Dns, &journal).failing()),
        Box::new(Journaled::new(ComponentKind::Tor, &journal)),
        Box::new(Journaled::new(ComponentKind::Firewall, &journal)),
    ];
    let mut shield = journaled_shield(&sandbox, &fakes, components);

    let report = shield.activate(&ShutdownFlag::new()).unwrap();
    assert_eq!(report.steps.len(), 4);
    assert_eq!(report.failures(), 1);
    assert_eq!(report.step(ComponentKind::Dns).unwrap().status, StepStatus::Failed);
    assert_eq!(report.summary(), "activated with 1 issue(s)");
    assert!(!shield.state().flags.dns);
    assert!(shield.state().flags.firewall);
    assert_eq!(shield.state().phase, SessionPhase::Active);

    shield.deactivate();
}

#[test]
fn raised_shutdown_cancels_remaining_steps() {
    let sandbox = Sandbox::new();
    let fakes = Fakes::new();
    let journal = Journal::default();
    let mut shield = journaled_shield(&sandbox, &fakes, journaled_set(&journal));

    let shutdown = ShutdownFlag::new();
    shutdown.raise();
    let report = shield.activate(&shutdown).unwrap();
    assert!(report.cancelled);
    assert!(report.steps.is_empty());
    assert!(!report.is_success());
    assert!(report.summary().starts_with("activation cancelled after 0 step(s)"));

    shield.deactivate();
    assert!(!sandbox.paths.marker_file().exists());
}

#[test]
fn disabled_and_unapplied_component_is_not_reverted() {
    let sandbox = Sandbox::new();
    let fakes = Fakes::new();
    let journal = Journal::default();
    let components: Vec<Box<dyn ShieldComponent>> = vec![
        Box::new(Journaled::new(ComponentKind::Mac, &journal)),
        Box::new(Journaled::new(ComponentKind::Firewall, &journal).disabled()),
    ];
    let mut shield = journaled_shield(&sandbox, &fakes, components);

    let up = shield.activate(&ShutdownFlag::new()).unwrap();
    assert_eq!(
        up.step(ComponentKind::Firewall).unwrap().status,
        StepStatus::Skipped
    );
    let down = shield.deactivate();
    assert_eq!(
        down.step(ComponentKind::Firewall).unwrap().status,
        StepStatus::Skipped
    );
    assert_eq!(entries(&journal), vec!["activate:mac", "deactivate:mac"]);
}

#[test]
fn state_and_marker_track_the_session() {
    let sandbox = Sandbox::new();
    let fakes = Fakes::new();
    let journal = Journal::default();
    let mut shield = journaled_shield(&sandbox, &fakes, journaled_set(&journal));
    let store = SessionStore::new(&sandbox.paths);

    shield.activate(&ShutdownFlag::new()).unwrap();
    let persisted = store.load();
    assert_eq!(persisted.phase, SessionPhase::Active);
    assert_eq!(persisted.pid, Some(std::process::id()));
    assert!(persisted.activated_at.is_some());
    assert!(persisted.flags.tor && persisted.flags.firewall);
    assert_eq!(shield.marker(), MarkerStatus::Live(std::process::id()));

    shield.deactivate();
    let persisted = store.load();
    assert_eq!(persisted.phase, SessionPhase::Inactive);
    assert_eq!(persisted.pid, None);
    assert!(!persisted.flags.any());
    assert_eq!(shield.marker(), MarkerStatus::Absent);
}

#[test]
fn live_marker_refuses_second_activation() {
    let sandbox = Sandbox::new();
    let fakes = Fakes::new();
    sandbox.paths.ensure_root().unwrap();
    std::fs::write(sandbox.paths.marker_file(), "4242\n").unwrap();
    fakes.processes.set_alive(4242);
    let journal = Journal::default();
    let mut shield = journaled_shield(&sandbox, &fakes, journaled_set(&journal));

    let err = shield.activate(&ShutdownFlag::new()).unwrap_err();
    assert!(matches!(err, ShieldError::AlreadyActive(4242)));
    assert!(entries(&journal).is_empty());
    assert!(sandbox.paths.marker_file().exists());
}

#[test]
fn orphaned_marker_is_recovered_before_activation() {
    let sandbox = Sandbox::new();
    let fakes = Fakes::new();
    sandbox.paths.ensure_root().unwrap();
    std::fs::write(sandbox.paths.marker_file(), "31337\n").unwrap();
    let journal = Journal::default();
    let mut shield = journaled_shield(&sandbox, &fakes, journaled_set(&journal));
    assert_eq!(shield.marker(), MarkerStatus::Orphaned(Some(31337)));

    let report = shield.activate(&ShutdownFlag::new()).unwrap();
    assert!(report.recovered_orphan);

    let journal = entries(&journal);
    assert_eq!(journal[0], "deactivate:firewall");
    assert_eq!(journal[4], "deactivate:mac");
    assert_eq!(journal[5], "activate:mac");

    shield.deactivate();
}

#[test]
fn leftover_transitioning_state_is_repaired() {
    let sandbox = Sandbox::new();
    let fakes = Fakes::new();
    sandbox.paths.ensure_root().unwrap();
    std::fs::write(
        sandbox.paths.session_file(),
        r#"{"phase":"transitioning","pid":31337,"flags":{"firewall":true}}"#,
    )
    .unwrap();
    let journal = Journal::default();
    let mut shield = journaled_shield(&sandbox, &fakes, journaled_set(&journal));

    let repaired = shield.repair().unwrap().unwrap();
    assert_eq!(repaired.steps.len(), 5);
    assert_eq!(shield.state().phase, SessionPhase::Inactive);
    assert!(shield.repair().unwrap().is_none());
}

#[test]
fn dropping_an_active_shield_restores() {
    let sandbox = Sandbox::new();
    let fakes = Fakes::new();
    let journal = Journal::default();
    {
        let mut shield = journaled_shield(&sandbox, &fakes, journaled_set(&journal));
        shield.activate(&ShutdownFlag::new()).unwrap();
    }
    let journal = entries(&journal);
    assert_eq!(journal.len(), 10);
    assert_eq!(journal.last().unwrap(), "deactivate:mac");
    assert!(!sandbox.paths.marker_file().exists());
}

#[test]
fn restart_waits_between_halves() {
    let sandbox = Sandbox::new();
    let fakes = Fakes::new();
    let journal = Journal::default();
    let mut shield = journaled_shield(&sandbox, &fakes, journaled_set(&journal));

    shield.activate(&ShutdownFlag::new()).unwrap();
    let (down, up) = shield.restart(&ShutdownFlag::new()).unwrap();
    assert_eq!(down.steps.len(), 5);
    assert!(up.is_success());
    assert!(!up.recovered_orphan);
    assert_eq!(fakes.sleeper.naps(), vec![Duration::from_secs(2)]);

    shield.deactivate();
}

#[test]
fn full_round_trip_restores_host() {
    let sandbox = Sandbox::new();
    let fakes = Fakes::new();
    fakes.ports.listen(9050);
    fakes.ports.listen(4444);
    let mut settings = ShieldSettings::default();
    settings.general.i2p_enabled = true;
    let mut shield = Shield::new(settings, sandbox.paths.clone(), fakes.host());

    let up = shield.activate(&ShutdownFlag::new()).unwrap();
    assert_eq!(up.failures(), 0, "{up:?}");
    assert_eq!(up.step(ComponentKind::I2p).unwrap().status, StepStatus::Applied);
    let flags = shield.state().flags;
    for kind in ComponentKind::ACTIVATION_ORDER {
        assert!(flags.get(kind), "{kind} not flagged after activation");
    }
    assert!(sandbox.paths.mac_map_file().exists());
    assert!(sandbox.paths.dns_backup_file().exists());
    assert!(sandbox.paths.marker_file().exists());
    assert!(!fakes.firewall.rules().is_empty());
    assert_ne!(fakes.link.address("eth0"), Some(mac("52:54:00:12:34:56")));

    let status = shield.status();
    assert!(status.running);
    assert!(status.primary_proxy_listening);
    assert!(status.secondary_proxy_listening);
    assert!(status.mac_randomized && status.dns_secured && status.kill_switch);
    assert_eq!(status.phase, SessionPhase::Active);
    let eth0 = status.interfaces.iter().find(|i| i.name == "eth0").unwrap();
    assert!(eth0.randomized);
    assert!(serde_json::to_string(&status).unwrap().contains("\"phase\":\"active\""));

    let down = shield.deactivate();
    assert_eq!(down.failures(), 0, "{down:?}");
    assert!(!shield.state().flags.any(), "{:?}", shield.state().flags);
    assert_eq!(shield.state().phase, SessionPhase::Inactive);
    assert!(!sandbox.paths.mac_map_file().exists());
    assert!(!sandbox.paths.dns_backup_file().exists());
    assert!(!sandbox.paths.marker_file().exists());
    assert_eq!(
        std::fs::read_to_string(&sandbox.resolv_conf).unwrap(),
        ORIGINAL_RESOLV
    );
    assert_eq!(fakes.link.address("eth0"), Some(mac("52:54:00:12:34:56")));
    assert_eq!(fakes.link.address("wlan0"), Some(mac("a4:5e:60:aa:bb:cc")));
    assert!(fakes.firewall.is_open());
    assert_eq!(fakes.processes.terminated(), vec![7000]);
    assert_eq!(
        fakes.services.calls(),
        vec!["start i2pd", "stop i2pd", "stop tor"]
    );

    let status = shield.status();
    assert!(!status.running);
    assert!(!status.mac_randomized && !status.dns_secured && !status.kill_switch);
}
