//! Tor configuration document rendering.

use std::fmt::Write as _;
use std::path::Path;

use crate::config::{BridgeKind, ShieldSettings, TorSettings};

/// Options for one rendered torrc
#[derive(Debug, Clone, Copy)]
pub struct TorrcOptions<'a> {
    pub data_dir: &'a Path,
    pub cookie_file: &'a Path,
    /// Drop privileges to this user after binding
    pub run_as: Option<&'a str>,
}

/// Render the torrc for `settings`.
pub fn render_torrc(settings: &ShieldSettings, options: &TorrcOptions<'_>) -> String {
    let tor = &settings.tor;
    let perf = &settings.performance;
    let mut out = String::new();

    out.push_str("# Generated by privshield; rewritten on every start\n");
    line(&mut out, "DataDirectory", options.data_dir.display());
    line(&mut out, "SocksPort", format!("127.0.0.1:{}", tor.socks_port));
    line(&mut out, "ControlPort", format!("127.0.0.1:{}", tor.control_port));
    line(&mut out, "CookieAuthentication", 1);
    line(&mut out, "CookieAuthFile", options.cookie_file.display());
    line(&mut out, "TransPort", format!("127.0.0.1:{}", tor.trans_port));
    line(&mut out, "DNSPort", format!("127.0.0.1:{}", tor.dns_port));
    line(&mut out, "AutomapHostsOnResolve", 1);
    line(&mut out, "VirtualAddrNetworkIPv4", "10.192.0.0/10");
    line(&mut out, "RunAsDaemon", 0);

    out.push_str("\n# Circuits\n");
    line(&mut out, "CircuitBuildTimeout", perf.circuit_build_timeout);
    line(&mut out, "NumEntryGuards", perf.num_entry_guards);
    line(&mut out, "KeepalivePeriod", perf.keepalive_period);
    line(&mut out, "NewCircuitPeriod", perf.new_circuit_period);
    line(&mut out, "MaxCircuitDirtiness", perf.max_circuit_dirtiness);
    line(&mut out, "ConnectionPadding", u8::from(perf.connection_padding));

    if bridges_active(tor) {
        out.push_str("\n# Bridges\n");
        line(&mut out, "UseBridges", 1);
        if let Some(transport) = tor.bridge_type.transport() {
            let plugin = match tor.bridge_type {
                BridgeKind::Snowflake => &tor.snowflake_path,
                _ => &tor.obfs4proxy_path,
            };
            line(
                &mut out,
                "ClientTransportPlugin",
                format!("{transport} exec {plugin}"),
            );
        }
        for bridge in &tor.bridges {
            let bridge = bridge.trim();
            let bridge = bridge.strip_prefix("Bridge ").unwrap_or(bridge).trim();
            if !bridge.is_empty() {
                line(&mut out, "Bridge", bridge);
            }
        }
    }

    if tor.stealth_mode {
        out.push_str("\n# Stealth\n");
        line(&mut out, "ClientOnly", 1);
        line(&mut out, "PublishServerDescriptor", 0);
        line(&mut out, "SafeLogging", 1);
        line(&mut out, "AvoidDiskWrites", 1);
    }

    if let Some(user) = options.run_as {
        out.push('\n');
        line(&mut out, "User", user);
    }
    out
}

/// Bridges are on and there is at least one line to use
pub fn bridges_active(tor: &TorSettings) -> bool {
    tor.use_bridges
        && tor.bridge_type != BridgeKind::None
        && tor.bridges.iter().any(|b| !b.trim().is_empty())
}

fn line(out: &mut String, key: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "{key} {value}");
}
