//! privshield - host privacy shield
//!
//! Usage:
//!   # Activate and stay in the foreground until SIGINT/SIGTERM
//!   sudo privshield start
//!
//!   # From another terminal
//!   privshield status --json
//!   sudo privshield restart        # SIGHUP to the running manager
//!   sudo privshield stop           # SIGTERM to the running manager
//!
//!   # Configuration
//!   privshield bridge obfs4 --line "obfs4 192.0.2.1:443 FP cert=... iat-mode=0"
//!   privshield config set general i2p_enabled true

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shield_core::config::{apply_bridge, BridgeKind, BridgeSelection};
use shield_core::host::{is_root, Host, ProcessControl, SystemProcesses};
use shield_core::orchestrator::{Shield, ShutdownFlag, StatusSnapshot, TransitionReport};
use shield_core::session::{MarkerStatus, SessionStore};
use shield_core::{proxy, ConfigStore, ShieldError, ShieldPaths, StepStatus};

/// Exit status after a signal interrupted activation
const EXIT_INTERRUPTED: u8 = 130;

/// How long `stop` waits for a signalled manager to remove its marker
const STOP_WAIT_SECS: u64 = 60;

#[derive(Parser)]
#[command(name = "privshield")]
#[command(about = "Route a Linux host through Tor with MAC, DNS and kill-switch hardening")]
#[command(version)]
struct Cli {
    /// State directory (config, session state, backups)
    #[arg(long, global = true, env = "PRIVSHIELD_HOME")]
    home: Option<PathBuf>,

    /// Verbose output
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Activate the shield and keep it up until interrupted
    Start,
    /// Deactivate: signal the running manager, or restore directly
    Stop,
    /// Deactivate and activate again
    Restart,
    /// Show session and host state
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Restore the host after a crashed session
    Repair,
    /// Ask Tor for new circuits
    Newnym,
    /// Select a bridge transport (none, vanilla, obfs4, snowflake, meek)
    Bridge {
        kind: BridgeKind,
        /// Bridge line; repeat for several bridges
        #[arg(long = "line")]
        lines: Vec<String>,
    },
    /// Inspect or change configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the whole configuration file
    Show,
    /// Print one value
    Get { section: String, key: String },
    /// Validate and store one value
    Set {
        section: String,
        key: String,
        value: String,
    },
}

/// Requests from the signal listener to the engine thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlEvent {
    Shutdown,
    Restart,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::from(1),
            };
        }
    };

    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    let paths = ShieldPaths::discover(cli.home);

    match cli.command {
        Commands::Start => {
            require_root("start")?;
            let shield = build_shield(&paths)?;
            serve(shield)
        }
        Commands::Stop => {
            require_root("stop")?;
            stop(&paths)
        }
        Commands::Restart => {
            require_root("restart")?;
            restart(&paths)
        }
        Commands::Status { json } => {
            let shield = build_shield(&paths)?;
            let snapshot = shield.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_status(&snapshot);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Repair => {
            require_root("repair")?;
            let mut shield = build_shield(&paths)?;
            match shield.repair()? {
                Some(report) => print_report(&report),
                None => println!("{}", "nothing to repair".green()),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Newnym => {
            require_root("newnym")?;
            let settings = load_config(&paths)?.settings()?;
            proxy::new_identity(settings.tor.control_port, &paths.tor_cookie_file())
                .context("requesting new identity")?;
            println!("{}", "new identity requested".green());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Bridge { kind, lines } => {
            let mut store = load_config(&paths)?;
            let updated = apply_bridge(store.record(), &BridgeSelection { kind, lines });
            store.replace(updated)?;
            store.save()?;
            println!("bridge type set to {}", kind.to_string().bold());
            if store.get("tor", "use_bridges") == Some("true")
                && store.get("tor", "bridges").unwrap_or_default().is_empty()
            {
                warn!("bridges enabled without bridge lines; tor will connect directly");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config { action } => config_command(&paths, action),
    }
}

fn require_root(command: &str) -> Result<()> {
    if !is_root() {
        return Err(ShieldError::Privilege(format!("`{command}` changes host network state")).into());
    }
    Ok(())
}

fn load_config(paths: &ShieldPaths) -> Result<ConfigStore> {
    let path = paths.config_file();
    ConfigStore::load(&path).with_context(|| format!("loading {}", path.display()))
}

fn build_shield(paths: &ShieldPaths) -> Result<Shield> {
    let settings = load_config(paths)?.settings()?;
    Ok(Shield::new(settings, paths.clone(), Host::system()))
}

fn config_command(paths: &ShieldPaths, action: ConfigAction) -> Result<ExitCode> {
    let mut store = load_config(paths)?;
    match action {
        ConfigAction::Show => {
            print!("{}", toml::to_string_pretty(store.record())?);
        }
        ConfigAction::Get { section, key } => match store.get(&section, &key) {
            Some(value) => println!("{value}"),
            None => bail!("no value for {section}.{key}"),
        },
        ConfigAction::Set {
            section,
            key,
            value,
        } => {
            store.set(&section, &key, &value)?;
            store.save()?;
            println!("{section}.{key} = {value}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Run the session: engine on a blocking thread, signals on the runtime.
fn serve(shield: Shield) -> Result<ExitCode> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;
    runtime.block_on(supervise(shield))
}

async fn supervise(shield: Shield) -> Result<ExitCode> {
    use tokio::signal::unix::{signal, SignalKind};

    let shutdown = ShutdownFlag::new();
    let (tx, rx) = mpsc::channel();
    let engine_flag = shutdown.clone();
    let mut engine = tokio::task::spawn_blocking(move || engine_loop(shield, &engine_flag, rx));

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, deactivating");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, deactivating");
                break;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, restarting");
                let _ = tx.send(ControlEvent::Restart);
            }
            finished = &mut engine => {
                return finished.context("engine thread panicked")?;
            }
        }
    }

    shutdown.raise();
    let _ = tx.send(ControlEvent::Shutdown);
    engine.await.context("engine thread panicked")?
}

fn engine_loop(
    mut shield: Shield,
    shutdown: &ShutdownFlag,
    events: mpsc::Receiver<ControlEvent>,
) -> Result<ExitCode> {
    let report = shield.activate(shutdown)?;
    print_report(&report);
    if report.cancelled || shutdown.is_raised() {
        print_report(&shield.deactivate());
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }

    println!("{}", "shield active, Ctrl+C to deactivate".bold());
    loop {
        match events.recv() {
            Ok(ControlEvent::Restart) => {
                let (down, up) = shield.restart(shutdown)?;
                print_report(&down);
                print_report(&up);
                if up.cancelled {
                    print_report(&shield.deactivate());
                    return Ok(ExitCode::from(EXIT_INTERRUPTED));
                }
            }
            Ok(ControlEvent::Shutdown) | Err(_) => break,
        }
    }

    print_report(&shield.deactivate());
    Ok(ExitCode::SUCCESS)
}

fn stop(paths: &ShieldPaths) -> Result<ExitCode> {
    let processes = SystemProcesses::default();
    match SessionStore::new(paths).marker_status(&processes) {
        MarkerStatus::Live(pid) if pid != std::process::id() => {
            signal_manager(pid, nix::sys::signal::Signal::SIGTERM)?;
            println!("sent SIGTERM to manager (pid {pid}), waiting for it to deactivate");
            let marker = paths.marker_file();
            for _ in 0..STOP_WAIT_SECS * 2 {
                if !marker.exists() {
                    println!("{}", "shield stopped".green());
                    return Ok(ExitCode::SUCCESS);
                }
                if !processes.is_alive(pid) {
                    warn!(pid, "manager exited without removing its marker");
                    break;
                }
                std::thread::sleep(Duration::from_millis(500));
            }
            if marker.exists() && processes.is_alive(pid) {
                bail!("manager (pid {pid}) did not stop within {STOP_WAIT_SECS}s");
            }
            let mut shield = build_shield(paths)?;
            print_report(&shield.deactivate());
            Ok(ExitCode::SUCCESS)
        }
        _ => {
            let mut shield = build_shield(paths)?;
            print_report(&shield.deactivate());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn restart(paths: &ShieldPaths) -> Result<ExitCode> {
    let processes = SystemProcesses::default();
    if let MarkerStatus::Live(pid) = SessionStore::new(paths).marker_status(&processes) {
        signal_manager(pid, nix::sys::signal::Signal::SIGHUP)?;
        println!("sent SIGHUP to manager (pid {pid})");
        return Ok(ExitCode::SUCCESS);
    }

    let mut shield = build_shield(paths)?;
    print_report(&shield.deactivate());
    std::thread::sleep(shield.settings().performance.restart_delay);
    serve(shield)
}

fn signal_manager(pid: u32, sig: nix::sys::signal::Signal) -> Result<()> {
    let raw = i32::try_from(pid).context("pid out of range")?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), sig)
        .with_context(|| format!("sending {sig:?} to pid {pid}"))
}

fn print_report(report: &TransitionReport) {
    for step in &report.steps {
        let status = match step.status {
            StepStatus::Applied => step.status.as_str().green(),
            StepStatus::Skipped => step.status.as_str().dimmed(),
            StepStatus::Degraded => step.status.as_str().yellow(),
            StepStatus::Failed => step.status.as_str().red().bold(),
        };
        println!(
            "  {:<9} {:<9} {}",
            step.component.as_str(),
            status,
            step.details.join("; ")
        );
    }
    let summary = report.summary();
    if report.is_success() {
        println!("{}", summary.green().bold());
    } else {
        println!("{}", summary.yellow().bold());
    }
}

fn print_status(status: &StatusSnapshot) {
    let yes_no = |flag: bool| if flag { "yes".green() } else { "no".dimmed() };

    let state = if status.running {
        format!("running (pid {})", status.pid.unwrap_or_default()).green()
    } else if status.orphaned {
        "orphaned - run `privshield repair`".red().bold()
    } else {
        "inactive".dimmed()
    };
    println!("{}", "═".repeat(50).blue());
    println!("{:<22} {}", "session", state);
    if let Some(at) = status.activated_at {
        println!("{:<22} {}", "activated at", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("{:<22} {}", "tor listening", yes_no(status.primary_proxy_listening));
    println!("{:<22} {}", "i2p listening", yes_no(status.secondary_proxy_listening));
    println!("{:<22} {}", "MAC randomized", yes_no(status.mac_randomized));
    println!("{:<22} {}", "DNS secured", yes_no(status.dns_secured));
    println!("{:<22} {}", "kill switch", yes_no(status.kill_switch));
    println!("{}", "─".repeat(50).blue());
    for iface in &status.interfaces {
        let mac = iface
            .mac
            .map(|m| m.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let marker = if iface.randomized { " (randomized)" } else { "" };
        println!("  {:<16} {mac}{marker}", iface.name);
    }
}
