//! # Shield Core
//!
//! Puts a Linux host into a privacy-hardened network state and takes it back
//! out again, cleanly, even after a partial failure or a crash.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Shield (orchestrator)                  │
//! │                                                          │
//! │   MAC ──► DNS ──► Tor ──► I2P ──► Kill switch            │
//! │    ◄──────────── reverse on deactivate ◄─────────        │
//! │                                                          │
//! │   session.json / shield.pid   (state after every step)   │
//! └────────────┬──────────────────────────────┬──────────────┘
//!              │ host traits                  │ state root
//!              ↓                              ↓
//!   ip link · iptables · systemctl   mac_original.json · resolv.conf.bak
//!   tor process · TCP checks         config.toml · tor/
//! ```
//!
//! ## Restoration Guarantees
//!
//! - **Record before mutate**: original MAC addresses and resolver content
//!   hit the disk before anything is changed
//! - **Single use**: backups are consumed by restoration and never
//!   overwritten while present
//! - **Fault isolation**: one failing interface or component never stops the
//!   others
//! - **Kill switch**: fully applied or fully absent

/// Component contract and typed step outcomes
pub mod component;
/// Persistent configuration store and typed settings
pub mod config;
/// Resolver override and restoration
pub mod dns;
/// Error types
pub mod error;
/// Kill switch policy and firewall backends
pub mod firewall;
/// Host collaborator traits and their system implementations
pub mod host;
/// Interface enumeration, MAC addresses and link control
pub mod inventory;
/// MAC address randomization
pub mod mac;
/// Shield session orchestrator
pub mod orchestrator;
/// State root layout
pub mod paths;
/// Proxy daemon controllers
pub mod proxy;
/// Session state and marker persistence
pub mod session;

pub use component::{ComponentKind, ShieldComponent, StepReport, StepStatus};
pub use config::{ConfigStore, ShieldSettings};
pub use error::{Result, ShieldError};
pub use host::Host;
pub use orchestrator::{Shield, ShutdownFlag, StatusSnapshot, TransitionReport};
pub use paths::ShieldPaths;
