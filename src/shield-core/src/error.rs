//! Error types for host state operations.
//!
//! Every component returns [`Result<T>`] which wraps [`ShieldError`]. The
//! orchestrator never lets these cross a component boundary: they are folded
//! into a [`StepReport`](crate::component::StepReport) instead.

use thiserror::Error;

/// Error type for all shield operations.
#[derive(Debug, Error)]
pub enum ShieldError {
    /// File system I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration value missing or malformed
    #[error("invalid config value {section}.{key}: {reason}")]
    Config {
        section: String,
        key: String,
        reason: String,
    },

    /// A MAC address string could not be parsed
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// An external command could not be run or exited non-zero
    #[error("command failed: {program} {args}: {detail}")]
    Command {
        program: String,
        args: String,
        detail: String,
    },

    /// Firewall plan rejected or could not be applied
    #[error("firewall error: {0}")]
    Firewall(String),

    /// A daemon did not start listening within its readiness budget
    #[error("{service} not listening on port {port} after {attempts} attempts")]
    NotReady {
        service: String,
        port: u16,
        attempts: u32,
    },

    /// Tor control-port conversation failed
    #[error("control port error: {0}")]
    Control(String),

    /// JSON/TOML (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Another live process owns the session
    #[error("session already managed by pid {0}")]
    AlreadyActive(u32),

    /// Operation needs root
    #[error("root privileges required: {0}")]
    Privilege(String),
}

/// Result type alias for shield operations.
pub type Result<T> = std::result::Result<T, ShieldError>;

impl ShieldError {
    pub(crate) fn config(section: &str, key: &str, reason: impl Into<String>) -> Self {
        ShieldError::Config {
            section: section.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ShieldError {
    fn from(e: serde_json::Error) -> Self {
        ShieldError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for ShieldError {
    fn from(e: toml::de::Error) -> Self {
        ShieldError::Serialization(e.to_string())
    }
}

impl From<toml::ser::Error> for ShieldError {
    fn from(e: toml::ser::Error) -> Self {
        ShieldError::Serialization(e.to_string())
    }
}
