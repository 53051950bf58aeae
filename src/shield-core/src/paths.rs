//! Layout of the per-user state root.
//!
//! Everything the orchestrator persists (config, session state, the original
//! MAC map, the DNS backup) lives under one root so a restarted process can
//! find it again. The Tor data directory sits there too, except when running
//! as root: the daemon drops to its own user and has to be able to reach it.

use std::path::{Path, PathBuf};

use crate::host::is_root;

/// Environment override for the state root
pub const HOME_ENV: &str = "PRIVSHIELD_HOME";

const APP_DIR: &str = "privshield";
const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";
/// Daemon data lives here when privileged: root-owned and searchable by the
/// proxy user, unlike a home directory
const SYSTEM_DATA_DIR: &str = "/var/lib/privshield";

/// Resolved file locations for one state root.
#[derive(Debug, Clone)]
pub struct ShieldPaths {
    root: PathBuf,
    resolv_conf: PathBuf,
    tor_data_dir: PathBuf,
}

impl ShieldPaths {
    /// Paths under an explicit root, targeting the system resolver file.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            tor_data_dir: root.join("tor"),
            root,
            resolv_conf: PathBuf::from(RESOLV_CONF_PATH),
        }
    }

    /// Pick the root: explicit override, then `$PRIVSHIELD_HOME`, then
    /// `~/.config/privshield`. As root the Tor data directory moves to
    /// `/var/lib/privshield/tor` so the proxy user can reach it after
    /// dropping privileges.
    pub fn discover(explicit: Option<PathBuf>) -> Self {
        Self::discover_as(explicit, is_root())
    }

    fn discover_as(explicit: Option<PathBuf>, privileged: bool) -> Self {
        let root = explicit
            .or_else(|| std::env::var_os(HOME_ENV).map(PathBuf::from))
            .unwrap_or_else(|| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(APP_DIR)
            });
        let paths = Self::new(root);
        if privileged {
            paths.with_tor_data_dir(Path::new(SYSTEM_DATA_DIR).join("tor"))
        } else {
            paths
        }
    }

    /// Redirect resolver management to another file (tests, chroots).
    pub fn with_resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv_conf = path.into();
        self
    }

    /// Put the Tor data directory (torrc, pid file, cookie) elsewhere.
    pub fn with_tor_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.tor_data_dir = path.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn session_file(&self) -> PathBuf {
        self.root.join("session.json")
    }

    /// Marker present only while a session is Active
    pub fn marker_file(&self) -> PathBuf {
        self.root.join("shield.pid")
    }

    pub fn mac_map_file(&self) -> PathBuf {
        self.root.join("mac_original.json")
    }

    pub fn dns_backup_file(&self) -> PathBuf {
        self.root.join("resolv.conf.bak")
    }

    /// Symlink target of the resolver file, when it was one
    pub fn dns_link_file(&self) -> PathBuf {
        self.root.join("resolv.conf.link")
    }

    pub fn resolv_conf(&self) -> &Path {
        &self.resolv_conf
    }

    pub fn tor_data_dir(&self) -> PathBuf {
        self.tor_data_dir.clone()
    }

    pub fn torrc_file(&self) -> PathBuf {
        self.tor_data_dir().join("torrc")
    }

    pub fn tor_pid_file(&self) -> PathBuf {
        self.tor_data_dir().join("tor.pid")
    }

    pub fn tor_cookie_file(&self) -> PathBuf {
        self.tor_data_dir().join("control_auth_cookie")
    }

    /// Create the root directory if needed.
    pub fn ensure_root(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }
}

/// Write `content` to `path` through a sibling temp file and rename.
pub(crate) fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("tmp.shield");
    let _ = std::fs::remove_file(&temp_path);
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)
}
