//! Proxy daemon lifecycle.
//!
//! - [`tor`]: the primary onion-routing proxy, launched directly with a
//!   rendered configuration and falling back to the system service
//! - [`i2p`]: the optional garlic-routing proxy, always a system service
//! - [`torrc`]: configuration rendering
//! - [`control`]: control-port client for identity rotation

pub mod control;
pub mod i2p;
pub mod tor;
pub mod torrc;

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::host::{PortCheck, Sleeper};

pub use control::new_identity;
pub use i2p::I2pController;
pub use tor::TorController;
pub use torrc::render_torrc;

/// Poll `port` until something listens or `attempts` checks have failed.
///
/// Sleeps `interval` between checks, never after the last one. Returns
/// whether the port came up.
pub fn wait_until_listening(
    ports: &dyn PortCheck,
    sleeper: &dyn Sleeper,
    port: u16,
    attempts: u32,
    interval: Duration,
) -> bool {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        if ports.is_listening(port) {
            info!(port, attempt, "port is listening");
            return true;
        }
        if attempt < attempts {
            debug!(port, attempt, max = attempts, "port not listening yet");
            sleeper.sleep(interval);
        }
    }
    warn!(port, attempts, "port did not start listening");
    false
}
