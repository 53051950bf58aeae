//! Secondary proxy (I2P) controller. Optional: every failure here is a
//! warning.

use std::sync::Arc;

use tracing::{info, warn};

use crate::component::{ComponentKind, ShieldComponent, StepReport};
use crate::config::ShieldSettings;
use crate::error::{Result, ShieldError};
use crate::host::{Host, PortCheck, ServiceManager, Sleeper};

pub struct I2pController {
    enabled: bool,
    service: String,
    http_proxy_port: u16,
    settle: std::time::Duration,
    services: Arc<dyn ServiceManager>,
    ports: Arc<dyn PortCheck>,
    sleeper: Arc<dyn Sleeper>,
}

impl I2pController {
    pub fn new(settings: &ShieldSettings, host: &Host) -> Self {
        Self {
            enabled: settings.general.i2p_enabled,
            service: settings.i2p.service.clone(),
            http_proxy_port: settings.i2p.http_proxy_port,
            settle: settings.performance.secondary_settle,
            services: host.services.clone(),
            ports: host.ports.clone(),
            sleeper: host.sleeper.clone(),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.ports.is_listening(self.http_proxy_port)
    }

    /// Start the service, wait the settle delay, then check the HTTP proxy
    /// port once.
    pub fn start_secondary(&self) -> Result<()> {
        self.services.start(&self.service)?;
        self.sleeper.sleep(self.settle);
        if !self.is_listening() {
            return Err(ShieldError::NotReady {
                service: self.service.clone(),
                port: self.http_proxy_port,
                attempts: 1,
            });
        }
        info!(service = %self.service, port = self.http_proxy_port, "i2p proxy is ready");
        Ok(())
    }

    pub fn stop_secondary(&self) -> Result<()> {
        self.services.stop(&self.service)?;
        info!(service = %self.service, "i2p stopped");
        Ok(())
    }
}

impl ShieldComponent for I2pController {
    fn kind(&self) -> ComponentKind {
        ComponentKind::I2p
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn activate(&mut self) -> StepReport {
        if !self.enabled {
            return StepReport::skipped(ComponentKind::I2p, "i2p disabled");
        }
        match self.start_secondary() {
            Ok(()) => StepReport::applied(
                ComponentKind::I2p,
                format!("HTTP proxy on {}", self.http_proxy_port),
            ),
            Err(e) => {
                warn!(%e, "i2p unavailable, continuing without it");
                StepReport::degraded(ComponentKind::I2p, e.to_string())
            }
        }
    }

    fn deactivate(&mut self) -> StepReport {
        match self.stop_secondary() {
            Ok(()) => StepReport::applied(ComponentKind::I2p, "service stopped"),
            Err(e) => {
                warn!(%e, "i2p stop failed");
                StepReport::degraded(ComponentKind::I2p, e.to_string())
            }
        }
    }
}
