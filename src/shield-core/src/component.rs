//! Typed step outcomes and the component contract the orchestrator drives.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ShieldError;

/// The subsystems a session touches, in activation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Mac,
    Dns,
    Tor,
    I2p,
    Firewall,
}

impl ComponentKind {
    pub const ACTIVATION_ORDER: [ComponentKind; 5] = [
        ComponentKind::Mac,
        ComponentKind::Dns,
        ComponentKind::Tor,
        ComponentKind::I2p,
        ComponentKind::Firewall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Mac => "mac",
            ComponentKind::Dns => "dns",
            ComponentKind::Tor => "tor",
            ComponentKind::I2p => "i2p",
            ComponentKind::Firewall => "firewall",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Mutation (or its reversal) fully applied
    Applied,
    /// Nothing to do: disabled, already in place, or nothing recorded
    Skipped,
    /// Partially applied, or an optional layer is unavailable
    Degraded,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Applied => "applied",
            StepStatus::Skipped => "skipped",
            StepStatus::Degraded => "degraded",
            StepStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one component call plus human-readable detail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub component: ComponentKind,
    pub status: StepStatus,
    pub details: Vec<String>,
}

impl StepReport {
    pub fn new(component: ComponentKind, status: StepStatus) -> Self {
        Self {
            component,
            status,
            details: Vec::new(),
        }
    }

    pub fn applied(component: ComponentKind, detail: impl Into<String>) -> Self {
        Self::new(component, StepStatus::Applied).with_detail(detail)
    }

    pub fn skipped(component: ComponentKind, detail: impl Into<String>) -> Self {
        Self::new(component, StepStatus::Skipped).with_detail(detail)
    }

    pub fn degraded(component: ComponentKind, detail: impl Into<String>) -> Self {
        Self::new(component, StepStatus::Degraded).with_detail(detail)
    }

    pub fn failed(component: ComponentKind, detail: impl Into<String>) -> Self {
        Self::new(component, StepStatus::Failed).with_detail(detail)
    }

    /// Fold a component error into a failed step.
    pub fn from_error(component: ComponentKind, err: &ShieldError) -> Self {
        Self::failed(component, err.to_string())
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }

    pub fn is_failure(&self) -> bool {
        self.status == StepStatus::Failed
    }

    /// Failed or degraded
    pub fn is_issue(&self) -> bool {
        matches!(self.status, StepStatus::Failed | StepStatus::Degraded)
    }
}

/// One reversible host mutation.
///
/// Implementations never return errors: every failure becomes a
/// [`StepReport`] so the orchestrator can count it and keep going.
pub trait ShieldComponent: Send {
    fn kind(&self) -> ComponentKind;

    /// Feature toggle from configuration
    fn enabled(&self) -> bool;

    fn activate(&mut self) -> StepReport;

    fn deactivate(&mut self) -> StepReport;

    /// Canonical on-host fact, for components that have one.
    fn observed_active(&self) -> Option<bool> {
        None
    }
}
