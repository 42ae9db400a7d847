//! Outcome of a best-effort teardown.

use std::fmt;

use podnet_common::PodnetResult;

/// A cleanup action attempted during teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownAction {
    /// Remove the pod's port forwarding rules.
    UnforwardPorts,
    /// Remove a persistent tap.
    RemoveTap(String),
    /// Find a macvtap by name.
    LookupLink(String),
    /// Delete a macvtap.
    DeleteLink(String),
    /// A network type teardown does not know how to clean up.
    Unsupported(String),
    /// Release the address through the allocator.
    ReleaseAddress,
    /// Remove a masquerade chain.
    RemoveMasquerade(String),
    /// Remove the saved network state.
    RemoveNetInfo,
}

impl fmt::Display for TeardownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnforwardPorts => f.write_str("remove forwarded ports"),
            Self::RemoveTap(name) => write!(f, "remove tap {name}"),
            Self::LookupLink(name) => write!(f, "find link {name}"),
            Self::DeleteLink(name) => write!(f, "remove link {name}"),
            Self::Unsupported(kind) => write!(f, "tear down unsupported network type {kind:?}"),
            Self::ReleaseAddress => f.write_str("release address"),
            Self::RemoveMasquerade(chain) => write!(f, "remove masquerading chain {chain}"),
            Self::RemoveNetInfo => f.write_str("remove saved network info"),
        }
    }
}

/// One attempted cleanup step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownStep {
    /// Network the step belongs to, `None` for pod-wide steps.
    pub network: Option<String>,
    /// What was attempted.
    pub action: TeardownAction,
    /// Error message if the step failed.
    pub outcome: Result<(), String>,
}

impl TeardownStep {
    /// Whether the step failed.
    #[must_use]
    pub const fn failed(&self) -> bool {
        self.outcome.is_err()
    }
}

/// Ordered record of every step teardown attempted.
///
/// Teardown never fails; callers inspect the report instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Steps in the order they were attempted.
    pub steps: Vec<TeardownStep>,
}

impl TeardownReport {
    /// Create an empty report.
    #[must_use]
    pub const fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Record a step, logging it if it failed. Returns whether it succeeded.
    pub fn record(
        &mut self,
        network: Option<&str>,
        action: TeardownAction,
        result: PodnetResult<()>,
    ) -> bool {
        let outcome = match result {
            Ok(()) => {
                tracing::debug!(network = network.unwrap_or_default(), action = %action, "Teardown step done");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    network = network.unwrap_or_default(),
                    action = %action,
                    error = %err,
                    "Teardown step failed"
                );
                Err(err.to_string())
            }
        };
        let ok = outcome.is_ok();
        self.steps.push(TeardownStep {
            network: network.map(str::to_string),
            action,
            outcome,
        });
        ok
    }

    /// Steps that failed.
    pub fn failures(&self) -> impl Iterator<Item = &TeardownStep> {
        self.steps.iter().filter(|step| step.failed())
    }

    /// Whether every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Steps recorded for one network.
    pub fn for_network<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a TeardownStep> {
        self.steps
            .iter()
            .filter(move |step| step.network.as_deref() == Some(name))
    }
}
