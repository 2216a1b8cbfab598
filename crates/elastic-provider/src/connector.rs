//! The seam between the provider manager and the drivers that actually
//! start and stop machines.

use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

use elastic_core::CloudResources;

use crate::provider::CreationRequest;

/// A driver-specific failure. The manager treats every connector call as
/// fallible and rolls its own bookkeeping back when one fails.
#[derive(Debug, Clone, Error)]
#[error("connector {provider} failed: {message}")]
pub struct ConnectorError {
    pub provider: String,
    pub message: String,
}

impl ConnectorError {
    pub fn new(provider: &str, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            message: message.into(),
        }
    }
}

/// Driver for one elastic provider.
pub trait ProviderConnector: Send + Sync + std::fmt::Debug {
    /// Ask the provider to start the machines in `request`. `Ok(false)`
    /// means the provider declined.
    fn turn_on(&self, request: &CreationRequest) -> Result<bool, ConnectorError>;

    /// Stop the part of `worker` described by `reduction`.
    fn turn_off(&self, worker: &str, reduction: &CloudResources) -> Result<(), ConnectorError>;

    /// Stop everything this driver started.
    fn terminate_all(&self) -> Result<(), ConnectorError>;
}

/// Operations seen by a `LoopbackConnector`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorCall {
    TurnOn(u64),
    TurnOff(String),
    TerminateAll,
}

/// A connector that starts nothing. It accepts (or declines) every
/// creation and records the calls it receives, so a session can run
/// without real machines behind it.
#[derive(Debug)]
pub struct LoopbackConnector {
    name: String,
    accept: bool,
    calls: Mutex<Vec<ConnectorCall>>,
}

impl LoopbackConnector {
    /// A connector that accepts every creation.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            accept: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A connector that declines every creation.
    pub fn declining(name: &str) -> Self {
        Self {
            accept: false,
            ..Self::new(name)
        }
    }

    /// Every call received so far, oldest first.
    pub fn calls(&self) -> Vec<ConnectorCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: ConnectorCall) -> Result<(), ConnectorError> {
        let mut calls = self
            .calls
            .lock()
            .map_err(|_| ConnectorError::new(&self.name, "call log poisoned"))?;
        calls.push(call);
        Ok(())
    }
}

impl ProviderConnector for LoopbackConnector {
    fn turn_on(&self, request: &CreationRequest) -> Result<bool, ConnectorError> {
        self.record(ConnectorCall::TurnOn(request.id))?;
        debug!(connector = %self.name, request = request.id, accepted = self.accept, "loopback turn_on");
        Ok(self.accept)
    }

    fn turn_off(&self, worker: &str, reduction: &CloudResources) -> Result<(), ConnectorError> {
        self.record(ConnectorCall::TurnOff(worker.to_string()))?;
        debug!(connector = %self.name, %worker, vms = reduction.vm_count(), "loopback turn_off");
        Ok(())
    }

    fn terminate_all(&self) -> Result<(), ConnectorError> {
        self.record(ConnectorCall::TerminateAll)
    }
}
