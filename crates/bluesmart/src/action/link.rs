//! Link-level actions: connect, disconnect, bonding and delays

use std::time::Duration;

use async_trait::async_trait;

use super::{Action, ActionError, ActionKind, CONNECT_TIMEOUT};
use crate::connection::ConnectionState;
use crate::device::SmartDevice;
use crate::transport::BondState;

/// Bring the link up, waiting for the connection to be established
pub struct ConnectAction {
    auto_reconnect: bool,
    timeout: Duration,
}

impl Default for ConnectAction {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectAction {
    pub fn new() -> Self {
        Self {
            auto_reconnect: false,
            timeout: CONNECT_TIMEOUT,
        }
    }

    /// Ask the radio to re-establish the link by itself after drops
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Action for ConnectAction {
    async fn execute(&self, device: &SmartDevice) -> Result<(), ActionError> {
        if device.is_connected() {
            return Ok(());
        }

        let mut state = device.connection().subscribe();
        if let Err(e) = device.request_connect(self.auto_reconnect) {
            tracing::warn!(address = %device.address(), error = %e, "Connect request rejected");
            return Err(ActionError::ConnectFailed);
        }

        let settled = state.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Disconnected));
        match tokio::time::timeout(self.timeout, settled).await {
            Ok(Ok(s)) if *s == ConnectionState::Connected => Ok(()),
            Ok(_) => Err(ActionError::ConnectFailed),
            Err(_) => {
                tracing::warn!(address = %device.address(), timeout = ?self.timeout, "Connect timed out");
                // Abandon the attempt so the link does not come up behind our back
                let _ = device.request_disconnect();
                Err(ActionError::ConnectFailed)
            }
        }
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Connect
    }
}

/// Drop the link; does not wait for the radio to confirm
#[derive(Default)]
pub struct DisconnectAction;

impl DisconnectAction {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Action for DisconnectAction {
    async fn execute(&self, device: &SmartDevice) -> Result<(), ActionError> {
        if let Err(e) = device.request_disconnect() {
            tracing::debug!(address = %device.address(), error = %e, "Nothing to disconnect");
        }
        Ok(())
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Disconnect
    }

    fn no_delay(&self) -> bool {
        true
    }
}

/// Pair with the device
///
/// Success means the radio accepted the request; bonding itself completes
/// later and is not awaited.
#[derive(Default)]
pub struct BondAction;

impl BondAction {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Action for BondAction {
    async fn execute(&self, device: &SmartDevice) -> Result<(), ActionError> {
        let transport = device.transport();
        if transport.bond_state(device.address()) == BondState::Bonded {
            return Ok(());
        }
        if transport.create_bond(device.address()) {
            Ok(())
        } else {
            Err(ActionError::BondFailed)
        }
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Bond
    }

    fn no_delay(&self) -> bool {
        true
    }
}

/// Remove the pairing with the device
#[derive(Default)]
pub struct UnbondAction;

impl UnbondAction {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Action for UnbondAction {
    async fn execute(&self, device: &SmartDevice) -> Result<(), ActionError> {
        let transport = device.transport();
        if transport.bond_state(device.address()) == BondState::None {
            return Ok(());
        }
        if transport.remove_bond(device.address()) {
            Ok(())
        } else {
            Err(ActionError::BondFailed)
        }
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Unbond
    }

    fn no_delay(&self) -> bool {
        true
    }
}

/// Hold the queue for a fixed time
pub struct DelayAction {
    duration: Duration,
}

impl DelayAction {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl Action for DelayAction {
    async fn execute(&self, _device: &SmartDevice) -> Result<(), ActionError> {
        tokio::time::sleep(self.duration).await;
        Ok(())
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Delay
    }

    fn no_delay(&self) -> bool {
        true
    }
}
