//! Radio Transport
//!
//! The platform radio is an external collaborator. Requests are issued
//! synchronously and complete asynchronously: every request returns as soon as
//! it has been handed to the radio, and the outcome arrives later through
//! [`TransportCallbacks`] on the connection the request was made on.
//!
//! [`SimulatedTransport`] is an in-memory peripheral simulator used by tests
//! and by the replay binary.

mod sim;

pub use sim::{SimOp, SimPeripheral, SimulatedTransport};

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::address::Address;
use crate::attribute::{AttributeCatalog, AttributeHandle, AttributeRef, DescriptorRef};
use crate::connection::ConnectionState;

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque identifier of one connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

/// Completion status reported by the radio (0 = success)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    /// Generic failure code most radios report for dropped links
    pub const ERROR: GattStatus = GattStatus(133);

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}", self.0)
    }
}

/// Acknowledgement mode of an attribute write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteType {
    #[default]
    WithResponse,
    WithoutResponse,
}

/// How value changes of an attribute are pushed to the central
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyMode {
    Disabled,
    Notify,
    Indicate,
}

impl NotifyMode {
    /// Value written to the client configuration descriptor
    pub fn descriptor_value(&self) -> [u8; 2] {
        match self {
            NotifyMode::Disabled => [0x00, 0x00],
            NotifyMode::Notify => [0x01, 0x00],
            NotifyMode::Indicate => [0x02, 0x00],
        }
    }
}

/// Pairing state between the adapter and a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// Scan duty cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Passive,
    LowPower,
    #[default]
    Balanced,
    LowLatency,
}

impl std::str::FromStr for ScanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "passive" => Ok(ScanMode::Passive),
            "low_power" => Ok(ScanMode::LowPower),
            "balanced" => Ok(ScanMode::Balanced),
            "low_latency" => Ok(ScanMode::LowLatency),
            other => Err(format!("unknown scan mode '{}'", other)),
        }
    }
}

/// One received advertisement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub address: Address,
    pub rssi: i16,
    #[serde(with = "hex_bytes")]
    pub data: Bytes,
}

/// Errors raised synchronously when handing a request to the radio
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("No open link for this connection")]
    NotConnected,

    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(Address),

    #[error("Radio unavailable: {0}")]
    Unavailable(String),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborator Traits
// ─────────────────────────────────────────────────────────────────────────────

/// Asynchronous completions for one connection
///
/// Called from whatever task or thread the radio delivers on. Implementations
/// must not block.
pub trait TransportCallbacks: Send + Sync {
    fn on_state_change(&self, state: ConnectionState, status: GattStatus);

    fn on_discovered(&self, catalog: AttributeCatalog, status: GattStatus);

    fn on_read(&self, attr: AttributeRef, value: Bytes, status: GattStatus);

    fn on_write(&self, attr: AttributeRef, status: GattStatus);

    fn on_descriptor_write(&self, descriptor: DescriptorRef, status: GattStatus);

    fn on_notify(&self, attr: AttributeRef, value: Bytes);
}

/// The platform radio
pub trait Transport: Send + Sync {
    /// Open a link; state changes are reported to `callbacks`
    fn connect(
        &self,
        address: &Address,
        auto_reconnect: bool,
        callbacks: Arc<dyn TransportCallbacks>,
    ) -> Result<ConnectionHandle, TransportError>;

    fn disconnect(&self, handle: ConnectionHandle) -> Result<(), TransportError>;

    /// Start attribute discovery, completed by `on_discovered`
    fn discover_attributes(&self, handle: ConnectionHandle) -> Result<(), TransportError>;

    /// Resolve one attribute without a full discovery
    fn lookup_attribute(&self, handle: ConnectionHandle, attr: &AttributeRef) -> Option<AttributeHandle>;

    fn read_attribute(&self, handle: ConnectionHandle, attr: &AttributeRef) -> Result<(), TransportError>;

    fn write_attribute(
        &self,
        handle: ConnectionHandle,
        attr: &AttributeRef,
        value: Bytes,
        write_type: WriteType,
    ) -> Result<(), TransportError>;

    fn write_descriptor(
        &self,
        handle: ConnectionHandle,
        descriptor: &DescriptorRef,
        value: Bytes,
    ) -> Result<(), TransportError>;

    /// Enable or disable local delivery of `on_notify` for an attribute
    fn subscribe_notifications(
        &self,
        handle: ConnectionHandle,
        attr: &AttributeRef,
        mode: NotifyMode,
    ) -> Result<(), TransportError>;

    fn bond_state(&self, address: &Address) -> BondState;

    /// Returns whether the radio accepted the request
    fn create_bond(&self, address: &Address) -> bool;

    fn remove_bond(&self, address: &Address) -> bool;

    /// Start delivering advertisements into `sink`
    fn start_scan(&self, mode: ScanMode, sink: mpsc::Sender<ScanResult>) -> Result<(), TransportError>;

    fn stop_scan(&self);
}

/// Hex encoding for payload bytes in captures
mod hex_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        serializer.serialize_str(&hex)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        if s.len() % 2 != 0 {
            return Err(D::Error::custom("odd number of hex digits"));
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(D::Error::custom))
            .collect::<Result<Vec<u8>, _>>()
            .map(Bytes::from)
    }
}
