//! Bluesmart - Smart Peripheral Runtime
//!
//! This crate manages intermittently connected wireless peripherals:
//! - Bit-precise decoding of advertisement payloads into typed fields
//! - A per-device action scheduler that serializes and paces protocol exchanges
//! - Connection state tracking over an asynchronous radio transport
//! - A device registry that classifies advertisements and dispatches them

// Advertisement decoding
pub mod decoder;

// Identifiers
pub mod address;
pub mod attribute;

// Radio collaborator and simulator
pub mod transport;

// Connection state machine
pub mod connection;

// Schedulable protocol exchanges
pub mod action;
pub mod scheduler;

// Devices and dispatch
pub mod device;
pub mod registry;
pub mod scanner;

// Persistence and configuration
pub mod config;
pub mod store;

pub mod error;

pub use address::Address;
pub use config::Config;
pub use device::{DeviceProfile, SmartDevice};
pub use error::{Error, Result};
pub use registry::{DeviceRegistry, RegistryEvent};
pub use scanner::Scanner;
pub use scheduler::{ActionScheduler, SchedulerConfig};
