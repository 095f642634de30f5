//! Error types for bluesmart

use crate::action::ActionError;
use crate::attribute::AttributeParseError;
use crate::config::ConfigError;
use crate::decoder::DecodeError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Crate-level error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Attribute error: {0}")]
    Attribute(#[from] AttributeParseError),

    #[error("No Tokio runtime available to run the scheduler")]
    NoRuntime,
}

pub type Result<T> = std::result::Result<T, Error>;
