//! Attribute References
//!
//! Identifiers for the data points a connected peripheral exposes. An
//! attribute is addressed by a (service, characteristic) UUID pair; 16-bit
//! short forms expand against the Bluetooth base UUID.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bluetooth base UUID `00000000-0000-1000-8000-00805f9b34fb`
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Client characteristic configuration descriptor (0x2902)
pub const CLIENT_CONFIG_DESCRIPTOR: u16 = 0x2902;

/// Expand a 16-bit assigned number against the base UUID
pub fn uuid_from_short(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | (u128::from(short) << 96))
}

/// Errors while parsing attribute identifiers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttributeParseError {
    #[error("Invalid UUID '{0}'")]
    InvalidUuid(String),
}

fn parse_uuid(s: &str) -> Result<Uuid, AttributeParseError> {
    if s.len() == 4 {
        return u16::from_str_radix(s, 16)
            .map(uuid_from_short)
            .map_err(|_| AttributeParseError::InvalidUuid(s.to_string()));
    }
    Uuid::parse_str(s).map_err(|_| AttributeParseError::InvalidUuid(s.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Attribute / Descriptor References
// ─────────────────────────────────────────────────────────────────────────────

/// A (service, characteristic) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl AttributeRef {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }

    /// Both halves given as 16-bit assigned numbers
    pub fn from_short(service: u16, characteristic: u16) -> Self {
        Self::new(uuid_from_short(service), uuid_from_short(characteristic))
    }

    /// Parse textual identifiers
    ///
    /// The service may be a full UUID or 4 hex digits. A characteristic of 2
    /// or 4 hex digits is spliced into the service UUID (characters 6..8 or
    /// 4..8 respectively), which is how vendor UUID families are written.
    pub fn parse(service: &str, characteristic: &str) -> Result<Self, AttributeParseError> {
        let service_uuid = parse_uuid(service)?;
        let full = service_uuid.hyphenated().to_string();

        let characteristic = match characteristic.len() {
            2 => format!("{}{}{}", &full[..6], characteristic, &full[8..]),
            4 => format!("{}{}{}", &full[..4], characteristic, &full[8..]),
            _ => characteristic.to_string(),
        };
        let characteristic_uuid = Uuid::parse_str(&characteristic.to_lowercase())
            .map_err(|_| AttributeParseError::InvalidUuid(characteristic))?;

        Ok(Self::new(service_uuid, characteristic_uuid))
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// A descriptor hanging off an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorRef {
    pub attribute: AttributeRef,
    pub descriptor: Uuid,
}

impl DescriptorRef {
    /// The notification/indication control descriptor of an attribute
    pub fn client_config(attribute: AttributeRef) -> Self {
        Self {
            attribute,
            descriptor: uuid_from_short(CLIENT_CONFIG_DESCRIPTOR),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Catalog
// ─────────────────────────────────────────────────────────────────────────────

/// Transport-assigned handle of a discovered attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeHandle(pub u16);

/// Result of attribute discovery on a connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeCatalog {
    entries: HashMap<AttributeRef, AttributeHandle>,
}

impl AttributeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, attr: AttributeRef, handle: AttributeHandle) {
        self.entries.insert(attr, handle);
    }

    pub fn get(&self, attr: &AttributeRef) -> Option<AttributeHandle> {
        self.entries.get(attr).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AttributeRef, &AttributeHandle)> {
        self.entries.iter()
    }
}

impl FromIterator<(AttributeRef, AttributeHandle)> for AttributeCatalog {
    fn from_iter<I: IntoIterator<Item = (AttributeRef, AttributeHandle)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            uuid_from_short(0x180a).to_string(),
            "0000180a-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_parse_splices_short_characteristic() {
        let attr = AttributeRef::parse("f000aa00-0451-4000-b000-000000000000", "aa01").unwrap();
        assert_eq!(
            attr.characteristic.to_string(),
            "f000aa01-0451-4000-b000-000000000000"
        );

        let attr = AttributeRef::parse("f000aa00-0451-4000-b000-000000000000", "02").unwrap();
        assert_eq!(
            attr.characteristic.to_string(),
            "f000aa02-0451-4000-b000-000000000000"
        );
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let upper = AttributeRef::parse("180A", "2A29").unwrap();
        let lower = AttributeRef::parse("180a", "2a29").unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.service, uuid_from_short(0x180a));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(AttributeRef::parse("xyz", "2a29").is_err());
        assert!(AttributeRef::parse("180a", "not-a-uuid").is_err());
    }
}
