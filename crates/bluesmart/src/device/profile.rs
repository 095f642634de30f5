//! Device Profiles
//!
//! A profile is the declaration of one device type: which advertisements it
//! claims, which fields it decodes out of them and which attributes it talks
//! to once connected.

use std::time::Duration;

use crate::attribute::AttributeRef;
use crate::decoder::{DecodedField, FieldKind, FieldSpec};

/// Kind tag of devices built for unclassified advertisements
pub const GENERIC_KIND: &str = "generic";

/// How often a device is assumed to advertise unless its profile says otherwise
pub const DEFAULT_AD_FREQUENCY: Duration = Duration::from_secs(1);

/// Byte prefix expected at a fixed offset of the advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRule {
    pub offset: usize,
    pub prefix: Vec<u8>,
}

impl MatchRule {
    pub fn new(offset: usize, prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            offset,
            prefix: prefix.into(),
        }
    }

    /// A buffer too short for the rule never matches
    pub fn matches(&self, data: &[u8]) -> bool {
        let Some(end) = self.offset.checked_add(self.prefix.len()) else {
            return false;
        };
        data.get(self.offset..end) == Some(self.prefix.as_slice())
    }
}

/// Declaration of a device type
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    kind: String,
    name: Option<String>,
    fields: Vec<DecodedField>,
    attributes: Vec<(String, AttributeRef)>,
    match_rules: Vec<MatchRule>,
    ad_frequency: Duration,
    bypass_discovery: bool,
}

impl DeviceProfile {
    /// Create a new, empty profile for `kind`
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            fields: Vec::new(),
            attributes: Vec::new(),
            match_rules: Vec::new(),
            ad_frequency: DEFAULT_AD_FREQUENCY,
            bypass_discovery: false,
        }
    }

    /// Passthrough profile for devices no classifier claimed
    pub fn generic() -> Self {
        Self::new(GENERIC_KIND)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_field(mut self, slot: impl Into<String>, spec: FieldSpec, kind: FieldKind) -> Self {
        self.register_field_spec(slot, spec, kind);
        self
    }

    /// Decode `spec` into `slot` on every advertisement
    ///
    /// Registering a slot twice replaces the earlier spec.
    pub fn register_field_spec(&mut self, slot: impl Into<String>, spec: FieldSpec, kind: FieldKind) {
        let field = DecodedField::new(slot, spec, kind);
        match self.fields.iter_mut().find(|f| f.slot == field.slot) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
    }

    pub fn with_attribute(mut self, label: impl Into<String>, attr: AttributeRef) -> Self {
        self.register_attribute_ref(label, attr);
        self
    }

    pub fn register_attribute_ref(&mut self, label: impl Into<String>, attr: AttributeRef) {
        self.attributes.push((label.into(), attr));
    }

    /// Claim advertisements carrying `prefix` at `offset`
    pub fn with_match(mut self, offset: usize, prefix: impl Into<Vec<u8>>) -> Self {
        self.match_rules.push(MatchRule::new(offset, prefix));
        self
    }

    pub fn ad_frequency(mut self, frequency: Duration) -> Self {
        self.ad_frequency = frequency;
        self
    }

    /// Skip attribute discovery on connect and synthesise handles instead
    pub fn bypass_discovery(mut self, bypass: bool) -> Self {
        self.bypass_discovery = bypass;
        self
    }

    /// True when every match rule holds; a profile without rules claims nothing
    pub fn matches(&self, data: &[u8]) -> bool {
        !self.match_rules.is_empty() && self.match_rules.iter().all(|r| r.matches(data))
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn fields(&self) -> &[DecodedField] {
        &self.fields
    }

    pub fn attributes(&self) -> &[(String, AttributeRef)] {
        &self.attributes
    }

    pub fn match_rules(&self) -> &[MatchRule] {
        &self.match_rules
    }

    pub fn frequency(&self) -> Duration {
        self.ad_frequency
    }

    pub fn is_discovery_bypassed(&self) -> bool {
        self.bypass_discovery
    }
}
