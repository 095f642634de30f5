//! Configuration
//!
//! `bluesmart.toml` holds registry, scanner and scheduler settings plus the
//! device profiles the registry classifies advertisements with.
//!
//! ```toml
//! [registry]
//! allow_unknown = false
//! store = "devices.json"
//!
//! [scanner]
//! mode = "low_latency"
//!
//! [scheduler]
//! interval = 100
//! auto_connect = true
//!
//! [[device]]
//! kind = "thermometer"
//! match = [{ offset = 0, prefix = [0x02, 0x01] }]
//!
//! [[device.field]]
//! slot = "temperature"
//! start = 2
//! end = 4
//! unit = "byte"
//! signed = true
//! flip = true
//!
//! [[device.attribute]]
//! label = "battery"
//! service = "180f"
//! characteristic = "2a19"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::attribute::{AttributeParseError, AttributeRef};
use crate::decoder::{DecodeError, FieldKind, FieldSpec, FieldUnit};
use crate::device::{DeviceProfile, MatchRule};
use crate::scheduler::SchedulerConfig;
use crate::transport::ScanMode;

/// Offset of the manufacturer prefix that marks a beacon frame
pub const BEACON_OFFSET: usize = 5;
/// Apple's company identifier, little-endian
pub const BEACON_PREFIX: [u8; 2] = [0x4C, 0x00];

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Device '{device}' field '{slot}': {source}")]
    InvalidField {
        device: String,
        slot: String,
        source: DecodeError,
    },

    #[error("Device '{device}' attribute '{label}': {source}")]
    InvalidAttribute {
        device: String,
        label: String,
        source: AttributeParseError,
    },

    #[error("Invalid value '{value}' for {var}")]
    InvalidEnv { var: String, value: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub scanner: ScannerConfig,
    pub scheduler: SchedulerConfig,
    #[serde(rename = "device")]
    pub devices: Vec<DeviceConfig>,
}

/// `[registry]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Build generic devices for unclassified advertisements
    pub allow_unknown: bool,
    pub beacon_offset: usize,
    pub beacon_prefix: Vec<u8>,
    /// JSON file the registry persists discovered devices to
    pub store: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            allow_unknown: false,
            beacon_offset: BEACON_OFFSET,
            beacon_prefix: BEACON_PREFIX.to_vec(),
            store: None,
        }
    }
}

impl RegistryConfig {
    pub fn beacon_rule(&self) -> MatchRule {
        MatchRule::new(self.beacon_offset, self.beacon_prefix.clone())
    }
}

/// `[scanner]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub mode: ScanMode,
    /// Advertisements buffered between the radio and the registry
    pub buffer: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            mode: ScanMode::Balanced,
            buffer: 256,
        }
    }
}

/// One `[[device]]` profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "match")]
    pub matches: Vec<MatchConfig>,
    /// Expected advertising period in milliseconds
    #[serde(default)]
    pub ad_frequency: Option<u64>,
    #[serde(default)]
    pub bypass_discovery: bool,
    #[serde(default, rename = "field")]
    pub fields: Vec<FieldConfig>,
    #[serde(default, rename = "attribute")]
    pub attributes: Vec<AttributeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchConfig {
    pub offset: usize,
    pub prefix: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    pub slot: String,
    pub start: u32,
    pub end: u32,
    #[serde(default)]
    pub unit: FieldUnit,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub flip: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeConfig {
    pub label: String,
    pub service: String,
    pub characteristic: String,
}

impl DeviceConfig {
    /// Build the profile this entry declares
    pub fn to_profile(&self) -> Result<DeviceProfile, ConfigError> {
        let mut profile = DeviceProfile::new(&self.kind).bypass_discovery(self.bypass_discovery);
        if let Some(name) = &self.name {
            profile = profile.with_name(name);
        }
        if let Some(ms) = self.ad_frequency {
            profile = profile.ad_frequency(Duration::from_millis(ms));
        }
        for rule in &self.matches {
            profile = profile.with_match(rule.offset, rule.prefix.clone());
        }

        for field in &self.fields {
            let spec = FieldSpec::new(field.start, field.end, field.unit)
                .map_err(|source| ConfigError::InvalidField {
                    device: self.kind.clone(),
                    slot: field.slot.clone(),
                    source,
                })?
                .signed(field.signed)
                .flipped(field.flip);
            profile.register_field_spec(&field.slot, spec, field.kind);
        }

        for attribute in &self.attributes {
            let attr = AttributeRef::parse(&attribute.service, &attribute.characteristic).map_err(|source| {
                ConfigError::InvalidAttribute {
                    device: self.kind.clone(),
                    label: attribute.label.clone(),
                    source,
                }
            })?;
            profile.register_attribute_ref(&attribute.label, attr);
        }

        Ok(profile)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Load configuration from a TOML file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::parse(&content)?;
        info!(
            "Loaded config from {} ({} device profiles)",
            path.display(),
            config.devices.len()
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `BLUESMART_*` environment overrides
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from any variable source
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("BLUESMART_ALLOW_UNKNOWN") {
            self.registry.allow_unknown = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "BLUESMART_ALLOW_UNKNOWN".to_string(),
                        value,
                    });
                }
            };
        }

        if let Some(value) = lookup("BLUESMART_SCAN_MODE") {
            self.scanner.mode = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "BLUESMART_SCAN_MODE".to_string(),
                value: value.clone(),
            })?;
        }

        Ok(())
    }

    /// Profiles of every `[[device]]` entry, in file order
    pub fn profiles(&self) -> Result<Vec<DeviceProfile>, ConfigError> {
        self.devices.iter().map(DeviceConfig::to_profile).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
        [registry]
        allow_unknown = true
        store = "devices.json"

        [scanner]
        mode = "low_latency"

        [scheduler]
        interval = 250
        auto_connect = true
        auto_terminate = 5000
        max_actions = 8

        [[device]]
        kind = "thermometer"
        name = "Porch"
        ad_frequency = 2000
        match = [{ offset = 0, prefix = [0x02, 0x01] }]

        [[device.field]]
        slot = "temperature"
        start = 2
        end = 4
        unit = "byte"
        signed = true
        flip = true

        [[device.field]]
        slot = "low_battery"
        start = 32
        end = 33
        kind = "boolean"

        [[device.attribute]]
        label = "battery"
        service = "180f"
        characteristic = "2a19"
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(SAMPLE).unwrap();
        assert!(config.registry.allow_unknown);
        assert_eq!(config.registry.store, Some(PathBuf::from("devices.json")));
        assert_eq!(config.registry.beacon_rule(), MatchRule::new(5, [0x4C, 0x00]));
        assert_eq!(config.scanner.mode, ScanMode::LowLatency);
        assert_eq!(config.scheduler.interval, Duration::from_millis(250));
        assert_eq!(config.scheduler.auto_terminate, Some(Duration::from_secs(5)));
        assert_eq!(config.scheduler.max_actions, 8);
        assert!(!config.scheduler.continue_on_complete);

        let profiles = config.profiles().unwrap();
        assert_eq!(profiles.len(), 1);
        let thermo = &profiles[0];
        assert_eq!(thermo.kind(), "thermometer");
        assert_eq!(thermo.name(), Some("Porch"));
        assert_eq!(thermo.frequency(), Duration::from_secs(2));
        assert!(thermo.matches(&[0x02, 0x01, 0xFF]));
        assert_eq!(thermo.fields().len(), 2);
        assert!(thermo.fields()[0].spec.is_signed());
        assert_eq!(thermo.fields()[1].kind, FieldKind::Boolean);
        assert_eq!(thermo.attributes()[0].1, AttributeRef::from_short(0x180f, 0x2a19));
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert!(!config.registry.allow_unknown);
        assert_eq!(config.scanner.mode, ScanMode::Balanced);
        assert_eq!(config.scheduler, SchedulerConfig::default());
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_invalid_field_range() {
        let config = Config::parse(
            r#"
            [[device]]
            kind = "broken"
            [[device.field]]
            slot = "empty"
            start = 4
            end = 4
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.profiles(),
            Err(ConfigError::InvalidField { ref slot, .. }) if slot == "empty"
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [("BLUESMART_ALLOW_UNKNOWN", "yes"), ("BLUESMART_SCAN_MODE", "passive")]
            .into_iter()
            .collect();
        let mut config = Config::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert!(config.registry.allow_unknown);
        assert_eq!(config.scanner.mode, ScanMode::Passive);

        let mut config = Config::default();
        let err = config
            .apply_overrides(|k| (k == "BLUESMART_SCAN_MODE").then(|| "warp".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(dir.path().join("nope.toml")).await;
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
