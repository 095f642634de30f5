//! Device Persistence
//!
//! Storage is an external collaborator. The registry writes a record the
//! first time it discovers a device and reads everything back once, when a
//! store is attached.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::connection::ConnectionState;
use crate::decoder::FieldValue;

/// Persisted snapshot of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub address: Address,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub last_advertisement: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: ConnectionState,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

/// Error type for device stores
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to access store: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse store: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where device records live between runs
pub trait DeviceStore: Send + Sync {
    fn write(&self, record: &DeviceRecord) -> Result<(), StoreError>;

    fn load_all(&self) -> Result<Vec<DeviceRecord>, StoreError>;
}

/// Store that keeps nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl DeviceStore for NullStore {
    fn write(&self, _record: &DeviceRecord) -> Result<(), StoreError> {
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(Vec::new())
    }
}

/// One JSON document mapping address to record
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Create a new store backed by `path`; the file is created on first write
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<Address, DeviceRecord>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }
}

impl DeviceStore for JsonFileStore {
    fn write(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut records = self.read_map()?;
        records.insert(record.address.clone(), record.clone());

        // Replace the file in one step so readers never see half a document
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&records)?)?;
        std::fs::rename(&tmp, &self.path)?;

        tracing::debug!(address = %record.address, path = %self.path.display(), "Device record stored");
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        let _guard = self.lock.lock();
        Ok(self.read_map()?.into_values().collect())
    }
}
