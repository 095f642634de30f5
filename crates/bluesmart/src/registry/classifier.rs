//! Classifiers
//!
//! A classifier pairs a predicate over raw advertisement bytes with a factory
//! that builds the device object for a claimed address.

use std::fmt;
use std::sync::Arc;

use crate::address::Address;
use crate::device::SmartDevice;

pub type Predicate = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

pub type DeviceFactory = Arc<dyn Fn(&Address) -> Arc<SmartDevice> + Send + Sync>;

/// Maps advertisements to a device type
#[derive(Clone)]
pub struct Classifier {
    kind: String,
    predicate: Predicate,
    factory: DeviceFactory,
}

impl Classifier {
    pub fn new<P, F>(kind: impl Into<String>, predicate: P, factory: F) -> Self
    where
        P: Fn(&[u8]) -> bool + Send + Sync + 'static,
        F: Fn(&Address) -> Arc<SmartDevice> + Send + Sync + 'static,
    {
        Self {
            kind: kind.into(),
            predicate: Arc::new(predicate),
            factory: Arc::new(factory),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        (self.predicate)(data)
    }

    pub fn build(&self, address: &Address) -> Arc<SmartDevice> {
        (self.factory)(address)
    }
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier").field("kind", &self.kind).finish()
    }
}
