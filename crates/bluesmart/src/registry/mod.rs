//! Device Registry
//!
//! The registry owns every live [`SmartDevice`], keyed by address, and is the
//! dispatcher advertisements flow through. Classification happens at most
//! once per address: a claimed address maps to its device for the registry's
//! lifetime, an unclaimed one is put on the invalid list and ignored from
//! then on.
//!
//! Lookup, classification and insertion for an unseen address run under the
//! address's map entry, so concurrent advertisements from one peripheral
//! produce exactly one device.

mod classifier;

pub use classifier::{Classifier, DeviceFactory, Predicate};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::address::Address;
use crate::config::{BEACON_OFFSET, BEACON_PREFIX, Config, ConfigError};
use crate::device::{DeviceProfile, MatchRule, SmartDevice};
use crate::scheduler::SchedulerConfig;
use crate::store::{DeviceRecord, DeviceStore, NullStore, StoreError};
use crate::transport::Transport;

const EVENT_CAPACITY: usize = 256;

/// Registry notifications
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A device was created for a new address (or loaded from the store)
    Discovered(Arc<SmartDevice>),
    /// A known device's advertisement was decoded
    Updated(Arc<SmartDevice>),
    /// A known device sent a beacon frame
    Pinged(Arc<SmartDevice>),
}

/// Address to device map and advertisement dispatcher
pub struct DeviceRegistry {
    devices: DashMap<Address, Arc<SmartDevice>>,
    invalid: DashSet<Address>,
    classifiers: RwLock<Vec<Classifier>>,
    allow_unknown: AtomicBool,
    beacon: MatchRule,
    transport: Arc<dyn Transport>,
    store: RwLock<Arc<dyn DeviceStore>>,
    scheduler_config: Option<SchedulerConfig>,
    events: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create a new registry that builds devices over `transport`
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            devices: DashMap::new(),
            invalid: DashSet::new(),
            classifiers: RwLock::new(Vec::new()),
            allow_unknown: AtomicBool::new(false),
            beacon: MatchRule::new(BEACON_OFFSET, BEACON_PREFIX),
            transport,
            store: RwLock::new(Arc::new(NullStore)),
            scheduler_config: None,
            events: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    /// Build a registry with the settings and profiles of `config`
    pub fn from_config(config: &Config, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        let registry = Self::new(transport)
            .with_beacon_rule(config.registry.beacon_rule())
            .with_scheduler_config(config.scheduler.clone());
        registry.set_unknown_device_support(config.registry.allow_unknown);

        for profile in config.profiles()? {
            registry.register_profile(profile);
        }
        Ok(registry)
    }

    /// Frames matching `rule` are beacons
    pub fn with_beacon_rule(mut self, rule: MatchRule) -> Self {
        self.beacon = rule;
        self
    }

    /// Give every new device a scheduler with `config`
    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = Some(config);
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Classification
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a classifier; classifiers are tried in registration order
    pub fn register_classifier<P, F>(&self, kind: impl Into<String>, predicate: P, factory: F)
    where
        P: Fn(&[u8]) -> bool + Send + Sync + 'static,
        F: Fn(&Address) -> Arc<SmartDevice> + Send + Sync + 'static,
    {
        let classifier = Classifier::new(kind, predicate, factory);
        debug!(kind = %classifier.kind(), "Classifier registered");
        self.classifiers.write().push(classifier);
    }

    /// Classify with the profile's match rules and build profile devices
    pub fn register_profile(&self, profile: DeviceProfile) {
        let profile = Arc::new(profile);
        let transport = self.transport.clone();
        let matcher = profile.clone();
        self.register_classifier(
            profile.kind().to_string(),
            move |data| matcher.matches(data),
            move |address| SmartDevice::new(address.clone(), profile.clone(), transport.clone()),
        );
    }

    pub fn set_unknown_device_support(&self, allow: bool) {
        self.allow_unknown.store(allow, Ordering::Release);
    }

    pub fn is_invalid(&self, address: &Address) -> bool {
        self.invalid.contains(address)
    }

    fn classify(&self, address: &Address, data: &[u8]) -> Option<Arc<SmartDevice>> {
        let classifiers = self.classifiers.read();
        if let Some(classifier) = classifiers.iter().find(|c| c.matches(data)) {
            return Some(classifier.build(address));
        }
        if self.allow_unknown.load(Ordering::Acquire) {
            return Some(self.generic_device(address, DeviceProfile::generic()));
        }
        None
    }

    fn generic_device(&self, address: &Address, profile: DeviceProfile) -> Arc<SmartDevice> {
        SmartDevice::new(address.clone(), Arc::new(profile), self.transport.clone())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────────

    /// Route one advertisement to its device, creating the device if needed
    ///
    /// Classifier predicates and factories run while the address's map entry
    /// is held; they must not call back into the registry.
    pub fn process_advertisement(&self, data: &[u8], address: &Address, rssi: i16) {
        if self.invalid.contains(address) {
            return;
        }

        let beacon = self.beacon.matches(data);

        let known = self.devices.get(address).map(|d| d.clone());
        if let Some(device) = known {
            self.route(&device, data, rssi, beacon);
            return;
        }

        if beacon {
            trace!(%address, "Beacon from unknown device ignored");
            return;
        }

        let device = match self.devices.entry(address.clone()) {
            Entry::Occupied(entry) => {
                let device = entry.get().clone();
                drop(entry);
                self.route(&device, data, rssi, beacon);
                return;
            }
            Entry::Vacant(entry) => {
                // Another delivery may have rejected the address while we waited for the entry
                if self.invalid.contains(address) {
                    return;
                }
                match self.classify(address, data) {
                    Some(device) => entry.insert(device).clone(),
                    None => {
                        self.invalid.insert(address.clone());
                        drop(entry);
                        debug!(%address, "Unrecognized device; ignoring address from now on");
                        return;
                    }
                }
            }
        };

        info!(%address, kind = %device.kind(), "Device discovered");
        self.prepare(&device);
        device.on_advertisement(data, rssi);
        self.emit(RegistryEvent::Discovered(device.clone()));

        let store = self.store.read().clone();
        let record = device.record();
        // Keep file IO off the dispatch path when running under Tokio
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || persist(store.as_ref(), &record));
            }
            Err(_) => persist(store.as_ref(), &record),
        }
    }

    fn route(&self, device: &Arc<SmartDevice>, data: &[u8], rssi: i16, beacon: bool) {
        if !device.is_processing_enabled() {
            return;
        }
        if beacon {
            device.on_beacon(rssi);
            self.emit(RegistryEvent::Pinged(device.clone()));
        } else {
            device.on_advertisement(data, rssi);
            self.emit(RegistryEvent::Updated(device.clone()));
        }
    }

    fn prepare(&self, device: &SmartDevice) {
        if let Some(config) = &self.scheduler_config {
            if let Err(e) = device.prepare_scheduler(config.clone()) {
                debug!(address = %device.address(), error = %e, "Scheduler not prepared");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Device Set
    // ─────────────────────────────────────────────────────────────────────────

    pub fn device(&self, address: &Address) -> Option<Arc<SmartDevice>> {
        self.devices.get(address).map(|d| d.clone())
    }

    pub fn devices(&self) -> Vec<Arc<SmartDevice>> {
        self.devices.iter().map(|d| d.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Drop a device and clear its address from the invalid list
    pub fn forget_device(&self, address: &Address) -> Option<Arc<SmartDevice>> {
        self.invalid.remove(address);
        let (_, device) = self.devices.remove(address)?;
        if let Some(scheduler) = device.scheduler() {
            scheduler.close();
        }
        info!(%address, "Device forgotten");
        Some(device)
    }

    /// Insert or replace a device built elsewhere
    pub fn inject_device(&self, device: Arc<SmartDevice>) {
        let address = device.address().clone();
        self.invalid.remove(&address);
        self.prepare(&device);
        if let Some(previous) = self.devices.insert(address.clone(), device) {
            if let Some(scheduler) = previous.scheduler() {
                scheduler.close();
            }
        }
        debug!(%address, "Device injected");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────────

    /// Swap in a store, replacing all known devices with its records
    ///
    /// Every loaded device is announced as discovered. Returns the number of
    /// devices loaded.
    pub fn attach_store(&self, store: Arc<dyn DeviceStore>) -> Result<usize, StoreError> {
        let records = store.load_all()?;
        *self.store.write() = store;

        for device in self.devices() {
            if let Some(scheduler) = device.scheduler() {
                scheduler.close();
            }
        }
        self.devices.clear();

        let count = records.len();
        for record in records {
            let device = self.restore(&record);
            self.prepare(&device);
            self.devices.insert(record.address.clone(), device.clone());
            self.emit(RegistryEvent::Discovered(device));
        }

        info!(devices = count, "Device store attached");
        Ok(count)
    }

    fn restore(&self, record: &DeviceRecord) -> Arc<SmartDevice> {
        let classifier = self
            .classifiers
            .read()
            .iter()
            .find(|c| c.kind() == record.kind)
            .cloned();
        let device = match classifier {
            Some(classifier) => classifier.build(&record.address),
            None => self.generic_device(&record.address, DeviceProfile::new(&record.kind)),
        };
        device.restore(record);
        device
    }

    /// Close every device's scheduler and wait for the workers to stop
    pub async fn shutdown(&self) {
        let devices = self.devices();
        let schedulers = devices.iter().filter_map(|d| d.scheduler()).map(|s| s.shutdown());
        futures::future::join_all(schedulers).await;
        info!(devices = devices.len(), "Registry shut down");
    }
}

fn persist(store: &dyn DeviceStore, record: &DeviceRecord) {
    if let Err(e) = store.write(record) {
        warn!(address = %record.address, error = %e, "Failed to store device record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{FieldKind, FieldSpec, FieldValue};
    use crate::store::JsonFileStore;
    use crate::transport::SimulatedTransport;
    use std::sync::atomic::AtomicUsize;

    const THERMO_TAG: [u8; 2] = [0x02, 0x01];

    fn thermometer() -> DeviceProfile {
        DeviceProfile::new("thermometer")
            .with_match(0, THERMO_TAG)
            .with_field("temperature", FieldSpec::bytes(2, 3).unwrap().signed(true), FieldKind::Integer)
    }

    fn registry() -> DeviceRegistry {
        let registry = DeviceRegistry::new(Arc::new(SimulatedTransport::new()));
        registry.register_profile(thermometer());
        registry
    }

    fn drain(rx: &mut broadcast::Receiver<RegistryEvent>) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_discovery_then_update() {
        let registry = registry();
        let mut rx = registry.subscribe();
        let address = Address::new("aa:00:00:00:00:01");

        registry.process_advertisement(&[0x02, 0x01, 0xFE, 0, 0, 0, 0], &address, -50);
        registry.process_advertisement(&[0x02, 0x01, 0x05, 0, 0, 0, 0], &address, -40);

        let events = drain(&mut rx);
        assert!(matches!(events[0], RegistryEvent::Discovered(_)));
        assert!(matches!(events[1], RegistryEvent::Updated(_)));

        let device = registry.device(&address).unwrap();
        assert_eq!(device.kind(), "thermometer");
        assert_eq!(device.field("temperature"), Some(FieldValue::Signed(5)));
        assert_eq!(device.rssi(), Some(-40));
        assert!(device.is_visible());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_advertisements_create_one_device() {
        let registry = Arc::new(registry());
        let mut rx = registry.subscribe();
        let address = Address::new("AA:00:00:00:00:02");

        let tasks: Vec<_> = (0..100)
            .map(|i| {
                let registry = registry.clone();
                let address = address.clone();
                tokio::spawn(async move {
                    registry.process_advertisement(&[0x02, 0x01, i as u8, 0, 0, 0, 0], &address, -60);
                })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }

        assert_eq!(registry.len(), 1);
        let discovered = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, RegistryEvent::Discovered(_)))
            .count();
        assert_eq!(discovered, 1);
    }

    #[test]
    fn test_unrecognized_address_is_blacklisted() {
        let registry = DeviceRegistry::new(Arc::new(SimulatedTransport::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let transport = registry.transport().clone();
        registry.register_classifier(
            "never",
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            },
            move |address| SmartDevice::new(address.clone(), Arc::new(DeviceProfile::generic()), transport.clone()),
        );

        let address = Address::new("AA:00:00:00:00:03");
        registry.process_advertisement(&[0x09, 0x09], &address, -70);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_invalid(&address));

        for _ in 0..10 {
            registry.process_advertisement(&[0x02, 0x01, 0x00], &address, -70);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());

        // Forgetting lifts the ban
        registry.forget_device(&address);
        registry.process_advertisement(&[0x09, 0x09], &address, -70);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_devices_when_allowed() {
        let registry = registry();
        registry.set_unknown_device_support(true);
        let address = Address::new("AA:00:00:00:00:04");
        registry.process_advertisement(&[0x07, 0x07, 0x07], &address, -70);

        let device = registry.device(&address).unwrap();
        assert_eq!(device.kind(), crate::device::GENERIC_KIND);
        assert!(!registry.is_invalid(&address));
    }

    #[test]
    fn test_beacon_routes_to_ping_not_decode() {
        let registry = registry();
        let mut rx = registry.subscribe();
        let address = Address::new("AA:00:00:00:00:05");

        registry.process_advertisement(&[0x02, 0x01, 0x10, 0, 0, 0, 0], &address, -50);
        let device = registry.device(&address).unwrap();
        assert_eq!(device.field("temperature"), Some(FieldValue::Signed(0x10)));

        // Matches the thermometer tag and carries a different temperature byte,
        // but the manufacturer prefix at 5..7 makes it a beacon
        registry.process_advertisement(&[0x02, 0x01, 0x20, 0, 0, 0x4C, 0x00, 0x02, 0x15], &address, -45);

        assert_eq!(device.field("temperature"), Some(FieldValue::Signed(0x10)));
        assert_eq!(device.rssi(), Some(-45));
        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(RegistryEvent::Pinged(_))));
        assert!(!events.iter().any(|e| matches!(e, RegistryEvent::Updated(_))));
    }

    #[test]
    fn test_unknown_beacon_is_dropped_without_blacklisting() {
        let registry = registry();
        registry.set_unknown_device_support(true);
        let address = Address::new("AA:00:00:00:00:06");

        registry.process_advertisement(&[0x02, 0x01, 0, 0, 0, 0x4C, 0x00], &address, -80);
        assert!(registry.is_empty());
        assert!(!registry.is_invalid(&address));
    }

    #[test]
    fn test_short_buffer_is_not_a_beacon() {
        let registry = registry();
        let address = Address::new("AA:00:00:00:00:07");

        // Too short to hold the 5..7 window: classified as a normal advertisement
        registry.process_advertisement(&[0x02, 0x01, 0x03, 0x00, 0x4C, 0x00], &address, -60);
        let device = registry.device(&address).unwrap();
        assert_eq!(device.field("temperature"), Some(FieldValue::Signed(3)));

        // Truncated frame: the field keeps its value
        registry.process_advertisement(&[0x02, 0x01], &address, -61);
        assert_eq!(device.field("temperature"), Some(FieldValue::Signed(3)));
        assert_eq!(device.rssi(), Some(-61));
    }

    #[test]
    fn test_processing_disabled_ignores_advertisements() {
        let registry = registry();
        let address = Address::new("AA:00:00:00:00:08");
        registry.process_advertisement(&[0x02, 0x01, 0x01], &address, -60);
        let device = registry.device(&address).unwrap();

        device.set_processing_enabled(false);
        registry.process_advertisement(&[0x02, 0x01, 0x02], &address, -60);
        assert_eq!(device.field("temperature"), Some(FieldValue::Signed(1)));
    }

    #[test]
    fn test_inject_replaces_device() {
        let registry = registry();
        let address = Address::new("AA:00:00:00:00:09");
        let injected = SmartDevice::new(
            address.clone(),
            Arc::new(DeviceProfile::new("custom")),
            registry.transport().clone(),
        );
        registry.inject_device(injected.clone());

        registry.process_advertisement(&[0x02, 0x01, 0x01], &address, -60);
        let device = registry.device(&address).unwrap();
        assert!(Arc::ptr_eq(&device, &injected));
        assert_eq!(device.kind(), "custom");
    }

    struct RecordingStore {
        writes: tokio::sync::mpsc::UnboundedSender<(Address, std::thread::ThreadId)>,
    }

    impl DeviceStore for RecordingStore {
        fn write(&self, record: &DeviceRecord) -> Result<(), StoreError> {
            let _ = self.writes.send((record.address.clone(), std::thread::current().id()));
            Ok(())
        }

        fn load_all(&self) -> Result<Vec<DeviceRecord>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_store_write_leaves_dispatch_thread() {
        let registry = registry();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry.attach_store(Arc::new(RecordingStore { writes: tx })).unwrap();

        let address = Address::new("AA:00:00:00:00:0B");
        registry.process_advertisement(&[0x02, 0x01, 0x03], &address, -60);
        registry.process_advertisement(&[0x02, 0x01, 0x04], &address, -60);

        let (written, thread) = rx.recv().await.unwrap();
        assert_eq!(written, address);
        assert_ne!(thread, std::thread::current().id());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_store_written_on_first_discovery_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");

        let first = registry();
        first.attach_store(Arc::new(JsonFileStore::new(&path))).unwrap();
        let address = Address::new("AA:00:00:00:00:0A");
        first.process_advertisement(&[0x02, 0x01, 0x07], &address, -60);
        first.process_advertisement(&[0x02, 0x01, 0x08], &address, -60);

        // Only the first discovery is persisted
        let stored = JsonFileStore::new(&path).load_all().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].fields.get("temperature"), Some(&FieldValue::Signed(7)));

        let fresh = registry();
        let mut rx = fresh.subscribe();
        assert_eq!(fresh.attach_store(Arc::new(JsonFileStore::new(&path))).unwrap(), 1);
        let device = fresh.device(&address).unwrap();
        assert_eq!(device.kind(), "thermometer");
        assert_eq!(device.field("temperature"), Some(FieldValue::Signed(7)));
        assert!(matches!(drain(&mut rx)[..], [RegistryEvent::Discovered(_)]));
    }
}
