//! Smart Devices
//!
//! A [`SmartDevice`] is the live object behind one peripheral address. It
//! decodes the peripheral's advertisements into named fields, owns the
//! connection state machine and attribute cache, and hosts the per-device
//! action scheduler.

mod profile;

pub use profile::{DEFAULT_AD_FREQUENCY, DeviceProfile, GENERIC_KIND, MatchRule};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::action::Action;
use crate::address::Address;
use crate::attribute::{AttributeCatalog, AttributeHandle, AttributeRef, DescriptorRef};
use crate::connection::{ConnectionState, ConnectionTracker, LinkEvent};
use crate::decoder::FieldValue;
use crate::error::Result;
use crate::scheduler::{ActionScheduler, SchedulerConfig};
use crate::store::DeviceRecord;
use crate::transport::{
    ConnectionHandle, GattStatus, NotifyMode, Transport, TransportCallbacks, TransportError, WriteType,
};

const EVENT_CAPACITY: usize = 64;

/// A device is still visible this many advertisement periods after the last one
const VISIBILITY_PERIODS: u32 = 8;

/// Listener for pushed attribute values
pub type NotificationListener = Arc<dyn Fn(&AttributeRef, &Bytes) + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

/// Device notifications for UI and persistence collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Advertisement { rssi: i16 },
    Beacon { rssi: i16 },
    Connected,
    Disconnected,
    ConnectionFailed,
    AttributeRead { attr: AttributeRef, value: Bytes },
    AttributeNotify { attr: AttributeRef, value: Bytes },
}

/// Completions of attribute requests, consumed by in-flight actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    Read {
        attr: AttributeRef,
        value: Bytes,
        status: GattStatus,
    },
    Write {
        attr: AttributeRef,
        status: GattStatus,
    },
    DescriptorWrite {
        descriptor: DescriptorRef,
        status: GattStatus,
    },
}

#[derive(Debug, Default)]
struct DeviceState {
    name: Option<String>,
    rssi: Option<i16>,
    last_seen: Option<Instant>,
    last_advertisement: Option<DateTime<Utc>>,
    fields: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Clone, Default)]
struct CachedAttribute {
    label: Option<String>,
    handle: Option<AttributeHandle>,
    value: Option<Bytes>,
}

// ─────────────────────────────────────────────────────────────────────────────
// SmartDevice
// ─────────────────────────────────────────────────────────────────────────────

/// The live object for one peripheral
pub struct SmartDevice {
    me: Weak<SmartDevice>,
    address: Address,
    profile: Arc<DeviceProfile>,
    transport: Arc<dyn Transport>,
    state: RwLock<DeviceState>,
    attributes: RwLock<HashMap<AttributeRef, CachedAttribute>>,
    catalog: RwLock<Option<AttributeCatalog>>,
    listeners: RwLock<HashMap<AttributeRef, NotificationListener>>,
    connection: ConnectionTracker,
    link: Mutex<Option<ConnectionHandle>>,
    generation: AtomicU64,
    processing: AtomicBool,
    events: broadcast::Sender<DeviceEvent>,
    gatt: broadcast::Sender<GattEvent>,
    scheduler: OnceLock<ActionScheduler>,
}

impl SmartDevice {
    /// Create a new device for `address` described by `profile`
    pub fn new(address: impl Into<Address>, profile: Arc<DeviceProfile>, transport: Arc<dyn Transport>) -> Arc<Self> {
        let attributes = profile
            .attributes()
            .iter()
            .map(|(label, attr)| {
                (
                    *attr,
                    CachedAttribute {
                        label: Some(label.clone()),
                        ..Default::default()
                    },
                )
            })
            .collect();
        let name = profile.name().map(str::to_string);

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            address: address.into(),
            profile,
            transport,
            state: RwLock::new(DeviceState {
                name,
                ..Default::default()
            }),
            attributes: RwLock::new(attributes),
            catalog: RwLock::new(None),
            listeners: RwLock::new(HashMap::new()),
            connection: ConnectionTracker::new(),
            link: Mutex::new(None),
            generation: AtomicU64::new(0),
            processing: AtomicBool::new(true),
            events: broadcast::channel(EVENT_CAPACITY).0,
            gatt: broadcast::channel(EVENT_CAPACITY).0,
            scheduler: OnceLock::new(),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn kind(&self) -> &str {
        self.profile.kind()
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn name(&self) -> Option<String> {
        self.state.read().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.state.write().name = Some(name.into());
    }

    pub fn rssi(&self) -> Option<i16> {
        self.state.read().rssi
    }

    pub fn last_advertisement(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_advertisement
    }

    /// Current value of a decoded field
    pub fn field(&self, slot: &str) -> Option<FieldValue> {
        self.state.read().fields.get(slot).cloned()
    }

    pub fn fields(&self) -> BTreeMap<String, FieldValue> {
        self.state.read().fields.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub fn gatt_events(&self) -> broadcast::Receiver<GattEvent> {
        self.gatt.subscribe()
    }

    fn emit(&self, event: DeviceEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Advertisements
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_processing_enabled(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Ignore advertisements while disabled
    pub fn set_processing_enabled(&self, enabled: bool) {
        self.processing.store(enabled, Ordering::Release);
    }

    /// Decode a standard advertisement into the device's fields
    ///
    /// A field that fails to decode keeps its previous value.
    pub fn on_advertisement(&self, data: &[u8], rssi: i16) {
        {
            let mut state = self.state.write();
            state.rssi = Some(rssi);
            state.last_seen = Some(Instant::now());
            state.last_advertisement = Some(Utc::now());

            for field in self.profile.fields() {
                match field.decode(data) {
                    Ok(value) => {
                        state.fields.insert(field.slot.clone(), value);
                    }
                    Err(e) => {
                        tracing::trace!(address = %self.address, slot = %field.slot, error = %e, "Field skipped");
                    }
                }
            }
        }
        self.emit(DeviceEvent::Advertisement { rssi });
    }

    /// Refresh liveness from a beacon frame without decoding it
    pub fn on_beacon(&self, rssi: i16) {
        {
            let mut state = self.state.write();
            state.rssi = Some(rssi);
            state.last_seen = Some(Instant::now());
            state.last_advertisement = Some(Utc::now());
        }
        self.emit(DeviceEvent::Beacon { rssi });
    }

    /// Connected, connecting, or heard from recently
    pub fn is_visible(&self) -> bool {
        if matches!(
            self.connection.state(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return true;
        }
        let window = self.profile.frequency() * VISIBILITY_PERIODS;
        self.state
            .read()
            .last_seen
            .map(|seen| seen.elapsed() < window)
            .unwrap_or(false)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Records
    // ─────────────────────────────────────────────────────────────────────────

    /// Snapshot for persistence
    pub fn record(&self) -> DeviceRecord {
        let state = self.state.read();
        DeviceRecord {
            address: self.address.clone(),
            kind: self.kind().to_string(),
            name: state.name.clone(),
            last_advertisement: state.last_advertisement,
            state: self.connection.state(),
            fields: state.fields.clone(),
        }
    }

    /// Restore persisted fields; the connection state is not restored
    pub fn restore(&self, record: &DeviceRecord) {
        let mut state = self.state.write();
        if record.name.is_some() {
            state.name = record.name.clone();
        }
        state.last_advertisement = record.last_advertisement;
        state.fields = record.fields.clone();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduling
    // ─────────────────────────────────────────────────────────────────────────

    /// Create this device's scheduler; must run inside a Tokio runtime
    ///
    /// Later calls return the existing scheduler and ignore `config`.
    pub fn prepare_scheduler(&self, config: SchedulerConfig) -> Result<&ActionScheduler> {
        if let Some(scheduler) = self.scheduler.get() {
            return Ok(scheduler);
        }
        let scheduler = ActionScheduler::new(self.me.clone(), self.address.clone(), config)?;
        // A racing caller may have won; its scheduler is kept and ours is closed on drop
        Ok(self.scheduler.get_or_init(|| scheduler))
    }

    pub fn scheduler(&self) -> Option<&ActionScheduler> {
        self.scheduler.get()
    }

    /// Queue an action; false if there is no scheduler or the queue is full
    pub fn submit<A: Action + 'static>(&self, action: A) -> bool {
        match self.scheduler.get() {
            Some(scheduler) => scheduler.submit(Arc::new(action)),
            None => {
                tracing::warn!(address = %self.address, "No scheduler prepared; action dropped");
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connection
    // ─────────────────────────────────────────────────────────────────────────

    pub fn connection(&self) -> &ConnectionTracker {
        &self.connection
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Ask the transport for a link; the outcome arrives asynchronously
    ///
    /// Returns immediately without a new request if a connect is already
    /// underway or established.
    pub fn request_connect(&self, auto_reconnect: bool) -> std::result::Result<(), TransportError> {
        let mut link = self.link.lock();
        if !self.connection.begin_connect() {
            return Ok(());
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let callbacks = Arc::new(LinkCallbacks {
            device: self.me.clone(),
            generation,
        });

        tracing::info!(address = %self.address, "Connecting");
        match self.transport.connect(&self.address, auto_reconnect, callbacks) {
            Ok(handle) => {
                *link = Some(handle);
                Ok(())
            }
            Err(e) => {
                drop(link);
                self.on_link_state(ConnectionState::Disconnected, GattStatus::ERROR);
                Err(e)
            }
        }
    }

    /// Ask the transport to drop the link
    pub fn request_disconnect(&self) -> std::result::Result<(), TransportError> {
        let handle = (*self.link.lock()).ok_or(TransportError::NotConnected)?;
        self.connection.begin_disconnect();
        tracing::info!(address = %self.address, "Disconnecting");
        if let Err(e) = self.transport.disconnect(handle) {
            // The link is already gone; settle the state machine ourselves
            self.on_link_state(ConnectionState::Disconnected, GattStatus::ERROR);
            return Err(e);
        }
        Ok(())
    }

    /// Fire-and-forget disconnect
    pub fn disconnect(&self) {
        if let Err(e) = self.request_disconnect() {
            tracing::debug!(address = %self.address, error = %e, "Disconnect ignored");
        }
    }

    fn current_link(&self) -> std::result::Result<ConnectionHandle, TransportError> {
        (*self.link.lock()).ok_or(TransportError::NotConnected)
    }

    fn on_link_state(&self, reported: ConnectionState, status: GattStatus) {
        match self.connection.on_transport_state(reported, status) {
            LinkEvent::LinkUp => {
                if self.profile.is_discovery_bypassed() || self.catalog.read().is_some() {
                    self.finish_connect();
                    return;
                }
                let discovery = self
                    .current_link()
                    .and_then(|handle| self.transport.discover_attributes(handle));
                if let Err(e) = discovery {
                    tracing::warn!(address = %self.address, error = %e, "Attribute discovery could not start");
                    self.disconnect();
                }
            }
            LinkEvent::Failed => {
                self.link.lock().take();
                tracing::info!(address = %self.address, %status, "Connection failed");
                self.emit(DeviceEvent::ConnectionFailed);
            }
            LinkEvent::Closed => {
                self.link.lock().take();
                tracing::info!(address = %self.address, "Disconnected");
                self.emit(DeviceEvent::Disconnected);
            }
            LinkEvent::Established | LinkEvent::Unchanged => {}
        }
    }

    fn finish_connect(&self) {
        if self.connection.establish() == LinkEvent::Established {
            tracing::info!(address = %self.address, "Connected");
            self.emit(DeviceEvent::Connected);
            if let Some(scheduler) = self.scheduler.get() {
                scheduler.wake();
            }
        }
    }

    fn on_discovered(&self, catalog: AttributeCatalog, status: GattStatus) {
        if !status.is_success() {
            tracing::warn!(address = %self.address, %status, "Attribute discovery failed");
            self.disconnect();
            return;
        }

        tracing::debug!(address = %self.address, attributes = catalog.len(), "Attributes discovered");
        {
            let mut cache = self.attributes.write();
            for (attr, handle) in catalog.iter() {
                cache.entry(*attr).or_default().handle = Some(*handle);
            }
        }
        *self.catalog.write() = Some(catalog);
        self.finish_connect();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Attributes
    // ─────────────────────────────────────────────────────────────────────────

    /// Handle for `attr`, resolving and caching it if needed
    pub fn resolve_attribute(&self, attr: &AttributeRef) -> Option<AttributeHandle> {
        if let Some(handle) = self.attributes.read().get(attr).and_then(|c| c.handle) {
            return Some(handle);
        }

        let handle = if self.profile.is_discovery_bypassed() {
            self.profile
                .attributes()
                .iter()
                .position(|(_, a)| a == attr)
                .map(|i| AttributeHandle(i as u16 + 1))
        } else {
            let link = self.current_link().ok()?;
            self.transport.lookup_attribute(link, attr)
        }?;

        self.attributes.write().entry(*attr).or_default().handle = Some(handle);
        Some(handle)
    }

    /// Attribute registered under `label` by the profile
    pub fn attribute_by_label(&self, label: &str) -> Option<AttributeRef> {
        self.profile
            .attributes()
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, attr)| *attr)
    }

    /// Last value read or pushed for `attr`
    pub fn attribute_value(&self, attr: &AttributeRef) -> Option<Bytes> {
        self.attributes.read().get(attr).and_then(|c| c.value.clone())
    }

    pub fn attribute_label(&self, attr: &AttributeRef) -> Option<String> {
        self.attributes.read().get(attr).and_then(|c| c.label.clone())
    }

    /// Route pushed values of `attr` to `listener`, replacing any previous one
    pub fn set_notification_listener(&self, attr: AttributeRef, listener: NotificationListener) {
        self.listeners.write().insert(attr, listener);
    }

    pub fn clear_notification_listener(&self, attr: &AttributeRef) -> bool {
        self.listeners.write().remove(attr).is_some()
    }

    pub fn has_notification_listener(&self, attr: &AttributeRef) -> bool {
        self.listeners.read().contains_key(attr)
    }

    pub fn read_request(&self, attr: &AttributeRef) -> std::result::Result<(), TransportError> {
        self.transport.read_attribute(self.current_link()?, attr)
    }

    pub fn write_request(
        &self,
        attr: &AttributeRef,
        value: Bytes,
        write_type: WriteType,
    ) -> std::result::Result<(), TransportError> {
        self.transport.write_attribute(self.current_link()?, attr, value, write_type)
    }

    pub fn write_descriptor_request(
        &self,
        descriptor: &DescriptorRef,
        value: Bytes,
    ) -> std::result::Result<(), TransportError> {
        self.transport.write_descriptor(self.current_link()?, descriptor, value)
    }

    pub fn subscribe_request(&self, attr: &AttributeRef, mode: NotifyMode) -> std::result::Result<(), TransportError> {
        self.transport.subscribe_notifications(self.current_link()?, attr, mode)
    }

    fn store_value(&self, attr: AttributeRef, value: &Bytes) {
        self.attributes.write().entry(attr).or_default().value = Some(value.clone());
    }

    fn on_read(&self, attr: AttributeRef, value: Bytes, status: GattStatus) {
        if status.is_success() {
            self.store_value(attr, &value);
            self.emit(DeviceEvent::AttributeRead {
                attr,
                value: value.clone(),
            });
        }
        let _ = self.gatt.send(GattEvent::Read { attr, value, status });
    }

    fn on_notify(&self, attr: AttributeRef, value: Bytes) {
        self.store_value(attr, &value);
        let listener = self.listeners.read().get(&attr).cloned();
        if let Some(listener) = listener {
            listener(&attr, &value);
        }
        self.emit(DeviceEvent::AttributeNotify { attr, value });
    }
}

impl std::fmt::Debug for SmartDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartDevice")
            .field("address", &self.address)
            .field("kind", &self.kind())
            .field("state", &self.connection.state())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport Callbacks
// ─────────────────────────────────────────────────────────────────────────────

/// Routes completions of one connection attempt back to its device
///
/// Completions from an earlier attempt are dropped.
struct LinkCallbacks {
    device: Weak<SmartDevice>,
    generation: u64,
}

impl LinkCallbacks {
    fn device(&self) -> Option<Arc<SmartDevice>> {
        let device = self.device.upgrade()?;
        (device.generation.load(Ordering::Acquire) == self.generation).then_some(device)
    }
}

impl TransportCallbacks for LinkCallbacks {
    fn on_state_change(&self, state: ConnectionState, status: GattStatus) {
        if let Some(device) = self.device() {
            device.on_link_state(state, status);
        }
    }

    fn on_discovered(&self, catalog: AttributeCatalog, status: GattStatus) {
        if let Some(device) = self.device() {
            device.on_discovered(catalog, status);
        }
    }

    fn on_read(&self, attr: AttributeRef, value: Bytes, status: GattStatus) {
        if let Some(device) = self.device() {
            device.on_read(attr, value, status);
        }
    }

    fn on_write(&self, attr: AttributeRef, status: GattStatus) {
        if let Some(device) = self.device() {
            let _ = device.gatt.send(GattEvent::Write { attr, status });
        }
    }

    fn on_descriptor_write(&self, descriptor: DescriptorRef, status: GattStatus) {
        if let Some(device) = self.device() {
            let _ = device.gatt.send(GattEvent::DescriptorWrite { descriptor, status });
        }
    }

    fn on_notify(&self, attr: AttributeRef, value: Bytes) {
        if let Some(device) = self.device() {
            device.on_notify(attr, value);
        }
    }
}
