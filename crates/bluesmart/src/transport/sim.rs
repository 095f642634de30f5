//! In-memory radio
//!
//! Peripherals are registered up front with their attribute tables. Every
//! completion is delivered from a spawned Tokio task after a fixed latency, so
//! callers must issue requests from inside a runtime.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    BondState, ConnectionHandle, GattStatus, NotifyMode, ScanMode, ScanResult, Transport,
    TransportCallbacks, TransportError, WriteType,
};
use crate::address::Address;
use crate::attribute::{AttributeCatalog, AttributeHandle, AttributeRef, DescriptorRef};
use crate::connection::ConnectionState;

/// Default completion latency
const DEFAULT_LATENCY: Duration = Duration::from_millis(5);

/// A simulated peripheral
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    attributes: BTreeMap<AttributeRef, Bytes>,
    connectable: bool,
    bondable: bool,
    fail_reads: bool,
    fail_writes: bool,
}

impl Default for SimPeripheral {
    fn default() -> Self {
        Self {
            attributes: BTreeMap::new(),
            connectable: true,
            bondable: true,
            fail_reads: false,
            fail_writes: false,
        }
    }
}

impl SimPeripheral {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, attr: AttributeRef, value: impl Into<Bytes>) -> Self {
        self.attributes.insert(attr, value.into());
        self
    }

    /// Connection attempts fail
    pub fn unreachable(mut self) -> Self {
        self.connectable = false;
        self
    }

    pub fn refusing_bond(mut self) -> Self {
        self.bondable = false;
        self
    }

    pub fn failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    fn handle_of(&self, attr: &AttributeRef) -> Option<AttributeHandle> {
        self.attributes
            .keys()
            .position(|a| a == attr)
            .map(|i| AttributeHandle(i as u16 + 1))
    }
}

/// A request observed by the simulator, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOp {
    Connect(Address),
    Disconnect(Address),
    Discover(Address),
    Read(AttributeRef),
    Write(AttributeRef, Vec<u8>),
    WriteDescriptor(DescriptorRef, Vec<u8>),
    Subscribe(AttributeRef, NotifyMode),
    CreateBond(Address),
    RemoveBond(Address),
}

struct Link {
    address: Address,
    callbacks: Arc<dyn TransportCallbacks>,
    subscriptions: HashSet<AttributeRef>,
}

struct SimInner {
    peripherals: DashMap<Address, SimPeripheral>,
    links: DashMap<ConnectionHandle, Link>,
    bonds: DashMap<Address, BondState>,
    next_handle: AtomicU64,
    latency: Duration,
    scan_sink: Mutex<Option<mpsc::Sender<ScanResult>>>,
    ops: Mutex<Vec<SimOp>>,
}

/// Simulated radio shared by clones
#[derive(Clone)]
pub struct SimulatedTransport {
    inner: Arc<SimInner>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    /// Create a new simulated transport with no peripherals
    pub fn new() -> Self {
        Self::with_latency(DEFAULT_LATENCY)
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            inner: Arc::new(SimInner {
                peripherals: DashMap::new(),
                links: DashMap::new(),
                bonds: DashMap::new(),
                next_handle: AtomicU64::new(1),
                latency,
                scan_sink: Mutex::new(None),
                ops: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn add_peripheral(&self, address: impl Into<Address>, peripheral: SimPeripheral) {
        self.inner.peripherals.insert(address.into(), peripheral);
    }

    /// Push an advertisement to the active scan, if any
    pub fn advertise(&self, address: impl Into<Address>, rssi: i16, data: impl Into<Bytes>) -> bool {
        let sink = self.inner.scan_sink.lock().clone();
        match sink {
            Some(tx) => tx
                .try_send(ScanResult {
                    address: address.into(),
                    rssi,
                    data: data.into(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Push an advertisement, waiting for room in the scan buffer
    pub async fn deliver_advertisement(&self, result: ScanResult) -> bool {
        let sink = self.inner.scan_sink.lock().clone();
        match sink {
            Some(tx) => tx.send(result).await.is_ok(),
            None => false,
        }
    }

    /// Peripheral-side value change, pushed to subscribed links
    pub fn notify(&self, address: impl Into<Address>, attr: AttributeRef, value: impl Into<Bytes>) {
        let address = address.into();
        let value = value.into();
        if let Some(mut p) = self.inner.peripherals.get_mut(&address) {
            p.attributes.insert(attr, value.clone());
        }
        for link in self.inner.links.iter() {
            if link.address == address && link.subscriptions.contains(&attr) {
                let callbacks = link.callbacks.clone();
                let value = value.clone();
                self.deliver(move || callbacks.on_notify(attr, value));
            }
        }
    }

    /// Peripheral walks out of range
    pub fn drop_link(&self, address: impl Into<Address>) {
        let address = address.into();
        let handles: Vec<ConnectionHandle> = self
            .inner
            .links
            .iter()
            .filter(|l| l.address == address)
            .map(|l| *l.key())
            .collect();
        for handle in handles {
            if let Some((_, link)) = self.inner.links.remove(&handle) {
                let callbacks = link.callbacks;
                self.deliver(move || callbacks.on_state_change(ConnectionState::Disconnected, GattStatus::ERROR));
            }
        }
    }

    pub fn operations(&self) -> Vec<SimOp> {
        self.inner.ops.lock().clone()
    }

    pub fn attribute_value(&self, address: &Address, attr: &AttributeRef) -> Option<Bytes> {
        self.inner
            .peripherals
            .get(address)
            .and_then(|p| p.attributes.get(attr).cloned())
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scan_sink.lock().is_some()
    }

    fn record(&self, op: SimOp) {
        self.inner.ops.lock().push(op);
    }

    fn deliver<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let latency = self.inner.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            f();
        });
    }

    /// Callbacks and peripheral address of an open link
    fn link(&self, handle: ConnectionHandle) -> Result<(Address, Arc<dyn TransportCallbacks>), TransportError> {
        self.inner
            .links
            .get(&handle)
            .map(|l| (l.address.clone(), l.callbacks.clone()))
            .ok_or(TransportError::NotConnected)
    }

    fn peripheral(&self, address: &Address) -> Result<SimPeripheral, TransportError> {
        self.inner
            .peripherals
            .get(address)
            .map(|p| p.clone())
            .ok_or_else(|| TransportError::UnknownPeripheral(address.clone()))
    }
}

impl Transport for SimulatedTransport {
    fn connect(
        &self,
        address: &Address,
        _auto_reconnect: bool,
        callbacks: Arc<dyn TransportCallbacks>,
    ) -> Result<ConnectionHandle, TransportError> {
        self.record(SimOp::Connect(address.clone()));
        let handle = ConnectionHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));

        let reachable = self
            .inner
            .peripherals
            .get(address)
            .map(|p| p.connectable)
            .unwrap_or(false);

        if reachable {
            self.inner.links.insert(
                handle,
                Link {
                    address: address.clone(),
                    callbacks: callbacks.clone(),
                    subscriptions: HashSet::new(),
                },
            );
            self.deliver(move || callbacks.on_state_change(ConnectionState::Connected, GattStatus::SUCCESS));
        } else {
            self.deliver(move || callbacks.on_state_change(ConnectionState::Disconnected, GattStatus::ERROR));
        }

        Ok(handle)
    }

    fn disconnect(&self, handle: ConnectionHandle) -> Result<(), TransportError> {
        let (_, link) = self.inner.links.remove(&handle).ok_or(TransportError::NotConnected)?;
        self.record(SimOp::Disconnect(link.address));
        let callbacks = link.callbacks;
        self.deliver(move || callbacks.on_state_change(ConnectionState::Disconnected, GattStatus::SUCCESS));
        Ok(())
    }

    fn discover_attributes(&self, handle: ConnectionHandle) -> Result<(), TransportError> {
        let (address, callbacks) = self.link(handle)?;
        self.record(SimOp::Discover(address.clone()));
        let peripheral = self.peripheral(&address)?;
        let catalog: AttributeCatalog = peripheral
            .attributes
            .keys()
            .enumerate()
            .map(|(i, attr)| (*attr, AttributeHandle(i as u16 + 1)))
            .collect();
        self.deliver(move || callbacks.on_discovered(catalog, GattStatus::SUCCESS));
        Ok(())
    }

    fn lookup_attribute(&self, handle: ConnectionHandle, attr: &AttributeRef) -> Option<AttributeHandle> {
        let (address, _) = self.link(handle).ok()?;
        self.inner.peripherals.get(&address)?.handle_of(attr)
    }

    fn read_attribute(&self, handle: ConnectionHandle, attr: &AttributeRef) -> Result<(), TransportError> {
        let (address, callbacks) = self.link(handle)?;
        self.record(SimOp::Read(*attr));
        let peripheral = self.peripheral(&address)?;
        let attr = *attr;
        let (value, status) = match peripheral.attributes.get(&attr) {
            Some(v) if !peripheral.fail_reads => (v.clone(), GattStatus::SUCCESS),
            _ => (Bytes::new(), GattStatus::ERROR),
        };
        self.deliver(move || callbacks.on_read(attr, value, status));
        Ok(())
    }

    fn write_attribute(
        &self,
        handle: ConnectionHandle,
        attr: &AttributeRef,
        value: Bytes,
        _write_type: WriteType,
    ) -> Result<(), TransportError> {
        let (address, callbacks) = self.link(handle)?;
        self.record(SimOp::Write(*attr, value.to_vec()));
        let attr = *attr;
        let status = match self.inner.peripherals.get_mut(&address) {
            Some(mut p) if !p.fail_writes && p.attributes.contains_key(&attr) => {
                p.attributes.insert(attr, value);
                GattStatus::SUCCESS
            }
            _ => GattStatus::ERROR,
        };
        self.deliver(move || callbacks.on_write(attr, status));
        Ok(())
    }

    fn write_descriptor(
        &self,
        handle: ConnectionHandle,
        descriptor: &DescriptorRef,
        value: Bytes,
    ) -> Result<(), TransportError> {
        let (address, callbacks) = self.link(handle)?;
        self.record(SimOp::WriteDescriptor(*descriptor, value.to_vec()));
        let peripheral = self.peripheral(&address)?;
        let status = if !peripheral.fail_writes && peripheral.attributes.contains_key(&descriptor.attribute) {
            GattStatus::SUCCESS
        } else {
            GattStatus::ERROR
        };
        let descriptor = *descriptor;
        self.deliver(move || callbacks.on_descriptor_write(descriptor, status));
        Ok(())
    }

    fn subscribe_notifications(
        &self,
        handle: ConnectionHandle,
        attr: &AttributeRef,
        mode: NotifyMode,
    ) -> Result<(), TransportError> {
        self.record(SimOp::Subscribe(*attr, mode));
        let mut link = self.inner.links.get_mut(&handle).ok_or(TransportError::NotConnected)?;
        match mode {
            NotifyMode::Disabled => link.subscriptions.remove(attr),
            NotifyMode::Notify | NotifyMode::Indicate => link.subscriptions.insert(*attr),
        };
        Ok(())
    }

    fn bond_state(&self, address: &Address) -> BondState {
        self.inner
            .bonds
            .get(address)
            .map(|b| *b)
            .unwrap_or(BondState::None)
    }

    fn create_bond(&self, address: &Address) -> bool {
        self.record(SimOp::CreateBond(address.clone()));
        let bondable = self
            .inner
            .peripherals
            .get(address)
            .map(|p| p.bondable)
            .unwrap_or(false);
        if bondable {
            self.inner.bonds.insert(address.clone(), BondState::Bonded);
        }
        bondable
    }

    fn remove_bond(&self, address: &Address) -> bool {
        self.record(SimOp::RemoveBond(address.clone()));
        self.inner.bonds.remove(address).is_some()
    }

    fn start_scan(&self, mode: ScanMode, sink: mpsc::Sender<ScanResult>) -> Result<(), TransportError> {
        tracing::debug!(?mode, "Simulated scan started");
        *self.inner.scan_sink.lock() = Some(sink);
        Ok(())
    }

    fn stop_scan(&self) {
        self.inner.scan_sink.lock().take();
    }
}
