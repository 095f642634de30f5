//! Attribute actions: reads, writes and notification registration

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    Action, ActionError, ActionKind, NOTIFICATION_TIMEOUT, READ_TIMEOUT, WRITE_TIMEOUT, WaitError, await_gatt,
};
use crate::attribute::{AttributeRef, DescriptorRef};
use crate::device::{GattEvent, NotificationListener, SmartDevice};
use crate::transport::{GattStatus, NotifyMode, WriteType};

/// Fail fast unless the device is connected and exposes `attr`
fn require_attribute(device: &SmartDevice, attr: &AttributeRef) -> Result<(), ActionError> {
    if !device.is_connected() {
        return Err(ActionError::NotConnected);
    }
    device
        .resolve_attribute(attr)
        .map(|_| ())
        .ok_or(ActionError::AttributeNotFound)
}

/// Write one value and wait for its acknowledgement
async fn write_once(
    device: &SmartDevice,
    attr: &AttributeRef,
    value: Bytes,
    write_type: WriteType,
    timeout: Duration,
) -> Result<(), ActionError> {
    let mut events = device.gatt_events();
    let mut state = device.connection().subscribe();

    device
        .write_request(attr, value, write_type)
        .map_err(|_| ActionError::WriteFailed)?;

    let status = await_gatt(&mut events, &mut state, timeout, |event| match event {
        GattEvent::Write { attr: a, status } if a == attr => Some(*status),
        _ => None,
    })
    .await;

    match status {
        Ok(status) if status.is_success() => Ok(()),
        Ok(_) | Err(WaitError::TimedOut) => Err(ActionError::WriteFailed),
        Err(WaitError::Disconnected) => Err(ActionError::NotConnected),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Read
// ─────────────────────────────────────────────────────────────────────────────

/// Read an attribute into the device's attribute cache
pub struct ReadAttributeAction {
    attr: AttributeRef,
    timeout: Duration,
}

impl ReadAttributeAction {
    pub fn new(attr: AttributeRef) -> Self {
        Self {
            attr,
            timeout: READ_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Action for ReadAttributeAction {
    async fn execute(&self, device: &SmartDevice) -> Result<(), ActionError> {
        require_attribute(device, &self.attr)?;

        let mut events = device.gatt_events();
        let mut state = device.connection().subscribe();
        device.read_request(&self.attr).map_err(|_| ActionError::ReadFailed)?;

        let result = await_gatt(&mut events, &mut state, self.timeout, |event| match event {
            GattEvent::Read { attr, status, .. } if *attr == self.attr => Some(*status),
            _ => None,
        })
        .await;

        match result {
            Ok(status) if status.is_success() => Ok(()),
            Ok(status) => {
                tracing::debug!(address = %device.address(), attr = %self.attr, %status, "Read failed");
                Err(ActionError::ReadFailed)
            }
            Err(WaitError::TimedOut) => Err(ActionError::ReadFailed),
            Err(WaitError::Disconnected) => Err(ActionError::NotConnected),
        }
    }

    fn kind(&self) -> ActionKind {
        ActionKind::ReadAttribute
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Write
// ─────────────────────────────────────────────────────────────────────────────

/// Write a value to an attribute
pub struct WriteAttributeAction {
    attr: AttributeRef,
    value: Bytes,
    write_type: WriteType,
    timeout: Duration,
}

impl WriteAttributeAction {
    pub fn new(attr: AttributeRef, value: impl Into<Bytes>) -> Self {
        Self {
            attr,
            value: value.into(),
            write_type: WriteType::WithResponse,
            timeout: WRITE_TIMEOUT,
        }
    }

    pub fn write_type(mut self, write_type: WriteType) -> Self {
        self.write_type = write_type;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Action for WriteAttributeAction {
    async fn execute(&self, device: &SmartDevice) -> Result<(), ActionError> {
        require_attribute(device, &self.attr)?;
        write_once(device, &self.attr, self.value.clone(), self.write_type, self.timeout).await
    }

    fn kind(&self) -> ActionKind {
        ActionKind::WriteAttribute
    }
}

/// Write a payload in fixed-size chunks, one acknowledged write per chunk
///
/// With repeat enabled the whole payload is rewritten every time the action
/// comes round in the queue.
pub struct WriteAttributeChunkedAction {
    attr: AttributeRef,
    payload: Bytes,
    chunk_size: usize,
    repeat: bool,
    timeout: Duration,
}

impl WriteAttributeChunkedAction {
    pub fn new(attr: AttributeRef, payload: impl Into<Bytes>, chunk_size: usize) -> Self {
        Self {
            attr,
            payload: payload.into(),
            chunk_size: chunk_size.max(1),
            repeat: false,
            timeout: WRITE_TIMEOUT,
        }
    }

    pub fn enable_repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The payload split at chunk boundaries
    pub fn chunks(&self) -> Vec<Bytes> {
        (0..self.payload.len())
            .step_by(self.chunk_size)
            .map(|start| {
                let end = (start + self.chunk_size).min(self.payload.len());
                self.payload.slice(start..end)
            })
            .collect()
    }
}

#[async_trait]
impl Action for WriteAttributeChunkedAction {
    async fn execute(&self, device: &SmartDevice) -> Result<(), ActionError> {
        require_attribute(device, &self.attr)?;

        for (i, chunk) in self.chunks().into_iter().enumerate() {
            if !device.is_connected() {
                tracing::debug!(address = %device.address(), chunk = i, "Link lost mid-sequence");
                return Err(ActionError::NotConnected);
            }
            write_once(device, &self.attr, chunk, WriteType::WithResponse, self.timeout).await?;
        }
        Ok(())
    }

    fn kind(&self) -> ActionKind {
        ActionKind::WriteAttributeChunked
    }

    fn is_repeating(&self) -> bool {
        self.repeat
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notifications
// ─────────────────────────────────────────────────────────────────────────────

/// Turn value notifications for an attribute on or off
///
/// A listener given here is attached to the device, keyed by attribute, and
/// keeps receiving values after the action is gone. Registering again
/// replaces it; disabling removes it.
pub struct RegisterNotificationAction {
    attr: AttributeRef,
    mode: NotifyMode,
    listener: Option<NotificationListener>,
    timeout: Duration,
}

impl RegisterNotificationAction {
    pub fn new(attr: AttributeRef, mode: NotifyMode) -> Self {
        Self {
            attr,
            mode,
            listener: None,
            timeout: NOTIFICATION_TIMEOUT,
        }
    }

    pub fn enable(attr: AttributeRef) -> Self {
        Self::new(attr, NotifyMode::Notify)
    }

    pub fn disable(attr: AttributeRef) -> Self {
        Self::new(attr, NotifyMode::Disabled)
    }

    pub fn with_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&AttributeRef, &Bytes) + Send + Sync + 'static,
    {
        self.listener = Some(std::sync::Arc::new(listener));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Action for RegisterNotificationAction {
    async fn execute(&self, device: &SmartDevice) -> Result<(), ActionError> {
        require_attribute(device, &self.attr)?;
        let descriptor = DescriptorRef::client_config(self.attr);

        device
            .subscribe_request(&self.attr, self.mode)
            .map_err(|_| ActionError::NotificationRegistrationFailed)?;

        let mut events = device.gatt_events();
        let mut state = device.connection().subscribe();
        device
            .write_descriptor_request(&descriptor, Bytes::copy_from_slice(&self.mode.descriptor_value()))
            .map_err(|_| ActionError::NotificationRegistrationFailed)?;

        let result = await_gatt(&mut events, &mut state, self.timeout, |event| match event {
            GattEvent::DescriptorWrite { descriptor: d, status } if *d == descriptor => Some(*status),
            _ => None,
        })
        .await;

        match result {
            Ok(status) if status.is_success() => {
                match (self.mode, &self.listener) {
                    (NotifyMode::Disabled, _) => {
                        device.clear_notification_listener(&self.attr);
                    }
                    (_, Some(listener)) => device.set_notification_listener(self.attr, listener.clone()),
                    (_, None) => {}
                }
                Ok(())
            }
            Ok(GattStatus(code)) => {
                tracing::debug!(address = %device.address(), attr = %self.attr, code, "Descriptor write failed");
                Err(ActionError::NotificationRegistrationFailed)
            }
            Err(WaitError::TimedOut) => Err(ActionError::NotificationRegistrationFailed),
            Err(WaitError::Disconnected) => Err(ActionError::NotConnected),
        }
    }

    fn kind(&self) -> ActionKind {
        ActionKind::RegisterNotification
    }
}
