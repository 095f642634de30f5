//! Actions
//!
//! An [`Action`] is one schedulable protocol exchange with a device. The
//! device's scheduler runs them one at a time; each variant bounds its own
//! waits so that no action can park the scheduler forever.

mod attribute;
mod link;

pub use attribute::{
    ReadAttributeAction, RegisterNotificationAction, WriteAttributeAction, WriteAttributeChunkedAction,
};
pub use link::{BondAction, ConnectAction, DelayAction, DisconnectAction, UnbondAction};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::connection::ConnectionState;
use crate::device::{GattEvent, SmartDevice};

/// Connect waits this long for the link to come up
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Read waits this long for the value
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Each write (or write chunk) waits this long for its acknowledgement
pub const WRITE_TIMEOUT: Duration = Duration::from_millis(300);
/// Notification registration waits this long for the descriptor write
pub const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(3);

// ─────────────────────────────────────────────────────────────────────────────
// Errors and Kinds
// ─────────────────────────────────────────────────────────────────────────────

/// Why an action failed
///
/// Recovery is the scheduler's job; the error only says what went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ActionError {
    #[error("Device is not connected")]
    NotConnected,

    #[error("Attribute not found on device")]
    AttributeNotFound,

    #[error("Attribute write failed")]
    WriteFailed,

    #[error("Attribute read failed")]
    ReadFailed,

    #[error("Connection attempt failed")]
    ConnectFailed,

    #[error("Bond state change failed")]
    BondFailed,

    #[error("Notification registration failed")]
    NotificationRegistrationFailed,
}

/// Variant tag of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Connect,
    Disconnect,
    Bond,
    Unbond,
    Delay,
    ReadAttribute,
    WriteAttribute,
    WriteAttributeChunked,
    RegisterNotification,
    /// Application-defined action
    Custom(&'static str),
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Custom(name) => f.write_str(name),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Callback invoked after an action finished, with its kind and outcome
pub type CompletionCallback = Arc<dyn Fn(ActionKind, bool) + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Action Trait
// ─────────────────────────────────────────────────────────────────────────────

/// One unit of work for a device's scheduler
///
/// Actions are queued as `Arc<dyn Action>`; identity is pointer identity, so
/// a repeating action is the same object every time it runs.
#[async_trait]
pub trait Action: Send + Sync {
    async fn execute(&self, device: &SmartDevice) -> Result<(), ActionError>;

    fn kind(&self) -> ActionKind;

    /// Skip interval pacing after this action
    fn no_delay(&self) -> bool {
        false
    }

    /// Stay in the queue after running
    fn is_repeating(&self) -> bool {
        false
    }

    /// Failures are logged and skipped instead of going to the error handlers
    fn can_fail(&self) -> bool {
        false
    }

    /// Called by the scheduler once `execute` returned
    fn on_complete(&self, _success: bool) {}
}

/// Builder-style decoration of any action
pub trait ActionExt: Action + Sized {
    /// Let failures of this action pass without error handling
    fn allow_failure(self) -> Decorated<Self> {
        Decorated::new(self).allow_failure()
    }

    fn on_complete_with<F>(self, callback: F) -> Decorated<Self>
    where
        F: Fn(ActionKind, bool) + Send + Sync + 'static,
    {
        Decorated::new(self).on_complete_with(callback)
    }
}

impl<A: Action + Sized> ActionExt for A {}

/// An action with failure tolerance and/or a completion callback attached
pub struct Decorated<A> {
    inner: A,
    can_fail: bool,
    callback: Option<CompletionCallback>,
}

impl<A: Action> Decorated<A> {
    fn new(inner: A) -> Self {
        Self {
            inner,
            can_fail: false,
            callback: None,
        }
    }

    pub fn allow_failure(mut self) -> Self {
        self.can_fail = true;
        self
    }

    pub fn on_complete_with<F>(mut self, callback: F) -> Self
    where
        F: Fn(ActionKind, bool) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }
}

#[async_trait]
impl<A: Action> Action for Decorated<A> {
    async fn execute(&self, device: &SmartDevice) -> Result<(), ActionError> {
        self.inner.execute(device).await
    }

    fn kind(&self) -> ActionKind {
        self.inner.kind()
    }

    fn no_delay(&self) -> bool {
        self.inner.no_delay()
    }

    fn is_repeating(&self) -> bool {
        self.inner.is_repeating()
    }

    fn can_fail(&self) -> bool {
        self.can_fail || self.inner.can_fail()
    }

    fn on_complete(&self, success: bool) {
        self.inner.on_complete(success);
        if let Some(callback) = &self.callback {
            callback(self.inner.kind(), success);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Completion Waits
// ─────────────────────────────────────────────────────────────────────────────

/// Why a completion wait ended without a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitError {
    TimedOut,
    Disconnected,
}

/// Wait for the first GATT event accepted by `matcher`
///
/// Gives up after `limit`, or as soon as the link leaves `Connected`.
pub(crate) async fn await_gatt<T, F>(
    events: &mut broadcast::Receiver<GattEvent>,
    state: &mut watch::Receiver<ConnectionState>,
    limit: Duration,
    mut matcher: F,
) -> Result<T, WaitError>
where
    F: FnMut(&GattEvent) -> Option<T>,
{
    let wait = async {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Some(value) = matcher(&event) {
                            return Ok(value);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "GATT event receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(WaitError::Disconnected),
                },
                changed = state.changed() => {
                    if changed.is_err() || *state.borrow() != ConnectionState::Connected {
                        return Err(WaitError::Disconnected);
                    }
                }
            }
        }
    };

    match tokio::time::timeout(limit, wait).await {
        Ok(result) => result,
        Err(_) => Err(WaitError::TimedOut),
    }
}
