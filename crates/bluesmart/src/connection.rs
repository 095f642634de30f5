//! Connection State Tracking
//!
//! [`ConnectionTracker`] owns a device's connection state machine. Transport
//! reports are folded into it and the result is published on a `watch`
//! channel that actions and listeners observe. Nothing else moves the state.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::transport::GattStatus;

/// Link state of one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// What a transport report meant for the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The radio link is up; attribute discovery may still be pending
    LinkUp,
    /// Fully connected
    Established,
    /// The link dropped before the connection was established
    Failed,
    /// An established link was closed
    Closed,
    /// Nothing observable changed
    Unchanged,
}

/// Connection state machine for one device
pub struct ConnectionTracker {
    state: watch::Sender<ConnectionState>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    /// Create a new tracker in the `Disconnected` state
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self { state }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    /// A connect was requested; returns false if one is already underway
    pub fn begin_connect(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Disconnected {
                *s = ConnectionState::Connecting;
                true
            } else {
                false
            }
        })
    }

    /// A disconnect was requested on a live or pending link
    pub fn begin_disconnect(&self) -> bool {
        self.state.send_if_modified(|s| match s {
            ConnectionState::Connected => {
                *s = ConnectionState::Disconnecting;
                true
            }
            _ => false,
        })
    }

    /// Attribute discovery finished on a link that is still coming up
    pub fn establish(&self) -> LinkEvent {
        let changed = self.state.send_if_modified(|s| {
            if *s == ConnectionState::Connecting {
                *s = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        if changed {
            LinkEvent::Established
        } else {
            LinkEvent::Unchanged
        }
    }

    /// Fold a transport state report into the machine
    ///
    /// A link reported up stays `Connecting` until [`establish`](Self::establish)
    /// is called. A link that goes down while still `Connecting` is a failed
    /// attempt, otherwise the connection was closed.
    pub fn on_transport_state(&self, reported: ConnectionState, status: GattStatus) -> LinkEvent {
        let mut event = LinkEvent::Unchanged;
        self.state.send_if_modified(|s| {
            let previous = *s;
            match reported {
                ConnectionState::Connected => {
                    if previous == ConnectionState::Connected {
                        return false;
                    }
                    *s = ConnectionState::Connecting;
                    event = LinkEvent::LinkUp;
                    true
                }
                ConnectionState::Disconnected => {
                    event = match previous {
                        ConnectionState::Disconnected => return false,
                        ConnectionState::Connecting => LinkEvent::Failed,
                        ConnectionState::Connected | ConnectionState::Disconnecting => LinkEvent::Closed,
                    };
                    *s = ConnectionState::Disconnected;
                    true
                }
                other => {
                    if previous == other {
                        return false;
                    }
                    *s = other;
                    true
                }
            }
        });

        tracing::trace!(?reported, %status, ?event, "Transport state report");
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_flow() {
        let tracker = ConnectionTracker::new();
        assert!(tracker.begin_connect());
        assert!(!tracker.begin_connect());
        assert_eq!(tracker.state(), ConnectionState::Connecting);

        assert_eq!(
            tracker.on_transport_state(ConnectionState::Connected, GattStatus::SUCCESS),
            LinkEvent::LinkUp
        );
        assert!(tracker.is_connecting());
        assert_eq!(tracker.establish(), LinkEvent::Established);
        assert!(tracker.is_connected());
        assert_eq!(tracker.establish(), LinkEvent::Unchanged);
    }

    #[test]
    fn test_drop_while_connecting_is_failure() {
        let tracker = ConnectionTracker::new();
        tracker.begin_connect();
        assert_eq!(
            tracker.on_transport_state(ConnectionState::Disconnected, GattStatus::ERROR),
            LinkEvent::Failed
        );
        assert_eq!(tracker.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_drop_after_connect_is_close() {
        let tracker = ConnectionTracker::new();
        tracker.begin_connect();
        tracker.on_transport_state(ConnectionState::Connected, GattStatus::SUCCESS);
        tracker.establish();
        assert!(tracker.begin_disconnect());
        assert_eq!(tracker.state(), ConnectionState::Disconnecting);
        assert_eq!(
            tracker.on_transport_state(ConnectionState::Disconnected, GattStatus::SUCCESS),
            LinkEvent::Closed
        );
        assert_eq!(
            tracker.on_transport_state(ConnectionState::Disconnected, GattStatus::SUCCESS),
            LinkEvent::Unchanged
        );
    }

    #[tokio::test]
    async fn test_watchers_see_transitions() {
        let tracker = ConnectionTracker::new();
        let mut rx = tracker.subscribe();
        tracker.begin_connect();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connecting);
    }
}
