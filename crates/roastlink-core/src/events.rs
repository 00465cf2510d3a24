//! Event system for connection, session and save notifications.
//!
//! Observers (the CLI progress display, logging) subscribe to a broadcast
//! channel. Events are informational; the authoritative state lives in the
//! [`ConnectionManager`](crate::manager::ConnectionManager) watch channel and
//! the session snapshot.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use roastlink_types::{ConnectionState, DeviceInfo, MeasurementReading};

use crate::session::MeasurementPhase;

/// Device identifier for events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceId {
    /// Platform identifier.
    pub id: String,
    /// Device name if known.
    pub name: Option<String>,
}

impl DeviceId {
    /// Create a new device ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    /// Create a device ID with name.
    pub fn with_name(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }
}

/// Events emitted by the core.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum DeviceEvent {
    /// Analyzer discovered (or re-advertised) during a scan.
    Discovered { device: DeviceId, rssi: Option<i16> },
    /// Connection state changed.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Successfully connected to device.
    Connected { device: DeviceId },
    /// Disconnected from device.
    Disconnected {
        device: DeviceId,
        reason: DisconnectReason,
    },
    /// Device information was read.
    DeviceInfoRead { device: DeviceId, info: DeviceInfo },
    /// A measurement session changed phase.
    PhaseChanged {
        client_id: Uuid,
        phase: MeasurementPhase,
    },
    /// New values were merged into the running measurement.
    Reading {
        client_id: Uuid,
        reading: MeasurementReading,
    },
    /// A completed measurement was accepted by the backend.
    Saved {
        client_id: Uuid,
        remote_id: Option<String>,
    },
    /// A completed measurement was queued for later upload.
    OfflineQueued { client_id: Uuid },
}

/// Reason for disconnection.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Disconnection requested by the application.
    UserRequested,
    /// The platform reported the link dropped.
    LinkLost,
}

/// Sender for device events.
pub type EventSender = broadcast::Sender<DeviceEvent>;

/// Receiver for device events.
pub type EventReceiver = broadcast::Receiver<DeviceEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: DeviceEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatcher_fan_out() {
        let dispatcher = EventDispatcher::default();
        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();
        assert_eq!(dispatcher.receiver_count(), 2);

        dispatcher.send(DeviceEvent::Connected {
            device: DeviceId::new("AA"),
        });

        assert!(matches!(a.recv().await.unwrap(), DeviceEvent::Connected { .. }));
        assert!(matches!(b.recv().await.unwrap(), DeviceEvent::Connected { .. }));
    }

    #[test]
    fn test_send_without_receivers_is_silent() {
        let dispatcher = EventDispatcher::default();
        dispatcher.send(DeviceEvent::OfflineQueued {
            client_id: Uuid::new_v4(),
        });
    }

    #[test]
    fn test_event_serialization() {
        let event = DeviceEvent::StateChanged {
            from: ConnectionState::Connected,
            to: ConnectionState::Measuring,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["from"]["state"], "connected");
        assert_eq!(json["to"]["state"], "measuring");
    }
}
