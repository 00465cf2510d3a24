//! Trait abstraction over the platform Bluetooth stack.
//!
//! [`BleAdapter`] is the seam between the measurement logic and the
//! platform. [`BtleplugAdapter`](crate::platform::BtleplugAdapter) talks to
//! real hardware; [`MockAdapter`](crate::mock::MockAdapter) drives tests.
//!
//! Platform callbacks never cross this boundary: discoveries and
//! notifications arrive as `mpsc` messages, link loss as a broadcast
//! [`LinkEvent`].

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use roastlink_types::uuid::{ANALYZER_SERVICE, MANUFACTURER_ID, NAME_PREFIX};

use crate::error::Result;

/// Power and permission state of the Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Ready to scan and connect.
    PoweredOn,
    /// Bluetooth is switched off.
    PoweredOff,
    /// The application may not use Bluetooth.
    Unauthorized,
    /// No adapter present, or its state cannot be determined.
    Unavailable,
}

/// A peripheral seen while scanning.
///
/// Handles are ephemeral: they are only meaningful for the scan that
/// produced them and for a subsequent `connect` by [`DeviceHandle::id`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceHandle {
    /// Platform identifier (MAC address on Linux/Windows, UUID on macOS).
    pub id: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Manufacturer data keyed by company id.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

impl DeviceHandle {
    /// Create a handle with just an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Set the advertised name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the RSSI.
    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Add an advertised service.
    #[must_use]
    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.push(service);
        self
    }

    /// Whether this looks like a coffee analyzer.
    ///
    /// Matches on the vendor service, the vendor manufacturer id, or the
    /// advertised name prefix (case-insensitive).
    pub fn is_analyzer(&self) -> bool {
        self.services.contains(&ANALYZER_SERVICE)
            || self.manufacturer_data.contains_key(&MANUFACTURER_ID)
            || self
                .name
                .as_deref()
                .is_some_and(|n| n.to_ascii_lowercase().starts_with(NAME_PREFIX))
    }

    /// Name for display, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Link-level events published by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LinkEvent {
    /// The platform reported that a peripheral disconnected.
    Disconnected {
        /// Platform id of the peripheral.
        device_id: String,
    },
}

/// Platform BLE operations used by the core.
///
/// All methods identify the peripheral by the id from a [`DeviceHandle`].
/// Implementations are assumed correct; the core layers timeouts,
/// retries and state tracking on top.
#[async_trait]
pub trait BleAdapter: Send + Sync + 'static {
    /// Current power/permission state.
    async fn state(&self) -> AdapterState;

    /// Start scanning. Each discovery or advertisement update is sent on
    /// the returned channel until [`stop_scan`](Self::stop_scan) is called.
    async fn start_scan(&self) -> Result<mpsc::Receiver<DeviceHandle>>;

    /// Stop scanning. Idempotent.
    async fn stop_scan(&self) -> Result<()>;

    /// Connect and discover services.
    async fn connect(&self, device_id: &str) -> Result<()>;

    /// Tear down the link.
    async fn disconnect(&self, device_id: &str) -> Result<()>;

    /// Read a characteristic.
    async fn read(&self, device_id: &str, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write a characteristic (with response).
    async fn write(&self, device_id: &str, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Enable notifications. Each notification value is delivered on the
    /// returned channel; the channel closes when the link drops or
    /// [`unsubscribe`](Self::unsubscribe) is called.
    async fn subscribe(
        &self,
        device_id: &str,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>>;

    /// Disable notifications.
    async fn unsubscribe(&self, device_id: &str, characteristic: Uuid) -> Result<()>;

    /// Subscribe to link events.
    fn link_events(&self) -> broadcast::Receiver<LinkEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_analyzer_by_service() {
        let handle = DeviceHandle::new("AA").with_service(ANALYZER_SERVICE);
        assert!(handle.is_analyzer());
    }

    #[test]
    fn test_is_analyzer_by_manufacturer() {
        let mut handle = DeviceHandle::new("AA");
        handle.manufacturer_data.insert(MANUFACTURER_ID, vec![1, 2]);
        assert!(handle.is_analyzer());
    }

    #[test]
    fn test_is_analyzer_by_name() {
        assert!(DeviceHandle::new("AA").with_name("CoffeeLab 2041").is_analyzer());
        assert!(!DeviceHandle::new("AA").with_name("Headphones").is_analyzer());
        assert!(!DeviceHandle::new("AA").is_analyzer());
    }

    #[test]
    fn test_display_name_fallback() {
        assert_eq!(DeviceHandle::new("AA:BB").display_name(), "AA:BB");
        assert_eq!(
            DeviceHandle::new("AA:BB").with_name("coffeelab").display_name(),
            "coffeelab"
        );
    }
}
