//! Core BLE integration for the roastlink coffee analyzer.
//!
//! This crate connects to a handheld coffee analyzer over Bluetooth Low
//! Energy, runs measurement sessions on it and hands completed results to a
//! persistence backend, queueing them offline when the backend cannot be
//! reached.
//!
//! # Layers
//!
//! - [`traits::BleAdapter`]: the BLE transport seam. [`platform::BtleplugAdapter`]
//!   drives real hardware, [`MockAdapter`] simulates an analyzer for tests.
//! - [`DeviceScanner`]: discovery filtered by service UUID, manufacturer id
//!   and name prefix.
//! - [`ConnectionManager`]: the connection state machine (idle, scanning,
//!   connecting, connected, measuring, error) with link-loss handling and
//!   auto-connect to a bonded device.
//! - [`DeviceInfoReader`]: serial, firmware, model and battery reads.
//! - [`codec`]: command encoding and notification decoding.
//! - [`MeasurementSession`]: one measurement from start command to terminal
//!   phase, including the secondary phase and timeouts.
//! - [`PersistenceGateway`]: idempotent submission with an offline queue.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use roastlink_core::{
//!     BtleplugAdapter, ConnectionConfig, ConnectionManager, DeviceInfoReader,
//!     MeasurementSession, SessionConfig,
//! };
//! use roastlink_types::CoffeeType;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = Arc::new(BtleplugAdapter::new().await?);
//!     let manager = ConnectionManager::new(adapter, ConnectionConfig::default())?;
//!
//!     let report = manager.scan(std::time::Duration::from_secs(5)).await?;
//!     let Some(device) = report.devices.first() else {
//!         return Ok(());
//!     };
//!     manager.connect(&device.id).await?;
//!
//!     let info = DeviceInfoReader::new(manager.clone()).read_if_needed().await?;
//!     println!("Serial: {:?}", info.info.serial);
//!
//!     let session = MeasurementSession::new(manager.clone(), SessionConfig::default());
//!     let result = session.measure(CoffeeType::Roasted, None).await?;
//!     println!("Moisture: {:?}", result.reading);
//!
//!     manager.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod commands;
pub mod debug_log;
pub mod device_info;
pub mod error;
pub mod events;
pub mod manager;
pub mod mock;
pub mod persistence;
pub mod platform;
pub mod retry;
pub mod scan;
pub mod session;
pub mod traits;

#[cfg(feature = "http-client")]
pub mod service_client;

pub use roastlink_types::types;
pub use roastlink_types::uuid;

pub use debug_log::{DebugLogEntry, DebugRecorder};
pub use device_info::{DeviceInfoReader, DeviceInfoReport, InfoField};
pub use error::{ConnectionFailureReason, Error, Result};
pub use events::{DeviceEvent, DeviceId, DisconnectReason, EventDispatcher};
pub use manager::{ConnectionConfig, ConnectionManager};
pub use mock::{MockAdapter, MockAdapterBuilder, MockMeasurementApi};
pub use persistence::{
    ApiError, FlushReport, MeasurementApi, MeasurementPayload, MemoryQueue, OfflineQueue,
    PersistenceGateway, RemoteMeasurement, SaveOutcome, SyncQueueItem,
};
pub use platform::BtleplugAdapter;
pub use retry::{RetryConfig, with_retry};
pub use scan::{DeviceScanner, ScanDiagnostic, ScanOptions, ScanReport};
pub use session::{MeasurementPhase, MeasurementSession, SessionConfig, SessionState};
pub use traits::{AdapterState, BleAdapter, DeviceHandle, LinkEvent};

#[cfg(feature = "http-client")]
pub use service_client::HttpMeasurementApi;

pub use roastlink_types::{
    CoffeeType, ConnectionState, DeviceInfo, LinkKind, LinkTarget, MeasurementField,
    MeasurementReading,
};
