//! Post-connection device information reads.
//!
//! Serial, firmware, model and battery each live in their own
//! characteristic and are read independently: one failing read never blocks
//! the others.

use std::fmt;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use roastlink_types::DeviceInfo;
use roastlink_types::uuid::{BATTERY_LEVEL, FIRMWARE_REVISION, MODEL_NUMBER, SERIAL_NUMBER};

use crate::codec::{decode_battery, decode_string};
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, DeviceId};
use crate::manager::ConnectionManager;
use crate::retry::{RetryConfig, with_retry};

/// Default timeout for a single characteristic read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// One of the values read after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoField {
    /// Serial number (0x2A25).
    Serial,
    /// Firmware revision (0x2A26).
    Firmware,
    /// Model number (0x2A24).
    Model,
    /// Battery level (0x2A19).
    Battery,
}

impl InfoField {
    /// Characteristic holding this value.
    pub fn characteristic(self) -> Uuid {
        match self {
            InfoField::Serial => SERIAL_NUMBER,
            InfoField::Firmware => FIRMWARE_REVISION,
            InfoField::Model => MODEL_NUMBER,
            InfoField::Battery => BATTERY_LEVEL,
        }
    }

    fn name(self) -> &'static str {
        match self {
            InfoField::Serial => "serial",
            InfoField::Firmware => "firmware",
            InfoField::Model => "model",
            InfoField::Battery => "battery",
        }
    }
}

impl fmt::Display for InfoField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of [`DeviceInfoReader::read_if_needed`].
#[derive(Debug, Default)]
pub struct DeviceInfoReport {
    /// Device information known after the call.
    pub info: DeviceInfo,
    /// Reads that failed, with their errors.
    pub failures: Vec<(InfoField, Error)>,
    /// True when nothing was read because the serial was already known.
    pub skipped: bool,
}

impl DeviceInfoReport {
    /// Whether every read succeeded (or none was needed).
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Reads the device information characteristics once per connection.
#[derive(Debug, Clone)]
pub struct DeviceInfoReader {
    manager: ConnectionManager,
    read_timeout: Duration,
    retry: RetryConfig,
}

impl DeviceInfoReader {
    /// Create a reader bound to `manager`'s connection.
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            read_timeout: DEFAULT_READ_TIMEOUT,
            retry: RetryConfig::for_read(),
        }
    }

    /// Set the per-read timeout.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the retry policy applied to each read.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn connected_device(&self) -> Result<String> {
        if !self.manager.state().is_connected() {
            return Err(Error::NotConnected);
        }
        self.manager.device_id().ok_or(Error::NotConnected)
    }

    /// Read all four values unless the serial number is already known.
    ///
    /// Successful values are stored on the connection manager and an
    /// [`DeviceEvent::DeviceInfoRead`] is emitted. Individual failures are
    /// reported in [`DeviceInfoReport::failures`].
    pub async fn read_if_needed(&self) -> Result<DeviceInfoReport> {
        let device_id = self.connected_device()?;

        let known = self.manager.device_info();
        if known.has_serial() {
            debug!("Device info already read for {}", device_id);
            return Ok(DeviceInfoReport {
                info: known,
                failures: Vec::new(),
                skipped: true,
            });
        }

        let (serial, firmware, model, battery) = tokio::join!(
            self.read_serial(),
            self.read_firmware(),
            self.read_model(),
            self.read_battery(),
        );

        let mut info = DeviceInfo::default();
        let mut failures = Vec::new();
        match serial {
            Ok(v) => info.serial = Some(v),
            Err(e) => failures.push((InfoField::Serial, e)),
        }
        match firmware {
            Ok(v) => info.firmware = Some(v),
            Err(e) => failures.push((InfoField::Firmware, e)),
        }
        match model {
            Ok(v) => info.model = Some(v),
            Err(e) => failures.push((InfoField::Model, e)),
        }
        match battery {
            Ok(v) => info.battery = Some(v),
            Err(e) => failures.push((InfoField::Battery, e)),
        }

        let debug_log = self.manager.debug_log();
        for (field, err) in &failures {
            warn!("Failed to read {} from {}: {}", field, device_id, err);
            debug_log.append(format!("info: {field} read failed: {err}"));
        }

        if !self.manager.store_device_info(&device_id, &info) {
            debug!("Connection changed while reading device info, discarding");
            return Err(Error::NotConnected);
        }

        let stored = self.manager.device_info();
        info!(
            "Device info for {}: serial={:?} firmware={:?} model={:?} battery={:?}",
            device_id, stored.serial, stored.firmware, stored.model, stored.battery
        );
        debug_log.append(format!(
            "info: serial={} firmware={} model={} battery={}",
            stored.serial.as_deref().unwrap_or("-"),
            stored.firmware.as_deref().unwrap_or("-"),
            stored.model.as_deref().unwrap_or("-"),
            stored
                .battery
                .map_or_else(|| "-".to_string(), |b| format!("{b}%")),
        ));
        self.manager.events().send(DeviceEvent::DeviceInfoRead {
            device: DeviceId::new(&device_id),
            info: stored.clone(),
        });

        Ok(DeviceInfoReport {
            info: stored,
            failures,
            skipped: false,
        })
    }

    async fn read_raw(&self, field: InfoField) -> Result<Vec<u8>> {
        let device_id = self.connected_device()?;
        let characteristic = field.characteristic();
        let limit = self.read_timeout;
        let adapter = self.manager.adapter();
        let device_id = device_id.as_str();

        with_retry(&self.retry, field.name(), move || async move {
            match timeout(limit, adapter.read(device_id, characteristic)).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(format!("read {field}"), limit)),
            }
        })
        .await
    }

    async fn read_text(&self, field: InfoField) -> Result<String> {
        let raw = self.read_raw(field).await?;
        decode_string(&raw).ok_or_else(|| Error::InvalidData(format!("empty {field} string")))
    }

    /// Read the serial number.
    pub async fn read_serial(&self) -> Result<String> {
        self.read_text(InfoField::Serial).await
    }

    /// Read the firmware revision.
    pub async fn read_firmware(&self) -> Result<String> {
        self.read_text(InfoField::Firmware).await
    }

    /// Read the model string.
    pub async fn read_model(&self) -> Result<String> {
        self.read_text(InfoField::Model).await
    }

    /// Read the battery level in percent.
    pub async fn read_battery(&self) -> Result<u8> {
        let raw = self.read_raw(InfoField::Battery).await?;
        decode_battery(&raw).ok_or_else(|| Error::InvalidData("empty battery value".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::manager::ConnectionConfig;
    use crate::mock::MockAdapter;

    const ID: &str = "AA:BB:CC:DD:EE:01";

    async fn connected(adapter: &Arc<MockAdapter>) -> DeviceInfoReader {
        let manager = ConnectionManager::new(adapter.clone(), ConnectionConfig::default()).unwrap();
        manager.connect(ID).await.unwrap();
        DeviceInfoReader::new(manager).retry(RetryConfig::none())
    }

    #[tokio::test]
    async fn test_reads_all_values() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let reader = connected(&adapter).await;

        let report = reader.read_if_needed().await.unwrap();
        assert!(report.is_complete());
        assert!(!report.skipped);
        assert_eq!(report.info.serial.as_deref(), Some("CL-2041-0042"));
        assert_eq!(report.info.firmware.as_deref(), Some("2.4.1"));
        assert_eq!(report.info.model.as_deref(), Some("CoffeeLab Pro"));
        assert_eq!(report.info.battery, Some(87));
        assert_eq!(reader.manager.device_info(), report.info);
    }

    #[tokio::test]
    async fn test_second_call_skips_reads() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let reader = connected(&adapter).await;

        reader.read_if_needed().await.unwrap();
        let reads = adapter.read_count();

        let report = reader.read_if_needed().await.unwrap();
        assert!(report.skipped);
        assert_eq!(adapter.read_count(), reads);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        adapter.fail_reads(FIRMWARE_REVISION, true).await;
        let reader = connected(&adapter).await;

        let report = reader.read_if_needed().await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, InfoField::Firmware);
        assert!(report.info.firmware.is_none());
        assert_eq!(report.info.serial.as_deref(), Some("CL-2041-0042"));
        assert_eq!(report.info.battery, Some(87));
    }

    #[tokio::test]
    async fn test_missing_serial_is_retried_next_call() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        adapter.fail_reads(SERIAL_NUMBER, true).await;
        let reader = connected(&adapter).await;

        let report = reader.read_if_needed().await.unwrap();
        assert!(report.info.serial.is_none());

        adapter.fail_reads(SERIAL_NUMBER, false).await;
        let report = reader.read_if_needed().await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.info.serial.as_deref(), Some("CL-2041-0042"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        adapter.set_read_latency(Duration::from_secs(30));
        let reader = connected(&adapter)
            .await
            .read_timeout(Duration::from_secs(2));

        let err = reader.read_battery().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let manager = ConnectionManager::new(adapter.clone(), ConnectionConfig::default()).unwrap();
        let reader = DeviceInfoReader::new(manager);

        assert!(matches!(
            reader.read_if_needed().await,
            Err(Error::NotConnected)
        ));
        assert_eq!(adapter.read_count(), 0);
    }

    #[tokio::test]
    async fn test_battery_is_clamped() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        adapter.set_value(BATTERY_LEVEL, vec![150]).await;
        let reader = connected(&adapter).await;
        assert_eq!(reader.read_battery().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_info_cleared_on_disconnect() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let reader = connected(&adapter).await;
        reader.read_if_needed().await.unwrap();

        reader.manager.disconnect().await.unwrap();
        assert_eq!(reader.manager.device_info(), DeviceInfo::default());
    }
}
