//! Mock BLE adapter for testing.
//!
//! [`MockAdapter`] implements [`BleAdapter`] without touching hardware, so
//! the scanner, connection manager and measurement session can be driven
//! end to end in unit and integration tests.
//!
//! # Features
//!
//! - **Scripted advertisements**: devices returned by every scan, plus
//!   [`MockAdapter::advertise`] to inject one mid-scan
//! - **Notification push**: [`MockAdapter::notify`] feeds the subscribed
//!   measurement characteristic
//! - **Failure injection**: failing connects, per-characteristic read
//!   failures, adapter power/permission state
//! - **Latency simulation**: connect and read delays (use with
//!   `tokio::time::pause` for deterministic tests)
//! - **Link loss**: [`MockAdapter::simulate_disconnect`]
//!
//! [`MockMeasurementApi`] stands in for the measurement backend.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};
use uuid::Uuid;

use roastlink_types::uuid::{
    ANALYZER_SERVICE, BATTERY_LEVEL, FIRMWARE_REVISION, MODEL_NUMBER, SERIAL_NUMBER,
};

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::persistence::{ApiError, MeasurementApi, MeasurementPayload, RemoteMeasurement};
use crate::traits::{AdapterState, BleAdapter, DeviceHandle, LinkEvent};

/// A scriptable in-memory BLE adapter.
///
/// # Example
///
/// ```
/// use roastlink_core::{BleAdapter, MockAdapter};
///
/// #[tokio::main]
/// async fn main() {
///     let adapter = MockAdapter::with_analyzer("AA:BB:CC:DD:EE:01");
///     adapter.connect("AA:BB:CC:DD:EE:01").await.unwrap();
///     assert!(adapter.is_connected_to("AA:BB:CC:DD:EE:01").await);
/// }
/// ```
pub struct MockAdapter {
    state: RwLock<AdapterState>,
    devices: RwLock<Vec<DeviceHandle>>,
    scan_tx: Mutex<Option<mpsc::Sender<DeviceHandle>>>,
    connected: RwLock<Option<String>>,
    values: RwLock<HashMap<Uuid, Vec<u8>>>,
    failing_reads: RwLock<HashSet<Uuid>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    notify_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    subscribed: watch::Sender<bool>,
    link_tx: broadcast::Sender<LinkEvent>,
    connect_failures: AtomicU32,
    connect_failure_reason: RwLock<ConnectionFailureReason>,
    connect_latency_ms: AtomicU64,
    read_latency_ms: AtomicU64,
    connect_count: AtomicU32,
    read_count: AtomicU32,
    subscribe_count: AtomicU32,
    unsubscribe_count: AtomicU32,
    scan_count: AtomicU32,
}

impl std::fmt::Debug for MockAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockAdapter")
            .field("connect_count", &self.connect_count.load(Ordering::Relaxed))
            .field("read_count", &self.read_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// Create a powered-on adapter with no devices.
    pub fn new() -> Self {
        let (subscribed, _) = watch::channel(false);
        let (link_tx, _) = broadcast::channel(16);
        Self {
            state: RwLock::new(AdapterState::PoweredOn),
            devices: RwLock::new(Vec::new()),
            scan_tx: Mutex::new(None),
            connected: RwLock::new(None),
            values: RwLock::new(HashMap::new()),
            failing_reads: RwLock::new(HashSet::new()),
            writes: Mutex::new(Vec::new()),
            notify_tx: Mutex::new(None),
            subscribed,
            link_tx,
            connect_failures: AtomicU32::new(0),
            connect_failure_reason: RwLock::new(ConnectionFailureReason::GattFailure(
                "mock failure".to_string(),
            )),
            connect_latency_ms: AtomicU64::new(0),
            read_latency_ms: AtomicU64::new(0),
            connect_count: AtomicU32::new(0),
            read_count: AtomicU32::new(0),
            subscribe_count: AtomicU32::new(0),
            unsubscribe_count: AtomicU32::new(0),
            scan_count: AtomicU32::new(0),
        }
    }

    /// Create an adapter that advertises one analyzer with the standard
    /// device information values populated.
    pub fn with_analyzer(id: &str) -> Self {
        MockAdapterBuilder::new()
            .device(
                DeviceHandle::new(id)
                    .with_name("CoffeeLab 2041")
                    .with_rssi(-55)
                    .with_service(ANALYZER_SERVICE),
            )
            .value(SERIAL_NUMBER, b"CL-2041-0042".to_vec())
            .value(FIRMWARE_REVISION, b"2.4.1".to_vec())
            .value(MODEL_NUMBER, b"CoffeeLab Pro".to_vec())
            .value(BATTERY_LEVEL, vec![87])
            .build()
    }

    fn check_connected(&self, connected: &Option<String>, device_id: &str) -> Result<()> {
        match connected {
            Some(id) if id == device_id => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }

    async fn drop_subscription(&self) {
        if self.notify_tx.lock().await.take().is_some() {
            self.subscribed.send_replace(false);
        }
    }

    // --- Test control methods ---

    /// Set the adapter power/permission state.
    pub async fn set_state(&self, state: AdapterState) {
        *self.state.write().await = state;
    }

    /// Add a device returned by subsequent scans.
    pub async fn add_device(&self, device: DeviceHandle) {
        self.devices.write().await.push(device);
    }

    /// Deliver an advertisement to the running scan, if any.
    ///
    /// Returns `false` when no scan is active.
    pub async fn advertise(&self, device: DeviceHandle) -> bool {
        let tx = self.scan_tx.lock().await.clone();
        match tx {
            Some(tx) => tx.send(device).await.is_ok(),
            None => false,
        }
    }

    /// Set the value returned when reading a characteristic.
    pub async fn set_value(&self, characteristic: Uuid, value: Vec<u8>) {
        self.values.write().await.insert(characteristic, value);
    }

    /// Make reads of `characteristic` fail until cleared.
    pub async fn fail_reads(&self, characteristic: Uuid, fail: bool) {
        let mut failing = self.failing_reads.write().await;
        if fail {
            failing.insert(characteristic);
        } else {
            failing.remove(&characteristic);
        }
    }

    /// Fail the next `count` connection attempts with `reason`.
    pub async fn fail_connects(&self, count: u32, reason: ConnectionFailureReason) {
        *self.connect_failure_reason.write().await = reason;
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Set simulated connect latency.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Set simulated read latency.
    pub fn set_read_latency(&self, latency: Duration) {
        self.read_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Push a notification to the current subscriber.
    ///
    /// Returns `false` if nothing is subscribed.
    pub async fn notify(&self, data: impl Into<Vec<u8>>) -> bool {
        let tx = self.notify_tx.lock().await.clone();
        match tx {
            Some(tx) => tx.send(data.into()).await.is_ok(),
            None => false,
        }
    }

    /// Wait until a subscriber is attached to the measurement characteristic.
    pub async fn wait_subscribed(&self) {
        let mut rx = self.subscribed.subscribe();
        let _ = rx.wait_for(|s| *s).await;
    }

    /// Drop the link as if the device went out of range.
    pub async fn simulate_disconnect(&self) {
        let device_id = self.connected.write().await.take();
        self.drop_subscription().await;
        if let Some(device_id) = device_id {
            let _ = self.link_tx.send(LinkEvent::Disconnected { device_id });
        }
    }

    /// Whether the adapter holds a link to `device_id`.
    pub async fn is_connected_to(&self, device_id: &str) -> bool {
        self.connected.read().await.as_deref() == Some(device_id)
    }

    /// Whether a scan is running.
    pub async fn is_scanning(&self) -> bool {
        self.scan_tx.lock().await.is_some()
    }

    /// Whether a notification subscription is live.
    pub fn is_subscribed(&self) -> bool {
        *self.subscribed.borrow()
    }

    /// All writes performed, in order.
    pub async fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.writes.lock().await.clone()
    }

    /// Number of connect calls (successful or not).
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::Relaxed)
    }

    /// Number of characteristic reads attempted.
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }

    /// Number of subscribe calls.
    pub fn subscribe_count(&self) -> u32 {
        self.subscribe_count.load(Ordering::Relaxed)
    }

    /// Number of unsubscribe calls.
    pub fn unsubscribe_count(&self) -> u32 {
        self.unsubscribe_count.load(Ordering::Relaxed)
    }

    /// Number of scans started.
    pub fn scan_count(&self) -> u32 {
        self.scan_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    async fn state(&self) -> AdapterState {
        *self.state.read().await
    }

    async fn start_scan(&self) -> Result<mpsc::Receiver<DeviceHandle>> {
        match *self.state.read().await {
            AdapterState::PoweredOn => {}
            AdapterState::PoweredOff => return Err(Error::AdapterOff),
            AdapterState::Unauthorized => return Err(Error::PermissionDenied),
            AdapterState::Unavailable => {
                return Err(Error::AdapterUnavailable("mock adapter unavailable".into()));
            }
        }

        self.scan_count.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(64);
        for device in self.devices.read().await.iter() {
            let _ = tx.try_send(device.clone());
        }
        *self.scan_tx.lock().await = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scan_tx.lock().await.take();
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<()> {
        self.connect_count.fetch_add(1, Ordering::Relaxed);

        let latency = self.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::connection_failed(
                Some(device_id.to_string()),
                self.connect_failure_reason.read().await.clone(),
            ));
        }

        if !self.devices.read().await.iter().any(|d| d.id == device_id) {
            return Err(Error::DeviceNotFound(device_id.to_string()));
        }

        *self.connected.write().await = Some(device_id.to_string());
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<()> {
        let mut connected = self.connected.write().await;
        if connected.as_deref() == Some(device_id) {
            *connected = None;
        }
        drop(connected);
        self.drop_subscription().await;
        Ok(())
    }

    async fn read(&self, device_id: &str, characteristic: Uuid) -> Result<Vec<u8>> {
        self.check_connected(&*self.connected.read().await, device_id)?;
        self.read_count.fetch_add(1, Ordering::Relaxed);

        let latency = self.read_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.failing_reads.read().await.contains(&characteristic) {
            return Err(Error::timeout(
                format!("read {characteristic}"),
                Duration::from_millis(latency),
            ));
        }
        self.values
            .read()
            .await
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound(characteristic.to_string()))
    }

    async fn write(&self, device_id: &str, characteristic: Uuid, data: &[u8]) -> Result<()> {
        self.check_connected(&*self.connected.read().await, device_id)?;
        self.writes
            .lock()
            .await
            .push((characteristic, data.to_vec()));
        Ok(())
    }

    async fn subscribe(
        &self,
        device_id: &str,
        _characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>> {
        self.check_connected(&*self.connected.read().await, device_id)?;
        self.subscribe_count.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(64);
        *self.notify_tx.lock().await = Some(tx);
        self.subscribed.send_replace(true);
        Ok(rx)
    }

    async fn unsubscribe(&self, _device_id: &str, _characteristic: Uuid) -> Result<()> {
        self.unsubscribe_count.fetch_add(1, Ordering::Relaxed);
        self.drop_subscription().await;
        Ok(())
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }
}

/// Builder for creating mock adapters with custom settings.
#[derive(Debug, Default)]
pub struct MockAdapterBuilder {
    state: Option<AdapterState>,
    devices: Vec<DeviceHandle>,
    values: HashMap<Uuid, Vec<u8>>,
}

impl MockAdapterBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the adapter state.
    #[must_use]
    pub fn state(mut self, state: AdapterState) -> Self {
        self.state = Some(state);
        self
    }

    /// Add an advertised device.
    #[must_use]
    pub fn device(mut self, device: DeviceHandle) -> Self {
        self.devices.push(device);
        self
    }

    /// Set a readable characteristic value.
    #[must_use]
    pub fn value(mut self, characteristic: Uuid, value: Vec<u8>) -> Self {
        self.values.insert(characteristic, value);
        self
    }

    /// Build the mock adapter.
    pub fn build(self) -> MockAdapter {
        let adapter = MockAdapter::new();
        MockAdapter {
            state: RwLock::new(self.state.unwrap_or(AdapterState::PoweredOn)),
            devices: RwLock::new(self.devices),
            values: RwLock::new(self.values),
            ..adapter
        }
    }
}

/// In-memory measurement backend.
///
/// Stores submissions keyed by client id and answers a repeated client id
/// with [`ApiError::Duplicate`], like a backend honouring idempotency keys.
#[derive(Debug, Default)]
pub struct MockMeasurementApi {
    stored: Mutex<Vec<MeasurementPayload>>,
    submitted: Mutex<Vec<MeasurementPayload>>,
    offline: AtomicBool,
    submit_count: AtomicU32,
}

impl MockMeasurementApi {
    /// Create an online backend with no measurements.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every request fail with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Store a measurement directly, as if an earlier response was lost.
    pub async fn store(&self, payload: MeasurementPayload) {
        self.stored.lock().await.push(payload);
    }

    /// Payloads accepted by [`submit`](MeasurementApi::submit), in order.
    pub async fn submitted(&self) -> Vec<MeasurementPayload> {
        self.submitted.lock().await.clone()
    }

    /// Number of measurements held by the backend.
    pub async fn stored_count(&self) -> usize {
        self.stored.lock().await.len()
    }

    /// Number of submit calls (successful or not).
    pub fn submit_count(&self) -> u32 {
        self.submit_count.load(Ordering::Relaxed)
    }

    fn check_online(&self) -> std::result::Result<(), ApiError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ApiError::Transport("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MeasurementApi for MockMeasurementApi {
    async fn submit(
        &self,
        payload: &MeasurementPayload,
    ) -> std::result::Result<Option<String>, ApiError> {
        self.submit_count.fetch_add(1, Ordering::Relaxed);
        self.check_online()?;

        let mut stored = self.stored.lock().await;
        if stored.iter().any(|p| p.client_id == payload.client_id) {
            return Err(ApiError::Duplicate);
        }
        stored.push(payload.clone());
        let remote_id = format!("m-{}", stored.len());
        drop(stored);

        self.submitted.lock().await.push(payload.clone());
        Ok(Some(remote_id))
    }

    async fn recent(&self, limit: usize) -> std::result::Result<Vec<RemoteMeasurement>, ApiError> {
        self.check_online()?;
        let stored = self.stored.lock().await;
        Ok(stored
            .iter()
            .enumerate()
            .rev()
            .take(limit)
            .map(|(i, p)| RemoteMeasurement {
                id: format!("m-{}", i + 1),
                client_id: Some(p.client_id),
                coffee_type: p.coffee_type,
                created_at: p.completed_at.unwrap_or(p.started_at),
                reading: p.reading,
                linked_type: p.linked_type,
                linked_id: p.linked_id.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roastlink_types::uuid::{COMMAND, MEASUREMENT_DATA};

    const ID: &str = "AA:BB:CC:DD:EE:01";

    #[tokio::test]
    async fn test_mock_connect_and_read() {
        let adapter = MockAdapter::with_analyzer(ID);
        adapter.connect(ID).await.unwrap();
        assert!(adapter.is_connected_to(ID).await);

        let battery = adapter.read(ID, BATTERY_LEVEL).await.unwrap();
        assert_eq!(battery, vec![87]);
        assert_eq!(adapter.read_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_not_connected() {
        let adapter = MockAdapter::with_analyzer(ID);
        let result = adapter.read(ID, SERIAL_NUMBER).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_mock_unknown_device() {
        let adapter = MockAdapter::with_analyzer(ID);
        let result = adapter.connect("nope").await;
        assert!(matches!(result, Err(Error::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn test_mock_connect_failures() {
        let adapter = MockAdapter::with_analyzer(ID);
        adapter
            .fail_connects(1, ConnectionFailureReason::OutOfRange)
            .await;

        assert!(matches!(
            adapter.connect(ID).await,
            Err(Error::ConnectionFailed {
                reason: ConnectionFailureReason::OutOfRange,
                ..
            })
        ));
        assert!(adapter.connect(ID).await.is_ok());
        assert_eq!(adapter.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_read_failure_injection() {
        let adapter = MockAdapter::with_analyzer(ID);
        adapter.connect(ID).await.unwrap();
        adapter.fail_reads(FIRMWARE_REVISION, true).await;

        assert!(adapter.read(ID, FIRMWARE_REVISION).await.is_err());
        assert!(adapter.read(ID, SERIAL_NUMBER).await.is_ok());

        adapter.fail_reads(FIRMWARE_REVISION, false).await;
        assert!(adapter.read(ID, FIRMWARE_REVISION).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_scan_respects_state() {
        let adapter = MockAdapterBuilder::new()
            .state(AdapterState::PoweredOff)
            .build();
        assert!(matches!(adapter.start_scan().await, Err(Error::AdapterOff)));

        adapter.set_state(AdapterState::Unauthorized).await;
        assert!(matches!(
            adapter.start_scan().await,
            Err(Error::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn test_mock_scan_delivers_devices() {
        let adapter = MockAdapter::with_analyzer(ID);
        let mut rx = adapter.start_scan().await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.id, ID);

        assert!(adapter.advertise(DeviceHandle::new("other")).await);
        assert_eq!(rx.recv().await.unwrap().id, "other");

        adapter.stop_scan().await.unwrap();
        assert!(!adapter.advertise(DeviceHandle::new("late")).await);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_mock_notifications() {
        let adapter = MockAdapter::with_analyzer(ID);
        adapter.connect(ID).await.unwrap();
        assert!(!adapter.notify(vec![0xE5]).await);

        let mut rx = adapter.subscribe(ID, MEASUREMENT_DATA).await.unwrap();
        adapter.wait_subscribed().await;
        assert!(adapter.notify(vec![0xE5]).await);
        assert_eq!(rx.recv().await.unwrap(), vec![0xE5]);

        adapter.unsubscribe(ID, MEASUREMENT_DATA).await.unwrap();
        assert!(!adapter.is_subscribed());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_mock_simulate_disconnect() {
        let adapter = MockAdapter::with_analyzer(ID);
        let mut events = adapter.link_events();
        adapter.connect(ID).await.unwrap();
        let mut rx = adapter.subscribe(ID, MEASUREMENT_DATA).await.unwrap();

        adapter.simulate_disconnect().await;
        assert!(!adapter.is_connected_to(ID).await);
        assert!(rx.recv().await.is_none());
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Disconnected {
                device_id: ID.to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_mock_records_writes() {
        let adapter = MockAdapter::with_analyzer(ID);
        adapter.connect(ID).await.unwrap();
        adapter.write(ID, COMMAND, &[0x10, 0x01]).await.unwrap();
        assert_eq!(adapter.writes().await, vec![(COMMAND, vec![0x10, 0x01])]);
    }

    #[tokio::test]
    async fn test_mock_via_trait_object() {
        let adapter: std::sync::Arc<dyn BleAdapter> =
            std::sync::Arc::new(MockAdapter::with_analyzer(ID));
        assert_eq!(adapter.state().await, AdapterState::PoweredOn);
    }
}
