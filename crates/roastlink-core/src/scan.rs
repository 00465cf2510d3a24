//! Device discovery and scanning.
//!
//! [`DeviceScanner`] drives scan start/stop on a [`BleAdapter`], keeps one
//! entry per peripheral (latest RSSI wins) and turns every way a scan can
//! come up empty into a [`ScanDiagnostic`] the UI can show as guidance.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, warn};

use crate::debug_log::DebugRecorder;
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, DeviceId, EventDispatcher};
use crate::traits::{AdapterState, BleAdapter, DeviceHandle};

/// Options for scanning.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// How long [`DeviceScanner::scan`] listens for advertisements.
    pub window: Duration,
    /// Only record peripherals that look like analyzers.
    pub analyzers_only: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5),
            analyzers_only: true,
        }
    }
}

impl ScanOptions {
    /// Create new scan options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scan window.
    #[must_use]
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set whether to filter for analyzers only.
    #[must_use]
    pub fn analyzers_only(mut self, filter: bool) -> Self {
        self.analyzers_only = filter;
        self
    }

    /// Record every peripheral, not just analyzers.
    #[must_use]
    pub fn all_devices(self) -> Self {
        self.analyzers_only(false)
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.window.is_zero() {
            return Err(Error::invalid_config("scan window must be greater than zero"));
        }
        Ok(())
    }
}

/// Why a scan produced nothing usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanDiagnostic {
    /// Bluetooth is switched off.
    AdapterOff,
    /// The application may not use Bluetooth.
    PermissionDenied,
    /// No adapter, or it failed to start scanning.
    AdapterUnavailable(String),
    /// The scan ran but found nothing.
    NoDevicesFound,
}

impl ScanDiagnostic {
    /// Human-readable guidance.
    pub fn message(&self) -> String {
        match self {
            ScanDiagnostic::AdapterOff => "Bluetooth is off".to_string(),
            ScanDiagnostic::PermissionDenied => "Bluetooth permission denied".to_string(),
            ScanDiagnostic::AdapterUnavailable(detail) => {
                format!("Bluetooth adapter unavailable: {detail}")
            }
            ScanDiagnostic::NoDevicesFound => "No devices found. Make sure the analyzer is \
                powered on and the vendor app is closed"
                .to_string(),
        }
    }
}

impl fmt::Display for ScanDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

impl From<Error> for ScanDiagnostic {
    fn from(err: Error) -> Self {
        match err {
            Error::AdapterOff => ScanDiagnostic::AdapterOff,
            Error::PermissionDenied => ScanDiagnostic::PermissionDenied,
            Error::AdapterUnavailable(detail) => ScanDiagnostic::AdapterUnavailable(detail),
            other => ScanDiagnostic::AdapterUnavailable(other.to_string()),
        }
    }
}

/// Result of a bounded scan.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// De-duplicated devices, strongest signal first.
    pub devices: Vec<DeviceHandle>,
    /// Set when `devices` is empty.
    pub diagnostic: Option<ScanDiagnostic>,
}

impl ScanReport {
    fn failed(diagnostic: ScanDiagnostic) -> Self {
        Self {
            devices: Vec::new(),
            diagnostic: Some(diagnostic),
        }
    }
}

struct ScannerInner {
    adapter: Arc<dyn BleAdapter>,
    options: ScanOptions,
    devices: Mutex<HashMap<String, DeviceHandle>>,
    generation: AtomicU64,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    updated: Notify,
    events: EventDispatcher,
    debug: DebugRecorder,
}

impl ScannerInner {
    fn devices(&self) -> MutexGuard<'_, HashMap<String, DeviceHandle>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a discovery if it belongs to the scan generation `generation`.
    fn record(&self, generation: u64, handle: DeviceHandle) -> bool {
        let mut devices = self.devices();
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        let is_new = !devices.contains_key(&handle.id);
        if is_new {
            debug!("Discovered {} ({:?} dBm)", handle.display_name(), handle.rssi);
            self.debug.append(format!(
                "scan: found {} [{}] rssi={:?}",
                handle.display_name(),
                handle.id,
                handle.rssi
            ));
        }
        let device = match &handle.name {
            Some(name) => DeviceId::with_name(handle.id.clone(), name.clone()),
            None => DeviceId::new(handle.id.clone()),
        };
        let rssi = handle.rssi;
        devices.insert(handle.id.clone(), handle);
        drop(devices);

        self.events.send(DeviceEvent::Discovered { device, rssi });
        self.updated.notify_waiters();
        true
    }
}

/// Scans for analyzers.
///
/// Cheap to clone; clones share the discovered-device table.
#[derive(Clone)]
pub struct DeviceScanner {
    inner: Arc<ScannerInner>,
}

impl fmt::Debug for DeviceScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceScanner")
            .field("options", &self.inner.options)
            .field("generation", &self.inner.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DeviceScanner {
    /// Create a scanner over `adapter`.
    pub fn new(adapter: Arc<dyn BleAdapter>, options: ScanOptions) -> Self {
        Self::with_observers(
            adapter,
            options,
            EventDispatcher::default(),
            DebugRecorder::default(),
        )
    }

    /// Create a scanner that reports to shared observers.
    pub fn with_observers(
        adapter: Arc<dyn BleAdapter>,
        options: ScanOptions,
        events: EventDispatcher,
        debug: DebugRecorder,
    ) -> Self {
        Self {
            inner: Arc::new(ScannerInner {
                adapter,
                options,
                devices: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                task: tokio::sync::Mutex::new(None),
                updated: Notify::new(),
                events,
                debug,
            }),
        }
    }

    /// Scan options in use.
    pub fn options(&self) -> &ScanOptions {
        &self.inner.options
    }

    /// Whether a scan is running.
    pub async fn is_scanning(&self) -> bool {
        self.inner.task.lock().await.is_some()
    }

    /// Start scanning. Idempotent: a running scan is left alone.
    ///
    /// The device table is cleared when a new scan starts.
    pub async fn start(&self) -> Result<()> {
        let mut task = self.inner.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        match self.inner.adapter.state().await {
            AdapterState::PoweredOn => {}
            AdapterState::PoweredOff => return Err(Error::AdapterOff),
            AdapterState::Unauthorized => return Err(Error::PermissionDenied),
            AdapterState::Unavailable => {
                return Err(Error::AdapterUnavailable(
                    "adapter state unknown".to_string(),
                ));
            }
        }

        let generation = {
            let mut devices = self.inner.devices();
            devices.clear();
            self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        let mut rx = self.inner.adapter.start_scan().await?;
        info!("Scanning for analyzers");
        self.inner.debug.append("scan: started");

        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move {
            while let Some(handle) = rx.recv().await {
                if inner.options.analyzers_only && !handle.is_analyzer() {
                    continue;
                }
                if !inner.record(generation, handle) {
                    break;
                }
            }
        }));
        Ok(())
    }

    /// Stop scanning. Idempotent.
    ///
    /// No discovery delivered after this returns is recorded.
    pub async fn stop(&self) {
        {
            let _devices = self.inner.devices();
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
        }

        let task = self.inner.task.lock().await.take();
        if let Some(task) = task {
            task.abort();
            if let Err(e) = self.inner.adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
            self.inner.debug.append("scan: stopped");
            info!("Scan stopped");
        }
        self.inner.updated.notify_waiters();
    }

    /// Devices recorded so far, strongest signal first.
    pub fn devices(&self) -> Vec<DeviceHandle> {
        let mut devices: Vec<DeviceHandle> = self.inner.devices().values().cloned().collect();
        devices.sort_by(|a, b| {
            b.rssi
                .unwrap_or(i16::MIN)
                .cmp(&a.rssi.unwrap_or(i16::MIN))
                .then_with(|| a.id.cmp(&b.id))
        });
        devices
    }

    /// Look up a recorded device by id.
    pub fn device(&self, id: &str) -> Option<DeviceHandle> {
        self.inner.devices().get(id).cloned()
    }

    /// Scan for `window` and report what was found. Never fails.
    pub async fn scan(&self, window: Duration) -> ScanReport {
        if let Err(e) = self.start().await {
            let diagnostic = ScanDiagnostic::from(e);
            warn!("Scan could not start: {}", diagnostic);
            self.inner.debug.append(format!("scan: {diagnostic}"));
            return ScanReport::failed(diagnostic);
        }

        sleep(window).await;
        self.stop().await;

        let devices = self.devices();
        info!("Scan complete. Found {} device(s)", devices.len());
        let diagnostic = if devices.is_empty() {
            self.inner.debug.append("scan: no devices found");
            Some(ScanDiagnostic::NoDevicesFound)
        } else {
            None
        };
        ScanReport {
            devices,
            diagnostic,
        }
    }

    /// Scan until a device with `id` is seen or `window` elapses.
    ///
    /// The scan is stopped before returning either way.
    pub async fn find(&self, id: &str, window: Duration) -> Result<Option<DeviceHandle>> {
        self.start().await?;
        let deadline = Instant::now() + window;

        let found = loop {
            let updated = self.inner.updated.notified();
            tokio::pin!(updated);
            updated.as_mut().enable();
            if let Some(handle) = self.device(id) {
                break Some(handle);
            }
            tokio::select! {
                _ = updated => {}
                _ = sleep_until(deadline) => break self.device(id),
            }
        };

        self.stop().await;
        Ok(found)
    }
}
