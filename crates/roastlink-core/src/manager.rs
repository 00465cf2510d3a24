//! Single-connection lifecycle management.
//!
//! [`ConnectionManager`] owns the one logical link to the analyzer and the
//! [`ConnectionState`] machine. State is published on a `watch` channel;
//! only the manager holds the sender, so every change goes through the
//! guarded transitions below.
//!
//! ```text
//! Idle ⇄ Scanning
//! Idle | Scanning → Connecting → Connected | Idle
//! Connected ⇄ Measuring
//! Connected | Measuring → Idle
//! any → Error → Idle (acknowledge)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use roastlink_types::{ConnectionState, DeviceInfo};

use crate::debug_log::{DEFAULT_CAPACITY, DebugRecorder};
use crate::error::{ConnectionFailureReason, Error, Result};
use crate::events::{DeviceEvent, DeviceId, DisconnectReason, EventDispatcher};
use crate::retry::{RetryConfig, with_retry};
use crate::scan::{DeviceScanner, ScanOptions, ScanReport};
use crate::traits::{BleAdapter, LinkEvent};

/// Default timeout for a connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default overall budget for auto-connect at start-up.
pub const DEFAULT_AUTO_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for the connection manager.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use roastlink_core::ConnectionConfig;
///
/// let config = ConnectionConfig::default()
///     .connect_timeout(Duration::from_secs(20))
///     .auto_connect_timeout(Duration::from_secs(30));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a link (connect plus service discovery).
    pub connect_timeout: Duration,
    /// Upper bound on tearing a link down.
    pub disconnect_timeout: Duration,
    /// Overall budget for [`ConnectionManager::auto_connect`].
    pub auto_connect_timeout: Duration,
    /// How long auto-connect scans for the bonded device.
    pub auto_connect_scan_window: Duration,
    /// Retry policy for the connect step of auto-connect.
    pub connect_retry: RetryConfig,
    /// Scan options used by the manager's scanner.
    pub scan_options: ScanOptions,
    /// Event channel capacity.
    pub event_capacity: usize,
    /// Debug log capacity.
    pub debug_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            disconnect_timeout: Duration::from_secs(5),
            auto_connect_timeout: DEFAULT_AUTO_CONNECT_TIMEOUT,
            auto_connect_scan_window: Duration::from_secs(8),
            connect_retry: RetryConfig::for_connect(),
            scan_options: ScanOptions::default(),
            event_capacity: 100,
            debug_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl ConnectionConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the disconnect timeout.
    #[must_use]
    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Set the auto-connect budget.
    #[must_use]
    pub fn auto_connect_timeout(mut self, timeout: Duration) -> Self {
        self.auto_connect_timeout = timeout;
        self
    }

    /// Set the auto-connect scan window.
    #[must_use]
    pub fn auto_connect_scan_window(mut self, window: Duration) -> Self {
        self.auto_connect_scan_window = window;
        self
    }

    /// Set the connect retry policy.
    #[must_use]
    pub fn connect_retry(mut self, retry: RetryConfig) -> Self {
        self.connect_retry = retry;
        self
    }

    /// Set the scan options.
    #[must_use]
    pub fn scan_options(mut self, options: ScanOptions) -> Self {
        self.scan_options = options;
        self
    }

    /// Set the debug log capacity.
    #[must_use]
    pub fn debug_capacity(mut self, capacity: usize) -> Self {
        self.debug_capacity = capacity;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(Error::invalid_config("connect_timeout must be greater than zero"));
        }
        if self.disconnect_timeout.is_zero() {
            return Err(Error::invalid_config(
                "disconnect_timeout must be greater than zero",
            ));
        }
        if self.auto_connect_timeout.is_zero() {
            return Err(Error::invalid_config(
                "auto_connect_timeout must be greater than zero",
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event_capacity must be greater than zero"));
        }
        self.scan_options.validate()?;
        self.connect_retry.validate()
    }
}

/// What a failed connect leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureMode {
    /// Move to `Error(reason)`; the user must acknowledge.
    Fault,
    /// Fall back to `Idle` silently (start-up auto-connect).
    Silent,
}

#[derive(Debug, Default)]
struct LinkSlot {
    device_id: Option<String>,
    token: Option<CancellationToken>,
    session: Option<CancellationToken>,
}

struct Shared {
    adapter: Arc<dyn BleAdapter>,
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    link: Mutex<LinkSlot>,
    bonded: Mutex<Option<String>>,
    info: Mutex<DeviceInfo>,
    generation: AtomicU64,
    scanner: DeviceScanner,
    events: EventDispatcher,
    debug: DebugRecorder,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Map a low-level connect error to a structured reason.
fn failure_reason(err: &Error) -> ConnectionFailureReason {
    match err {
        Error::ConnectionFailed { reason, .. } => reason.clone(),
        Error::Timeout { .. } => ConnectionFailureReason::Timeout,
        Error::DeviceNotFound(_) => ConnectionFailureReason::OutOfRange,
        Error::AdapterOff | Error::AdapterUnavailable(_) | Error::PermissionDenied => {
            ConnectionFailureReason::AdapterUnavailable
        }
        Error::CharacteristicNotFound(c) => {
            ConnectionFailureReason::GattFailure(format!("missing characteristic {c}"))
        }
        Error::Bluetooth(e) => ConnectionFailureReason::BleError(e.to_string()),
        other => ConnectionFailureReason::Other(other.to_string()),
    }
}

/// Handle to the single analyzer connection.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &*self.shared.state_tx.borrow())
            .field("device_id", &lock(&self.shared.link).device_id)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager over `adapter`.
    pub fn new(adapter: Arc<dyn BleAdapter>, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let events = EventDispatcher::new(config.event_capacity);
        let debug = DebugRecorder::new(config.debug_capacity);
        let scanner = DeviceScanner::with_observers(
            Arc::clone(&adapter),
            config.scan_options.clone(),
            events.clone(),
            debug.clone(),
        );
        let (state_tx, _) = watch::channel(ConnectionState::Idle);

        Ok(Self {
            shared: Arc::new(Shared {
                adapter,
                config,
                state_tx,
                link: Mutex::new(LinkSlot::default()),
                bonded: Mutex::new(None),
                info: Mutex::new(DeviceInfo::default()),
                generation: AtomicU64::new(0),
                scanner,
                events,
                debug,
            }),
        })
    }

    /// Remember `device_id` as the bonded device for auto-connect.
    #[must_use]
    pub fn with_bonded_device(self, device_id: impl Into<String>) -> Self {
        self.set_bonded_device(Some(device_id.into()));
        self
    }

    // --- Accessors ---

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// The platform adapter.
    pub fn adapter(&self) -> &Arc<dyn BleAdapter> {
        &self.shared.adapter
    }

    /// The manager's configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// The scanner driven by this manager.
    pub fn scanner(&self) -> &DeviceScanner {
        &self.shared.scanner
    }

    /// Event dispatcher shared by the manager, scanner and sessions.
    pub fn events(&self) -> &EventDispatcher {
        &self.shared.events
    }

    /// Debug log shared by the whole pipeline.
    pub fn debug_log(&self) -> &DebugRecorder {
        &self.shared.debug
    }

    /// Id of the connected device, if any.
    pub fn device_id(&self) -> Option<String> {
        lock(&self.shared.link).device_id.clone()
    }

    /// Number of successful connects so far.
    ///
    /// Changes before the state reaches `Connected`, so anything tagged with
    /// an older value belongs to a previous connection.
    pub fn connection_generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Device remembered for auto-connect.
    pub fn bonded_device(&self) -> Option<String> {
        lock(&self.shared.bonded).clone()
    }

    /// Set or clear the bonded device.
    pub fn set_bonded_device(&self, device_id: Option<String>) {
        *lock(&self.shared.bonded) = device_id;
    }

    /// Device information read for the current connection.
    pub fn device_info(&self) -> DeviceInfo {
        lock(&self.shared.info).clone()
    }

    /// Store values read from `device_id`.
    ///
    /// Ignored (returns `false`) if the link to `device_id` is no longer the
    /// current one, so reads that finish after a disconnect cannot leak into
    /// the next connection.
    pub(crate) fn store_device_info(&self, device_id: &str, info: &DeviceInfo) -> bool {
        let link = lock(&self.shared.link);
        if link.device_id.as_deref() != Some(device_id) {
            return false;
        }
        lock(&self.shared.info).fill_from(info);
        true
    }

    fn device_ident(&self, device_id: &str) -> DeviceId {
        match self.shared.scanner.device(device_id).and_then(|d| d.name) {
            Some(name) => DeviceId::with_name(device_id, name),
            None => DeviceId::new(device_id),
        }
    }

    // --- Transitions ---

    /// Move to `next` if `gate` accepts the current state and the edge is
    /// documented. Returns the previous state.
    fn try_transition<G>(&self, next: ConnectionState, gate: G) -> Result<ConnectionState>
    where
        G: FnOnce(&ConnectionState) -> Result<()>,
    {
        let mut outcome = Err(Error::Cancelled);
        self.shared.state_tx.send_if_modified(|current| {
            if let Err(e) = gate(current) {
                outcome = Err(e);
                return false;
            }
            if !current.can_transition_to(&next) {
                outcome = Err(Error::InvalidTransition {
                    from: current.clone(),
                    to: next.clone(),
                });
                return false;
            }
            outcome = Ok(std::mem::replace(current, next.clone()));
            true
        });

        let previous = outcome?;
        info!("Connection state: {} -> {}", previous, next);
        self.shared
            .debug
            .append(format!("state: {} -> {}", previous, next));
        self.shared.events.send(DeviceEvent::StateChanged {
            from: previous.clone(),
            to: next,
        });
        Ok(previous)
    }

    /// Move along a documented edge. Any other edge is rejected with
    /// [`Error::InvalidTransition`] and the state is left untouched.
    pub(crate) fn transition(&self, next: ConnectionState) -> Result<ConnectionState> {
        self.try_transition(next, |_| Ok(()))
    }

    /// Move to `next` only if the current state satisfies `pred`.
    fn transition_if<P>(&self, pred: P, next: ConnectionState) -> Option<ConnectionState>
    where
        P: FnOnce(&ConnectionState) -> bool,
    {
        self.try_transition(next, |current| {
            if pred(current) {
                Ok(())
            } else {
                Err(Error::Cancelled)
            }
        })
        .ok()
    }

    // --- Scanning ---

    fn scan_gate(operation: &'static str) -> impl FnOnce(&ConnectionState) -> Result<()> {
        move |current| match current {
            ConnectionState::Idle => Ok(()),
            other => Err(Error::invalid_state(operation, "idle", other.clone())),
        }
    }

    /// Start a background scan and move to `Scanning`.
    ///
    /// A no-op while already scanning. Rejected with
    /// [`Error::InvalidState`] in any other non-idle state.
    pub async fn start_scan(&self) -> Result<()> {
        if self.state() == ConnectionState::Scanning {
            debug!("start_scan: already scanning");
            return Ok(());
        }
        self.try_transition(ConnectionState::Scanning, Self::scan_gate("start_scan"))?;
        if let Err(e) = self.shared.scanner.start().await {
            self.transition_if(|s| *s == ConnectionState::Scanning, ConnectionState::Idle);
            return Err(e);
        }
        Ok(())
    }

    /// Stop a background scan. Idempotent.
    pub async fn stop_scan(&self) {
        self.shared.scanner.stop().await;
        self.transition_if(|s| *s == ConnectionState::Scanning, ConnectionState::Idle);
    }

    /// Scan for `window` and return what was found.
    ///
    /// Adapter problems and empty results are reported as a diagnostic in
    /// the report, not as an error.
    pub async fn scan(&self, window: Duration) -> Result<ScanReport> {
        self.try_transition(ConnectionState::Scanning, Self::scan_gate("scan"))?;
        let report = self.shared.scanner.scan(window).await;
        self.transition_if(|s| *s == ConnectionState::Scanning, ConnectionState::Idle);
        Ok(report)
    }

    // --- Connection ---

    /// Connect to `device_id`.
    ///
    /// Rejected with [`Error::AlreadyConnected`] while a link exists or is
    /// being set up, and with [`Error::InvalidState`] while an error is
    /// unacknowledged. A running scan is stopped first. On failure the
    /// state moves to `Error(reason)`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn connect(&self, device_id: &str) -> Result<()> {
        self.connect_with(device_id, FailureMode::Fault).await
    }

    async fn connect_with(&self, device_id: &str, mode: FailureMode) -> Result<()> {
        let previous = self.try_transition(ConnectionState::Connecting, |current| match current {
            ConnectionState::Idle | ConnectionState::Scanning => Ok(()),
            ConnectionState::Error(_) => Err(Error::invalid_state(
                "connect",
                "idle (acknowledge the error first)",
                current.clone(),
            )),
            other => Err(Error::AlreadyConnected(other.clone())),
        })?;
        if previous == ConnectionState::Scanning {
            self.shared.scanner.stop().await;
        }
        self.shared.debug.append(format!("connect: {device_id}"));

        // Subscribe before connecting so an immediate drop is not missed.
        let link_events = self.shared.adapter.link_events();
        let connect_timeout = self.shared.config.connect_timeout;
        let result = match timeout(connect_timeout, self.shared.adapter.connect(device_id)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("connect", connect_timeout)),
        };

        if let Err(e) = result {
            let reason = failure_reason(&e);
            warn!("Connection to {} failed: {}", device_id, reason);
            self.shared.debug.append(format!("connect: failed: {reason}"));
            self.teardown_link(device_id).await;
            let next = match mode {
                FailureMode::Fault => ConnectionState::Error(reason.to_string()),
                FailureMode::Silent => ConnectionState::Idle,
            };
            self.transition_if(|s| *s == ConnectionState::Connecting, next);
            return Err(Error::connection_failed(Some(device_id.to_string()), reason));
        }

        let token = CancellationToken::new();
        {
            let mut link = lock(&self.shared.link);
            link.device_id = Some(device_id.to_string());
            link.token = Some(token.clone());
            link.session = None;
        }
        *lock(&self.shared.info) = DeviceInfo::default();
        self.shared.generation.fetch_add(1, Ordering::AcqRel);

        if self
            .transition_if(|s| *s == ConnectionState::Connecting, ConnectionState::Connected)
            .is_none()
        {
            // Disconnected while the attempt was in flight.
            *lock(&self.shared.link) = LinkSlot::default();
            token.cancel();
            self.teardown_link(device_id).await;
            return Err(Error::Cancelled);
        }

        self.set_bonded_device(Some(device_id.to_string()));
        self.spawn_link_watcher(link_events, token, device_id.to_string());
        self.shared.events.send(DeviceEvent::Connected {
            device: self.device_ident(device_id),
        });
        self.shared.debug.append(format!("connect: connected to {device_id}"));
        Ok(())
    }

    fn spawn_link_watcher(
        &self,
        mut events: broadcast::Receiver<LinkEvent>,
        token: CancellationToken,
        device_id: String,
    ) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(LinkEvent::Disconnected { device_id: id }) if id == device_id => {
                            if let Some(shared) = shared.upgrade() {
                                ConnectionManager { shared }.handle_link_loss(&device_id);
                            }
                            break;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => {
                            warn!("Link watcher missed {} events", n);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    fn handle_link_loss(&self, device_id: &str) {
        warn!("Link to {} lost", device_id);
        self.shared.debug.append(format!("link: lost {device_id}"));
        self.release_link(Some(device_id), DisconnectReason::LinkLost);
    }

    /// Clear the link slot and move to `Idle`. With `expected` set, only
    /// the matching link is released.
    fn release_link(&self, expected: Option<&str>, reason: DisconnectReason) -> Option<String> {
        let slot = {
            let mut link = lock(&self.shared.link);
            if expected.is_some() && link.device_id.as_deref() != expected {
                return None;
            }
            std::mem::take(&mut *link)
        };
        if let Some(session) = &slot.session {
            session.cancel();
        }
        if let Some(token) = &slot.token {
            token.cancel();
        }
        *lock(&self.shared.info) = DeviceInfo::default();

        self.transition_if(
            |s| {
                matches!(
                    s,
                    ConnectionState::Connecting
                        | ConnectionState::Connected
                        | ConnectionState::Measuring
                )
            },
            ConnectionState::Idle,
        );

        if let Some(device_id) = &slot.device_id {
            self.shared.events.send(DeviceEvent::Disconnected {
                device: self.device_ident(device_id),
                reason,
            });
        }
        slot.device_id
    }

    async fn teardown_link(&self, device_id: &str) {
        let limit = self.shared.config.disconnect_timeout;
        match timeout(limit, self.shared.adapter.disconnect(device_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Disconnect from {} reported: {}", device_id, e),
            Err(_) => warn!("Disconnect from {} timed out after {:?}", device_id, limit),
        }
    }

    /// Disconnect. Always succeeds locally.
    ///
    /// Any running measurement is aborted, the platform link is torn down
    /// best-effort and the state returns to `Idle`. An unacknowledged
    /// `Error` state is left in place.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        if self.state() == ConnectionState::Scanning {
            self.stop_scan().await;
        }
        if let Some(device_id) = self.release_link(None, DisconnectReason::UserRequested) {
            self.teardown_link(&device_id).await;
            self.shared
                .debug
                .append(format!("disconnect: {device_id}"));
        } else {
            // A connect may be in flight without a link slot yet.
            self.transition_if(|s| *s == ConnectionState::Connecting, ConnectionState::Idle);
        }
        Ok(())
    }

    /// Move from `Error` back to `Idle`.
    pub fn acknowledge_error(&self) -> Result<()> {
        self.try_transition(ConnectionState::Idle, |current| match current {
            ConnectionState::Error(_) => Ok(()),
            other => Err(Error::invalid_state("acknowledge_error", "error", other.clone())),
        })
        .map(|_| ())
    }

    // --- Auto-connect ---

    /// Reconnect to the bonded device, if any.
    ///
    /// Scans for the bonded id and connects, all within
    /// [`ConnectionConfig::auto_connect_timeout`]. Returns `true` on success.
    /// Failure is silent: the state is left at `Idle` and nothing is
    /// surfaced to the user.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn auto_connect(&self) -> bool {
        let Some(device_id) = self.bonded_device() else {
            debug!("No bonded device, skipping auto-connect");
            return false;
        };

        let budget = self.shared.config.auto_connect_timeout;
        let outcome = timeout(budget, self.auto_connect_inner(&device_id)).await;
        match outcome {
            Ok(Ok(())) => {
                info!("Auto-connected to {}", device_id);
                true
            }
            Ok(Err(e)) => {
                info!("Auto-connect to {} failed: {}", device_id, e);
                self.shared.debug.append(format!("auto-connect: {e}"));
                self.settle_after_auto_connect(&device_id).await;
                false
            }
            Err(_) => {
                info!("Auto-connect to {} timed out after {:?}", device_id, budget);
                self.shared
                    .debug
                    .append(format!("auto-connect: timed out after {budget:?}"));
                self.settle_after_auto_connect(&device_id).await;
                false
            }
        }
    }

    async fn auto_connect_inner(&self, device_id: &str) -> Result<()> {
        self.try_transition(ConnectionState::Scanning, Self::scan_gate("auto_connect"))?;

        let window = self.shared.config.auto_connect_scan_window;
        match self.shared.scanner.find(device_id, window).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(Error::DeviceNotFound(device_id.to_string())),
            Err(e) => return Err(e),
        }

        with_retry(&self.shared.config.connect_retry, "auto_connect", || {
            self.connect_with(device_id, FailureMode::Silent)
        })
        .await
    }

    /// Return to `Idle` after an abandoned auto-connect.
    async fn settle_after_auto_connect(&self, device_id: &str) {
        if self.state() == ConnectionState::Scanning {
            self.stop_scan().await;
        }
        if self.state() == ConnectionState::Connecting {
            self.teardown_link(device_id).await;
            self.transition_if(|s| *s == ConnectionState::Connecting, ConnectionState::Idle);
        }
    }

    /// Run [`auto_connect`](Self::auto_connect) in the background.
    pub fn spawn_auto_connect(&self) -> JoinHandle<bool> {
        let manager = self.clone();
        tokio::spawn(async move { manager.auto_connect().await })
    }

    // --- Measurement gate ---

    /// Move `Connected → Measuring`.
    ///
    /// Returns a token that is cancelled when the link goes away.
    pub fn begin_measurement(&self) -> Result<CancellationToken> {
        self.try_transition(ConnectionState::Measuring, |current| match current {
            ConnectionState::Connected => Ok(()),
            other => Err(Error::invalid_state("measure", "connected", other.clone())),
        })?;

        let mut link = lock(&self.shared.link);
        match link.token.as_ref().map(CancellationToken::child_token) {
            Some(session) => {
                link.session = Some(session.clone());
                Ok(session)
            }
            None => {
                drop(link);
                self.transition_if(
                    |s| *s == ConnectionState::Measuring,
                    ConnectionState::Connected,
                );
                Err(Error::NotConnected)
            }
        }
    }

    /// Move `Measuring → Connected`. Returns `false` if not measuring.
    pub fn end_measurement(&self) -> bool {
        lock(&self.shared.link).session = None;
        self.transition_if(
            |s| *s == ConnectionState::Measuring,
            ConnectionState::Connected,
        )
        .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAdapter;

    const ID: &str = "AA:BB:CC:DD:EE:01";

    fn manager_with(adapter: &Arc<MockAdapter>) -> ConnectionManager {
        let config = ConnectionConfig::default().connect_retry(RetryConfig::none());
        ConnectionManager::new(adapter.clone(), config).unwrap()
    }

    #[test]
    fn test_config_validate() {
        assert!(ConnectionConfig::default().validate().is_ok());
        assert!(
            ConnectionConfig::default()
                .connect_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_failure_reason_mapping() {
        assert_eq!(
            failure_reason(&Error::timeout("connect", Duration::from_secs(1))),
            ConnectionFailureReason::Timeout
        );
        assert_eq!(
            failure_reason(&Error::DeviceNotFound("x".into())),
            ConnectionFailureReason::OutOfRange
        );
        assert_eq!(
            failure_reason(&Error::AdapterOff),
            ConnectionFailureReason::AdapterUnavailable
        );
    }

    #[tokio::test]
    async fn test_transition_rejects_undocumented_edge() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let manager = manager_with(&adapter);

        let err = manager.transition(ConnectionState::Measuring).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_connect_success() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let manager = manager_with(&adapter);
        let mut events = manager.events().subscribe();

        manager.connect(ID).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.device_id().as_deref(), Some(ID));
        assert_eq!(manager.bonded_device().as_deref(), Some(ID));

        let mut saw_connected = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, DeviceEvent::Connected { .. }) {
                saw_connected = true;
            }
        }
        assert!(saw_connected);
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let manager = manager_with(&adapter);
        manager.connect(ID).await.unwrap();

        let err = manager.connect(ID).await.unwrap_err();
        assert!(matches!(
            err,
            Error::AlreadyConnected(ConnectionState::Connected)
        ));
        assert_eq!(adapter.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_moves_to_error() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        adapter
            .fail_connects(
                1,
                ConnectionFailureReason::GattFailure("discovery failed".into()),
            )
            .await;
        let manager = manager_with(&adapter);

        let err = manager.connect(ID).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ConnectionFailed {
                reason: ConnectionFailureReason::GattFailure(_),
                ..
            }
        ));
        assert!(manager.state().is_error());

        // Must acknowledge before connecting again
        assert!(matches!(
            manager.connect(ID).await,
            Err(Error::InvalidState { .. })
        ));
        manager.acknowledge_error().unwrap();
        assert_eq!(manager.state(), ConnectionState::Idle);
        manager.connect(ID).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        adapter.set_connect_latency(Duration::from_secs(30));
        let manager = manager_with(&adapter);

        let err = manager.connect(ID).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ConnectionFailed {
                reason: ConnectionFailureReason::Timeout,
                ..
            }
        ));
        assert_eq!(
            manager.state(),
            ConnectionState::Error("connection timed out".into())
        );
    }

    #[tokio::test]
    async fn test_disconnect_always_ok() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let manager = manager_with(&adapter);

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Idle);

        manager.connect(ID).await.unwrap();
        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(manager.device_id().is_none());
        assert!(!adapter.is_connected_to(ID).await);
    }

    #[tokio::test]
    async fn test_link_loss_returns_to_idle() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let manager = manager_with(&adapter);
        manager.connect(ID).await.unwrap();
        let token = manager.begin_measurement().unwrap();

        let mut state = manager.subscribe_state();
        adapter.simulate_disconnect().await;
        state
            .wait_for(|s| *s == ConnectionState::Idle)
            .await
            .unwrap();

        assert!(token.is_cancelled());
        assert!(manager.device_id().is_none());
    }

    #[tokio::test]
    async fn test_measurement_gate() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let manager = manager_with(&adapter);

        assert!(matches!(
            manager.begin_measurement(),
            Err(Error::InvalidState { .. })
        ));

        manager.connect(ID).await.unwrap();
        let _token = manager.begin_measurement().unwrap();
        assert_eq!(manager.state(), ConnectionState::Measuring);
        assert!(manager.begin_measurement().is_err());

        assert!(manager.end_measurement());
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(!manager.end_measurement());
    }

    #[tokio::test]
    async fn test_scan_rejected_while_connected() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let manager = manager_with(&adapter);
        manager.connect(ID).await.unwrap();

        assert!(matches!(
            manager.start_scan().await,
            Err(Error::InvalidState { .. })
        ));
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_start_and_stop_scan_are_idempotent() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let manager = manager_with(&adapter);

        manager.start_scan().await.unwrap();
        manager.start_scan().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Scanning);
        assert!(adapter.is_scanning().await);

        manager.stop_scan().await;
        manager.stop_scan().await;
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(!adapter.is_scanning().await);
    }

    #[tokio::test]
    async fn test_connect_stops_active_scan() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let manager = manager_with(&adapter);

        manager.start_scan().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Scanning);
        assert!(adapter.is_scanning().await);

        manager.connect(ID).await.unwrap();
        assert!(!adapter.is_scanning().await);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_auto_connect_without_bonded_device() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let manager = manager_with(&adapter);
        assert!(!manager.auto_connect().await);
        assert_eq!(adapter.scan_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_connect_success() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let manager = manager_with(&adapter).with_bonded_device(ID);

        assert!(manager.spawn_auto_connect().await.unwrap());
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_connect_failure_is_silent() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        adapter
            .fail_connects(1, ConnectionFailureReason::GattFailure("busy".into()))
            .await;
        let manager = manager_with(&adapter).with_bonded_device(ID);

        assert!(!manager.auto_connect().await);
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_connect_unknown_device_times_out_to_idle() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let manager = manager_with(&adapter).with_bonded_device("FF:FF:FF:FF:FF:FF");

        assert!(!manager.auto_connect().await);
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(!adapter.is_scanning().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_connect_retries_transient_failures() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        adapter
            .fail_connects(1, ConnectionFailureReason::OutOfRange)
            .await;
        let config = ConnectionConfig::default()
            .connect_retry(RetryConfig::new(2).jitter(false));
        let manager = ConnectionManager::new(adapter.clone(), config)
            .unwrap()
            .with_bonded_device(ID);

        assert!(manager.auto_connect().await);
        assert_eq!(adapter.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_connect_budget() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        adapter.set_connect_latency(Duration::from_secs(60));
        let config = ConnectionConfig::default()
            .connect_timeout(Duration::from_secs(60))
            .connect_retry(RetryConfig::none());
        let manager = ConnectionManager::new(adapter.clone(), config)
            .unwrap()
            .with_bonded_device(ID);

        let started = tokio::time::Instant::now();
        assert!(!manager.auto_connect().await);
        assert!(started.elapsed() <= DEFAULT_AUTO_CONNECT_TIMEOUT + Duration::from_secs(6));
        assert_eq!(manager.state(), ConnectionState::Idle);
    }
}
