//! Measurement session orchestration.
//!
//! A session subscribes to the measurement characteristic, sends the start
//! command and folds every notification into one [`SessionState`] until the
//! analyzer reports completion, an error, or a timeout fires.
//!
//! ```text
//! Started → Receiving → [SecondaryPhase ⇄ Receiving] → Complete
//!                     ↘ TimedOut | Failed | Cancelled
//! ```
//!
//! The secondary (water activity) phase can take one to three minutes. It is
//! tracked separately from the session timeout and never fails the session
//! on its own: when its timeout fires the flag is simply cleared.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use roastlink_types::uuid::{COMMAND, MEASUREMENT_DATA};
use roastlink_types::{CoffeeType, ConnectionState, LinkTarget, MeasurementField, MeasurementReading};

use crate::codec::{Command, Decoded, ProtocolEvent, decode, encode};
use crate::error::{Error, Result};
use crate::events::DeviceEvent;
use crate::manager::ConnectionManager;
use crate::traits::BleAdapter;

/// Phase of a measurement session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementPhase {
    /// Start command sent, nothing received yet.
    Started,
    /// Values are arriving.
    Receiving,
    /// The water-activity sub-measurement is running.
    SecondaryPhase,
    /// The analyzer reported completion (or the checklist fallback fired).
    Complete,
    /// The session timeout elapsed.
    TimedOut,
    /// The device reported an error or the link was lost.
    Failed,
    /// Cancelled by the user.
    Cancelled,
}

impl MeasurementPhase {
    /// Whether the session can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MeasurementPhase::Complete
                | MeasurementPhase::TimedOut
                | MeasurementPhase::Failed
                | MeasurementPhase::Cancelled
        )
    }

    /// Short label for display.
    pub fn label(self) -> &'static str {
        match self {
            MeasurementPhase::Started => "started",
            MeasurementPhase::Receiving => "receiving",
            MeasurementPhase::SecondaryPhase => "secondary phase",
            MeasurementPhase::Complete => "complete",
            MeasurementPhase::TimedOut => "timed out",
            MeasurementPhase::Failed => "failed",
            MeasurementPhase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MeasurementPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Fields that must be present before the checklist fallback may complete
/// a session of the given coffee type.
pub fn mandatory_fields(coffee_type: CoffeeType) -> &'static [MeasurementField] {
    match coffee_type {
        CoffeeType::Auto => &[MeasurementField::Moisture],
        CoffeeType::Green => &[MeasurementField::Moisture, MeasurementField::Density],
        CoffeeType::Roasted => &[MeasurementField::Moisture, MeasurementField::Agtron],
    }
}

/// Session timing configuration.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use roastlink_core::SessionConfig;
///
/// let config = SessionConfig::default()
///     .checklist_fallback(false)
///     .session_timeout(Duration::from_secs(120));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Overall limit for one measurement.
    pub session_timeout: Duration,
    /// Limit for the secondary phase; clears the flag when it fires.
    pub secondary_phase_timeout: Duration,
    /// Complete without the completion event once the mandatory fields
    /// are in and no secondary phase is pending. Off by default: the
    /// analyzer's completion event is authoritative.
    pub checklist_fallback: bool,
    /// How long the checklist must stay satisfied before completing.
    pub checklist_grace: Duration,
    /// Timeout for writing a command.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(300),
            secondary_phase_timeout: Duration::from_secs(180),
            checklist_fallback: false,
            checklist_grace: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session timeout.
    #[must_use]
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the secondary phase timeout.
    #[must_use]
    pub fn secondary_phase_timeout(mut self, timeout: Duration) -> Self {
        self.secondary_phase_timeout = timeout;
        self
    }

    /// Enable or disable the checklist fallback.
    #[must_use]
    pub fn checklist_fallback(mut self, enabled: bool) -> Self {
        self.checklist_fallback = enabled;
        self
    }

    /// Set the checklist grace period.
    #[must_use]
    pub fn checklist_grace(mut self, grace: Duration) -> Self {
        self.checklist_grace = grace;
        self
    }

    /// Set the command write timeout.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.session_timeout.is_zero() {
            return Err(Error::invalid_config("session_timeout must be greater than zero"));
        }
        if self.secondary_phase_timeout.is_zero() {
            return Err(Error::invalid_config(
                "secondary_phase_timeout must be greater than zero",
            ));
        }
        if self.write_timeout.is_zero() {
            return Err(Error::invalid_config("write_timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// How a notification ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The analyzer reported completion.
    Completed,
    /// The analyzer reported an error.
    DeviceError(u8),
}

/// Observable state of one measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    /// Client-generated id, used as the idempotency key when saving.
    pub client_id: Uuid,
    /// Coffee type the measurement was started with.
    pub coffee_type: CoffeeType,
    /// When the session started.
    pub started_at: OffsetDateTime,
    /// When the session completed.
    pub completed_at: Option<OffsetDateTime>,
    /// Current phase.
    pub phase: MeasurementPhase,
    /// True between the secondary-phase start signal and its end signal
    /// (or timeout).
    pub awaiting_secondary_phase: bool,
    /// True once the measurement is complete; the only save precondition.
    pub measurement_complete: bool,
    /// Values received so far.
    pub reading: MeasurementReading,
    /// Backend record to link the measurement to.
    pub link: Option<LinkTarget>,
    /// Serial of the analyzer that took the measurement.
    pub device_serial: Option<String>,
    /// Why the session failed, for terminal non-complete phases.
    pub failure: Option<String>,
}

impl SessionState {
    /// Fresh session in the `Started` phase.
    pub fn new(coffee_type: CoffeeType, link: Option<LinkTarget>) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            coffee_type,
            started_at: OffsetDateTime::now_utc(),
            completed_at: None,
            phase: MeasurementPhase::Started,
            awaiting_secondary_phase: false,
            measurement_complete: false,
            reading: MeasurementReading::new(),
            link,
            device_serial: None,
            failure: None,
        }
    }

    /// Whether the session has ended.
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Fold one decoded notification into the session.
    ///
    /// Values are merged (last write wins per field), then events are
    /// applied in order. Returns the end condition if an event ended the
    /// session. Terminal sessions ignore input entirely.
    pub fn apply(&mut self, decoded: &Decoded) -> Option<SessionEnd> {
        if self.is_terminal() {
            return None;
        }

        if !decoded.reading.is_empty() {
            self.reading.merge(&decoded.reading);
            if self.phase == MeasurementPhase::Started {
                self.phase = MeasurementPhase::Receiving;
            }
        }

        for event in &decoded.events {
            match event {
                ProtocolEvent::SecondaryPhaseStarted => {
                    self.awaiting_secondary_phase = true;
                    self.phase = MeasurementPhase::SecondaryPhase;
                }
                ProtocolEvent::SecondaryPhaseEnded => self.end_secondary_phase(),
                ProtocolEvent::MeasurementComplete => return Some(SessionEnd::Completed),
                ProtocolEvent::DeviceError(code) => return Some(SessionEnd::DeviceError(*code)),
                ProtocolEvent::Acknowledged => {
                    if self.phase == MeasurementPhase::Started {
                        self.phase = MeasurementPhase::Receiving;
                    }
                }
            }
        }
        None
    }

    /// Clear the secondary-phase flag.
    pub fn end_secondary_phase(&mut self) {
        if !self.awaiting_secondary_phase {
            return;
        }
        self.awaiting_secondary_phase = false;
        if self.phase == MeasurementPhase::SecondaryPhase {
            self.phase = MeasurementPhase::Receiving;
        }
    }

    /// Mark the session complete.
    pub fn complete(&mut self) {
        self.phase = MeasurementPhase::Complete;
        self.measurement_complete = true;
        self.awaiting_secondary_phase = false;
        self.completed_at = Some(OffsetDateTime::now_utc());
    }

    /// End the session in a non-complete terminal phase.
    pub fn fail(&mut self, phase: MeasurementPhase, reason: impl Into<String>) {
        debug_assert!(phase.is_terminal() && phase != MeasurementPhase::Complete);
        self.phase = phase;
        self.awaiting_secondary_phase = false;
        self.failure = Some(reason.into());
    }

    /// Whether the checklist fallback may complete the session: every
    /// mandatory field is present and no secondary phase is pending.
    pub fn checklist_satisfied(&self) -> bool {
        !self.awaiting_secondary_phase
            && self.reading.has_all(mandatory_fields(self.coffee_type))
    }
}

struct LiveSession {
    coffee_type: CoffeeType,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

struct SessionInner {
    manager: ConnectionManager,
    config: SessionConfig,
    state_tx: watch::Sender<Option<SessionState>>,
    /// Connection generation the published session belongs to.
    generation: AtomicU64,
    live: Mutex<Option<LiveSession>>,
}

impl SessionInner {
    fn live(&self) -> MutexGuard<'_, Option<LiveSession>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget a finished session that belongs to an earlier connection.
    fn discard_stale(&self) {
        if self.live().is_some() {
            return;
        }
        let current = self.manager.connection_generation();
        if self.generation.swap(current, Ordering::AcqRel) != current {
            let cleared = self.state_tx.send_if_modified(|state| state.take().is_some());
            if cleared {
                debug!("Dropped session from a previous connection");
            }
        }
    }
}

async fn reset_on_reconnect(
    inner: Weak<SessionInner>,
    mut states: watch::Receiver<ConnectionState>,
) {
    while states.changed().await.is_ok() {
        let connected = *states.borrow_and_update() == ConnectionState::Connected;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if connected {
            inner.discard_stale();
        }
    }
}

/// Releases the session's resources however `measure` exits.
struct SessionGuard {
    inner: Arc<SessionInner>,
    adapter: Arc<dyn BleAdapter>,
    device_id: String,
    done_tx: watch::Sender<bool>,
    unsubscribed: bool,
}

impl SessionGuard {
    async fn release(&mut self) {
        let manager = &self.inner.manager;
        if manager.state().is_connected()
            && manager.device_id().as_deref() == Some(self.device_id.as_str())
        {
            if let Err(e) = self.adapter.unsubscribe(&self.device_id, MEASUREMENT_DATA).await {
                debug!("Unsubscribe after measurement failed: {}", e);
            }
        }
        self.unsubscribed = true;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.unsubscribed {
            // The measure future was dropped mid-session.
            let adapter = Arc::clone(&self.adapter);
            let device_id = self.device_id.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = adapter.unsubscribe(&device_id, MEASUREMENT_DATA).await;
                });
            }
        }
        self.inner.manager.end_measurement();
        *self.inner.live() = None;
        let _ = self.done_tx.send(true);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Runs measurements on the manager's connection.
///
/// Cheap to clone; clones share the current session.
#[derive(Clone)]
pub struct MeasurementSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for MeasurementSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeasurementSession")
            .field("config", &self.inner.config)
            .field("phase", &self.snapshot().map(|s| s.phase))
            .finish_non_exhaustive()
    }
}

impl MeasurementSession {
    /// Create a session runner over `manager`'s connection.
    ///
    /// A session left over from an earlier connection is dropped as soon as
    /// the manager connects again.
    pub fn new(manager: ConnectionManager, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(None);
        let generation = AtomicU64::new(manager.connection_generation());
        let session = Self {
            inner: Arc::new(SessionInner {
                manager,
                config,
                state_tx,
                generation,
                live: Mutex::new(None),
            }),
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let states = session.inner.manager.subscribe_state();
            handle.spawn(reset_on_reconnect(Arc::downgrade(&session.inner), states));
        }
        session
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// The current (or last) session on this connection, if any.
    pub fn snapshot(&self) -> Option<SessionState> {
        self.inner.discard_stale();
        self.inner.state_tx.borrow().clone()
    }

    /// Watch the current session.
    pub fn subscribe(&self) -> watch::Receiver<Option<SessionState>> {
        self.inner.discard_stale();
        self.inner.state_tx.subscribe()
    }

    /// Whether a measurement is running.
    pub fn is_running(&self) -> bool {
        self.inner.live().is_some()
    }

    fn publish(&self, session: &SessionState) {
        let previous = self.inner.state_tx.send_replace(Some(session.clone()));
        let phase_changed = previous
            .as_ref()
            .is_none_or(|p| p.client_id != session.client_id || p.phase != session.phase);
        if phase_changed {
            debug!("Session {} phase: {}", session.client_id, session.phase);
            self.inner.manager.events().send(DeviceEvent::PhaseChanged {
                client_id: session.client_id,
                phase: session.phase,
            });
        }
    }

    fn record(&self, message: String) {
        self.inner.manager.debug_log().append(message);
    }

    /// Run one measurement to completion.
    ///
    /// Requires the connection to be `Connected`; the connection is held in
    /// `Measuring` for the duration and restored afterwards. Returns the
    /// completed session, or the error that ended it. The final state is
    /// also available from [`snapshot`](Self::snapshot) either way.
    #[tracing::instrument(level = "info", skip(self, link))]
    pub async fn measure(
        &self,
        coffee_type: CoffeeType,
        link: Option<LinkTarget>,
    ) -> Result<SessionState> {
        let manager = &self.inner.manager;
        let state = manager.state();
        if state != ConnectionState::Connected {
            return Err(Error::invalid_state("measure", "connected", state));
        }
        let device_id = manager.device_id().ok_or(Error::NotConnected)?;
        let adapter = Arc::clone(manager.adapter());

        let mut rx = adapter.subscribe(&device_id, MEASUREMENT_DATA).await?;
        let link_token = match manager.begin_measurement() {
            Ok(token) => token,
            Err(e) => {
                let _ = adapter.unsubscribe(&device_id, MEASUREMENT_DATA).await;
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        *self.inner.live() = Some(LiveSession {
            coffee_type,
            cancel: cancel.clone(),
            done: done_rx,
        });
        let mut guard = SessionGuard {
            inner: Arc::clone(&self.inner),
            adapter: Arc::clone(&adapter),
            device_id: device_id.clone(),
            done_tx,
            unsubscribed: false,
        };

        let mut session = SessionState::new(coffee_type, link);
        session.device_serial = manager.device_info().serial;
        self.inner
            .generation
            .store(manager.connection_generation(), Ordering::Release);
        info!(
            "Measurement {} started ({})",
            session.client_id, session.coffee_type
        );
        self.record(format!(
            "session: started {} coffee_type={}",
            session.client_id, session.coffee_type
        ));
        self.publish(&session);

        let result = self
            .run(&*adapter, &device_id, &mut session, &mut rx, &cancel, &link_token)
            .await;

        drop(rx);
        guard.release().await;
        drop(guard);

        match &result {
            Ok(()) => {
                info!("Measurement {} complete", session.client_id);
                self.record(format!("session: complete {}", session.client_id));
            }
            Err(e) => {
                warn!("Measurement {} ended: {}", session.client_id, e);
                self.record(format!("session: {} ended: {}", session.client_id, e));
            }
        }
        result.map(|()| session)
    }

    async fn run(
        &self,
        adapter: &dyn BleAdapter,
        device_id: &str,
        session: &mut SessionState,
        rx: &mut mpsc::Receiver<Vec<u8>>,
        cancel: &CancellationToken,
        link_token: &CancellationToken,
    ) -> Result<()> {
        let config = &self.inner.config;

        let command = encode(Command::StartMeasurement, session.coffee_type);
        let written = match timeout(config.write_timeout, adapter.write(device_id, COMMAND, &command))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("start measurement", config.write_timeout)),
        };
        if let Err(e) = written {
            session.fail(MeasurementPhase::Failed, e.to_string());
            self.publish(session);
            return Err(e);
        }

        let started = Instant::now();
        let session_deadline = started + config.session_timeout;
        let mut secondary_deadline: Option<Instant> = None;
        let mut checklist_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    session.fail(MeasurementPhase::Cancelled, "cancelled by user");
                    self.publish(session);
                    return Err(Error::Cancelled);
                }
                _ = link_token.cancelled() => {
                    session.fail(MeasurementPhase::Failed, "link to the analyzer was lost");
                    self.publish(session);
                    return Err(Error::SessionAborted("link to the analyzer was lost".to_string()));
                }
                _ = sleep_until(session_deadline) => {
                    let elapsed = started.elapsed();
                    session.fail(MeasurementPhase::TimedOut, format!("no completion after {elapsed:?}"));
                    self.publish(session);
                    return Err(Error::MeasurementTimeout { elapsed });
                }
                _ = sleep_until_opt(secondary_deadline) => {
                    warn!(
                        "Secondary phase did not end within {:?}, continuing",
                        config.secondary_phase_timeout
                    );
                    self.record("session: secondary phase timed out".to_string());
                    secondary_deadline = None;
                    session.end_secondary_phase();
                    self.publish(session);
                }
                _ = sleep_until_opt(checklist_deadline) => {
                    info!("All mandatory fields present, completing without completion event");
                    self.record("session: completed by checklist".to_string());
                    // The analyzer never said it was done; stop it before
                    // the subscription goes away.
                    let command = encode(Command::CancelMeasurement, session.coffee_type);
                    match timeout(config.write_timeout, adapter.write(device_id, COMMAND, &command)).await {
                        Ok(Ok(())) => self.record("session: cancel sent after checklist".to_string()),
                        Ok(Err(e)) => warn!("Cancel after checklist completion failed: {}", e),
                        Err(_) => warn!("Cancel after checklist completion timed out"),
                    }
                    session.complete();
                    self.publish(session);
                    return Ok(());
                }
                data = rx.recv() => {
                    let Some(data) = data else {
                        session.fail(MeasurementPhase::Failed, "notification stream closed");
                        self.publish(session);
                        return Err(Error::SessionAborted("notification stream closed".to_string()));
                    };

                    let decoded = decode(&data);
                    for warning in &decoded.warnings {
                        warn!("Protocol warning: {}", warning);
                        self.record(format!("decode: {warning}"));
                    }

                    let was_awaiting = session.awaiting_secondary_phase;
                    let end = session.apply(&decoded);

                    if !decoded.reading.is_empty() {
                        self.inner.manager.events().send(DeviceEvent::Reading {
                            client_id: session.client_id,
                            reading: session.reading,
                        });
                    }
                    for event in &decoded.events {
                        self.record(format!("event: {event}"));
                    }

                    match end {
                        Some(SessionEnd::Completed) => {
                            session.complete();
                            self.publish(session);
                            return Ok(());
                        }
                        Some(SessionEnd::DeviceError(code)) => {
                            session.fail(
                                MeasurementPhase::Failed,
                                format!("device error 0x{code:02X}"),
                            );
                            self.publish(session);
                            return Err(Error::DeviceReported { code });
                        }
                        None => {}
                    }

                    if session.awaiting_secondary_phase && !was_awaiting {
                        secondary_deadline = Some(Instant::now() + config.secondary_phase_timeout);
                    } else if !session.awaiting_secondary_phase {
                        secondary_deadline = None;
                    }
                    self.publish(session);
                }
            }

            if config.checklist_fallback && session.checklist_satisfied() {
                if checklist_deadline.is_none() {
                    debug!("Checklist satisfied, completing in {:?}", config.checklist_grace);
                    checklist_deadline = Some(Instant::now() + config.checklist_grace);
                }
            } else {
                checklist_deadline = None;
            }
        }
    }

    /// Cancel the running measurement, if any.
    ///
    /// Sends the cancel command best-effort before stopping the session
    /// loop. Returns `false` when nothing was running.
    pub async fn cancel(&self) -> bool {
        let live = self
            .inner
            .live()
            .as_ref()
            .map(|l| (l.coffee_type, l.cancel.clone()));
        let Some((coffee_type, token)) = live else {
            return false;
        };

        let manager = &self.inner.manager;
        if let Some(device_id) = manager.device_id() {
            let command = encode(Command::CancelMeasurement, coffee_type);
            let limit = self.inner.config.write_timeout;
            match timeout(limit, manager.adapter().write(&device_id, COMMAND, &command)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Cancel command failed: {}", e),
                Err(_) => debug!("Cancel command timed out after {:?}", limit),
            }
        }
        token.cancel();
        true
    }

    /// Drop the current session.
    ///
    /// A running session is cancelled and this waits until it has released
    /// its subscription before resetting the observable state.
    pub async fn clear_current(&self) {
        let live = self
            .inner
            .live()
            .as_ref()
            .map(|l| (l.cancel.clone(), l.done.clone()));
        if let Some((cancel, mut done)) = live {
            cancel.cancel();
            // An error means the session is already gone.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.inner.state_tx.send_replace(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{event_record, field_record};
    use crate::manager::ConnectionConfig;
    use crate::mock::MockAdapter;

    const ID: &str = "AA:BB:CC:DD:EE:01";

    fn decoded(records: &[Vec<u8>]) -> Decoded {
        decode(&records.concat())
    }

    async fn connected() -> (Arc<MockAdapter>, MeasurementSession) {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let manager = ConnectionManager::new(adapter.clone(), ConnectionConfig::default()).unwrap();
        manager.connect(ID).await.unwrap();
        (adapter, MeasurementSession::new(manager, SessionConfig::default()))
    }

    #[test]
    fn test_mandatory_fields() {
        assert_eq!(mandatory_fields(CoffeeType::Auto), &[MeasurementField::Moisture]);
        assert!(mandatory_fields(CoffeeType::Green).contains(&MeasurementField::Density));
        assert!(mandatory_fields(CoffeeType::Roasted).contains(&MeasurementField::Agtron));
    }

    #[test]
    fn test_config_validate() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(
            SessionConfig::default()
                .session_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_apply_merges_and_moves_to_receiving() {
        let mut state = SessionState::new(CoffeeType::Green, None);
        let end = state.apply(&decoded(&[field_record(MeasurementField::Moisture, 10.5)]));
        assert_eq!(end, None);
        assert_eq!(state.phase, MeasurementPhase::Receiving);

        state.apply(&decoded(&[field_record(MeasurementField::Density, 690.0)]));
        assert_eq!(state.reading.moisture, Some(10.5));
        assert_eq!(state.reading.density, Some(690.0));
    }

    #[test]
    fn test_secondary_phase_flag() {
        let mut state = SessionState::new(CoffeeType::Green, None);
        state.apply(&decoded(&[event_record(ProtocolEvent::SecondaryPhaseStarted)]));
        assert!(state.awaiting_secondary_phase);
        assert_eq!(state.phase, MeasurementPhase::SecondaryPhase);

        // Chamber temperatures keep streaming during the phase
        state.apply(&decoded(&[field_record(MeasurementField::MirrorTemperature, 24.1)]));
        assert!(state.awaiting_secondary_phase);
        assert_eq!(state.reading.mirror_temperature, Some(24.1));

        state.apply(&decoded(&[event_record(ProtocolEvent::SecondaryPhaseEnded)]));
        assert!(!state.awaiting_secondary_phase);
        assert_eq!(state.phase, MeasurementPhase::Receiving);
    }

    #[test]
    fn test_terminal_state_ignores_input() {
        let mut state = SessionState::new(CoffeeType::Auto, None);
        state.apply(&decoded(&[field_record(MeasurementField::Moisture, 11.0)]));
        state.complete();

        let end = state.apply(&decoded(&[
            field_record(MeasurementField::Moisture, 99.0),
            event_record(ProtocolEvent::DeviceError(3)),
        ]));
        assert_eq!(end, None);
        assert_eq!(state.reading.moisture, Some(11.0));
        assert_eq!(state.phase, MeasurementPhase::Complete);
    }

    #[test]
    fn test_end_conditions() {
        let mut state = SessionState::new(CoffeeType::Auto, None);
        assert_eq!(
            state.apply(&decoded(&[event_record(ProtocolEvent::MeasurementComplete)])),
            Some(SessionEnd::Completed)
        );

        let mut state = SessionState::new(CoffeeType::Auto, None);
        assert_eq!(
            state.apply(&decoded(&[event_record(ProtocolEvent::DeviceError(0x21))])),
            Some(SessionEnd::DeviceError(0x21))
        );
    }

    #[test]
    fn test_checklist_requires_no_pending_phase() {
        let mut state = SessionState::new(CoffeeType::Roasted, None);
        state.apply(&decoded(&[
            field_record(MeasurementField::Moisture, 2.1),
            field_record(MeasurementField::Agtron, 58.0),
            event_record(ProtocolEvent::SecondaryPhaseStarted),
        ]));
        assert!(!state.checklist_satisfied());
        state.end_secondary_phase();
        assert!(state.checklist_satisfied());
    }

    #[tokio::test]
    async fn test_measure_requires_connection() {
        let adapter = Arc::new(MockAdapter::with_analyzer(ID));
        let manager = ConnectionManager::new(adapter.clone(), ConnectionConfig::default()).unwrap();
        let session = MeasurementSession::new(manager.clone(), SessionConfig::default());

        let err = session.measure(CoffeeType::Green, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(adapter.subscribe_count(), 0);
    }

    #[tokio::test]
    async fn test_measure_completes_on_event() {
        let (adapter, session) = connected().await;
        let task = tokio::spawn({
            let session = session.clone();
            async move { session.measure(CoffeeType::Auto, None).await }
        });

        adapter.wait_subscribed().await;
        adapter
            .notify(
                [
                    field_record(MeasurementField::Moisture, 11.4),
                    event_record(ProtocolEvent::MeasurementComplete),
                ]
                .concat(),
            )
            .await;

        let state = task.await.unwrap().unwrap();
        assert!(state.measurement_complete);
        assert!(state.completed_at.is_some());
        assert_eq!(state.reading.moisture, Some(11.4));
        assert_eq!(state.device_serial, None);

        // Start command was written with the coffee type byte
        let writes = adapter.writes().await;
        assert_eq!(writes[0], (COMMAND, vec![0x10, 0x00]));
        assert!(!adapter.is_subscribed());
        assert_eq!(session.inner.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_device_error_fails_session() {
        let (adapter, session) = connected().await;
        let task = tokio::spawn({
            let session = session.clone();
            async move { session.measure(CoffeeType::Green, None).await }
        });

        adapter.wait_subscribed().await;
        adapter
            .notify(event_record(ProtocolEvent::DeviceError(0x07)))
            .await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::DeviceReported { code: 0x07 }));
        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.phase, MeasurementPhase::Failed);
        assert!(!snapshot.measurement_complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_timeout() {
        let (adapter, session) = connected().await;
        let task = tokio::spawn({
            let session = session.clone();
            async move { session.measure(CoffeeType::Green, None).await }
        });

        adapter.wait_subscribed().await;
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::MeasurementTimeout { .. }));
        assert_eq!(session.snapshot().unwrap().phase, MeasurementPhase::TimedOut);
        assert_eq!(session.inner.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_cancel_sends_command() {
        let (adapter, session) = connected().await;
        let task = tokio::spawn({
            let session = session.clone();
            async move { session.measure(CoffeeType::Roasted, None).await }
        });

        adapter.wait_subscribed().await;
        while !session.is_running() {
            tokio::task::yield_now().await;
        }
        assert!(session.cancel().await);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(session.snapshot().unwrap().phase, MeasurementPhase::Cancelled);
        assert!(
            adapter
                .writes()
                .await
                .iter()
                .any(|(_, data)| data == &vec![0x11])
        );
        assert!(!session.cancel().await);
    }

    #[tokio::test]
    async fn test_clear_current_waits_for_release() {
        let (adapter, session) = connected().await;
        let task = tokio::spawn({
            let session = session.clone();
            async move { session.measure(CoffeeType::Auto, None).await }
        });

        adapter.wait_subscribed().await;
        while !session.is_running() {
            tokio::task::yield_now().await;
        }
        session.clear_current().await;

        assert!(session.snapshot().is_none());
        assert!(!adapter.is_subscribed());
        assert!(!session.is_running());
        assert!(task.await.unwrap().is_err());
    }
}
