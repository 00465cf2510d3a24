//! Saving completed measurements, with an offline queue.
//!
//! [`PersistenceGateway::save`] never loses a completed measurement: if the
//! backend cannot be reached the payload goes to the [`OfflineQueue`], and if
//! the queue itself fails it is kept in an in-memory spill buffer that is
//! re-offered on the next flush. Every submission carries the session's
//! client id as its idempotency key, so re-submitting after an ambiguous
//! failure cannot create duplicates.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use roastlink_types::{CoffeeType, LinkKind, LinkTarget, MeasurementReading};

use crate::debug_log::DebugRecorder;
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, EventDispatcher};
use crate::retry::RetryConfig;
use crate::session::SessionState;

/// Default timeout for one backend request.
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Body posted to the backend for one completed measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementPayload {
    /// Client-generated id; also the idempotency key.
    pub client_id: Uuid,
    /// Coffee type the measurement was taken with.
    pub coffee_type: CoffeeType,
    /// Session start.
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// Session completion.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    /// Measured values.
    pub reading: MeasurementReading,
    /// Kind of linked record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_type: Option<LinkKind>,
    /// Id of the linked record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_id: Option<String>,
    /// Serial of the analyzer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_serial: Option<String>,
}

impl MeasurementPayload {
    /// Build the payload for a session, linked to `link` if given.
    pub fn from_session(session: &SessionState, link: Option<&LinkTarget>) -> Self {
        Self {
            client_id: session.client_id,
            coffee_type: session.coffee_type,
            started_at: session.started_at,
            completed_at: session.completed_at,
            reading: session.reading,
            linked_type: link.map(|l| l.kind),
            linked_id: link.map(|l| l.id.clone()),
            device_serial: session.device_serial.clone(),
        }
    }

    /// The link target, when both kind and id are set.
    pub fn link(&self) -> Option<LinkTarget> {
        match (self.linked_type, &self.linked_id) {
            (Some(kind), Some(id)) => Some(LinkTarget::new(kind, id.clone())),
            _ => None,
        }
    }
}

/// A measurement as listed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMeasurement {
    /// Backend id.
    pub id: String,
    /// Client id the measurement was submitted with.
    #[serde(default)]
    pub client_id: Option<Uuid>,
    /// Coffee type.
    pub coffee_type: CoffeeType,
    /// When the measurement was completed (or created on the backend).
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Measured values.
    #[serde(default)]
    pub reading: MeasurementReading,
    /// Kind of linked record.
    #[serde(default)]
    pub linked_type: Option<LinkKind>,
    /// Id of the linked record.
    #[serde(default)]
    pub linked_id: Option<String>,
}

/// Errors reported by a [`MeasurementApi`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ApiError {
    /// The backend could not be reached.
    #[error("Backend not reachable: {0}")]
    Transport(String),

    /// The backend answered with an error status.
    #[error("Backend returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Error message from the response body.
        message: String,
    },

    /// A measurement with this client id already exists.
    #[error("Measurement already exists on the backend")]
    Duplicate,

    /// The response could not be interpreted.
    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),

    /// The request did not finish in time.
    #[error("Backend request timed out after {0:?}")]
    Timeout(Duration),

    /// The backend URL is not usable.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Whether the backend already holds this measurement.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ApiError::Duplicate | ApiError::Status { status: 409, .. })
    }
}

/// Backend that stores measurements.
#[async_trait]
pub trait MeasurementApi: Send + Sync {
    /// Submit a completed measurement. Returns the backend id if the
    /// backend reports one.
    async fn submit(
        &self,
        payload: &MeasurementPayload,
    ) -> std::result::Result<Option<String>, ApiError>;

    /// List the most recent measurements, newest first.
    async fn recent(&self, limit: usize) -> std::result::Result<Vec<RemoteMeasurement>, ApiError>;
}

/// A measurement waiting to be uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Client id (unique within the queue).
    pub client_id: Uuid,
    /// What will be submitted.
    pub payload: MeasurementPayload,
    /// When the item was queued.
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
    /// Submission attempts so far.
    pub attempts: u32,
    /// Error from the most recent attempt.
    pub last_error: Option<String>,
}

impl SyncQueueItem {
    /// Queue item for `payload`, not yet attempted.
    pub fn new(payload: MeasurementPayload) -> Self {
        Self {
            client_id: payload.client_id,
            payload,
            enqueued_at: OffsetDateTime::now_utc(),
            attempts: 0,
            last_error: None,
        }
    }

    /// Record a failed attempt.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.into());
    }
}

/// Storage for measurements awaiting upload.
///
/// Implementations must make [`enqueue`](OfflineQueue::enqueue) idempotent
/// by client id.
#[async_trait]
pub trait OfflineQueue: Send + Sync {
    /// Add an item. An item with the same client id is left as is.
    async fn enqueue(&self, item: SyncQueueItem) -> Result<()>;

    /// All pending items, oldest first.
    async fn pending(&self) -> Result<Vec<SyncQueueItem>>;

    /// Remove an item. Returns whether it existed.
    async fn remove(&self, client_id: Uuid) -> Result<bool>;

    /// Bump the attempt count and store the error.
    async fn record_failure(&self, client_id: Uuid, error: &str) -> Result<()>;

    /// Number of pending items.
    async fn len(&self) -> Result<usize>;

    /// Whether the queue is empty.
    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// In-memory [`OfflineQueue`]. Contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    items: tokio::sync::Mutex<Vec<SyncQueueItem>>,
    failing: std::sync::atomic::AtomicBool,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail, to exercise the spill path.
    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            Err(Error::Queue("memory queue unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl OfflineQueue for MemoryQueue {
    async fn enqueue(&self, item: SyncQueueItem) -> Result<()> {
        self.check()?;
        let mut items = self.items.lock().await;
        if !items.iter().any(|i| i.client_id == item.client_id) {
            items.push(item);
        }
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<SyncQueueItem>> {
        self.check()?;
        Ok(self.items.lock().await.clone())
    }

    async fn remove(&self, client_id: Uuid) -> Result<bool> {
        self.check()?;
        let mut items = self.items.lock().await;
        let before = items.len();
        items.retain(|i| i.client_id != client_id);
        Ok(items.len() != before)
    }

    async fn record_failure(&self, client_id: Uuid, error: &str) -> Result<()> {
        self.check()?;
        if let Some(item) = self
            .items
            .lock()
            .await
            .iter_mut()
            .find(|i| i.client_id == client_id)
        {
            item.record_failure(error);
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        self.check()?;
        Ok(self.items.lock().await.len())
    }
}

/// Result of [`PersistenceGateway::save`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SaveOutcome {
    /// The backend accepted the measurement.
    Saved {
        /// Backend id, if reported.
        remote_id: Option<String>,
    },
    /// The backend was unavailable; the measurement will be uploaded later.
    OfflineQueued {
        /// Client id of the queued measurement.
        client_id: Uuid,
    },
}

impl SaveOutcome {
    /// Whether the backend has the measurement now.
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved { .. })
    }
}

/// Result of [`PersistenceGateway::flush_queue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Items accepted by the backend.
    pub submitted: usize,
    /// Items the backend already had.
    pub duplicates: usize,
    /// Items that failed again.
    pub failed: usize,
    /// Items still pending afterwards.
    pub remaining: usize,
}

impl FlushReport {
    /// Whether every attempted item went through.
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Durable,
    Spill,
}

struct GatewayInner {
    api: Arc<dyn MeasurementApi>,
    queue: Arc<dyn OfflineQueue>,
    spill: Mutex<Vec<SyncQueueItem>>,
    flush_lock: tokio::sync::Mutex<()>,
    events: EventDispatcher,
    debug: DebugRecorder,
}

impl GatewayInner {
    fn spill(&self) -> MutexGuard<'_, Vec<SyncQueueItem>> {
        self.spill.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Submits completed measurements and manages the offline queue.
///
/// Cheap to clone; clones share the spill buffer and the flush lock.
#[derive(Clone)]
pub struct PersistenceGateway {
    inner: Arc<GatewayInner>,
    submit_timeout: Duration,
}

impl std::fmt::Debug for PersistenceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceGateway")
            .field("submit_timeout", &self.submit_timeout)
            .field("spilled", &self.inner.spill().len())
            .finish_non_exhaustive()
    }
}

impl PersistenceGateway {
    /// Create a gateway over `api` and `queue`.
    pub fn new(api: Arc<dyn MeasurementApi>, queue: Arc<dyn OfflineQueue>) -> Self {
        Self::with_observers(api, queue, EventDispatcher::default(), DebugRecorder::default())
    }

    /// Create a gateway that reports to shared observers.
    pub fn with_observers(
        api: Arc<dyn MeasurementApi>,
        queue: Arc<dyn OfflineQueue>,
        events: EventDispatcher,
        debug: DebugRecorder,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                api,
                queue,
                spill: Mutex::new(Vec::new()),
                flush_lock: tokio::sync::Mutex::new(()),
                events,
                debug,
            }),
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
        }
    }

    /// Set the per-request timeout.
    #[must_use]
    pub fn submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    async fn submit(&self, payload: &MeasurementPayload) -> std::result::Result<Option<String>, ApiError> {
        match timeout(self.submit_timeout, self.inner.api.submit(payload)).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout(self.submit_timeout)),
        }
    }

    /// Save a completed measurement.
    ///
    /// `link` overrides the link target recorded on the session. Fails only
    /// with [`Error::NotComplete`]; backend and queue failures degrade to
    /// [`SaveOutcome::OfflineQueued`].
    #[tracing::instrument(level = "info", skip_all, fields(client_id = %session.client_id))]
    pub async fn save(
        &self,
        session: &SessionState,
        link: Option<LinkTarget>,
    ) -> Result<SaveOutcome> {
        if !session.measurement_complete {
            return Err(Error::NotComplete);
        }

        let link = link.or_else(|| session.link.clone());
        let payload = MeasurementPayload::from_session(session, link.as_ref());
        let client_id = payload.client_id;

        let error = match self.submit(&payload).await {
            Ok(remote_id) => {
                info!("Measurement {} saved (remote id {:?})", client_id, remote_id);
                return Ok(self.saved(client_id, remote_id));
            }
            Err(e) if e.is_duplicate() => {
                debug!("Measurement {} already on the backend", client_id);
                return Ok(self.saved(client_id, None));
            }
            Err(e) => e,
        };

        warn!("Saving measurement {} failed, queueing: {}", client_id, error);
        let mut item = SyncQueueItem::new(payload);
        item.record_failure(error.to_string());
        self.enqueue(item).await;

        self.inner
            .debug
            .append(format!("save: {client_id} queued offline: {error}"));
        self.inner
            .events
            .send(DeviceEvent::OfflineQueued { client_id });
        Ok(SaveOutcome::OfflineQueued { client_id })
    }

    fn saved(&self, client_id: Uuid, remote_id: Option<String>) -> SaveOutcome {
        self.inner.debug.append(format!("save: {client_id} saved"));
        self.inner.events.send(DeviceEvent::Saved {
            client_id,
            remote_id: remote_id.clone(),
        });
        SaveOutcome::Saved { remote_id }
    }

    async fn enqueue(&self, item: SyncQueueItem) {
        if let Err(e) = self.inner.queue.enqueue(item.clone()).await {
            warn!("Offline queue unavailable, keeping {} in memory: {}", item.client_id, e);
            let mut spill = self.inner.spill();
            if !spill.iter().any(|i| i.client_id == item.client_id) {
                spill.push(item);
            }
        }
    }

    /// Move spilled items into the durable queue where possible.
    async fn reoffer_spill(&self) {
        let spilled: Vec<SyncQueueItem> = self.inner.spill().clone();
        for item in spilled {
            if self.inner.queue.enqueue(item.clone()).await.is_ok() {
                self.inner.spill().retain(|i| i.client_id != item.client_id);
            }
        }
    }

    async fn forget(&self, source: Source, client_id: Uuid) {
        match source {
            Source::Durable => {
                if let Err(e) = self.inner.queue.remove(client_id).await {
                    warn!("Failed to remove {} from offline queue: {}", client_id, e);
                }
            }
            Source::Spill => self.inner.spill().retain(|i| i.client_id != client_id),
        }
    }

    async fn note_failure(&self, source: Source, client_id: Uuid, error: &ApiError) {
        let message = error.to_string();
        match source {
            Source::Durable => {
                if let Err(e) = self.inner.queue.record_failure(client_id, &message).await {
                    debug!("Failed to record attempt for {}: {}", client_id, e);
                }
            }
            Source::Spill => {
                if let Some(item) = self
                    .inner
                    .spill()
                    .iter_mut()
                    .find(|i| i.client_id == client_id)
                {
                    item.record_failure(message);
                }
            }
        }
    }

    /// Submit every pending item.
    ///
    /// Items are removed when the backend accepts them or reports them as
    /// duplicates; otherwise the attempt is recorded and they stay queued.
    /// Concurrent flushes are serialized.
    pub async fn flush_queue(&self) -> FlushReport {
        let _flushing = self.inner.flush_lock.lock().await;
        self.reoffer_spill().await;

        let durable = match self.inner.queue.pending().await {
            Ok(items) => items,
            Err(e) => {
                warn!("Offline queue unavailable during flush: {}", e);
                Vec::new()
            }
        };
        let spilled: Vec<SyncQueueItem> = self.inner.spill().clone();

        let mut report = FlushReport::default();
        let items = durable
            .into_iter()
            .map(|item| (Source::Durable, item))
            .chain(spilled.into_iter().map(|item| (Source::Spill, item)));

        for (source, item) in items {
            let client_id = item.client_id;
            match self.submit(&item.payload).await {
                Ok(remote_id) => {
                    report.submitted += 1;
                    self.forget(source, client_id).await;
                    self.saved(client_id, remote_id);
                }
                Err(e) if e.is_duplicate() => {
                    report.duplicates += 1;
                    self.forget(source, client_id).await;
                    self.saved(client_id, None);
                }
                Err(e) => {
                    report.failed += 1;
                    debug!("Queued measurement {} still failing: {}", client_id, e);
                    self.note_failure(source, client_id, &e).await;
                }
            }
        }

        report.remaining = match self.pending_count().await {
            Ok(count) => count,
            Err(_) => self.inner.spill().len(),
        };
        if report.submitted + report.duplicates + report.failed > 0 {
            info!(
                "Offline queue flush: {} submitted, {} duplicate, {} failed, {} remaining",
                report.submitted, report.duplicates, report.failed, report.remaining
            );
            self.inner.debug.append(format!(
                "flush: submitted={} duplicates={} failed={} remaining={}",
                report.submitted, report.duplicates, report.failed, report.remaining
            ));
        }
        report
    }

    /// Flush the queue periodically until `token` is cancelled.
    ///
    /// After a flush with failures the next attempt backs off following
    /// [`RetryConfig::for_sync`]; a clean flush resets to `interval`.
    pub fn spawn_flush_loop(&self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            let backoff = RetryConfig::for_sync();
            let mut failures: u32 = 0;
            loop {
                let delay = match failures {
                    0 => interval,
                    n => backoff.delay_for_attempt(n - 1).max(interval),
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(delay) => {}
                }

                let report = gateway.flush_queue().await;
                if report.is_clean() {
                    failures = 0;
                } else {
                    failures = failures.saturating_add(1);
                    debug!("Next flush in {:?}", backoff.delay_for_attempt(failures - 1));
                }
            }
        })
    }

    /// List recent measurements from the backend.
    pub async fn recent(&self, limit: usize) -> Result<Vec<RemoteMeasurement>> {
        match timeout(self.submit_timeout, self.inner.api.recent(limit)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ApiError::Timeout(self.submit_timeout).into()),
        }
    }

    /// Items waiting for upload, including any spilled to memory.
    pub async fn pending(&self) -> Result<Vec<SyncQueueItem>> {
        let mut items = self.inner.queue.pending().await?;
        for item in self.inner.spill().iter() {
            if !items.iter().any(|i| i.client_id == item.client_id) {
                items.push(item.clone());
            }
        }
        Ok(items)
    }

    /// Number of items waiting for upload.
    pub async fn pending_count(&self) -> Result<usize> {
        let durable = self.inner.queue.len().await?;
        Ok(durable + self.inner.spill().len())
    }
}
