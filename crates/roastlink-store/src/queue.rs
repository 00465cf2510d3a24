//! SQLite implementation of the offline queue.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rusqlite::{Connection, params};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use roastlink_core::{MeasurementPayload, OfflineQueue, SyncQueueItem};

use crate::error::{Error, Result};
use crate::schema;

/// Durable [`OfflineQueue`] backed by a SQLite database.
///
/// Statements are short, so they run inline on the calling task.
pub struct SqliteQueue {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteQueue")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

struct Row {
    client_id: String,
    payload: String,
    enqueued_at: i64,
    attempts: u32,
    last_error: Option<String>,
}

impl Row {
    fn into_item(self) -> Result<SyncQueueItem> {
        let corrupt = |reason: String| Error::CorruptRow {
            client_id: self.client_id.clone(),
            reason,
        };
        let client_id = Uuid::parse_str(&self.client_id).map_err(|e| corrupt(e.to_string()))?;
        let payload: MeasurementPayload = serde_json::from_str(&self.payload)?;
        if payload.client_id != client_id {
            return Err(corrupt(format!(
                "payload belongs to {}",
                payload.client_id
            )));
        }
        let enqueued_at = OffsetDateTime::from_unix_timestamp(self.enqueued_at)
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(SyncQueueItem {
            client_id,
            payload,
            enqueued_at,
            attempts: self.attempts,
            last_error: self.last_error,
        })
    }
}

impl SqliteQueue {
    /// Open or create a queue database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening offline queue at {}", path.display());
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        schema::initialize(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open the default queue location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory queue (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Database file, or `None` for an in-memory queue.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `item` unless its client id is already queued.
    ///
    /// Returns whether a row was added.
    pub fn insert(&self, item: &SyncQueueItem) -> Result<bool> {
        let payload = serde_json::to_string(&item.payload)?;
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO sync_queue
                (client_id, payload, coffee_type, linked_type, linked_id,
                 enqueued_at, attempts, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                item.client_id.to_string(),
                payload,
                item.payload.coffee_type.to_string(),
                item.payload.linked_type.map(|k| k.as_str()),
                item.payload.linked_id,
                item.enqueued_at.unix_timestamp(),
                item.attempts,
                item.last_error,
            ],
        )?;

        if inserted == 0 {
            debug!("Measurement {} already queued", item.client_id);
        } else {
            debug!("Queued measurement {}", item.client_id);
        }
        Ok(inserted > 0)
    }

    /// All queued items, oldest first.
    ///
    /// Rows that cannot be decoded are skipped with a warning so one bad
    /// row never blocks the rest of the queue.
    pub fn items(&self) -> Result<Vec<SyncQueueItem>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT client_id, payload, enqueued_at, attempts, last_error
             FROM sync_queue ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Row {
                    client_id: row.get(0)?,
                    payload: row.get(1)?,
                    enqueued_at: row.get(2)?,
                    attempts: row.get(3)?,
                    last_error: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match row.into_item() {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!("Skipping queue row: {}", e);
                    None
                }
            })
            .collect())
    }

    /// Delete the item for `client_id`. Returns whether it existed.
    pub fn delete(&self, client_id: Uuid) -> Result<bool> {
        let deleted = self.conn().execute(
            "DELETE FROM sync_queue WHERE client_id = ?1",
            [client_id.to_string()],
        )?;
        Ok(deleted > 0)
    }

    /// Increment the attempt count for `client_id` and store `error`.
    pub fn mark_failed(&self, client_id: Uuid, error: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE sync_queue SET attempts = attempts + 1, last_error = ?2
             WHERE client_id = ?1",
            params![client_id.to_string(), error],
        )?;
        Ok(())
    }

    /// Number of queued rows, including rows [`items`](Self::items) skips
    /// as corrupt.
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[async_trait]
impl OfflineQueue for SqliteQueue {
    async fn enqueue(&self, item: SyncQueueItem) -> roastlink_core::Result<()> {
        self.insert(&item)?;
        Ok(())
    }

    async fn pending(&self) -> roastlink_core::Result<Vec<SyncQueueItem>> {
        Ok(self.items()?)
    }

    async fn remove(&self, client_id: Uuid) -> roastlink_core::Result<bool> {
        Ok(self.delete(client_id)?)
    }

    async fn record_failure(&self, client_id: Uuid, error: &str) -> roastlink_core::Result<()> {
        Ok(self.mark_failed(client_id, error)?)
    }

    // Only rows that decode can ever be flushed.
    async fn len(&self) -> roastlink_core::Result<usize> {
        Ok(self.items()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use roastlink_types::{CoffeeType, LinkKind, LinkTarget, MeasurementReading};
    use tempfile::TempDir;

    fn payload(moisture: f32, link: Option<LinkTarget>) -> MeasurementPayload {
        let reading = MeasurementReading {
            moisture: Some(moisture),
            ..Default::default()
        };
        MeasurementPayload {
            client_id: Uuid::new_v4(),
            coffee_type: CoffeeType::Green,
            started_at: OffsetDateTime::now_utc(),
            completed_at: Some(OffsetDateTime::now_utc()),
            reading,
            linked_type: link.as_ref().map(|l| l.kind),
            linked_id: link.map(|l| l.id),
            device_serial: Some("CL-2041-0042".to_string()),
        }
    }

    #[test]
    fn test_insert_is_idempotent() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let item = SyncQueueItem::new(payload(10.5, None));

        assert!(queue.insert(&item).unwrap());
        assert!(!queue.insert(&item).unwrap());
        assert_eq!(queue.count().unwrap(), 1);
    }

    #[test]
    fn test_items_are_fifo() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let first = SyncQueueItem::new(payload(10.0, None));
        let second = SyncQueueItem::new(payload(11.0, None));
        queue.insert(&first).unwrap();
        queue.insert(&second).unwrap();

        let items = queue.items().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].client_id, first.client_id);
        assert_eq!(items[1].client_id, second.client_id);
    }

    #[test]
    fn test_payload_round_trips() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let item = SyncQueueItem::new(payload(9.75, Some(LinkTarget::roast("roast-12"))));
        queue.insert(&item).unwrap();

        let stored = queue.items().unwrap().remove(0);
        assert_eq!(stored.payload, item.payload);
        assert_eq!(stored.payload.linked_type, Some(LinkKind::Roast));
        assert_eq!(
            stored.enqueued_at.unix_timestamp(),
            item.enqueued_at.unix_timestamp()
        );
    }

    #[test]
    fn test_mark_failed_and_delete() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let item = SyncQueueItem::new(payload(10.0, None));
        queue.insert(&item).unwrap();

        queue.mark_failed(item.client_id, "connection refused").unwrap();
        queue.mark_failed(item.client_id, "HTTP 503").unwrap();
        let stored = queue.items().unwrap().remove(0);
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.last_error.as_deref(), Some("HTTP 503"));

        assert!(queue.delete(item.client_id).unwrap());
        assert!(!queue.delete(item.client_id).unwrap());
        assert_eq!(queue.count().unwrap(), 0);
    }

    #[test]
    fn test_corrupt_row_is_skipped() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let good = SyncQueueItem::new(payload(10.0, None));
        queue.insert(&good).unwrap();
        queue
            .conn()
            .execute(
                "INSERT INTO sync_queue (client_id, payload, coffee_type, enqueued_at)
                 VALUES ('not-a-uuid', '{}', 'green', 0)",
                [],
            )
            .unwrap();

        let items = queue.items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].client_id, good.client_id);
    }

    #[tokio::test]
    async fn test_pending_len_ignores_corrupt_rows() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        queue
            .insert(&SyncQueueItem::new(payload(10.0, None)))
            .unwrap();
        queue
            .conn()
            .execute(
                "INSERT INTO sync_queue (client_id, payload, coffee_type, enqueued_at)
                 VALUES ('not-a-uuid', '{}', 'green', 0)",
                [],
            )
            .unwrap();

        assert_eq!(queue.count().unwrap(), 2);
        assert_eq!(OfflineQueue::len(&queue).await.unwrap(), 1);
        assert_eq!(queue.pending().await.unwrap().len(), 1);
    }

    #[test]
    fn test_items_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("queue.db");
        let item = SyncQueueItem::new(payload(12.25, Some(LinkTarget::inventory("lot-7"))));

        {
            let queue = SqliteQueue::open(&path).unwrap();
            assert_eq!(queue.path(), Some(path.as_path()));
            queue.insert(&item).unwrap();
            queue.mark_failed(item.client_id, "offline").unwrap();
        }

        let queue = SqliteQueue::open(&path).unwrap();
        let items = queue.items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].client_id, item.client_id);
        assert_eq!(items[0].attempts, 1);
        assert_eq!(items[0].payload.reading.moisture, Some(12.25));
    }

    #[tokio::test]
    async fn test_offline_queue_trait() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let item = SyncQueueItem::new(payload(10.0, None));

        queue.enqueue(item.clone()).await.unwrap();
        queue.enqueue(item.clone()).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);
        assert!(!queue.is_empty().await.unwrap());

        queue
            .record_failure(item.client_id, "timeout")
            .await
            .unwrap();
        assert_eq!(queue.pending().await.unwrap()[0].attempts, 1);

        assert!(queue.remove(item.client_id).await.unwrap());
        assert!(queue.is_empty().await.unwrap());
    }
}
