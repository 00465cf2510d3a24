//! Durable offline queue for roastlink measurements.
//!
//! [`SqliteQueue`] stores completed measurements that could not be uploaded
//! yet and implements [`roastlink_core::OfflineQueue`], so it plugs straight
//! into a [`roastlink_core::PersistenceGateway`]. Items survive restarts and
//! are keyed by the measurement's client id.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use roastlink_core::{MockMeasurementApi, PersistenceGateway};
//! use roastlink_store::SqliteQueue;
//!
//! let queue = SqliteQueue::open_default()?;
//! let gateway = PersistenceGateway::new(Arc::new(MockMeasurementApi::new()), Arc::new(queue));
//! # Ok::<(), roastlink_store::Error>(())
//! ```

mod error;
mod queue;
mod schema;

pub use error::{Error, Result};
pub use queue::SqliteQueue;
pub use schema::SCHEMA_VERSION;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/roastlink/queue.db`
/// - macOS: `~/Library/Application Support/roastlink/queue.db`
/// - Windows: `C:\Users\<user>\AppData\Local\roastlink\queue.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("roastlink")
        .join("queue.db")
}
