use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::{
    db::SqliteJobStore,
    error::{Result, SchedulerError},
    memory::MemoryJobStore,
    types::{JobRecord, JobState},
};

/// Persistence boundary for job records.
///
/// Implementations must make [`JobStore::try_claim`] atomic: of any number of
/// concurrent callers for the same `pending` job, exactly one sees `true`.
/// That transition is the only mutual exclusion the engine relies on.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new record.
    async fn create(&self, job: &JobRecord) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<JobRecord>>;

    /// `pending` jobs whose due time is at or before `now`, earliest first.
    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>>;

    /// Atomically move a job from `pending` to `claimed`.
    ///
    /// Returns `false` when the job is missing or not `pending`.
    async fn try_claim(&self, id: &str) -> Result<bool>;

    /// Overwrite every mutable field of an existing record.
    async fn update(&self, job: &JobRecord) -> Result<()>;

    /// Returns `true` if a record was removed.
    async fn delete(&self, id: &str) -> Result<bool>;

    async fn find_in_state(&self, states: &[JobState]) -> Result<Vec<JobRecord>>;

    /// Every record, oldest first.
    async fn list(&self) -> Result<Vec<JobRecord>>;
}

/// Open the store named by a connection string.
///
/// | String                 | Store                          |
/// |------------------------|--------------------------------|
/// | `memory`, `memory://`  | [`MemoryJobStore`] (ephemeral) |
/// | `sqlite://<path>`      | [`SqliteJobStore`] at `<path>` |
/// | `sqlite::memory:`      | in-memory SQLite               |
pub fn open_store(connection: &str) -> Result<Arc<dyn JobStore>> {
    let connection = connection.trim();
    if connection == "memory" || connection == "memory://" {
        info!("using ephemeral in-memory job store");
        return Ok(Arc::new(MemoryJobStore::new()));
    }
    if connection == "sqlite::memory:" {
        return Ok(Arc::new(SqliteJobStore::open_in_memory()?));
    }
    if let Some(path) = connection.strip_prefix("sqlite://") {
        if path.is_empty() {
            return Err(SchedulerError::StoreUnavailable(
                "sqlite store needs a file path".to_string(),
            ));
        }
        info!(path = %path, "opening SQLite job store");
        return Ok(Arc::new(SqliteJobStore::open(path)?));
    }
    Err(SchedulerError::StoreUnavailable(format!(
        "unsupported store connection string: {connection}"
    )))
}
