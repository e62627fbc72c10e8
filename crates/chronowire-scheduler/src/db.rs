use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};
use tracing::warn;

use crate::{
    error::{Result, SchedulerError},
    store::JobStore,
    types::{JobRecord, JobState},
};

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `chrono_jobs` table (idempotent) and an index on
/// `(state, due_at)` so the due-job query stays cheap with many records.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS chrono_jobs (
            id                   TEXT    NOT NULL PRIMARY KEY,
            type_name            TEXT    NOT NULL,
            chronology           TEXT    NOT NULL,
            schedule             TEXT    NOT NULL,   -- JSON-encoded Schedule enum
            payload              TEXT    NOT NULL,   -- opaque JSON payload
            state                TEXT    NOT NULL DEFAULT 'pending',
            reference            TEXT    NOT NULL,
            due_at               TEXT    NOT NULL,   -- RFC 3339, millisecond precision, Z
            last_error           TEXT,
            last_run             TEXT,
            run_count            INTEGER NOT NULL DEFAULT 0,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            created_at           TEXT    NOT NULL,
            updated_at           TEXT    NOT NULL
        ) STRICT;

        -- Due-job polling: WHERE state = 'pending' AND due_at <= ? ORDER BY due_at
        CREATE INDEX IF NOT EXISTS idx_chrono_jobs_state_due ON chrono_jobs (state, due_at);
        ",
    )?;
    Ok(())
}

const COLUMNS: &str = "id, type_name, chronology, schedule, payload, state, reference, due_at,
     last_error, last_run, run_count, consecutive_failures, created_at, updated_at";

/// Durable job store backed by a single SQLite connection.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("sqlite connection lock poisoned".into()))
    }

    fn query(&self, sql: &str, args: &[String]) -> Result<Vec<JobRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let rows: Vec<RawJob> = stmt
            .query_map(params_from_iter(args.iter()), RawJob::from_row)?
            .collect::<rusqlite::Result<_>>()?;
        // Rows that fail to decode are skipped rather than poisoning the query.
        Ok(rows
            .into_iter()
            .filter_map(|raw| {
                let id = raw.id.clone();
                raw.into_record()
                    .map_err(|e| warn!(job_id = %id, "skipping undecodable job row: {e}"))
                    .ok()
            })
            .collect())
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{s}': {e}"))
}

/// Column values exactly as stored.
struct RawJob {
    id: String,
    type_name: String,
    chronology: String,
    schedule: String,
    payload: String,
    state: String,
    reference: String,
    due_at: String,
    last_error: Option<String>,
    last_run: Option<String>,
    run_count: u32,
    consecutive_failures: u32,
    created_at: String,
    updated_at: String,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            type_name: row.get(1)?,
            chronology: row.get(2)?,
            schedule: row.get(3)?,
            payload: row.get(4)?,
            state: row.get(5)?,
            reference: row.get(6)?,
            due_at: row.get(7)?,
            last_error: row.get(8)?,
            last_run: row.get(9)?,
            run_count: row.get(10)?,
            consecutive_failures: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_record(self) -> std::result::Result<JobRecord, String> {
        Ok(JobRecord {
            chronology: self.chronology.parse()?,
            schedule: serde_json::from_str(&self.schedule).map_err(|e| e.to_string())?,
            payload: serde_json::from_str(&self.payload).map_err(|e| e.to_string())?,
            state: self.state.parse()?,
            due_at: parse_ts(&self.due_at)?,
            last_run: self.last_run.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            type_name: self.type_name,
            reference: self.reference,
            last_error: self.last_error,
            run_count: self.run_count,
            consecutive_failures: self.consecutive_failures,
        })
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: &JobRecord) -> Result<()> {
        let schedule = serde_json::to_string(&job.schedule)?;
        let payload = serde_json::to_string(&job.payload)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO chrono_jobs ({COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)"
            ),
            params![
                job.id,
                job.type_name,
                job.chronology.to_string(),
                schedule,
                payload,
                job.state.to_string(),
                job.reference,
                fmt_ts(job.due_at),
                job.last_error,
                job.last_run.map(fmt_ts),
                job.run_count,
                job.consecutive_failures,
                fmt_ts(job.created_at),
                fmt_ts(job.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM chrono_jobs WHERE id = ?1");
        Ok(self.query(&sql, &[id.to_string()])?.into_iter().next())
    }

    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM chrono_jobs
             WHERE state = 'pending' AND due_at <= ?1
             ORDER BY due_at"
        );
        self.query(&sql, &[fmt_ts(now)])
    }

    async fn try_claim(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE chrono_jobs SET state = 'claimed', updated_at = ?1
             WHERE id = ?2 AND state = 'pending'",
            params![fmt_ts(Utc::now()), id],
        )?;
        Ok(n == 1)
    }

    async fn update(&self, job: &JobRecord) -> Result<()> {
        let schedule = serde_json::to_string(&job.schedule)?;
        let payload = serde_json::to_string(&job.payload)?;
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE chrono_jobs SET
                type_name = ?1, chronology = ?2, schedule = ?3, payload = ?4,
                state = ?5, reference = ?6, due_at = ?7, last_error = ?8,
                last_run = ?9, run_count = ?10, consecutive_failures = ?11,
                updated_at = ?12
             WHERE id = ?13",
            params![
                job.type_name,
                job.chronology.to_string(),
                schedule,
                payload,
                job.state.to_string(),
                job.reference,
                fmt_ts(job.due_at),
                job.last_error,
                job.last_run.map(fmt_ts),
                job.run_count,
                job.consecutive_failures,
                fmt_ts(job.updated_at),
                job.id,
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: job.id.clone() });
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM chrono_jobs WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    async fn find_in_state(&self, states: &[JobState]) -> Result<Vec<JobRecord>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=states.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT {COLUMNS} FROM chrono_jobs WHERE state IN ({placeholders}) ORDER BY due_at"
        );
        let args: Vec<String> = states.iter().map(|s| s.to_string()).collect();
        self.query(&sql, &args)
    }

    async fn list(&self) -> Result<Vec<JobRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM chrono_jobs ORDER BY created_at");
        self.query(&sql, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chronology, Schedule};
    use chrono::Duration;
    use std::sync::Arc;

    fn recurring_job() -> JobRecord {
        let due = Utc::now() - Duration::seconds(1);
        JobRecord::new(
            "report",
            serde_json::json!({"team": "ops"}),
            Chronology::Recurring,
            Schedule::Interval { every_secs: 30 },
            due,
        )
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let job = recurring_job();
        store.create(&job).await.unwrap();

        let loaded = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.type_name, "report");
        assert_eq!(loaded.schedule, Schedule::Interval { every_secs: 30 });
        assert_eq!(loaded.payload, serde_json::json!({"team": "ops"}));
        assert_eq!(loaded.reference, job.reference);
        // stored at millisecond precision
        assert_eq!(
            loaded.due_at.timestamp_millis(),
            job.due_at.timestamp_millis()
        );
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_is_a_compare_and_set() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let job = recurring_job();
        store.create(&job).await.unwrap();

        assert_eq!(store.find_due(Utc::now()).await.unwrap().len(), 1);
        assert!(store.try_claim(&job.id).await.unwrap());
        assert!(!store.try_claim(&job.id).await.unwrap());
        // claimed jobs are no longer due
        assert!(store.find_due(Utc::now()).await.unwrap().is_empty());

        let in_flight = store
            .find_in_state(&[JobState::Claimed, JobState::Running])
            .await
            .unwrap();
        assert_eq!(in_flight.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let job = recurring_job();
        store.create(&job).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let id = job.id.clone();
            tasks.push(tokio::spawn(async move { store.try_claim(&id).await.unwrap() }));
        }
        let mut winners = 0;
        for t in tasks {
            if t.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn update_and_delete() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let mut job = recurring_job();
        store.create(&job).await.unwrap();

        job.state = JobState::Failed;
        job.last_error = Some("boom".to_string());
        job.run_count = 3;
        store.update(&job).await.unwrap();
        let loaded = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Failed);
        assert_eq!(loaded.last_error.as_deref(), Some("boom"));
        assert_eq!(loaded.run_count, 3);

        assert!(store.delete(&job.id).await.unwrap());
        assert!(!store.delete(&job.id).await.unwrap());
        assert!(matches!(
            store.update(&job).await,
            Err(SchedulerError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let job = recurring_job();
        {
            let store = SqliteJobStore::open(&path).unwrap();
            store.create(&job).await.unwrap();
        }
        let store = SqliteJobStore::open(&path).unwrap();
        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, job.id);
    }
}
