use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Whether a job runs once or repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chronology {
    /// Runs a single time; the record is deleted after a successful run.
    OneShot,
    /// Runs on every occurrence of its schedule until canceled.
    Recurring,
}

impl std::fmt::Display for Chronology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Chronology::OneShot => "one_shot",
            Chronology::Recurring => "recurring",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Chronology {
    type Err = String;

    /// Also accepts the `schedule` / `interval` spelling used by older clients.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "one_shot" | "oneshot" | "once" | "schedule" => Ok(Chronology::OneShot),
            "recurring" | "interval" => Ok(Chronology::Recurring),
            other => Err(format!("unknown chronology: {other}")),
        }
    }
}

/// Defines when and how often a job should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Run exactly once at the given UTC instant.
    Once { at: DateTime<Utc> },

    /// Run repeatedly with a fixed interval in seconds.
    Interval { every_secs: u64 },

    /// Run every day at the given hour and minute (UTC).
    Daily { hour: u8, minute: u8 },

    /// Run on a specific weekday (0 = Monday … 6 = Sunday) at the given time (UTC).
    Weekly { day: u8, hour: u8, minute: u8 },

    /// Run according to a cron expression, evaluated in UTC.
    Cron { expression: String },
}

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its due time.
    Pending,
    /// Leased by a worker; no other worker may run it.
    Claimed,
    /// Handler currently executing.
    Running,
    /// Finished successfully (transient for one-shot jobs, which are then deleted).
    Completed,
    /// Last execution failed; `last_error` says why.
    Failed,
}

impl JobState {
    /// Claimed or running: the job is owned by a worker.
    pub fn is_in_flight(self) -> bool {
        matches!(self, JobState::Claimed | JobState::Running)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Claimed => "claimed",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "claimed" => Ok(JobState::Claimed),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// UUID v4 string, primary key.
    pub id: String,
    /// Name of the handler that runs this job.
    pub type_name: String,
    pub chronology: Chronology,
    pub schedule: Schedule,
    /// Arbitrary JSON forwarded to the handler.
    pub payload: Value,
    pub state: JobState,
    /// Client-facing correlation token, stable across occurrences.
    pub reference: String,
    /// When the current occurrence is due.
    pub due_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Start time of the most recent execution, if any.
    pub last_run: Option<DateTime<Utc>>,
    /// Total number of finished runs, successful or not.
    pub run_count: u32,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Build a fresh `pending` record due at `due_at`.
    pub fn new(
        type_name: impl Into<String>,
        payload: Value,
        chronology: Chronology,
        schedule: Schedule,
        due_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            type_name: type_name.into(),
            chronology,
            schedule,
            payload,
            state: JobState::Pending,
            reference: make_reference(),
            due_at,
            last_error: None,
            last_run: None,
            run_count: 0,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Short random token used as a job's public reference.
fn make_reference() -> String {
    let mut s = Uuid::new_v4().simple().to_string();
    s.truncate(12);
    s
}

/// Everything a handler gets to see about the occurrence it is running.
#[derive(Debug, Clone, Serialize)]
pub struct JobContext {
    pub job_id: String,
    pub reference: String,
    pub type_name: String,
    pub chronology: Chronology,
    pub payload: Value,
    /// The scheduled due time of this occurrence (not the actual start time).
    pub scheduled_for: DateTime<Utc>,
    /// Runs finished before this one.
    pub previous_runs: u32,
}

impl From<&JobRecord> for JobContext {
    fn from(job: &JobRecord) -> Self {
        Self {
            job_id: job.id.clone(),
            reference: job.reference.clone(),
            type_name: job.type_name.clone(),
            chronology: job.chronology,
            payload: job.payload.clone(),
            scheduled_for: job.due_at,
            previous_runs: job.run_count,
        }
    }
}

/// Result of one run, as reported on the job event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed {
        error: String,
        /// The failure tripped the consecutive-failure limit; no further
        /// occurrences are scheduled.
        #[serde(default)]
        suspended: bool,
    },
}

/// Emitted after every finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub reference: String,
    pub type_name: String,
    pub chronology: Chronology,
    #[serde(flatten)]
    pub outcome: JobOutcome,
    pub scheduled_for: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Next occurrence for recurring jobs that remain scheduled.
    pub next_due: Option<DateTime<Utc>>,
}
