//! `chronowire-scheduler`: Tokio-based task scheduler with crash-recoverable execution.
//!
//! # Overview
//!
//! Jobs are persisted through a [`store::JobStore`] (SQLite for durability,
//! in-memory for ephemeral deployments). The [`engine::SchedulerEngine`] polls
//! the store, atomically claims every due job (`pending → claimed`), and runs
//! its handler on a bounded worker pool. Handlers are never persisted: a job
//! stores only its `type_name`, which is resolved against the in-process
//! [`handler::HandlerRegistry`] at execution time.
//!
//! # Schedule variants
//!
//! | Variant    | Chronology  | Behaviour                                  |
//! |------------|-------------|--------------------------------------------|
//! | `Once`     | one-shot    | Single fire at an absolute UTC instant     |
//! | `Interval` | recurring   | Repeat every N seconds                     |
//! | `Daily`    | recurring   | Fire at HH:MM UTC every day                |
//! | `Weekly`   | recurring   | Fire at HH:MM UTC on a specific weekday    |
//! | `Cron`     | recurring   | Cron expression (5, 6 or 7 fields, UTC)    |
//!
//! # Execution semantics
//!
//! - One-shot jobs are deleted after a successful run and kept as `failed`
//!   after a failed one.
//! - Recurring jobs are rescheduled after every run, successful or not. The
//!   next due time is anchored on the previous *scheduled* time, never on the
//!   completion time.
//! - Jobs found `claimed` or `running` at startup were interrupted by a crash;
//!   [`engine::SchedulerEngine::rejuvenate`] puts them back to `pending`, so a
//!   handler may see the same occurrence twice (at-least-once).

pub mod db;
pub mod engine;
pub mod error;
pub mod handler;
pub mod memory;
pub mod schedule;
pub mod store;
pub mod types;

pub use engine::{SchedulerEngine, SchedulerHandle};
pub use error::{Result, SchedulerError};
pub use handler::{HandlerRegistry, JobHandler};
pub use store::{open_store, JobStore};
pub use types::{Chronology, JobContext, JobEvent, JobOutcome, JobRecord, JobState, Schedule};
