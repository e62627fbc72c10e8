use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chronowire_core::config::SchedulerConfig;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SchedulerError},
    handler::{HandlerRegistry, JobHandler},
    schedule,
    store::JobStore,
    types::{Chronology, JobContext, JobEvent, JobOutcome, JobRecord, JobState, Schedule},
};

const INTERRUPTED: &str = "interrupted by restart";

/// State shared by the engine loop, its workers and every handle.
struct Core {
    store: Arc<dyn JobStore>,
    handlers: HandlerRegistry,
    config: SchedulerConfig,
    concurrency: usize,
    /// One permit per worker slot; a job holds its permit until it settles.
    permits: Arc<Semaphore>,
    /// If set, every finished run is reported here.
    events: Option<mpsc::Sender<JobEvent>>,
    /// Poked when a job is scheduled so the loop does not wait a full poll.
    wake: Notify,
}

/// Cloneable handle for job management (schedule/cancel/list) while the
/// engine loop runs.
#[derive(Clone)]
pub struct SchedulerHandle {
    core: Arc<Core>,
}

impl SchedulerHandle {
    /// Registry the engine resolves handlers from.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.core.handlers
    }

    /// Shorthand for `handlers().register(..)`.
    pub fn register_handler<H>(&self, type_name: impl Into<String>, handler: H) -> bool
    where
        H: JobHandler + 'static,
    {
        self.core.handlers.register(type_name, handler)
    }

    /// Parse `when` for `chronology` and schedule a job. See
    /// [`schedule::parse_schedule`] for the accepted formats.
    ///
    /// Inputs that parse but land outside the representable time range are
    /// rejected with `InvalidSchedule`.
    pub async fn schedule_task(
        &self,
        type_name: &str,
        payload: Value,
        chronology: Chronology,
        when: &str,
    ) -> Result<JobRecord> {
        let schedule = Schedule::parse(chronology, when)?;
        self.schedule(type_name, payload, chronology, schedule).await
    }

    /// Persist a new `pending` job for an already-built schedule.
    ///
    /// Fails with `InvalidSchedule` (and persists nothing) when the schedule
    /// is malformed or does not fit the chronology.
    pub async fn schedule(
        &self,
        type_name: &str,
        payload: Value,
        chronology: Chronology,
        schedule: Schedule,
    ) -> Result<JobRecord> {
        schedule::validate(&schedule, chronology)?;
        let due = schedule::first_due(&schedule, Utc::now())?;
        let job = JobRecord::new(type_name, payload, chronology, schedule, due);
        self.core.store.create(&job).await?;

        if !self.core.handlers.contains(type_name) {
            warn!(job_id = %job.id, %type_name, "no handler registered for job type yet");
        }
        info!(
            job_id = %job.id,
            %type_name,
            %chronology,
            reference = %job.reference,
            due_at = %job.due_at,
            "job scheduled"
        );
        self.core.wake.notify_one();
        Ok(job)
    }

    /// Cancel a job that is not currently executing.
    ///
    /// Pending jobs are claimed first, so a cancel can never race a worker
    /// into a double outcome. Failed or completed records are simply removed.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let Some(job) = self.core.store.get(id).await? else {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        };

        match job.state {
            JobState::Pending => {
                if !self.core.store.try_claim(id).await? {
                    // A worker (or another cancel) got there first.
                    return match self.core.store.get(id).await? {
                        Some(j) => Err(SchedulerError::NotCancelable {
                            id: id.to_string(),
                            state: j.state,
                        }),
                        None => Err(SchedulerError::JobNotFound { id: id.to_string() }),
                    };
                }
            }
            state if state.is_in_flight() => {
                return Err(SchedulerError::NotCancelable {
                    id: id.to_string(),
                    state,
                });
            }
            _ => {}
        }

        self.core.store.delete(id).await?;
        info!(job_id = %id, "job canceled");
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        self.core.store.get(id).await
    }

    /// Return all known jobs ordered by creation time.
    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        self.core.store.list().await
    }

    /// Jobs currently holding a worker slot.
    pub fn running(&self) -> usize {
        self.core.concurrency - self.core.permits.available_permits()
    }

    pub fn concurrency(&self) -> usize {
        self.core.concurrency
    }
}

/// Core scheduler: claims due jobs from the store and runs them on a bounded
/// worker pool at poll-interval precision.
pub struct SchedulerEngine {
    core: Arc<Core>,
}

impl SchedulerEngine {
    /// Create an engine over `store`.
    ///
    /// Pass `Some(tx)` to receive a [`JobEvent`] for every finished run.
    /// The sender is non-blocking (`try_send`) so workers are never stalled.
    pub fn new(
        store: Arc<dyn JobStore>,
        handlers: HandlerRegistry,
        config: SchedulerConfig,
        events: Option<mpsc::Sender<JobEvent>>,
    ) -> Self {
        let concurrency = config.concurrency();
        Self {
            core: Arc::new(Core {
                store,
                handlers,
                config,
                concurrency,
                permits: Arc::new(Semaphore::new(concurrency)),
                events,
                wake: Notify::new(),
            }),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            core: Arc::clone(&self.core),
        }
    }

    /// Startup recovery for jobs a previous process left in flight:
    /// [`Self::rejuvenate`] when `rejuvenate_on_start` is set, otherwise
    /// [`Self::abandon_orphans`].
    ///
    /// Call once, after every handler has been re-registered and before
    /// [`Self::run`].
    ///
    /// Afterwards, recurring interval jobs that fell whole periods behind
    /// while the process was down are pulled forward; see
    /// [`Self::coalesce_overdue`].
    pub async fn recover(&self) -> Result<usize> {
        let recovered = if self.core.config.rejuvenate_on_start {
            self.rejuvenate().await?
        } else {
            self.abandon_orphans().await?
        };
        self.coalesce_overdue().await?;
        Ok(recovered)
    }

    /// Reset every `claimed`/`running` job to `pending` so it runs again.
    ///
    /// This gives at-least-once execution: an occurrence that was cut off
    /// mid-run will be executed a second time.
    pub async fn rejuvenate(&self) -> Result<usize> {
        let orphans = self
            .core
            .store
            .find_in_state(&[JobState::Claimed, JobState::Running])
            .await?;
        let count = orphans.len();

        for mut job in orphans {
            let previous = job.state;
            job.state = JobState::Pending;
            job.updated_at = Utc::now();
            self.core.store.update(&job).await?;
            info!(job_id = %job.id, type_name = %job.type_name, %previous, "job rejuvenated");
        }

        if count > 0 {
            warn!(count, "rejuvenated jobs interrupted by a previous shutdown");
        }
        Ok(count)
    }

    /// Drop the interrupted occurrence of every `claimed`/`running` job.
    ///
    /// One-shot jobs become `failed`; recurring jobs move on to their next
    /// occurrence.
    pub async fn abandon_orphans(&self) -> Result<usize> {
        let orphans = self
            .core
            .store
            .find_in_state(&[JobState::Claimed, JobState::Running])
            .await?;
        let count = orphans.len();

        for mut job in orphans {
            let now = Utc::now();
            job.updated_at = now;
            job.last_error = Some(INTERRUPTED.to_string());
            let next = match job.chronology {
                Chronology::OneShot => None,
                Chronology::Recurring => schedule::catch_up_due(&job.schedule, job.due_at, now),
            };
            match next {
                Some(next) => {
                    job.state = JobState::Pending;
                    job.due_at = next;
                }
                None => job.state = JobState::Failed,
            }
            self.core.store.update(&job).await?;
            warn!(job_id = %job.id, state = %job.state, "interrupted job abandoned");
        }
        Ok(count)
    }

    /// Move every pending interval job that is at least one whole period
    /// overdue to its last missed occurrence, so a long outage costs one
    /// catch-up run instead of one run per missed period.
    pub async fn coalesce_overdue(&self) -> Result<usize> {
        let now = Utc::now();
        let mut moved = 0;
        for mut job in self.core.store.find_in_state(&[JobState::Pending]).await? {
            if job.chronology != Chronology::Recurring {
                continue;
            }
            let Some(due) = schedule::last_missed(&job.schedule, job.due_at, now) else {
                continue;
            };
            debug!(job_id = %job.id, from = %job.due_at, to = %due, "coalescing missed occurrences");
            job.due_at = due;
            job.updated_at = now;
            self.core.store.update(&job).await?;
            moved += 1;
        }
        if moved > 0 {
            info!(count = moved, "coalesced overdue recurring jobs");
        }
        Ok(moved)
    }

    /// Claim and start every due job that fits in the worker pool.
    ///
    /// Returns the number of jobs started. Jobs that do not fit stay
    /// `pending` and are picked up by a later tick.
    pub async fn tick(&self) -> Result<usize> {
        let due = self.core.store.find_due(Utc::now()).await?;
        let total = due.len();
        let mut started = 0;

        for job in due {
            let Ok(permit) = Arc::clone(&self.core.permits).try_acquire_owned() else {
                debug!(
                    deferred = total - started,
                    "worker pool saturated; deferring due jobs"
                );
                break;
            };
            if !self.core.store.try_claim(&job.id).await? {
                debug!(job_id = %job.id, "claim lost to another worker");
                continue;
            }

            let core = Arc::clone(&self.core);
            tokio::spawn(async move { core.execute(job, permit).await });
            started += 1;
        }
        Ok(started)
    }

    /// Wait until no job holds a worker slot.
    pub async fn wait_idle(&self) {
        let all = self.core.concurrency as u32;
        let _ = self.core.permits.acquire_many(all).await;
    }

    /// Main event loop. Ticks every `poll_interval_ms` (or sooner when a job
    /// is scheduled) until `shutdown` broadcasts `true`, then waits for
    /// running jobs to settle.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(concurrency = self.core.concurrency, "scheduler engine started");

        let period = Duration::from_millis(self.core.config.poll_interval_ms.max(10));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.core.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(e) = self.tick().await {
                // Store hiccups are retried on the next tick.
                error!("scheduler tick error: {e}");
            }
        }

        info!("scheduler engine shutting down; waiting for running jobs");
        self.wait_idle().await;
        info!("scheduler engine stopped");
    }
}

impl Core {
    async fn execute(&self, mut job: JobRecord, _permit: OwnedSemaphorePermit) {
        let started = Utc::now();
        job.state = JobState::Running;
        job.last_run = Some(started);
        job.updated_at = started;
        if let Err(e) = self.store.update(&job).await {
            error!(job_id = %job.id, error = %e, "could not mark job running; releasing claim");
            job.state = JobState::Pending;
            job.last_run = None;
            if let Err(e) = self.store.update(&job).await {
                error!(job_id = %job.id, error = %e, "could not release claim; left for rejuvenation");
            }
            return;
        }

        info!(
            job_id = %job.id,
            type_name = %job.type_name,
            reference = %job.reference,
            run = job.run_count + 1,
            "executing job"
        );
        let result = self.invoke(&job).await;
        self.finish(job, result).await;
    }

    async fn invoke(&self, job: &JobRecord) -> Result<()> {
        let handler = self.handlers.resolve(&job.type_name)?;
        let run = AssertUnwindSafe(handler.run(JobContext::from(job))).catch_unwind();

        let outcome = match self.config.handler_timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), run)
                .await
                .map_err(|_| SchedulerError::HandlerExecution(format!("timed out after {secs}s")))?,
            None => run.await,
        };

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SchedulerError::HandlerExecution(format!("{e:#}"))),
            Err(_) => Err(SchedulerError::HandlerExecution("handler panicked".to_string())),
        }
    }

    /// Apply the post-run state transition and report it.
    async fn finish(&self, mut job: JobRecord, result: Result<()>) {
        let finished = Utc::now();
        let scheduled_for = job.due_at;
        job.run_count = job.run_count.saturating_add(1);
        job.updated_at = finished;

        let mut next_due = None;
        let outcome = match result {
            Ok(()) => {
                job.consecutive_failures = 0;
                job.last_error = None;
                if job.chronology == Chronology::Recurring {
                    next_due = self.reschedule(&mut job).await;
                }
                if next_due.is_none() {
                    job.state = JobState::Completed;
                    self.remove(&job).await;
                }
                info!(job_id = %job.id, run = job.run_count, next_due = ?next_due, "job completed");
                JobOutcome::Completed
            }
            Err(e) => {
                let error = e.to_string();
                job.last_error = Some(error.clone());
                job.consecutive_failures = job.consecutive_failures.saturating_add(1);

                let suspended = job.chronology == Chronology::Recurring
                    && self
                        .config
                        .max_consecutive_failures
                        .is_some_and(|max| job.consecutive_failures >= max);

                if job.chronology == Chronology::Recurring && !suspended {
                    // A failed occurrence never stops future ones.
                    next_due = self.reschedule(&mut job).await;
                }

                if next_due.is_some() {
                    warn!(
                        job_id = %job.id,
                        %error,
                        failures = job.consecutive_failures,
                        next_due = ?next_due,
                        "recurring job failed; next occurrence still scheduled"
                    );
                } else {
                    job.state = JobState::Failed;
                    self.persist(&job).await;
                    if suspended {
                        error!(
                            job_id = %job.id,
                            %error,
                            failures = job.consecutive_failures,
                            "recurring job suspended after repeated failures"
                        );
                    } else {
                        warn!(job_id = %job.id, %error, "job failed; record kept for inspection");
                    }
                }
                JobOutcome::Failed { error, suspended }
            }
        };

        self.emit(JobEvent {
            job_id: job.id.clone(),
            reference: job.reference.clone(),
            type_name: job.type_name.clone(),
            chronology: job.chronology,
            outcome,
            scheduled_for,
            finished_at: finished,
            next_due,
        });
    }

    /// Move a recurring job one occurrence past the one that just ran and
    /// persist it. Returns `None` (and leaves the record untouched) when the
    /// schedule has no further occurrence.
    async fn reschedule(&self, job: &mut JobRecord) -> Option<DateTime<Utc>> {
        let next = schedule::next_due(&job.schedule, job.due_at)?;
        job.state = JobState::Pending;
        job.due_at = next;
        self.persist(job).await;
        Some(next)
    }

    async fn persist(&self, job: &JobRecord) {
        if let Err(e) = self.store.update(job).await {
            error!(job_id = %job.id, state = %job.state, error = %e, "failed to persist job state");
        }
    }

    async fn remove(&self, job: &JobRecord) {
        if let Err(e) = self.store.delete(&job.id).await {
            error!(job_id = %job.id, error = %e, "failed to delete finished job");
        }
    }

    fn emit(&self, event: JobEvent) {
        let Some(tx) = &self.events else {
            return;
        };
        let job_id = event.job_id.clone();
        // try_send never blocks a worker; a full channel only loses the event.
        if tx.try_send(event).is_err() {
            warn!(%job_id, "job event channel full or closed; event dropped");
        }
    }
}
