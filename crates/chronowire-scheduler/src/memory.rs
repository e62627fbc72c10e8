use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::{
    error::{Result, SchedulerError},
    store::JobStore,
    types::{JobRecord, JobState},
};

/// Ephemeral job store; everything is lost when the process exits.
///
/// `try_claim` runs under the map shard's write lock, so the
/// `pending → claimed` check-and-set is atomic.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: DashMap<String, JobRecord>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &JobRecord) -> Result<()> {
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        Ok(self.jobs.get(id).map(|j| j.value().clone()))
    }

    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        let mut due: Vec<JobRecord> = self
            .jobs
            .iter()
            .filter(|j| j.state == JobState::Pending && j.due_at <= now)
            .map(|j| j.value().clone())
            .collect();
        due.sort_by_key(|j| j.due_at);
        Ok(due)
    }

    async fn try_claim(&self, id: &str) -> Result<bool> {
        match self.jobs.get_mut(id) {
            Some(mut job) if job.state == JobState::Pending => {
                job.state = JobState::Claimed;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update(&self, job: &JobRecord) -> Result<()> {
        match self.jobs.get_mut(&job.id) {
            Some(mut existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(SchedulerError::JobNotFound { id: job.id.clone() }),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.jobs.remove(id).is_some())
    }

    async fn find_in_state(&self, states: &[JobState]) -> Result<Vec<JobRecord>> {
        Ok(self
            .jobs
            .iter()
            .filter(|j| states.contains(&j.state))
            .map(|j| j.value().clone())
            .collect())
    }

    async fn list(&self) -> Result<Vec<JobRecord>> {
        let mut all: Vec<JobRecord> = self.jobs.iter().map(|j| j.value().clone()).collect();
        all.sort_by_key(|j| j.created_at);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chronology, Schedule};
    use chrono::Duration;
    use std::sync::Arc;

    fn job_due_in(secs: i64) -> JobRecord {
        let at = Utc::now() + Duration::seconds(secs);
        JobRecord::new(
            "noop",
            serde_json::Value::Null,
            Chronology::OneShot,
            Schedule::Once { at },
            at,
        )
    }

    #[tokio::test]
    async fn find_due_skips_future_and_non_pending() {
        let store = MemoryJobStore::new();
        let past = job_due_in(-10);
        let future = job_due_in(3600);
        let mut failed = job_due_in(-5);
        failed.state = JobState::Failed;
        for j in [&past, &future, &failed] {
            store.create(j).await.unwrap();
        }

        let due = store.find_due(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, past.id);
    }

    #[tokio::test]
    async fn claim_only_once() {
        let store = MemoryJobStore::new();
        let job = job_due_in(0);
        store.create(&job).await.unwrap();

        assert!(store.try_claim(&job.id).await.unwrap());
        assert!(!store.try_claim(&job.id).await.unwrap());
        assert!(!store.try_claim("missing").await.unwrap());
        assert_eq!(
            store.get(&job.id).await.unwrap().unwrap().state,
            JobState::Claimed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryJobStore::new());
        for _ in 0..20 {
            let job = job_due_in(0);
            store.create(&job).await.unwrap();

            let mut tasks = Vec::new();
            for _ in 0..8 {
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
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let store = MemoryJobStore::new();
        let err = store.update(&job_due_in(0)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::JobNotFound { .. }));
    }
}
