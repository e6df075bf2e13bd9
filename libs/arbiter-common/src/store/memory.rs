//! In-process [`JobStore`] with the same transition rules as the Redis store.

use super::{JobStore, StoreError};
use crate::types::{Job, JobId, JobState, JobStatus, Submission, Verdict};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Record {
    state: JobState,
    problem_id: String,
    source_code: String,
    verdict: Option<Verdict>,
    error: Option<String>,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<JobId>,
    jobs: HashMap<JobId, Record>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    arrived: Notify,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_take(&self) -> Option<Job> {
        let mut inner = self.lock();
        while let Some(id) = inner.queue.pop_front() {
            if let Some(record) = inner.jobs.get_mut(&id) {
                if record.state == JobState::Queued {
                    record.state = JobState::Active;
                    return Some(Job {
                        id,
                        problem_id: record.problem_id.clone(),
                        source_code: record.source_code.clone(),
                    });
                }
            }
        }
        None
    }

    fn finish(
        &self,
        id: JobId,
        state: JobState,
        verdict: Option<Verdict>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner.jobs.get_mut(&id) {
            Some(record) if record.state == JobState::Active => {
                record.state = state;
                record.verdict = verdict;
                record.error = error;
                record.source_code.clear();
                Ok(())
            }
            _ => Err(StoreError::NotActive(id)),
        }
    }

    /// Number of jobs in the given state
    pub fn count(&self, state: JobState) -> usize {
        self.lock().jobs.values().filter(|r| r.state == state).count()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, submission: &Submission) -> Result<JobId, StoreError> {
        let id = Uuid::new_v4();
        {
            let mut inner = self.lock();
            inner.jobs.insert(
                id,
                Record {
                    state: JobState::Queued,
                    problem_id: submission.problem_id.clone(),
                    source_code: submission.code.clone(),
                    verdict: None,
                    error: None,
                },
            );
            inner.queue.push_back(id);
        }
        self.arrived.notify_one();
        Ok(id)
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.arrived.notified();
            if let Some(job) = self.try_take() {
                return Ok(Some(job));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_take());
            }
        }
    }

    async fn complete(&self, id: JobId, verdict: &Verdict) -> Result<(), StoreError> {
        self.finish(id, JobState::Completed, Some(verdict.clone()), None)
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<(), StoreError> {
        self.finish(id, JobState::Failed, None, Some(error.to_string()))
    }

    async fn status(&self, id: JobId) -> Result<Option<JobStatus>, StoreError> {
        let inner = self.lock();
        let Some(record) = inner.jobs.get(&id) else {
            return Ok(None);
        };
        let status = match record.state {
            JobState::Queued => JobStatus::Queued,
            JobState::Active => JobStatus::Active,
            JobState::Completed => JobStatus::Completed {
                verdict: record.verdict.clone().ok_or_else(|| StoreError::Corrupt {
                    id: id.to_string(),
                    reason: "completed without verdict".to_string(),
                })?,
            },
            JobState::Failed => JobStatus::Failed {
                error: record.error.clone().unwrap_or_default(),
            },
        };
        Ok(Some(status))
    }
}
