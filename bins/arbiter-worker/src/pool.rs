/// Worker Pool - N slots draining the job queue
///
/// **Guarantees:**
/// - At most `concurrency` sandboxes run at once (one per slot)
/// - A job is evaluated by exactly one slot (the store's dequeue is atomic)
/// - Every dequeued job ends `completed` or `failed`, including when
///   evaluation panics
/// - On shutdown a slot finishes its current job before exiting

use crate::config::WorkerConfig;
use crate::engine::Sandbox;
use crate::executor::{evaluate_job, JudgeContext};
use crate::problems::TestSource;
use arbiter_common::store::JobStore;
use arbiter_common::types::Job;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct WorkerPool {
    sandbox: Arc<dyn Sandbox>,
    tests: Arc<dyn TestSource>,
    config: Arc<WorkerConfig>,
}

impl WorkerPool {
    pub fn new(sandbox: Arc<dyn Sandbox>, tests: Arc<dyn TestSource>, config: WorkerConfig) -> Self {
        Self {
            sandbox,
            tests,
            config: Arc::new(config),
        }
    }

    /// Run one slot per store until `shutdown` flips to `true`
    pub async fn run<S>(&self, stores: Vec<S>, shutdown: watch::Receiver<bool>)
    where
        S: JobStore + 'static,
    {
        let mut slots = JoinSet::new();
        for (slot, store) in stores.into_iter().enumerate() {
            let worker = SlotWorker {
                slot,
                store,
                sandbox: Arc::clone(&self.sandbox),
                tests: Arc::clone(&self.tests),
                config: Arc::clone(&self.config),
            };
            slots.spawn(worker.run(shutdown.clone()));
        }

        info!(slots = slots.len(), "Worker pool started");

        while let Some(joined) = slots.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker slot terminated abnormally");
            }
        }

        info!("Worker pool stopped");
    }
}

struct SlotWorker<S> {
    slot: usize,
    store: S,
    sandbox: Arc<dyn Sandbox>,
    tests: Arc<dyn TestSource>,
    config: Arc<WorkerConfig>,
}

impl<S: JobStore + 'static> SlotWorker<S> {
    #[instrument(skip_all, fields(slot = self.slot))]
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let poll_timeout = self.config.poll_timeout();

        while !*shutdown.borrow() {
            // Never cancelled: the store may already have handed the job out.
            // `poll_timeout` bounds how long shutdown waits on an idle slot.
            match self.store.dequeue(poll_timeout).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "Job store error");
                    tokio::select! {
                        _ = tokio::time::sleep(STORE_ERROR_BACKOFF) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        info!("Slot drained");
    }

    async fn process(&self, job: Job) {
        let job_id = job.id;
        info!(
            job_id = %job_id,
            problem_id = %job.problem_id,
            source_size = job.source_code.len(),
            "Received job"
        );

        let start = Instant::now();
        let sandbox = Arc::clone(&self.sandbox);
        let tests = Arc::clone(&self.tests);
        let config = Arc::clone(&self.config);

        // Own task so a panic in evaluation still leaves a terminal state
        let evaluation = tokio::spawn(async move {
            let ctx = JudgeContext {
                sandbox: sandbox.as_ref(),
                tests: tests.as_ref(),
                config: config.as_ref(),
            };
            evaluate_job(&job, &ctx).await
        })
        .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let stored = match evaluation {
            Ok(Ok(verdict)) => {
                info!(job_id = %job_id, verdict = %verdict.verdict, elapsed_ms, "Job completed");
                self.store.complete(job_id, &verdict).await
            }
            Ok(Err(e)) => {
                warn!(job_id = %job_id, error = %e, elapsed_ms, "Job failed");
                self.store.fail(job_id, &e.to_string()).await
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, elapsed_ms, "Job evaluation panicked");
                self.store.fail(job_id, "internal error while evaluating the submission").await
            }
        };

        if let Err(e) = stored {
            error!(job_id = %job_id, error = %e, "Failed to persist job outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxLimits;
    use crate::engine::{SandboxError, SandboxExit};
    use crate::executor::tests::{case, config_in, FixedTests, ScriptedSandbox};
    use arbiter_common::store::memory::MemoryJobStore;
    use arbiter_common::store::StoreError;
    use arbiter_common::types::{JobId, JobState, JobStatus, Submission, TestCase, Verdict, VerdictKind};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;

    struct PanickingSandbox;

    #[async_trait]
    impl Sandbox for PanickingSandbox {
        async fn execute(&self, _work_dir: &Path, _limits: &SandboxLimits) -> Result<SandboxExit, SandboxError> {
            panic!("sandbox bug");
        }
    }

    fn echo_problem() -> Arc<FixedTests> {
        let cases: Vec<TestCase> = vec![case("a", "1", "1", false), case("b", "2", "2", true)];
        Arc::new(FixedTests {
            problems: HashMap::from([("echo".to_string(), cases)]),
        })
    }

    fn fast_config(base: &Path, concurrency: usize) -> WorkerConfig {
        WorkerConfig {
            concurrency,
            poll_timeout_secs: 1,
            ..config_in(base)
        }
    }

    /// Run the pool until every job is terminal, then shut it down
    async fn drain(pool: WorkerPool, store: Arc<MemoryJobStore>, slots: usize, jobs: usize) {
        let (tx, rx) = watch::channel(false);
        let stores: Vec<Arc<MemoryJobStore>> = (0..slots).map(|_| Arc::clone(&store)).collect();
        let handle = tokio::spawn(async move { pool.run(stores, rx).await });

        let deadline = Instant::now() + Duration::from_secs(10);
        while store.count(JobState::Completed) + store.count(JobState::Failed) < jobs {
            assert!(Instant::now() < deadline, "jobs did not finish in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("pool did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_pool_completes_all_jobs() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let mut ids = Vec::new();
        for source in ["echo", "print:9", "crash-on:1", "compile-error", "echo"] {
            ids.push(store.enqueue(&Submission::new("echo", source)).await.unwrap());
        }

        let sandbox = Arc::new(ScriptedSandbox::default());
        let pool = WorkerPool::new(sandbox.clone(), echo_problem(), fast_config(base.path(), 3));
        drain(pool, Arc::clone(&store), 3, ids.len()).await;

        let mut verdicts = Vec::new();
        for id in &ids {
            match store.status(*id).await.unwrap() {
                Some(JobStatus::Completed { verdict }) => verdicts.push(verdict.verdict),
                other => panic!("unexpected status {:?}", other),
            }
        }
        assert_eq!(
            verdicts,
            vec![
                VerdictKind::Accepted,
                VerdictKind::WrongAnswer,
                VerdictKind::RuntimeError,
                VerdictKind::CompileError,
                VerdictKind::Accepted,
            ]
        );
        assert_eq!(sandbox.calls.load(std::sync::atomic::Ordering::SeqCst), 5);
        assert!(std::fs::read_dir(base.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_infrastructure_failure_marks_job_failed() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let id = store.enqueue(&Submission::new("echo", "echo")).await.unwrap();

        let pool = WorkerPool::new(
            Arc::new(ScriptedSandbox::failing()),
            echo_problem(),
            fast_config(base.path(), 1),
        );
        drain(pool, Arc::clone(&store), 1, 1).await;

        match store.status(id).await.unwrap() {
            Some(JobStatus::Failed { error }) => assert!(error.contains("docker daemon not reachable")),
            other => panic!("unexpected status {:?}", other),
        }
        assert!(std::fs::read_dir(base.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_panic_during_evaluation_marks_job_failed() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let first = store.enqueue(&Submission::new("echo", "echo")).await.unwrap();
        let second = store.enqueue(&Submission::new("echo", "echo")).await.unwrap();

        let pool = WorkerPool::new(Arc::new(PanickingSandbox), echo_problem(), fast_config(base.path(), 1));
        drain(pool, Arc::clone(&store), 1, 2).await;

        for id in [first, second] {
            assert_eq!(store.status(id).await.unwrap().unwrap().state(), JobState::Failed);
        }
        assert!(std::fs::read_dir(base.path()).unwrap().next().is_none());
    }

    /// Takes the job, then holds the reply back as if it were still on the wire
    struct SlowHandoff {
        inner: Arc<MemoryJobStore>,
        delay: Duration,
    }

    #[async_trait]
    impl JobStore for SlowHandoff {
        async fn enqueue(&self, submission: &Submission) -> Result<JobId, StoreError> {
            self.inner.enqueue(submission).await
        }

        async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, StoreError> {
            let job = self.inner.dequeue(timeout).await?;
            if job.is_some() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(job)
        }

        async fn complete(&self, id: JobId, verdict: &Verdict) -> Result<(), StoreError> {
            self.inner.complete(id, verdict).await
        }

        async fn fail(&self, id: JobId, error: &str) -> Result<(), StoreError> {
            self.inner.fail(id, error).await
        }

        async fn status(&self, id: JobId) -> Result<Option<JobStatus>, StoreError> {
            self.inner.status(id).await
        }
    }

    #[tokio::test]
    async fn test_shutdown_during_handoff_still_finishes_job() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let id = store.enqueue(&Submission::new("echo", "echo")).await.unwrap();

        let pool = WorkerPool::new(
            Arc::new(ScriptedSandbox::default()),
            echo_problem(),
            fast_config(base.path(), 1),
        );
        let slow = SlowHandoff {
            inner: Arc::clone(&store),
            delay: Duration::from_millis(200),
        };
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { pool.run(vec![slow], rx).await });

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.count(JobState::Active) == 0 {
            assert!(Instant::now() < deadline, "job was never taken");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("pool did not stop")
            .unwrap();

        match store.status(id).await.unwrap() {
            Some(JobStatus::Completed { verdict }) => assert_eq!(verdict.verdict, VerdictKind::Accepted),
            other => panic!("job left without a terminal state: {:?}", other),
        }
        assert_eq!(store.count(JobState::Active), 0);
    }

    #[tokio::test]
    async fn test_idle_pool_stops_on_shutdown() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let pool = WorkerPool::new(
            Arc::new(ScriptedSandbox::default()),
            echo_problem(),
            fast_config(base.path(), 2),
        );
        drain(pool, store, 2, 0).await;
    }
}
