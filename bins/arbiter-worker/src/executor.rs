/// Job Executor - High-Level Orchestration
///
/// **Responsibility:**
/// Take one dequeued job from source code to verdict.
///
/// **Architecture:**
/// 1. Load the problem's tests (problems.rs) and give them safe names (normalizer.rs)
/// 2. Stage a fresh workspace (workspace.rs)
/// 3. Run the sandbox over it (engine.rs)
/// 4. Read the results back (collector.rs) and assemble the verdict (evaluator.rs)
///
/// This module is the glue layer - it knows nothing about:
/// - How code executes (engine's job)
/// - How outputs are judged (evaluator's job)
///
/// Every `Err` returned here is an infrastructure failure. Anything the
/// submitted program did is expressed as a `Verdict`.

use crate::collector::{self, CollectError};
use crate::config::WorkerConfig;
use crate::engine::{Sandbox, SandboxError};
use crate::evaluator;
use crate::normalizer::normalize;
use crate::problems::TestSource;
use crate::workspace::JobWorkspace;
use arbiter_common::types::{Job, SafeTest, Verdict};
use std::io;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("failed to load tests for problem '{problem_id}': {source}")]
    TestSource {
        problem_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("workspace error: {0}")]
    Workspace(#[from] io::Error),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Collect(#[from] CollectError),
}

/// Everything a job evaluation needs besides the job itself
pub struct JudgeContext<'a> {
    pub sandbox: &'a dyn Sandbox,
    pub tests: &'a dyn TestSource,
    pub config: &'a WorkerConfig,
}

#[instrument(skip_all, fields(job_id = %job.id, problem_id = %job.problem_id))]
pub async fn evaluate_job(job: &Job, ctx: &JudgeContext<'_>) -> Result<Verdict, JudgeError> {
    let cases = ctx
        .tests
        .tests_for(&job.problem_id)
        .await
        .map_err(|source| JudgeError::TestSource {
            problem_id: job.problem_id.clone(),
            source,
        })?;

    let tests = normalize(&cases);
    if tests.is_empty() {
        info!("Problem has no tests, skipping sandbox");
        return Ok(Verdict::no_tests());
    }

    let workspace = JobWorkspace::create(&ctx.config.jobs_base).await?;
    let verdict = judge_in(&workspace, job, &tests, ctx).await;

    // Panics and cancellation fall back to Drop
    if let Err(e) = workspace.close().await {
        warn!(error = %e, "Failed to remove job workspace");
    }

    verdict
}

async fn judge_in(
    workspace: &JobWorkspace,
    job: &Job,
    tests: &[SafeTest],
    ctx: &JudgeContext<'_>,
) -> Result<Verdict, JudgeError> {
    workspace.stage(&job.source_code, tests).await?;
    debug!(
        workspace = %workspace.path().display(),
        test_count = tests.len(),
        source_size = job.source_code.len(),
        "Workspace staged"
    );

    let exit = ctx.sandbox.execute(workspace.path(), &ctx.config.sandbox).await?;
    if exit.timed_out {
        warn!(elapsed_ms = exit.elapsed.as_millis() as u64, "Sandbox hit the wall-clock limit");
    }

    let run = collector::collect(workspace.path(), tests, &exit).await?;
    Ok(evaluator::assemble(tests, &run))
}
