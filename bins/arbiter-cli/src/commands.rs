// CLI commands for operating Arbiter
use anyhow::{bail, Context, Result};
use arbiter_common::config::Config;
use arbiter_common::redis::store_tests;
use arbiter_common::store::{JobStore, RedisJobStore};
use arbiter_common::types::{JobId, JobStatus, Submission, TestCase};
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

async fn connect() -> Result<RedisJobStore> {
    let config = Config::from_env();
    RedisJobStore::connect(&config, "cli")
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))
}

fn read_submission(problem: &str, file: &Path) -> Result<Submission> {
    let code = fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let submission = Submission::new(problem, code);
    submission.validate()?;
    Ok(submission)
}

/// Parse and sanity-check a test list file
pub fn parse_tests(content: &str) -> Result<Vec<TestCase>> {
    let tests: Vec<TestCase> = serde_json::from_str(content).context("Test file must be a JSON array of tests")?;

    for (i, test) in tests.iter().enumerate() {
        if test.data_file_name.is_some() != test.data_file_content.is_some() {
            bail!(
                "Test #{} ({:?}) needs both data_file_name and data_file_content, or neither",
                i + 1,
                test.name
            );
        }
    }
    Ok(tests)
}

/// Store a problem's test list
pub async fn load_tests(problem: &str, file: &Path) -> Result<()> {
    if problem.trim().is_empty() {
        bail!("Problem id cannot be empty");
    }
    let content = fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let tests = parse_tests(&content)?;

    let config = Config::from_env();
    let client = redis::Client::open(config.redis_url.as_str())?;
    let mut conn = redis::aio::ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;

    store_tests(&mut conn, problem, &tests).await.context("Failed to store tests")?;

    let hidden = tests.iter().filter(|t| t.is_hidden).count();
    println!(
        "✅ Stored {} tests for problem '{}' ({} hidden)",
        tests.len(),
        problem,
        hidden
    );
    Ok(())
}

async fn wait_for_terminal(store: &impl JobStore, id: JobId, timeout: Duration) -> Result<JobStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match store.status(id).await? {
            Some(status) if status.state().is_terminal() => return Ok(status),
            Some(_) => {}
            None => bail!("Job {} not found (expired or never queued)", id),
        }
        if Instant::now() >= deadline {
            bail!("Timed out after {:?} waiting for job {}", timeout, id);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Queue a submission, optionally waiting for its verdict
pub async fn submit(problem: &str, file: &Path, wait: bool, timeout_secs: u64) -> Result<()> {
    let submission = read_submission(problem, file)?;
    let store = connect().await?;

    let id = store.enqueue(&submission).await.context("Failed to queue submission")?;
    println!("📨 Queued job {}", id);

    if wait {
        let status = wait_for_terminal(&store, id, Duration::from_secs(timeout_secs)).await?;
        println!("{}", serde_json::to_string_pretty(&status)?);
    }
    Ok(())
}

/// Print a job's current status
pub async fn status(job: &str) -> Result<()> {
    let id: JobId = job.parse().with_context(|| format!("Invalid job id '{}'", job))?;
    let store = connect().await?;

    match store.status(id).await? {
        Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
        None => bail!("Job {} not found", id),
    }
    Ok(())
}

#[derive(Debug)]
enum Outcome {
    Finished { label: String, elapsed: Duration },
    Failed { reason: String, elapsed: Duration },
}

/// What a finished job counts as in the summary
fn outcome_label(status: &JobStatus) -> String {
    match status {
        JobStatus::Completed { verdict } => verdict.verdict.to_string(),
        JobStatus::Failed { .. } => "Failed (infrastructure)".to_string(),
        other => other.state().to_string(),
    }
}

#[derive(Debug, Default, PartialEq)]
struct Summary {
    counts: BTreeMap<String, usize>,
    errors: usize,
    min: Option<Duration>,
    max: Option<Duration>,
    avg: Option<Duration>,
}

fn summarize(outcomes: &[Outcome]) -> Summary {
    let mut summary = Summary::default();
    let mut finished = Vec::new();

    for outcome in outcomes {
        match outcome {
            Outcome::Finished { label, elapsed } => {
                *summary.counts.entry(label.clone()).or_default() += 1;
                finished.push(*elapsed);
            }
            Outcome::Failed { .. } => summary.errors += 1,
        }
    }

    summary.min = finished.iter().min().copied();
    summary.max = finished.iter().max().copied();
    if !finished.is_empty() {
        summary.avg = Some(finished.iter().sum::<Duration>() / finished.len() as u32);
    }
    summary
}

async fn simulate_user(
    store: &RedisJobStore,
    user: usize,
    submission: &Submission,
    start_delay: Duration,
    timeout: Duration,
) -> Outcome {
    tokio::time::sleep(start_delay).await;
    let start = Instant::now();

    let result = match store.enqueue(submission).await {
        Ok(id) => wait_for_terminal(store, id, timeout).await,
        Err(e) => Err(e.into()),
    };

    let elapsed = start.elapsed();
    match result {
        Ok(status) => {
            let label = outcome_label(&status);
            println!("  [user {:>4}] {} in {:?}", user, label, elapsed);
            Outcome::Finished { label, elapsed }
        }
        Err(e) => {
            println!("  [user {:>4}] ❌ {}", user, e);
            Outcome::Failed {
                reason: e.to_string(),
                elapsed,
            }
        }
    }
}

/// Fire `users` concurrent submissions and report how the pipeline coped
pub async fn stress(problem: &str, file: &Path, users: usize, delay_ms: u64, timeout_secs: u64) -> Result<()> {
    if users == 0 {
        bail!("--users must be at least 1");
    }
    let submission = read_submission(problem, file)?;
    let store = connect().await?;
    let timeout = Duration::from_secs(timeout_secs);

    println!("🔥 Stress test: {} users on problem '{}'", users, problem);
    let wall = Instant::now();

    let runs = (0..users).map(|user| {
        let delay = Duration::from_millis(delay_ms * user as u64);
        simulate_user(&store, user + 1, &submission, delay, timeout)
    });
    let outcomes = join_all(runs).await;

    let summary = summarize(&outcomes);
    println!("\n📊 Results after {:?}", wall.elapsed());
    for (label, count) in &summary.counts {
        println!("  {:<28} {}", label, count);
    }
    if summary.errors > 0 {
        println!("  {:<28} {}", "Errors", summary.errors);
        if let Some(Outcome::Failed { reason, elapsed }) =
            outcomes.iter().find(|o| matches!(o, Outcome::Failed { .. }))
        {
            println!("  first error after {:?}: {}", elapsed, reason);
        }
    }
    if let (Some(min), Some(avg), Some(max)) = (summary.min, summary.avg, summary.max) {
        println!("\n⏱️  Latency min {:?} / avg {:?} / max {:?}", min, avg, max);
    }
    Ok(())
}
