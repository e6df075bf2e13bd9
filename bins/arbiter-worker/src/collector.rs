/// Result Collector - marshals sandbox artifacts into in-process results
///
/// No judgement happens here. The only decisions are structural: whether
/// the sandbox left a valid summary, and which files to read for which test.

use crate::engine::SandboxExit;
use crate::workspace::{output_path, stderr_path, COMPILE_STDERR_FILE, RESULTS_FILE};
use arbiter_common::types::SafeTest;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::path::Path;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

pub const RESULTS_SCHEMA_VERSION: u32 = 1;

/// Captured output beyond this is dropped before comparison
pub const MAX_CAPTURED_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CompileStatus {
    Ok,
    Error,
}

/// Execution status as reported by the sandbox; `WA` is never produced there
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ExecStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "RE")]
    RuntimeError,
}

#[derive(Debug, Deserialize)]
struct SummaryTest {
    name: String,
    status: ExecStatus,
}

/// `results.json`, written by the sandbox
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Summary {
    version: u32,
    compile: CompileStatus,
    #[serde(default)]
    tests: Vec<SummaryTest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Compiled,
    Failed { diagnostic: String },
}

/// One test's sandbox-side outcome, in declared order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedTest {
    /// `None` when the sandbox never got to this test
    pub status: Option<ExecStatus>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedRun {
    pub compile: CompileOutcome,
    pub tests: Vec<CollectedTest>,
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("sandbox was killed after {0:?} before writing any results")]
    NeverRan(std::time::Duration),
    #[error("sandbox exited (code {exit_code:?}, oom_killed={oom_killed}) without writing results")]
    MissingSummary { exit_code: Option<i64>, oom_killed: bool },
    #[error("malformed sandbox results: {0}")]
    Malformed(String),
    #[error("failed to read sandbox results: {0}")]
    Io(#[from] io::Error),
}

/// Read up to `MAX_CAPTURED_BYTES` of a file; a missing file reads as empty
async fn read_capped(path: &Path) -> io::Result<String> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e),
    };
    let mut buf = Vec::new();
    file.take(MAX_CAPTURED_BYTES).read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Captured program output never fails the job: unreadable reads as empty
async fn read_capture(path: &Path) -> String {
    match read_capped(path).await {
        Ok(text) => text,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Unreadable capture treated as empty");
            String::new()
        }
    }
}

fn parse_summary(
    raw: &str,
    tests: &[SafeTest],
) -> Result<(CompileStatus, HashMap<String, ExecStatus>), CollectError> {
    let summary: Summary =
        serde_json::from_str(raw).map_err(|e| CollectError::Malformed(format!("results.json: {}", e)))?;

    if summary.version != RESULTS_SCHEMA_VERSION {
        return Err(CollectError::Malformed(format!(
            "unsupported results version {} (expected {})",
            summary.version, RESULTS_SCHEMA_VERSION
        )));
    }

    let mut statuses = HashMap::with_capacity(summary.tests.len());
    if summary.compile == CompileStatus::Error {
        return Ok((CompileStatus::Error, statuses));
    }
    for entry in summary.tests {
        if !tests.iter().any(|t| t.safe_name == entry.name) {
            return Err(CollectError::Malformed(format!("unknown test '{}'", entry.name)));
        }
        if statuses.insert(entry.name.clone(), entry.status).is_some() {
            return Err(CollectError::Malformed(format!("duplicate test '{}'", entry.name)));
        }
    }
    Ok((CompileStatus::Ok, statuses))
}

/// Read a finished sandbox's workspace back into a `CollectedRun`
pub async fn collect(root: &Path, tests: &[SafeTest], exit: &SandboxExit) -> Result<CollectedRun, CollectError> {
    let raw = match tokio::fs::read_to_string(root.join(RESULTS_FILE)).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(if exit.timed_out {
                CollectError::NeverRan(exit.elapsed)
            } else {
                CollectError::MissingSummary {
                    exit_code: exit.exit_code,
                    oom_killed: exit.oom_killed,
                }
            });
        }
        Err(e) => return Err(e.into()),
    };

    let (compile, statuses) = parse_summary(&raw, tests)?;

    if compile == CompileStatus::Error {
        let diagnostic = read_capped(&root.join(COMPILE_STDERR_FILE)).await?;
        return Ok(CollectedRun {
            compile: CompileOutcome::Failed { diagnostic },
            tests: Vec::new(),
        });
    }

    let mut ordered: Vec<Option<ExecStatus>> =
        tests.iter().map(|t| statuses.get(&t.safe_name).copied()).collect();

    // Killed mid-run: the first test without a status is the one that was running
    if exit.timed_out {
        if let Some(slot) = ordered.iter_mut().find(|s| s.is_none()) {
            *slot = Some(ExecStatus::TimeLimitExceeded);
        }
    }

    let first_failure = ordered
        .iter()
        .position(|s| matches!(s, Some(ExecStatus::TimeLimitExceeded | ExecStatus::RuntimeError)));
    let checked = first_failure.unwrap_or(ordered.len());
    if let Some(missing) = ordered[..checked].iter().position(Option::is_none) {
        return Err(CollectError::Malformed(format!(
            "no status reported for test '{}'",
            tests[missing].safe_name
        )));
    }

    let mut collected = Vec::with_capacity(tests.len());
    for (test, status) in tests.iter().zip(ordered) {
        let (stdout, stderr) = match status {
            Some(ExecStatus::Ok) => (read_capture(&output_path(root, &test.safe_name)).await, String::new()),
            Some(_) => (String::new(), read_capture(&stderr_path(root, &test.safe_name)).await),
            None => (String::new(), String::new()),
        };
        collected.push(CollectedTest { status, stdout, stderr });
    }

    Ok(CollectedRun {
        compile: CompileOutcome::Compiled,
        tests: collected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::normalize;
    use crate::workspace::{ERRS_DIR, OUTS_DIR};
    use arbiter_common::types::TestCase;
    use std::fs;
    use std::time::Duration;

    fn tests_named(names: &[&str]) -> Vec<SafeTest> {
        let cases: Vec<TestCase> = names
            .iter()
            .map(|n| TestCase {
                name: n.to_string(),
                input: String::new(),
                expected_output: String::new(),
                is_hidden: false,
                data_file_name: None,
                data_file_content: None,
            })
            .collect();
        normalize(&cases)
    }

    fn exited() -> SandboxExit {
        SandboxExit {
            exit_code: Some(0),
            timed_out: false,
            oom_killed: false,
            elapsed: Duration::from_millis(800),
        }
    }

    fn killed() -> SandboxExit {
        SandboxExit {
            exit_code: None,
            timed_out: true,
            oom_killed: false,
            elapsed: Duration::from_secs(30),
        }
    }

    fn workspace(results: Option<&str>) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(OUTS_DIR)).unwrap();
        fs::create_dir_all(dir.path().join(ERRS_DIR)).unwrap();
        if let Some(results) = results {
            fs::write(dir.path().join(RESULTS_FILE), results).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_reads_outputs_in_declared_order() {
        let tests = tests_named(&["a", "b"]);
        let dir = workspace(Some(
            r#"{"version":1,"compile":"ok","tests":[{"name":"b","status":"OK"},{"name":"a","status":"OK"}]}"#,
        ));
        fs::write(output_path(dir.path(), "a"), "1\n").unwrap();
        fs::write(output_path(dir.path(), "b"), "2\n").unwrap();

        let run = collect(dir.path(), &tests, &exited()).await.unwrap();
        assert_eq!(run.compile, CompileOutcome::Compiled);
        assert_eq!(run.tests[0].stdout, "1\n");
        assert_eq!(run.tests[1].stdout, "2\n");
    }

    #[tokio::test]
    async fn test_missing_output_is_empty() {
        let tests = tests_named(&["a"]);
        let dir = workspace(Some(r#"{"version":1,"compile":"ok","tests":[{"name":"a","status":"OK"}]}"#));

        let run = collect(dir.path(), &tests, &exited()).await.unwrap();
        assert_eq!(run.tests[0].status, Some(ExecStatus::Ok));
        assert_eq!(run.tests[0].stdout, "");
    }

    #[tokio::test]
    async fn test_compile_error_reads_diagnostic() {
        let tests = tests_named(&["a"]);
        let dir = workspace(Some(r#"{"version":1,"compile":"error","tests":[]}"#));
        fs::write(dir.path().join(COMPILE_STDERR_FILE), "main.cpp:3: error: expected ';'").unwrap();

        let run = collect(dir.path(), &tests, &exited()).await.unwrap();
        assert_eq!(
            run.compile,
            CompileOutcome::Failed {
                diagnostic: "main.cpp:3: error: expected ';'".to_string()
            }
        );
        assert!(run.tests.is_empty());
    }

    #[tokio::test]
    async fn test_runtime_error_reads_per_test_stderr() {
        let tests = tests_named(&["a", "b"]);
        let dir = workspace(Some(
            r#"{"version":1,"compile":"ok","tests":[{"name":"a","status":"RE"},{"name":"b","status":"OK"}]}"#,
        ));
        fs::write(stderr_path(dir.path(), "a"), "Segmentation fault").unwrap();
        fs::write(stderr_path(dir.path(), "b"), "unrelated").unwrap();

        let run = collect(dir.path(), &tests, &exited()).await.unwrap();
        assert_eq!(run.tests[0].status, Some(ExecStatus::RuntimeError));
        assert_eq!(run.tests[0].stderr, "Segmentation fault");
        assert_eq!(run.tests[1].stderr, "");
    }

    #[tokio::test]
    async fn test_timeout_with_partial_summary_marks_running_test() {
        let tests = tests_named(&["a", "b", "c"]);
        let dir = workspace(Some(r#"{"version":1,"compile":"ok","tests":[{"name":"a","status":"OK"}]}"#));

        let run = collect(dir.path(), &tests, &killed()).await.unwrap();
        assert_eq!(run.tests[0].status, Some(ExecStatus::Ok));
        assert_eq!(run.tests[1].status, Some(ExecStatus::TimeLimitExceeded));
        assert_eq!(run.tests[2].status, None);
    }

    #[tokio::test]
    async fn test_timeout_without_summary_never_ran() {
        let tests = tests_named(&["a"]);
        let dir = workspace(None);
        assert!(matches!(
            collect(dir.path(), &tests, &killed()).await,
            Err(CollectError::NeverRan(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_summary_is_infrastructure_error() {
        let tests = tests_named(&["a"]);
        let dir = workspace(None);
        assert!(matches!(
            collect(dir.path(), &tests, &exited()).await,
            Err(CollectError::MissingSummary { .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_summaries_rejected() {
        let tests = tests_named(&["a", "b"]);
        let cases = [
            "OK",
            r#"{"version":2,"compile":"ok","tests":[]}"#,
            r#"{"version":1,"compile":"ok","tests":[{"name":"zzz","status":"OK"}]}"#,
            r#"{"version":1,"compile":"ok","tests":[{"name":"a","status":"OK"},{"name":"a","status":"OK"}]}"#,
            r#"{"version":1,"compile":"ok","tests":[{"name":"a","status":"WA"}]}"#,
            r#"{"version":1,"compile":"ok","tests":[{"name":"b","status":"OK"}]}"#,
        ];
        for raw in cases {
            let dir = workspace(Some(raw));
            let result = collect(dir.path(), &tests, &exited()).await;
            assert!(matches!(result, Err(CollectError::Malformed(_))), "accepted {raw}");
        }
    }

    #[tokio::test]
    async fn test_tests_after_failure_may_be_unreported() {
        let tests = tests_named(&["a", "b"]);
        let dir = workspace(Some(r#"{"version":1,"compile":"ok","tests":[{"name":"a","status":"TLE"}]}"#));

        let run = collect(dir.path(), &tests, &exited()).await.unwrap();
        assert_eq!(run.tests[0].status, Some(ExecStatus::TimeLimitExceeded));
        assert_eq!(run.tests[1].status, None);
    }

    #[tokio::test]
    async fn test_capture_is_capped() {
        let tests = tests_named(&["a"]);
        let dir = workspace(Some(r#"{"version":1,"compile":"ok","tests":[{"name":"a","status":"OK"}]}"#));
        let big = vec![b'x'; MAX_CAPTURED_BYTES as usize + 10];
        fs::write(output_path(dir.path(), "a"), big).unwrap();

        let run = collect(dir.path(), &tests, &exited()).await.unwrap();
        assert_eq!(run.tests[0].stdout.len(), MAX_CAPTURED_BYTES as usize);
    }
}
