use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Upper bound on a submission's source size; larger payloads never reach the queue
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024;

/// Name reported in place of a hidden test's real name
pub const HIDDEN_TEST_NAME: &str = "hidden";

pub type JobId = Uuid;

/// A single test case as supplied by the problem/test store.
///
/// Field names follow the test store's wire format; `expected` and `hidden`
/// are accepted as aliases for the older payload shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input: String,
    #[serde(default, alias = "expected")]
    pub expected_output: String,
    #[serde(default, alias = "hidden")]
    pub is_hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_file_content: Option<String>,
}

impl TestCase {
    /// Attached data file, present only when both name and content are set
    pub fn attached_file(&self) -> Option<(&str, &str)> {
        match (&self.data_file_name, &self.data_file_content) {
            (Some(name), Some(content)) if !name.trim().is_empty() => Some((name, content)),
            _ => None,
        }
    }
}

/// A test case paired with its collision-free on-disk identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeTest {
    /// Zero-based position in the problem's declared test order
    pub index: usize,
    pub safe_name: String,
    pub case: TestCase,
}

impl SafeTest {
    /// Name shown to the submitter, already redacted for hidden tests
    pub fn display_name(&self) -> &str {
        if self.case.is_hidden {
            HIDDEN_TEST_NAME
        } else if self.case.name.trim().is_empty() {
            &self.safe_name
        } else {
            &self.case.name
        }
    }
}

/// Submission payload accepted from clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    #[serde(default)]
    pub problem_id: String,
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("Missing code/problemId")]
    Missing,
    #[error("Source code exceeds maximum size of {MAX_SOURCE_CODE_BYTES} bytes")]
    TooLarge,
}

impl Submission {
    pub fn new(problem_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            problem_id: problem_id.into(),
            code: code.into(),
        }
    }

    /// Reject malformed submissions before they become jobs
    pub fn validate(&self) -> Result<(), SubmissionError> {
        if self.problem_id.trim().is_empty() || self.code.trim().is_empty() {
            return Err(SubmissionError::Missing);
        }
        if self.code.len() > MAX_SOURCE_CODE_BYTES {
            return Err(SubmissionError::TooLarge);
        }
        Ok(())
    }
}

/// A job as handed to the worker that holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub problem_id: String,
    pub source_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a client sees when polling a job handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Active,
    Completed { verdict: Verdict },
    Failed { error: String },
}

impl JobStatus {
    pub fn state(&self) -> JobState {
        match self {
            JobStatus::Queued => JobState::Queued,
            JobStatus::Active => JobState::Active,
            JobStatus::Completed { .. } => JobState::Completed,
            JobStatus::Failed { .. } => JobState::Failed,
        }
    }
}

/// Per-test execution outcome.
///
/// `WA` is only ever assigned after output comparison; the sandbox reports
/// `OK`, `TLE` or `RE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "WA")]
    WrongAnswer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerdictKind {
    Accepted,
    #[serde(rename = "Wrong Answer")]
    WrongAnswer,
    #[serde(rename = "Compile Error")]
    CompileError,
    #[serde(rename = "Runtime Error")]
    RuntimeError,
    #[serde(rename = "Time Limit Exceeded")]
    TimeLimitExceeded,
    #[serde(rename = "No Tests")]
    NoTests,
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerdictKind::Accepted => "Accepted",
            VerdictKind::WrongAnswer => "Wrong Answer",
            VerdictKind::CompileError => "Compile Error",
            VerdictKind::RuntimeError => "Runtime Error",
            VerdictKind::TimeLimitExceeded => "Time Limit Exceeded",
            VerdictKind::NoTests => "No Tests",
        };
        f.write_str(s)
    }
}

/// One reported test entry. Hidden tests carry only `name` and `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub name: String,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

impl TestReport {
    pub fn redacted(status: TestStatus) -> Self {
        Self {
            name: HIDDEN_TEST_NAME.to_string(),
            status,
            output: None,
            expected: None,
            input: None,
        }
    }
}

/// Final grading outcome of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub verdict: VerdictKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_test: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<Vec<TestReport>>,
}

impl Verdict {
    pub fn no_tests() -> Self {
        Self {
            verdict: VerdictKind::NoTests,
            error: Some("No tests have been added to this task yet.".to_string()),
            failed_test: None,
            tests: None,
        }
    }

    pub fn compile_error(diagnostic: impl Into<String>) -> Self {
        Self {
            verdict: VerdictKind::CompileError,
            error: Some(diagnostic.into()),
            failed_test: None,
            tests: None,
        }
    }
}
