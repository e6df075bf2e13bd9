/// Verdict Assembler - reduces sandbox results to one verdict
///
/// **Critical Properties:**
/// - Knows nothing about Docker or Redis
/// - Pure function: (ordered tests, collected run) → verdict
/// - Test order is load-bearing: the first failure in declared order is the
///   one reported, and nothing after it is evaluated
///
/// **Normalization Rules (both sides of the comparison):**
/// - `\r\n` and lone `\r` become `\n`
/// - Trailing whitespace at the very end of the text is ignored
/// - Internal whitespace, blank lines and case are significant
///
/// **Redaction:**
/// Hidden tests are reported as `"hidden"` with their status only: no
/// input, expected output, actual output or diagnostic text.

use crate::collector::{CollectedRun, CollectedTest, CompileOutcome, ExecStatus};
use arbiter_common::types::{SafeTest, TestReport, TestStatus, Verdict, VerdictKind, HIDDEN_TEST_NAME};
use std::borrow::Cow;

/// Normalize output text for comparison
pub fn normalize_output(output: &str) -> Cow<'_, str> {
    let text = if output.contains('\r') {
        Cow::Owned(output.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(output)
    };
    match text {
        Cow::Borrowed(s) => Cow::Borrowed(s.trim_end()),
        Cow::Owned(s) => Cow::Owned(s.trim_end().to_string()),
    }
}

pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize_output(actual) == normalize_output(expected)
}

/// Entry for a test, redacted if hidden
fn report(test: &SafeTest, status: TestStatus, output: Option<&str>) -> TestReport {
    if test.case.is_hidden {
        return TestReport::redacted(status);
    }
    TestReport {
        name: test.display_name().to_string(),
        status,
        output: output.map(str::to_string),
        expected: Some(test.case.expected_output.clone()),
        input: Some(test.case.input.clone()),
    }
}

fn execution_failure(test: &SafeTest, outcome: &CollectedTest, status: ExecStatus) -> Verdict {
    let (verdict, test_status) = match status {
        ExecStatus::TimeLimitExceeded => (VerdictKind::TimeLimitExceeded, TestStatus::TimeLimitExceeded),
        _ => (VerdictKind::RuntimeError, TestStatus::RuntimeError),
    };

    let error = if test.case.is_hidden || outcome.stderr.is_empty() {
        None
    } else {
        Some(outcome.stderr.clone())
    };

    Verdict {
        verdict,
        error,
        failed_test: Some(if test.case.is_hidden {
            HIDDEN_TEST_NAME.to_string()
        } else {
            test.display_name().to_string()
        }),
        tests: Some(vec![report(test, test_status, None)]),
    }
}

/// Assemble the final verdict for a job
pub fn assemble(tests: &[SafeTest], run: &CollectedRun) -> Verdict {
    if tests.is_empty() {
        return Verdict::no_tests();
    }

    if let CompileOutcome::Failed { diagnostic } = &run.compile {
        return Verdict::compile_error(diagnostic.clone());
    }

    let outcomes = tests.iter().zip(run.tests.iter());

    let first_crash = outcomes.clone().find_map(|(test, outcome)| match outcome.status {
        Some(status @ (ExecStatus::TimeLimitExceeded | ExecStatus::RuntimeError)) => {
            Some((test, outcome, status))
        }
        _ => None,
    });
    if let Some((test, outcome, status)) = first_crash {
        return execution_failure(test, outcome, status);
    }

    let mut reports = Vec::with_capacity(tests.len());
    for (test, outcome) in outcomes {
        let passed = outputs_match(&outcome.stdout, &test.case.expected_output);
        let status = if passed { TestStatus::Ok } else { TestStatus::WrongAnswer };
        reports.push(report(test, status, Some(&outcome.stdout)));

        if !passed {
            return Verdict {
                verdict: VerdictKind::WrongAnswer,
                error: None,
                failed_test: None,
                tests: Some(reports),
            };
        }
    }

    Verdict {
        verdict: VerdictKind::Accepted,
        error: None,
        failed_test: None,
        tests: Some(reports),
    }
}
