/// Test Normalizer - maps author-supplied test names to on-disk identifiers
///
/// Pure and deterministic: the same test list always yields the same
/// `safe_name`s, in the same order, with no I/O.

use arbiter_common::types::{SafeTest, TestCase};
use std::collections::HashSet;

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Collapse every run of characters outside `[A-Za-z0-9_-]` into one `_`
/// and trim separators from both ends
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        if is_safe_char(c) {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out.trim_matches(|c| c == '_' || c == '-').to_string()
}

/// Produce collision-free identifiers for a problem's tests, preserving order
pub fn normalize(tests: &[TestCase]) -> Vec<SafeTest> {
    let mut used = HashSet::with_capacity(tests.len());

    tests
        .iter()
        .enumerate()
        .map(|(index, case)| {
            let placeholder = format!("test-{}", index + 1);
            let base = match sanitize(&case.name) {
                s if s.is_empty() => placeholder,
                s => s,
            };

            let mut safe_name = base.clone();
            let mut suffix = 2;
            while used.contains(&safe_name) {
                safe_name = format!("{}_{}", base, suffix);
                suffix += 1;
            }
            used.insert(safe_name.clone());

            SafeTest {
                index,
                safe_name,
                case: case.clone(),
            }
        })
        .collect()
}
