use crate::types::{JobId, TestCase};
use redis::{AsyncCommands, RedisResult};

/// Redis key layout - defines only naming, not runtime logic
/// Ensures API, worker and CLI never drift and keys stay deterministic

pub const KEY_PREFIX: &str = "arbiter";
pub const QUEUE_KEY: &str = "arbiter:queue:submissions";
pub const JOB_PREFIX: &str = "arbiter:job";
pub const ACTIVE_PREFIX: &str = "arbiter:active";
pub const TESTS_PREFIX: &str = "arbiter:tests";

/// Hash holding one job's state, payload and result
pub fn job_key(job_id: &JobId) -> String {
    format!("{}:{}", JOB_PREFIX, job_id)
}

/// Per-worker list of jobs that worker currently holds active
pub fn active_key(worker_id: &str) -> String {
    format!("{}:{}", ACTIVE_PREFIX, worker_id)
}

/// Ordered test list for a problem, written by the external test editor
pub fn tests_key(problem_id: &str) -> String {
    format!("{}:{}", TESTS_PREFIX, problem_id)
}

pub(crate) fn type_error(what: &'static str, detail: impl ToString) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, what, detail.to_string()))
}

/// Replace a problem's test list
pub async fn store_tests(
    conn: &mut redis::aio::ConnectionManager,
    problem_id: &str,
    tests: &[TestCase],
) -> RedisResult<()> {
    let payload = serde_json::to_string(tests).map_err(|e| type_error("serialization error", e))?;
    conn.set(tests_key(problem_id), payload).await
}

/// Load a problem's test list in declared order; an unknown problem has no tests
pub async fn load_tests(
    conn: &mut redis::aio::ConnectionManager,
    problem_id: &str,
) -> RedisResult<Vec<TestCase>> {
    let payload: Option<String> = conn.get(tests_key(problem_id)).await?;

    match payload {
        Some(data) => serde_json::from_str(&data).map_err(|e| type_error("deserialization error", e)),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_job_key_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(job_key(&id), job_key(&id));
        assert!(job_key(&id).starts_with("arbiter:job:"));
        assert!(job_key(&id).contains(&id.to_string()));
    }

    #[test]
    fn test_active_and_tests_keys() {
        assert_eq!(active_key("worker-a"), "arbiter:active:worker-a");
        assert_eq!(tests_key("42"), "arbiter:tests:42");
        assert!(QUEUE_KEY.starts_with(KEY_PREFIX));
    }
}
