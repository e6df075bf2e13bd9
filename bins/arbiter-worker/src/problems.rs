// Where a problem's tests come from
use arbiter_common::config::Config;
use arbiter_common::redis::load_tests;
use arbiter_common::types::TestCase;
use async_trait::async_trait;
use redis::aio::ConnectionManager;

#[async_trait]
pub trait TestSource: Send + Sync {
    /// Tests for a problem in declared order; unknown problems have none
    async fn tests_for(&self, problem_id: &str) -> anyhow::Result<Vec<TestCase>>;
}

/// Tests stored by the CLI under `arbiter:tests:<problem_id>`
#[derive(Clone)]
pub struct RedisTestSource {
    conn: ConnectionManager,
}

impl RedisTestSource {
    pub async fn connect(config: &Config) -> redis::RedisResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl TestSource for RedisTestSource {
    async fn tests_for(&self, problem_id: &str) -> anyhow::Result<Vec<TestCase>> {
        let mut conn = self.conn.clone();
        Ok(load_tests(&mut conn, problem_id).await?)
    }
}
