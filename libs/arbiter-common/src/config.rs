// Shared connection settings for the API, worker and CLI

use std::env;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Job records are kept for a day after their last transition
pub const DEFAULT_RESULT_TTL_SECS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub redis_url: String,
    pub result_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            result_ttl_secs: DEFAULT_RESULT_TTL_SECS,
        }
    }
}

impl Config {
    /// Read `REDIS_URL` and `RESULT_TTL_SECS`, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            redis_url: lookup("REDIS_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.redis_url),
            result_ttl_secs: lookup("RESULT_TTL_SECS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|ttl| *ttl > 0)
                .unwrap_or(defaults.result_ttl_secs),
        }
    }
}
