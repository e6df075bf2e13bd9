// Worker configuration: optional JSON file, then environment overrides
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/worker.json";

/// Resource ceilings applied to every sandbox invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    pub image: String,
    pub timeout_secs: u64,
    pub cpus: f64,
    pub memory_limit_mb: u64,
    pub pids_limit: i64,
    pub tmpfs_mb: u64,
    /// Limit for one run of the compiled program, enforced inside the sandbox
    pub per_test_timeout_secs: u64,
    /// `uid:gid` the compiler and the submitted program run as. Must not own
    /// the job workspace.
    pub program_user: String,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            image: "arbiter-cpp-sandbox:latest".to_string(),
            timeout_secs: 30,
            cpus: 1.0,
            memory_limit_mb: 256,
            pids_limit: 64,
            tmpfs_mb: 64,
            per_test_timeout_secs: 2,
            program_user: "65534:65534".to_string(),
        }
    }
}

impl SandboxLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn memory_bytes(&self) -> i64 {
        (self.memory_limit_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }

    /// `program_user` as numeric ids, or `None` if it is not `uid:gid`
    pub fn program_ids(&self) -> Option<(u32, u32)> {
        let (uid, gid) = self.program_user.trim().split_once(':')?;
        Some((uid.parse().ok()?, gid.parse().ok()?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent worker slots (max concurrent sandboxes)
    pub concurrency: usize,
    /// Directory under which per-job working directories are created
    pub jobs_base: PathBuf,
    /// Identifies this worker's active list in the job store
    pub worker_id: String,
    /// How long one dequeue blocks before re-checking for shutdown
    pub poll_timeout_secs: u64,
    pub sandbox: SandboxLimits,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            jobs_base: PathBuf::from("jobs"),
            worker_id: default_worker_id(),
            poll_timeout_secs: 5,
            sandbox: SandboxLimits::default(),
        }
    }
}

fn default_worker_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| format!("worker-{}", std::process::id()))
}

impl WorkerConfig {
    /// Load from a JSON file; a missing file means defaults
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// File named by `ARBITER_CONFIG` (or the default path), then env overrides
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("ARBITER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::load(Path::new(&path))?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>>
        where
            T::Err: std::fmt::Display,
        {
            raw.map(|v| {
                v.trim()
                    .parse::<T>()
                    .map_err(|e| anyhow::anyhow!("Invalid {}={:?}: {}", key, v, e))
            })
            .transpose()
        }

        if let Some(v) = parsed("CONCURRENCY", lookup("CONCURRENCY"))? {
            self.concurrency = v;
        }
        if let Some(v) = lookup("JOBS_BASE").filter(|v| !v.trim().is_empty()) {
            self.jobs_base = PathBuf::from(v);
        }
        if let Some(v) = lookup("WORKER_ID").filter(|v| !v.trim().is_empty()) {
            self.worker_id = v;
        }
        if let Some(v) = lookup("SANDBOX_IMAGE").filter(|v| !v.trim().is_empty()) {
            self.sandbox.image = v;
        }
        if let Some(v) = parsed("SANDBOX_TIMEOUT_SECS", lookup("SANDBOX_TIMEOUT_SECS"))? {
            self.sandbox.timeout_secs = v;
        }
        if let Some(v) = parsed("SANDBOX_CPUS", lookup("SANDBOX_CPUS"))? {
            self.sandbox.cpus = v;
        }
        if let Some(v) = parsed("SANDBOX_MEMORY_MB", lookup("SANDBOX_MEMORY_MB"))? {
            self.sandbox.memory_limit_mb = v;
        }
        if let Some(v) = parsed("SANDBOX_PIDS_LIMIT", lookup("SANDBOX_PIDS_LIMIT"))? {
            self.sandbox.pids_limit = v;
        }
        if let Some(v) = parsed("SANDBOX_TMPFS_MB", lookup("SANDBOX_TMPFS_MB"))? {
            self.sandbox.tmpfs_mb = v;
        }
        if let Some(v) = parsed("SANDBOX_PER_TEST_TIMEOUT_SECS", lookup("SANDBOX_PER_TEST_TIMEOUT_SECS"))? {
            self.sandbox.per_test_timeout_secs = v;
        }
        if let Some(v) = lookup("SANDBOX_PROGRAM_USER").filter(|v| !v.trim().is_empty()) {
            self.sandbox.program_user = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.poll_timeout_secs == 0 {
            bail!("poll_timeout_secs must be at least 1");
        }
        let sandbox = &self.sandbox;
        if sandbox.timeout_secs == 0 {
            bail!("sandbox timeout must be at least 1 second");
        }
        if sandbox.cpus.is_nan() || sandbox.cpus <= 0.0 {
            bail!("sandbox cpus must be positive");
        }
        if sandbox.memory_limit_mb == 0 || sandbox.pids_limit <= 0 || sandbox.tmpfs_mb == 0 {
            bail!("sandbox memory, pids and tmpfs limits must be positive");
        }
        if sandbox.per_test_timeout_secs == 0 {
            bail!("per-test timeout must be at least 1 second");
        }
        match sandbox.program_ids() {
            Some((0, _)) => bail!("program_user must not be root"),
            Some(_) => {}
            None => bail!("program_user must be numeric uid:gid, got {:?}", sandbox.program_user),
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}
