/// Sandbox Runner - isolated execution of one staged job
///
/// **Boundary:**
/// - The sandbox knows HOW to run the staged workspace in isolation
/// - It does NOT read results, compare outputs or assign verdicts
/// - Its only product is how the invocation ended (exit code / timeout)
///
/// `Sandbox` is the capability seam; `DockerEngine` is the production
/// implementation. Anything that can enforce the limits (microVM, restricted
/// subprocess) can replace it without touching the pool or the evaluator.

use crate::collector::MAX_CAPTURED_BYTES;
use crate::config::SandboxLimits;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Mount point of the job workspace inside the sandbox
pub const SANDBOX_MOUNT: &str = "/sandbox";

/// Just enough for `run.sh` to drop to `program_user` and write into a
/// workspace owned by the worker
const RUNNER_CAPABILITIES: [&str; 3] = ["SETUID", "SETGID", "DAC_OVERRIDE"];

/// How one sandbox invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxExit {
    pub exit_code: Option<i64>,
    /// The wall-clock limit expired and the sandbox was killed
    pub timed_out: bool,
    pub oom_killed: bool,
    pub elapsed: Duration,
}

/// The invocation itself could not run. Never a verdict.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox backend unavailable: {0}")]
    Unavailable(String),
    #[error("failed to launch sandbox: {0}")]
    Launch(String),
    #[error("lost track of sandbox: {0}")]
    Wait(String),
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run the sandbox over a staged workspace, bounded by `limits`
    async fn execute(&self, work_dir: &Path, limits: &SandboxLimits) -> Result<SandboxExit, SandboxError>;
}

/// Container cleanup guard - force-removes the container if the normal
/// removal path is never reached (error, cancellation, panic)
struct ContainerGuard {
    docker: Docker,
    container_id: Option<String>,
}

impl ContainerGuard {
    fn new(docker: &Docker, container_id: String) -> Self {
        Self {
            docker: docker.clone(),
            container_id: Some(container_id),
        }
    }

    /// Remove now and disarm the drop fallback
    async fn remove(mut self) {
        if let Some(id) = self.container_id.take() {
            if let Err(e) = self.docker.remove_container(&id, Some(force_remove())).await {
                warn!(container_id = %id, error = %e, "Failed to remove sandbox container");
            }
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(container_id) = self.container_id.take() else {
            return;
        };
        let docker = self.docker.clone();
        // Drop cannot await; hand removal to the runtime if one is still there
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = docker.remove_container(&container_id, Some(force_remove())).await {
                    warn!(container_id = %container_id, error = %e, "Failed to cleanup sandbox container");
                }
            });
        }
    }
}

fn force_remove() -> RemoveContainerOptions {
    RemoveContainerOptions {
        force: true,
        ..Default::default()
    }
}

/// Docker-based sandbox
///
/// **Container policy:**
/// - Network: none
/// - CPU / memory (swap included) / pids capped from `SandboxLimits`
/// - All capabilities dropped except `SETUID`, `SETGID` and `DAC_OVERRIDE`,
///   `no-new-privileges`
/// - `run.sh` starts as root to write results into the workspace, then runs
///   the compiler and the program as `program_user`, which cannot reach
///   `/sandbox` and writes only to the size-capped `/tmp` tmpfs
/// - Workspace bind-mounted read-write at `/sandbox`
/// - Hard wall-clock timeout; the container is killed on expiry
/// - Container removed on every path
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Unavailable(format!("Failed to connect to Docker daemon: {}", e)))?;
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::Unavailable(e.to_string()))
    }

    /// Ensure the sandbox image is available (pull if needed)
    pub async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::Unavailable(format!("Failed to pull image '{}': {}", image, e)))?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    fn container_config(work_dir: &Path, limits: &SandboxLimits) -> Result<Config<String>, SandboxError> {
        let host_dir = work_dir
            .to_str()
            .ok_or_else(|| SandboxError::Launch(format!("workspace path is not UTF-8: {}", work_dir.display())))?;

        // The compiled program lives here too, so no noexec
        let tmpfs = HashMap::from([(
            "/tmp".to_string(),
            format!("rw,nosuid,size={}m", limits.tmpfs_mb),
        )]);

        let env = vec![
            format!("PER_TEST_TIMEOUT={}", limits.per_test_timeout_secs),
            format!("PROGRAM_USER={}", limits.program_user.trim()),
            format!("MAX_OUTPUT_BYTES={}", MAX_CAPTURED_BYTES),
        ];

        Ok(Config {
            image: Some(limits.image.clone()),
            user: Some("0:0".to_string()),
            env: Some(env),
            working_dir: Some(SANDBOX_MOUNT.to_string()),
            network_disabled: Some(true),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}:rw", host_dir, SANDBOX_MOUNT)]),
                network_mode: Some("none".to_string()),
                nano_cpus: Some(limits.nano_cpus()),
                memory: Some(limits.memory_bytes()),
                memory_swap: Some(limits.memory_bytes()),
                pids_limit: Some(limits.pids_limit),
                cap_drop: Some(vec!["ALL".to_string()]),
                cap_add: Some(RUNNER_CAPABILITIES.iter().map(|c| c.to_string()).collect()),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                tmpfs: Some(tmpfs),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn wait_for_exit(&self, container_id: &str) -> Result<Option<i64>, SandboxError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(container_id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(Some(response.status_code)),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(Some(code)),
            Some(Err(e)) => Err(SandboxError::Wait(e.to_string())),
            None => Ok(None),
        }
    }

    async fn was_oom_killed(&self, container_id: &str) -> bool {
        match self.docker.inspect_container(container_id, None).await {
            Ok(info) => info.state.and_then(|s| s.oom_killed).unwrap_or(false),
            Err(e) => {
                debug!(container_id = %container_id, error = %e, "Could not inspect finished container");
                false
            }
        }
    }
}

#[async_trait]
impl Sandbox for DockerEngine {
    async fn execute(&self, work_dir: &Path, limits: &SandboxLimits) -> Result<SandboxExit, SandboxError> {
        self.ensure_image(&limits.image).await?;

        let config = Self::container_config(work_dir, limits)?;
        let container_name = format!("arbiter-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| SandboxError::Launch(format!("Failed to create container: {}", e)))?;

        let container_id = container.id;
        let guard = ContainerGuard::new(&self.docker, container_id.clone());

        let start = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Launch(format!("Failed to start container: {}", e)))?;

        debug!(
            container = %container_name,
            timeout_secs = limits.timeout_secs,
            memory_mb = limits.memory_limit_mb,
            pids_limit = limits.pids_limit,
            "Sandbox started"
        );

        let exit = match tokio::time::timeout(limits.timeout(), self.wait_for_exit(&container_id)).await {
            Ok(Ok(exit_code)) => SandboxExit {
                exit_code,
                timed_out: false,
                oom_killed: self.was_oom_killed(&container_id).await,
                elapsed: start.elapsed(),
            },
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(
                    container = %container_name,
                    timeout_secs = limits.timeout_secs,
                    "Sandbox exceeded wall-clock limit, killing"
                );
                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(container = %container_name, error = %e, "Failed to kill timed-out sandbox");
                }
                SandboxExit {
                    exit_code: None,
                    timed_out: true,
                    oom_killed: false,
                    elapsed: start.elapsed(),
                }
            }
        };

        guard.remove().await;

        if exit.exit_code.unwrap_or(0) != 0 {
            warn!(
                container = %container_name,
                exit_code = ?exit.exit_code,
                oom_killed = exit.oom_killed,
                "Sandbox exited non-zero"
            );
        }

        Ok(exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_config_applies_limits() {
        let limits = SandboxLimits {
            program_user: "2000:2000".to_string(),
            per_test_timeout_secs: 3,
            ..SandboxLimits::default()
        };
        let config = DockerEngine::container_config(Path::new("/jobs/job-abc"), &limits).unwrap();
        let host = config.host_config.unwrap();

        assert_eq!(config.image.as_deref(), Some("arbiter-cpp-sandbox:latest"));
        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.binds.unwrap(), vec!["/jobs/job-abc:/sandbox:rw".to_string()]);
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.nano_cpus, Some(1_000_000_000));
        assert_eq!(host.pids_limit, Some(64));
        assert_eq!(host.security_opt.unwrap(), vec!["no-new-privileges".to_string()]);
        assert_eq!(
            host.tmpfs.unwrap().get("/tmp").map(String::as_str),
            Some("rw,nosuid,size=64m")
        );

        let env = config.env.unwrap();
        assert!(env.contains(&"PER_TEST_TIMEOUT=3".to_string()));
        assert!(env.contains(&"PROGRAM_USER=2000:2000".to_string()));
        assert!(env.contains(&format!("MAX_OUTPUT_BYTES={}", MAX_CAPTURED_BYTES)));
    }

    #[test]
    fn test_runner_gets_only_privilege_drop_capabilities() {
        let config = DockerEngine::container_config(Path::new("/jobs/job-abc"), &SandboxLimits::default()).unwrap();
        let host = config.host_config.unwrap();

        assert_eq!(config.user.as_deref(), Some("0:0"));
        assert_eq!(host.cap_drop.unwrap(), vec!["ALL".to_string()]);
        assert_eq!(
            host.cap_add.unwrap(),
            vec!["SETUID".to_string(), "SETGID".to_string(), "DAC_OVERRIDE".to_string()]
        );
    }
}
