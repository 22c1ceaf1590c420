// Docker sandbox backend using Bollard
//
// One container per (submission, test case): network disabled, CPU share and
// memory ceiling applied, working directory bind-mounted at /workspace.

use crate::engine::{LaunchSpec, ProcessExit, SandboxBackend, SandboxProcess};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use tracing::{debug, info, warn};

/// Mount point of the working directory inside the container
const SANDBOX_WORKDIR: &str = "/workspace";

/// Container cleanup guard - guarantees container removal on drop
/// This ensures containers are cleaned up even if judging panics or is cancelled
struct ContainerGuard {
    docker: Docker,
    container_id: Option<String>,
}

impl ContainerGuard {
    fn new(docker: Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id: Some(container_id),
        }
    }

    fn id(&self) -> &str {
        self.container_id.as_deref().unwrap_or_default()
    }

    /// Remove now and disarm the guard
    async fn remove(&mut self) -> Result<()> {
        if let Some(container_id) = self.container_id.take() {
            self.docker
                .remove_container(&container_id, Some(force_remove()))
                .await
                .with_context(|| format!("Failed to remove container {}", container_id))?;
        }
        Ok(())
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        // Best-effort cleanup - cannot be async in Drop
        let Some(container_id) = self.container_id.take() else {
            return;
        };
        let docker = self.docker.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = docker
                    .remove_container(&container_id, Some(force_remove()))
                    .await
                {
                    warn!(container_id = %container_id, error = %e, "Failed to cleanup container");
                }
            });
        } else {
            warn!(container_id = %container_id, "No runtime to cleanup container");
        }
    }
}

fn force_remove() -> RemoveContainerOptions {
    RemoveContainerOptions {
        force: true,
        ..Default::default()
    }
}

/// Docker-based sandbox backend
///
/// **Docker Execution Rules:**
/// 1. Pulls the language image if not present
/// 2. Creates the container with security constraints:
///    - Network disabled
///    - CPU share, memory ceiling (swap disabled), pids limit
///    - Only the working directory is mounted
/// 3. Runs the compile-and-run shell command
/// 4. Removes the container after every invocation
#[derive(Clone)]
pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    /// Verify the daemon answers before accepting work
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .context("Docker daemon did not answer ping")?;
        Ok(())
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling now");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.with_context(|| format!("Failed to pull Docker image '{}'", image))?;
        }

        info!(image = %image, "Image pulled successfully");
        Ok(())
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn SandboxProcess>> {
        self.ensure_image(&spec.image).await?;

        let memory_bytes = i64::from(spec.memory_limit_mb) * 1024 * 1024;
        let host_config = HostConfig {
            memory: Some(memory_bytes),
            // Equal to memory: no swap on top of the ceiling
            memory_swap: Some(memory_bytes),
            nano_cpus: Some((spec.cpu_limit * 1_000_000_000.0) as i64),
            pids_limit: Some(spec.pids_limit),
            network_mode: Some("none".to_string()),
            binds: Some(vec![format!(
                "{}:{}:rw",
                spec.workdir.display(),
                SANDBOX_WORKDIR
            )]),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), spec.command.clone()]),
            entrypoint: Some(vec![]),
            working_dir: Some(SANDBOX_WORKDIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .context("Failed to create Docker container")?;

        // Guard first: from here on the container is removed on every path
        let guard = ContainerGuard::new(self.docker.clone(), container.id);

        self.docker
            .start_container(guard.id(), None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        debug!(container_id = %guard.id(), "Container started");

        Ok(Box::new(DockerProcess {
            docker: self.docker.clone(),
            guard,
        }))
    }
}

struct DockerProcess {
    docker: Docker,
    guard: ContainerGuard,
}

impl DockerProcess {
    async fn collect_stderr(&self) -> String {
        let options = Some(LogsOptions::<String> {
            stdout: false,
            stderr: true,
            follow: false,
            ..Default::default()
        });

        let mut stderr = String::new();
        let mut logs = self.docker.logs(self.guard.id(), options);
        while let Some(output) = logs.next().await {
            match output {
                Ok(LogOutput::StdErr { message }) | Ok(LogOutput::Console { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Error reading container logs");
                    break;
                }
            }
        }
        stderr
    }
}

#[async_trait]
impl SandboxProcess for DockerProcess {
    async fn wait(&mut self) -> Result<ProcessExit> {
        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut wait_stream = self.docker.wait_container(self.guard.id(), Some(wait_options));
        let exit_code = match wait_stream.next().await {
            Some(Ok(response)) => response.status_code,
            // Bollard reports a nonzero exit status as an error
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(e).context("Failed to wait for container"),
            None => anyhow::bail!("No wait response from container"),
        };

        let inspect = self
            .docker
            .inspect_container(self.guard.id(), None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect container")?;
        let oom_killed = inspect
            .state
            .and_then(|state| state.oom_killed)
            .unwrap_or(false);

        let stderr = self.collect_stderr().await;
        debug!(exit_code, oom_killed, "Container exited");

        Ok(ProcessExit {
            exit_code,
            oom_killed,
            stderr,
        })
    }

    async fn kill(&mut self) -> Result<()> {
        self.docker
            .kill_container(self.guard.id(), None::<KillContainerOptions<String>>)
            .await
            .context("Failed to kill container")?;
        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        self.guard.remove().await
    }
}
