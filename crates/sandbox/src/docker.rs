//! Docker engine for the container-isolated variant.

use async_trait::async_trait;
use bollard::container::{Config, CreateContainerOptions, RemoveContainerOptions, StopContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

use codebox_core::{BackendVariant, ContainerOptions, Error, Result, SessionId};

use crate::engine::{host_path, locate_runner, ExecResult, SandboxEngine, SandboxId, RUNNER_NAME};

/// Mount point of the shared volume inside the container.
pub const CONTAINER_ROOT: &str = "/codebox";

/// Subdirectories created in every shared volume.
pub const VOLUME_DIRS: [&str; 4] = ["bin", "state", "jobs", "work"];

/// Build the container configuration for one session.
///
/// The container keeps its own filesystem, network namespace and process
/// tree; the only host directory it sees is the shared volume.
pub fn container_config(
    options: &ContainerOptions,
    session: &SessionId,
    host_dir: &Path,
    user: Option<String>,
) -> Config<String> {
    let mut extra_hosts = Vec::new();
    if options.advertise_host.parse::<IpAddr>().is_err() {
        extra_hosts.push(format!("{}:host-gateway", options.advertise_host));
    }

    let host_config = HostConfig {
        memory: Some(options.memory_limit),
        cpu_quota: Some(options.cpu_quota),
        cpu_period: Some(100_000), // standard 100ms period
        network_mode: Some(options.network.clone()),
        extra_hosts: Some(extra_hosts),
        binds: Some(vec![format!("{}:{}:rw", host_dir.display(), CONTAINER_ROOT)]),
        tmpfs: Some(HashMap::from([("/tmp".to_string(), "rw,noexec,size=64m".to_string())])),
        readonly_rootfs: Some(true),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges:true".to_string()]),
        pids_limit: Some(options.pids_limit),
        ulimits: Some(vec![bollard::models::ResourcesUlimits {
            name: Some("nofile".to_string()),
            soft: Some(1024),
            hard: Some(2048),
        }]),
        ..Default::default()
    };

    Config {
        image: Some(options.image.clone()),
        working_dir: Some(format!("{}/work", CONTAINER_ROOT)),
        user,
        cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        host_config: Some(host_config),
        labels: Some(HashMap::from([
            ("managed-by".to_string(), "codebox".to_string()),
            ("codebox.session".to_string(), session.to_string()),
        ])),
        ..Default::default()
    }
}

/// Docker-based sandbox engine using the `bollard` crate.
///
/// Each sandbox is a long-lived container (`sleep infinity`) with a host
/// temporary directory bind-mounted at [`CONTAINER_ROOT`]. Files move
/// through that directory; blocks run as `docker exec` of the runner.
pub struct DockerEngine {
    docker: bollard::Docker,
    options: ContainerOptions,
    runner: PathBuf,
    volumes: Mutex<HashMap<SandboxId, TempDir>>,
}

impl DockerEngine {
    /// Connect to the local Docker daemon.
    pub fn connect(options: ContainerOptions) -> Result<Self> {
        let runner = locate_runner(options.runner_path.as_deref())?;
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            Error::backend_init(format!("Failed to connect to Docker daemon: {}. Is Docker running?", e))
        })?;
        Ok(Self {
            docker,
            options,
            runner,
            volumes: Mutex::new(HashMap::new()),
        })
    }

    async fn ensure_image(&self) -> Result<()> {
        if self.docker.inspect_image(&self.options.image).await.is_ok() {
            return Ok(());
        }
        tracing::info!(image = %self.options.image, "Pulling sandbox image");
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: self.options.image.as_str(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| Error::backend_init(format!("Failed to pull image '{}': {}", self.options.image, e)))?;
        Ok(())
    }

    fn volume(&self, id: &SandboxId) -> Result<PathBuf> {
        self.volumes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .map(|dir| dir.path().to_path_buf())
            .ok_or_else(|| Error::execution_fault(format!("sandbox {} has no shared volume", id)))
    }

    fn default_user(dir: &Path) -> Option<String> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            std::fs::metadata(dir)
                .ok()
                .map(|meta| format!("{}:{}", meta.uid(), meta.gid()))
        }
        #[cfg(not(unix))]
        {
            let _ = dir;
            None
        }
    }
}

#[async_trait]
impl SandboxEngine for DockerEngine {
    fn variant(&self) -> BackendVariant {
        BackendVariant::Container
    }

    fn root(&self) -> &str {
        CONTAINER_ROOT
    }

    async fn create(&self, session: &SessionId) -> Result<SandboxId> {
        self.ensure_image().await?;

        let volume = tempfile::Builder::new()
            .prefix("codebox-vol-")
            .tempdir()
            .map_err(|e| Error::backend_init(format!("Failed to create shared volume: {}", e)))?;
        for dir in VOLUME_DIRS {
            std::fs::create_dir_all(volume.path().join(dir))?;
        }

        let name = format!("codebox-{}", uuid::Uuid::new_v4());
        let user = self
            .options
            .user
            .clone()
            .or_else(|| Self::default_user(volume.path()));
        let config = container_config(&self.options, session, volume.path(), user);

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| Error::backend_init(format!("Failed to create sandbox container: {}", e)))?;

        // Start the container
        if let Err(e) = self.docker.start_container::<String>(&name, None).await {
            let _ = self
                .docker
                .remove_container(
                    &name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(Error::backend_init(format!("Failed to start sandbox container: {}", e)));
        }

        tracing::info!(sandbox_id = %name, image = %self.options.image, session_id = %session, "Sandbox container created and started");

        let id = SandboxId(name);
        self.volumes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.clone(), volume);
        Ok(id)
    }

    async fn install_runner(&self, id: &SandboxId) -> Result<String> {
        let target = self.volume(id)?.join("bin").join(RUNNER_NAME);
        tokio::fs::copy(&self.runner, &target)
            .await
            .map_err(|e| Error::backend_init(format!("Failed to install runner: {}", e)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755)).await?;
        }
        Ok(self.sandbox_path(&format!("bin/{}", RUNNER_NAME)))
    }

    async fn exec(&self, id: &SandboxId, command: &[String], timeout: Duration) -> Result<ExecResult> {
        let exec_options = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(format!("{}/work", CONTAINER_ROOT)),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&id.0, exec_options)
            .await
            .map_err(|e| Error::execution_fault(format!("Failed to create exec in sandbox: {}", e)))?;

        let start_result = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::execution_fault(format!("Failed to start exec in sandbox: {}", e)))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = start_result {
            let collect_future = async {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            stderr.push_str(&format!("\n[sandbox error: {}]", e));
                            break;
                        }
                    }
                }
            };

            if tokio::time::timeout(timeout, collect_future).await.is_err() {
                tracing::warn!(sandbox = %id, "Sandbox exec timed out");
                return Ok(ExecResult {
                    exit_code: -1,
                    stdout,
                    stderr: format!("{}\n[Execution timed out after {:?}]", stderr, timeout),
                    timed_out: true,
                });
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| Error::execution_fault(format!("Failed to inspect exec result: {}", e)))?;

        Ok(ExecResult {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
            timed_out: false,
        })
    }

    async fn write_file(&self, id: &SandboxId, path: &str, content: &[u8]) -> Result<()> {
        let target = host_path(&self.volume(id)?, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(())
    }

    async fn read_file(&self, id: &SandboxId, path: &str) -> Result<Vec<u8>> {
        let target = host_path(&self.volume(id)?, path)?;
        tokio::fs::read(&target)
            .await
            .map_err(|e| Error::execution_fault(format!("Failed to read '{}' from sandbox: {}", path, e)))
    }

    async fn interrupt(&self, id: &SandboxId, pid_file: &str) -> Result<bool> {
        let script = format!("kill -9 \"$(cat '{}')\"", pid_file);
        let command = vec!["sh".to_string(), "-c".to_string(), script];
        let result = self.exec(id, &command, Duration::from_secs(5)).await?;
        if !result.success() {
            tracing::warn!(sandbox = %id, stderr = %result.stderr, "Failed to kill runner");
        }
        Ok(result.success())
    }

    async fn destroy(&self, id: &SandboxId) -> Result<()> {
        // Stop the container (with 5s grace period)
        let _ = self
            .docker
            .stop_container(&id.0, Some(StopContainerOptions { t: 5 }))
            .await;

        let removed = self
            .docker
            .remove_container(
                &id.0,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        self.volumes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);

        removed.map_err(|e| Error::internal(format!("Failed to remove sandbox container: {}", e)))?;
        tracing::info!(sandbox_id = %id, "Sandbox container destroyed");
        Ok(())
    }

    async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}
