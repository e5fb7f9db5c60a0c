//! Container sessions: one disposable environment per trial.
//!
//! A session resolves the instance image, starts a long-lived container with
//! a host scratch directory bind-mounted into it, and exposes synchronous
//! (awaited) exec and file-injection primitives until [`ContainerSession::cleanup`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DockerError;
use crate::execution::docker_client::{ContainerConfig, ExecResult};
use crate::execution::runtime::ContainerRuntime;
use crate::swe::{validate_container_path, ImageSpec, TaskInstance};

/// Lifecycle status of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// `start` has not been called.
    Pending,
    /// Container exists but is not running yet.
    Created,
    /// Container is running and accepts exec calls.
    Running,
    /// Container was removed.
    Removed,
    /// Start failed with an error message.
    Failed(String),
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Created => write!(f, "created"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Removed => write!(f, "removed"),
            SessionStatus::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

/// Settings shared by every session of a benchmark run.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Image naming scheme.
    pub image: ImageSpec,
    /// Host directory mounted into the container.
    pub scratch_dir: PathBuf,
    /// Where `scratch_dir` appears inside the container.
    pub scratch_mount: String,
    /// Working directory for exec calls (the repository checkout).
    pub workdir: String,
    /// Platform requested at creation.
    pub platform: String,
}

impl SessionOptions {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            image: ImageSpec::default(),
            scratch_dir: scratch_dir.into(),
            scratch_mount: "/tmp".to_string(),
            workdir: "/testbed".to_string(),
            platform: "linux/x86_64".to_string(),
        }
    }
}

/// A handle to one isolated environment bound to one task instance.
pub struct ContainerSession {
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
    instance: TaskInstance,
    options: SessionOptions,
    id: Option<String>,
    name: Option<String>,
    status: SessionStatus,
}

impl ContainerSession {
    /// Creates a session for `instance`. Nothing touches the runtime until [`start`](Self::start).
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        instance: &TaskInstance,
        options: SessionOptions,
    ) -> Self {
        Self {
            runtime,
            image: instance.image_key(&options.image),
            instance: instance.clone(),
            options,
            id: None,
            name: None,
            status: SessionStatus::Pending,
        }
    }

    /// Resolves the image, then creates and starts the container.
    ///
    /// # Errors
    ///
    /// - `DockerError::ImageUnavailable` if the image is neither local nor pullable
    /// - `DockerError::EnvironmentStartFailed` if creation or start fails
    ///
    /// If creation succeeded but start failed the container ID is kept, so a
    /// later [`cleanup`](Self::cleanup) still removes it.
    pub async fn start(&mut self, run_id: &str) -> Result<(), DockerError> {
        if self.status != SessionStatus::Pending {
            return Err(DockerError::EnvironmentStartFailed {
                name: self.name.clone().unwrap_or_default(),
                reason: format!("cannot start session in {} state", self.status),
            });
        }

        if !self.runtime.image_exists(&self.image).await {
            tracing::info!(instance_id = %self.instance.instance_id, image = %self.image, "Pulling image");
            if let Err(e) = self.runtime.pull_image(&self.image).await {
                self.status = SessionStatus::Failed(e.to_string());
                return Err(match e {
                    e @ DockerError::ImageUnavailable { .. } => e,
                    other => DockerError::ImageUnavailable {
                        image: self.image.clone(),
                        reason: other.to_string(),
                    },
                });
            }
        }

        let name = self.instance.container_name(run_id);
        self.name = Some(name.clone());

        let scratch = self.prepare_scratch_dir().await.map_err(|e| {
            DockerError::EnvironmentStartFailed {
                name: name.clone(),
                reason: format!("scratch dir {:?}: {e}", self.options.scratch_dir),
            }
        })?;

        let config = ContainerConfig::new(&name, &self.image)
            .with_user("root")
            .with_platform(&self.options.platform)
            .with_cmd(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ])
            .with_working_dir(&self.options.workdir)
            .with_bind(scratch.to_string_lossy(), &self.options.scratch_mount);

        tracing::info!(instance_id = %self.instance.instance_id, container = %name, "Creating container");
        let id = match self.runtime.create_container(config).await {
            Ok(id) => id,
            Err(e) => {
                self.status = SessionStatus::Failed(e.to_string());
                return Err(as_start_failure(&name, e));
            }
        };
        self.id = Some(id.clone());
        self.status = SessionStatus::Created;

        if let Err(e) = self.runtime.start_container(&id).await {
            self.status = SessionStatus::Failed(e.to_string());
            return Err(as_start_failure(&name, e));
        }
        self.status = SessionStatus::Running;
        tracing::info!(instance_id = %self.instance.instance_id, container = %name, id = %id, "Container started");

        Ok(())
    }

    async fn prepare_scratch_dir(&self) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.options.scratch_dir).await?;
        tokio::fs::canonicalize(&self.options.scratch_dir).await
    }

    /// Runs `bash -c <command>` in the working directory.
    ///
    /// A nonzero exit is not an error; callers inspect `exit_code`.
    pub async fn exec(&self, command: &str) -> Result<ExecResult, DockerError> {
        let id = self.running_id()?;
        tracing::debug!(container = %id, command = command, "exec");
        self.runtime
            .exec_command(id, &["bash", "-c", command], Some(self.options.workdir.as_str()))
            .await
    }

    /// Like [`exec`](Self::exec), but gives up after `timeout`.
    ///
    /// The command keeps running inside the container after a timeout;
    /// cleanup tears it down with the container.
    pub async fn exec_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecResult, DockerError> {
        match tokio::time::timeout(timeout, self.exec(command)).await {
            Ok(result) => result,
            Err(_) => Err(DockerError::Timeout {
                seconds: timeout.as_secs(),
            }),
        }
    }

    /// Writes `content` to `target` inside the container.
    ///
    /// The content is staged in the host scratch directory and copied into
    /// place from the mount. Relative targets resolve against the working
    /// directory. The file is visible to later exec calls once this returns.
    pub async fn write_file(&self, content: &str, target: &str) -> Result<(), DockerError> {
        let (staged, target) = self.staging_paths(target)?;
        tokio::fs::write(&staged.host, content).await?;
        self.copy_into_place(&staged.mounted, &target, false).await
    }

    /// Copies a host file to `target` inside the container via the scratch mount.
    pub async fn copy_file(
        &self,
        host_path: &Path,
        target: &str,
        executable: bool,
    ) -> Result<(), DockerError> {
        let (staged, target) = self.staging_paths(target)?;
        tokio::fs::copy(host_path, &staged.host).await?;
        self.copy_into_place(&staged.mounted, &target, executable)
            .await
    }

    fn staging_paths(&self, target: &str) -> Result<(StagedFile, String), DockerError> {
        validate_container_path(target).map_err(DockerError::InvalidPath)?;
        let resolved = if target.starts_with('/') {
            target.to_string()
        } else {
            format!("{}/{}", self.options.workdir.trim_end_matches('/'), target)
        };
        let staged_name = format!(".staged-{}", resolved.trim_start_matches('/').replace('/', "__"));
        let staged = StagedFile {
            host: self.options.scratch_dir.join(&staged_name),
            mounted: format!(
                "{}/{}",
                self.options.scratch_mount.trim_end_matches('/'),
                staged_name
            ),
        };
        Ok((staged, resolved))
    }

    async fn copy_into_place(
        &self,
        mounted: &str,
        target: &str,
        executable: bool,
    ) -> Result<(), DockerError> {
        let mut cmd = format!("mkdir -p \"$(dirname '{target}')\" && cp '{mounted}' '{target}'");
        if executable {
            cmd.push_str(&format!(" && chmod +x '{target}'"));
        }
        let result = self.exec(&cmd).await?;
        if !result.success() {
            return Err(DockerError::CopyFailed(format!(
                "{target} (exit {}): {}",
                result.exit_code,
                result.output.trim()
            )));
        }
        Ok(())
    }

    /// Stops and removes the container.
    ///
    /// Safe to call at any point: a session that never created a container,
    /// or one already cleaned up, is a no-op.
    pub async fn cleanup(&mut self) -> Result<(), DockerError> {
        let Some(id) = self.id.take() else {
            if self.status == SessionStatus::Pending {
                self.status = SessionStatus::Removed;
            }
            return Ok(());
        };

        if self.status == SessionStatus::Running {
            if let Err(e) = self.runtime.stop_container(&id).await {
                tracing::warn!(container = %id, error = %e, "Failed to stop container gracefully");
            }
        }

        self.status = SessionStatus::Removed;
        match self.runtime.remove_container(&id, true).await {
            Ok(()) | Err(DockerError::ContainerNotFound { .. }) => {
                tracing::debug!(instance_id = %self.instance.instance_id, container = %id, "Container removed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn running_id(&self) -> Result<&str, DockerError> {
        match (&self.status, &self.id) {
            (SessionStatus::Running, Some(id)) => Ok(id),
            _ => Err(DockerError::NotRunning {
                status: self.status.to_string(),
            }),
        }
    }

    /// Returns the container ID, if one was created.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Returns the container name, once `start` has chosen one.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the resolved image reference.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Returns the current status.
    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Returns the in-container path of the scratch mount.
    pub fn scratch_mount(&self) -> &str {
        &self.options.scratch_mount
    }
}

struct StagedFile {
    host: PathBuf,
    mounted: String,
}

fn as_start_failure(name: &str, e: DockerError) -> DockerError {
    match e {
        e @ DockerError::EnvironmentStartFailed { .. } => e,
        other => DockerError::EnvironmentStartFailed {
            name: name.to_string(),
            reason: other.to_string(),
        },
    }
}
