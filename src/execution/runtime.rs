//! Container runtime abstraction.
//!
//! The primitives a [`ContainerSession`](super::ContainerSession) needs from
//! the underlying engine. [`DockerClient`](super::DockerClient) implements it
//! against the Docker Engine API; tests substitute an in-memory runtime.

use async_trait::async_trait;

use crate::error::DockerError;
use crate::execution::docker_client::{ContainerConfig, ExecResult};

/// Lifecycle and exec primitives of a container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Checks if an image exists locally.
    async fn image_exists(&self, image: &str) -> bool;

    /// Pulls an image from its registry.
    async fn pull_image(&self, image: &str) -> Result<(), DockerError>;

    /// Creates a container and returns its ID.
    async fn create_container(&self, config: ContainerConfig) -> Result<String, DockerError>;

    /// Starts a created container.
    async fn start_container(&self, id: &str) -> Result<(), DockerError>;

    /// Runs a command inside a running container and waits for it to exit.
    ///
    /// A nonzero exit status is returned in [`ExecResult::exit_code`], not as
    /// an error.
    async fn exec_command(
        &self,
        id: &str,
        cmd: &[&str],
        working_dir: Option<&str>,
    ) -> Result<ExecResult, DockerError>;

    /// Stops a running container.
    async fn stop_container(&self, id: &str) -> Result<(), DockerError>;

    /// Removes a container.
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError>;
}
