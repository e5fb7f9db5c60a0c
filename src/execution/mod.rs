//! Container execution layer for benchmark trials.
//!
//! The [`ContainerRuntime`] trait abstracts the engine; [`DockerClient`]
//! implements it with the bollard crate. A [`ContainerSession`] owns one
//! container for the duration of one trial.
//!
//! # Lifecycle
//!
//! ```text
//! PENDING → CREATED → RUNNING → REMOVED
//!        ↘ FAILED ─────────────↗
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use swe_bench_harness::execution::{ContainerSession, DockerClient, SessionOptions};
//!
//! let runtime = Arc::new(DockerClient::new()?);
//! let mut session = ContainerSession::new(runtime, &instance, SessionOptions::new("out/container"));
//! session.start("bench-psf__requests-1142").await?;
//! let result = session.exec("git status").await?;
//! session.cleanup().await?;
//! ```

pub mod container;
pub mod docker_client;
pub mod runtime;

pub use container::{ContainerSession, SessionOptions, SessionStatus};
pub use docker_client::{ContainerConfig, DockerClient, ExecResult};
pub use runtime::ContainerRuntime;
