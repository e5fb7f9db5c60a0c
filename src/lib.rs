//! swe-bench-harness: evaluate coding agents on SWE-bench style task instances.
//!
//! Each instance runs in its own Docker container through a fixed sequence of
//! phases (test patch, baseline commit, agent, diff capture, scoring). Results
//! are persisted per instance so an interrupted benchmark resumes where it
//! stopped.

pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod swe;

pub use config::BenchConfig;
pub use error::{BenchmarkError, ConfigError, DatasetError, DockerError, ScoringError, TrialError};
pub use execution::{ContainerRuntime, ContainerSession, DockerClient};
pub use swe::{Benchmark, TaskInstance, Trial, TrialResult};
