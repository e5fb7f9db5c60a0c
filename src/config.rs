//! Benchmark configuration.
//!
//! Loaded from YAML; every field has a default so an empty file is valid.
//! CLI flags override individual values after loading.
//!
//! ```yaml
//! benchmark_name: swe-bench-myagent-0.3
//! output_dir: ./results
//! image:
//!   namespace: swebench
//!   tag: latest
//! agent:
//!   binary: ./target/release/myagent
//!   command: "{install_path} --task {prompt_file}"
//!   pass_env: [OPENAI_API_KEY]
//!   timeout_secs: 1800
//! scoring:
//!   log_format: auto
//! env_setup: "source /opt/miniconda3/bin/activate && conda activate testbed"
//! per_repo_limit: 2
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::swe::{AgentSpec, GitIdentity, ImageSpec, LogFormat, ScoringBackend, TrialOptions};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub benchmark_name: String,
    pub output_dir: PathBuf,
    pub image: ImageSpec,
    pub agent: AgentSpec,
    pub test_timeout_secs: u64,
    pub scoring: ScoringConfig,
    pub workdir: String,
    pub scratch_mount: String,
    pub platform: String,
    /// Shell prefix that activates the test environment; empty disables it.
    pub env_setup: String,
    pub git_identity: GitIdentity,
    /// Keep only the first N instances (by id) of each repository.
    pub per_repo_limit: Option<usize>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        let trial = TrialOptions::default();
        Self {
            benchmark_name: "swe-bench".to_string(),
            output_dir: PathBuf::from("results"),
            image: trial.image,
            agent: trial.agent,
            test_timeout_secs: trial.test_timeout.as_secs(),
            scoring: ScoringConfig::default(),
            workdir: trial.workdir,
            scratch_mount: trial.scratch_mount,
            platform: trial.platform,
            env_setup: trial.env_setup,
            git_identity: trial.git_identity,
            per_repo_limit: None,
        }
    }
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not to an empty mapping.
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.benchmark_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "benchmark_name".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.benchmark_name.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "benchmark_name".to_string(),
                reason: "must not contain '/'".to_string(),
            });
        }
        for (field, path) in [
            ("workdir", &self.workdir),
            ("scratch_mount", &self.scratch_mount),
            ("agent.install_path", &self.agent.install_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: format!("'{path}' is not an absolute path"),
                });
            }
        }
        if self.test_timeout_secs == 0 || self.agent.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "timeout".to_string(),
                reason: "timeouts must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn trial_options(&self) -> TrialOptions {
        TrialOptions {
            image: self.image.clone(),
            workdir: self.workdir.clone(),
            scratch_mount: self.scratch_mount.clone(),
            platform: self.platform.clone(),
            env_setup: self.env_setup.clone(),
            agent: self.agent.clone(),
            test_timeout: Duration::from_secs(self.test_timeout_secs),
            git_identity: self.git_identity.clone(),
        }
    }

    pub fn scoring_backend(&self) -> ScoringBackend {
        ScoringBackend::TestLog(self.scoring.log_format)
    }
}
