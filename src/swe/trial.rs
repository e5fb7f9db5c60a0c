//! One trial: a single task instance driven from a clean container to a verdict.
//!
//! Phases run strictly in order:
//!
//! ```text
//! start → apply test patch → commit baseline → pre-test → agent → diff → post-test → score
//! ```
//!
//! Failures become a [`TrialResult`]; they never propagate out of
//! [`Trial::run`]. The container is cleaned up exactly once on every path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::instance::{ImageSpec, TaskInstance};
use super::scoring::{Scorer, ScoringInput};
use super::validate_git_ref;
use crate::error::{DockerError, TrialError};
use crate::execution::{ContainerRuntime, ContainerSession, ExecResult, SessionOptions};

const TEST_PATCH_PATH: &str = "/swe/test.patch";
const PROMPT_PATH: &str = "/swe/problem_statement.md";
const CONDA_ACTIVATE: &str = "source /opt/miniconda3/bin/activate && conda activate testbed";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// How the agent is installed and invoked inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSpec {
    /// Host path of the agent executable; `None` if the image already has it.
    pub binary: Option<PathBuf>,
    /// Where the executable is installed inside the container.
    pub install_path: String,
    /// Command template. `{prompt_file}`, `{install_path}` and
    /// `{instance_id}` are substituted.
    pub command: String,
    /// Variables exported before the command runs.
    pub env: BTreeMap<String, String>,
    /// Host variables forwarded into the agent environment when set.
    pub pass_env: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for AgentSpec {
    fn default() -> Self {
        Self {
            binary: None,
            install_path: "/usr/local/bin/agent".to_string(),
            command: "{install_path} --prompt-file {prompt_file}".to_string(),
            env: BTreeMap::new(),
            pass_env: Vec::new(),
            timeout_secs: 3600,
        }
    }
}

/// Author identity of the baseline commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            name: "swe-bench-harness".to_string(),
            email: "harness@swe-bench.local".to_string(),
        }
    }
}

/// Settings shared by every trial of a benchmark run.
#[derive(Debug, Clone)]
pub struct TrialOptions {
    pub image: ImageSpec,
    pub workdir: String,
    pub scratch_mount: String,
    pub platform: String,
    /// Prepended to test and agent commands; `bash -c` does not read `.bashrc`.
    pub env_setup: String,
    pub agent: AgentSpec,
    pub test_timeout: Duration,
    pub git_identity: GitIdentity,
}

impl Default for TrialOptions {
    fn default() -> Self {
        Self {
            image: ImageSpec::default(),
            workdir: "/testbed".to_string(),
            scratch_mount: "/tmp".to_string(),
            platform: "linux/x86_64".to_string(),
            env_setup: CONDA_ACTIVATE.to_string(),
            agent: AgentSpec::default(),
            test_timeout: Duration::from_secs(1800),
            git_identity: GitIdentity::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Outcome of one trial. Written once to the result store, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub instance: TaskInstance,
    #[serde(default)]
    pub run_failed: bool,
    #[serde(default)]
    pub validation_failed: bool,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub patch: Option<String>,
    /// Agent misbehavior; does not count as a trial failure.
    #[serde(default)]
    pub agent_error: Option<String>,
    #[serde(default)]
    pub initial_ref: Option<String>,
    #[serde(default)]
    pub duration_secs: f64,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TrialResult {
    pub fn new(instance: TaskInstance) -> Self {
        Self {
            instance,
            run_failed: false,
            validation_failed: false,
            success: false,
            error: None,
            patch: None,
            agent_error: None,
            initial_ref: None,
            duration_secs: 0.0,
            completed_at: None,
        }
    }

    pub fn failed(&self) -> bool {
        self.run_failed || self.validation_failed || self.error.is_some()
    }
}

// ---------------------------------------------------------------------------
// Trial
// ---------------------------------------------------------------------------

pub struct Trial<'a> {
    runtime: Arc<dyn ContainerRuntime>,
    scorer: Arc<dyn Scorer>,
    instance: &'a TaskInstance,
    run_name: String,
    output_path: PathBuf,
    options: &'a TrialOptions,
}

impl<'a> Trial<'a> {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        scorer: Arc<dyn Scorer>,
        instance: &'a TaskInstance,
        run_name: impl Into<String>,
        output_path: impl Into<PathBuf>,
        options: &'a TrialOptions,
    ) -> Self {
        Self {
            runtime,
            scorer,
            instance,
            run_name: run_name.into(),
            output_path: output_path.into(),
            options,
        }
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            image: self.options.image.clone(),
            scratch_dir: self.output_path.join("container"),
            scratch_mount: self.options.scratch_mount.clone(),
            workdir: self.options.workdir.clone(),
            platform: self.options.platform.clone(),
        }
    }

    /// Runs every phase and returns the result. Never fails; errors are recorded.
    pub async fn run(&self) -> TrialResult {
        let started = Instant::now();
        let mut result = TrialResult::new(self.instance.clone());
        let mut session =
            ContainerSession::new(self.runtime.clone(), self.instance, self.session_options());

        info!(instance_id = %self.instance.instance_id, run_name = %self.run_name, "Starting trial");
        let outcome = self.execute(&mut session, &mut result).await;

        if let Err(e) = session.cleanup().await {
            tracing::error!(
                instance_id = %self.instance.instance_id,
                container = session.name().unwrap_or_default(),
                error = %e,
                "Failed to remove container"
            );
        }

        if let Err(e) = outcome {
            if e.is_validation() {
                result.validation_failed = true;
            } else {
                result.run_failed = true;
            }
            result.error = Some(e.to_string());
            warn!(
                instance_id = %self.instance.instance_id,
                run_name = %self.run_name,
                error = %e,
                "Trial failed"
            );
        }

        result.duration_secs = started.elapsed().as_secs_f64();
        result.completed_at = Some(Utc::now());
        result
    }

    async fn execute(
        &self,
        session: &mut ContainerSession,
        result: &mut TrialResult,
    ) -> Result<(), TrialError> {
        let id = &self.instance.instance_id;

        // 1. Environment
        session.start(&self.run_name).await?;

        // 2. Test patch
        info!(instance_id = %id, phase = "patch", "Applying test patch");
        self.apply_test_patch(session).await?;

        // 3. Baseline
        let initial_ref = self.establish_initial_git_ref(session).await?;
        info!(instance_id = %id, phase = "baseline", initial_ref = %initial_ref, "Baseline committed");
        result.initial_ref = Some(initial_ref.clone());

        // 4. Pre-agent tests
        info!(instance_id = %id, phase = "pre_test", "Running tests before agent");
        let pre = self.run_tests(session).await?;
        self.write_artifact("pre_patch_test_results.txt", &pre.output)
            .await?;

        // 5. Agent
        info!(instance_id = %id, phase = "agent", "Running agent");
        match self.run_agent(session).await {
            Ok(out) => {
                self.write_artifact("agent_output.txt", &out.output).await?;
                if !out.success() {
                    let msg = format!("agent exited with code {}", out.exit_code);
                    warn!(instance_id = %id, exit_code = out.exit_code, "Agent exited with error");
                    result.agent_error = Some(msg);
                }
            }
            Err(e) => {
                warn!(instance_id = %id, error = %e, "Agent phase failed, continuing");
                result.agent_error = Some(e.to_string());
            }
        }

        // 6. Candidate patch
        let patch = self.capture_diff(session, &initial_ref).await?;
        info!(instance_id = %id, phase = "diff", bytes = patch.len(), "Captured candidate patch");
        result.patch = Some(patch.clone());

        // 7. Post-agent tests
        info!(instance_id = %id, phase = "post_test", "Running tests after agent");
        let post = self.run_tests(session).await?;
        self.write_artifact("test_results.txt", &post.output).await?;
        self.write_artifact("patch.diff", &patch).await?;

        // 8. Score
        let report = self
            .scorer
            .score(&ScoringInput {
                instance_id: id,
                fail_to_pass: &self.instance.fail_to_pass,
                pass_to_pass: &self.instance.pass_to_pass,
                model_patch: Some(patch.as_str()),
                test_output: &post.output,
            })
            .await?;
        let mut keyed = BTreeMap::new();
        keyed.insert(id.clone(), &report);
        self.write_artifact("report.json", &serde_json::to_string_pretty(&keyed)?)
            .await?;

        result.success = report.resolved;
        info!(instance_id = %id, phase = "scored", resolved = report.resolved, "Trial complete");
        Ok(())
    }

    async fn apply_test_patch(&self, session: &ContainerSession) -> Result<(), TrialError> {
        if self.instance.test_patch.trim().is_empty() {
            warn!(instance_id = %self.instance.instance_id, "Instance has no test patch");
            return Ok(());
        }
        session
            .write_file(&self.instance.test_patch, TEST_PATCH_PATH)
            .await?;

        let applied = session
            .exec(&format!("git apply -v {TEST_PATCH_PATH}"))
            .await?;
        if applied.success() {
            return Ok(());
        }
        tracing::debug!(output = %truncate(&applied.output, 2000), "git apply failed, trying patch");

        let fallback = session
            .exec(&format!("patch --batch --fuzz=5 -p1 -i {TEST_PATCH_PATH}"))
            .await?;
        if fallback.success() {
            return Ok(());
        }
        warn!(
            instance_id = %self.instance.instance_id,
            output = %truncate(&fallback.output, 2000),
            "Test patch does not apply"
        );
        Err(TrialError::PatchFailed)
    }

    /// Commits the working tree (untracked files included) under the harness
    /// identity and returns the resulting commit hash.
    async fn establish_initial_git_ref(
        &self,
        session: &ContainerSession,
    ) -> Result<String, TrialError> {
        let identity = &self.options.git_identity;
        let steps = [
            format!("git config user.name {}", shell_quote(&identity.name)),
            format!("git config user.email {}", shell_quote(&identity.email)),
            "git add -A && git commit --allow-empty --no-verify -q -m 'swe-bench-harness baseline'"
                .to_string(),
        ];
        for step in &steps {
            let out = session.exec(step).await?;
            if !out.success() {
                return Err(TrialError::GitRef(format!(
                    "`{step}` exited with {}: {}",
                    out.exit_code,
                    truncate(out.output.trim(), 500)
                )));
            }
        }

        let out = session.exec("git rev-parse HEAD").await?;
        let hash = out.output.trim().to_string();
        if !out.success() {
            return Err(TrialError::GitRef(format!(
                "rev-parse exited with {}: {}",
                out.exit_code,
                truncate(&hash, 500)
            )));
        }
        validate_git_ref(&hash).map_err(TrialError::GitRef)?;
        Ok(hash)
    }

    async fn run_tests(&self, session: &ContainerSession) -> Result<ExecResult, TrialError> {
        let command = self.with_env_setup(&self.instance.test_command());
        let out = session
            .exec_with_timeout(&command, self.options.test_timeout)
            .await?;
        tracing::debug!(
            instance_id = %self.instance.instance_id,
            exit_code = out.exit_code,
            "Test command finished"
        );
        Ok(out)
    }

    async fn run_agent(&self, session: &ContainerSession) -> Result<ExecResult, DockerError> {
        let agent = &self.options.agent;
        if let Some(binary) = &agent.binary {
            session
                .copy_file(binary, &agent.install_path, true)
                .await?;
        }
        session
            .write_file(&self.instance.problem_statement, PROMPT_PATH)
            .await?;

        let command = self.agent_command();
        session
            .exec_with_timeout(&command, Duration::from_secs(agent.timeout_secs))
            .await
    }

    fn agent_command(&self) -> String {
        let agent = &self.options.agent;
        let mut env: BTreeMap<&str, String> = agent
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        for name in &agent.pass_env {
            if let Ok(value) = std::env::var(name) {
                env.insert(name.as_str(), value);
            }
        }

        let mut command = String::new();
        let setup = self.options.env_setup.trim();
        if !setup.is_empty() {
            command.push_str(&format!("{setup} && "));
        }
        for (key, value) in env {
            if !is_env_name(key) {
                warn!(name = key, "Skipping invalid agent environment variable name");
                continue;
            }
            command.push_str(&format!("export {key}={}; ", shell_quote(&value)));
        }
        command.push_str(
            &agent
                .command
                .replace("{prompt_file}", PROMPT_PATH)
                .replace("{install_path}", &agent.install_path)
                .replace("{instance_id}", &self.instance.instance_id),
        );
        command.push_str(" 2>&1");
        command
    }

    fn with_env_setup(&self, command: &str) -> String {
        let setup = self.options.env_setup.trim();
        if setup.is_empty() {
            command.to_string()
        } else {
            format!("{setup} && {command}")
        }
    }

    async fn capture_diff(
        &self,
        session: &ContainerSession,
        initial_ref: &str,
    ) -> Result<String, TrialError> {
        let out = session
            .exec(&format!(
                "git add -A >/dev/null 2>&1 && git diff --cached --no-color {initial_ref}"
            ))
            .await?;
        if !out.success() {
            return Err(TrialError::Diff(format!(
                "exit {}: {}",
                out.exit_code,
                truncate(out.output.trim(), 500)
            )));
        }
        Ok(out.output)
    }

    async fn write_artifact(&self, suffix: &str, content: &str) -> Result<PathBuf, TrialError> {
        let dir = self.output_path.join("logs");
        tokio::fs::create_dir_all(&dir).await?;
        let path = artifact_path(&dir, &self.run_name, suffix);
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }
}

fn artifact_path(dir: &Path, run_name: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{run_name}-{suffix}"))
}

fn is_env_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}... [truncated]", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ContainerConfig;
    use async_trait::async_trait;

    struct UnreachableRuntime;

    #[async_trait]
    impl ContainerRuntime for UnreachableRuntime {
        async fn image_exists(&self, _image: &str) -> bool {
            false
        }
        async fn pull_image(&self, _image: &str) -> Result<(), DockerError> {
            Err(DockerError::DaemonUnavailable("offline".into()))
        }
        async fn create_container(&self, _config: ContainerConfig) -> Result<String, DockerError> {
            Err(DockerError::DaemonUnavailable("offline".into()))
        }
        async fn start_container(&self, _id: &str) -> Result<(), DockerError> {
            Err(DockerError::DaemonUnavailable("offline".into()))
        }
        async fn exec_command(
            &self,
            _id: &str,
            _cmd: &[&str],
            _working_dir: Option<&str>,
        ) -> Result<ExecResult, DockerError> {
            Err(DockerError::DaemonUnavailable("offline".into()))
        }
        async fn stop_container(&self, _id: &str) -> Result<(), DockerError> {
            Ok(())
        }
        async fn remove_container(&self, _id: &str, _force: bool) -> Result<(), DockerError> {
            Ok(())
        }
    }

    fn trial_parts() -> (Arc<dyn ContainerRuntime>, Arc<dyn Scorer>) {
        (
            Arc::new(UnreachableRuntime),
            Arc::new(crate::swe::TestLogScorer::new(Default::default()).unwrap()),
        )
    }

    fn instance() -> TaskInstance {
        TaskInstance::from_record(serde_json::json!({
            "repo": "psf/requests",
            "instance_id": "psf__requests-1142",
            "base_commit": "22623bd8c265b78b161542663ee980738441c307",
            "patch": "",
            "test_patch": "",
            "problem_statement": "requests.get is ALWAYS sending content length",
            "FAIL_TO_PASS": "[\"test_requests.py::RequestsTestCase::test_no_content_length\"]",
            "PASS_TO_PASS": []
        }))
        .unwrap()
    }

    #[test]
    fn test_failed_predicate() {
        let mut result = TrialResult::new(instance());
        assert!(!result.failed());

        result.agent_error = Some("agent exited with code 1".to_string());
        assert!(!result.failed());

        result.error = Some("boom".to_string());
        assert!(result.failed());

        let mut result = TrialResult::new(instance());
        result.validation_failed = true;
        assert!(result.failed());

        let mut result = TrialResult::new(instance());
        result.run_failed = true;
        assert!(result.failed());
    }

    #[test]
    fn test_result_loads_minimal_document() {
        let doc = serde_json::json!({
            "instance": serde_json::to_value(instance()).unwrap(),
            "run_failed": false,
            "validation_failed": true,
            "error": "Patch failed",
            "patch": null
        });
        let result: TrialResult = serde_json::from_value(doc).unwrap();
        assert!(result.validation_failed);
        assert!(!result.success);
        assert!(result.initial_ref.is_none());
        assert!(result.completed_at.is_none());
        assert_eq!(result.instance.fail_to_pass.len(), 1);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_is_env_name() {
        assert!(is_env_name("OPENAI_API_KEY"));
        assert!(is_env_name("_X1"));
        assert!(!is_env_name("1X"));
        assert!(!is_env_name("A-B"));
        assert!(!is_env_name(""));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("héllo", 2), "h... [truncated]");
    }

    #[test]
    fn test_agent_command_substitutes_template() {
        let mut options = TrialOptions::default();
        options.agent.command = "{install_path} run --task {prompt_file} --id {instance_id}".into();
        options
            .agent
            .env
            .insert("MODEL".to_string(), "gpt-4o".to_string());
        options
            .agent
            .env
            .insert("bad-name".to_string(), "x".to_string());

        let inst = instance();
        let (runtime, scorer) = trial_parts();
        let trial = Trial::new(runtime, scorer, &inst, "bench-psf__requests-1142", "/out", &options);

        assert_eq!(
            trial.agent_command(),
            "source /opt/miniconda3/bin/activate && conda activate testbed && \
             export MODEL='gpt-4o'; /usr/local/bin/agent run --task /swe/problem_statement.md --id psf__requests-1142 2>&1"
        );
    }

    #[test]
    fn test_empty_env_setup_runs_commands_bare() {
        let mut options = TrialOptions::default();
        options.env_setup = "  ".to_string();
        let inst = instance();
        let (runtime, scorer) = trial_parts();
        let trial = Trial::new(runtime, scorer, &inst, "bench-psf__requests-1142", "/out", &options);

        assert_eq!(trial.with_env_setup("pytest -rA"), "pytest -rA");
        assert!(trial.agent_command().starts_with("/usr/local/bin/agent "));
    }

    #[tokio::test]
    async fn test_unavailable_image_is_run_failure() {
        let dir = tempfile::tempdir().unwrap();
        let inst = instance();
        let options = TrialOptions::default();
        let (runtime, scorer) = trial_parts();
        let trial = Trial::new(runtime, scorer, &inst, "bench-psf__requests-1142", dir.path(), &options);

        let result = trial.run().await;
        assert!(result.run_failed);
        assert!(!result.validation_failed);
        assert!(result.error.unwrap().contains("unavailable"));
        assert!(result.patch.is_none());
        assert!(result.completed_at.is_some());
    }

    #[test]
    fn test_artifact_path_under_logs() {
        let path = artifact_path(Path::new("/out/bench/logs"), "bench-x", "patch.diff");
        assert_eq!(path, PathBuf::from("/out/bench/logs/bench-x-patch.diff"));
    }
}
