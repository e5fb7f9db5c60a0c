//! Shared fixtures for integration tests: an in-memory container runtime and
//! task instance builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use swe_bench_harness::error::DockerError;
use swe_bench_harness::execution::{ContainerConfig, ContainerRuntime, ExecResult};
use swe_bench_harness::swe::{Scorer, TestLogScorer, TrialOptions};
use swe_bench_harness::TaskInstance;

pub const BASELINE_SHA: &str = "0123456789abcdef0123456789abcdef01234567";

struct Rule {
    container: Option<String>,
    command: String,
    output: String,
    exit_code: i64,
    delay: Option<Duration>,
}

#[derive(Default)]
struct State {
    next_id: usize,
    names: HashMap<String, String>,
    live: Vec<String>,
    created: usize,
    removed: usize,
    remove_calls: usize,
    vanish: Vec<(String, usize)>,
    commands: Vec<(String, String)>,
    rules: Vec<Rule>,
    broken_images: Vec<String>,
}

/// Container runtime that keeps everything in memory.
///
/// Exec calls answer from registered rules (latest registration wins); with
/// no matching rule a command succeeds with empty output, except
/// `git rev-parse HEAD`, which returns [`BASELINE_SHA`].
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake runtime lock poisoned")
    }

    /// Answers every command containing `command`.
    pub fn respond(&self, command: &str, output: &str, exit_code: i64) {
        self.push_rule(None, command, output, exit_code, None);
    }

    /// Answers commands containing `command` in containers whose name contains `container`.
    pub fn respond_in(&self, container: &str, command: &str, output: &str, exit_code: i64) {
        self.push_rule(Some(container), command, output, exit_code, None);
    }

    /// Answers after sleeping for `delay`.
    pub fn respond_slowly(&self, command: &str, delay: Duration) {
        self.push_rule(None, command, "", 0, Some(delay));
    }

    fn push_rule(
        &self,
        container: Option<&str>,
        command: &str,
        output: &str,
        exit_code: i64,
        delay: Option<Duration>,
    ) {
        self.state().rules.push(Rule {
            container: container.map(str::to_string),
            command: command.to_string(),
            output: output.to_string(),
            exit_code,
            delay,
        });
    }

    /// Makes every image whose reference contains `pattern` unpullable.
    pub fn break_image(&self, pattern: &str) {
        self.state().broken_images.push(pattern.to_string());
    }

    /// Makes the container disappear on the `occurrence`-th (1-based) exec of
    /// a command containing `command`; that exec fails with `ContainerNotFound`.
    pub fn vanish_on(&self, command: &str, occurrence: usize) {
        self.state().vanish.push((command.to_string(), occurrence));
    }

    /// Calls to `remove_container`, successful or not.
    pub fn remove_calls(&self) -> usize {
        self.state().remove_calls
    }

    pub fn live_containers(&self) -> usize {
        self.state().live.len()
    }

    pub fn created(&self) -> usize {
        self.state().created
    }

    pub fn removed(&self) -> usize {
        self.state().removed
    }

    /// Every exec'd command, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Commands exec'd in containers whose name contains `container`.
    pub fn commands_in(&self, container: &str) -> Vec<String> {
        self.state()
            .commands
            .iter()
            .filter(|(name, _)| name.contains(container))
            .map(|(_, c)| c.clone())
            .collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_exists(&self, image: &str) -> bool {
        !self.state().broken_images.iter().any(|p| image.contains(p))
    }

    async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        Err(DockerError::ImageUnavailable {
            image: image.to_string(),
            reason: "pull access denied".to_string(),
        })
    }

    async fn create_container(&self, config: ContainerConfig) -> Result<String, DockerError> {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.names.insert(id.clone(), config.name);
        state.live.push(id.clone());
        state.created += 1;
        Ok(id)
    }

    async fn start_container(&self, _id: &str) -> Result<(), DockerError> {
        Ok(())
    }

    async fn exec_command(
        &self,
        id: &str,
        cmd: &[&str],
        _working_dir: Option<&str>,
    ) -> Result<ExecResult, DockerError> {
        let command = cmd.last().copied().unwrap_or_default().to_string();
        let (result, delay) = {
            let mut state = self.state();
            let name = state.names.get(id).cloned().unwrap_or_default();
            if !state.live.iter().any(|live| live == id) {
                return Err(DockerError::ContainerNotFound { id: id.to_string() });
            }
            state.commands.push((name.clone(), command.clone()));

            let vanishes = state.vanish.iter().any(|(pattern, nth)| {
                command.contains(pattern.as_str())
                    && state
                        .commands
                        .iter()
                        .filter(|(n, c)| *n == name && c.contains(pattern.as_str()))
                        .count()
                        == *nth
            });
            if vanishes {
                state.live.retain(|live| live != id);
                return Err(DockerError::ContainerNotFound { id: id.to_string() });
            }

            let rule = state.rules.iter().rev().find(|rule| {
                command.contains(&rule.command)
                    && rule.container.as_ref().map_or(true, |c| name.contains(c))
            });
            match rule {
                Some(rule) => (ExecResult::new(rule.output.clone(), rule.exit_code), rule.delay),
                None if command == "git rev-parse HEAD" => {
                    (ExecResult::new(format!("{BASELINE_SHA}\n"), 0), None)
                }
                None => (ExecResult::new("", 0), None),
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(result)
    }

    async fn stop_container(&self, _id: &str) -> Result<(), DockerError> {
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<(), DockerError> {
        let mut state = self.state();
        state.remove_calls += 1;
        let before = state.live.len();
        state.live.retain(|live| live != id);
        if state.live.len() == before {
            return Err(DockerError::ContainerNotFound { id: id.to_string() });
        }
        state.removed += 1;
        Ok(())
    }
}

pub const TEST_PATCH: &str = "diff --git a/tests/test_requests.py b/tests/test_requests.py
--- a/tests/test_requests.py
+++ b/tests/test_requests.py
@@ -1,3 +1,6 @@
+def test_no_content_length():
+    assert True
";

pub fn instance(id: &str) -> TaskInstance {
    TaskInstance::from_record(serde_json::json!({
        "repo": "psf/requests",
        "instance_id": id,
        "base_commit": "22623bd8c265b78b161542663ee980738441c307",
        "patch": "",
        "test_patch": TEST_PATCH,
        "problem_statement": "requests.get is ALWAYS sending content length",
        "FAIL_TO_PASS": "[\"tests/test_requests.py::test_no_content_length\"]",
        "PASS_TO_PASS": "[]"
    }))
    .expect("valid instance record")
}

pub fn scorer() -> Arc<dyn Scorer> {
    Arc::new(TestLogScorer::new(Default::default()).expect("valid patterns"))
}

pub fn options() -> TrialOptions {
    TrialOptions::default()
}
