//! Scoring of captured test output.
//!
//! A [`Scorer`] receives the raw post-agent test log together with the
//! instance's expected test deltas and returns a SWE-bench shaped
//! [`ScoreReport`]. Grading is all-or-nothing: an instance is resolved only
//! when every FAIL_TO_PASS and every PASS_TO_PASS test passed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ScoringError;

/// Everything a scorer sees for one instance.
#[derive(Debug, Clone, Copy)]
pub struct ScoringInput<'a> {
    pub instance_id: &'a str,
    pub fail_to_pass: &'a [String],
    pub pass_to_pass: &'a [String],
    /// Candidate patch, `None` when no diff was captured.
    pub model_patch: Option<&'a str>,
    pub test_output: &'a str,
}

/// Pass/fail split for one expected test set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub success: Vec<String>,
    pub failure: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestsStatus {
    #[serde(rename = "FAIL_TO_PASS")]
    pub fail_to_pass: TestOutcome,
    #[serde(rename = "PASS_TO_PASS")]
    pub pass_to_pass: TestOutcome,
}

/// Per-instance verdict document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreReport {
    #[serde(rename = "patch_is_None")]
    pub patch_is_none: bool,
    pub patch_exists: bool,
    pub patch_successfully_applied: bool,
    pub resolved: bool,
    pub tests_status: TestsStatus,
}

/// Pass/fail classifier over raw test output.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, input: &ScoringInput<'_>) -> Result<ScoreReport, ScoringError>;
}

/// Test log dialect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Try every known dialect.
    #[default]
    Auto,
    /// `pytest -rA` summary lines and `-v` progress lines.
    Pytest,
    /// Django's `runtests.py --verbosity 2` lines.
    Django,
}

/// Status of a single test as read from the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
    Skipped,
    XFail,
}

impl TestStatus {
    fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "PASSED" | "ok" | "OK" => Some(TestStatus::Passed),
            "FAILED" | "FAIL" | "XPASS" => Some(TestStatus::Failed),
            "ERROR" => Some(TestStatus::Error),
            "SKIPPED" => Some(TestStatus::Skipped),
            "XFAIL" => Some(TestStatus::XFail),
            m if m.starts_with("skipped") => Some(TestStatus::Skipped),
            _ => None,
        }
    }

    /// Expected failures count as passing, as in SWE-bench grading.
    pub fn is_pass(self) -> bool {
        matches!(self, TestStatus::Passed | TestStatus::XFail)
    }
}

/// Scores by parsing per-test statuses out of the test log.
#[derive(Debug, Clone)]
pub struct TestLogScorer {
    format: LogFormat,
    pytest_summary: Regex,
    pytest_progress: Regex,
    django: Regex,
}

impl TestLogScorer {
    pub fn new(format: LogFormat) -> Result<Self, ScoringError> {
        Ok(Self {
            format,
            pytest_summary: Regex::new(
                r"^(PASSED|FAILED|ERROR|SKIPPED|XFAIL|XPASS)\s+(\S+)(?:\s+-\s.*)?$",
            )?,
            pytest_progress: Regex::new(
                r"^(\S+::\S+)\s+(PASSED|FAILED|ERROR|SKIPPED|XFAIL|XPASS)\b",
            )?,
            django: Regex::new(r"^(\w+ \([\w.]+\))(?:\s.*)?\s\.\.\.\s+(ok|OK|FAIL|ERROR|skipped.*)$")?,
        })
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    /// Extracts the status of every test the log mentions. Later lines win.
    pub fn parse_log(&self, log: &str) -> HashMap<String, TestStatus> {
        let mut statuses = HashMap::new();
        let pytest = matches!(self.format, LogFormat::Auto | LogFormat::Pytest);
        let django = matches!(self.format, LogFormat::Auto | LogFormat::Django);

        for line in log.lines().map(str::trim_end) {
            if pytest {
                if let Some(caps) = self.pytest_summary.captures(line) {
                    if let Some(status) = TestStatus::from_marker(&caps[1]) {
                        statuses.insert(caps[2].to_string(), status);
                    }
                    continue;
                }
                if let Some(caps) = self.pytest_progress.captures(line) {
                    if let Some(status) = TestStatus::from_marker(&caps[2]) {
                        statuses.insert(caps[1].to_string(), status);
                    }
                    continue;
                }
            }
            if django {
                if let Some(caps) = self.django.captures(line) {
                    if let Some(status) = TestStatus::from_marker(&caps[2]) {
                        statuses.insert(caps[1].to_string(), status);
                    }
                }
            }
        }
        statuses
    }
}

fn split_outcomes(expected: &[String], statuses: &HashMap<String, TestStatus>) -> TestOutcome {
    let mut outcome = TestOutcome::default();
    for test in expected {
        match statuses.get(test) {
            Some(status) if status.is_pass() => outcome.success.push(test.clone()),
            _ => outcome.failure.push(test.clone()),
        }
    }
    outcome
}

#[async_trait]
impl Scorer for TestLogScorer {
    async fn score(&self, input: &ScoringInput<'_>) -> Result<ScoreReport, ScoringError> {
        let statuses = self.parse_log(input.test_output);
        let tests_status = TestsStatus {
            fail_to_pass: split_outcomes(input.fail_to_pass, &statuses),
            pass_to_pass: split_outcomes(input.pass_to_pass, &statuses),
        };

        let nothing_checked = input.fail_to_pass.is_empty() && statuses.is_empty();
        let resolved = !nothing_checked
            && tests_status.fail_to_pass.failure.is_empty()
            && tests_status.pass_to_pass.failure.is_empty();

        let patch_exists = input.model_patch.is_some_and(|p| !p.trim().is_empty());
        tracing::debug!(
            instance_id = input.instance_id,
            parsed = statuses.len(),
            resolved,
            "Scored test log"
        );

        Ok(ScoreReport {
            patch_is_none: input.model_patch.is_none(),
            patch_exists,
            // The agent edits the checkout in place; there is no separate apply step.
            patch_successfully_applied: patch_exists,
            resolved,
            tests_status,
        })
    }
}

/// Scoring capability chosen once at startup and threaded to every trial.
#[derive(Clone)]
pub enum ScoringBackend {
    /// Built-in log parser.
    TestLog(LogFormat),
    /// Caller-supplied classifier.
    Custom(Arc<dyn Scorer>),
}

impl Default for ScoringBackend {
    fn default() -> Self {
        ScoringBackend::TestLog(LogFormat::Auto)
    }
}

impl std::fmt::Debug for ScoringBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScoringBackend::TestLog(format) => f.debug_tuple("TestLog").field(format).finish(),
            ScoringBackend::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl ScoringBackend {
    /// Builds the scorer this backend stands for.
    pub fn into_scorer(self) -> Result<Arc<dyn Scorer>, ScoringError> {
        match self {
            ScoringBackend::TestLog(format) => Ok(Arc::new(TestLogScorer::new(format)?)),
            ScoringBackend::Custom(scorer) => Ok(scorer),
        }
    }
}
