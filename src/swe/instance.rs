//! SWE-bench task instances.
//!
//! [`TaskInstance::from_record`] is the one place where dataset rows are
//! normalized; everything downstream sees the canonical shape.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::DatasetError;

/// How instance images are named in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSpec {
    /// Registry namespace (`None` for locally built images).
    pub namespace: Option<String>,
    /// Image architecture component.
    pub arch: String,
    /// Image tag.
    pub tag: String,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            namespace: Some("swebench".to_string()),
            arch: "x86_64".to_string(),
            tag: "latest".to_string(),
        }
    }
}

/// One benchmark unit: a repository state, a problem, and the expected test deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInstance {
    /// GitHub repository in `owner/repo` form.
    pub repo: String,
    /// Unique instance identifier (e.g. `psf__requests-1142`).
    pub instance_id: String,
    /// Commit the environment is checked out at.
    pub base_commit: String,
    /// Reference (gold) patch.
    pub patch: String,
    /// Patch adding the held-out tests.
    pub test_patch: String,
    /// Issue text handed to the agent.
    pub problem_statement: String,
    #[serde(default)]
    pub hints_text: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub version: String,
    /// Tests expected to flip from failing to passing.
    #[serde(
        rename = "FAIL_TO_PASS",
        alias = "fail_to_pass",
        default,
        deserialize_with = "deserialize_test_list"
    )]
    pub fail_to_pass: Vec<String>,
    /// Tests expected to keep passing.
    #[serde(
        rename = "PASS_TO_PASS",
        alias = "pass_to_pass",
        default,
        deserialize_with = "deserialize_test_list"
    )]
    pub pass_to_pass: Vec<String>,
    #[serde(default)]
    pub environment_setup_commit: String,
    /// Explicit test command; falls back to a per-repo default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_cmd: Option<String>,
}

/// Test lists arrive either as arrays or as JSON-encoded strings of arrays.
fn deserialize_test_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TestList {
        List(Vec<String>),
        Encoded(String),
    }

    match TestList::deserialize(deserializer)? {
        TestList::List(ids) => Ok(ids),
        TestList::Encoded(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(Vec::new());
            }
            serde_json::from_str(trimmed).map_err(serde::de::Error::custom)
        }
    }
}

impl TaskInstance {
    /// Normalizes one dataset record into a task instance.
    pub fn from_record(record: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(record)
    }

    /// Image reference for this instance, following the SWE-bench naming scheme.
    pub fn image_key(&self, spec: &ImageSpec) -> String {
        let key = format!(
            "sweb.eval.{}.{}:{}",
            spec.arch,
            self.instance_id.to_lowercase(),
            spec.tag
        );
        match &spec.namespace {
            Some(ns) if !ns.is_empty() => format!("{ns}/{key}").replace("__", "_1776_"),
            _ => key,
        }
    }

    /// Container name for one trial of this instance.
    ///
    /// Characters Docker rejects in names are replaced with `-`.
    pub fn container_name(&self, run_id: &str) -> String {
        format!("sweb.eval.{}.{}", self.instance_id, run_id)
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '.' | '-' => c,
                _ => '-',
            })
            .collect()
    }

    /// Test files touched by the test patch, in first-seen order.
    ///
    /// Fixtures and data files are skipped; test runners reject them as arguments.
    pub fn test_directives(&self) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        for line in self.test_patch.lines() {
            let Some(rest) = line.strip_prefix("diff --git a/") else {
                continue;
            };
            let Some((_, path)) = rest.rsplit_once(" b/") else {
                continue;
            };
            if is_non_test_file(path) {
                continue;
            }
            let directive = if self.repo == "django/django" {
                django_test_label(path)
            } else {
                path.to_string()
            };
            if !files.contains(&directive) {
                files.push(directive);
            }
        }
        files
    }

    /// Shell command that runs this instance's tests.
    pub fn test_command(&self) -> String {
        let base = self
            .test_cmd
            .clone()
            .unwrap_or_else(|| default_test_cmd(&self.repo).to_string());
        let directives = self.test_directives();
        if directives.is_empty() {
            base
        } else {
            format!("{} {}", base, directives.join(" "))
        }
    }
}

const NON_TEST_EXTS: &[&str] = &[
    ".json", ".png", ".csv", ".txt", ".md", ".jpg", ".jpeg", ".pkl", ".yml", ".yaml", ".toml",
];

fn is_non_test_file(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    NON_TEST_EXTS.iter().any(|ext| lower.ends_with(ext))
}

/// Infer the test command for a repo when the dataset does not provide one.
fn default_test_cmd(repo: &str) -> &'static str {
    match repo {
        "django/django" => "./tests/runtests.py --verbosity 2 --settings=test_sqlite --parallel 1",
        "sympy/sympy" => "PYTHONWARNINGS='ignore::UserWarning,ignore::SyntaxWarning' bin/test -C --verbose",
        "sphinx-doc/sphinx" => "tox --current-env -epy39 -v --",
        _ => "pytest --no-header -rA --tb=no -p no:cacheprovider",
    }
}

/// `tests/foo/test_bar.py` -> `foo.test_bar`.
fn django_test_label(path: &str) -> String {
    let trimmed = path.strip_prefix("tests/").unwrap_or(path);
    trimmed
        .strip_suffix(".py")
        .unwrap_or(trimmed)
        .replace('/', ".")
}

/// Reads a JSONL dataset, normalizing every non-blank line.
pub fn load_dataset(path: &Path) -> Result<Vec<TaskInstance>, DatasetError> {
    let content = std::fs::read_to_string(path)?;
    let mut instances = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: serde_json::Value =
            serde_json::from_str(line).map_err(|e| DatasetError::InvalidRecord {
                line: idx + 1,
                reason: e.to_string(),
            })?;
        let instance =
            TaskInstance::from_record(record).map_err(|e| DatasetError::InvalidRecord {
                line: idx + 1,
                reason: e.to_string(),
            })?;
        instances.push(instance);
    }
    Ok(instances)
}

/// Picks the instances to evaluate.
///
/// With `instance_id`, exactly that instance. Otherwise instances are sorted
/// by id and, if `per_repo_limit` is set, the first N of each repository are
/// kept.
pub fn select_instances(
    mut instances: Vec<TaskInstance>,
    instance_id: Option<&str>,
    per_repo_limit: Option<usize>,
) -> Result<Vec<TaskInstance>, DatasetError> {
    instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

    if let Some(id) = instance_id {
        return instances
            .into_iter()
            .find(|i| i.instance_id == id)
            .map(|i| vec![i])
            .ok_or_else(|| DatasetError::InstanceNotFound(id.to_string()));
    }

    let Some(limit) = per_repo_limit else {
        return Ok(instances);
    };

    let mut per_repo: HashMap<String, usize> = HashMap::new();
    Ok(instances
        .into_iter()
        .filter(|i| {
            let seen = per_repo.entry(i.repo.clone()).or_insert(0);
            *seen += 1;
            *seen <= limit
        })
        .collect())
}
