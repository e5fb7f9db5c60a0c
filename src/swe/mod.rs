//! SWE-bench trial engine.
//!
//! - [`TaskInstance`]: normalized benchmark unit
//! - [`Trial`]: drives one instance through patch, baseline, agent, diff, score
//! - [`Benchmark`]: sequences trials with a resumable on-disk result store
//! - [`scoring`]: turns raw test output into a resolved/unresolved verdict

pub mod benchmark;
pub mod instance;
pub mod scoring;
pub mod trial;

pub use benchmark::{load_results, Benchmark, BenchmarkSummary, PendingRun, Prediction};
pub use instance::{load_dataset, select_instances, ImageSpec, TaskInstance};
pub use scoring::{LogFormat, ScoreReport, Scorer, ScoringBackend, ScoringInput, TestLogScorer};
pub use trial::{AgentSpec, GitIdentity, Trial, TrialOptions, TrialResult};

/// Validate a git ref (commit SHA, branch name) before it is interpolated into a command.
///
/// Accepts hex-only SHAs (short or full) and standard git ref names
/// (alphanumeric, `/`, `.`, `-`, `_`). Rejects shell metacharacters,
/// `..` sequences, and refs starting with `-` (flag injection).
pub fn validate_git_ref(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("git ref is empty".to_string());
    }
    if s.len() > 256 {
        return Err(format!("git ref too long ({} chars, max 256)", s.len()));
    }
    if s.starts_with('-') {
        return Err(format!(
            "git ref '{s}' must not start with '-' (could be interpreted as a flag)"
        ));
    }
    if s.contains("..") {
        return Err(format!("git ref '{s}' must not contain '..'"));
    }
    if let Some(ch) = s
        .chars()
        .find(|ch| !matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '/' | '.' | '-' | '_' | '~' | '^'))
    {
        return Err(format!("invalid character '{ch}' in git ref '{s}'"));
    }
    Ok(())
}

/// Validate a path that will be quoted into a shell command inside the container.
///
/// Absolute and relative paths are both allowed; quotes, shell
/// metacharacters, control characters and `..` are not.
pub fn validate_container_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("path is empty".to_string());
    }
    if path.len() > 4096 {
        return Err(format!("path too long ({} chars, max 4096)", path.len()));
    }
    if path.split('/').any(|part| part == "..") {
        return Err(format!("path '{path}' contains '..'"));
    }
    if let Some(ch) = path.chars().find(|ch| {
        matches!(
            ch,
            '\'' | '"'
                | '`'
                | '$'
                | '!'
                | '&'
                | '|'
                | ';'
                | '('
                | ')'
                | '{'
                | '}'
                | '<'
                | '>'
                | '\\'
                | '\0'
                | '\n'
                | '\r'
        )
    }) {
        return Err(format!(
            "invalid character {ch:?} in path '{path}': shell metacharacters not allowed"
        ));
    }
    Ok(())
}
