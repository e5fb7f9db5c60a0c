//! Benchmark run coordinator and its on-disk result store.
//!
//! Every finished trial is written to `{output_root}/{name}/{run_name}.json`
//! before the next one starts. On construction the directory is scanned and
//! every run-name found there is treated as done, which makes a killed run
//! resumable without re-executing anything.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use super::instance::TaskInstance;
use super::scoring::Scorer;
use super::trial::{Trial, TrialOptions, TrialResult};
use crate::error::BenchmarkError;
use crate::execution::ContainerRuntime;

/// The next instance without a stored result.
#[derive(Debug, Clone, Copy)]
pub struct PendingRun<'a> {
    pub instance: &'a TaskInstance,
    pub run_name: &'a str,
}

/// One line of `predictions.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub instance_id: String,
    pub model_name_or_path: String,
    pub model_patch: Option<String>,
    pub run_name: String,
}

/// Outcome counts over the stored results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkSummary {
    pub total: usize,
    pub completed: usize,
    pub resolved: usize,
    pub run_failed: usize,
    pub validation_failed: usize,
}

impl BenchmarkSummary {
    /// Counts `results` against `total` declared instances.
    pub fn from_results<'a>(
        total: usize,
        results: impl IntoIterator<Item = &'a TrialResult>,
    ) -> Self {
        let mut summary = Self {
            total,
            ..Default::default()
        };
        for result in results {
            summary.completed += 1;
            if result.success {
                summary.resolved += 1;
            }
            if result.run_failed {
                summary.run_failed += 1;
            }
            if result.validation_failed {
                summary.validation_failed += 1;
            }
        }
        summary
    }
}

impl std::fmt::Display for BenchmarkSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} completed, {} resolved, {} run failures, {} validation failures",
            self.completed, self.total, self.resolved, self.run_failed, self.validation_failed
        )
    }
}

pub struct Benchmark {
    name: String,
    instances: Vec<TaskInstance>,
    run_names: Vec<String>,
    output_path: PathBuf,
    results: BTreeMap<String, TrialResult>,
    runtime: Arc<dyn ContainerRuntime>,
    scorer: Arc<dyn Scorer>,
    options: TrialOptions,
}

impl Benchmark {
    /// Opens (or creates) the run directory `output_root/name` and loads every
    /// stored result.
    ///
    /// # Errors
    ///
    /// Fails with `BenchmarkError::CorruptResult` if any stored document does
    /// not parse; the run must not continue over a result it cannot read.
    pub async fn new(
        name: impl Into<String>,
        instances: Vec<TaskInstance>,
        output_root: impl AsRef<Path>,
        runtime: Arc<dyn ContainerRuntime>,
        scorer: Arc<dyn Scorer>,
        options: TrialOptions,
    ) -> Result<Self, BenchmarkError> {
        let name = name.into();
        let output_path = output_root.as_ref().join(&name);
        fs::create_dir_all(&output_path)
            .await
            .map_err(|source| BenchmarkError::OutputDir {
                path: output_path.clone(),
                source,
            })?;

        let results = match load_results(&output_path).await {
            Ok(results) => results,
            Err(e) => {
                error!(path = %output_path.display(), error = %e, "Cannot load stored results");
                return Err(e);
            }
        };
        let run_names = instances
            .iter()
            .map(|i| run_name_for(&name, i))
            .collect();

        info!(
            benchmark = %name,
            instances = instances.len(),
            stored = results.len(),
            "Benchmark opened"
        );

        Ok(Self {
            name,
            instances,
            run_names,
            output_path,
            results,
            runtime,
            scorer,
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn instances(&self) -> &[TaskInstance] {
        &self.instances
    }

    pub fn results(&self) -> &BTreeMap<String, TrialResult> {
        &self.results
    }

    /// The idempotency key of an instance within this run.
    pub fn run_name(&self, instance: &TaskInstance) -> String {
        run_name_for(&self.name, instance)
    }

    /// First instance, in declaration order, whose run-name has no stored result.
    pub fn next_pending(&self) -> Option<PendingRun<'_>> {
        self.instances
            .iter()
            .zip(&self.run_names)
            .find(|(_, run_name)| !self.results.contains_key(run_name.as_str()))
            .map(|(instance, run_name)| PendingRun { instance, run_name })
    }

    /// Records `result` and durably writes `{run_name}.json` before returning.
    ///
    /// The document is written to a temporary file, synced, then renamed into
    /// place, so a crash never leaves a partial `.json` behind. An existing
    /// document for the same run-name is replaced.
    pub async fn add_result(
        &mut self,
        run_name: &str,
        result: TrialResult,
    ) -> Result<(), BenchmarkError> {
        let json = serde_json::to_string_pretty(&result)?;
        let path = self.output_path.join(format!("{run_name}.json"));
        let tmp = self.output_path.join(format!("{run_name}.json.tmp"));

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        sync_dir(&self.output_path).await?;

        self.results.insert(run_name.to_string(), result);
        Ok(())
    }

    /// Runs a trial for the next pending instance and records it.
    ///
    /// Returns `Ok(None)` once every instance has a stored result.
    pub async fn run_next(&mut self) -> Result<Option<TrialResult>, BenchmarkError> {
        let Some(pending) = self.next_pending() else {
            return Ok(None);
        };
        let run_name = pending.run_name.to_string();

        let result = Trial::new(
            self.runtime.clone(),
            self.scorer.clone(),
            pending.instance,
            run_name.as_str(),
            &self.output_path,
            &self.options,
        )
        .run()
        .await;

        self.add_result(&run_name, result.clone()).await?;
        Ok(Some(result))
    }

    /// Calls [`run_next`](Self::run_next) until nothing is pending or `limit`
    /// trials have run. Returns the number of trials executed.
    pub async fn run_all(&mut self, limit: Option<usize>) -> Result<usize, BenchmarkError> {
        let mut executed = 0;
        while limit.map_or(true, |max| executed < max) {
            let Some(result) = self.run_next().await? else {
                break;
            };
            executed += 1;

            let id = &result.instance.instance_id;
            match &result.error {
                Some(err) => warn!(instance_id = %id, error = %err, "Done running trial"),
                None => info!(instance_id = %id, resolved = result.success, "Done running trial"),
            }
        }
        Ok(executed)
    }

    /// Submission lines for every non-failed result, in run-name order.
    pub fn predictions(&self) -> Vec<Prediction> {
        self.results
            .iter()
            .filter(|(_, result)| !result.failed())
            .map(|(run_name, result)| Prediction {
                instance_id: result.instance.instance_id.clone(),
                model_name_or_path: self.name.clone(),
                model_patch: result.patch.clone(),
                run_name: run_name.clone(),
            })
            .collect()
    }

    /// Writes [`predictions`](Self::predictions) as JSON lines.
    pub async fn write_predictions(&self, path: &Path) -> Result<usize, BenchmarkError> {
        let predictions = self.predictions();
        let mut out = String::new();
        for prediction in &predictions {
            out.push_str(&serde_json::to_string(prediction)?);
            out.push('\n');
        }
        fs::write(path, out).await?;
        Ok(predictions.len())
    }

    /// Writes every stored result as one JSON object keyed by run-name.
    pub async fn write_summary(&self, path: &Path) -> Result<(), BenchmarkError> {
        let json = serde_json::to_string_pretty(&self.results)?;
        fs::write(path, json).await?;
        Ok(())
    }

    /// Counts over the selected instances only; stored documents for other
    /// instances in the same directory are ignored.
    pub fn summary(&self) -> BenchmarkSummary {
        BenchmarkSummary::from_results(
            self.instances.len(),
            self.run_names
                .iter()
                .filter_map(|run_name| self.results.get(run_name)),
        )
    }
}

/// Flushes directory entries so a completed rename survives power loss.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn run_name_for(benchmark: &str, instance: &TaskInstance) -> String {
    format!("{}-{}", benchmark, instance.instance_id)
}

/// Reads every top-level `*.json` document in `output_path`, keyed by file stem.
pub async fn load_results(
    output_path: &Path,
) -> Result<BTreeMap<String, TrialResult>, BenchmarkError> {
    let mut results = BTreeMap::new();
    let mut entries = fs::read_dir(output_path).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let Some(run_name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let contents = fs::read_to_string(&path).await?;
        let result: TrialResult = serde_json::from_str(&contents)
            .map_err(|source| BenchmarkError::CorruptResult {
                path: path.clone(),
                source,
            })?;
        results.insert(run_name.to_string(), result);
    }

    Ok(results)
}
