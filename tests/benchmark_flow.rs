//! Benchmark coordinator behavior: resume, persistence and failure isolation.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{instance, options, scorer, FakeRuntime};
use swe_bench_harness::error::BenchmarkError;
use swe_bench_harness::execution::ContainerRuntime;
use swe_bench_harness::swe::{Benchmark, Prediction, TrialResult};
use swe_bench_harness::TaskInstance;

const NAME: &str = "swe-bench-test";

async fn open(
    fake: &Arc<FakeRuntime>,
    instances: Vec<TaskInstance>,
    root: &Path,
) -> Result<Benchmark, BenchmarkError> {
    let runtime: Arc<dyn ContainerRuntime> = fake.clone();
    Benchmark::new(NAME, instances, root, runtime, scorer(), options()).await
}

fn result_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.ends_with(".json"))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn run_next_twice_then_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeRuntime::new();
    let mut bench = open(
        &fake,
        vec![instance("psf__requests-1142"), instance("psf__requests-2317")],
        dir.path(),
    )
    .await
    .unwrap();

    let first = bench.run_next().await.unwrap().unwrap();
    assert_eq!(first.instance.instance_id, "psf__requests-1142");
    let second = bench.run_next().await.unwrap().unwrap();
    assert_eq!(second.instance.instance_id, "psf__requests-2317");
    assert!(bench.run_next().await.unwrap().is_none());

    assert_eq!(
        result_files(&dir.path().join(NAME)),
        vec![
            "swe-bench-test-psf__requests-1142.json".to_string(),
            "swe-bench-test-psf__requests-2317.json".to_string(),
        ]
    );
}

#[tokio::test]
async fn resume_never_reexecutes_stored_runs() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeRuntime::new();
    let instances = vec![
        instance("psf__requests-1142"),
        instance("psf__requests-2317"),
        instance("psf__requests-863"),
    ];

    let mut bench = open(&fake, instances.clone(), dir.path()).await.unwrap();
    assert_eq!(bench.run_all(Some(2)).await.unwrap(), 2);
    drop(bench);

    let mut resumed = open(&fake, instances.clone(), dir.path()).await.unwrap();
    assert_eq!(resumed.results().len(), 2);
    let pending = resumed.next_pending().unwrap();
    assert_eq!(pending.instance.instance_id, "psf__requests-863");
    assert_eq!(pending.run_name, "swe-bench-test-psf__requests-863");

    let created_before = fake.created();
    assert_eq!(resumed.run_all(None).await.unwrap(), 1);
    assert_eq!(fake.created(), created_before + 1);
    drop(resumed);

    let done = open(&fake, instances, dir.path()).await.unwrap();
    assert!(done.next_pending().is_none());
    assert_eq!(done.summary().completed, 3);
}

#[tokio::test]
async fn one_failure_does_not_stop_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeRuntime::new();
    fake.break_image("psf_1776_requests-1142");

    let mut bench = open(
        &fake,
        vec![instance("psf__requests-1142"), instance("psf__requests-2317")],
        dir.path(),
    )
    .await
    .unwrap();
    assert_eq!(bench.run_all(None).await.unwrap(), 2);

    let results = bench.results();
    let broken = &results["swe-bench-test-psf__requests-1142"];
    assert!(broken.run_failed);
    assert!(broken.error.as_ref().unwrap().contains("unavailable"));
    let ok = &results["swe-bench-test-psf__requests-2317"];
    assert!(!ok.failed());

    let summary = bench.summary();
    assert_eq!(summary.run_failed, 1);
    assert_eq!(summary.completed, 2);
}

#[tokio::test]
async fn every_container_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeRuntime::new();
    fake.respond_in("psf__requests-2317", "git apply", "error", 1);
    fake.respond_in("psf__requests-2317", "patch --batch", "error", 1);
    fake.respond_in("psf__requests-863", "git commit", "fatal", 128);
    fake.respond_in("psf__requests-1963", "git diff", "fatal: bad object", 128);
    fake.break_image("psf_1776_requests-1724");

    let ids = [
        "psf__requests-1142",
        "psf__requests-1724",
        "psf__requests-1963",
        "psf__requests-2317",
        "psf__requests-863",
    ];
    let mut bench = open(&fake, ids.iter().map(|id| instance(id)).collect(), dir.path())
        .await
        .unwrap();
    assert_eq!(bench.run_all(None).await.unwrap(), 5);

    assert_eq!(fake.live_containers(), 0);
    assert_eq!(fake.created(), 4);
    assert_eq!(fake.removed(), 4);

    let summary = bench.summary();
    assert_eq!(summary.validation_failed, 1);
    assert_eq!(summary.run_failed, 3);
}

#[tokio::test]
async fn corrupt_document_aborts_construction() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path().join(NAME);
    std::fs::create_dir_all(&run_dir).unwrap();
    std::fs::write(run_dir.join("swe-bench-test-psf__requests-1142.json"), "{\"instance\":").unwrap();

    let fake = FakeRuntime::new();
    let err = open(&fake, vec![instance("psf__requests-1142")], dir.path())
        .await
        .err()
        .expect("construction must fail");
    assert!(matches!(err, BenchmarkError::CorruptResult { .. }));
    assert_eq!(fake.created(), 0);
}

#[tokio::test]
async fn add_result_overwrites_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeRuntime::new();
    let inst = instance("psf__requests-1142");
    let mut bench = open(&fake, vec![inst.clone()], dir.path()).await.unwrap();
    let run_name = bench.run_name(&inst);

    let mut first = TrialResult::new(inst.clone());
    first.run_failed = true;
    bench.add_result(&run_name, first).await.unwrap();

    let mut second = TrialResult::new(inst);
    second.patch = Some("diff".to_string());
    bench.add_result(&run_name, second.clone()).await.unwrap();

    let run_dir = dir.path().join(NAME);
    assert_eq!(result_files(&run_dir), vec![format!("{run_name}.json")]);
    assert!(!run_dir.join(format!("{run_name}.json.tmp")).exists());

    let stored: TrialResult = serde_json::from_str(
        &std::fs::read_to_string(run_dir.join(format!("{run_name}.json"))).unwrap(),
    )
    .unwrap();
    assert_eq!(stored, second);
}

#[tokio::test]
async fn predictions_skip_failed_results() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeRuntime::new();
    fake.respond_in("psf__requests-1142", "git diff --cached", "diff --git a/x b/x\n", 0);
    fake.respond_in("psf__requests-2317", "git apply", "error", 1);
    fake.respond_in("psf__requests-2317", "patch --batch", "error", 1);

    let mut bench = open(
        &fake,
        vec![instance("psf__requests-1142"), instance("psf__requests-2317")],
        dir.path(),
    )
    .await
    .unwrap();
    bench.run_all(None).await.unwrap();

    assert_eq!(
        bench.predictions(),
        vec![Prediction {
            instance_id: "psf__requests-1142".to_string(),
            model_name_or_path: NAME.to_string(),
            model_patch: Some("diff --git a/x b/x\n".to_string()),
            run_name: "swe-bench-test-psf__requests-1142".to_string(),
        }]
    );

    let predictions_path = dir.path().join("predictions.jsonl");
    assert_eq!(bench.write_predictions(&predictions_path).await.unwrap(), 1);
    let lines: Vec<serde_json::Value> = std::fs::read_to_string(&predictions_path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["instance_id"], "psf__requests-1142");

    let summary_path = dir.path().join("swe_bench_results.json");
    bench.write_summary(&summary_path).await.unwrap();
    let all: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&summary_path).unwrap()).unwrap();
    assert_eq!(all.as_object().unwrap().len(), 2);
    assert_eq!(
        all["swe-bench-test-psf__requests-2317"]["validation_failed"],
        true
    );
}

#[tokio::test]
async fn summary_counts_only_selected_instances() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeRuntime::new();
    let all = vec![
        instance("psf__requests-1142"),
        instance("psf__requests-2317"),
        instance("psf__requests-863"),
    ];
    let mut bench = open(&fake, all, dir.path()).await.unwrap();
    bench.run_all(None).await.unwrap();
    drop(bench);

    let rerun = open(&fake, vec![instance("psf__requests-2317")], dir.path())
        .await
        .unwrap();
    assert_eq!(rerun.results().len(), 3);
    let summary = rerun.summary();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.completed, 1);
}
