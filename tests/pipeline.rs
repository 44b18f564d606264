mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rstest::*;
use tempfile::TempDir;

use common::*;
use vecbench::bench::{self, BenchOptions, QuerySet};
use vecbench::cli::{run_benchmark, run_random};
use vecbench::config::{Compression, Opts, RunConfig, SubCommand};
use vecbench::dataset::open_dataset;
use vecbench::ingest::{IMPORT_WORKERS, row_from_id};
use vecbench::lifecycle::{ImportState, Orchestrator};
use vecbench::memory::MemoryMonitor;

fn config(dir: &Path, args: &[&str]) -> Arc<RunConfig> {
    let output = dir.join("out.json");
    let mut argv = vec![
        "vecbench",
        "ann-benchmark",
        "-v",
        dir.to_str().unwrap(),
        "-d",
        "l2-squared",
        "--query-delay-seconds",
        "0",
        "-b",
        "7",
        "-p",
        "3",
        "-l",
        "5",
        "-o",
        output.to_str().unwrap(),
    ];
    argv.extend_from_slice(args);
    let opts = Opts::try_parse_from(argv).unwrap();
    let SubCommand::AnnBenchmark(cmd) = &opts.subcmd else { unreachable!() };
    Arc::new(RunConfig::try_from(cmd).unwrap())
}

#[fixture]
fn npy_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_npy_dataset(dir.path(), false).unwrap();
    dir
}

async fn run(dir: &Path, service: &FakeService, args: &[&str]) -> Result<Vec<vecbench::report::BenchmarkRecord>> {
    let cfg = config(dir, args);
    let dataset = open_dataset(&cfg.vectors, cfg.multi_vector_dimension, cfg.filter)?;
    cfg.validate_dataset(&*dataset)?;
    run_benchmark(service.clone(), dataset, cfg).await
}

#[rstest]
#[tokio::test]
async fn full_run_is_exact(npy_dir: TempDir) -> Result<()> {
    let service = FakeService::default();
    let records = run(npy_dir.path(), &service, &["--ef-array", "16,32", "--labels", "team=search"]).await?;

    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record.recall, 1.0);
        assert!((record.ndcg - 1.0).abs() < 1e-9);
        assert_eq!(record.limit, 5);
        assert_eq!(record.parallelization, 3);
        assert_eq!(record.memstats.heap_alloc_bytes, 1024.0);
    }
    service.with_state(|s| {
        assert_eq!(s.recreated, 1);
        assert_eq!(s.objects.len(), TRAIN_ROWS);
        assert_eq!(s.ef, vec![16, 32]);
        assert_eq!(s.searches, 2 * TEST_ROWS);
        assert!(s.connections >= IMPORT_WORKERS);
        assert!(s.objects.keys().all(|(tenant, id)| tenant.is_none() && row_from_id(id) < TRAIN_ROWS as u64));
    });

    let written: serde_json::Value = serde_json::from_str(&fs::read_to_string(npy_dir.path().join("out.json"))?)?;
    assert_eq!(written.as_array().unwrap().len(), 2);
    assert_eq!(written[0]["team"], "search");
    assert_eq!(written[1]["ef"], 32);
    assert_eq!(written[0]["heap_sys_bytes"], 4096.0);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn id_offset_is_removed_before_scoring(npy_dir: TempDir) -> Result<()> {
    let service = FakeService::default();
    let records = run(npy_dir.path(), &service, &["--ef-array", "16", "--offset", "1000"]).await?;
    assert_eq!(records[0].recall, 1.0);
    service.with_state(|s| {
        assert!(s.objects.keys().all(|(_, id)| row_from_id(id) >= 1000));
    });
    Ok(())
}

#[rstest]
#[tokio::test]
async fn staged_compression_loads_training_subset_first(npy_dir: TempDir) -> Result<()> {
    let service = FakeService::default();
    let args = ["--ef-array", "16", "--pq", "enabled", "--training-limit", "10"];
    let records = run(npy_dir.path(), &service, &args).await?;

    assert_eq!(records[0].recall, 1.0);
    service.with_state(|s| {
        assert_eq!(s.compression, Some(Compression::Pq));
        assert_eq!(s.written_before_compression, 10);
        assert_eq!(s.objects.len(), TRAIN_ROWS);
    });
    Ok(())
}

#[rstest]
#[tokio::test]
async fn every_tenant_waits_for_compression_before_remainder(npy_dir: TempDir) -> Result<()> {
    let service = FakeService::default();
    let args = ["--ef-array", "16", "--pq", "enabled", "--training-limit", "10", "--num-tenants", "3"];
    let records = run(npy_dir.path(), &service, &args).await?;

    assert_eq!(records[0].recall, 1.0);
    service.with_state(|s| {
        assert_eq!(s.compression, Some(Compression::Pq));
        assert_eq!(s.written_before_compression, 10);
        assert_eq!(s.objects.len(), 3 * TRAIN_ROWS);
        assert_eq!(s.ready_checks.len(), 3);
        for (i, counts) in s.ready_checks.iter().enumerate() {
            // 之前的租户已完整导入，当前租户只有训练子集
            for j in 0..i {
                assert_eq!(counts[&Some(j.to_string())], TRAIN_ROWS);
            }
            assert_eq!(counts[&Some(i.to_string())], 10);
            assert_eq!(counts.len(), i + 1);
        }
    });
    Ok(())
}

#[rstest]
#[tokio::test]
async fn training_limit_beyond_dataset(npy_dir: TempDir) -> Result<()> {
    let service = FakeService::default();
    run(npy_dir.path(), &service, &["--ef-array", "16", "--sq", "enabled", "--training-limit", "1000"]).await?;
    service.with_state(|s| {
        assert_eq!(s.compression, Some(Compression::Sq));
        assert_eq!(s.written_before_compression, TRAIN_ROWS);
        assert_eq!(s.objects.len(), TRAIN_ROWS);
    });
    Ok(())
}

#[rstest]
#[tokio::test]
async fn range_updates_delete_and_reload(npy_dir: TempDir) -> Result<()> {
    let service = FakeService::default();
    let args = ["--ef-array", "16", "--update-percentage", "0.4", "--update-iterations", "2"];
    let records = run(npy_dir.path(), &service, &args).await?;

    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.recall == 1.0));
    service.with_state(|s| {
        assert_eq!(s.deleted, 20);
        assert_eq!(s.objects.len(), TRAIN_ROWS);
    });
    Ok(())
}

#[rstest]
#[tokio::test]
async fn randomized_updates_delete_whole_batches(npy_dir: TempDir) -> Result<()> {
    let service = FakeService::default();
    let args = ["--ef-array", "16", "--update-percentage", "1", "--update-randomized"];
    let records = run(npy_dir.path(), &service, &args).await?;

    assert_eq!(records.len(), 2);
    service.with_state(|s| {
        assert_eq!(s.deleted, TRAIN_ROWS);
        assert_eq!(s.objects.len(), TRAIN_ROWS);
    });
    Ok(())
}

#[rstest]
#[tokio::test]
async fn every_tenant_gets_a_full_import(npy_dir: TempDir) -> Result<()> {
    let service = FakeService::default();
    let records = run(npy_dir.path(), &service, &["--ef-array", "16", "--num-tenants", "3"]).await?;

    assert_eq!(records[0].recall, 1.0);
    service.with_state(|s| {
        assert_eq!(s.tenants, vec!["0", "1", "2"]);
        assert_eq!(s.objects.len(), 3 * TRAIN_ROWS);
    });
    Ok(())
}

#[tokio::test]
async fn filtered_queries_match_category_neighbors() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_npy_dataset(dir.path(), true)?;
    let service = FakeService::default();
    let records = run(dir.path(), &service, &["--ef-array", "16", "--filter"]).await?;

    assert_eq!(records[0].recall, 1.0);
    service.with_state(|s| {
        assert!(s.objects.values().all(|o| o.category == Some(row_from_id(&o.id) as i64 % CATEGORIES)));
    });
    Ok(())
}

#[rstest]
#[tokio::test]
async fn rejected_queries_are_not_fatal(npy_dir: TempDir) -> Result<()> {
    let service = FakeService::rejecting();
    let records = run(npy_dir.path(), &service, &["--ef-array", "16"]).await?;
    assert_eq!(records[0].recall, 0.0);
    assert_eq!(records[0].qps, 0.0);
    assert_eq!(records[0].mean_latency, 0.0);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn write_failure_aborts_run(npy_dir: TempDir) -> Result<()> {
    let service = FakeService::failing_writes();
    assert!(run(npy_dir.path(), &service, &["--ef-array", "16"]).await.is_err());
    assert!(!npy_dir.path().join("out.json").exists());
    service.with_state(|s| assert_eq!(s.searches, 0));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn dataset_read_error_aborts_run(npy_dir: TempDir) -> Result<()> {
    let cfg = config(npy_dir.path(), &["--ef-array", "16"]);
    let dataset = Arc::new(FailingDataset { inner: open_dataset(&cfg.vectors, 0, false)?, fail_from: 15 });
    let service = FakeService::default();

    assert!(run_benchmark(service.clone(), dataset, cfg).await.is_err());
    assert!(!npy_dir.path().join("out.json").exists());
    service.with_state(|s| {
        assert!(s.objects.len() <= 14);
        assert_eq!(s.searches, 0);
    });
    Ok(())
}

#[rstest]
#[tokio::test]
async fn query_only_skips_import(npy_dir: TempDir) -> Result<()> {
    let service = FakeService::default();
    let records = run(npy_dir.path(), &service, &["--ef-array", "16", "--query-only"]).await?;

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].import_time, 0.0);
    assert_eq!(records[0].recall, 0.0);
    service.with_state(|s| {
        assert_eq!(s.recreated, 0);
        assert!(s.objects.is_empty());
        assert_eq!(s.searches, TEST_ROWS);
    });
    Ok(())
}

fn random_config(args: &[&str]) -> RunConfig {
    let mut argv = vec!["vecbench", "random-vectors", "-d", "4", "-q", "12", "-p", "3", "-l", "5"];
    argv.extend_from_slice(args);
    let opts = Opts::try_parse_from(argv).unwrap();
    let SubCommand::RandomVectors(cmd) = &opts.subcmd else { unreachable!() };
    RunConfig::try_from(cmd).unwrap()
}

#[rstest]
#[tokio::test]
async fn random_vectors_query_existing_collection(npy_dir: TempDir) -> Result<()> {
    let service = FakeService::default();
    run(npy_dir.path(), &service, &["--ef-array", "16"]).await?;
    let searches = service.with_state(|s| s.searches);

    let results = run_random(&service, DIMENSION, 12, &random_config(&[])).await?;
    assert_eq!(results.total, 12);
    assert_eq!(results.successful, 12);
    assert_eq!(results.failed, 0);
    assert_eq!(results.recall, 0.0);
    assert_eq!(results.ndcg, 0.0);
    assert_eq!(results.parallelization, 3);
    service.with_state(|s| {
        assert_eq!(s.searches, searches + 12);
        assert_eq!(s.objects.len(), TRAIN_ROWS);
        assert_eq!(s.recreated, 1);
    });
    Ok(())
}

#[tokio::test]
async fn random_vectors_count_rejected_queries() -> Result<()> {
    let service = FakeService::rejecting();
    let results = run_random(&service, DIMENSION, 12, &random_config(&[])).await?;
    assert_eq!(results.total, 12);
    assert_eq!(results.failed, 12);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn skip_memory_stats(npy_dir: TempDir) -> Result<()> {
    let service = FakeService::default();
    let records = run(npy_dir.path(), &service, &["--ef-array", "16", "--skip-memory-stats"]).await?;
    assert_eq!(records[0].memstats.heap_alloc_bytes, 0.0);
    service.with_state(|s| assert_eq!(s.memstats_reads, 0));
    Ok(())
}

#[rstest]
#[tokio::test]
async fn duration_mode_repeats_sweeps(npy_dir: TempDir) -> Result<()> {
    let cfg = config(npy_dir.path(), &[]);
    let dataset = open_dataset(&cfg.vectors, 0, false)?;
    let service = FakeService::default();

    let mut orchestrator = Orchestrator::new(service.clone(), dataset.clone(), cfg.clone());
    orchestrator.import().await?;
    assert_eq!(orchestrator.state(), ImportState::QueryReady);

    let queries = Arc::new(QuerySet::load(&*dataset)?);
    let options = Arc::new(BenchOptions::new(&cfg));
    let results = bench::run(&service, queries, options, Some(Duration::from_millis(30))).await?;

    assert_eq!(results.total, TEST_ROWS);
    assert_eq!(results.failed, 0);
    assert_eq!(results.recall, 1.0);
    service.with_state(|s| {
        assert!(s.searches >= TEST_ROWS);
        assert_eq!(s.searches % TEST_ROWS, 0);
    });
    Ok(())
}

#[tokio::test]
async fn memory_monitor_records_until_stopped() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("results").join("memory.json");
    let service = FakeService::default();

    let monitor = MemoryMonitor::start(service, Duration::from_millis(10), output.clone());
    tokio::time::sleep(Duration::from_millis(35)).await;
    let entries = monitor.stop().await?;

    assert!(entries.len() >= 2);
    assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    let written: serde_json::Value = serde_json::from_str(&fs::read_to_string(&output)?)?;
    assert_eq!(written.as_array().unwrap().len(), entries.len());
    assert_eq!(written[0]["heap_sys_bytes"], 4096.0);
    Ok(())
}
