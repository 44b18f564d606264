use std::collections::HashMap;

use anyhow::Result;
use log::{error, info};
use prometheus::{Gauge, Opts, Registry, labels};
use tokio::task::spawn_blocking;

use crate::report::BenchmarkRecord;

/// push gateway 中的 job 名称
const JOB: &str = "vecbench";

fn gauges(record: &BenchmarkRecord) -> [(&'static str, &'static str, f64); 13] {
    [
        ("vecbench_mean_latency_seconds", "mean query latency in seconds", record.mean_latency),
        ("vecbench_p99_latency_seconds", "p99 query latency in seconds", record.p99_latency),
        ("vecbench_queries_per_second", "queries per second", record.qps),
        ("vecbench_recall", "mean recall of all queries", record.recall),
        ("vecbench_import_time_seconds", "import duration in seconds", record.import_time),
        ("vecbench_heap_alloc_bytes", "heap bytes allocated by the server", record.memstats.heap_alloc_bytes),
        ("vecbench_heap_inuse_bytes", "heap bytes in use by the server", record.memstats.heap_inuse_bytes),
        ("vecbench_heap_sys_bytes", "heap bytes obtained from the OS by the server", record.memstats.heap_sys_bytes),
        ("vecbench_ef_construction", "efConstruction of the index", record.ef_construction as f64),
        ("vecbench_max_connections", "maxConnections of the index", record.max_connections as f64),
        ("vecbench_shards", "number of shards", record.shards as f64),
        ("vecbench_parallelization", "number of concurrent queries", record.parallelization as f64),
        ("vecbench_limit", "number of results per query", record.limit as f64),
    ]
}

/// 为一条结果创建独立的 registry，标签包括 api、dataset 和用户标签
pub fn registry(record: &BenchmarkRecord) -> Result<Registry> {
    let mut labels: HashMap<String, String> = record.labels.clone().into_iter().collect();
    labels.insert("api".to_owned(), record.api.clone());
    labels.insert("dataset".to_owned(), record.dataset_file.clone());

    let registry = Registry::new();
    for (name, help, value) in gauges(record) {
        let gauge = Gauge::with_opts(Opts::new(name, help).const_labels(labels.clone()))?;
        gauge.set(value);
        registry.register(Box::new(gauge))?;
    }
    Ok(registry)
}

/// 推送每条结果，以 `run_id` 和 `ef` 作为分组标签
pub fn push_records(url: &str, records: &[BenchmarkRecord]) -> Result<()> {
    for record in records {
        let metric_families = registry(record)?.gather();
        prometheus::push_metrics(
            JOB,
            labels! {
                "run_id".to_owned() => record.run_id.clone(),
                "ef".to_owned() => record.ef.to_string(),
            },
            url,
            metric_families,
            None,
        )?;
    }
    Ok(())
}

/// 在阻塞线程中推送指标，失败时只记录错误
pub async fn push(url: String, records: Vec<BenchmarkRecord>) {
    let count = records.len();
    let r = spawn_blocking(move || push_records(&url, &records)).await;
    match r {
        Ok(Ok(())) => info!("已推送 {} 条结果到 Prometheus", count),
        Ok(Err(e)) => error!("推送指标失败: {:#}", e),
        Err(e) => error!("推送指标失败: {}", e),
    }
}
