use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};

use crate::analyze::{PERCENTILES, Results};
use crate::client::Memstats;
use crate::config::{OutputFormat, RunConfig};

/// 查询使用的协议
pub const API: &str = "graphql";

/// 结果文件中的一条记录，对应一个 ef 值的一轮测试
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkRecord {
    pub api: String,
    pub ef: usize,
    pub ef_construction: usize,
    pub max_connections: usize,
    /// 秒
    pub mean_latency: f64,
    /// 秒
    pub p99_latency: f64,
    pub qps: f64,
    pub shards: usize,
    pub parallelization: usize,
    pub limit: usize,
    /// 秒
    pub import_time: f64,
    #[serde(rename = "run_id")]
    pub run_id: String,
    #[serde(rename = "dataset_file")]
    pub dataset_file: String,
    pub recall: f64,
    pub ndcg: f64,
    #[serde(flatten)]
    pub memstats: Memstats,
    /// 用户标签，由 [`BenchmarkRecord::to_json`] 写入
    #[serde(skip)]
    pub labels: BTreeMap<String, String>,
}

impl BenchmarkRecord {
    pub fn new(
        cfg: &RunConfig,
        ef: usize,
        results: &Results,
        import_time: Duration,
        run_id: &str,
        memstats: Memstats,
    ) -> Self {
        Self {
            api: API.to_owned(),
            ef,
            ef_construction: cfg.ef_construction,
            max_connections: cfg.max_connections,
            mean_latency: results.mean.as_secs_f64(),
            p99_latency: results.p99().as_secs_f64(),
            qps: results.qps,
            shards: cfg.shards,
            parallelization: results.parallelization,
            limit: cfg.limit,
            import_time: import_time.as_secs_f64(),
            run_id: run_id.to_owned(),
            dataset_file: dataset_file(&cfg.vectors),
            recall: results.recall,
            ndcg: results.ndcg,
            memstats,
            labels: cfg.labels.iter().cloned().collect(),
        }
    }
}

impl BenchmarkRecord {
    /// 序列化为 JSON 对象，用户标签最后写入，与字段同名时覆盖该字段
    pub fn to_json(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            for (key, label) in &self.labels {
                map.insert(key.clone(), json!(label));
            }
        }
        Ok(value)
    }
}

/// 写入结果文件
pub fn write_records(path: &Path, records: &[BenchmarkRecord]) -> Result<()> {
    let values = records.iter().map(BenchmarkRecord::to_json).collect::<Result<Vec<_>>>()?;
    write_json(path, &values)
}

fn dataset_file(path: &Path) -> String {
    path.file_name().unwrap_or(path.as_os_str()).to_string_lossy().into_owned()
}

/// 控制台输出的一轮结果
pub fn render(results: &Results, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Text => render_text(results),
        OutputFormat::Json => serde_json::to_string_pretty(&render_json(results))?,
    })
}

fn render_text(results: &Results) -> String {
    let mut lines = vec![
        "Results".to_owned(),
        format!("Successful: {}", results.successful),
        format!("Min: {:?}", results.min),
        format!("Mean: {:?}", results.mean),
    ];
    for (p, latency) in PERCENTILES.iter().zip(&results.percentiles) {
        lines.push(format!("p{}: {:?}", p, latency));
    }
    lines.push(format!("Took: {:?}", results.took));
    lines.push(format!("QPS: {:.2}", results.qps));
    lines.push(format!("Recall: {:.4}", results.recall));
    lines.push(format!("NDCG: {:.4}", results.ndcg));
    lines.join("\n")
}

fn render_json(results: &Results) -> Value {
    let mut latencies = serde_json::Map::new();
    let mut formatted = serde_json::Map::new();
    let mut put = |key: String, d: Duration| {
        latencies.insert(key.clone(), json!(d.as_nanos() as u64));
        formatted.insert(key, json!(format!("{:?}", d)));
    };
    put("mean".into(), results.mean);
    put("min".into(), results.min);
    put("max".into(), results.max);
    for (p, latency) in PERCENTILES.iter().zip(&results.percentiles) {
        put(format!("p{}", p), *latency);
    }

    json!({
        "metadata": {
            "successful": results.successful,
            "failed": results.failed,
            "total": results.total,
            "parallelization": results.parallelization,
            "took": results.took.as_nanos() as u64,
            "tookFormatted": format!("{:?}", results.took),
        },
        "latencies": latencies,
        "latenciesFormatted": formatted,
        "throughput": { "qps": results.qps },
        "quality": { "recall": results.recall, "ndcg": results.ndcg },
    })
}

/// 默认的结果文件路径
pub fn default_output(run_id: &str) -> PathBuf {
    PathBuf::from("results").join(format!("{}.json", run_id))
}

/// 将 `value` 以 JSON 格式写入 `path`，必要时创建父目录
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("无法创建目录 {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("无法创建结果文件 {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)?;
    Ok(())
}
