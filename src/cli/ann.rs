use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use tokio::time::sleep;

use crate::bench::{self, BenchOptions, QuerySet};
use crate::cli::SubCommandExtend;
use crate::client::{Memstats, VectorService, WeaviateClient};
use crate::config::{
    CompressionOptions, IndexOptions, Opts, OutputOptions, RunConfig, ServiceOptions, UpdateOptions,
    WorkloadOptions,
};
use crate::dataset::{Dataset, open_dataset};
use crate::lifecycle::Orchestrator;
use crate::memory::{self, MemoryMonitor};
use crate::metrics;
use crate::report::{self, BenchmarkRecord};

#[derive(Parser, Debug, Clone)]
pub struct AnnCommand {
    /// 数据集目录，包含 train、test 和 neighbors
    #[arg(short, long, value_name = "DIR")]
    pub vectors: PathBuf,
    #[command(flatten)]
    pub service: ServiceOptions,
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub compression: CompressionOptions,
    #[command(flatten)]
    pub workload: WorkloadOptions,
    #[command(flatten)]
    pub update: UpdateOptions,
    #[command(flatten)]
    pub output: OutputOptions,
    /// 只执行查询，不创建集合也不导入数据
    #[arg(short, long)]
    pub query_only: bool,
    /// 使用已存在的集合，不删除重建
    #[arg(long)]
    pub existing_schema: bool,
    /// 导入后不等待异步索引队列清空
    #[arg(long)]
    pub skip_async_ready: bool,
    /// 更新后不等待墓碑清理
    #[arg(long)]
    pub skip_tombstones_empty: bool,
    /// 不读取服务端内存指标
    #[arg(long)]
    pub skip_memory_stats: bool,
}

impl SubCommandExtend for AnnCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let cfg = Arc::new(RunConfig::try_from(self)?);
        let dataset = open_dataset(&cfg.vectors, cfg.multi_vector_dimension, cfg.filter)?;
        cfg.validate_dataset(&*dataset)?;

        let service = WeaviateClient::new(cfg.clone())?.connect().await?;
        run_benchmark(service, dataset, cfg).await?;
        Ok(())
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

/// 执行完整的测试流程，返回写入结果文件的全部记录
///
/// 配置和数据集必须已经校验过，这里的任何错误都会中止整个测试。
pub async fn run_benchmark<S: VectorService>(
    service: S,
    dataset: Arc<dyn Dataset>,
    cfg: Arc<RunConfig>,
) -> Result<Vec<BenchmarkRecord>> {
    let ts = unix_timestamp();
    let run_id = ts.to_string();
    info!("run_id: {}", run_id);

    let monitor = cfg
        .memory_monitoring
        .map(|period| MemoryMonitor::start(service.clone(), period, memory::default_output(ts)));

    let queries = Arc::new(QuerySet::load(&*dataset)?);
    let options = Arc::new(BenchOptions::new(&cfg));
    let mut orchestrator = Orchestrator::new(service.clone(), dataset.clone(), cfg.clone());

    let mut import_time = Duration::ZERO;
    if !cfg.query_only {
        if !cfg.existing_schema {
            service.recreate_schema().await?;
        }
        import_time = orchestrator.import().await?;
        if !cfg.query_delay.is_zero() {
            info!("等待 {:?} 后开始查询", cfg.query_delay);
            sleep(cfg.query_delay).await;
        }
    }

    let phase = Phase { service: &service, queries: &queries, options: &options, cfg: &cfg, run_id: &run_id };
    let mut records = phase.sweep_all(import_time).await?;

    if cfg.perform_updates() {
        match cfg.query_only {
            true => warn!("只查询模式下不执行更新测试"),
            false => {
                for i in 0..cfg.update_iterations {
                    info!("第 {}/{} 轮更新，比例 {}", i + 1, cfg.update_iterations, cfg.update_percentage);
                    orchestrator.update().await?;
                    records.extend(phase.sweep_all(import_time).await?);
                }
            }
        }
    }

    let output = cfg.output.clone().unwrap_or_else(|| report::default_output(&run_id));
    report::write_records(&output, &records)?;
    info!("已写入 {} 条结果到 {}", records.len(), output.display());

    if let Some(url) = &cfg.prometheus_push {
        metrics::push(url.clone(), records.clone()).await;
    }
    if let Some(monitor) = monitor {
        monitor.stop().await?;
    }
    Ok(records)
}

/// 一个查询阶段：对每个 ef 值执行一次查询测试
struct Phase<'a, S> {
    service: &'a S,
    queries: &'a Arc<QuerySet>,
    options: &'a Arc<BenchOptions>,
    cfg: &'a RunConfig,
    run_id: &'a str,
}

impl<S: VectorService> Phase<'_, S> {
    async fn sweep_all(&self, import_time: Duration) -> Result<Vec<BenchmarkRecord>> {
        let memstats = self.memstats().await;

        let mut records = Vec::with_capacity(self.cfg.ef_array.len());
        for &ef in &self.cfg.ef_array {
            self.service.update_ef(ef).await?;
            let results =
                bench::run(self.service, self.queries.clone(), self.options.clone(), self.cfg.query_duration)
                    .await?;

            info!("ef = {}, 召回率 {:.4}, QPS {:.2}", ef, results.recall, results.qps);
            println!("{}", report::render(&results, self.cfg.format)?);
            records.push(BenchmarkRecord::new(self.cfg, ef, &results, import_time, self.run_id, memstats));
        }
        Ok(records)
    }

    async fn memstats(&self) -> Memstats {
        if self.cfg.skip_memory_stats {
            return Memstats::default();
        }
        match self.service.memstats().await {
            Ok(memstats) => memstats,
            Err(e) => {
                warn!("读取内存指标失败: {:#}", e);
                Memstats::default()
            }
        }
    }
}
