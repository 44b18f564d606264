use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::info;
use rand::Rng;

use crate::analyze::Results;
use crate::bench::{self, BenchOptions, QuerySet};
use crate::cli::SubCommandExtend;
use crate::client::{VectorService, WeaviateClient};
use crate::config::{Opts, OutputFormat, RunConfig, ServiceOptions};
use crate::report;

#[derive(Parser, Debug, Clone)]
pub struct RandomCommand {
    #[command(flatten)]
    pub service: ServiceOptions,
    /// 集合名称，集合必须已经存在
    #[arg(short = 'c', long, default_value = "Vector")]
    pub class_name: String,
    /// 随机向量的维度，必须与集合中的向量一致
    #[arg(short, long)]
    pub dimension: usize,
    /// 查询次数
    #[arg(short, long, default_value_t = 100)]
    pub queries: usize,
    /// 并发查询数量，默认为 CPU 核数
    #[arg(short, long, default_value_t = num_cpus::get())]
    pub parallel: usize,
    /// 每次查询返回的结果数量 (k)
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,
    /// 租户数量，大于 0 时每次查询随机选择一个租户
    #[arg(long, default_value_t = 0)]
    pub num_tenants: usize,
    /// 持续查询指定秒数
    #[arg(long, value_name = "SECONDS", default_value_t = 0)]
    pub query_duration: u64,
    /// 控制台输出格式
    #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// 同时将结果写入该文件
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl TryFrom<&RandomCommand> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(cmd: &RandomCommand) -> Result<Self> {
        for (name, value) in [
            ("dimension", cmd.dimension),
            ("queries", cmd.queries),
            ("parallel", cmd.parallel),
            ("limit", cmd.limit),
        ] {
            if value == 0 {
                bail!("--{} 必须大于 0", name);
            }
        }

        Ok(Self {
            http_origin: cmd.service.http_origin.clone(),
            http_scheme: cmd.service.http_scheme.clone(),
            metrics_origin: cmd.service.metrics_origin(),
            api_key: cmd.service.api_key.clone(),
            class_name: cmd.class_name.clone(),
            parallel: cmd.parallel,
            limit: cmd.limit,
            num_tenants: cmd.num_tenants,
            query_duration: match cmd.query_duration {
                0 => None,
                n => Some(Duration::from_secs(n)),
            },
            query_only: true,
            existing_schema: true,
            format: cmd.format,
            output: cmd.output.clone(),
            ..Default::default()
        })
    }
}

impl SubCommandExtend for RandomCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let cfg = Arc::new(RunConfig::try_from(self)?);
        let service = WeaviateClient::new(cfg.clone())?.connect().await?;
        let results = run_random(&service, self.dimension, self.queries, &cfg).await?;
        let rendered = report::render(&results, cfg.format)?;
        println!("{}", rendered);
        if let Some(path) = &cfg.output {
            fs::write(path, rendered).with_context(|| format!("无法写入 {}", path.display()))?;
            info!("结果已写入 {}", path.display());
        }
        Ok(())
    }
}

/// 生成 `count` 个各分量在 `[-1, 1)` 内的随机查询，没有真实近邻
pub fn random_queries(dimension: usize, count: usize) -> QuerySet {
    let mut rng = rand::rng();
    let vectors = (0..count)
        .map(|_| (0..dimension).map(|_| rng.random_range(-1.0..1.0)).collect())
        .collect();
    QuerySet { vectors, neighbors: vec![vec![]; count], filters: vec![] }
}

/// 用随机向量查询已存在的集合
///
/// 没有真实近邻，结果中的召回率和 NDCG 恒为 0。
pub async fn run_random<S: VectorService>(
    service: &S,
    dimension: usize,
    count: usize,
    cfg: &RunConfig,
) -> Result<Results> {
    let queries = Arc::new(random_queries(dimension, count));
    let options = Arc::new(BenchOptions::new(cfg));
    info!("使用 {} 个 {} 维随机向量查询集合 {}", count, dimension, cfg.class_name);

    let results = bench::run(service, queries, options, cfg.query_duration).await?;
    info!("QPS {:.2}, 平均延迟 {:?}, P99 {:?}", results.qps, results.mean, results.p99());
    Ok(results)
}
