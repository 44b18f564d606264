use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use log::{debug, info, warn};
use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::analyze::{self, Results};
use crate::client::{Payload, QueryOutcome, SearchRequest, VectorService};
use crate::config::RunConfig;
use crate::dataset::{Dataset, Vector, split_multi_vector};
use crate::ingest::row_from_id;

/// 一次成功查询的原始记录
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// 查询向量在测试集中的下标
    pub query: usize,
    pub latency: Duration,
    /// 返回结果解码后的行号，按相似度排序
    pub ids: Vec<u64>,
}

/// 查询阶段使用的测试集快照，读取一次后只读共享
#[derive(Debug, Clone, Default)]
pub struct QuerySet {
    pub vectors: Vec<Vector>,
    pub neighbors: Vec<Vec<u64>>,
    /// 为空表示未启用过滤
    pub filters: Vec<i64>,
}

impl QuerySet {
    pub fn load(dataset: &dyn Dataset) -> Result<Self> {
        let vectors = dataset.test_vectors()?;
        let neighbors = dataset.neighbors()?;
        if neighbors.len() != vectors.len() {
            bail!("真实近邻数量 {} 与查询向量数量 {} 不一致", neighbors.len(), vectors.len());
        }
        let filters = dataset.test_filters()?;
        if !filters.is_empty() && filters.len() != vectors.len() {
            bail!("查询分类标签数量 {} 与查询向量数量 {} 不一致", filters.len(), vectors.len());
        }
        debug!("已读取 {} 个查询向量", vectors.len());
        Ok(Self { vectors, neighbors, filters })
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

/// 查询阶段的参数
#[derive(Debug, Clone)]
pub struct BenchOptions {
    pub limit: usize,
    pub parallel: usize,
    pub num_tenants: usize,
    pub filter: bool,
    pub multi_vector_dimension: usize,
    /// 写入时加在行号上的偏移量，解码结果时减去
    pub id_offset: usize,
}

impl BenchOptions {
    pub fn new(cfg: &RunConfig) -> Self {
        Self {
            limit: cfg.limit,
            parallel: cfg.parallel,
            num_tenants: cfg.num_tenants,
            filter: cfg.filter,
            multi_vector_dimension: cfg.multi_vector_dimension,
            id_offset: cfg.id_offset,
        }
    }
}

/// 构造第 `i` 个查询，多租户时随机挑选一个租户
pub fn build_request(queries: &QuerySet, i: usize, options: &BenchOptions) -> Result<SearchRequest> {
    let vector = &queries.vectors[i];
    let payload = match options.multi_vector_dimension {
        0 => Payload::Single(vector.clone()),
        n => Payload::Multi(split_multi_vector(vector, n)?),
    };
    let tenant = match options.num_tenants {
        0 => None,
        n => Some(rand::rng().random_range(0..n).to_string()),
    };
    let category = match options.filter {
        true => queries.filters.get(i).copied(),
        false => None,
    };
    Ok(SearchRequest { payload, limit: options.limit, tenant, category })
}

/// 按 `i % parallel` 将查询分配给各个 worker
pub fn partition<T>(items: Vec<T>, parallel: usize) -> Vec<Vec<(usize, T)>> {
    let parallel = parallel.max(1);
    let mut queues: Vec<Vec<(usize, T)>> = (0..parallel).map(|_| vec![]).collect();
    for (i, item) in items.into_iter().enumerate() {
        queues[i % parallel].push((i, item));
    }
    queues
}

/// 对测试集完整执行一轮查询
///
/// 超时或被服务端拒绝的查询只记录警告，其他传输错误会中止整个测试。
pub async fn run_sweep<S: VectorService>(
    service: &S,
    queries: Arc<QuerySet>,
    options: Arc<BenchOptions>,
) -> Result<Results> {
    let requests = (0..queries.len())
        .map(|i| build_request(&queries, i, &options))
        .collect::<Result<Vec<_>>>()?;
    let samples = Arc::new(Mutex::new(Vec::with_capacity(queries.len())));

    let start = Instant::now();
    let mut workers = JoinSet::new();
    for queue in partition(requests, options.parallel) {
        let client = service.clone();
        let samples = samples.clone();
        let options = options.clone();
        workers.spawn(async move {
            for (query, request) in queue {
                let t = Instant::now();
                let outcome = client.search(&request).await?;
                let latency = t.elapsed();
                match outcome {
                    QueryOutcome::Hits(ids) => {
                        if ids.len() != options.limit {
                            warn!("查询 {} 返回了 {} 个结果，期望 {} 个", query, ids.len(), options.limit);
                        }
                        let ids = ids
                            .iter()
                            .filter_map(|id| row_from_id(id).checked_sub(options.id_offset as u64))
                            .collect();
                        samples.lock().await.push(Sample { query, latency, ids });
                    }
                    QueryOutcome::Rejected(reason) => warn!("查询 {} 失败: {}", query, reason),
                }
            }
            anyhow::Ok(())
        });
    }
    while let Some(result) = workers.join_next().await {
        result??;
    }
    let took = start.elapsed();

    let samples = std::mem::take(&mut *samples.lock().await);
    Ok(summarize(&queries, &options, samples, took))
}

/// 计算每个样本的召回率和 NDCG 并汇总
pub fn summarize(queries: &QuerySet, options: &BenchOptions, samples: Vec<Sample>, took: Duration) -> Results {
    let mut latencies = Vec::with_capacity(samples.len());
    let mut recall = Vec::with_capacity(samples.len());
    let mut ndcg = Vec::with_capacity(samples.len());
    for sample in samples {
        let neighbors = &queries.neighbors[sample.query];
        recall.push(analyze::recall(&sample.ids, neighbors, options.limit));
        ndcg.push(analyze::ndcg(&sample.ids, neighbors, options.limit));
        latencies.push(sample.latency);
    }
    analyze::analyze(queries.len(), options.parallel, latencies, took, &recall, &ndcg)
}

/// 执行查询阶段
///
/// 设置了 `duration` 时持续重复完整的一轮查询直到超时，结果取各轮的中位数。
pub async fn run<S: VectorService>(
    service: &S,
    queries: Arc<QuerySet>,
    options: Arc<BenchOptions>,
    duration: Option<Duration>,
) -> Result<Results> {
    let Some(duration) = duration else {
        return run_sweep(service, queries, options).await;
    };

    let start = Instant::now();
    let mut sweeps = vec![];
    while sweeps.is_empty() || start.elapsed() < duration {
        let results = run_sweep(service, queries.clone(), options.clone()).await?;
        debug!("第 {} 轮查询: QPS {:.2}, 召回率 {:.4}", sweeps.len() + 1, results.qps, results.recall);
        sweeps.push(results);
    }
    info!("持续查询 {:?}，共完成 {} 轮", start.elapsed(), sweeps.len());
    Ok(analyze::median_results(&sweeps))
}
