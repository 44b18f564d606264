use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// 统计的延迟百分位
pub const PERCENTILES: [usize; 5] = [50, 90, 95, 98, 99];

/// 一轮查询的汇总结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Results {
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    /// 从派发第一个查询到最后一个查询完成的时间
    pub took: Duration,
    pub qps: f64,
    /// 与 [`PERCENTILES`] 一一对应
    pub percentiles: Vec<Duration>,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub parallelization: usize,
    pub recall: f64,
    pub ndcg: f64,
}

impl Results {
    /// 最高百分位（p99）的延迟
    pub fn p99(&self) -> Duration {
        self.percentiles.last().copied().unwrap_or_default()
    }
}

/// 汇总一轮查询
///
/// `total` 是计划执行的查询数量，`latencies` 只包含成功的查询。
/// 没有任何成功查询时所有统计量均为 0。
pub fn analyze(
    total: usize,
    parallelization: usize,
    mut latencies: Vec<Duration>,
    took: Duration,
    recall: &[f64],
    ndcg: &[f64],
) -> Results {
    latencies.sort_unstable();
    let successful = latencies.len();
    let sum: u128 = latencies.iter().map(Duration::as_nanos).sum();

    Results {
        min: latencies.first().copied().unwrap_or_default(),
        max: latencies.last().copied().unwrap_or_default(),
        mean: match successful {
            0 => Duration::ZERO,
            n => Duration::from_nanos((sum / n as u128) as u64),
        },
        took,
        qps: match took.is_zero() {
            true => 0.0,
            false => successful as f64 / took.as_secs_f64(),
        },
        percentiles: PERCENTILES.iter().map(|&p| percentile(&latencies, p)).collect(),
        total,
        successful,
        failed: total.saturating_sub(successful),
        parallelization,
        recall: mean(recall),
        ndcg: mean(ndcg),
    }
}

/// 已排序样本的百分位，下标为 `n * p / 100 + 1` 并截断到 `n - 1`
pub fn percentile(sorted: &[Duration], p: usize) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let pos = (sorted.len() * p / 100 + 1).min(sorted.len() - 1);
    sorted[pos]
}

fn mean(values: &[f64]) -> f64 {
    match values.len() {
        0 => 0.0,
        n => values.iter().sum::<f64>() / n as f64,
    }
}

/// `k = min(limit, |neighbors|)` 时 `ids` 命中前 k 个真实近邻的比例
pub fn recall(ids: &[u64], neighbors: &[u64], limit: usize) -> f64 {
    let k = limit.min(neighbors.len());
    if k == 0 {
        return 0.0;
    }
    let retrieved: HashSet<_> = ids.iter().collect();
    let hits = neighbors[..k].iter().collect::<HashSet<_>>().intersection(&retrieved).count();
    hits as f64 / k as f64
}

/// 以前 k 个真实近邻为理想排序计算 NDCG@k
///
/// 真实近邻中排名第 i 的对象相关度为 `k - i`，理想 DCG 为 0 时返回 0。
pub fn ndcg(ids: &[u64], neighbors: &[u64], limit: usize) -> f64 {
    let k = limit.min(neighbors.len());
    let truth = &neighbors[..k];
    let relevance: HashMap<u64, f64> =
        truth.iter().enumerate().map(|(rank, &id)| (id, (k - rank) as f64)).collect();

    let dcg = |ranking: &[u64]| -> f64 {
        ranking
            .iter()
            .take(k)
            .enumerate()
            .map(|(i, id)| relevance.get(id).copied().unwrap_or(0.0) / ((i + 2) as f64).log2())
            .sum()
    };

    let idcg = dcg(truth);
    if idcg == 0.0 {
        return 0.0;
    }
    dcg(ids) / idcg
}

/// 中位数，偶数个样本时取中间两个数的平均值，空集合为 0
pub fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    match n {
        0 => 0.0,
        n if n % 2 == 0 => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
        n => sorted[n / 2],
    }
}

/// 合并持续查询模式下多轮的结果
///
/// 标量统计量取各轮的中位数，百分位和计数沿用最后一轮。
pub fn median_results(sweeps: &[Results]) -> Results {
    let Some(last) = sweeps.last() else {
        return Results::default();
    };
    let median_of = |f: fn(&Results) -> f64| median(&sweeps.iter().map(f).collect::<Vec<_>>());
    let median_duration =
        |f: fn(&Results) -> Duration| Duration::from_secs_f64(median_of_secs(sweeps, f));

    Results {
        min: median_duration(|r| r.min),
        max: median_duration(|r| r.max),
        mean: median_duration(|r| r.mean),
        took: median_duration(|r| r.took),
        qps: median_of(|r| r.qps),
        recall: median_of(|r| r.recall),
        ndcg: median_of(|r| r.ndcg),
        ..last.clone()
    }
}

fn median_of_secs(sweeps: &[Results], f: fn(&Results) -> Duration) -> f64 {
    median(&sweeps.iter().map(|r| f(r).as_secs_f64()).collect::<Vec<_>>())
}
