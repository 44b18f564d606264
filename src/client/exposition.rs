//! 读取 Prometheus 文本格式中的样本值

use anyhow::{Context, Result};
use prometheus_parse::{Scrape, Value};

/// 一次 `/metrics` 抓取的解析结果
pub struct Exposition {
    scrape: Scrape,
}

impl Exposition {
    pub fn parse(text: &str) -> Result<Self> {
        let lines = text.lines().map(|line| Ok(line.to_owned()));
        let scrape = Scrape::parse(lines).context("无法解析 Prometheus 指标")?;
        Ok(Self { scrape })
    }

    /// 指定指标的所有样本值，忽略标签；直方图和摘要没有单个值，跳过
    pub fn samples<'a>(&'a self, name: &'a str) -> impl Iterator<Item = f64> + 'a {
        self.scrape
            .samples
            .iter()
            .filter(move |sample| sample.metric == name)
            .filter_map(|sample| match sample.value {
                Value::Counter(v) | Value::Gauge(v) | Value::Untyped(v) => Some(v),
                Value::Histogram(_) | Value::Summary(_) => None,
            })
    }

    /// 指定指标所有样本值之和，指标不存在时为 0
    pub fn sum(&self, name: &str) -> f64 {
        self.samples(name).sum()
    }

    pub fn first(&self, name: &str) -> Option<f64> {
        self.samples(name).next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = r#"
# HELP go_memstats_heap_alloc_bytes Number of heap bytes allocated and still in use.
# TYPE go_memstats_heap_alloc_bytes gauge
go_memstats_heap_alloc_bytes 1.2345e+07
go_memstats_heap_inuse_bytes 2048
# TYPE vector_index_tombstones gauge
vector_index_tombstones{class_name="Vector",shard_name="a b"} 3
vector_index_tombstones{class_name="Vector",shard_name="c"} 4 1700000000000
vector_index_tombstones_total 100
# TYPE batch_durations_ms histogram
batch_durations_ms_bucket{le="10"} 5
batch_durations_ms_bucket{le="+Inf"} 9
batch_durations_ms_sum 42
batch_durations_ms_count 9
"#;

    #[test]
    fn reads_plain_samples() {
        let metrics = Exposition::parse(TEXT).unwrap();
        assert_eq!(metrics.first("go_memstats_heap_alloc_bytes"), Some(12345000.0));
        assert_eq!(metrics.first("go_memstats_heap_inuse_bytes"), Some(2048.0));
        assert_eq!(metrics.first("go_memstats_heap_sys_bytes"), None);
    }

    #[test]
    fn sums_labelled_samples() {
        let metrics = Exposition::parse(TEXT).unwrap();
        assert_eq!(metrics.sum("vector_index_tombstones"), 7.0);
        assert_eq!(metrics.sum("missing"), 0.0);
    }

    #[test]
    fn histograms_have_no_single_value() {
        let metrics = Exposition::parse(TEXT).unwrap();
        assert_eq!(metrics.first("batch_durations_ms"), None);
        assert_eq!(metrics.sum("vector_index_tombstones_total"), 100.0);
    }
}
