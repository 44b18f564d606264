use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use serde_json::json;

use crate::bench::QuerySet;
use crate::cli::SubCommandExtend;
use crate::config::{Opts, OutputFormat};
use crate::dataset::open_dataset;

#[derive(Parser, Debug, Clone)]
pub struct InspectCommand {
    /// 数据集目录
    pub path: PathBuf,
    /// 多向量模式下单个子向量的维度
    #[arg(long, default_value_t = 0)]
    pub multi_vector_dimension: usize,
    /// 同时检查分类标签
    #[arg(long)]
    pub filter: bool,
    /// 输出格式
    #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

impl SubCommandExtend for InspectCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let dataset = open_dataset(&self.path, self.multi_vector_dimension, self.filter)?;
        let queries = QuerySet::load(&*dataset)?;
        let depth = queries.neighbors.iter().map(Vec::len).min().unwrap_or(0);
        let train_filters = dataset.train_filters()?;

        match self.format {
            OutputFormat::Text => {
                println!("train rows: {}", dataset.train_rows());
                println!("test rows: {}", queries.len());
                println!("dimension: {}", dataset.dimension());
                println!("neighbors: {}", depth);
                println!("filters: {}", dataset.has_filters());
                if let (Some(min), Some(max)) = (train_filters.iter().min(), train_filters.iter().max()) {
                    println!("categories: {}..={}", min, max);
                }
            }
            OutputFormat::Json => {
                let value = json!({
                    "train_rows": dataset.train_rows(),
                    "test_rows": queries.len(),
                    "dimension": dataset.dimension(),
                    "neighbors": depth,
                    "filters": dataset.has_filters(),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
        }
        Ok(())
    }
}
