use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand, ValueEnum};

use crate::cli::*;
use crate::dataset::Dataset;
use crate::utils::{parse_ef_array, parse_labels};

#[derive(Parser, Debug, Clone)]
#[command(name = "vecbench", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 导入 ann-benchmarks 格式的数据集并测试查询性能
    AnnBenchmark(AnnCommand),
    /// 查看数据集的基本信息
    Inspect(InspectCommand),
    /// 使用随机向量查询已存在的集合，只测试延迟和吞吐量
    RandomVectors(RandomCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct ServiceOptions {
    /// 目标服务的 HTTP 地址
    #[arg(long, value_name = "HOST:PORT", default_value = "localhost:8080")]
    pub http_origin: String,
    /// HTTP 协议，http 或 https
    #[arg(long, default_value = "http")]
    pub http_scheme: String,
    /// Prometheus 指标地址，默认将 HTTP 地址中的 8080 端口替换为 2112
    #[arg(long, value_name = "HOST:PORT")]
    pub metrics_origin: Option<String>,
    /// API key，以 Bearer token 形式发送
    #[arg(long)]
    pub api_key: Option<String>,
}

impl ServiceOptions {
    pub fn metrics_origin(&self) -> String {
        match &self.metrics_origin {
            Some(origin) => origin.clone(),
            None => self.http_origin.replace("8080", "2112"),
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct IndexOptions {
    /// 集合名称
    #[arg(short = 'c', long, default_value = "Vector")]
    pub class_name: String,
    /// 距离度量（必填）
    #[arg(short, long, value_enum)]
    pub distance: Option<Distance>,
    /// 索引类型
    #[arg(long, value_enum, default_value_t = IndexType::Hnsw)]
    pub index_type: IndexType,
    /// HNSW 构建时的 efConstruction
    #[arg(long, default_value_t = 256)]
    pub ef_construction: usize,
    /// HNSW 每个节点的最大连接数
    #[arg(long, default_value_t = 16)]
    pub max_connections: usize,
    /// 依次测试的 ef 值，逗号分隔
    #[arg(long, default_value = "16,24,32,48,64,96,128,256,512")]
    pub ef_array: String,
    /// HNSW 清理间隔（秒）
    #[arg(long, default_value_t = 300)]
    pub cleanup_interval_seconds: usize,
    /// 低于该数量的过滤结果直接使用暴力搜索
    #[arg(long, default_value_t = 40000)]
    pub flat_search_cutoff: usize,
    /// dynamic 索引从 flat 切换到 hnsw 的阈值
    #[arg(long, default_value_t = 10000)]
    pub dynamic_threshold: usize,
    /// 过滤搜索策略
    #[arg(long, value_enum, default_value_t = FilterStrategy::Sweeping)]
    pub filter_strategy: FilterStrategy,
    /// 分片数量
    #[arg(long, default_value_t = 1)]
    pub shards: usize,
    /// 副本数量
    #[arg(long, default_value_t = 1)]
    pub replication_factor: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct CompressionOptions {
    /// PQ 压缩模式，enabled 表示先导入训练集再开启
    #[arg(long, value_enum, default_value_t = CompressionSwitch::Disabled)]
    pub pq: CompressionSwitch,
    /// SQ 压缩模式
    #[arg(long, value_enum, default_value_t = CompressionSwitch::Disabled)]
    pub sq: CompressionSwitch,
    /// LASQ 压缩模式
    #[arg(long, value_enum, default_value_t = CompressionSwitch::Disabled)]
    pub lasq: CompressionSwitch,
    /// 创建集合时开启 BQ 压缩
    #[arg(long)]
    pub bq: bool,
    /// flat 索引开启 BQ 时同时开启向量缓存
    #[arg(long)]
    pub cache: bool,
    /// 压缩后重新打分的候选数量
    #[arg(long, default_value_t = 256)]
    pub rescore_limit: usize,
    /// PQ 分段数 = 维度 / ratio，必须整除
    #[arg(long, default_value_t = 4)]
    pub pq_ratio: usize,
    /// 创建集合时直接开启 PQ（auto 模式）使用的分段数
    #[arg(long, default_value_t = 256)]
    pub pq_segments: usize,
    /// 压缩训练使用的行数
    #[arg(long, default_value_t = 100000)]
    pub training_limit: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct WorkloadOptions {
    /// 每批写入的对象数量
    #[arg(short, long, default_value_t = 1000)]
    pub batch_size: usize,
    /// 并发查询数量，默认为 CPU 核数
    #[arg(short, long, default_value_t = num_cpus::get())]
    pub parallel: usize,
    /// 每次查询返回的结果数量 (k)
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,
    /// 不只查询一遍测试集，而是持续查询指定秒数
    #[arg(long, value_name = "SECONDS", default_value_t = 0)]
    pub query_duration: u64,
    /// 导入完成后等待多少秒再开始查询
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    pub query_delay_seconds: u64,
    /// 对象 ID 的偏移量，用于多次导入同一数据集
    #[arg(long, default_value_t = 0)]
    pub offset: usize,
    /// 租户数量，大于 0 时每个租户都导入完整的数据集
    #[arg(long, default_value_t = 0)]
    pub num_tenants: usize,
    /// 使用分类标签过滤
    #[arg(long)]
    pub filter: bool,
    /// 命名向量的数量，每个对象的每个命名向量都写入同一个向量
    #[arg(long, default_value_t = 0)]
    pub multi_target_vector: usize,
    /// 多向量模式下单个子向量的维度
    #[arg(long, default_value_t = 0)]
    pub multi_vector_dimension: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct UpdateOptions {
    /// 首轮查询后更新的数据比例，范围 0 到 1
    #[arg(long, default_value_t = 0.0)]
    pub update_percentage: f64,
    /// 更新的轮数
    #[arg(long, default_value_t = 1)]
    pub update_iterations: usize,
    /// 随机选择更新的批次，而不是删除并重新导入开头的行
    #[arg(long)]
    pub update_randomized: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct OutputOptions {
    /// 控制台输出格式
    #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// 结果文件路径，默认为 results/{run_id}.json
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// 附加到每条结果上的标签，格式为 key1=value1,key2=value2
    #[arg(long, default_value = "")]
    pub labels: String,
    /// Prometheus push gateway 地址
    #[arg(long, value_name = "URL")]
    pub prometheus_push: Option<String>,
    /// 运行期间持续采集服务端内存指标
    #[arg(long)]
    pub memory_monitoring: bool,
    /// 内存指标采集间隔（秒）
    #[arg(long, value_name = "SECONDS", default_value_t = 5)]
    pub memory_monitoring_interval: u64,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distance {
    #[default]
    Cosine,
    Dot,
    #[value(name = "l2-squared")]
    L2Squared,
    Hamming,
    Manhattan,
}

impl Distance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Distance::Cosine => "cosine",
            Distance::Dot => "dot",
            Distance::L2Squared => "l2-squared",
            Distance::Hamming => "hamming",
            Distance::Manhattan => "manhattan",
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexType {
    #[default]
    Hnsw,
    Flat,
    Dynamic,
}

impl IndexType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexType::Hnsw => "hnsw",
            IndexType::Flat => "flat",
            IndexType::Dynamic => "dynamic",
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionSwitch {
    /// 不压缩
    #[default]
    Disabled,
    /// 创建集合时开启，由服务端在达到训练行数后自动训练
    Auto,
    /// 先导入训练集，再开启压缩并等待训练完成
    Enabled,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterStrategy {
    #[default]
    Sweeping,
    Acorn,
}

impl FilterStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterStrategy::Sweeping => "sweeping",
            FilterStrategy::Acorn => "acorn",
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// 需要分阶段导入的压缩方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Pq,
    Sq,
    Lasq,
}

impl Compression {
    /// 在索引配置中的字段名
    pub fn key(&self) -> &'static str {
        match self {
            Compression::Pq => "pq",
            Compression::Sq => "sq",
            Compression::Lasq => "lasq",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key().to_uppercase())
    }
}

/// 一次运行的完整配置，校验后不可变
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub vectors: PathBuf,
    pub http_origin: String,
    pub http_scheme: String,
    pub metrics_origin: String,
    pub api_key: Option<String>,

    pub class_name: String,
    pub distance: Distance,
    pub index_type: IndexType,
    pub ef_construction: usize,
    pub max_connections: usize,
    pub ef_array: Vec<usize>,
    pub cleanup_interval_seconds: usize,
    pub flat_search_cutoff: usize,
    pub dynamic_threshold: usize,
    pub filter_strategy: FilterStrategy,
    pub shards: usize,
    pub replication_factor: usize,

    pub pq: CompressionSwitch,
    pub sq: CompressionSwitch,
    pub lasq: CompressionSwitch,
    pub bq: bool,
    pub cache: bool,
    pub rescore_limit: usize,
    pub pq_ratio: usize,
    pub pq_segments: usize,
    pub training_limit: usize,

    pub batch_size: usize,
    pub parallel: usize,
    pub limit: usize,
    pub query_duration: Option<Duration>,
    pub query_delay: Duration,
    pub id_offset: usize,
    pub num_tenants: usize,
    pub filter: bool,
    pub multi_target_vector: usize,
    pub multi_vector_dimension: usize,

    pub update_percentage: f64,
    pub update_iterations: usize,
    pub update_randomized: bool,

    pub query_only: bool,
    pub existing_schema: bool,
    pub skip_async_ready: bool,
    pub skip_tombstones_empty: bool,
    pub skip_memory_stats: bool,

    pub format: OutputFormat,
    pub output: Option<PathBuf>,
    pub labels: Vec<(String, String)>,
    pub prometheus_push: Option<String>,
    pub memory_monitoring: Option<Duration>,
}

impl RunConfig {
    /// 需要分阶段导入的压缩方式，`enabled` 模式才需要
    pub fn staged_compression(&self) -> Option<Compression> {
        [(self.pq, Compression::Pq), (self.sq, Compression::Sq), (self.lasq, Compression::Lasq)]
            .into_iter()
            .find(|(switch, _)| *switch == CompressionSwitch::Enabled)
            .map(|(_, compression)| compression)
    }

    /// 命名向量列表，未使用命名向量时为空
    pub fn target_vectors(&self) -> Vec<String> {
        match (self.multi_vector_dimension, self.multi_target_vector) {
            (0, 0) => vec![],
            (0, n) => (0..n).map(|i| format!("named_vector_{}", i)).collect(),
            _ => vec![MULTI_VECTOR_NAME.to_owned()],
        }
    }

    /// 是否在首轮查询后进行更新测试
    pub fn perform_updates(&self) -> bool {
        self.update_percentage > 0.0 && self.update_iterations > 0
    }

    /// 打开数据集之后才能进行的校验，仍然不会对目标服务产生副作用
    pub fn validate_dataset(&self, dataset: &dyn Dataset) -> Result<()> {
        let dimension = dataset.dimension();
        if self.staged_compression() == Some(Compression::Pq) && dimension % self.pq_ratio != 0 {
            bail!("PQ ratio {} 无法整除向量维度 {}", self.pq_ratio, dimension);
        }
        if self.filter && !dataset.has_filters() {
            bail!("启用了 --filter，但数据集没有分类标签");
        }
        Ok(())
    }
}

/// 多向量模式使用的命名向量名称
pub const MULTI_VECTOR_NAME: &str = "multivector";

impl TryFrom<&AnnCommand> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(cmd: &AnnCommand) -> Result<Self> {
        let AnnCommand { service, index, compression, workload, update, output, .. } = cmd;

        let Some(distance) = index.distance else {
            bail!("必须通过 --distance 指定距离度量");
        };
        for (name, value) in [
            ("batch-size", workload.batch_size),
            ("parallel", workload.parallel),
            ("limit", workload.limit),
            ("training-limit", compression.training_limit),
            ("pq-ratio", compression.pq_ratio),
        ] {
            if value == 0 {
                bail!("--{} 必须大于 0", name);
            }
        }
        let ef_array = parse_ef_array(&index.ef_array)?;

        let switches = [compression.pq, compression.sq, compression.lasq];
        let active = switches.iter().filter(|s| **s != CompressionSwitch::Disabled).count();
        if active > 1 {
            bail!("--pq、--sq 和 --lasq 最多只能开启一个");
        }
        if compression.bq && active > 0 {
            bail!("--bq 不能与 --pq、--sq 或 --lasq 同时使用");
        }
        if index.index_type == IndexType::Flat && active > 0 {
            bail!("flat 索引只支持 BQ 压缩");
        }
        if !(0.0..=1.0).contains(&update.update_percentage) {
            bail!("--update-percentage 必须在 0 到 1 之间");
        }
        if workload.multi_vector_dimension > 0 && workload.multi_target_vector > 0 {
            bail!("--multi-vector-dimension 与 --multi-target-vector 不能同时使用");
        }
        let labels = parse_labels(&output.labels)?;
        if !cmd.vectors.exists() {
            bail!("数据集不存在: {}", cmd.vectors.display());
        }

        Ok(Self {
            vectors: cmd.vectors.clone(),
            http_origin: service.http_origin.clone(),
            http_scheme: service.http_scheme.clone(),
            metrics_origin: service.metrics_origin(),
            api_key: service.api_key.clone(),

            class_name: index.class_name.clone(),
            distance,
            index_type: index.index_type,
            ef_construction: index.ef_construction,
            max_connections: index.max_connections,
            ef_array,
            cleanup_interval_seconds: index.cleanup_interval_seconds,
            flat_search_cutoff: index.flat_search_cutoff,
            dynamic_threshold: index.dynamic_threshold,
            filter_strategy: index.filter_strategy,
            shards: index.shards,
            replication_factor: index.replication_factor,

            pq: compression.pq,
            sq: compression.sq,
            lasq: compression.lasq,
            bq: compression.bq,
            cache: compression.cache,
            rescore_limit: compression.rescore_limit,
            pq_ratio: compression.pq_ratio,
            pq_segments: compression.pq_segments,
            training_limit: compression.training_limit,

            batch_size: workload.batch_size,
            parallel: workload.parallel,
            limit: workload.limit,
            query_duration: match workload.query_duration {
                0 => None,
                n => Some(Duration::from_secs(n)),
            },
            query_delay: Duration::from_secs(workload.query_delay_seconds),
            id_offset: workload.offset,
            num_tenants: workload.num_tenants,
            filter: workload.filter,
            multi_target_vector: workload.multi_target_vector,
            multi_vector_dimension: workload.multi_vector_dimension,

            update_percentage: update.update_percentage,
            update_iterations: update.update_iterations,
            update_randomized: update.update_randomized,

            query_only: cmd.query_only,
            existing_schema: cmd.existing_schema,
            skip_async_ready: cmd.skip_async_ready,
            skip_tombstones_empty: cmd.skip_tombstones_empty,
            skip_memory_stats: cmd.skip_memory_stats,

            format: output.format,
            output: output.output.clone(),
            labels,
            prometheus_push: output.prometheus_push.clone(),
            memory_monitoring: output
                .memory_monitoring
                .then(|| Duration::from_secs(output.memory_monitoring_interval.max(1))),
        })
    }
}
