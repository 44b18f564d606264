mod columnar;
#[cfg(feature = "hdf5")]
mod h5;
mod npy;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};
use log::info;

pub use self::columnar::ParquetDataset;
#[cfg(feature = "hdf5")]
pub use self::h5::Hdf5Dataset;
pub use self::npy::NpyDataset;

/// 单个向量，维度在数据集打开时确定
pub type Vector = Vec<f32>;

/// 一批训练向量
///
/// `offset` 是 `vectors[0]` 在训练集中的行号，也是对象 ID 的唯一来源。
/// `filters` 为空表示未启用过滤，否则与 `vectors` 等长。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub vectors: Vec<Vector>,
    pub offset: usize,
    pub filters: Vec<i64>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// 本批次覆盖的行号范围
    pub fn rows(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.vectors.len()
    }
}

/// 训练集流式读取的惰性迭代器，只能向前读取
pub type TrainStream<'a> = Box<dyn Iterator<Item = Result<Batch>> + Send + 'a>;

/// 批量向量数据集
///
/// 不同容器格式的实现必须保持完全一致的语义：浮点数据统一转为 f32，
/// 多向量维度不一致时直接报错而不是返回部分结果。
pub trait Dataset: Send + Sync {
    /// 单个向量（多向量模式下为子向量）的维度
    fn dimension(&self) -> usize;

    /// 训练集总行数
    fn train_rows(&self) -> usize;

    /// 从 `start` 开始按 `batch_size` 读取训练集，`max_rows` 为 0 表示读到末尾
    fn stream_train(&self, batch_size: usize, start: usize, max_rows: usize)
    -> Result<TrainStream<'_>>;

    /// 全部测试向量
    fn test_vectors(&self) -> Result<Vec<Vector>>;

    /// 测试向量对应的真实近邻，按相似度降序排列
    fn neighbors(&self) -> Result<Vec<Vec<u64>>>;

    /// 训练集分类标签，未启用过滤时为空
    fn train_filters(&self) -> Result<Vec<i64>>;

    /// 测试集分类标签，未启用过滤时为空
    fn test_filters(&self) -> Result<Vec<i64>>;

    /// 是否启用了分类标签
    fn has_filters(&self) -> bool;

    /// 数据集的简短描述，用于日志
    fn describe(&self) -> String;
}

/// 根据路径选择数据集格式并打开
///
/// * 扩展名为 `.hdf5` / `.h5` 的文件使用 HDF5 格式，需要开启 `hdf5` 特性
/// * 包含 `train.npy` 的目录使用 NPY 格式
/// * 包含 `train.parquet` 的目录使用 Parquet 格式
///
/// `filters` 为真时数据集必须带有分类标签，否则直接报错。
pub fn open_dataset(
    path: impl AsRef<Path>,
    multi_vector_dimension: usize,
    filters: bool,
) -> Result<Arc<dyn Dataset>> {
    let path = path.as_ref();
    if path.is_file() && is_hdf5(path) {
        let dataset = open_hdf5(path, multi_vector_dimension, filters)?;
        info!("打开数据集: {}", dataset.describe());
        return Ok(dataset);
    }
    if !path.is_dir() {
        bail!("数据集路径必须是目录或 HDF5 文件: {}", path.display());
    }

    let dataset: Arc<dyn Dataset> = if path.join(npy::TRAIN_FILE).exists() {
        Arc::new(NpyDataset::open(path, multi_vector_dimension, filters)?)
    } else if path.join(columnar::TRAIN_FILE).exists() {
        Arc::new(ParquetDataset::open(path, multi_vector_dimension, filters)?)
    } else {
        bail!(
            "无法识别的数据集格式，目录中需要 {} 或 {}: {}",
            npy::TRAIN_FILE,
            columnar::TRAIN_FILE,
            path.display()
        );
    };

    info!("打开数据集: {}", dataset.describe());
    Ok(dataset)
}

fn is_hdf5(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("hdf5") || ext.eq_ignore_ascii_case("h5"))
}

#[cfg(feature = "hdf5")]
fn open_hdf5(path: &Path, multi_vector_dimension: usize, filters: bool) -> Result<Arc<dyn Dataset>> {
    Ok(Arc::new(Hdf5Dataset::open(path, multi_vector_dimension, filters)?))
}

#[cfg(not(feature = "hdf5"))]
fn open_hdf5(path: &Path, _multi_vector_dimension: usize, _filters: bool) -> Result<Arc<dyn Dataset>> {
    bail!("读取 {} 需要开启 hdf5 特性重新编译", path.display())
}

/// 计算 `[start, start + max_rows)` 与训练集的交集，`max_rows` 为 0 表示读到末尾
pub fn train_range(rows: usize, start: usize, max_rows: usize) -> std::ops::Range<usize> {
    let end = match max_rows {
        0 => rows,
        n => start.saturating_add(n).min(rows),
    };
    start.min(end)..end
}

/// 将长度为 `n * sub_dim` 的扁平多向量拆分成子向量
pub fn split_multi_vector(row: &[f32], sub_dim: usize) -> Result<Vec<Vector>> {
    if sub_dim == 0 || row.len() % sub_dim != 0 {
        bail!("向量长度 {} 不是多向量维度 {} 的整数倍", row.len(), sub_dim);
    }
    Ok(row.chunks_exact(sub_dim).map(<[f32]>::to_vec).collect())
}
