use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use hdf5::File;
use ndarray::s;

use super::{Batch, Dataset, TrainStream, Vector, split_multi_vector, train_range};
use crate::loader::windows;

const TRAIN: &str = "train";
const TEST: &str = "test";
const NEIGHBORS: &str = "neighbors";
const TRAIN_CATEGORIES: &str = "train_categories";
const TEST_CATEGORIES: &str = "test_categories";

/// ann-benchmarks 格式的单个 HDF5 文件
///
/// 文件中的 `train`、`test` 为二维浮点数组，`neighbors` 为二维整数数组，
/// 可选的 `train_categories` / `test_categories` 为一维整数数组。
/// 多向量模式下每行长度必须是子向量维度的整数倍。
pub struct Hdf5Dataset {
    path: PathBuf,
    file: File,
    rows: usize,
    width: usize,
    multi_vector_dimension: usize,
    filters: bool,
}

impl Hdf5Dataset {
    pub fn open(path: &Path, multi_vector_dimension: usize, filters: bool) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("无法打开 {}", path.display()))?;
        let (rows, width) = shape_2d(&file, TRAIN)?;

        if multi_vector_dimension > 0 && width % multi_vector_dimension != 0 {
            bail!("训练向量长度 {} 不是多向量维度 {} 的整数倍", width, multi_vector_dimension);
        }
        if filters {
            for name in [TRAIN_CATEGORIES, TEST_CATEGORIES] {
                if file.dataset(name).is_err() {
                    bail!("启用了过滤，但 {} 缺少 {}", path.display(), name);
                }
            }
        }

        Ok(Self { path: path.to_path_buf(), file, rows, width, multi_vector_dimension, filters })
    }

    fn read_rows(&self, name: &str, start: usize, end: usize) -> Result<Vec<Vector>> {
        let values = self
            .file
            .dataset(name)?
            .read_slice_2d::<f32, _>(s![start..end, ..])
            .with_context(|| format!("读取 {}:{} 第 {}..{} 行失败", self.path.display(), name, start, end))?;
        Ok(values.outer_iter().map(|row| row.to_vec()).collect())
    }

    fn categories(&self, name: &str) -> Result<Vec<i64>> {
        if !self.filters {
            return Ok(vec![]);
        }
        let values = self.file.dataset(name)?.read_1d::<i64>()?;
        Ok(values.to_vec())
    }
}

fn shape_2d(file: &File, name: &str) -> Result<(usize, usize)> {
    let dataset = file.dataset(name).with_context(|| format!("缺少数据集 {}", name))?;
    let shape = dataset.shape();
    match shape.as_slice() {
        &[rows, width] => Ok((rows, width)),
        other => bail!("{} 不是二维数组: {:?}", name, other),
    }
}

impl Dataset for Hdf5Dataset {
    fn dimension(&self) -> usize {
        match self.multi_vector_dimension {
            0 => self.width,
            n => n,
        }
    }

    fn train_rows(&self) -> usize {
        self.rows
    }

    fn stream_train(
        &self,
        batch_size: usize,
        start: usize,
        max_rows: usize,
    ) -> Result<TrainStream<'_>> {
        if batch_size == 0 {
            bail!("批次大小必须大于 0");
        }
        let filters = self.train_filters()?;
        if self.filters && filters.len() < self.rows {
            bail!("训练集分类标签数量 {} 少于训练向量数量 {}", filters.len(), self.rows);
        }

        let range = train_range(self.rows, start, max_rows);
        Ok(Box::new(windows(range, batch_size).map(move |window| {
            let vectors = self.read_rows(TRAIN, window.start, window.end)?;
            let filters = match filters.is_empty() {
                true => vec![],
                false => filters[window.clone()].to_vec(),
            };
            Ok(Batch { offset: window.start, vectors, filters })
        })))
    }

    fn test_vectors(&self) -> Result<Vec<Vector>> {
        let (rows, width) = shape_2d(&self.file, TEST)?;
        if width != self.width {
            bail!("查询向量长度 {} 与训练向量长度 {} 不一致", width, self.width);
        }
        let vectors = self.read_rows(TEST, 0, rows)?;
        if let (n @ 1.., Some(row)) = (self.multi_vector_dimension, vectors.first()) {
            split_multi_vector(row, n)?;
        }
        Ok(vectors)
    }

    fn neighbors(&self) -> Result<Vec<Vec<u64>>> {
        let values = self.file.dataset(NEIGHBORS)?.read_2d::<i64>()?;
        values
            .outer_iter()
            .map(|row| {
                row.iter()
                    .map(|&x| u64::try_from(x).map_err(|_| anyhow!("{} 中存在负数近邻 ID {}", NEIGHBORS, x)))
                    .collect()
            })
            .collect()
    }

    fn train_filters(&self) -> Result<Vec<i64>> {
        self.categories(TRAIN_CATEGORIES)
    }

    fn test_filters(&self) -> Result<Vec<i64>> {
        self.categories(TEST_CATEGORIES)
    }

    fn has_filters(&self) -> bool {
        self.filters
    }

    fn describe(&self) -> String {
        format!("{} (hdf5, {} 行, 维度 {})", self.path.display(), self.rows, self.dimension())
    }
}
