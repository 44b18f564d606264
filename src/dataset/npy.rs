use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use memmap2::Mmap;
use ndarray::{ArrayView1, ArrayView2, s};
use ndarray_npy::ViewNpyExt;

use super::{Batch, Dataset, TrainStream, Vector, split_multi_vector, train_range};
use crate::loader::windows;

pub(super) const TRAIN_FILE: &str = "train.npy";
const TEST_FILE: &str = "test.npy";
const NEIGHBORS_FILE: &str = "neighbors.npy";
const TRAIN_CATEGORIES_FILE: &str = "train_categories.npy";
const TEST_CATEGORIES_FILE: &str = "test_categories.npy";

/// 以 mmap 方式打开的 npy 文件
struct NpyFile {
    path: PathBuf,
    mmap: Mmap,
}

impl NpyFile {
    fn open(path: PathBuf) -> Result<Self> {
        let file = File::open(&path).with_context(|| format!("无法打开 {}", path.display()))?;
        // SAFETY: 数据集文件在测试期间不会被修改
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("无法映射 {}", path.display()))?;
        Ok(Self { path, mmap })
    }

    fn floats(&self) -> Result<FloatView<'_>> {
        if let Ok(view) = ArrayView2::<f32>::view_npy(&self.mmap[..]) {
            return Ok(FloatView::F32(view));
        }
        ArrayView2::<f64>::view_npy(&self.mmap[..])
            .map(FloatView::F64)
            .map_err(|e| anyhow!("{} 不是二维 f32/f64 数组: {}", self.path.display(), e))
    }

    fn integer_rows(&self) -> Result<Vec<Vec<u64>>> {
        macro_rules! try_view {
            ($t:ty) => {
                if let Ok(view) = ArrayView2::<$t>::view_npy(&self.mmap[..]) {
                    return view
                        .iter()
                        .map(|&x| {
                            u64::try_from(x).map_err(|_| anyhow!("{} 中存在负数 ID {}", self.path.display(), x))
                        })
                        .collect::<Result<Vec<_>>>()
                        .map(|ids| ids.chunks(view.ncols().max(1)).map(<[u64]>::to_vec).collect());
                }
            };
        }
        try_view!(i64);
        try_view!(i32);
        try_view!(u64);
        try_view!(u32);
        bail!("{} 不是二维整数数组", self.path.display())
    }

    fn integers(&self) -> Result<Vec<i64>> {
        macro_rules! try_view {
            ($t:ty) => {
                if let Ok(view) = ArrayView1::<$t>::view_npy(&self.mmap[..]) {
                    return Ok(view.iter().map(|&x| x as i64).collect());
                }
            };
        }
        try_view!(i64);
        try_view!(i32);
        try_view!(u32);
        try_view!(u8);
        bail!("{} 不是一维整数数组", self.path.display())
    }
}

enum FloatView<'a> {
    F32(ArrayView2<'a, f32>),
    F64(ArrayView2<'a, f64>),
}

impl FloatView<'_> {
    fn dim(&self) -> (usize, usize) {
        match self {
            FloatView::F32(v) => v.dim(),
            FloatView::F64(v) => v.dim(),
        }
    }

    fn rows(&self, range: Range<usize>) -> Vec<Vector> {
        match self {
            FloatView::F32(v) => v.slice(s![range, ..]).outer_iter().map(|row| row.to_vec()).collect(),
            FloatView::F64(v) => v
                .slice(s![range, ..])
                .outer_iter()
                .map(|row| row.iter().map(|&x| x as f32).collect())
                .collect(),
        }
    }
}

/// 由若干 `.npy` 文件组成的数据集目录
///
/// * `train.npy`: 训练向量，二维 f32/f64
/// * `test.npy`: 查询向量，二维 f32/f64
/// * `neighbors.npy`: 真实近邻，二维整数
/// * `train_categories.npy` / `test_categories.npy`: 可选的分类标签，一维整数
pub struct NpyDataset {
    root: PathBuf,
    train: NpyFile,
    rows: usize,
    width: usize,
    multi_vector_dimension: usize,
    filters: bool,
}

impl NpyDataset {
    pub fn open(root: &Path, multi_vector_dimension: usize, filters: bool) -> Result<Self> {
        let train = NpyFile::open(root.join(TRAIN_FILE))?;
        let (rows, width) = train.floats()?.dim();

        if multi_vector_dimension > 0 && width % multi_vector_dimension != 0 {
            bail!("训练向量长度 {} 不是多向量维度 {} 的整数倍", width, multi_vector_dimension);
        }
        if filters {
            for name in [TRAIN_CATEGORIES_FILE, TEST_CATEGORIES_FILE] {
                if !root.join(name).exists() {
                    bail!("启用了过滤，但数据集缺少 {}", name);
                }
            }
        }

        Ok(Self { root: root.to_path_buf(), train, rows, width, multi_vector_dimension, filters })
    }

    fn open_file(&self, name: &str) -> Result<NpyFile> {
        NpyFile::open(self.root.join(name))
    }

    fn check_multi_vector(&self, vectors: &[Vector]) -> Result<()> {
        if self.multi_vector_dimension > 0 {
            if let Some(row) = vectors.first() {
                split_multi_vector(row, self.multi_vector_dimension)?;
            }
        }
        Ok(())
    }
}

impl Dataset for NpyDataset {
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
        let view = self.train.floats()?;
        let filters = self.train_filters()?;
        if self.filters && filters.len() < self.rows {
            bail!("训练集分类标签数量 {} 少于训练向量数量 {}", filters.len(), self.rows);
        }

        let range = train_range(self.rows, start, max_rows);
        Ok(Box::new(windows(range, batch_size).map(move |window| {
            let filters = match filters.is_empty() {
                true => vec![],
                false => filters[window.clone()].to_vec(),
            };
            Ok(Batch { offset: window.start, vectors: view.rows(window), filters })
        })))
    }

    fn test_vectors(&self) -> Result<Vec<Vector>> {
        let file = self.open_file(TEST_FILE)?;
        let view = file.floats()?;
        let (rows, width) = view.dim();
        if width != self.width {
            bail!("查询向量长度 {} 与训练向量长度 {} 不一致", width, self.width);
        }
        let vectors = view.rows(0..rows);
        self.check_multi_vector(&vectors)?;
        Ok(vectors)
    }

    fn neighbors(&self) -> Result<Vec<Vec<u64>>> {
        self.open_file(NEIGHBORS_FILE)?.integer_rows()
    }

    fn train_filters(&self) -> Result<Vec<i64>> {
        match self.filters {
            true => self.open_file(TRAIN_CATEGORIES_FILE)?.integers(),
            false => Ok(vec![]),
        }
    }

    fn test_filters(&self) -> Result<Vec<i64>> {
        match self.filters {
            true => self.open_file(TEST_CATEGORIES_FILE)?.integers(),
            false => Ok(vec![]),
        }
    }

    fn has_filters(&self) -> bool {
        self.filters
    }

    fn describe(&self) -> String {
        format!("{} (npy, {} 行, 维度 {})", self.root.display(), self.rows, self.dimension())
    }
}
