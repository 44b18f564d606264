use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float32Type, Int64Type};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};

use super::{Batch, Dataset, TrainStream, Vector, split_multi_vector, train_range};

pub(super) const TRAIN_FILE: &str = "train.parquet";
const TEST_FILE: &str = "test.parquet";

const EMBEDDING: &str = "embedding";
const NEIGHBORS: &str = "neighbors";
const CATEGORY: &str = "category";

/// 由 `train.parquet` 和 `test.parquet` 组成的数据集目录
///
/// 训练集包含 `embedding` 列和可选的 `category` 列，
/// 测试集额外包含 `neighbors` 列。向量列可以是 f32 或 f64 的 List/FixedSizeList。
///
/// 多向量模式下每行的子向量数量可以不同：`embedding` 既可以是长度为
/// `n * multi_vector_dimension` 的扁平列表，也可以是嵌套的 `List<List<Float>>`。
pub struct ParquetDataset {
    root: PathBuf,
    rows: usize,
    dimension: usize,
    multi_vector_dimension: usize,
    filters: bool,
}

impl ParquetDataset {
    pub fn open(root: &Path, multi_vector_dimension: usize, filters: bool) -> Result<Self> {
        let train = root.join(TRAIN_FILE);
        let builder = builder(&train)?;
        let rows = builder.metadata().file_metadata().num_rows() as usize;
        require_columns(&builder, &train, filters)?;
        if filters {
            let test = root.join(TEST_FILE);
            require_columns(&self::builder(&test)?, &test, true)?;
        }

        let mut reader = read_columns(builder, &[EMBEDDING], 1, 0, Some(1))?;
        let first = match reader.next() {
            Some(batch) => embeddings(&batch?, &train)?.into_iter().next(),
            None => None,
        };
        let dimension = match (first, multi_vector_dimension) {
            (Some(row), 0) => row.len(),
            (Some(row), n) => {
                split_multi_vector(&row, n)?;
                n
            }
            (None, n) => n,
        };
        if rows > 0 && dimension == 0 {
            bail!("{} 中的向量为空", train.display());
        }

        Ok(Self { root: root.to_path_buf(), rows, dimension, multi_vector_dimension, filters })
    }

    fn shape(&self) -> Shape {
        match self.multi_vector_dimension {
            0 => Shape::Single(self.dimension),
            n => Shape::Multi(n),
        }
    }

    fn test_column(&self, name: &str) -> Result<Vec<RecordBatch>> {
        let path = self.root.join(TEST_FILE);
        let reader = read_columns(builder(&path)?, &[name], 8192, 0, None)?;
        reader.map(|batch| batch.with_context(|| format!("读取 {} 失败", path.display()))).collect()
    }
}

impl Dataset for ParquetDataset {
    fn dimension(&self) -> usize {
        self.dimension
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
        let range = train_range(self.rows, start, max_rows);
        let path = self.root.join(TRAIN_FILE);
        let columns: &[&str] = match self.filters {
            true => &[EMBEDDING, CATEGORY],
            false => &[EMBEDDING],
        };
        let reader = read_columns(builder(&path)?, columns, batch_size, range.start, Some(range.len()))?;

        Ok(Box::new(Rechunk {
            reader,
            path,
            batch_size,
            shape: self.shape(),
            filters: self.filters,
            next_offset: range.start,
            vectors: vec![],
            labels: vec![],
        }))
    }

    fn test_vectors(&self) -> Result<Vec<Vector>> {
        let path = self.root.join(TEST_FILE);
        let mut vectors = vec![];
        for batch in self.test_column(EMBEDDING)? {
            vectors.extend(embeddings(&batch, &path)?);
        }
        let shape = self.shape();
        for v in &vectors {
            shape.check(v).with_context(|| format!("{} 中的查询向量无效", path.display()))?;
        }
        Ok(vectors)
    }

    fn neighbors(&self) -> Result<Vec<Vec<u64>>> {
        let mut neighbors = vec![];
        for batch in self.test_column(NEIGHBORS)? {
            let column = batch.column(0);
            for i in 0..column.len() {
                let row = list_value(column, i)?;
                let ids: Vec<u64> = integers(&row)?
                    .into_iter()
                    .map(|x| u64::try_from(x).map_err(|_| anyhow!("{} 中存在负数近邻 ID {}", TEST_FILE, x)))
                    .collect::<Result<_>>()?;
                neighbors.push(ids);
            }
        }
        Ok(neighbors)
    }

    fn train_filters(&self) -> Result<Vec<i64>> {
        if !self.filters {
            return Ok(vec![]);
        }
        let path = self.root.join(TRAIN_FILE);
        let reader = read_columns(builder(&path)?, &[CATEGORY], 8192, 0, None)?;
        let mut labels = vec![];
        for batch in reader {
            labels.extend(integers(batch?.column(0))?);
        }
        Ok(labels)
    }

    fn test_filters(&self) -> Result<Vec<i64>> {
        if !self.filters {
            return Ok(vec![]);
        }
        let mut labels = vec![];
        for batch in self.test_column(CATEGORY)? {
            labels.extend(integers(batch.column(0))?);
        }
        Ok(labels)
    }

    fn has_filters(&self) -> bool {
        self.filters
    }

    fn describe(&self) -> String {
        format!("{} (parquet, {} 行, 维度 {})", self.root.display(), self.rows, self.dimension)
    }
}

/// 每行向量需要满足的形状
#[derive(Debug, Clone, Copy)]
enum Shape {
    Single(usize),
    Multi(usize),
}

impl Shape {
    fn check(self, row: &[f32]) -> Result<()> {
        match self {
            Shape::Single(dimension) if row.len() != dimension => {
                bail!("向量维度 {} 与训练向量维度 {} 不一致", row.len(), dimension)
            }
            Shape::Single(_) => Ok(()),
            Shape::Multi(n) => split_multi_vector(row, n).map(|_| ()),
        }
    }
}

/// 将 Parquet 读出的记录批次重新切分为固定大小的批次
///
/// 记录批次会在行组边界处被截断，因此需要缓存不足一批的数据。
struct Rechunk {
    reader: ParquetRecordBatchReader,
    path: PathBuf,
    batch_size: usize,
    shape: Shape,
    filters: bool,
    next_offset: usize,
    vectors: Vec<Vector>,
    labels: Vec<i64>,
}

impl Rechunk {
    fn append(&mut self, batch: &RecordBatch) -> Result<()> {
        let vectors = embeddings(batch, &self.path)?;
        for (i, v) in vectors.iter().enumerate() {
            let row = self.next_offset + self.vectors.len() + i;
            self.shape.check(v).with_context(|| format!("{} 第 {} 行无效", self.path.display(), row))?;
        }
        self.vectors.extend(vectors);
        if self.filters {
            let column = batch
                .column_by_name(CATEGORY)
                .ok_or_else(|| anyhow!("{} 缺少列 {}", self.path.display(), CATEGORY))?;
            self.labels.extend(integers(column)?);
        }
        Ok(())
    }
}

impl Iterator for Rechunk {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.vectors.len() < self.batch_size {
            match self.reader.next() {
                Some(Ok(batch)) => {
                    if let Err(e) = self.append(&batch) {
                        return Some(Err(e));
                    }
                }
                Some(Err(e)) => return Some(Err(e.into())),
                None => break,
            }
        }
        if self.vectors.is_empty() {
            return None;
        }

        let take = self.batch_size.min(self.vectors.len());
        let vectors: Vec<_> = self.vectors.drain(..take).collect();
        let filters = match self.filters {
            true => self.labels.drain(..take).collect(),
            false => vec![],
        };
        let batch = Batch { vectors, offset: self.next_offset, filters };
        self.next_offset += take;
        Some(Ok(batch))
    }
}

fn builder(path: &Path) -> Result<ParquetRecordBatchReaderBuilder<File>> {
    let file = File::open(path).with_context(|| format!("无法打开 {}", path.display()))?;
    ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("无法解析 {}", path.display()))
}

fn require_columns(
    builder: &ParquetRecordBatchReaderBuilder<File>,
    path: &Path,
    filters: bool,
) -> Result<()> {
    for column in [EMBEDDING].into_iter().chain(filters.then_some(CATEGORY)) {
        if builder.schema().index_of(column).is_err() {
            bail!("{} 缺少列 {}", path.display(), column);
        }
    }
    Ok(())
}

fn read_columns(
    builder: ParquetRecordBatchReaderBuilder<File>,
    columns: &[&str],
    batch_size: usize,
    offset: usize,
    limit: Option<usize>,
) -> Result<ParquetRecordBatchReader> {
    let mut roots = Vec::with_capacity(columns.len());
    for column in columns {
        roots.push(builder.schema().index_of(column).with_context(|| format!("缺少列 {}", column))?);
    }
    let mask = ProjectionMask::roots(builder.parquet_schema(), roots);
    let mut builder = builder.with_projection(mask).with_batch_size(batch_size).with_offset(offset);
    if let Some(limit) = limit {
        builder = builder.with_limit(limit);
    }
    Ok(builder.build()?)
}

fn embeddings(batch: &RecordBatch, path: &Path) -> Result<Vec<Vector>> {
    let column = batch
        .column_by_name(EMBEDDING)
        .ok_or_else(|| anyhow!("{} 缺少列 {}", path.display(), EMBEDDING))?;
    (0..column.len()).map(|i| floats(&list_value(column, i)?)).collect()
}

fn list_value(column: &ArrayRef, i: usize) -> Result<ArrayRef> {
    Ok(match column.data_type() {
        DataType::List(_) => column.as_list::<i32>().value(i),
        DataType::LargeList(_) => column.as_list::<i64>().value(i),
        DataType::FixedSizeList(_, _) => column.as_fixed_size_list().value(i),
        other => bail!("列类型 {} 不是列表", other),
    })
}

/// 读取一行向量，嵌套列表（多向量）会被展开为扁平向量
fn floats(values: &ArrayRef) -> Result<Vector> {
    match values.data_type() {
        DataType::Float32 | DataType::Float64 | DataType::Float16 => {
            let values = cast(values, &DataType::Float32)?;
            Ok(values.as_primitive::<Float32Type>().values().to_vec())
        }
        DataType::List(_) | DataType::LargeList(_) | DataType::FixedSizeList(_, _) => {
            let mut row = vec![];
            for i in 0..values.len() {
                row.extend(floats(&list_value(values, i)?)?);
            }
            Ok(row)
        }
        other => bail!("向量元素类型 {} 不是浮点数", other),
    }
}

fn integers(values: &ArrayRef) -> Result<Vec<i64>> {
    if !values.data_type().is_integer() {
        bail!("列类型 {} 不是整数", values.data_type());
    }
    let values = cast(values, &DataType::Int64)?;
    Ok(values.as_primitive::<Int64Type>().values().to_vec())
}
