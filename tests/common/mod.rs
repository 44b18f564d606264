#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use ndarray::{Array1, Array2};
use ndarray_npy::write_npy;
use uuid::Uuid;

use vecbench::client::{
    Memstats, Payload, QueryOutcome, SearchRequest, StatusSource, VectorService, WriteObject,
};
use vecbench::config::Compression;
use vecbench::dataset::{Batch, Dataset, TrainStream, Vector};
use vecbench::ingest::row_from_id;

pub const TRAIN_ROWS: usize = 25;
pub const TEST_ROWS: usize = 6;
pub const DIMENSION: usize = 4;
pub const DEPTH: usize = 10;
pub const CATEGORIES: i64 = 3;

pub fn train_row(i: usize) -> Vec<f32> {
    vec![i as f32, ((i * i) % 7) as f32, (i % 3) as f32, 1.0]
}

pub fn test_row(q: usize) -> Vec<f32> {
    vec![q as f32 * 4.0 + 0.25, 0.5, 1.0, 1.0]
}

pub fn train_category(i: usize) -> i64 {
    i as i64 % CATEGORIES
}

pub fn test_category(q: usize) -> i64 {
    q as i64 % CATEGORIES
}

pub fn l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn by_distance(a: &(f32, u64), b: &(f32, u64)) -> Ordering {
    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
}

/// 暴力计算真实近邻，`category` 不为空时只在同类中查找
pub fn exact_neighbors(query: &[f32], category: Option<i64>, k: usize) -> Vec<u64> {
    let mut scored: Vec<(f32, u64)> = (0..TRAIN_ROWS)
        .filter(|&i| category.is_none_or(|c| train_category(i) == c))
        .map(|i| (l2(query, &train_row(i)), i as u64))
        .collect();
    scored.sort_by(by_distance);
    scored.into_iter().take(k).map(|(_, i)| i).collect()
}

fn matrix(rows: usize, f: impl Fn(usize) -> Vec<f32>) -> Array2<f32> {
    Array2::from_shape_fn((rows, DIMENSION), |(i, j)| f(i)[j])
}

/// 写入 npy 格式的测试数据集，`filters` 为真时近邻只在同类中计算
pub fn write_npy_dataset(dir: &Path, filters: bool) -> Result<()> {
    write_npy(dir.join("train.npy"), &matrix(TRAIN_ROWS, train_row))?;
    write_npy(dir.join("test.npy"), &matrix(TEST_ROWS, test_row))?;

    // 每个分类至少有 8 行
    let depth = if filters { 8 } else { DEPTH };
    let neighbors = Array2::from_shape_fn((TEST_ROWS, depth), |(q, j)| {
        exact_neighbors(&test_row(q), filters.then(|| test_category(q)), depth)[j] as i64
    });
    write_npy(dir.join("neighbors.npy"), &neighbors)?;

    if filters {
        let train = Array1::from_shape_fn(TRAIN_ROWS, train_category);
        let test = Array1::from_shape_fn(TEST_ROWS, test_category);
        write_npy(dir.join("train_categories.npy"), &train)?;
        write_npy(dir.join("test_categories.npy"), &test)?;
    }
    Ok(())
}

/// 读取到 `fail_from` 行之后的批次时返回错误的数据集
pub struct FailingDataset {
    pub inner: Arc<dyn Dataset>,
    pub fail_from: usize,
}

impl Dataset for FailingDataset {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn train_rows(&self) -> usize {
        self.inner.train_rows()
    }

    fn stream_train(&self, batch_size: usize, start: usize, max_rows: usize) -> Result<TrainStream<'_>> {
        let fail_from = self.fail_from;
        let stream = self.inner.stream_train(batch_size, start, max_rows)?;
        Ok(Box::new(stream.map(move |batch: Result<Batch>| {
            let batch = batch?;
            if batch.rows().end > fail_from {
                bail!("corrupt row group at {}", batch.offset);
            }
            Ok(batch)
        })))
    }

    fn test_vectors(&self) -> Result<Vec<Vector>> {
        self.inner.test_vectors()
    }

    fn neighbors(&self) -> Result<Vec<Vec<u64>>> {
        self.inner.neighbors()
    }

    fn train_filters(&self) -> Result<Vec<i64>> {
        self.inner.train_filters()
    }

    fn test_filters(&self) -> Result<Vec<i64>> {
        self.inner.test_filters()
    }

    fn has_filters(&self) -> bool {
        self.inner.has_filters()
    }

    fn describe(&self) -> String {
        format!("failing {}", self.inner.describe())
    }
}

#[derive(Debug, Default)]
pub struct State {
    pub objects: HashMap<(Option<String>, Uuid), WriteObject>,
    pub recreated: usize,
    pub connections: usize,
    pub tenants: Vec<String>,
    pub deleted: usize,
    pub ef: Vec<usize>,
    pub compression: Option<Compression>,
    /// 开启压缩时已写入的对象数量
    pub written_before_compression: usize,
    pub searches: usize,
    pub reject_queries: bool,
    pub memstats_reads: usize,
    /// 每次检查分片状态时各租户已写入的对象数量
    pub ready_checks: Vec<BTreeMap<Option<String>, usize>>,
    pub fail_writes: bool,
}

impl State {
    pub fn objects_per_tenant(&self) -> BTreeMap<Option<String>, usize> {
        let mut counts = BTreeMap::new();
        for (tenant, _) in self.objects.keys() {
            *counts.entry(tenant.clone()).or_default() += 1;
        }
        counts
    }
}

/// 内存中的向量服务，查询使用暴力 L2 检索
#[derive(Debug, Clone, Default)]
pub struct FakeService {
    pub state: Arc<Mutex<State>>,
}

impl FakeService {
    pub fn rejecting() -> Self {
        let service = Self::default();
        service.state.lock().unwrap().reject_queries = true;
        service
    }

    pub fn failing_writes() -> Self {
        let service = Self::default();
        service.state.lock().unwrap().fail_writes = true;
        service
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        f(&self.state.lock().unwrap())
    }
}

impl StatusSource for FakeService {
    async fn shards_ready(&self) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let counts = state.objects_per_tenant();
        state.ready_checks.push(counts);
        Ok(true)
    }

    async fn queue_length(&self) -> Result<u64> {
        Ok(0)
    }

    async fn tombstones(&self) -> Result<f64> {
        Ok(0.0)
    }
}

impl VectorService for FakeService {
    async fn connect(&self) -> Result<Self> {
        self.state.lock().unwrap().connections += 1;
        Ok(self.clone())
    }

    async fn recreate_schema(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.objects.clear();
        state.recreated += 1;
        Ok(())
    }

    async fn add_tenant(&self, tenant: &str) -> Result<()> {
        self.state.lock().unwrap().tenants.push(tenant.to_owned());
        Ok(())
    }

    async fn write_objects(&self, objects: Vec<WriteObject>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            bail!("write rejected");
        }
        for object in objects {
            state.objects.insert((object.tenant.clone(), object.id), object);
        }
        Ok(())
    }

    async fn delete_objects(&self, ids: &[Uuid], tenant: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for id in ids {
            state.objects.remove(&(tenant.map(str::to_owned), *id));
        }
        state.deleted += ids.len();
        Ok(())
    }

    async fn update_ef(&self, ef: usize) -> Result<()> {
        self.state.lock().unwrap().ef.push(ef);
        Ok(())
    }

    async fn enable_compression(&self, compression: Compression, _dimension: usize) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.compression = Some(compression);
        state.written_before_compression = state.objects.len();
        Ok(())
    }

    async fn memstats(&self) -> Result<Memstats> {
        let mut state = self.state.lock().unwrap();
        state.memstats_reads += 1;
        Ok(Memstats {
            heap_alloc_bytes: 1024.0,
            heap_inuse_bytes: 2048.0,
            heap_sys_bytes: 4096.0,
        })
    }

    async fn search(&self, request: &SearchRequest) -> Result<QueryOutcome> {
        let mut state = self.state.lock().unwrap();
        state.searches += 1;
        if state.reject_queries {
            return Ok(QueryOutcome::Rejected("rejected".into()));
        }
        let Payload::Single(query) = &request.payload else {
            bail!("fake service only supports single vectors");
        };

        let mut scored: Vec<(f32, u64, Uuid)> = state
            .objects
            .iter()
            .filter(|((tenant, _), _)| *tenant == request.tenant)
            .filter(|(_, o)| request.category.is_none() || o.category == request.category)
            .filter_map(|(_, o)| match &o.payload {
                Payload::Single(v) => Some((l2(query, v), row_from_id(&o.id), o.id)),
                Payload::Multi(_) => None,
            })
            .collect();
        scored.sort_by(|a, b| by_distance(&(a.0, a.1), &(b.0, b.1)));
        Ok(QueryOutcome::Hits(scored.into_iter().take(request.limit).map(|(_, _, id)| id).collect()))
    }
}
