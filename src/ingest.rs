use std::sync::Arc;

use anyhow::{Result, bail};
use flume::Receiver;
use indicatif::ProgressBar;
use log::debug;
use rand::Rng;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::client::{Payload, VectorService, WriteObject};
use crate::config::RunConfig;
use crate::dataset::{Batch, split_multi_vector};

/// 并发写入的 worker 数量
pub const IMPORT_WORKERS: usize = 8;

/// 由行号生成对象 ID：低 64 位为大端序行号，高 64 位为 0
pub fn object_id(row: u64) -> Uuid {
    Uuid::from_u64_pair(0, row)
}

/// [`object_id`] 的逆运算
pub fn row_from_id(id: &Uuid) -> u64 {
    id.as_u64_pair().1
}

/// 一轮导入的写入参数
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// 加到行号上的 ID 偏移量
    pub id_offset: usize,
    pub tenant: Option<String>,
    /// 是否写入分类属性
    pub filters: bool,
    /// 大于 0 时按该维度把每行拆分为多向量
    pub multi_vector_dimension: usize,
    /// 每个批次在写入前被删除的概率
    pub update_percent: f64,
}

impl ImportOptions {
    pub fn new(cfg: &RunConfig, tenant: Option<String>) -> Self {
        Self {
            id_offset: cfg.id_offset,
            tenant,
            filters: cfg.filter,
            multi_vector_dimension: cfg.multi_vector_dimension,
            update_percent: 0.0,
        }
    }

    pub fn with_update_percent(self, update_percent: f64) -> Self {
        Self { update_percent, ..self }
    }

    fn ids(&self, batch: &Batch) -> Vec<Uuid> {
        batch.rows().map(|row| object_id((row + self.id_offset) as u64)).collect()
    }
}

/// 将一个批次转换为待写入的对象
pub fn build_objects(batch: Batch, options: &ImportOptions) -> Result<Vec<WriteObject>> {
    if options.filters && batch.filters.len() != batch.vectors.len() {
        bail!(
            "批次 {} 的分类标签数量 {} 与向量数量 {} 不一致",
            batch.offset,
            batch.filters.len(),
            batch.vectors.len()
        );
    }

    let ids = options.ids(&batch);
    let Batch { vectors, filters, .. } = batch;
    vectors
        .into_iter()
        .zip(ids)
        .enumerate()
        .map(|(i, (vector, id))| {
            let payload = match options.multi_vector_dimension {
                0 => Payload::Single(vector),
                n => Payload::Multi(split_multi_vector(&vector, n)?),
            };
            anyhow::Ok(WriteObject {
                id,
                payload,
                tenant: options.tenant.clone(),
                category: options.filters.then(|| filters[i]),
            })
        })
        .collect()
}

/// 启动 [`IMPORT_WORKERS`] 个 worker 消费批次并写入目标服务
///
/// 每个 worker 持有独立的连接。任意 worker 失败时立即返回错误，其余 worker 随 `JoinSet` 一起被取消。
pub async fn import<S: VectorService>(
    service: &S,
    rx: Receiver<Batch>,
    options: Arc<ImportOptions>,
    pb: ProgressBar,
) -> Result<()> {
    let mut workers = JoinSet::new();
    for worker in 0..IMPORT_WORKERS {
        let client = service.connect().await?;
        let rx = rx.clone();
        let options = options.clone();
        let pb = pb.clone();
        workers.spawn(async move {
            while let Ok(batch) = rx.recv_async().await {
                let rows = batch.len() as u64;
                let delete = options.update_percent > 0.0 && rand::rng().random_bool(options.update_percent);
                if delete {
                    debug!("worker {} 删除批次 {} 共 {} 行", worker, batch.offset, rows);
                    client.delete_objects(&options.ids(&batch), options.tenant.as_deref()).await?;
                }
                let objects = build_objects(batch, &options)?;
                client.write_objects(objects).await?;
                pb.inc(rows);
            }
            anyhow::Ok(())
        });
    }
    drop(rx);

    while let Some(result) = workers.join_next().await {
        result??;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case(0, "00000000-0000-0000-0000-000000000000")]
    #[case(1, "00000000-0000-0000-0000-000000000001")]
    #[case(255, "00000000-0000-0000-0000-0000000000ff")]
    #[case(959797, "00000000-0000-0000-0000-0000000ea535")]
    fn id_round_trip(#[case] row: u64, #[case] expected: &str) {
        let id = object_id(row);
        assert_eq!(id.to_string(), expected);
        assert_eq!(row_from_id(&id), row);
    }

    #[test]
    fn id_keeps_full_64_bits() {
        assert_eq!(row_from_id(&object_id(u64::MAX)), u64::MAX);
        assert_eq!(object_id(u64::MAX).as_u64_pair().0, 0);
    }

    fn batch() -> Batch {
        Batch {
            vectors: vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]],
            offset: 100,
            filters: vec![7, 9],
        }
    }

    #[test]
    fn objects_use_row_and_offset() {
        let options = ImportOptions { id_offset: 1000, filters: true, ..Default::default() };
        let objects = build_objects(batch(), &options).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(row_from_id(&objects[0].id), 1100);
        assert_eq!(row_from_id(&objects[1].id), 1101);
        assert_eq!(objects[1].category, Some(9));
        assert_eq!(objects[0].payload, Payload::Single(vec![1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn objects_without_filters() {
        let objects = build_objects(batch(), &ImportOptions::default()).unwrap();
        assert!(objects.iter().all(|o| o.category.is_none() && o.tenant.is_none()));
    }

    #[test]
    fn objects_split_multi_vectors() {
        let options = ImportOptions { multi_vector_dimension: 2, ..Default::default() };
        let objects = build_objects(batch(), &options).unwrap();
        assert_eq!(objects[1].payload, Payload::Multi(vec![vec![5.0, 6.0], vec![7.0, 8.0]]));

        let options = ImportOptions { multi_vector_dimension: 3, ..Default::default() };
        assert!(build_objects(batch(), &options).is_err());
    }

    #[test]
    fn objects_reject_missing_filters() {
        let options = ImportOptions { filters: true, ..Default::default() };
        let batch = Batch { filters: vec![], ..batch() };
        assert!(build_objects(batch, &options).is_err());
    }
}
