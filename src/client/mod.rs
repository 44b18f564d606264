//! 目标向量数据库的访问接口
//!
//! 编排逻辑只依赖这里的 trait，HTTP 实现见 [`WeaviateClient`]。

pub mod exposition;
mod weaviate;

use std::future::Future;

use anyhow::Result;
use serde::Serialize;
use uuid::Uuid;

pub use self::weaviate::WeaviateClient;
use crate::config::Compression;
use crate::dataset::Vector;

/// 写入或查询使用的向量
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Single(Vector),
    /// 多向量模式下一行对应的若干子向量
    Multi(Vec<Vector>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteObject {
    pub id: Uuid,
    pub payload: Payload,
    pub tenant: Option<String>,
    pub category: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub payload: Payload,
    pub limit: usize,
    pub tenant: Option<String>,
    /// 对分类属性的等值过滤
    pub category: Option<i64>,
}

/// 单次查询的结果
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// 按相似度排序的对象 ID
    Hits(Vec<Uuid>),
    /// 服务端返回了应用层错误或查询超时，该查询不计入样本
    Rejected(String),
}

/// 服务端进程的堆内存指标
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Memstats {
    pub heap_alloc_bytes: f64,
    pub heap_inuse_bytes: f64,
    pub heap_sys_bytes: f64,
}

/// 生命周期轮询使用的只读状态接口
pub trait StatusSource: Send + Sync {
    /// 所有分片是否均已就绪
    fn shards_ready(&self) -> impl Future<Output = Result<bool>> + Send;

    /// 后台索引队列的总长度
    fn queue_length(&self) -> impl Future<Output = Result<u64>> + Send;

    /// 尚未清理的墓碑数量
    fn tombstones(&self) -> impl Future<Output = Result<f64>> + Send;
}

pub trait VectorService: StatusSource + Clone + Send + Sync + 'static {
    /// 建立一个新的长连接，每个写入 worker 独占一个
    fn connect(&self) -> impl Future<Output = Result<Self>> + Send;

    /// 删除并重新创建集合
    fn recreate_schema(&self) -> impl Future<Output = Result<()>> + Send;

    fn add_tenant(&self, tenant: &str) -> impl Future<Output = Result<()>> + Send;

    fn write_objects(&self, objects: Vec<WriteObject>) -> impl Future<Output = Result<()>> + Send;

    fn delete_objects(
        &self,
        ids: &[Uuid],
        tenant: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// 调整搜索时的 ef（flat 索引调整 BQ 的 rescoreLimit）
    fn update_ef(&self, ef: usize) -> impl Future<Output = Result<()>> + Send;

    /// 对已有数据开启压缩，训练是否完成需要通过 [`StatusSource::shards_ready`] 轮询
    fn enable_compression(
        &self,
        compression: Compression,
        dimension: usize,
    ) -> impl Future<Output = Result<()>> + Send;

    fn memstats(&self) -> impl Future<Output = Result<Memstats>> + Send;

    fn search(&self, request: &SearchRequest) -> impl Future<Output = Result<QueryOutcome>> + Send;
}
