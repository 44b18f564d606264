//! 导入与索引状态的生命周期编排
//!
//! 每个阶段之间的等待都通过 [`Poller`] 完成，轮询超过上限视为致命错误，
//! 轮询过程中的读取错误只记录警告并在下一次重试。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use indicatif::ProgressBar;
use log::{debug, info, warn};
use tokio::time::sleep;

use crate::client::{StatusSource, VectorService};
use crate::config::{Compression, RunConfig};
use crate::dataset::{Dataset, train_range};
use crate::ingest::{self, ImportOptions, object_id};
use crate::loader::task_stream;
use crate::utils::pb_style;

/// 队列长度低于该值即认为异步索引已追上
pub const QUEUE_THRESHOLD: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    SchemaReady,
    BulkLoading,
    TrainingSubsetLoaded,
    CompressionEnabling,
    CompressionReady,
    RemainderLoading,
    ImportComplete,
    QueueDrained,
    DeleteRange,
    Reloading,
    TombstonesDrained,
    QueryReady,
}

impl ImportState {
    pub fn can_advance(self, next: ImportState) -> bool {
        use ImportState::*;
        matches!(
            (self, next),
            (SchemaReady, BulkLoading)
                | (BulkLoading, ImportComplete)
                | (BulkLoading, TrainingSubsetLoaded)
                | (TrainingSubsetLoaded, CompressionEnabling)
                | (CompressionEnabling, CompressionReady)
                | (CompressionReady, RemainderLoading)
                | (RemainderLoading, ImportComplete)
                // 多租户时依次导入每个租户
                | (ImportComplete, BulkLoading)
                | (ImportComplete, QueueDrained)
                | (QueueDrained, QueryReady)
                | (QueryReady, DeleteRange)
                // 随机更新模式在导入过程中删除，没有单独的删除阶段
                | (QueryReady, Reloading)
                | (DeleteRange, Reloading)
                | (Reloading, TombstonesDrained)
                | (TombstonesDrained, QueryReady)
        )
    }
}

/// 带总时长上限的轮询
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    pub name: &'static str,
    pub interval: Duration,
    pub ceiling: Duration,
}

impl Poller {
    pub const fn new(name: &'static str, interval: Duration, ceiling: Duration) -> Self {
        Self { name, interval, ceiling }
    }

    /// 反复调用 `check` 直到返回 `true`
    pub async fn wait_for<F, Fut>(&self, mut check: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let start = Instant::now();
        loop {
            match check().await {
                Ok(true) => {
                    debug!("{} 完成，耗时 {:?}", self.name, start.elapsed());
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => warn!("{}: 读取状态失败，稍后重试: {:#}", self.name, e),
            }
            if start.elapsed() >= self.ceiling {
                bail!("{} 超过 {:?} 仍未完成", self.name, self.ceiling);
            }
            sleep(self.interval).await;
        }
    }
}

/// 各阶段使用的轮询参数
#[derive(Debug, Clone, Copy)]
pub struct Pollers {
    pub compression: Poller,
    pub queue: Poller,
    pub tombstones: Poller,
}

impl Default for Pollers {
    fn default() -> Self {
        Self {
            compression: Poller::new("等待压缩训练", Duration::from_secs(3), Duration::from_secs(50 * 60)),
            queue: Poller::new("等待索引队列", Duration::from_secs(2), Duration::from_secs(4 * 3600)),
            tombstones: Poller::new("等待墓碑清理", Duration::from_secs(10), Duration::from_secs(4 * 3600)),
        }
    }
}

pub async fn wait_shards_ready<S: StatusSource>(source: &S, poller: &Poller) -> Result<()> {
    poller.wait_for(|| source.shards_ready()).await
}

pub async fn wait_queue_drained<S: StatusSource>(source: &S, poller: &Poller, threshold: u64) -> Result<()> {
    poller
        .wait_for(|| async move {
            let length = source.queue_length().await?;
            debug!("索引队列长度: {}", length);
            anyhow::Ok(length < threshold)
        })
        .await
}

pub async fn wait_tombstones_drained<S: StatusSource>(source: &S, poller: &Poller) -> Result<()> {
    poller
        .wait_for(|| async move {
            let tombstones = source.tombstones().await?;
            debug!("剩余墓碑数量: {}", tombstones);
            anyhow::Ok(tombstones <= 0.0)
        })
        .await
}

/// 按状态机推进导入、压缩、更新各个阶段
pub struct Orchestrator<S> {
    service: S,
    dataset: Arc<dyn Dataset>,
    cfg: Arc<RunConfig>,
    pollers: Pollers,
    state: ImportState,
}

impl<S: VectorService> Orchestrator<S> {
    pub fn new(service: S, dataset: Arc<dyn Dataset>, cfg: Arc<RunConfig>) -> Self {
        Self { service, dataset, cfg, pollers: Pollers::default(), state: ImportState::SchemaReady }
    }

    pub fn with_pollers(self, pollers: Pollers) -> Self {
        Self { pollers, ..self }
    }

    pub fn state(&self) -> ImportState {
        self.state
    }

    fn advance(&mut self, next: ImportState) -> Result<()> {
        if !self.state.can_advance(next) {
            bail!("无效的状态转换: {:?} -> {:?}", self.state, next);
        }
        debug!("状态: {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// 租户列表，未开启多租户时只有一个 `None`
    fn tenants(&self) -> Vec<Option<String>> {
        match self.cfg.num_tenants {
            0 => vec![None],
            n => (0..n).map(|i| Some(i.to_string())).collect(),
        }
    }

    /// 读取 `[start, start + max_rows)` 并写入目标服务，返回写入的行数
    pub async fn load_rows(&self, start: usize, max_rows: usize, options: ImportOptions) -> Result<usize> {
        let total = train_range(self.dataset.train_rows(), start, max_rows).len();
        let pb = ProgressBar::new(total as u64).with_style(pb_style());

        let (t, rx) = task_stream(self.dataset.clone(), self.cfg.batch_size, start, max_rows);
        ingest::import(&self.service, rx, Arc::new(options), pb.clone()).await?;
        let loaded = t.await??;

        pb.finish_and_clear();
        Ok(loaded)
    }

    /// 导入完整的训练集，直到可以开始查询，返回导入耗时
    pub async fn import(&mut self) -> Result<Duration> {
        let start = Instant::now();
        for (i, tenant) in self.tenants().into_iter().enumerate() {
            if let Some(tenant) = &tenant {
                self.service.add_tenant(tenant).await?;
                info!("导入租户 {}", tenant);
            }
            self.import_partition(tenant, self.cfg.staged_compression(), i == 0).await?;
        }
        let took = start.elapsed();
        info!("导入完成，耗时 {:?}", took);

        self.drain_queue().await?;
        self.advance(ImportState::QueryReady)?;
        Ok(took)
    }

    /// 导入一个租户的数据
    ///
    /// 分阶段压缩时每个租户都先导入训练子集并等待分片就绪，
    /// 压缩配置属于集合级别，只在 `first` 为真时写入一次。
    async fn import_partition(
        &mut self,
        tenant: Option<String>,
        staged: Option<Compression>,
        first: bool,
    ) -> Result<()> {
        self.advance(ImportState::BulkLoading)?;
        let options = ImportOptions::new(&self.cfg, tenant);

        let Some(compression) = staged else {
            let loaded = self.load_rows(0, 0, options).await?;
            info!("已导入 {} 行", loaded);
            return self.advance(ImportState::ImportComplete);
        };

        let loaded = self.load_rows(0, self.cfg.training_limit, options.clone()).await?;
        info!("已导入 {} 行训练数据，准备开启 {} 压缩", loaded, compression);
        self.advance(ImportState::TrainingSubsetLoaded)?;

        self.advance(ImportState::CompressionEnabling)?;
        if first {
            self.service.enable_compression(compression, self.dataset.dimension()).await?;
        }
        wait_shards_ready(&self.service, &self.pollers.compression).await?;
        self.advance(ImportState::CompressionReady)?;

        self.advance(ImportState::RemainderLoading)?;
        if self.cfg.training_limit < self.dataset.train_rows() {
            let loaded = self.load_rows(self.cfg.training_limit, 0, options).await?;
            info!("已导入剩余的 {} 行", loaded);
        }
        self.advance(ImportState::ImportComplete)
    }

    async fn drain_queue(&mut self) -> Result<()> {
        match self.cfg.skip_async_ready {
            true => info!("跳过等待异步索引"),
            false => wait_queue_drained(&self.service, &self.pollers.queue, QUEUE_THRESHOLD).await?,
        }
        self.advance(ImportState::QueueDrained)
    }

    /// 执行一轮更新：删除并重新导入部分数据，等待墓碑清理完成
    pub async fn update(&mut self) -> Result<()> {
        let percentage = self.cfg.update_percentage;
        let tenants = self.tenants();

        if self.cfg.update_randomized {
            self.advance(ImportState::Reloading)?;
            for tenant in tenants {
                let options = ImportOptions::new(&self.cfg, tenant).with_update_percent(percentage);
                self.load_rows(0, 0, options).await?;
            }
        } else {
            let rows = (self.dataset.train_rows() as f64 * percentage).floor() as usize;
            self.advance(ImportState::DeleteRange)?;
            let ids: Vec<_> = (0..rows).map(|row| object_id((row + self.cfg.id_offset) as u64)).collect();
            for tenant in &tenants {
                self.service.delete_objects(&ids, tenant.as_deref()).await?;
            }
            info!("已删除 {} 行", rows);

            self.advance(ImportState::Reloading)?;
            if rows > 0 {
                for tenant in tenants {
                    self.load_rows(0, rows, ImportOptions::new(&self.cfg, tenant)).await?;
                }
            }
        }

        match self.cfg.skip_tombstones_empty {
            true => info!("跳过等待墓碑清理"),
            false => wait_tombstones_drained(&self.service, &self.pollers.tombstones).await?,
        }
        self.advance(ImportState::TombstonesDrained)?;
        self.advance(ImportState::QueryReady)
    }
}
