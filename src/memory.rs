use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use crate::client::{Memstats, VectorService};
use crate::report::write_json;

/// 一次内存指标采样
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryEntry {
    /// Unix 时间戳（毫秒）
    pub timestamp: u64,
    #[serde(flatten)]
    pub memstats: Memstats,
}

/// 默认的内存指标文件路径
pub fn default_output(ts: u64) -> PathBuf {
    PathBuf::from("results").join(format!("memory_metrics_{}.json", ts))
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or_default()
}

/// 在后台周期性采集服务端内存指标
///
/// 启动和停止时各采集一次，停止后将所有采样写入文件。
pub struct MemoryMonitor {
    stop: oneshot::Sender<()>,
    t: JoinHandle<Vec<MemoryEntry>>,
    output: PathBuf,
}

impl MemoryMonitor {
    pub fn start<S: VectorService>(service: S, period: Duration, output: PathBuf) -> Self {
        info!("开始采集内存指标，间隔 {:?}，输出到 {}", period, output.display());
        let (stop, mut stopped) = oneshot::channel();
        let t = tokio::spawn(async move {
            let mut entries = vec![];
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stopped => {
                        record(&service, &mut entries).await;
                        break;
                    }
                    _ = ticker.tick() => record(&service, &mut entries).await,
                }
            }
            entries
        });
        Self { stop, t, output }
    }

    /// 停止采集并写入文件，返回全部采样
    pub async fn stop(self) -> Result<Vec<MemoryEntry>> {
        let _ = self.stop.send(());
        let entries = self.t.await?;
        write_json(&self.output, &entries)?;
        info!("已写入 {} 条内存指标到 {}", entries.len(), self.output.display());
        Ok(entries)
    }
}

async fn record<S: VectorService>(service: &S, entries: &mut Vec<MemoryEntry>) {
    match service.memstats().await {
        Ok(memstats) => {
            debug!(
                "堆内存: alloc {:.1} MiB, inuse {:.1} MiB, sys {:.1} MiB",
                memstats.heap_alloc_bytes / 1048576.0,
                memstats.heap_inuse_bytes / 1048576.0,
                memstats.heap_sys_bytes / 1048576.0
            );
            entries.push(MemoryEntry { timestamp: now_millis(), memstats });
        }
        Err(e) => warn!("读取内存指标失败: {:#}", e),
    }
}
