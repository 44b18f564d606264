use std::ops::Range;
use std::sync::Arc;

use anyhow::{Result, bail};
use flume::Receiver;
use log::{debug, info};
use tokio::task::{JoinHandle, spawn_blocking};

use crate::dataset::{Batch, Dataset, train_range};

/// 加载器与写入 worker 之间的通道容量（以批次计）
pub const CHANNEL_CAPACITY: usize = 10;

/// 每读取多少行打印一次进度日志
const LOG_EVERY_ROWS: usize = 10000;

/// 将行号范围切分为长度为 `batch_size` 的窗口，最后一个窗口可能更短
pub fn windows(range: Range<usize>, batch_size: usize) -> impl Iterator<Item = Range<usize>> + Send {
    let end = range.end;
    let step = batch_size.max(1);
    range.step_by(step).map(move |start| start..(start + step).min(end))
}

/// 在阻塞线程中流式读取训练集，并通过有界通道发送给下游
///
/// 读取结束后发送端被丢弃，通道随之关闭，这是下游唯一的结束信号。
/// 任务返回实际发送的行数，读取失败时返回错误。
pub fn task_stream(
    dataset: Arc<dyn Dataset>,
    batch_size: usize,
    start: usize,
    max_rows: usize,
) -> (JoinHandle<Result<usize>>, Receiver<Batch>) {
    let (tx, rx) = flume::bounded(CHANNEL_CAPACITY);
    let t = spawn_blocking(move || {
        let total = train_range(dataset.train_rows(), start, max_rows).len();
        debug!("开始读取训练集: 起始行 {}, 共 {} 行", start, total);

        let mut sent = 0;
        for batch in dataset.stream_train(batch_size, start, max_rows)? {
            let batch = batch?;
            let rows = batch.len();
            if tx.send(batch).is_err() {
                bail!("写入 worker 已全部退出，停止读取");
            }
            if (sent + rows) / LOG_EVERY_ROWS > sent / LOG_EVERY_ROWS {
                info!("已读取 {}/{} 行", sent + rows, total);
            }
            sent += rows;
        }

        debug!("训练集读取完成，共 {} 行", sent);
        Ok(sent)
    });
    (t, rx)
}
