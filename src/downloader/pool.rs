//! 有界并发任务池
//!
//! 从有序的任务队列中取任务，保持最多 `limit` 个任务同时进行：
//! 任意一个任务结束（成功、失败或哨兵结果）后立即补上下一个未启动的任务，
//! 而不是"启动 L 个、全部等完、再启动 L 个"的批次屏障，
//! 这样分片大小或网络状况不均时并发窗口也始终是满的。
//!
//! - 结果按原始任务索引排列，与完成顺序无关
//! - 单个任务失败在池边界被捕获并记录，不影响其他任务
//! - 暂停后不再补充新任务，但会等待已派发的任务自行结束
//! - 所有任务的进度汇聚到同一个通道

use futures::stream::{FuturesUnordered, StreamExt};
use std::fmt::Display;
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 单个任务的结果
///
/// 暂停 / 中止是哨兵结果，既不是成功也不是失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome<T> {
    Done(T),
    Paused,
    Aborted,
}

/// 汇聚后的进度事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolProgress {
    /// 本次新收到的字节数
    pub bytes: u64,
    /// 任务索引
    pub index: usize,
    /// 该任务当前尝试的累计字节数
    pub task_total: u64,
}

/// 单个任务的进度上报端
#[derive(Debug, Clone)]
pub struct ProgressSink {
    index: usize,
    tx: mpsc::UnboundedSender<PoolProgress>,
}

impl ProgressSink {
    pub fn new(index: usize, tx: mpsc::UnboundedSender<PoolProgress>) -> Self {
        Self { index, tx }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn report(&self, bytes: u64, task_total: u64) {
        // 接收端已关闭说明会话不再关心进度
        let _ = self.tx.send(PoolProgress {
            bytes,
            index: self.index,
            task_total,
        });
    }
}

/// 每个槽位的最终状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotResult<T> {
    /// 暂停后未被调度
    NotStarted,
    Done(T),
    /// 应用层失败（已记录日志）
    Failed(String),
    Paused,
    Aborted,
}

/// 线程池运行报告
#[derive(Debug)]
pub struct PoolReport<T> {
    slots: Vec<SlotResult<T>>,
}

impl<T> PoolReport<T> {
    pub fn slots(&self) -> &[SlotResult<T>] {
        &self.slots
    }

    pub fn failed_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, SlotResult::Failed(_)))
            .count()
    }

    /// 因暂停 / 中止而没有结果的槽位数
    pub fn halted_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| {
                matches!(
                    s,
                    SlotResult::NotStarted | SlotResult::Paused | SlotResult::Aborted
                )
            })
            .count()
    }

    pub fn all_done(&self) -> bool {
        self.slots.iter().all(|s| matches!(s, SlotResult::Done(_)))
    }

    /// 按原始顺序返回成功的结果（过滤失败和哨兵）
    pub fn completed(self) -> Vec<T> {
        self.slots
            .into_iter()
            .filter_map(|s| match s {
                SlotResult::Done(v) => Some(v),
                _ => None,
            })
            .collect()
    }
}

/// 有界并发任务池
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyPool {
    limit: usize,
}

impl ConcurrencyPool {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 运行所有任务
    ///
    /// # 参数
    /// * `factories` - 有序的任务工厂，每个工厂接收自己的进度上报端
    /// * `progress` - 汇聚进度的通道
    /// * `halt` - 返回 true 时停止补充新任务（暂停 / 取消）
    pub async fn run<T, E, F, Fut>(
        &self,
        factories: Vec<F>,
        progress: &mpsc::UnboundedSender<PoolProgress>,
        halt: impl Fn() -> bool,
    ) -> PoolReport<T>
    where
        F: FnOnce(ProgressSink) -> Fut,
        Fut: Future<Output = Result<FetchOutcome<T>, E>>,
        E: Display,
    {
        let total = factories.len();
        let mut slots: Vec<SlotResult<T>> = (0..total).map(|_| SlotResult::NotStarted).collect();
        if total == 0 {
            return PoolReport { slots };
        }

        let window = self.limit.min(total);
        debug!("任务池启动: {} 个任务, 并发窗口 {}", total, window);

        let launch = |index: usize, factory: F| {
            let sink = ProgressSink::new(index, progress.clone());
            async move { (index, factory(sink).await) }
        };

        let mut backlog = factories.into_iter().enumerate();
        let mut executing = FuturesUnordered::new();
        for (index, factory) in backlog.by_ref().take(window) {
            executing.push(launch(index, factory));
        }

        while let Some((index, result)) = executing.next().await {
            slots[index] = match result {
                Ok(FetchOutcome::Done(value)) => SlotResult::Done(value),
                Ok(FetchOutcome::Paused) => SlotResult::Paused,
                Ok(FetchOutcome::Aborted) => SlotResult::Aborted,
                Err(e) => {
                    warn!("任务 #{} 失败: {}", index, e);
                    SlotResult::Failed(e.to_string())
                }
            };

            if halt() {
                continue;
            }

            if let Some((next, factory)) = backlog.next() {
                executing.push(launch(next, factory));
            }
        }

        let report = PoolReport { slots };
        debug!(
            "任务池结束: 失败 {}, 未完成 {}",
            report.failed_count(),
            report.halted_count()
        );
        report
    }
}
