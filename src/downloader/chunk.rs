use crate::downloader::error::{DownloadError, DownloadResult};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// 分片阈值: 大于 5MB 的文件才会分片下载
pub const CHUNK_THRESHOLD: u64 = 5 * 1024 * 1024;

/// 字节范围（闭区间，与 HTTP Range 头一致）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// 范围大小（字节）
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Range 请求头的值，如 `bytes=0-5242879`
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// 等待下载
    Pending,
    /// 下载中
    InFlight,
    /// 已完成
    Complete,
    /// 失败
    Error,
}

/// 分片计划
///
/// 纯计算：根据文件大小和分片大小生成有序的字节范围列表，
/// 恰好覆盖 `[0, content_length)`，最后一个分片截断到 `content_length - 1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    ranges: Vec<ByteRange>,
    content_length: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    pub fn new(content_length: u64, chunk_size: u64) -> DownloadResult<Self> {
        if chunk_size == 0 {
            return Err(DownloadError::InvalidConfig(
                "分片大小必须大于 0".to_string(),
            ));
        }

        let ranges = Self::calculate_ranges(content_length, chunk_size);
        info!(
            "分片计划: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            content_length,
            chunk_size,
            ranges.len()
        );

        Ok(Self {
            ranges,
            content_length,
            chunk_size,
        })
    }

    fn calculate_ranges(content_length: u64, chunk_size: u64) -> Vec<ByteRange> {
        let count = content_length.div_ceil(chunk_size);
        (0..count)
            .map(|i| {
                let start = i * chunk_size;
                let end = start.saturating_add(chunk_size - 1).min(content_length - 1);
                ByteRange::new(start, end)
            })
            .collect()
    }

    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    pub fn range(&self, index: usize) -> Option<ByteRange> {
        self.ranges.get(index).copied()
    }

    pub fn chunk_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }
}

/// 分片表
///
/// 会话独占：`statuses` / `buffers` / `progress` 三个向量长度始终一致，
/// 在 [`ChunkTable::init`] 中一起设置
#[derive(Debug, Default)]
pub struct ChunkTable {
    statuses: Vec<ChunkStatus>,
    buffers: Vec<Option<Bytes>>,
    /// 每个分片当前尝试已收到的字节数（用于聚合进度，不重复计数）
    progress: Vec<u64>,
}

impl ChunkTable {
    /// 按分片数量初始化（全部为 Pending）
    pub fn init(&mut self, chunk_count: usize) {
        self.statuses = vec![ChunkStatus::Pending; chunk_count];
        self.buffers = vec![None; chunk_count];
        self.progress = vec![0; chunk_count];
    }

    pub fn clear(&mut self) {
        self.statuses.clear();
        self.buffers.clear();
        self.progress.clear();
    }

    pub fn is_planned(&self) -> bool {
        !self.statuses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn statuses(&self) -> &[ChunkStatus] {
        &self.statuses
    }

    pub fn status(&self, index: usize) -> Option<ChunkStatus> {
        self.statuses.get(index).copied()
    }

    pub fn set_status(&mut self, index: usize, status: ChunkStatus) {
        if let Some(slot) = self.statuses.get_mut(index) {
            // 已完成的分片不再回退
            if *slot != ChunkStatus::Complete {
                *slot = status;
            }
        }
    }

    /// 存储已完成分片的数据
    ///
    /// 进度计数只由进度事件推进，这里不修改
    pub fn complete(&mut self, index: usize, buffer: Bytes) {
        if index >= self.statuses.len() {
            return;
        }
        self.statuses[index] = ChunkStatus::Complete;
        self.buffers[index] = Some(buffer);
    }

    /// 记录分片累计字节数，返回相对上次记录的差值（重试时可能为负）
    pub fn record_progress(&mut self, index: usize, cumulative: u64) -> i64 {
        match self.progress.get_mut(index) {
            Some(slot) => {
                let delta = cumulative as i64 - *slot as i64;
                *slot = cumulative;
                delta
            }
            None => 0,
        }
    }

    /// 丢弃未完成分片的部分进度，返回完成分片的总字节数
    pub fn settle(&mut self) -> u64 {
        for (status, progress) in self.statuses.iter_mut().zip(self.progress.iter_mut()) {
            match *status {
                ChunkStatus::Complete => {}
                ChunkStatus::InFlight => {
                    *status = ChunkStatus::Pending;
                    *progress = 0;
                }
                _ => *progress = 0,
            }
        }
        self.completed_bytes()
    }

    /// 尚未完成的分片索引（恢复下载时只重新下载这些分片）
    pub fn incomplete_indices(&self) -> Vec<usize> {
        self.statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| **s != ChunkStatus::Complete)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn completed_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| **s == ChunkStatus::Complete)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| **s == ChunkStatus::Error)
            .count()
    }

    pub fn completed_bytes(&self) -> u64 {
        self.buffers
            .iter()
            .flatten()
            .map(|b| b.len() as u64)
            .sum()
    }

    pub fn is_completed(&self) -> bool {
        self.statuses.iter().all(|s| *s == ChunkStatus::Complete)
    }

    /// 按索引顺序拼接所有分片
    ///
    /// 与分片完成顺序无关；任何一个槽位未完成都会中止组装
    pub fn assemble(&self) -> DownloadResult<Bytes> {
        let total: usize = self.buffers.iter().flatten().map(|b| b.len()).sum();
        let mut out = BytesMut::with_capacity(total);

        for (index, buffer) in self.buffers.iter().enumerate() {
            match buffer {
                Some(data) if self.statuses[index] == ChunkStatus::Complete => {
                    out.extend_from_slice(data)
                }
                _ => return Err(DownloadError::Assembly { index }),
            }
        }

        debug!("分片组装完成: {} 个分片, {} bytes", self.buffers.len(), out.len());
        Ok(out.freeze())
    }
}
