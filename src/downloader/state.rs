//! 会话共享状态
//!
//! 会话与线程池 / 分片下载器共享的唯一可变状态：
//! - `paused` / `cancelled`: 每个挂起点都会检查的闸门
//! - `received_bytes`: 全局已接收字节数
//! - `chunks`: 分片表（各分片任务只写自己的槽位）
//! - `scope`: 会话级取消作用域，每个分片任务从中派生子令牌；
//!   暂停时整体取消，恢复时替换为新的作用域

use crate::downloader::chunk::{ChunkStatus, ChunkTable};
use crate::downloader::metadata::{self, FileCategory};
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// 首次成功响应时发现的共享信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    pub server_info: Option<String>,
    pub category: Option<FileCategory>,
}

#[derive(Debug)]
pub struct TransferState {
    paused: AtomicBool,
    cancelled: AtomicBool,
    received_bytes: AtomicU64,
    in_flight: AtomicUsize,
    chunks: Mutex<ChunkTable>,
    discovery: Mutex<Discovery>,
    scope: Mutex<CancellationToken>,
}

impl Default for TransferState {
    fn default() -> Self {
        Self {
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            received_bytes: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            chunks: Mutex::new(ChunkTable::default()),
            discovery: Mutex::new(Discovery::default()),
            scope: Mutex::new(CancellationToken::new()),
        }
    }
}

impl TransferState {
    pub fn new() -> Self {
        Self::default()
    }

    // ---------- 闸门 ----------

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 暂停或取消时都应停止调度新任务
    pub fn should_halt(&self) -> bool {
        self.is_paused() || self.is_cancelled()
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn set_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    // ---------- 取消作用域 ----------

    /// 为一次传输派生子令牌
    pub fn child_token(&self) -> CancellationToken {
        self.scope.lock().child_token()
    }

    /// 广播取消给所有进行中的传输
    pub fn cancel_scope(&self) {
        self.scope.lock().cancel();
    }

    /// 恢复时替换为新的作用域（旧作用域保持已取消状态）
    pub fn renew_scope(&self) {
        *self.scope.lock() = CancellationToken::new();
    }

    // ---------- 进行中的传输 ----------

    /// 登记一次进行中的传输，返回的守卫在 drop 时注销
    pub fn enter_transfer(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { state: self }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    // ---------- 字节计数 ----------

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::SeqCst)
    }

    pub fn set_received_bytes(&self, bytes: u64) {
        self.received_bytes.store(bytes, Ordering::SeqCst);
    }

    pub fn add_received_bytes(&self, bytes: u64) {
        self.received_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    /// 应用某个分片的累计进度（差值可能为负，重试时回退）
    pub fn apply_chunk_progress(&self, index: usize, cumulative: u64) {
        let delta = self.chunks.lock().record_progress(index, cumulative);
        if delta >= 0 {
            self.received_bytes.fetch_add(delta as u64, Ordering::SeqCst);
        } else {
            let back = delta.unsigned_abs();
            let _ = self
                .received_bytes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    Some(v.saturating_sub(back))
                });
        }
    }

    /// 静止点结算：丢弃未完成分片的部分字节，使计数等于已完成分片的总大小
    pub fn settle(&self) -> u64 {
        let settled = self.chunks.lock().settle();
        self.set_received_bytes(settled);
        settled
    }

    // ---------- 分片表 ----------

    pub fn with_chunks<R>(&self, f: impl FnOnce(&mut ChunkTable) -> R) -> R {
        f(&mut self.chunks.lock())
    }

    pub fn set_chunk_status(&self, index: usize, status: ChunkStatus) {
        self.chunks.lock().set_status(index, status);
    }

    pub fn complete_chunk(&self, index: usize, buffer: Bytes) {
        self.chunks.lock().complete(index, buffer);
    }

    pub fn chunk_statuses(&self) -> Vec<ChunkStatus> {
        self.chunks.lock().statuses().to_vec()
    }

    /// (已完成分片数, 总分片数)
    pub fn chunk_counts(&self) -> (usize, usize) {
        let table = self.chunks.lock();
        (table.completed_count(), table.len())
    }

    // ---------- 发现信息 ----------

    pub fn discovery(&self) -> Discovery {
        self.discovery.lock().clone()
    }

    pub fn set_discovery(&self, discovery: Discovery) {
        *self.discovery.lock() = discovery;
    }

    /// 首次成功响应时记录服务器标识和文件类别（只写一次）
    pub fn discover(&self, file_name: &str, headers: &HeaderMap) {
        let mut d = self.discovery.lock();
        if d.server_info.is_none() {
            d.server_info = Some(
                metadata::server_info(headers)
                    .unwrap_or_else(|| metadata::DEFAULT_SERVER_LABEL.to_string()),
            );
        }
        if d.category.is_none() {
            let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
            d.category = Some(FileCategory::classify(file_name, content_type));
        }
    }

    /// 重置为初始状态（取消后调用）
    pub fn reset(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
        self.received_bytes.store(0, Ordering::SeqCst);
        self.chunks.lock().clear();
        *self.discovery.lock() = Discovery::default();
        self.renew_scope();
    }
}

/// 进行中传输的登记守卫
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    state: &'a TransferState,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
