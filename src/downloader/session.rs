//! 下载会话
//!
//! 状态机: `Idle → Initializing → Running(Direct | Chunked) → Completed`，
//! 其中 `Running ⇄ Paused`，任何非 Idle 状态都可以取消回到 Idle。
//!
//! - 分片模式：规划分片 → 线程池并发下载 → 按索引顺序组装
//! - 直连模式：整体流式下载一次
//! - 分片模式失败时降级为直连模式，直连失败时降级为透传交付
//! - 恢复时只重新下载未完成的分片，直连模式从头开始

use crate::config::DownloadConfig;
use crate::downloader::chunk::{ChunkPlan, ChunkStatus, CHUNK_THRESHOLD};
use crate::downloader::error::{DownloadError, DownloadResult};
use crate::downloader::fetcher::ChunkFetcher;
use crate::downloader::metadata::FileMetadata;
use crate::downloader::pool::{ConcurrencyPool, FetchOutcome, ProgressSink};
use crate::downloader::progress::{ProgressReporter, ProgressSnapshot};
use crate::downloader::proxy::ProxyClient;
use crate::downloader::state::{Discovery, TransferState};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 传输模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// 整体流式下载
    Direct,
    /// 分片并发下载
    Chunked,
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "mode", rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    /// 正在获取元数据
    Initializing,
    Running(TransferMode),
    Paused(TransferMode),
    Completed(TransferMode),
}

impl SessionPhase {
    /// 是否占用会话槽位（Idle 和 Completed 之外的状态）
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionPhase::Idle | SessionPhase::Completed(_))
    }

    pub fn mode(&self) -> Option<TransferMode> {
        match self {
            SessionPhase::Running(m) | SessionPhase::Paused(m) | SessionPhase::Completed(m) => {
                Some(*m)
            }
            _ => None,
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionPhase::Idle => "空闲",
            SessionPhase::Initializing => "初始化",
            SessionPhase::Running(TransferMode::Chunked) => "分片下载中",
            SessionPhase::Running(TransferMode::Direct) => "直连下载中",
            SessionPhase::Paused(_) => "已暂停",
            SessionPhase::Completed(_) => "已完成",
        };
        f.write_str(label)
    }
}

/// 交付给导出模块的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// 已组装的完整文件
    Artifact { file_name: String, bytes: Bytes },
    /// 未下载数据，交由导出模块直接从代理地址获取
    PassThrough { file_name: String, proxy_url: String },
}

impl Delivery {
    pub fn file_name(&self) -> &str {
        match self {
            Delivery::Artifact { file_name, .. } | Delivery::PassThrough { file_name, .. } => {
                file_name
            }
        }
    }
}

/// 一次 start / resume 调用的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed(Delivery),
    Paused,
    Cancelled,
}

/// 会话可观察字段的快照
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub phase: SessionPhase,
    pub url: Option<String>,
    pub metadata: Option<FileMetadata>,
    pub received_bytes: u64,
    pub chunk_statuses: Vec<ChunkStatus>,
    pub discovery: Discovery,
    pub paused: bool,
    pub in_flight: usize,
    pub has_delivery: bool,
    pub progress: ProgressSnapshot,
}

/// 下载会话
#[derive(Debug)]
pub struct DownloadSession {
    id: Uuid,
    config: DownloadConfig,
    client: ProxyClient,
    state: Arc<TransferState>,
    reporter: ProgressReporter,
    phase: Mutex<SessionPhase>,
    url: Mutex<Option<String>>,
    metadata: Mutex<Option<FileMetadata>>,
    plan: Mutex<Option<ChunkPlan>>,
    delivery: Mutex<Option<Delivery>>,
    /// 串行化 start / resume 与 cancel / reset
    run_lock: tokio::sync::Mutex<()>,
}

impl DownloadSession {
    /// 创建新会话
    pub fn new(config: DownloadConfig) -> DownloadResult<Self> {
        config
            .validate()
            .map_err(|e| DownloadError::InvalidConfig(e.to_string()))?;
        let client = ProxyClient::new(config.proxy_endpoint.clone(), config.transport)?;
        Ok(Self::with_client(config, client))
    }

    /// 使用已有的代理客户端创建会话
    pub fn with_client(config: DownloadConfig, client: ProxyClient) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            client,
            state: Arc::new(TransferState::new()),
            reporter: ProgressReporter::new(),
            phase: Mutex::new(SessionPhase::Idle),
            url: Mutex::new(None),
            metadata: Mutex::new(None),
            plan: Mutex::new(None),
            delivery: Mutex::new(None),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    pub fn metadata(&self) -> Option<FileMetadata> {
        self.metadata.lock().clone()
    }

    pub fn delivery(&self) -> Option<Delivery> {
        self.delivery.lock().clone()
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<ProgressSnapshot> {
        self.reporter.subscribe()
    }

    /// 所有可观察字段的快照
    pub fn view(&self) -> SessionView {
        SessionView {
            phase: self.phase(),
            url: self.url.lock().clone(),
            metadata: self.metadata(),
            received_bytes: self.state.received_bytes(),
            chunk_statuses: self.state.chunk_statuses(),
            discovery: self.state.discovery(),
            paused: self.state.is_paused(),
            in_flight: self.state.in_flight(),
            has_delivery: self.delivery.lock().is_some(),
            progress: self.reporter.latest(),
        }
    }

    /// 开始下载
    ///
    /// 返回时会话处于 Completed / Paused / Idle（被取消）之一
    pub async fn start(&self, url: &str) -> DownloadResult<SessionOutcome> {
        let url = url.trim();
        if url.is_empty() {
            return Err(DownloadError::EmptyUrl);
        }

        let _run = self
            .run_lock
            .try_lock()
            .map_err(|_| DownloadError::InvalidState("会话正在运行".to_string()))?;

        {
            let mut phase = self.phase.lock();
            if *phase != SessionPhase::Idle {
                return Err(DownloadError::InvalidState(format!(
                    "会话{}，无法开始新的下载",
                    *phase
                )));
            }
            *phase = SessionPhase::Initializing;
        }
        *self.url.lock() = Some(url.to_string());
        info!("[{}] 开始下载: {}", self.id, url);

        let token = self.state.child_token();
        let fetched = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(SessionOutcome::Cancelled),
            result = self.client.fetch_metadata(url) => result,
        };

        let meta = match fetched {
            Ok(meta) => meta,
            Err(e) => {
                error!("[{}] 获取文件信息失败: {}", self.id, e);
                self.clear();
                return Err(e);
            }
        };

        self.state.set_discovery(Discovery {
            server_info: Some(meta.server_info.clone()),
            category: Some(meta.category),
        });

        let mode = if self.config.use_chunking && meta.content_length > CHUNK_THRESHOLD {
            TransferMode::Chunked
        } else {
            TransferMode::Direct
        };
        info!(
            "[{}] 下载模式: {:?} (文件大小 {} bytes, {})",
            self.id,
            mode,
            meta.content_length,
            meta.category.label()
        );
        *self.metadata.lock() = Some(meta);

        self.reporter.start_clock();
        self.run(mode).await
    }

    /// 暂停下载
    ///
    /// 只在 Running 状态有效，返回是否真的暂停了
    pub fn pause(&self) -> bool {
        let mut phase = self.phase.lock();
        let SessionPhase::Running(mode) = *phase else {
            debug!("[{}] 忽略暂停请求: 当前状态 {}", self.id, *phase);
            return false;
        };

        self.state.set_paused(true);
        self.state.cancel_scope();
        self.reporter.pause_clock();
        *phase = SessionPhase::Paused(mode);
        info!("[{}] 下载已暂停", self.id);
        true
    }

    /// 恢复下载
    ///
    /// 等待被暂停的运行结束后重新开始：分片模式只下载未完成的分片，
    /// 直连模式从头开始
    pub async fn resume(&self) -> DownloadResult<SessionOutcome> {
        if !matches!(self.phase(), SessionPhase::Paused(_)) {
            return Err(DownloadError::InvalidState(format!(
                "只能从暂停状态恢复，当前状态: {}",
                self.phase()
            )));
        }

        let _run = self.run_lock.lock().await;

        let mode = match self.phase() {
            SessionPhase::Paused(mode) => mode,
            other => {
                return Err(DownloadError::InvalidState(format!(
                    "只能从暂停状态恢复，当前状态: {}",
                    other
                )))
            }
        };
        if self.state.is_cancelled() {
            return Ok(SessionOutcome::Cancelled);
        }

        self.state.renew_scope();
        self.state.set_paused(false);
        self.reporter.resume_clock();
        info!("[{}] 恢复下载", self.id);

        self.run(mode).await
    }

    /// 取消下载
    ///
    /// 中断所有传输，等待当前运行结束，然后丢弃所有数据回到 Idle
    pub async fn cancel(&self) {
        if self.phase() == SessionPhase::Idle {
            return;
        }

        info!("[{}] 取消下载", self.id);
        self.state.set_cancelled();
        self.state.cancel_scope();

        let _run = self.run_lock.lock().await;
        self.clear();
    }

    /// 重置为初始状态
    ///
    /// 运行中的会话不能重置，需要先取消
    pub fn reset(&self) -> DownloadResult<()> {
        let _run = self
            .run_lock
            .try_lock()
            .map_err(|_| DownloadError::InvalidState("会话正在运行，请先取消".to_string()))?;
        self.clear();
        Ok(())
    }

    fn clear(&self) {
        self.state.reset();
        self.reporter.reset();
        *self.url.lock() = None;
        *self.metadata.lock() = None;
        *self.plan.lock() = None;
        *self.delivery.lock() = None;
        *self.phase.lock() = SessionPhase::Idle;
        debug!("[{}] 会话已重置", self.id);
    }

    /// 进入 Running；暂停已先一步生效时保持 Paused
    fn enter_running(&self, mode: TransferMode) {
        let mut phase = self.phase.lock();
        *phase = if self.state.is_paused() {
            SessionPhase::Paused(mode)
        } else {
            SessionPhase::Running(mode)
        };
    }

    async fn run(&self, mode: TransferMode) -> DownloadResult<SessionOutcome> {
        self.enter_running(mode);

        let (mode, result) = match mode {
            TransferMode::Chunked => match self.run_chunked().await {
                Err(e) => {
                    warn!("[{}] 分片下载失败，降级为直连下载: {}", self.id, e);
                    self.drop_chunks();
                    self.enter_running(TransferMode::Direct);
                    (TransferMode::Direct, self.run_direct().await)
                }
                other => (TransferMode::Chunked, other),
            },
            TransferMode::Direct => (TransferMode::Direct, self.run_direct().await),
        };

        self.conclude(mode, result)
    }

    /// 丢弃分片计划和已下载的分片数据
    fn drop_chunks(&self) {
        *self.plan.lock() = None;
        self.state.with_chunks(|t| t.clear());
    }

    fn conclude(
        &self,
        mode: TransferMode,
        result: DownloadResult<FetchOutcome<Delivery>>,
    ) -> DownloadResult<SessionOutcome> {
        let content_length = self.content_length();

        match result {
            Ok(FetchOutcome::Done(delivery)) => {
                {
                    let mut phase = self.phase.lock();
                    self.state.set_paused(false);
                    *phase = SessionPhase::Completed(mode);
                }
                *self.delivery.lock() = Some(delivery.clone());
                let snapshot =
                    self.reporter
                        .publish(&self.state, content_length, SessionPhase::Completed(mode));
                info!(
                    "[{}] ✓ 下载完成: {} ({})",
                    self.id,
                    delivery.file_name(),
                    snapshot.summary()
                );
                Ok(SessionOutcome::Completed(delivery))
            }
            Ok(FetchOutcome::Paused) => {
                *self.phase.lock() = SessionPhase::Paused(mode);
                let snapshot =
                    self.reporter
                        .publish(&self.state, content_length, SessionPhase::Paused(mode));
                info!("[{}] 运行已停止于暂停点: {}", self.id, snapshot.summary());
                Ok(SessionOutcome::Paused)
            }
            Ok(FetchOutcome::Aborted) => {
                info!("[{}] 运行已取消", self.id);
                Ok(SessionOutcome::Cancelled)
            }
            Err(e) => {
                error!("[{}] 下载失败: {}", self.id, e);
                self.clear();
                Err(e)
            }
        }
    }

    fn content_length(&self) -> u64 {
        self.metadata
            .lock()
            .as_ref()
            .map(|m| m.content_length)
            .unwrap_or(0)
    }

    fn current_target(&self) -> DownloadResult<(String, FileMetadata)> {
        let url = self.url.lock().clone();
        let meta = self.metadata();
        match (url, meta) {
            (Some(url), Some(meta)) => Ok((url, meta)),
            _ => Err(DownloadError::InvalidState("会话尚未初始化".to_string())),
        }
    }

    fn fetcher(&self, url: &str, file_name: &str) -> ChunkFetcher {
        ChunkFetcher::new(
            self.client.clone(),
            self.state.clone(),
            url,
            file_name,
            self.config.max_retries,
        )
    }

    fn ticker(&self) -> tokio::time::Interval {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.progress_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    /// 分片模式
    async fn run_chunked(&self) -> DownloadResult<FetchOutcome<Delivery>> {
        let (url, meta) = self.current_target()?;

        let plan = {
            let mut slot = self.plan.lock();
            match slot.as_ref() {
                Some(plan) => plan.clone(),
                None => {
                    let plan =
                        ChunkPlan::new(meta.content_length, self.config.chunk_size_bytes())?;
                    self.state.with_chunks(|t| t.init(plan.chunk_count()));
                    *slot = Some(plan.clone());
                    plan
                }
            }
        };

        let indices = self.state.with_chunks(|t| t.incomplete_indices());
        let pool = ConcurrencyPool::new(self.config.concurrency);
        info!(
            "[{}] 分片下载: 共 {} 个分片, 待下载 {} 个, 并发 {}",
            self.id,
            plan.chunk_count(),
            indices.len(),
            pool.limit()
        );

        let fetcher = self.fetcher(&url, &meta.file_name);
        let factories: Vec<_> = indices
            .iter()
            .map(|&index| {
                let fetcher = fetcher.clone();
                let range = plan.ranges()[index];
                move |sink: ProgressSink| async move { fetcher.fetch(index, range, sink).await }
            })
            .collect();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let halt_state = self.state.clone();
        let run = pool.run(factories, &tx, move || halt_state.should_halt());
        tokio::pin!(run);

        let mut ticker = self.ticker();
        let report = loop {
            tokio::select! {
                biased;
                Some(ev) = rx.recv() => {
                    self.state.apply_chunk_progress(indices[ev.index], ev.task_total);
                }
                report = &mut run => break report,
                _ = ticker.tick() => {
                    self.reporter.publish(&self.state, meta.content_length, self.phase());
                }
            }
        };
        while let Ok(ev) = rx.try_recv() {
            self.state.apply_chunk_progress(indices[ev.index], ev.task_total);
        }

        if self.state.is_cancelled() {
            return Ok(FetchOutcome::Aborted);
        }

        let completed = self.state.with_chunks(|t| t.is_completed());
        if completed {
            self.state.settle();
            let bytes = self.state.with_chunks(|t| t.assemble())?;
            return Ok(FetchOutcome::Done(Delivery::Artifact {
                file_name: meta.file_name,
                bytes,
            }));
        }

        if self.state.is_paused() {
            let settled = self.state.settle();
            debug!("[{}] 暂停结算: 已完成 {} bytes", self.id, settled);
            return Ok(FetchOutcome::Paused);
        }

        let failed = report.failed_count().max(self.state.with_chunks(|t| t.failed_count()));
        Err(DownloadError::ChunksFailed {
            failed: failed.max(1),
        })
    }

    /// 直连模式
    async fn run_direct(&self) -> DownloadResult<FetchOutcome<Delivery>> {
        let (url, meta) = self.current_target()?;

        if meta.content_length == 0 {
            info!("[{}] 文件大小未知，使用透传交付", self.id);
            return Ok(FetchOutcome::Done(Delivery::PassThrough {
                proxy_url: self.client.proxy_url(&url),
                file_name: meta.file_name,
            }));
        }

        self.state.set_received_bytes(0);
        let fetcher = self.fetcher(&url, &meta.file_name);
        let fetch = fetcher.fetch_whole(meta.content_length);
        tokio::pin!(fetch);

        let mut ticker = self.ticker();
        let result = loop {
            tokio::select! {
                biased;
                result = &mut fetch => break result,
                _ = ticker.tick() => {
                    self.reporter.publish(&self.state, meta.content_length, self.phase());
                }
            }
        };

        match result {
            Ok(FetchOutcome::Done(bytes)) => Ok(FetchOutcome::Done(Delivery::Artifact {
                file_name: meta.file_name,
                bytes,
            })),
            Ok(FetchOutcome::Paused) => Ok(FetchOutcome::Paused),
            Ok(FetchOutcome::Aborted) => Ok(FetchOutcome::Aborted),
            Err(e) => {
                warn!("[{}] {}，改为透传交付", self.id, e);
                Ok(FetchOutcome::Done(Delivery::PassThrough {
                    proxy_url: self.client.proxy_url(&url),
                    file_name: meta.file_name,
                }))
            }
        }
    }
}
