use crate::config::DownloadConfig;
use crate::downloader::error::{DownloadError, DownloadResult};
use crate::downloader::session::{DownloadSession, SessionOutcome};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// 下载管理器
///
/// 进程内唯一的会话槽位：同一时间只允许一个活跃会话，
/// 开始新的下载前必须先取消当前会话（空闲或已完成的会话会被直接替换）
#[derive(Debug)]
pub struct DownloadManager {
    /// 新会话使用的配置
    config: Arc<RwLock<DownloadConfig>>,
    /// 当前会话
    slot: Arc<RwLock<Option<Arc<DownloadSession>>>>,
}

impl DownloadManager {
    /// 创建新的下载管理器
    pub fn new(config: DownloadConfig) -> DownloadResult<Self> {
        config
            .validate()
            .map_err(|e| DownloadError::InvalidConfig(e.to_string()))?;

        info!(
            "创建下载管理器: 代理={}, 分片={}, 分片大小={}MB, 并发={}",
            config.proxy_endpoint, config.use_chunking, config.chunk_size_mb, config.concurrency
        );

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            slot: Arc::new(RwLock::new(None)),
        })
    }

    pub async fn config(&self) -> DownloadConfig {
        self.config.read().await.clone()
    }

    /// 更新配置（只影响之后创建的会话）
    pub async fn update_config(&self, config: DownloadConfig) -> DownloadResult<()> {
        config
            .validate()
            .map_err(|e| DownloadError::InvalidConfig(e.to_string()))?;
        *self.config.write().await = config;
        Ok(())
    }

    /// 占用会话槽位，返回新创建的会话
    ///
    /// 槽位中的会话仍在进行（初始化、下载中或已暂停）时返回 `SessionActive`
    pub async fn begin(&self) -> DownloadResult<Arc<DownloadSession>> {
        let mut slot = self.slot.write().await;

        if let Some(current) = slot.as_ref() {
            if current.phase().is_active() {
                warn!("拒绝新会话: 会话 {} 仍在进行", current.id());
                return Err(DownloadError::SessionActive);
            }
        }

        let config = self.config.read().await.clone();
        let session = Arc::new(DownloadSession::new(config)?);
        info!("创建下载会话: {}", session.id());
        *slot = Some(session.clone());
        Ok(session)
    }

    /// 创建会话并开始下载
    ///
    /// 元数据获取失败时释放槽位
    pub async fn start(&self, url: &str) -> DownloadResult<(Arc<DownloadSession>, SessionOutcome)> {
        if url.trim().is_empty() {
            return Err(DownloadError::EmptyUrl);
        }

        let session = self.begin().await?;
        match session.start(url).await {
            Ok(outcome) => {
                if outcome == SessionOutcome::Cancelled {
                    self.release(&session).await;
                }
                Ok((session, outcome))
            }
            Err(e) => {
                self.release(&session).await;
                Err(e)
            }
        }
    }

    /// 当前会话
    pub async fn active(&self) -> Option<Arc<DownloadSession>> {
        self.slot.read().await.clone()
    }

    /// 暂停当前会话
    pub async fn pause_active(&self) -> bool {
        match self.active().await {
            Some(session) => session.pause(),
            None => false,
        }
    }

    /// 恢复当前会话
    pub async fn resume_active(&self) -> DownloadResult<SessionOutcome> {
        let session = self
            .active()
            .await
            .ok_or_else(|| DownloadError::InvalidState("没有可恢复的会话".to_string()))?;
        session.resume().await
    }

    /// 取消当前会话并释放槽位
    pub async fn cancel_active(&self) {
        let Some(session) = self.active().await else {
            return;
        };
        session.cancel().await;
        self.release(&session).await;
    }

    /// 只释放仍是同一个会话的槽位
    async fn release(&self, session: &Arc<DownloadSession>) {
        let mut slot = self.slot.write().await;
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *slot = None;
            info!("释放会话槽位: {}", session.id());
        }
    }
}
