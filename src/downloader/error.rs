//! 下载错误分类
//!
//! - 分片级错误（`TransferStatus` / `RangeMismatch` / `Network`）在线程池边界被隔离，不影响其他分片
//! - 线程池级失败（`ChunksFailed`）触发降级为整体直连下载
//! - 元数据失败（`Metadata`）对会话启动是致命的，不重试
//!
//! 暂停 / 中止不是错误，见 [`FetchOutcome`](super::pool::FetchOutcome)

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// 未输入 URL
    #[error("请输入 URL")]
    EmptyUrl,

    /// 已有活跃会话，必须先取消
    #[error("已有下载正在进行，请先取消当前下载")]
    SessionActive,

    /// 当前状态不允许此操作
    #[error("状态不允许此操作: {0}")]
    InvalidState(String),

    /// HEAD 元数据请求失败（致命，不重试）
    #[error("获取文件信息失败: {0}")]
    Metadata(String),

    /// 分片的 Range 请求返回非成功状态码
    #[error("分片 #{index} 请求失败: HTTP {status}")]
    TransferStatus { index: usize, status: u16 },

    /// 响应体长度与请求的 Range 不一致（代理忽略 Range 或响应被截断）
    #[error("分片 #{index} 大小不匹配: 期望 {expected} bytes, 实际 {actual} bytes")]
    RangeMismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },

    /// 分片网络错误（重试耗尽）
    #[error("分片 #{index} 网络错误: {source}")]
    Network {
        index: usize,
        #[source]
        source: reqwest::Error,
    },

    /// 部分分片失败，无法组装
    #[error("{failed} 个分片下载失败")]
    ChunksFailed { failed: usize },

    /// 组装时发现未完成的分片槽位（违反不变式）
    #[error("分片 #{index} 未完成，无法组装文件")]
    Assembly { index: usize },

    /// 配置非法
    #[error("配置无效: {0}")]
    InvalidConfig(String),

    /// 直连下载失败
    #[error("直连下载失败: {0}")]
    Direct(String),

    /// 导出文件失败
    #[error("保存文件失败: {0}")]
    Export(String),
}

pub type DownloadResult<T> = std::result::Result<T, DownloadError>;
