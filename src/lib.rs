// Chunk Downloader Library
// 通过代理分片并发下载的核心库

// 配置管理模块
pub mod config;

// 下载引擎模块
pub mod downloader;

// 日志模块
pub mod logging;

// 导出常用类型
pub use config::{AppConfig, DownloadConfig, TransportPreference};
pub use downloader::{
    Delivery, DownloadError, DownloadManager, DownloadSession, SessionOutcome, SessionPhase,
};
