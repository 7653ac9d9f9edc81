// 配置管理模块

pub mod network_tier;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

pub use network_tier::{NetworkTier, TierRecommendedConfig};

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 20MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    20 * 1024 * 1024 // 20MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 传输协议偏好（透传给代理的 `http3` 参数）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    #[default]
    Http3,
    Http2,
}

impl TransportPreference {
    pub fn is_http3(&self) -> bool {
        matches!(self, TransportPreference::Http3)
    }
}

/// 下载配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 代理端点，所有请求都通过 `<endpoint>?url=...&http3=...` 转发
    #[serde(default = "default_proxy_endpoint")]
    pub proxy_endpoint: String,
    /// 是否启用分片下载
    #[serde(default = "default_use_chunking")]
    pub use_chunking: bool,
    /// 分片大小 (MB)
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    /// 同时下载的分片数
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// 传输协议偏好
    #[serde(default)]
    pub transport: TransportPreference,
    /// 分片网络错误的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 进度采样间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 输出目录
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_proxy_endpoint() -> String {
    "http://127.0.0.1:8080/proxy".to_string()
}

fn default_use_chunking() -> bool {
    true
}

/// 分片大小上限 (MB)，整个分片会缓存在内存中
pub const MAX_CHUNK_SIZE_MB: u64 = 1024;

fn default_chunk_size_mb() -> u64 {
    5
}

fn default_concurrency() -> usize {
    3
}

fn default_max_retries() -> u32 {
    2
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("downloads")
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            proxy_endpoint: default_proxy_endpoint(),
            use_chunking: default_use_chunking(),
            chunk_size_mb: default_chunk_size_mb(),
            concurrency: default_concurrency(),
            transport: TransportPreference::default(),
            max_retries: default_max_retries(),
            progress_interval_ms: default_progress_interval_ms(),
            output_dir: default_output_dir(),
        }
    }
}

impl DownloadConfig {
    /// 分片大小（字节）
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb.saturating_mul(1024 * 1024)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_mb == 0 {
            anyhow::bail!("分片大小必须大于 0");
        }
        if self.chunk_size_mb > MAX_CHUNK_SIZE_MB {
            anyhow::bail!(
                "分片大小不能超过 {}MB: {}MB",
                MAX_CHUNK_SIZE_MB,
                self.chunk_size_mb
            );
        }
        if self.concurrency == 0 {
            anyhow::bail!("并发数必须大于 0");
        }

        let endpoint = reqwest::Url::parse(&self.proxy_endpoint)
            .with_context(|| format!("代理地址无效: {}", self.proxy_endpoint))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            anyhow::bail!("代理地址必须是 http 或 https: {}", self.proxy_endpoint);
        }

        Ok(())
    }

    /// 根据网络档位获取推荐配置
    pub fn recommended_for_tier(tier: NetworkTier) -> TierRecommendedConfig {
        tier.recommended()
    }

    /// 应用网络档位的推荐配置
    pub fn apply_tier(&mut self, tier: NetworkTier) {
        let recommended = Self::recommended_for_tier(tier);
        self.use_chunking = recommended.use_chunking;
        self.chunk_size_mb = recommended.chunk_size_mb;
        self.concurrency = recommended.concurrency;
        tracing::info!(
            "应用网络档位 {:?}: 分片={}, 分片大小={}MB, 并发={}",
            tier,
            self.use_chunking,
            self.chunk_size_mb,
            self.concurrency
        );
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .download
            .validate()
            .context("配置文件中的下载配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.download
            .validate()
            .context("保存配置失败：下载配置无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.download.use_chunking);
        assert_eq!(config.download.chunk_size_mb, 5);
        assert_eq!(config.download.concurrency, 3);
        assert_eq!(config.download.transport, TransportPreference::Http3);
        assert_eq!(config.download.max_retries, 2);
        assert_eq!(config.download.progress_interval_ms, 500);
        assert_eq!(config.download.chunk_size_bytes(), 5 * 1024 * 1024);
        assert!(config.download.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.download.concurrency = 6;
        config.download.transport = TransportPreference::Http2;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_load_or_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("app.toml");
        let path = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path).await;
        assert_eq!(config, AppConfig::default());
        assert!(std::path::Path::new(path).exists());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [download]
            proxy_endpoint = "https://proxy.example.com/proxy"
            transport = "http2"
            "#,
        )
        .unwrap();

        assert_eq!(config.download.proxy_endpoint, "https://proxy.example.com/proxy");
        assert_eq!(config.download.transport, TransportPreference::Http2);
        assert_eq!(config.download.chunk_size_mb, 5);
        assert_eq!(config.log, LogConfig::default());
    }

    #[test]
    fn test_config_validation() {
        let mut config = DownloadConfig::default();

        config.chunk_size_mb = 0;
        assert!(config.validate().is_err());

        config.chunk_size_mb = u64::MAX;
        assert_eq!(config.chunk_size_bytes(), u64::MAX);
        assert!(config.validate().is_err());

        config.chunk_size_mb = MAX_CHUNK_SIZE_MB;
        assert!(config.validate().is_ok());

        config.chunk_size_mb = 5;
        config.concurrency = 0;
        assert!(config.validate().is_err());

        config.concurrency = 3;
        config.proxy_endpoint = "not a url".to_string();
        assert!(config.validate().is_err());

        config.proxy_endpoint = "ftp://host/proxy".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_tier() {
        let mut config = DownloadConfig::default();
        config.apply_tier(NetworkTier::VeryFast);
        assert_eq!(config.chunk_size_mb, 20);
        assert_eq!(config.concurrency, 6);
        assert!(config.use_chunking);

        config.apply_tier(NetworkTier::TooSlow);
        assert!(!config.use_chunking);
    }

    #[test]
    fn test_transport_serialization() {
        assert!(TransportPreference::Http3.is_http3());
        assert!(!TransportPreference::Http2.is_http3());
        let json = serde_json::to_string(&TransportPreference::Http2).unwrap();
        assert_eq!(json, "\"http2\"");
    }
}
