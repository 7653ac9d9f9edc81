//! 代理端点客户端
//!
//! 所有请求都通过 `<proxy>?url=<encoded-url>&http3=<bool>` 转发，
//! 代理负责实际获取远端资源、支持 Range 请求和协议协商

use crate::config::TransportPreference;
use crate::downloader::chunk::ByteRange;
use crate::downloader::error::{DownloadError, DownloadResult};
use crate::downloader::metadata::FileMetadata;
use reqwest::header::RANGE;
use reqwest::{Client, Response};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 探测请求大小: 256KB
pub const PROBE_SIZE: u64 = 256 * 1024;

/// 代理客户端
#[derive(Debug, Clone)]
pub struct ProxyClient {
    /// HTTP 客户端（所有分片复用同一个连接池）
    client: Client,
    /// 代理端点，如 `http://127.0.0.1:8080/proxy`
    endpoint: String,
    /// 传输协议偏好（透传给代理）
    transport: TransportPreference,
}

impl ProxyClient {
    /// 创建新的代理客户端
    pub fn new(endpoint: impl Into<String>, transport: TransportPreference) -> DownloadResult<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| DownloadError::InvalidConfig(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self::with_client(client, endpoint, transport))
    }

    /// 使用已有的 HTTP 客户端
    pub fn with_client(
        client: Client,
        endpoint: impl Into<String>,
        transport: TransportPreference,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            transport,
        }
    }

    /// 构造代理 URL
    pub fn proxy_url(&self, target_url: &str) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{}{}url={}&http3={}",
            self.endpoint,
            separator,
            urlencoding::encode(target_url),
            self.transport.is_http3()
        )
    }

    /// 通过 HEAD 请求获取文件元数据
    ///
    /// 任何失败（网络错误或非成功状态码）都是致命的，不重试
    pub async fn fetch_metadata(&self, target_url: &str) -> DownloadResult<FileMetadata> {
        let proxy_url = self.proxy_url(target_url);
        debug!("HEAD {}", proxy_url);

        let resp = self
            .client
            .head(&proxy_url)
            .send()
            .await
            .map_err(|e| DownloadError::Metadata(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(DownloadError::Metadata(format!("HTTP {}", resp.status())));
        }

        let meta = FileMetadata::from_headers(target_url, resp.headers());
        info!(
            "文件信息: 名称={}, 大小={} bytes, 类型={:?}, 服务器={}",
            meta.file_name, meta.content_length, meta.category, meta.server_info
        );
        Ok(meta)
    }

    /// 发起 Range 请求（只等待响应头）
    pub async fn get_range(&self, target_url: &str, range: ByteRange) -> reqwest::Result<Response> {
        self.client
            .get(self.proxy_url(target_url))
            .header(RANGE, range.header_value())
            .send()
            .await
    }

    /// 发起整体 GET 请求（直连模式）
    pub async fn get_whole(&self, target_url: &str) -> reqwest::Result<Response> {
        self.client.get(self.proxy_url(target_url)).send().await
    }

    /// 探测网络吞吐量（字节/秒）
    ///
    /// 通过代理获取前 256KB 数据，用于自动选择网络档位
    pub async fn probe_throughput(&self, target_url: &str) -> DownloadResult<f64> {
        let start = Instant::now();
        let resp = self
            .client
            .get(self.proxy_url(target_url))
            .header(RANGE, ByteRange::new(0, PROBE_SIZE - 1).header_value())
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| DownloadError::Metadata(format!("探测请求失败: {}", e)))?;

        if !resp.status().is_success() {
            warn!("探测失败: 状态码 {}", resp.status());
            return Err(DownloadError::Metadata(format!("探测失败: HTTP {}", resp.status())));
        }

        let data = resp
            .bytes()
            .await
            .map_err(|e| DownloadError::Metadata(format!("读取探测数据失败: {}", e)))?;

        let elapsed = start.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            data.len() as f64 / elapsed
        } else {
            0.0
        };

        info!(
            "探测完成: 收到 {} bytes，耗时 {:.2}s，速度 {:.2} KB/s",
            data.len(),
            elapsed,
            speed / 1024.0
        );
        Ok(speed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_url_encoding() {
        let client =
            ProxyClient::new("http://127.0.0.1:8080/proxy", TransportPreference::Http3).unwrap();
        assert_eq!(
            client.proxy_url("https://example.com/a b.zip?x=1&y=2"),
            "http://127.0.0.1:8080/proxy?url=https%3A%2F%2Fexample.com%2Fa%20b.zip%3Fx%3D1%26y%3D2&http3=true"
        );
    }

    #[test]
    fn test_proxy_url_with_existing_query() {
        let client =
            ProxyClient::new("http://localhost/proxy?key=abc", TransportPreference::Http2).unwrap();
        assert_eq!(
            client.proxy_url("https://example.com/f"),
            "http://localhost/proxy?key=abc&url=https%3A%2F%2Fexample.com%2Ff&http3=false"
        );
    }
}
