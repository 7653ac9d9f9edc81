//! 导出下载结果
//!
//! 已组装的文件直接写入磁盘；透传交付则从代理地址流式下载到磁盘

use crate::downloader::error::DownloadError;
use crate::downloader::metadata::DEFAULT_FILE_NAME;
use crate::downloader::session::{Delivery, DownloadSession};
use anyhow::{bail, Context, Result};
use reqwest::Client;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::info;

/// 保存会话的交付结果
pub async fn save_session(client: &Client, session: &DownloadSession, dir: &Path) -> Result<PathBuf> {
    let Some(delivery) = session.delivery() else {
        return Err(DownloadError::Export("没有可保存的文件，请先完成下载".to_string()).into());
    };
    save_delivery(client, &delivery, dir).await
}

/// 保存交付结果到目录，返回最终路径
pub async fn save_delivery(client: &Client, delivery: &Delivery, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("创建输出目录失败: {:?}", dir))?;

    let path = unique_path(dir, &sanitize_file_name(delivery.file_name()));

    match delivery {
        Delivery::Artifact { bytes, .. } => {
            tokio::fs::write(&path, bytes)
                .await
                .with_context(|| format!("写入文件失败: {:?}", path))?;
            info!("✓ 文件已保存: {:?} ({} bytes)", path, bytes.len());
        }
        Delivery::PassThrough { proxy_url, .. } => {
            let written = stream_to_file(client, proxy_url, &path).await?;
            info!("✓ 文件已通过代理直接保存: {:?} ({} bytes)", path, written);
        }
    }

    Ok(path)
}

async fn stream_to_file(client: &Client, url: &str, path: &Path) -> Result<u64> {
    let mut resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("请求失败: {}", url))?;

    if !resp.status().is_success() {
        bail!("下载失败: HTTP {}", resp.status());
    }

    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("创建文件失败: {:?}", path))?;

    let mut written = 0u64;
    while let Some(chunk) = resp.chunk().await.context("读取响应数据失败")? {
        file.write_all(&chunk).await.context("写入文件失败")?;
        written += chunk.len() as u64;
    }
    file.flush().await.context("写入文件失败")?;

    Ok(written)
}

/// 清理文件名中不能用于本地路径的字符
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let cleaned = cleaned.trim().trim_matches('.').to_string();
    if cleaned.is_empty() {
        DEFAULT_FILE_NAME.to_string()
    } else {
        cleaned
    }
}

/// 目标已存在时追加序号: `name (1).ext`
fn unique_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (file_name, None),
    };

    (1..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{} ({}).{}", stem, n, ext)),
            None => dir.join(format!("{} ({})", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("a/b\\c:d?.txt"), "a_b_c_d_.txt");
        assert_eq!(sanitize_file_name("../"), "_");
        assert_eq!(sanitize_file_name("   "), DEFAULT_FILE_NAME);
        assert_eq!(sanitize_file_name(".."), DEFAULT_FILE_NAME);
    }

    #[tokio::test]
    async fn test_save_artifact() {
        let dir = TempDir::new().unwrap();
        let delivery = Delivery::Artifact {
            file_name: "hello.txt".to_string(),
            bytes: Bytes::from_static(b"hello world"),
        };

        let path = save_delivery(&Client::new(), &delivery, dir.path()).await.unwrap();
        assert_eq!(path, dir.path().join("hello.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");

        // 同名文件不覆盖
        let second = save_delivery(&Client::new(), &delivery, dir.path()).await.unwrap();
        assert_eq!(second, dir.path().join("hello (1).txt"));
    }

    #[tokio::test]
    async fn test_save_pass_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![42u8; 2048]))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let delivery = Delivery::PassThrough {
            file_name: "stream.bin".to_string(),
            proxy_url: format!("{}/proxy?url=x", server.uri()),
        };

        let path = save_delivery(&Client::new(), &delivery, &dir.path().join("out"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap().len(), 2048);
    }

    #[tokio::test]
    async fn test_pass_through_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let delivery = Delivery::PassThrough {
            file_name: "x".to_string(),
            proxy_url: server.uri(),
        };
        let err = save_delivery(&Client::new(), &delivery, dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("502"));
    }
}
