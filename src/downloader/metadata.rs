//! 文件元数据
//!
//! 从代理返回的响应头中解析文件名、大小、类型和上游服务器标识

use regex::Regex;
use reqwest::header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, SERVER, VIA};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// 未返回 server / via 头时使用的默认服务器标识
pub const DEFAULT_SERVER_LABEL: &str = "CloudFlare";

/// 无法推断文件名时使用的默认名称
pub const DEFAULT_FILE_NAME: &str = "file";

/// 文件类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Image,
    Video,
    Audio,
    Archive,
    Document,
    Application,
    DiskImage,
    Unknown,
}

impl FileCategory {
    /// 根据文件扩展名和 Content-Type 推断类别
    ///
    /// 扩展名优先，Content-Type 作为后备
    pub fn classify(file_name: &str, content_type: Option<&str>) -> Self {
        let ext = file_name
            .rsplit('.')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "svg" | "webp" => return FileCategory::Image,
            "mp4" | "webm" | "mkv" | "avi" | "mov" | "flv" => return FileCategory::Video,
            "mp3" | "wav" | "ogg" | "flac" | "aac" => return FileCategory::Audio,
            "zip" | "rar" | "7z" | "tar" | "gz" | "bz2" => return FileCategory::Archive,
            "pdf" | "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx" | "txt" => {
                return FileCategory::Document
            }
            "exe" | "msi" => return FileCategory::Application,
            "iso" => return FileCategory::DiskImage,
            _ => {}
        }

        let Some(content_type) = content_type else {
            return FileCategory::Unknown;
        };

        if content_type.starts_with("image/") {
            FileCategory::Image
        } else if content_type.starts_with("video/") {
            FileCategory::Video
        } else if content_type.starts_with("audio/") {
            FileCategory::Audio
        } else if content_type.starts_with("application/zip")
            || content_type.starts_with("application/x-rar")
            || content_type.starts_with("application/x-7z")
        {
            FileCategory::Archive
        } else if content_type.starts_with("application/pdf")
            || content_type.starts_with("application/msword")
            || content_type.starts_with("application/vnd.ms-excel")
        {
            FileCategory::Document
        } else {
            FileCategory::Unknown
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FileCategory::Image => "图片",
            FileCategory::Video => "视频",
            FileCategory::Audio => "音频",
            FileCategory::Archive => "压缩文件",
            FileCategory::Document => "文档",
            FileCategory::Application => "应用程序",
            FileCategory::DiskImage => "ISO 镜像",
            FileCategory::Unknown => "未知类型",
        }
    }
}

/// 通过 HEAD 请求得到的文件元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// 文件名
    pub file_name: String,
    /// 文件大小，0 表示未知
    pub content_length: u64,
    /// 原始 Content-Type
    pub content_type: Option<String>,
    /// 文件类别
    pub category: FileCategory,
    /// 上游服务器标识
    pub server_info: String,
}

impl FileMetadata {
    /// 从响应头解析元数据
    ///
    /// # 参数
    /// * `target_url` - 原始下载地址，响应头中没有文件名时从 URL 推断
    /// * `headers` - 代理返回的响应头
    pub fn from_headers(target_url: &str, headers: &HeaderMap) -> Self {
        let content_length = header_str(headers, CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);

        let file_name = header_str(headers, CONTENT_DISPOSITION.as_str())
            .and_then(file_name_from_disposition)
            .unwrap_or_else(|| file_name_from_url(target_url));

        let content_type = header_str(headers, CONTENT_TYPE.as_str()).map(str::to_string);
        let category = FileCategory::classify(&file_name, content_type.as_deref());

        Self {
            file_name,
            content_length,
            content_type,
            category,
            server_info: server_info(headers).unwrap_or_else(|| DEFAULT_SERVER_LABEL.to_string()),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// 上游服务器标识（`server` 优先，其次 `via`）
pub fn server_info(headers: &HeaderMap) -> Option<String> {
    header_str(headers, SERVER.as_str())
        .or_else(|| header_str(headers, VIA.as_str()))
        .map(str::to_string)
}

/// 从 Content-Disposition 中提取 `filename=` 后的值并去掉引号
pub fn file_name_from_disposition(disposition: &str) -> Option<String> {
    static FILENAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = FILENAME_RE.get_or_init(|| {
        Regex::new(r#"filename=("[^"]*"|[^;]*)"#).expect("filename regex")
    });

    let name = re
        .captures(disposition)?
        .get(1)?
        .as_str()
        .replace('"', "")
        .trim()
        .to_string();

    (!name.is_empty()).then_some(name)
}

/// 取 URL 路径最后一段（去掉查询串）作为文件名
pub fn file_name_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or_default();
    without_query
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::decode(s).map(|d| d.into_owned()).unwrap_or_else(|_| s.to_string()))
        .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_classify_by_extension_first() {
        assert_eq!(FileCategory::classify("a.MP4", Some("image/png")), FileCategory::Video);
        assert_eq!(FileCategory::classify("disk.iso", None), FileCategory::DiskImage);
        assert_eq!(FileCategory::classify("setup.msi", None), FileCategory::Application);
        assert_eq!(FileCategory::classify("notes.txt", None), FileCategory::Document);
    }

    #[test]
    fn test_classify_by_content_type() {
        assert_eq!(FileCategory::classify("blob", Some("audio/mpeg")), FileCategory::Audio);
        assert_eq!(
            FileCategory::classify("download", Some("application/x-7z-compressed")),
            FileCategory::Archive
        );
        assert_eq!(
            FileCategory::classify("download", Some("application/octet-stream")),
            FileCategory::Unknown
        );
        assert_eq!(FileCategory::classify("download", None), FileCategory::Unknown);
    }

    #[test]
    fn test_file_name_from_disposition() {
        assert_eq!(
            file_name_from_disposition(r#"attachment; filename="report.pdf""#),
            Some("report.pdf".to_string())
        );
        assert_eq!(
            file_name_from_disposition("attachment; filename=data.bin; size=10"),
            Some("data.bin".to_string())
        );
        assert_eq!(file_name_from_disposition("inline"), None);
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(file_name_from_url("https://host/dir/movie.mkv?token=1"), "movie.mkv");
        assert_eq!(file_name_from_url("https://host/dir/my%20file.zip"), "my file.zip");
        assert_eq!(file_name_from_url("https://host/"), DEFAULT_FILE_NAME);
    }

    #[test]
    fn test_metadata_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("10000000"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
        headers.insert(VIA, HeaderValue::from_static("1.1 varnish"));

        let meta = FileMetadata::from_headers("https://cdn.example.com/v/clip?sig=abc", &headers);
        assert_eq!(meta.file_name, "clip");
        assert_eq!(meta.content_length, 10_000_000);
        assert_eq!(meta.category, FileCategory::Video);
        assert_eq!(meta.server_info, "1.1 varnish");
    }

    #[test]
    fn test_metadata_defaults() {
        let meta = FileMetadata::from_headers("https://example.com/", &HeaderMap::new());
        assert_eq!(meta.file_name, DEFAULT_FILE_NAME);
        assert_eq!(meta.content_length, 0);
        assert_eq!(meta.server_info, DEFAULT_SERVER_LABEL);
        assert_eq!(meta.category, FileCategory::Unknown);
    }
}
