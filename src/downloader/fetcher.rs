//! 分片下载器
//!
//! 通过代理发起单个 Range 请求，流式读取响应体并上报累计进度。
//! 请求和每次读取都与会话的取消作用域竞争，暂停 / 取消时立即中断，
//! 返回哨兵结果而不是错误

use crate::downloader::chunk::{ByteRange, ChunkStatus};
use crate::downloader::error::{DownloadError, DownloadResult};
use crate::downloader::pool::{FetchOutcome, ProgressSink};
use crate::downloader::proxy::ProxyClient;
use crate::downloader::state::TransferState;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 重试间隔
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// 分片下载器
#[derive(Debug, Clone)]
pub struct ChunkFetcher {
    client: ProxyClient,
    state: Arc<TransferState>,
    target_url: String,
    file_name: String,
    /// 网络错误的最大重试次数（HTTP 状态错误不重试）
    max_retries: u32,
}

impl ChunkFetcher {
    pub fn new(
        client: ProxyClient,
        state: Arc<TransferState>,
        target_url: impl Into<String>,
        file_name: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            client,
            state,
            target_url: target_url.into(),
            file_name: file_name.into(),
            max_retries,
        }
    }

    /// 下载一个分片
    ///
    /// 成功时分片数据同时写入分片表；
    /// 暂停 / 取消时分片状态回到 Pending 并返回哨兵结果
    pub async fn fetch(
        &self,
        index: usize,
        range: ByteRange,
        sink: ProgressSink,
    ) -> DownloadResult<FetchOutcome<Bytes>> {
        let mut retries = 0;

        loop {
            if self.state.should_halt() {
                return Ok(self.interrupted(index));
            }

            match self.try_fetch(index, range, &sink).await {
                Ok(outcome) => return Ok(outcome),
                Err(e @ DownloadError::Network { .. }) if retries < self.max_retries => {
                    retries += 1;
                    warn!(
                        "分片 #{} 网络错误，重试 {}/{}: {}",
                        index, retries, self.max_retries, e
                    );
                    // 新的尝试从 0 开始计数
                    sink.report(0, 0);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    error!("分片 #{} 下载失败: {}", index, e);
                    sink.report(0, 0);
                    self.state.set_chunk_status(index, ChunkStatus::Error);
                    return Err(e);
                }
            }
        }
    }

    async fn try_fetch(
        &self,
        index: usize,
        range: ByteRange,
        sink: &ProgressSink,
    ) -> DownloadResult<FetchOutcome<Bytes>> {
        let token = self.state.child_token();
        let _guard = self.state.enter_transfer();
        self.state.set_chunk_status(index, ChunkStatus::InFlight);
        debug!("分片 #{} 开始: {}", index, range.header_value());

        let mut resp = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(self.interrupted(index)),
            result = self.client.get_range(&self.target_url, range) => {
                result.map_err(|source| DownloadError::Network { index, source })?
            }
        };

        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::TransferStatus {
                index,
                status: status.as_u16(),
            });
        }

        let expected = range.len();
        let mismatch = |actual: u64| DownloadError::RangeMismatch {
            index,
            expected,
            actual,
        };

        // 代理忽略 Range 时会以 200 返回整个文件
        if let Some(declared) = resp.content_length() {
            if declared != expected {
                return Err(mismatch(declared));
            }
        }

        self.state.discover(&self.file_name, resp.headers());

        let mut buffer = BytesMut::with_capacity(expected as usize);
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(self.interrupted(index)),
                result = resp.chunk() => {
                    result.map_err(|source| DownloadError::Network { index, source })?
                }
            };

            match next {
                Some(data) => {
                    if (buffer.len() + data.len()) as u64 > expected {
                        return Err(mismatch((buffer.len() + data.len()) as u64));
                    }
                    buffer.extend_from_slice(&data);
                    sink.report(data.len() as u64, buffer.len() as u64);
                }
                None => break,
            }
        }

        if buffer.len() as u64 != expected {
            return Err(mismatch(buffer.len() as u64));
        }

        let data = buffer.freeze();
        self.state.complete_chunk(index, data.clone());
        info!("✓ 分片 #{} 下载完成 ({} bytes)", index, data.len());
        Ok(FetchOutcome::Done(data))
    }

    /// 整体流式下载（直连模式或分片失败后的回退）
    ///
    /// 进度直接写入全局已接收字节数。`expected_len` 为 HEAD 得到的文件大小，
    /// 用于限制预分配的缓冲区
    pub async fn fetch_whole(&self, expected_len: u64) -> DownloadResult<FetchOutcome<Bytes>> {
        if self.state.should_halt() {
            return Ok(self.halt_outcome());
        }

        let token = self.state.child_token();
        let _guard = self.state.enter_transfer();

        let mut resp = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(self.halt_outcome()),
            result = self.client.get_whole(&self.target_url) => {
                result.map_err(|e| DownloadError::Direct(e.to_string()))?
            }
        };

        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::Direct(format!("HTTP {}", status)));
        }

        self.state.discover(&self.file_name, resp.headers());

        let capacity = resp.content_length().unwrap_or(0).min(expected_len) as usize;
        let mut buffer = BytesMut::with_capacity(capacity);
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(self.halt_outcome()),
                result = resp.chunk() => result.map_err(|e| DownloadError::Direct(e.to_string()))?,
            };

            match next {
                Some(data) => {
                    buffer.extend_from_slice(&data);
                    self.state.set_received_bytes(buffer.len() as u64);
                }
                None => break,
            }
        }

        info!("✓ 直连下载完成 ({} bytes)", buffer.len());
        Ok(FetchOutcome::Done(buffer.freeze()))
    }

    /// 被暂停 / 取消中断的分片回到 Pending
    fn interrupted(&self, index: usize) -> FetchOutcome<Bytes> {
        self.state.set_chunk_status(index, ChunkStatus::Pending);
        let outcome = self.halt_outcome();
        debug!("分片 #{} 被中断: {:?}", index, outcome);
        outcome
    }

    fn halt_outcome(&self) -> FetchOutcome<Bytes> {
        if self.state.is_cancelled() {
            FetchOutcome::Aborted
        } else {
            FetchOutcome::Paused
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportPreference;
    use tokio::sync::mpsc;
    use wiremock::matchers::{header, method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TARGET: &str = "https://origin.example.com/data.bin";

    async fn fetcher_for(server: &MockServer, state: Arc<TransferState>) -> ChunkFetcher {
        let client =
            ProxyClient::new(format!("{}/proxy", server.uri()), TransportPreference::Http3).unwrap();
        ChunkFetcher::new(client, state, TARGET, "data.bin", 0)
    }

    #[tokio::test]
    async fn test_fetch_range_stores_chunk() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("url", TARGET))
            .and(query_param("http3", "true"))
            .and(header("range", "bytes=0-9"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("server", "edge-proxy")
                    .set_body_bytes(b"0123456789".to_vec()),
            )
            .mount(&server)
            .await;

        let state = Arc::new(TransferState::new());
        state.with_chunks(|t| t.init(1));
        let fetcher = fetcher_for(&server, state.clone()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = fetcher
            .fetch(0, ByteRange::new(0, 9), ProgressSink::new(0, tx))
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::Done(Bytes::from_static(b"0123456789")));
        assert_eq!(state.chunk_statuses(), vec![ChunkStatus::Complete]);
        assert_eq!(state.discovery().server_info.as_deref(), Some("edge-proxy"));
        assert_eq!(state.in_flight(), 0);

        let mut last = 0;
        while let Ok(ev) = rx.try_recv() {
            last = ev.task_total;
        }
        assert_eq!(last, 10);
    }

    #[tokio::test]
    async fn test_http_error_marks_chunk_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(416))
            .expect(1)
            .mount(&server)
            .await;

        let state = Arc::new(TransferState::new());
        state.with_chunks(|t| t.init(2));
        let fetcher = fetcher_for(&server, state.clone()).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = fetcher
            .fetch(1, ByteRange::new(10, 19), ProgressSink::new(0, tx))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DownloadError::TransferStatus {
                index: 1,
                status: 416
            }
        ));
        assert_eq!(
            state.chunk_statuses(),
            vec![ChunkStatus::Pending, ChunkStatus::Error]
        );
    }

    #[tokio::test]
    async fn test_full_body_for_range_request_is_rejected() {
        let server = MockServer::start().await;
        // 代理忽略 Range，返回 200 和整个文件
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 100]))
            .mount(&server)
            .await;

        let state = Arc::new(TransferState::new());
        state.with_chunks(|t| t.init(2));
        let fetcher = fetcher_for(&server, state.clone()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = fetcher
            .fetch(0, ByteRange::new(0, 49), ProgressSink::new(0, tx))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DownloadError::RangeMismatch {
                index: 0,
                expected: 50,
                actual: 100
            }
        ));
        assert_eq!(
            state.chunk_statuses(),
            vec![ChunkStatus::Error, ChunkStatus::Pending]
        );
        assert!(state.with_chunks(|t| t.assemble()).is_err());

        while let Ok(ev) = rx.try_recv() {
            state.apply_chunk_progress(0, ev.task_total);
        }
        assert_eq!(state.received_bytes(), 0);
    }

    #[tokio::test]
    async fn test_truncated_range_response_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=0-99"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![1u8; 10]))
            .mount(&server)
            .await;

        let state = Arc::new(TransferState::new());
        state.with_chunks(|t| t.init(1));
        let fetcher = fetcher_for(&server, state.clone()).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = fetcher
            .fetch(0, ByteRange::new(0, 99), ProgressSink::new(0, tx))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DownloadError::RangeMismatch {
                index: 0,
                expected: 100,
                actual: 10
            }
        ));
        assert_eq!(state.chunk_statuses(), vec![ChunkStatus::Error]);
    }

    /// 首次请求超时（网络错误），之后的请求立即返回
    async fn flaky_server(body: &[u8]) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(body.to_vec())
                    .set_delay(Duration::from_secs(2)),
            )
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(body.to_vec()))
            .with_priority(2)
            .mount(&server)
            .await;
        server
    }

    fn impatient_fetcher(
        server: &MockServer,
        state: Arc<TransferState>,
        max_retries: u32,
    ) -> ChunkFetcher {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(300))
            .build()
            .unwrap();
        let client = ProxyClient::with_client(
            http,
            format!("{}/proxy", server.uri()),
            TransportPreference::Http3,
        );
        ChunkFetcher::new(client, state, TARGET, "data.bin", max_retries)
    }

    #[tokio::test]
    async fn test_network_error_is_retried_without_double_counting() {
        let server = flaky_server(b"0123456789").await;

        let state = Arc::new(TransferState::new());
        state.with_chunks(|t| t.init(1));
        let fetcher = impatient_fetcher(&server, state.clone(), 2);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = fetcher
            .fetch(0, ByteRange::new(0, 9), ProgressSink::new(0, tx))
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::Done(Bytes::from_static(b"0123456789")));
        assert_eq!(state.chunk_statuses(), vec![ChunkStatus::Complete]);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);

        let mut rewound = false;
        while let Ok(ev) = rx.try_recv() {
            rewound |= ev.task_total == 0;
            state.apply_chunk_progress(0, ev.task_total);
        }
        assert!(rewound);
        assert_eq!(state.received_bytes(), 10);
    }

    #[tokio::test]
    async fn test_network_error_after_retries_marks_chunk_failed() {
        let server = flaky_server(b"0123456789").await;

        let state = Arc::new(TransferState::new());
        state.with_chunks(|t| t.init(1));
        let fetcher = impatient_fetcher(&server, state.clone(), 0);
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = fetcher
            .fetch(0, ByteRange::new(0, 9), ProgressSink::new(0, tx))
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Network { index: 0, .. }));
        assert_eq!(state.chunk_statuses(), vec![ChunkStatus::Error]);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_paused_fetch_returns_sentinel_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(206))
            .expect(0)
            .mount(&server)
            .await;

        let state = Arc::new(TransferState::new());
        state.with_chunks(|t| t.init(1));
        state.set_paused(true);
        let fetcher = fetcher_for(&server, state.clone()).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let outcome = fetcher
            .fetch(0, ByteRange::new(0, 9), ProgressSink::new(0, tx))
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::Paused);
        assert_eq!(state.chunk_statuses(), vec![ChunkStatus::Pending]);
    }

    #[tokio::test]
    async fn test_scope_cancel_interrupts_in_flight_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(vec![0u8; 10])
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let state = Arc::new(TransferState::new());
        state.with_chunks(|t| t.init(1));
        let fetcher = fetcher_for(&server, state.clone()).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let pauser = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            pauser.set_paused(true);
            pauser.cancel_scope();
        });

        let started = std::time::Instant::now();
        let outcome = fetcher
            .fetch(0, ByteRange::new(0, 9), ProgressSink::new(0, tx))
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::Paused);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(state.chunk_statuses(), vec![ChunkStatus::Pending]);
        assert_eq!(state.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_fetch_whole_tracks_received_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .mount(&server)
            .await;

        let state = Arc::new(TransferState::new());
        let fetcher = fetcher_for(&server, state.clone()).await;

        let outcome = fetcher.fetch_whole(4096).await.unwrap();
        match outcome {
            FetchOutcome::Done(data) => assert_eq!(data.len(), 4096),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(state.received_bytes(), 4096);
    }
}
