use anyhow::{Context, Result};
use chunk_downloader::{
    config::{AppConfig, DownloadConfig, NetworkTier, TransportPreference, DEFAULT_CONFIG_PATH},
    downloader::{export, DownloadManager, ProxyClient, SessionOutcome},
    logging,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 通过代理分片并发下载文件
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 下载地址
    url: String,

    /// 配置文件路径
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 代理端点，如 http://127.0.0.1:8080/proxy
    #[arg(long)]
    proxy: Option<String>,

    /// 分片大小 (MB)
    #[arg(long)]
    chunk_size_mb: Option<u64>,

    /// 同时下载的分片数
    #[arg(long)]
    concurrency: Option<usize>,

    /// 禁用分片，整体下载
    #[arg(long)]
    no_chunking: bool,

    /// 使用 HTTP/2 而不是 HTTP/3
    #[arg(long)]
    http2: bool,

    /// 先探测网速，再自动选择分片大小和并发数
    #[arg(long)]
    auto_tune: bool,

    /// 输出目录
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// 以 JSON 行输出进度
    #[arg(long)]
    json_progress: bool,
}

impl Args {
    /// 命令行参数覆盖配置文件
    fn apply(&self, config: &mut DownloadConfig) {
        if let Some(proxy) = &self.proxy {
            config.proxy_endpoint = proxy.clone();
        }
        if let Some(size) = self.chunk_size_mb {
            config.chunk_size_mb = size;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if self.no_chunking {
            config.use_chunking = false;
        }
        if self.http2 {
            config.transport = TransportPreference::Http2;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
    }
}

/// 探测网速并应用对应档位，失败时保持原配置
async fn auto_tune(config: &mut DownloadConfig, url: &str) {
    let client = match ProxyClient::new(config.proxy_endpoint.clone(), config.transport) {
        Ok(client) => client,
        Err(e) => {
            warn!("网速探测跳过: {}", e);
            return;
        }
    };

    match client.probe_throughput(url).await {
        Ok(speed) => config.apply_tier(NetworkTier::from_throughput(speed)),
        Err(e) => warn!("网速探测失败，使用当前配置: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load_or_default(&args.config).await;
    let _log_guard = logging::init_logging(&config.log);

    args.apply(&mut config.download);
    config.download.validate().context("下载配置无效")?;

    if args.auto_tune {
        auto_tune(&mut config.download, &args.url).await;
    }

    let output_dir = config.download.output_dir.clone();
    let manager = Arc::new(DownloadManager::new(config.download)?);
    let session = manager.begin().await?;

    let mut progress_rx = session.subscribe();
    let json_progress = args.json_progress;
    let printer = tokio::spawn(async move {
        while progress_rx.changed().await.is_ok() {
            let snapshot = progress_rx.borrow_and_update().clone();
            if json_progress {
                match serde_json::to_string(&snapshot) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("序列化进度失败: {}", e),
                }
            } else {
                info!("进度: {} [{}]", snapshot.summary(), snapshot.phase);
            }
        }
    });

    let mut runner = {
        let session = session.clone();
        let url = args.url.clone();
        tokio::spawn(async move { session.start(&url).await })
    };

    let joined = tokio::select! {
        joined = &mut runner => joined,
        _ = tokio::signal::ctrl_c() => {
            warn!("收到 Ctrl+C，取消下载...");
            manager.cancel_active().await;
            runner.await
        }
    };
    printer.abort();

    let outcome = match joined.context("下载任务异常退出")? {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("下载失败: {}", e);
            manager.cancel_active().await;
            return Err(e.into());
        }
    };

    match outcome {
        SessionOutcome::Completed(_) => {
            let path = export::save_session(&reqwest::Client::new(), &session, &output_dir).await?;
            info!("✓ 已保存到 {:?}", path);
        }
        SessionOutcome::Paused => {
            warn!("下载已暂停，未保存文件");
        }
        SessionOutcome::Cancelled => {
            info!("下载已取消");
        }
    }

    Ok(())
}
