//! 进度采样
//!
//! 会话运行期间按固定间隔（默认 500ms）采样共享状态，
//! 计算平均速度和剩余时间，通过 watch 通道发布快照。
//! 暂停和完成时额外发布一次最终快照。

use crate::downloader::session::SessionPhase;
use crate::downloader::state::TransferState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// 剩余时间估计
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "seconds", rename_all = "snake_case")]
pub enum Eta {
    /// 速度未知
    Calculating,
    Seconds(f64),
    Complete,
}

impl Eta {
    pub fn estimate(remaining_bytes: u64, speed_bps: f64) -> Self {
        if speed_bps > 0.0 && speed_bps.is_finite() {
            Eta::Seconds(remaining_bytes as f64 / speed_bps)
        } else {
            Eta::Calculating
        }
    }

    pub fn display(&self) -> String {
        match self {
            Eta::Calculating => format_eta(f64::NAN),
            Eta::Seconds(secs) => format_eta(*secs),
            Eta::Complete => "complete".to_string(),
        }
    }
}

/// 进度快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub phase: SessionPhase,
    pub received_bytes: u64,
    /// 0 表示未知
    pub content_length: u64,
    pub speed_bps: f64,
    pub eta: Eta,
    pub chunks_completed: usize,
    pub chunks_total: usize,
    pub in_flight: usize,
    pub elapsed_ms: u64,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            received_bytes: 0,
            content_length: 0,
            speed_bps: 0.0,
            eta: Eta::Calculating,
            chunks_completed: 0,
            chunks_total: 0,
            in_flight: 0,
            elapsed_ms: 0,
        }
    }
}

impl ProgressSnapshot {
    /// 完成百分比（大小未知时为 None）
    pub fn percent(&self) -> Option<f64> {
        (self.content_length > 0)
            .then(|| self.received_bytes as f64 / self.content_length as f64 * 100.0)
    }

    /// 单行进度描述，用于日志
    pub fn summary(&self) -> String {
        let percent = self
            .percent()
            .map(|p| format!("{:.1}%", p))
            .unwrap_or_else(|| "--".to_string());

        let mut line = format!(
            "{} / {} ({}), 速度 {}/s, 剩余 {}",
            format_size(self.received_bytes),
            format_size(self.content_length),
            percent,
            format_size(self.speed_bps.max(0.0) as u64),
            self.eta.display()
        );
        if self.chunks_total > 0 {
            line.push_str(&format!(
                ", 分片 {}/{}",
                self.chunks_completed, self.chunks_total
            ));
        }
        line
    }
}

/// 传输计时
///
/// 恢复时起点后移暂停时长，已用时间不包含暂停区间
#[derive(Debug, Default, Clone, Copy)]
pub struct TransferClock {
    started: Option<Instant>,
    paused_at: Option<Instant>,
}

impl TransferClock {
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
        self.paused_at = None;
    }

    pub fn pause(&mut self) {
        if self.started.is_some() && self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    pub fn resume(&mut self) {
        if let (Some(started), Some(paused_at)) = (self.started, self.paused_at.take()) {
            self.started = Some(started + paused_at.elapsed());
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn elapsed(&self) -> Duration {
        match (self.started, self.paused_at) {
            (Some(started), Some(paused_at)) => paused_at.saturating_duration_since(started),
            (Some(started), None) => started.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

/// 进度发布器
#[derive(Debug)]
pub struct ProgressReporter {
    tx: watch::Sender<ProgressSnapshot>,
    clock: Mutex<TransferClock>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(ProgressSnapshot::default());
        Self {
            tx,
            clock: Mutex::new(TransferClock::default()),
        }
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> ProgressSnapshot {
        self.tx.borrow().clone()
    }

    pub fn start_clock(&self) {
        self.clock.lock().start();
    }

    pub fn pause_clock(&self) {
        self.clock.lock().pause();
    }

    pub fn resume_clock(&self) {
        self.clock.lock().resume();
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.lock().elapsed()
    }

    /// 回到初始状态并发布空快照
    pub fn reset(&self) {
        self.clock.lock().reset();
        self.tx.send_replace(ProgressSnapshot::default());
    }

    /// 采样并发布一次快照
    pub fn publish(
        &self,
        state: &TransferState,
        content_length: u64,
        phase: SessionPhase,
    ) -> ProgressSnapshot {
        let elapsed = self.elapsed();
        let received_bytes = state.received_bytes();
        let (chunks_completed, chunks_total) = state.chunk_counts();

        let secs = elapsed.as_secs_f64();
        let speed_bps = if secs > 0.0 {
            received_bytes as f64 / secs
        } else {
            0.0
        };

        let eta = if matches!(phase, SessionPhase::Completed(_)) {
            Eta::Complete
        } else if content_length == 0 {
            Eta::Calculating
        } else {
            Eta::estimate(content_length.saturating_sub(received_bytes), speed_bps)
        };

        let snapshot = ProgressSnapshot {
            phase,
            received_bytes,
            content_length,
            speed_bps,
            eta,
            chunks_completed,
            chunks_total,
            in_flight: state.in_flight(),
            elapsed_ms: elapsed.as_millis() as u64,
        };
        self.tx.send_replace(snapshot.clone());
        snapshot
    }
}

/// 格式化文件大小，如 `9.54 MB`
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// 格式化剩余时间
pub fn format_eta(seconds: f64) -> String {
    if !seconds.is_finite() || seconds <= 0.0 {
        return "calculating".to_string();
    }

    let rounded = seconds.round() as u64;
    if rounded < 60 {
        format!("{}s", rounded)
    } else if rounded < 3600 {
        format!("{}:{:02}", rounded / 60, rounded % 60)
    } else {
        format!("{:.1}h", seconds / 3600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::session::TransferMode;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512.00 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(10_000_000), "9.54 MB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.00 GB");
        assert_eq!(format_size(3 * 1024u64.pow(5)), "3072.00 TB");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(f64::INFINITY), "calculating");
        assert_eq!(format_eta(0.0), "calculating");
        assert_eq!(format_eta(-3.0), "calculating");
        assert_eq!(format_eta(42.4), "42s");
        assert_eq!(format_eta(65.0), "1:05");
        assert_eq!(format_eta(59.7), "1:00");
        assert_eq!(format_eta(5400.0), "1.5h");
    }

    #[test]
    fn test_eta_estimate() {
        assert_eq!(Eta::estimate(1000, 0.0), Eta::Calculating);
        assert_eq!(Eta::estimate(1000, 100.0), Eta::Seconds(10.0));
        assert_eq!(Eta::Complete.display(), "complete");
    }

    #[test]
    fn test_clock_excludes_paused_interval() {
        let mut clock = TransferClock::default();
        assert_eq!(clock.elapsed(), Duration::ZERO);

        clock.start();
        std::thread::sleep(Duration::from_millis(20));
        clock.pause();
        let at_pause = clock.elapsed();

        std::thread::sleep(Duration::from_millis(60));
        // 暂停期间不计时
        assert_eq!(clock.elapsed(), at_pause);

        clock.resume();
        let after_resume = clock.elapsed();
        assert!(after_resume >= at_pause);
        assert!(after_resume < at_pause + Duration::from_millis(50));
    }

    #[test]
    fn test_publish_snapshot() {
        let reporter = ProgressReporter::new();
        let rx = reporter.subscribe();
        let state = TransferState::new();
        state.with_chunks(|t| t.init(4));
        state.add_received_bytes(250);

        reporter.start_clock();
        std::thread::sleep(Duration::from_millis(10));
        let snap = reporter.publish(&state, 1000, SessionPhase::Running(TransferMode::Chunked));

        assert_eq!(rx.borrow().received_bytes, 250);
        assert_eq!(snap.chunks_total, 4);
        assert_eq!(snap.percent(), Some(25.0));
        assert!(snap.speed_bps > 0.0);
        assert!(matches!(snap.eta, Eta::Seconds(_)));

        let done = reporter.publish(&state, 1000, SessionPhase::Completed(TransferMode::Chunked));
        assert_eq!(done.eta, Eta::Complete);

        reporter.reset();
        assert_eq!(reporter.latest(), ProgressSnapshot::default());
    }

    #[test]
    fn test_unknown_length_has_no_percent() {
        let snap = ProgressSnapshot {
            received_bytes: 10,
            ..Default::default()
        };
        assert_eq!(snap.percent(), None);
        assert!(snap.summary().contains("--"));
    }
}
