use serde::{Deserialize, Serialize};

const KB: f64 = 1024.0;
const MB: f64 = 1024.0 * KB;

/// 网络档位（根据探测到的吞吐量划分）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkTier {
    /// < 256KB/s，分片没有收益
    TooSlow,
    /// < 1MB/s
    Slow,
    /// < 5MB/s
    Moderate,
    /// < 20MB/s
    Fast,
    /// >= 20MB/s
    VeryFast,
}

/// 网络档位对应的推荐配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRecommendedConfig {
    /// 是否分片
    pub use_chunking: bool,
    /// 推荐分片大小 (MB)
    pub chunk_size_mb: u64,
    /// 推荐并发数
    pub concurrency: usize,
}

impl NetworkTier {
    /// 从吞吐量（字节/秒）划分档位
    pub fn from_throughput(bytes_per_sec: f64) -> Self {
        if bytes_per_sec.is_nan() || bytes_per_sec < 256.0 * KB {
            NetworkTier::TooSlow
        } else if bytes_per_sec < MB {
            NetworkTier::Slow
        } else if bytes_per_sec < 5.0 * MB {
            NetworkTier::Moderate
        } else if bytes_per_sec < 20.0 * MB {
            NetworkTier::Fast
        } else {
            NetworkTier::VeryFast
        }
    }

    pub fn recommended(&self) -> TierRecommendedConfig {
        match self {
            // 慢速网络不分片，保留默认的分片参数
            NetworkTier::TooSlow => TierRecommendedConfig {
                use_chunking: false,
                chunk_size_mb: 5,
                concurrency: 3,
            },
            NetworkTier::Slow => TierRecommendedConfig {
                use_chunking: true,
                chunk_size_mb: 2,
                concurrency: 2,
            },
            NetworkTier::Moderate => TierRecommendedConfig {
                use_chunking: true,
                chunk_size_mb: 5,
                concurrency: 3,
            },
            NetworkTier::Fast => TierRecommendedConfig {
                use_chunking: true,
                chunk_size_mb: 10,
                concurrency: 4,
            },
            NetworkTier::VeryFast => TierRecommendedConfig {
                use_chunking: true,
                chunk_size_mb: 20,
                concurrency: 6,
            },
        }
    }
}
