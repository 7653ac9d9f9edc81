pub mod chunk;
pub mod error;
pub mod export;
pub mod fetcher;
pub mod manager;
pub mod metadata;
pub mod pool;
pub mod progress;
pub mod proxy;
pub mod session;
pub mod state;

pub use chunk::{ByteRange, ChunkPlan, ChunkStatus, ChunkTable, CHUNK_THRESHOLD};
pub use error::{DownloadError, DownloadResult};
pub use fetcher::ChunkFetcher;
pub use manager::DownloadManager;
pub use metadata::{FileCategory, FileMetadata};
pub use pool::{ConcurrencyPool, FetchOutcome, PoolProgress, PoolReport, ProgressSink, SlotResult};
pub use progress::{format_eta, format_size, Eta, ProgressReporter, ProgressSnapshot};
pub use proxy::ProxyClient;
pub use session::{
    Delivery, DownloadSession, SessionOutcome, SessionPhase, SessionView, TransferMode,
};
pub use state::{Discovery, TransferState};
