use crate::types::constants;
use crate::types::ByteCount;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_downloads: usize,
    pub max_segments_per_task: usize,
    pub min_segment_size: ByteCount,
    pub worker_pool_limit: usize,
    pub default_download_dir: PathBuf,
    pub db_path: Option<PathBuf>,
    pub user_agent: String,
    pub referer: Option<String>,
    pub proxy: Option<ProxyConfig>,
    pub verify_tls: bool,
    pub global_speed_limit: Option<u64>,
    pub per_task_speed_limit: Option<u64>,
    pub verify_crc: bool,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl EngineConfig {
    /// Concurrency cap, clamped to [1, MAX_CONCURRENT_DOWNLOADS].
    pub fn concurrent_limit(&self) -> usize {
        self.max_concurrent_downloads
            .clamp(1, constants::MAX_CONCURRENT_DOWNLOADS)
    }

    pub fn segment_limit(&self) -> usize {
        self.max_segments_per_task
            .clamp(constants::MIN_SEGMENTS, constants::MAX_SEGMENTS)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: constants::DEFAULT_CONCURRENT_DOWNLOADS,
            max_segments_per_task: constants::MAX_SEGMENTS,
            min_segment_size: constants::MIN_SEGMENT_SIZE,
            worker_pool_limit: default_pool_limit(),
            default_download_dir: default_download_dir(),
            db_path: None,
            user_agent: format!("parget/{}", env!("CARGO_PKG_VERSION")),
            referer: None,
            proxy: None,
            verify_tls: true,
            global_speed_limit: None,
            per_task_speed_limit: None,
            verify_crc: true,
        }
    }
}

fn default_pool_limit() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(constants::DEFAULT_SEGMENTS)
}

fn default_download_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PARGET_DOWNLOAD_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    let downloads = PathBuf::from(&home).join("Downloads");
    if downloads.exists() {
        return downloads;
    }
    PathBuf::from("/tmp")
}
