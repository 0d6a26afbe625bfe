use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type TaskId = Uuid;
pub type SegmentId = u32;
pub type ByteOffset = i64;
pub type ByteCount = i64;
pub type SpeedBps = f64;

pub mod constants {
    use super::ByteCount;
    use std::time::Duration;

    pub const MAX_SEGMENTS: usize = 32;
    pub const MIN_SEGMENTS: usize = 1;
    pub const DEFAULT_SEGMENTS: usize = 8;
    pub const MIN_SEGMENT_SIZE: ByteCount = 1024 * 1024;
    pub const MIN_STEAL_SIZE: ByteCount = 512 * 1024;
    pub const CHUNK_SIZE: usize = 64 * 1024;

    pub const MAX_CONCURRENT_DOWNLOADS: usize = 16;
    pub const DEFAULT_CONCURRENT_DOWNLOADS: usize = 3;

    pub const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(100);
    pub const REBALANCE_INTERVAL: Duration = Duration::from_secs(5);
    pub const SPEED_SMOOTHING_WINDOW: Duration = Duration::from_secs(10);
    pub const STATS_INTERVAL: Duration = Duration::from_secs(1);
    pub const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(500);
    pub const WORK_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

    pub const MAX_RETRIES: u32 = 5;
    pub const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(1);
    pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DNS_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_REDIRECTS: usize = 10;

    pub const PERSISTENCE_CHECKPOINT_BYTES: ByteCount = 1024 * 1024;
    pub const FILE_BUFFER_SIZE: usize = 256 * 1024;
    pub const WAL_CHECKPOINT_EVERY: usize = 256;
}

/// Capabilities discovered by the HEAD probe. Captured once per task run
/// and treated as immutable afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    pub supports_ranges: bool,
    pub supports_compression: bool,
    pub content_length: ByteCount,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub http_status: u16,
}

impl ServerCapabilities {
    pub fn unknown_length() -> Self {
        Self {
            content_length: -1,
            ..Self::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.http_status >= 200 && self.http_status < 400
    }

    pub fn can_segment(&self) -> bool {
        self.supports_ranges && self.content_length > 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadProgress {
    pub downloaded_bytes: ByteCount,
    pub total_bytes: ByteCount,
    pub current_speed: SpeedBps,
    pub average_speed: SpeedBps,
    pub progress_percent: f64,
    pub active_segments: usize,
    pub completed_segments: usize,
    pub total_segments: usize,
}

impl DownloadProgress {
    pub fn is_indeterminate(&self) -> bool {
        self.total_bytes <= 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_i64(self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => Priority::Low,
            2 => Priority::High,
            3 => Priority::Urgent,
            _ => Priority::Normal,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DownloadState {
    Queued = 0,
    Probing = 1,
    Downloading = 2,
    Paused = 3,
    Merging = 4,
    Verifying = 5,
    Completed = 6,
    Failed = 7,
}

impl DownloadState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => DownloadState::Probing,
            2 => DownloadState::Downloading,
            3 => DownloadState::Paused,
            4 => DownloadState::Merging,
            5 => DownloadState::Verifying,
            6 => DownloadState::Completed,
            7 => DownloadState::Failed,
            _ => DownloadState::Queued,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::Queued => "queued",
            DownloadState::Probing => "probing",
            DownloadState::Downloading => "downloading",
            DownloadState::Paused => "paused",
            DownloadState::Merging => "merging",
            DownloadState::Verifying => "verifying",
            DownloadState::Completed => "completed",
            DownloadState::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(DownloadState::Queued),
            "probing" => Some(DownloadState::Probing),
            "downloading" => Some(DownloadState::Downloading),
            "paused" => Some(DownloadState::Paused),
            "merging" => Some(DownloadState::Merging),
            "verifying" => Some(DownloadState::Verifying),
            "completed" => Some(DownloadState::Completed),
            "failed" => Some(DownloadState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Completed | DownloadState::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DownloadState::Probing
                | DownloadState::Downloading
                | DownloadState::Merging
                | DownloadState::Verifying
        )
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_validity_follows_status() {
        let mut caps = ServerCapabilities::unknown_length();
        caps.http_status = 200;
        assert!(caps.is_valid());
        caps.http_status = 302;
        assert!(caps.is_valid());
        caps.http_status = 404;
        assert!(!caps.is_valid());
        caps.http_status = 503;
        assert!(!caps.is_valid());
    }

    #[test]
    fn segmentation_requires_ranges_and_length() {
        let mut caps = ServerCapabilities::unknown_length();
        caps.supports_ranges = true;
        assert!(!caps.can_segment());
        caps.content_length = 10;
        assert!(caps.can_segment());
        caps.supports_ranges = false;
        assert!(!caps.can_segment());
    }

    #[test]
    fn download_state_round_trips_through_str() {
        for state in [
            DownloadState::Queued,
            DownloadState::Probing,
            DownloadState::Downloading,
            DownloadState::Paused,
            DownloadState::Merging,
            DownloadState::Verifying,
            DownloadState::Completed,
            DownloadState::Failed,
        ] {
            assert_eq!(DownloadState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(DownloadState::from_str("bogus"), None);
    }
}
