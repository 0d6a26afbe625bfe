use crate::error::DownloadError;
use crate::types::{ByteCount, DownloadProgress, DownloadState, SegmentId, SpeedBps, TaskId};

/// Per-task event stream. Emitted from the task's monitor thread, so
/// observers see a monotonic sequence per task.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    StateChanged(DownloadState),
    ProgressChanged(DownloadProgress),
    SpeedChanged(SpeedBps),
    FileNameChanged(String),
    SegmentCompleted(SegmentId),
    SegmentFailed(SegmentId, String),
    Rebalanced(usize),
    Completed,
    Failed(DownloadError),
}

/// Manager-level lifecycle and statistics stream.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    DownloadAdded(TaskId),
    DownloadRemoved(TaskId),
    DownloadStarted(TaskId),
    DownloadPaused(TaskId),
    DownloadResumed(TaskId),
    DownloadCompleted(TaskId),
    DownloadFailed(TaskId, String),
    Stats(ManagerStats),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerStats {
    pub active: usize,
    pub queued: usize,
    pub completed: usize,
    pub total: usize,
    pub global_speed: SpeedBps,
    pub session_bytes: ByteCount,
}
