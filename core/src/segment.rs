use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::error::{DownloadError, ErrorCategory};
use crate::types::constants;
use crate::types::{ByteCount, ByteOffset, SegmentId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SegmentState {
    Pending = 0,
    Active = 1,
    Paused = 2,
    Completed = 3,
    Failed = 4,
    Stolen = 5,
}

impl SegmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentState::Pending => "pending",
            SegmentState::Active => "active",
            SegmentState::Paused => "paused",
            SegmentState::Completed => "completed",
            SegmentState::Failed => "failed",
            SegmentState::Stolen => "stolen",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SegmentState::Pending),
            "active" => Some(SegmentState::Active),
            "paused" => Some(SegmentState::Paused),
            "completed" => Some(SegmentState::Completed),
            "failed" => Some(SegmentState::Failed),
            "stolen" => Some(SegmentState::Stolen),
            _ => None,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SegmentState::Active,
            2 => SegmentState::Paused,
            3 => SegmentState::Completed,
            4 => SegmentState::Failed,
            5 => SegmentState::Stolen,
            _ => SegmentState::Pending,
        }
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct SegmentMeta {
    checksum: u32,
    temp_file_path: Option<PathBuf>,
    retry_count: u32,
    last_error: Option<DownloadError>,
}

/// A contiguous byte range `[start, end]` (inclusive both ends) downloaded
/// as a unit. Progress fields are atomic so workers and the scheduler can
/// observe them without taking a lock; `end` shrinks only under the
/// scheduler lock during a work-stealing split, and the owning worker
/// re-reads it with acquire ordering on every write iteration.
#[derive(Debug)]
pub struct Segment {
    id: SegmentId,
    start: ByteOffset,
    bounded: bool,
    end: AtomicI64,
    current: AtomicI64,
    state: AtomicU8,
    meta: Mutex<SegmentMeta>,
}

impl Segment {
    pub fn new(id: SegmentId, start: ByteOffset, end: ByteOffset) -> Self {
        Self {
            id,
            start,
            bounded: true,
            end: AtomicI64::new(end),
            current: AtomicI64::new(start),
            state: AtomicU8::new(SegmentState::Pending as u8),
            meta: Mutex::new(SegmentMeta::default()),
        }
    }

    /// Single segment for a download whose total size is unknown: no byte
    /// range, reads to EOF, `end` is fixed once the stream finishes.
    pub fn unbounded(id: SegmentId) -> Self {
        let segment = Self::new(id, 0, -1);
        Self {
            bounded: false,
            ..segment
        }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn start(&self) -> ByteOffset {
        self.start
    }

    pub fn end(&self) -> ByteOffset {
        self.end.load(Ordering::Acquire)
    }

    pub fn is_bounded(&self) -> bool {
        self.bounded
    }

    pub fn current_byte(&self) -> ByteOffset {
        self.current.load(Ordering::Acquire)
    }

    pub fn total_size(&self) -> ByteCount {
        if self.bounded {
            self.end() - self.start + 1
        } else {
            -1
        }
    }

    pub fn downloaded_bytes(&self) -> ByteCount {
        self.current_byte() - self.start
    }

    pub fn remaining_bytes(&self) -> ByteCount {
        if self.bounded {
            self.end() - self.current_byte() + 1
        } else {
            ByteCount::MAX
        }
    }

    pub fn state(&self) -> SegmentState {
        SegmentState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SegmentState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.state() == SegmentState::Completed
    }

    /// Advance the download position and fold the same bytes into the
    /// rolling CRC in one critical step, so a persisted snapshot never
    /// records a position the checksum has not caught up with.
    pub fn advance(&self, data: &[u8]) -> ByteOffset {
        let mut meta = self.meta.lock().unwrap();
        let mut hasher = crc32fast::Hasher::new_with_initial(meta.checksum);
        hasher.update(data);
        meta.checksum = hasher.finalize();
        self.current
            .fetch_add(data.len() as i64, Ordering::Release)
            + data.len() as i64
    }

    /// Rewind to the range start, discarding checksum progress. Used when
    /// an unbounded stream cannot resume and must restart from zero.
    pub fn reset_progress(&self) {
        let mut meta = self.meta.lock().unwrap();
        meta.checksum = 0;
        self.current.store(self.start, Ordering::Release);
    }

    pub fn checksum(&self) -> u32 {
        self.meta.lock().unwrap().checksum
    }

    pub fn temp_file_path(&self) -> Option<PathBuf> {
        self.meta.lock().unwrap().temp_file_path.clone()
    }

    pub fn set_temp_file_path(&self, path: PathBuf) {
        self.meta.lock().unwrap().temp_file_path = Some(path);
    }

    pub fn retry_count(&self) -> u32 {
        self.meta.lock().unwrap().retry_count
    }

    pub fn increment_retry(&self) -> u32 {
        let mut meta = self.meta.lock().unwrap();
        meta.retry_count += 1;
        meta.retry_count
    }

    /// Mark the segment permanently failed regardless of attempts so far.
    pub fn exhaust_retries(&self) -> u32 {
        let mut meta = self.meta.lock().unwrap();
        meta.retry_count = constants::MAX_RETRIES;
        meta.retry_count
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count() < constants::MAX_RETRIES
    }

    pub fn last_error(&self) -> Option<DownloadError> {
        self.meta.lock().unwrap().last_error.clone()
    }

    pub fn set_last_error(&self, error: DownloadError) {
        self.meta.lock().unwrap().last_error = Some(error);
    }

    /// `Range` header value for the next request, re-reading `end` so a
    /// retry after a split asks only for the shrunken range.
    pub fn range_header(&self) -> Option<String> {
        if self.bounded {
            Some(format!("bytes={}-{}", self.current_byte(), self.end()))
        } else {
            None
        }
    }

    pub fn is_splittable(&self, min_steal: ByteCount) -> bool {
        self.bounded && self.remaining_bytes() >= min_steal * 2
    }

    /// Split the remaining work in half: this segment keeps
    /// `[current, mid - 1]`, the returned segment covers `[mid, end]`.
    /// Caller must hold the scheduler lock; the donor worker observes the
    /// shortened `end` on its next write iteration and truncates there.
    pub fn split(&self, new_id: SegmentId) -> Option<Segment> {
        if !self.is_splittable(constants::MIN_STEAL_SIZE) {
            return None;
        }
        let current = self.current_byte();
        let old_end = self.end();
        let mid = current + (old_end - current + 1) / 2;
        self.end.store(mid - 1, Ordering::Release);
        Some(Segment::new(new_id, mid, old_end))
    }

    /// Pin `end` to the final position of an unbounded stream.
    pub fn finish_unbounded(&self) {
        if !self.bounded {
            self.end.store(self.current_byte() - 1, Ordering::Release);
        }
    }

    pub fn snapshot(&self) -> SegmentSnapshot {
        let meta = self.meta.lock().unwrap();
        SegmentSnapshot {
            id: self.id,
            start: self.start,
            end: self.end(),
            current: self.current_byte(),
            state: self.state(),
            checksum: meta.checksum,
            temp_file_path: meta
                .temp_file_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            retry_count: meta.retry_count,
            last_error: meta.last_error.as_ref().map(|e| e.message.clone()),
        }
    }

    pub fn restore(snapshot: &SegmentSnapshot) -> Self {
        // An end below start with unfinished work marks a stream of
        // unknown length; a completed empty segment looks the same but
        // stays bounded.
        let bounded = snapshot.end >= snapshot.start || snapshot.state == SegmentState::Completed;
        Self {
            id: snapshot.id,
            start: snapshot.start,
            bounded,
            end: AtomicI64::new(snapshot.end),
            current: AtomicI64::new(snapshot.current),
            state: AtomicU8::new(snapshot.state as u8),
            meta: Mutex::new(SegmentMeta {
                checksum: snapshot.checksum,
                temp_file_path: snapshot.temp_file_path.as_ref().map(PathBuf::from),
                retry_count: snapshot.retry_count,
                last_error: snapshot
                    .last_error
                    .as_ref()
                    .map(|message| DownloadError::new(ErrorCategory::Unknown, message.clone())),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSnapshot {
    pub id: SegmentId,
    pub start: ByteOffset,
    pub end: ByteOffset,
    pub current: ByteOffset,
    pub state: SegmentState,
    pub checksum: u32,
    pub temp_file_path: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

/// Partition `[0, total_size)` into `count` contiguous ranges, remainder
/// appended to the last one. `count` is clamped by the caller.
pub fn partition_ranges(total_size: ByteCount, count: usize) -> Vec<(ByteOffset, ByteOffset)> {
    if total_size <= 0 || count == 0 {
        return Vec::new();
    }
    let count = count.min(total_size as usize) as i64;
    let base = total_size / count;
    let mut ranges = Vec::with_capacity(count as usize);
    let mut start = 0i64;
    for index in 0..count {
        let end = if index == count - 1 {
            total_size - 1
        } else {
            start + base - 1
        };
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

/// Segment count sized so each segment gets at least MIN_SEGMENT_SIZE,
/// clamped to the allowed range.
pub fn optimal_segment_count(total_size: ByteCount) -> usize {
    if total_size <= 0 {
        return constants::MIN_SEGMENTS;
    }
    let by_size = (total_size / constants::MIN_SEGMENT_SIZE) as usize;
    by_size.clamp(constants::MIN_SEGMENTS, constants::MAX_SEGMENTS)
}
