use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::DownloadError;
use crate::net::{classify_read_error, HttpClient, HttpRequest};
use crate::scheduler::{SegmentScheduler, WorkerId};
use crate::segment::{Segment, SegmentState};
use crate::speed::SpeedMeter;
use crate::throttle::Throttle;
use crate::types::constants;

/// Stop/pause switchboard shared by every worker of one task.
pub struct WorkerControl {
    stop: AtomicBool,
    pause: AtomicBool,
    pause_lock: Mutex<()>,
    pause_cond: Condvar,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            pause: AtomicBool::new(false),
            pause_lock: Mutex::new(()),
            pause_cond: Condvar::new(),
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.pause.store(false, Ordering::Release);
        self.pause_cond.notify_all();
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.pause.store(false, Ordering::Release);
        self.pause_cond.notify_all();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::Acquire)
    }

    fn wait_while_paused(&self) {
        let mut guard = self.pause_lock.lock().unwrap_or_else(|p| p.into_inner());
        while self.pause_requested() && !self.stop_requested() {
            let (g, _) = self
                .pause_cond
                .wait_timeout(guard, Duration::from_millis(100))
                .unwrap_or_else(|p| p.into_inner());
            guard = g;
        }
    }
}

impl Default for WorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a worker needs besides its identity; cloned per worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub url: String,
    pub user_agent: String,
    pub referer: Option<String>,
    pub proxy: Option<crate::config::ProxyConfig>,
    pub verify_tls: bool,
    pub dest_dir: PathBuf,
    pub file_name: String,
    pub client: Arc<dyn HttpClient>,
    pub scheduler: Arc<SegmentScheduler>,
    pub control: Arc<WorkerControl>,
    pub throttle: Throttle,
    /// False when the server does not honor byte ranges; transfers then
    /// always restart from the beginning of their segment.
    pub use_ranges: bool,
    /// Raised when a ranged GET came back 200: the server ignored the
    /// range and the task must downgrade to a single segment.
    pub range_ignored: Arc<AtomicBool>,
}

enum Outcome {
    Completed,
    Stopped,
    Paused,
    RangeIgnored,
    Failed(DownloadError),
}

/// One thread of execution: acquire a segment, transfer its range, hand it
/// back, repeat until the scheduler runs dry or the task stops.
pub struct SegmentWorker {
    id: WorkerId,
    ctx: WorkerContext,
    speed: SpeedMeter,
}

impl SegmentWorker {
    pub fn new(id: WorkerId, ctx: WorkerContext) -> Self {
        Self {
            id,
            ctx,
            speed: SpeedMeter::new(),
        }
    }

    pub fn run(&mut self) {
        debug!(worker = self.id, "worker started");
        loop {
            if self.ctx.control.stop_requested() {
                break;
            }
            self.ctx.control.wait_while_paused();
            if self.ctx.control.stop_requested() {
                break;
            }

            let Some(segment) = self.ctx.scheduler.acquire_segment(self.id) else {
                if self.ctx.scheduler.is_cancelled() {
                    break;
                }
                if !self.ctx.scheduler.wait_for_work(constants::WORK_WAIT_TIMEOUT)
                    && (self.ctx.scheduler.is_all_complete() || self.ctx.scheduler.has_failed())
                {
                    break;
                }
                continue;
            };

            match self.download_segment(&segment) {
                Outcome::Completed => {
                    segment.set_state(SegmentState::Completed);
                    self.ctx.scheduler.release_segment(self.id, &segment);
                }
                Outcome::Stopped => {
                    segment.set_state(SegmentState::Paused);
                    self.ctx.scheduler.release_segment(self.id, &segment);
                    break;
                }
                Outcome::Paused => {
                    segment.set_state(SegmentState::Paused);
                    self.ctx.scheduler.release_segment(self.id, &segment);
                }
                Outcome::RangeIgnored => {
                    self.ctx.range_ignored.store(true, Ordering::Release);
                    segment.set_state(SegmentState::Paused);
                    self.ctx.scheduler.release_segment(self.id, &segment);
                    break;
                }
                Outcome::Failed(mut error) => {
                    warn!(worker = self.id, segment = segment.id(), %error, "segment failed");
                    let retries = if error.is_recoverable() {
                        segment.increment_retry()
                    } else {
                        segment.exhaust_retries()
                    };
                    error.retry_count = retries;
                    segment.set_last_error(error.clone());
                    segment.set_state(SegmentState::Failed);
                    self.ctx.scheduler.release_segment(self.id, &segment);
                    if error.is_recoverable() && retries < constants::MAX_RETRIES {
                        std::thread::sleep(retry_backoff(retries));
                    }
                }
            }
        }
        self.ctx.scheduler.report_throughput(self.id, 0.0);
        debug!(worker = self.id, "worker finished");
    }

    fn download_segment(&mut self, segment: &Arc<Segment>) -> Outcome {
        let ranged = segment.is_bounded() && self.ctx.use_ranges;
        // Without ranges there is no way to resume mid-segment; partial
        // progress restarts from zero.
        if !ranged && segment.current_byte() > segment.start() {
            segment.reset_progress();
        }

        let temp_path = match self.temp_file_path(segment) {
            Ok(path) => path,
            Err(error) => return Outcome::Failed(error),
        };

        // A crash can leave the part file out of step with the recorded
        // position (and its checksum); a mismatch restarts the segment.
        if segment.downloaded_bytes() > 0 {
            let on_disk = fs::metadata(&temp_path)
                .map(|meta| meta.len() as i64)
                .unwrap_or(0);
            if on_disk != segment.downloaded_bytes() {
                warn!(
                    segment = segment.id(),
                    on_disk,
                    recorded = segment.downloaded_bytes(),
                    "part file out of step, restarting segment"
                );
                segment.reset_progress();
            }
        }

        let resuming = segment.downloaded_bytes() > 0;
        let mut file = {
            let mut options = OpenOptions::new();
            options.create(true);
            if resuming {
                options.append(true);
            } else {
                options.write(true).truncate(true);
            }
            match options.open(&temp_path) {
                Ok(file) => file,
                Err(err) => {
                    return Outcome::Failed(
                        DownloadError::file_system(format!(
                            "failed to open temp file {}",
                            temp_path.display()
                        ))
                        .with_details(err.to_string()),
                    )
                }
            }
        };

        let mut request = HttpRequest::new(self.ctx.url.clone(), self.ctx.user_agent.clone());
        request.referer = self.ctx.referer.clone();
        request.proxy = self.ctx.proxy.clone();
        request.verify_tls = self.ctx.verify_tls;
        if ranged {
            // end re-read here so a retry after a split shrinks the ask
            request.range = Some((segment.current_byte(), segment.end()));
        }

        debug!(
            worker = self.id,
            segment = segment.id(),
            range = ?request.range,
            "segment transfer starting"
        );

        let response = match self.ctx.client.get(&request) {
            Ok(response) => response,
            Err(error) => return Outcome::Failed(error),
        };

        if request.range.is_some() {
            match response.status {
                206 => {}
                200 => return Outcome::RangeIgnored,
                status => return Outcome::Failed(DownloadError::from_http_status(status)),
            }
        } else if !(200..300).contains(&response.status) {
            return Outcome::Failed(DownloadError::from_http_status(response.status));
        }

        let mut body = response.body;
        let mut buf = vec![0u8; constants::CHUNK_SIZE];
        loop {
            if self.ctx.control.stop_requested() {
                return Outcome::Stopped;
            }
            if self.ctx.control.pause_requested() {
                return Outcome::Paused;
            }

            let read = match body.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => return Outcome::Failed(classify_read_error(&err)),
            };

            // Cooperative truncation: a split may have shrunk `end` since
            // the last iteration, so never write past it.
            let mut write_len = read;
            if segment.is_bounded() {
                let current = segment.current_byte();
                let end = segment.end();
                if current > end {
                    write_len = 0;
                } else {
                    write_len = read.min((end - current + 1) as usize);
                }
            }

            if write_len > 0 {
                if let Err(err) = file.write_all(&buf[..write_len]) {
                    return Outcome::Failed(
                        DownloadError::file_system("failed to write temp file")
                            .with_details(err.to_string()),
                    );
                }
                segment.advance(&buf[..write_len]);
                self.speed.record(write_len as u64);
                self.ctx
                    .scheduler
                    .report_throughput(self.id, self.speed.bytes_per_second());
                self.ctx.throttle.throttle(write_len as u64);
            }

            if write_len < read {
                // reached the (possibly stolen) end; the remainder of this
                // chunk belongs to the new owner
                break;
            }
        }

        if let Err(err) = file.flush() {
            return Outcome::Failed(
                DownloadError::file_system("failed to flush temp file")
                    .with_details(err.to_string()),
            );
        }

        if segment.is_bounded() {
            if segment.current_byte() <= segment.end() {
                return Outcome::Failed(DownloadError::network("transfer ended early").with_details(
                    format!(
                        "got {} of {} bytes",
                        segment.downloaded_bytes(),
                        segment.total_size()
                    ),
                ));
            }
        } else {
            segment.finish_unbounded();
        }

        debug!(worker = self.id, segment = segment.id(), "segment completed");
        Outcome::Completed
    }

    fn temp_file_path(&self, segment: &Arc<Segment>) -> Result<PathBuf, DownloadError> {
        let path = segment.temp_file_path().unwrap_or_else(|| {
            let path = temp_path_for(&self.ctx.dest_dir, &self.ctx.file_name, segment.id() as u64);
            segment.set_temp_file_path(path.clone());
            path
        });
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    DownloadError::file_system("failed to create download directory")
                        .with_details(err.to_string())
                })?;
            }
        }
        Ok(path)
    }
}

pub fn temp_path_for(dest_dir: &Path, file_name: &str, segment_id: u64) -> PathBuf {
    dest_dir.join(format!(".{}.part{}", file_name, segment_id))
}

/// Exponential backoff: 1 s after the first failure, doubling up to the
/// ceiling.
pub fn retry_backoff(retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(16);
    let delay = constants::RETRY_BACKOFF_BASE * 2u32.pow(exponent);
    delay.min(constants::MAX_RETRY_DELAY)
}
