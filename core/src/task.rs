use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, warn};

use crate::checksum::{fold_segment_crcs, verify_checksum, ChecksumRequest};
use crate::config::EngineConfig;
use crate::error::{now_epoch, DownloadError, EngineError, EngineResult, ErrorCategory};
use crate::events::TaskEvent;
use crate::net::{HttpClient, HttpRequest};
use crate::probe::{filename_from_url, NetworkProbe};
use crate::scheduler::{SchedulerEvent, SegmentScheduler};
use crate::segment::{SegmentSnapshot, SegmentState};
use crate::storage::{PersistenceManager, TaskRecord};
use crate::throttle::Throttle;
use crate::types::constants;
use crate::types::{
    ByteCount, DownloadProgress, DownloadState, Priority, ServerCapabilities, SpeedBps, TaskId,
};
use crate::worker::{SegmentWorker, WorkerContext, WorkerControl};

struct TaskInfo {
    file_name: String,
    explicit_name: bool,
    dest_dir: PathBuf,
    capabilities: Option<ServerCapabilities>,
    priority: Priority,
    last_error: DownloadError,
    checksum: Option<ChecksumRequest>,
    created_at: u64,
    start_time: Option<Instant>,
    current_speed: SpeedBps,
    control: Arc<WorkerControl>,
}

enum RunOutcome {
    Completed,
    Failed(DownloadError),
    Cancelled,
    Stopped,
    RangeIgnored,
}

/// One file download, start to finish: probe, segmented transfer, merge,
/// verify. The manager owns the task; the task owns its scheduler and
/// joins its workers before the run thread exits.
pub struct DownloadTask {
    id: TaskId,
    url: String,
    state: AtomicU8,
    total_size: AtomicI64,
    downloaded: AtomicI64,
    cancel_requested: AtomicBool,
    range_ignored: Arc<AtomicBool>,
    info: Mutex<TaskInfo>,
    scheduler: Arc<SegmentScheduler>,
    scheduler_events: Mutex<Receiver<SchedulerEvent>>,
    client: Arc<dyn HttpClient>,
    persistence: Arc<PersistenceManager>,
    events: Sender<(TaskId, TaskEvent)>,
    config: EngineConfig,
    throttle: Throttle,
    run_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: String,
        dest: &Path,
        config: EngineConfig,
        client: Arc<dyn HttpClient>,
        persistence: Arc<PersistenceManager>,
        events: Sender<(TaskId, TaskEvent)>,
        throttle: Throttle,
    ) -> Arc<Self> {
        let (dest_dir, file_name, explicit_name) = resolve_destination(dest, &url);
        let (scheduler, scheduler_events) = SegmentScheduler::new();

        Arc::new(Self {
            id: TaskId::new_v4(),
            url,
            state: AtomicU8::new(DownloadState::Queued as u8),
            total_size: AtomicI64::new(-1),
            downloaded: AtomicI64::new(0),
            cancel_requested: AtomicBool::new(false),
            range_ignored: Arc::new(AtomicBool::new(false)),
            info: Mutex::new(TaskInfo {
                file_name,
                explicit_name,
                dest_dir,
                capabilities: None,
                priority: Priority::Normal,
                last_error: DownloadError::default(),
                checksum: None,
                created_at: now_epoch(),
                start_time: None,
                current_speed: 0.0,
                control: Arc::new(WorkerControl::new()),
            }),
            scheduler: Arc::new(scheduler),
            scheduler_events: Mutex::new(scheduler_events),
            client,
            persistence,
            events,
            config,
            throttle,
            run_thread: Mutex::new(None),
        })
    }

    /// Rebuild a task from its persisted record and segment snapshots.
    /// Tasks interrupted mid-transfer come back as Paused with their
    /// segments demoted to Pending, ready to resume at the persisted
    /// positions.
    pub fn restore(
        record: &TaskRecord,
        snapshots: &[SegmentSnapshot],
        config: EngineConfig,
        client: Arc<dyn HttpClient>,
        persistence: Arc<PersistenceManager>,
        events: Sender<(TaskId, TaskEvent)>,
        throttle: Throttle,
    ) -> Arc<Self> {
        let (scheduler, scheduler_events) = SegmentScheduler::new();
        if !snapshots.is_empty() {
            scheduler.restore_segments(snapshots);
        }

        let state = match record.state {
            DownloadState::Probing
            | DownloadState::Downloading
            | DownloadState::Merging
            | DownloadState::Verifying => DownloadState::Paused,
            other => other,
        };

        // Capabilities are only re-synthesized when a previous run probed
        // successfully; a queued task probes from scratch.
        let capabilities = if !snapshots.is_empty() {
            Some(ServerCapabilities {
                supports_ranges: record.supports_ranges,
                supports_compression: false,
                content_length: record.total_size,
                content_type: record.content_type.clone(),
                file_name: None,
                etag: None,
                last_modified: None,
                http_status: 200,
            })
        } else {
            None
        };

        let path = PathBuf::from(&record.file_path);
        let dest_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        Arc::new(Self {
            id: record.id,
            url: record.url.clone(),
            state: AtomicU8::new(state as u8),
            total_size: AtomicI64::new(record.total_size),
            downloaded: AtomicI64::new(record.downloaded_size),
            cancel_requested: AtomicBool::new(false),
            range_ignored: Arc::new(AtomicBool::new(false)),
            info: Mutex::new(TaskInfo {
                file_name: record.file_name.clone(),
                explicit_name: true,
                dest_dir,
                capabilities,
                priority: record.priority,
                last_error: match &record.error_message {
                    Some(message) => {
                        DownloadError::new(ErrorCategory::Unknown, message.clone())
                    }
                    None => DownloadError::default(),
                },
                checksum: None,
                created_at: record.created_at,
                start_time: None,
                current_speed: 0.0,
                control: Arc::new(WorkerControl::new()),
            }),
            scheduler: Arc::new(scheduler),
            scheduler_events: Mutex::new(scheduler_events),
            client,
            persistence,
            events,
            config,
            throttle,
            run_thread: Mutex::new(None),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> DownloadState {
        DownloadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn total_size(&self) -> ByteCount {
        self.total_size.load(Ordering::Acquire)
    }

    pub fn downloaded_bytes(&self) -> ByteCount {
        self.downloaded.load(Ordering::Acquire)
    }

    pub fn speed(&self) -> SpeedBps {
        self.info.lock().unwrap().current_speed
    }

    pub fn priority(&self) -> Priority {
        self.info.lock().unwrap().priority
    }

    pub fn set_priority(&self, priority: Priority) {
        self.info.lock().unwrap().priority = priority;
        self.persist_task();
    }

    pub fn set_checksum(&self, checksum: ChecksumRequest) {
        self.info.lock().unwrap().checksum = Some(checksum);
    }

    pub fn file_name(&self) -> String {
        self.info.lock().unwrap().file_name.clone()
    }

    pub fn file_path(&self) -> PathBuf {
        let info = self.info.lock().unwrap();
        info.dest_dir.join(&info.file_name)
    }

    pub fn last_error(&self) -> DownloadError {
        self.info.lock().unwrap().last_error.clone()
    }

    pub fn progress(&self) -> DownloadProgress {
        let total = self.total_size();
        let downloaded = self.downloaded_bytes();
        DownloadProgress {
            downloaded_bytes: downloaded,
            total_bytes: total,
            current_speed: self.speed(),
            average_speed: self.average_speed(),
            progress_percent: if total > 0 {
                downloaded as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            active_segments: self.scheduler.active_count(),
            completed_segments: self.scheduler.completed_count(),
            total_segments: self.scheduler.segment_count(),
        }
    }

    fn average_speed(&self) -> SpeedBps {
        let info = self.info.lock().unwrap();
        match info.start_time {
            Some(start) => {
                let secs = start.elapsed().as_secs_f64();
                if secs > 0.0 {
                    self.downloaded_bytes() as f64 / secs
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    /// Begin (or restart) the download. Valid from Queued; a Failed task
    /// goes through `retry` first.
    pub fn start(self: &Arc<Self>) -> EngineResult<()> {
        match self.state() {
            DownloadState::Queued => {}
            DownloadState::Paused => return self.resume(),
            other => {
                return Err(EngineError::InvalidState(format!(
                    "cannot start task in state {}",
                    other
                )))
            }
        }
        self.info.lock().unwrap().start_time = Some(Instant::now());
        self.spawn_run_thread();
        Ok(())
    }

    pub fn pause(&self) -> EngineResult<()> {
        if self.state() != DownloadState::Downloading {
            return Err(EngineError::InvalidState(format!(
                "cannot pause task in state {}",
                self.state()
            )));
        }
        self.set_state(DownloadState::Paused);
        self.control().request_pause();
        self.scheduler.pause_all();
        self.persist_all();
        Ok(())
    }

    pub fn resume(self: &Arc<Self>) -> EngineResult<()> {
        if self.state() != DownloadState::Paused {
            return Err(EngineError::InvalidState(format!(
                "cannot resume task in state {}",
                self.state()
            )));
        }
        self.info.lock().unwrap().start_time = Some(Instant::now());
        self.scheduler.resume_all();
        self.set_state(DownloadState::Downloading);
        self.control().resume();
        if !self.run_thread_alive() {
            self.spawn_run_thread();
        }
        self.persist_task();
        Ok(())
    }

    /// Cancel the download: terminal Failed with category Cancelled, part
    /// files removed.
    pub fn cancel(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.cancel_requested.store(true, Ordering::Release);
        let error = DownloadError::cancelled();
        self.info.lock().unwrap().last_error = error.clone();
        self.set_state(DownloadState::Failed);
        self.control().request_stop();
        self.scheduler.cancel_all();
        if !self.run_thread_alive() {
            self.cleanup_temp_files();
            self.persist_all();
        }
        let _ = self.events.send((self.id, TaskEvent::Failed(error)));
    }

    /// Put a Failed task back in the queue with a clean slate.
    pub fn retry(&self) -> EngineResult<()> {
        if self.state() != DownloadState::Failed {
            return Err(EngineError::InvalidState(format!(
                "cannot retry task in state {}",
                self.state()
            )));
        }
        self.cancel_requested.store(false, Ordering::Release);
        self.range_ignored.store(false, Ordering::Release);
        self.scheduler.reset();
        {
            let mut info = self.info.lock().unwrap();
            info.last_error = DownloadError::default();
            info.control = Arc::new(WorkerControl::new());
        }
        self.downloaded.store(0, Ordering::Release);
        self.set_state(DownloadState::Queued);
        self.persist_task();
        Ok(())
    }

    /// Signal-then-join with the run thread; used by manager shutdown.
    pub fn shutdown(&self) {
        self.control().request_stop();
        self.scheduler.wake_all_workers();
        let handle = self.run_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn control(&self) -> Arc<WorkerControl> {
        Arc::clone(&self.info.lock().unwrap().control)
    }

    fn run_thread_alive(&self) -> bool {
        self.run_thread
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn spawn_run_thread(self: &Arc<Self>) {
        let task = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("parget-task-{}", &self.id.to_string()[..8]))
            .spawn(move || task.run())
            .expect("spawn task thread");
        *self.run_thread.lock().unwrap() = Some(handle);
    }

    fn run(self: Arc<Self>) {
        if self.capabilities().is_none() {
            self.set_state(DownloadState::Probing);
            self.persist_task();
            let request = self.base_request();
            match NetworkProbe::probe(self.client.as_ref(), &request) {
                Ok(caps) => self.apply_capabilities(caps),
                Err(error) => {
                    self.fail(error);
                    return;
                }
            }
        }

        let mut downgraded = false;
        loop {
            match self.run_download() {
                RunOutcome::Completed => {
                    self.finish();
                    break;
                }
                RunOutcome::Failed(error) => {
                    self.fail(error);
                    break;
                }
                RunOutcome::Cancelled => {
                    self.cleanup_temp_files();
                    self.persist_all();
                    break;
                }
                RunOutcome::Stopped => {
                    // engine shutdown: keep part files for the next run
                    self.persist_all();
                    break;
                }
                RunOutcome::RangeIgnored => {
                    if downgraded {
                        self.fail(DownloadError::network(
                            "server keeps ignoring range requests",
                        ));
                        break;
                    }
                    downgraded = true;
                    self.downgrade_to_single_segment();
                }
            }
        }
    }

    fn run_download(self: &Arc<Self>) -> RunOutcome {
        let caps = self.capabilities().unwrap_or_default();
        let total = self.total_size();
        let use_ranges = caps.supports_ranges && total > 0;

        if self.scheduler.segment_count() == 0 {
            let count = if use_ranges {
                let by_size = (total / self.config.min_segment_size.max(1)) as usize;
                by_size.clamp(constants::MIN_SEGMENTS, self.config.segment_limit())
            } else {
                1
            };
            self.scheduler.initialize_segments(total, count);
        }

        self.set_state(DownloadState::Downloading);
        self.persist_all();

        let worker_count = self
            .scheduler
            .segment_count()
            .min(constants::MAX_SEGMENTS)
            .min(self.config.worker_pool_limit)
            .max(1);

        let control = self.control();
        let info = self.info.lock().unwrap();
        let context = WorkerContext {
            url: self.url.clone(),
            user_agent: self.config.user_agent.clone(),
            referer: self.config.referer.clone(),
            proxy: self.config.proxy.clone(),
            verify_tls: self.config.verify_tls,
            dest_dir: info.dest_dir.clone(),
            file_name: info.file_name.clone(),
            client: Arc::clone(&self.client),
            scheduler: Arc::clone(&self.scheduler),
            control: Arc::clone(&control),
            throttle: self.throttle.clone(),
            use_ranges,
            range_ignored: Arc::clone(&self.range_ignored),
        };
        drop(info);

        debug!(task = %self.id, workers = worker_count, "starting workers");
        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let context = context.clone();
            let handle = std::thread::Builder::new()
                .name(format!("parget-worker-{}", worker_id))
                .spawn(move || SegmentWorker::new(worker_id, context).run())
                .expect("spawn worker thread");
            handles.push(handle);
        }

        let mut last_persisted = self.downloaded_bytes();
        let mut last_rebalance = Instant::now();
        let outcome = loop {
            std::thread::sleep(constants::PROGRESS_UPDATE_INTERVAL);
            self.forward_scheduler_events();

            if self.cancel_requested.load(Ordering::Acquire) {
                break RunOutcome::Cancelled;
            }
            if self.range_ignored.load(Ordering::Acquire) {
                control.request_stop();
                break RunOutcome::RangeIgnored;
            }
            if control.stop_requested() {
                break RunOutcome::Stopped;
            }
            if self.state() == DownloadState::Paused {
                continue;
            }

            let downloaded = self.scheduler.downloaded_bytes();
            let speed = self.scheduler.total_throughput();
            self.downloaded.store(downloaded, Ordering::Release);
            self.info.lock().unwrap().current_speed = speed;
            let _ = self
                .events
                .send((self.id, TaskEvent::ProgressChanged(self.progress())));
            let _ = self.events.send((self.id, TaskEvent::SpeedChanged(speed)));

            if downloaded - last_persisted >= constants::PERSISTENCE_CHECKPOINT_BYTES {
                last_persisted = downloaded;
                self.persist_all();
            }
            if last_rebalance.elapsed() >= constants::REBALANCE_INTERVAL {
                last_rebalance = Instant::now();
                self.scheduler.rebalance_segments();
            }

            if self.scheduler.has_failed() {
                break RunOutcome::Failed(self.first_segment_error());
            }
            if self.scheduler.is_all_complete() {
                break RunOutcome::Completed;
            }
        };

        // workers exit on completion, terminal failure, stop, or cancel;
        // pause keeps them parked, so it never reaches this join
        for handle in handles {
            let _ = handle.join();
        }

        self.forward_scheduler_events();
        self.downloaded
            .store(self.scheduler.downloaded_bytes(), Ordering::Release);
        self.persist_all();
        outcome
    }

    fn forward_scheduler_events(&self) {
        let receiver = self.scheduler_events.lock().unwrap();
        while let Ok(event) = receiver.try_recv() {
            let forwarded = match event {
                SchedulerEvent::SegmentCompleted(id) => Some(TaskEvent::SegmentCompleted(id)),
                SchedulerEvent::SegmentFailed(id, message) => {
                    Some(TaskEvent::SegmentFailed(id, message))
                }
                SchedulerEvent::Rebalanced(splits) => Some(TaskEvent::Rebalanced(splits)),
                SchedulerEvent::SegmentAdded(_) | SchedulerEvent::AllCompleted => None,
            };
            if let Some(event) = forwarded {
                let _ = self.events.send((self.id, event));
            }
        }
    }

    fn first_segment_error(&self) -> DownloadError {
        self.scheduler
            .all_segments()
            .iter()
            .find(|segment| segment.state() == SegmentState::Failed)
            .and_then(|segment| segment.last_error())
            .unwrap_or_else(|| DownloadError::network("segment failed"))
    }

    fn capabilities(&self) -> Option<ServerCapabilities> {
        self.info.lock().unwrap().capabilities.clone()
    }

    fn apply_capabilities(&self, caps: ServerCapabilities) {
        if caps.content_length >= 0 {
            self.total_size.store(caps.content_length, Ordering::Release);
        }
        let mut info = self.info.lock().unwrap();
        if !info.explicit_name {
            if let Some(name) = &caps.file_name {
                info.file_name = name.clone();
                let _ = self
                    .events
                    .send((self.id, TaskEvent::FileNameChanged(name.clone())));
            }
        }
        info.capabilities = Some(caps);
        drop(info);
        self.persist_task();
    }

    /// The server answered a ranged GET with 200: forget multi-segment
    /// plans and restart as a single stream.
    fn downgrade_to_single_segment(&self) {
        warn!(task = %self.id, "server ignored range request, downgrading to single segment");
        self.cleanup_temp_files();
        self.range_ignored.store(false, Ordering::Release);
        self.downloaded.store(0, Ordering::Release);
        self.scheduler.reset();
        let mut info = self.info.lock().unwrap();
        if let Some(caps) = info.capabilities.as_mut() {
            caps.supports_ranges = false;
        }
        info.control = Arc::new(WorkerControl::new());
        drop(info);
        self.persist_task();
    }

    fn finish(&self) {
        if let Err(error) = self.merge_segments() {
            self.remove_final_file();
            self.fail(error);
            return;
        }
        if let Err(error) = self.verify_file() {
            self.remove_final_file();
            self.fail(error);
            return;
        }
        self.cleanup_temp_files();
        self.set_state(DownloadState::Completed);
        self.persist_all();
        let _ = self.events.send((self.id, TaskEvent::Completed));
        debug!(task = %self.id, "download completed");
    }

    fn merge_segments(&self) -> Result<(), DownloadError> {
        self.set_state(DownloadState::Merging);
        let final_path = self.file_path();
        debug!(task = %self.id, path = %final_path.display(), "merging segments");

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                DownloadError::file_system("failed to create destination directory")
                    .with_details(err.to_string())
            })?;
        }

        let mut output = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&final_path)
            .map_err(|err| {
                DownloadError::file_system("failed to open destination file")
                    .with_details(err.to_string())
            })?;

        let mut segments = self.scheduler.all_segments();
        segments.sort_by_key(|segment| segment.start());

        let mut buf = vec![0u8; constants::FILE_BUFFER_SIZE];
        for segment in &segments {
            let expected = if segment.is_bounded() {
                segment.total_size()
            } else {
                segment.downloaded_bytes()
            };
            if expected <= 0 {
                continue;
            }
            let temp_path = segment.temp_file_path().ok_or_else(|| {
                DownloadError::file_system(format!("segment {} has no part file", segment.id()))
            })?;
            let mut input = File::open(&temp_path).map_err(|err| {
                DownloadError::file_system(format!(
                    "failed to open part file {}",
                    temp_path.display()
                ))
                .with_details(err.to_string())
            })?;

            let mut copied: ByteCount = 0;
            loop {
                let read = input.read(&mut buf).map_err(|err| {
                    DownloadError::file_system("failed to read part file")
                        .with_details(err.to_string())
                })?;
                if read == 0 {
                    break;
                }
                output.write_all(&buf[..read]).map_err(|err| {
                    DownloadError::file_system("failed to write destination file")
                        .with_details(err.to_string())
                })?;
                copied += read as ByteCount;
            }

            if copied != expected {
                return Err(DownloadError::file_system(format!(
                    "part file {} is short: {} of {} bytes",
                    temp_path.display(),
                    copied,
                    expected
                )));
            }
        }

        output.sync_all().map_err(|err| {
            DownloadError::file_system("failed to sync destination file")
                .with_details(err.to_string())
        })?;
        Ok(())
    }

    fn verify_file(&self) -> Result<(), DownloadError> {
        self.set_state(DownloadState::Verifying);
        let final_path = self.file_path();
        let total = self.total_size();

        if total > 0 {
            match fs::metadata(&final_path) {
                Ok(meta) => {
                    if meta.len() as ByteCount != total {
                        // size mismatch alone is advisory
                        warn!(
                            task = %self.id,
                            expected = total,
                            actual = meta.len(),
                            "final file size mismatch"
                        );
                    }
                }
                Err(err) => {
                    return Err(DownloadError::file_system("final file missing")
                        .with_details(err.to_string()))
                }
            }
        }

        if self.config.verify_crc {
            if let Some(folded) = fold_segment_crcs(&self.scheduler.snapshots()) {
                let actual = file_crc32(&final_path).map_err(|err| {
                    DownloadError::file_system("failed to read final file")
                        .with_details(err.to_string())
                })?;
                if actual != folded {
                    return Err(DownloadError::new(
                        ErrorCategory::Checksum,
                        "segment checksum aggregate does not match final file",
                    )
                    .with_details(format!("expected {:08x}, got {:08x}", folded, actual)));
                }
            }
        }

        if let Some(request) = self.info.lock().unwrap().checksum.clone() {
            if !verify_checksum(&final_path, &request) {
                return Err(DownloadError::new(
                    ErrorCategory::Checksum,
                    format!("{} checksum mismatch", request.checksum_type.as_str()),
                ));
            }
        }
        Ok(())
    }

    fn remove_final_file(&self) {
        let _ = fs::remove_file(self.file_path());
    }

    fn cleanup_temp_files(&self) {
        for segment in self.scheduler.all_segments() {
            if let Some(path) = segment.temp_file_path() {
                let _ = fs::remove_file(path);
            }
        }
    }

    fn fail(&self, error: DownloadError) {
        warn!(task = %self.id, %error, "download failed");
        self.info.lock().unwrap().last_error = error.clone();
        self.set_state(DownloadState::Failed);
        self.persist_all();
        let _ = self.events.send((self.id, TaskEvent::Failed(error)));
    }

    fn set_state(&self, new_state: DownloadState) {
        let old = self.state.swap(new_state as u8, Ordering::AcqRel);
        if old != new_state as u8 {
            debug!(task = %self.id, from = %DownloadState::from_u8(old), to = %new_state, "state changed");
            let _ = self
                .events
                .send((self.id, TaskEvent::StateChanged(new_state)));
            self.persist_task();
        }
    }

    fn base_request(&self) -> HttpRequest {
        let mut request = HttpRequest::new(self.url.clone(), self.config.user_agent.clone());
        request.referer = self.config.referer.clone();
        request.proxy = self.config.proxy.clone();
        request.verify_tls = self.config.verify_tls;
        request
    }

    pub fn to_record(&self) -> TaskRecord {
        let info = self.info.lock().unwrap();
        let caps = info.capabilities.clone().unwrap_or_default();
        let error = &info.last_error;
        TaskRecord {
            id: self.id,
            url: self.url.clone(),
            file_path: info.dest_dir.join(&info.file_name).to_string_lossy().to_string(),
            file_name: info.file_name.clone(),
            total_size: self.total_size(),
            downloaded_size: self.downloaded_bytes(),
            state: self.state(),
            supports_ranges: caps.supports_ranges,
            priority: info.priority,
            created_at: info.created_at,
            updated_at: now_epoch(),
            content_type: caps.content_type,
            error_message: if error.has_error() {
                Some(error.message.clone())
            } else {
                None
            },
        }
    }

    fn persist_task(&self) {
        self.persistence.save_task(self.to_record());
    }

    fn persist_all(&self) {
        self.persistence.save_task(self.to_record());
        self.persistence
            .save_segments(self.id, self.scheduler.snapshots());
    }
}

fn resolve_destination(dest: &Path, url: &str) -> (PathBuf, String, bool) {
    let fallback = || filename_from_url(url).unwrap_or_else(|| "download.bin".to_string());
    if dest.as_os_str().is_empty() {
        return (PathBuf::from("."), fallback(), false);
    }
    let looks_like_dir = dest.is_dir() || dest.to_string_lossy().ends_with('/');
    if looks_like_dir {
        (dest.to_path_buf(), fallback(), false)
    } else {
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(fallback);
        let dir = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        (dir, name, true)
    }
}

fn file_crc32(path: &Path) -> std::io::Result<u32> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; constants::FILE_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeHttpClient;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn wait_for_state(task: &Arc<DownloadTask>, state: DownloadState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if task.state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        task.state() == state
    }

    fn build_task(
        client: Arc<FakeHttpClient>,
        dir: &TempDir,
        file: &str,
    ) -> (Arc<DownloadTask>, Receiver<(TaskId, TaskEvent)>) {
        let (tx, rx) = mpsc::channel();
        let task = DownloadTask::new(
            "http://example.com/data.bin".to_string(),
            &dir.path().join(file),
            EngineConfig::default(),
            client,
            Arc::new(PersistenceManager::in_memory()),
            tx,
            Throttle::default(),
        );
        (task, rx)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 241) as u8).collect()
    }

    #[test]
    fn happy_path_parallel_download() {
        let data = pattern(10 * 1024 * 1024);
        let dir = TempDir::new().unwrap();
        let client = Arc::new(FakeHttpClient::new(data.clone()));
        let (task, events) = build_task(client, &dir, "big.bin");

        task.start().unwrap();
        assert!(wait_for_state(&task, DownloadState::Completed, Duration::from_secs(30)));

        let out = fs::read(dir.path().join("big.bin")).unwrap();
        assert_eq!(out.len(), data.len());
        assert_eq!(out, data);
        assert_eq!(task.downloaded_bytes(), data.len() as i64);

        // temp part files are gone
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".part"))
            .collect();
        assert!(leftovers.is_empty());

        let mut saw_completed = false;
        while let Ok((_, event)) = events.try_recv() {
            if matches!(event, TaskEvent::Completed) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
        task.shutdown();
    }

    #[test]
    fn no_range_support_uses_single_segment() {
        let data = pattern(5_000_000);
        let dir = TempDir::new().unwrap();
        let client = Arc::new(FakeHttpClient::new(data.clone()));
        client.disable_ranges();
        let (task, _events) = build_task(client.clone(), &dir, "flat.bin");

        task.start().unwrap();
        assert!(wait_for_state(&task, DownloadState::Completed, Duration::from_secs(30)));

        assert_eq!(task.scheduler.segment_count(), 1);
        let out = fs::read(dir.path().join("flat.bin")).unwrap();
        assert_eq!(out, data);
        // every GET was un-ranged
        assert!(client.request_log().iter().all(|req| req.range.is_none()));
        task.shutdown();
    }

    #[test]
    fn zero_length_download_completes_with_empty_file() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(FakeHttpClient::new(Vec::new()));
        let (task, _events) = build_task(client, &dir, "empty.bin");

        task.start().unwrap();
        assert!(wait_for_state(&task, DownloadState::Completed, Duration::from_secs(10)));
        let meta = fs::metadata(dir.path().join("empty.bin")).unwrap();
        assert_eq!(meta.len(), 0);
        task.shutdown();
    }

    #[test]
    fn probe_failure_fails_the_task() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(FakeHttpClient::new(vec![1, 2, 3]));
        client.force_status(404);
        let (task, _events) = build_task(client, &dir, "gone.bin");

        task.start().unwrap();
        assert!(wait_for_state(&task, DownloadState::Failed, Duration::from_secs(10)));
        assert_eq!(task.last_error().category, ErrorCategory::ClientError);
        assert_eq!(task.last_error().code, 404);
        task.shutdown();
    }

    #[test]
    fn server_ignoring_ranges_downgrades_once() {
        let data = pattern(4 * 1024 * 1024);
        let dir = TempDir::new().unwrap();
        let client = Arc::new(FakeHttpClient::new(data.clone()));
        client.ignore_ranges();
        let (task, _events) = build_task(client, &dir, "stubborn.bin");

        task.start().unwrap();
        assert!(wait_for_state(&task, DownloadState::Completed, Duration::from_secs(30)));
        let out = fs::read(dir.path().join("stubborn.bin")).unwrap();
        assert_eq!(out, data);
        assert_eq!(task.scheduler.segment_count(), 1);
        task.shutdown();
    }

    #[test]
    fn pause_then_resume_finishes_byte_identical() {
        let data = pattern(4 * 1024 * 1024);
        let dir = TempDir::new().unwrap();
        let client = Arc::new(FakeHttpClient::new(data.clone()));
        client.chunk_delay(Duration::from_millis(10));
        let (task, _events) = build_task(client, &dir, "paced.bin");

        task.start().unwrap();
        // wait until some bytes moved, then pause mid-flight
        let deadline = Instant::now() + Duration::from_secs(10);
        while task.scheduler.downloaded_bytes() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        task.pause().unwrap();
        assert_eq!(task.state(), DownloadState::Paused);

        // in-flight chunks settle, then progress stays frozen
        std::thread::sleep(Duration::from_millis(300));
        let frozen = task.scheduler.downloaded_bytes();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(task.scheduler.downloaded_bytes(), frozen);
        assert!(frozen < data.len() as i64);

        task.resume().unwrap();
        assert!(wait_for_state(&task, DownloadState::Completed, Duration::from_secs(60)));
        let out = fs::read(dir.path().join("paced.bin")).unwrap();
        assert_eq!(out, data);
        task.shutdown();
    }

    #[test]
    fn cancel_removes_part_files_and_fails_with_cancelled() {
        let data = pattern(4 * 1024 * 1024);
        let dir = TempDir::new().unwrap();
        let client = Arc::new(FakeHttpClient::new(data));
        client.chunk_delay(Duration::from_millis(10));
        let (task, _events) = build_task(client, &dir, "doomed.bin");

        task.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while task.scheduler.downloaded_bytes() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        task.cancel();
        task.shutdown();

        assert_eq!(task.state(), DownloadState::Failed);
        assert_eq!(task.last_error().category, ErrorCategory::Cancelled);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn retry_resets_failed_task_to_queued() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(FakeHttpClient::new(vec![0u8; 100]));
        client.force_status(500);
        let (task, _events) = build_task(client.clone(), &dir, "retry.bin");

        task.start().unwrap();
        assert!(wait_for_state(&task, DownloadState::Failed, Duration::from_secs(10)));
        task.shutdown();

        client.force_status(0);
        task.retry().unwrap();
        assert_eq!(task.state(), DownloadState::Queued);
        assert!(!task.last_error().has_error());

        task.start().unwrap();
        assert!(wait_for_state(&task, DownloadState::Completed, Duration::from_secs(10)));
        task.shutdown();
    }

    #[test]
    fn restored_task_resumes_from_persisted_positions() {
        let data = pattern(400_000);
        let dir = TempDir::new().unwrap();
        let client = Arc::new(FakeHttpClient::new(data.clone()));
        let persistence = Arc::new(PersistenceManager::in_memory());
        let (tx, _rx) = mpsc::channel();

        // simulate a crash: two segments, the second half-way through,
        // with its bytes already on disk
        let half = &data[200_000..300_000];
        let part0 = dir.path().join(".res.bin.part0");
        let part1 = dir.path().join(".res.bin.part1");
        fs::write(&part0, &data[..200_000]).unwrap();
        fs::write(&part1, half).unwrap();

        let crc0 = crc32fast::hash(&data[..200_000]);
        let crc1 = crc32fast::hash(half);
        let snapshots = vec![
            SegmentSnapshot {
                id: 0,
                start: 0,
                end: 199_999,
                current: 200_000,
                state: SegmentState::Completed,
                checksum: crc0,
                temp_file_path: Some(part0.to_string_lossy().to_string()),
                retry_count: 0,
                last_error: None,
            },
            SegmentSnapshot {
                id: 1,
                start: 200_000,
                end: 399_999,
                current: 300_000,
                state: SegmentState::Active,
                checksum: crc1,
                temp_file_path: Some(part1.to_string_lossy().to_string()),
                retry_count: 0,
                last_error: None,
            },
        ];

        let record = TaskRecord {
            id: TaskId::new_v4(),
            url: "http://example.com/data.bin".to_string(),
            file_path: dir.path().join("res.bin").to_string_lossy().to_string(),
            file_name: "res.bin".to_string(),
            total_size: 400_000,
            downloaded_size: 300_000,
            state: DownloadState::Downloading,
            supports_ranges: true,
            priority: Priority::Normal,
            created_at: now_epoch(),
            updated_at: now_epoch(),
            content_type: None,
            error_message: None,
        };

        let task = DownloadTask::restore(
            &record,
            &snapshots,
            EngineConfig::default(),
            client.clone(),
            persistence,
            tx,
            Throttle::default(),
        );

        // interrupted mid-download comes back paused, positions intact
        assert_eq!(task.state(), DownloadState::Paused);
        assert_eq!(task.downloaded_bytes(), 300_000);

        task.resume().unwrap();
        assert!(wait_for_state(&task, DownloadState::Completed, Duration::from_secs(30)));
        let out = fs::read(dir.path().join("res.bin")).unwrap();
        assert_eq!(out, data);
        // the resumed request started at the persisted byte
        assert!(client
            .request_log()
            .iter()
            .any(|req| req.range == Some((300_000, 399_999))));
        task.shutdown();
    }

    #[test]
    fn expected_checksum_mismatch_fails_the_task() {
        let data = pattern(50_000);
        let dir = TempDir::new().unwrap();
        let client = Arc::new(FakeHttpClient::new(data));
        let (task, _events) = build_task(client, &dir, "sum.bin");
        task.set_checksum(ChecksumRequest {
            checksum_type: crate::checksum::ChecksumType::Sha256,
            expected_hex: "0".repeat(64),
        });

        task.start().unwrap();
        assert!(wait_for_state(&task, DownloadState::Failed, Duration::from_secs(10)));
        assert_eq!(task.last_error().category, ErrorCategory::Checksum);
        // the bad artifact is not left behind
        assert!(!dir.path().join("sum.bin").exists());
        task.shutdown();
    }

    #[test]
    fn destination_resolution() {
        let dir = TempDir::new().unwrap();
        let (d, name, explicit) =
            resolve_destination(&dir.path().join("out.bin"), "http://h/x.bin");
        assert_eq!(d, dir.path());
        assert_eq!(name, "out.bin");
        assert!(explicit);

        let (d, name, explicit) = resolve_destination(dir.path(), "http://h/auto%20name.bin");
        assert_eq!(d, dir.path());
        assert_eq!(name, "auto name.bin");
        assert!(!explicit);
    }
}
