use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{ManagerEvent, ManagerStats, TaskEvent};
use crate::net::{HttpClient, ReqwestHttpClient};
use crate::queue::TaskQueue;
use crate::storage::{MemoryStorage, PersistenceManager, Storage};
use crate::task::DownloadTask;
use crate::throttle::Throttle;
use crate::types::constants;
use crate::types::{ByteCount, DownloadState, SpeedBps, TaskId};

/// Owns every download task, enforces the concurrency cap and the queue,
/// and publishes aggregated statistics. Constructed as an explicit value;
/// nothing here is process-global.
pub struct DownloadManager {
    config: EngineConfig,
    client: Arc<dyn HttpClient>,
    persistence: Arc<PersistenceManager>,
    tasks: Mutex<HashMap<TaskId, Arc<DownloadTask>>>,
    queue: Mutex<TaskQueue>,
    /// downloaded_bytes at registration time, for session accounting
    baselines: Mutex<HashMap<TaskId, ByteCount>>,
    throttle: Throttle,
    task_events_tx: Sender<(TaskId, TaskEvent)>,
    task_events_rx: Mutex<Option<Receiver<(TaskId, TaskEvent)>>>,
    events_tx: SyncSender<ManagerEvent>,
    events_rx: Mutex<Option<Receiver<ManagerEvent>>>,
    shutting_down: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadManager {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let client = ReqwestHttpClient::new(&config.user_agent, config.verify_tls)
            .unwrap_or_else(|_| {
                ReqwestHttpClient::new("parget", true).expect("http client")
            });
        Self::with_parts(config, Box::new(MemoryStorage::default()), Arc::new(client))
    }

    pub fn with_parts(
        config: EngineConfig,
        storage: Box<dyn Storage>,
        client: Arc<dyn HttpClient>,
    ) -> Arc<Self> {
        let (task_events_tx, task_events_rx) = mpsc::channel();
        // bounded: a shell that never drains its stream must not grow it
        let (events_tx, events_rx) = mpsc::sync_channel(1024);
        let throttle = Throttle::new(config.global_speed_limit, None);

        let manager = Arc::new(Self {
            config,
            client,
            persistence: Arc::new(PersistenceManager::new(storage)),
            tasks: Mutex::new(HashMap::new()),
            queue: Mutex::new(TaskQueue::default()),
            baselines: Mutex::new(HashMap::new()),
            throttle,
            task_events_tx,
            task_events_rx: Mutex::new(Some(task_events_rx)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutting_down: AtomicBool::new(false),
            background: Mutex::new(Vec::new()),
        });
        manager.spawn_background();
        manager
    }

    /// The manager-level event stream. Can be taken once.
    pub fn events(&self) -> Option<Receiver<ManagerEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Restore persisted tasks. Anything interrupted mid-transfer comes
    /// back Paused; Queued tasks re-enter the queue.
    pub fn load_state(&self) -> EngineResult<usize> {
        let records = self.persistence.load_all_tasks()?;
        let count = records.len();
        for record in records {
            let snapshots = self.persistence.load_segments(&record.id)?;
            let task = DownloadTask::restore(
                &record,
                &snapshots,
                self.config.clone(),
                Arc::clone(&self.client),
                Arc::clone(&self.persistence),
                self.task_events_tx.clone(),
                self.throttle.for_task(self.config.per_task_speed_limit),
            );
            self.baselines
                .lock()
                .unwrap()
                .insert(task.id(), task.downloaded_bytes());
            if task.state() == DownloadState::Queued {
                self.queue.lock().unwrap().push(task.id(), task.priority());
            }
            self.tasks.lock().unwrap().insert(task.id(), task);
        }
        info!(count, "loaded persisted downloads");
        Ok(count)
    }

    /// Create a task for `url`. Rejects malformed URLs and exact
    /// duplicates. The queue starts it as soon as a slot is free;
    /// `start_now` just tries immediately.
    pub fn add(&self, url: &str, dest: Option<&Path>, start_now: bool) -> EngineResult<TaskId> {
        let parsed = url::Url::parse(url).map_err(|err| EngineError::InvalidUrl(err.to_string()))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(EngineError::InvalidUrl(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }
        {
            let tasks = self.tasks.lock().unwrap();
            if tasks.values().any(|task| task.url() == url) {
                return Err(EngineError::Duplicate(url.to_string()));
            }
        }

        let dest = dest
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.config.default_download_dir.clone());
        let task = DownloadTask::new(
            url.to_string(),
            &dest,
            self.config.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.persistence),
            self.task_events_tx.clone(),
            self.throttle.for_task(self.config.per_task_speed_limit),
        );
        let id = task.id();

        self.baselines.lock().unwrap().insert(id, 0);
        self.tasks.lock().unwrap().insert(id, Arc::clone(&task));
        self.queue.lock().unwrap().push(id, task.priority());
        self.persistence.save_task(task.to_record());

        debug!(task = %id, url, "download added");
        let _ = self.events_tx.try_send(ManagerEvent::DownloadAdded(id));
        if start_now {
            self.process_queue();
        }
        Ok(id)
    }

    /// Drop a task entirely: cancel if running, forget it, delete its row,
    /// and optionally the downloaded file.
    pub fn remove(&self, id: &TaskId, delete_file: bool) -> EngineResult<()> {
        let task = self
            .tasks
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        self.queue.lock().unwrap().remove(id);
        self.baselines.lock().unwrap().remove(id);

        if !task.state().is_terminal() {
            task.cancel();
        }
        task.shutdown();

        self.persistence.delete_task(*id);
        if delete_file {
            let _ = std::fs::remove_file(task.file_path());
        }
        let _ = self.events_tx.try_send(ManagerEvent::DownloadRemoved(*id));
        self.process_queue();
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> Option<Arc<DownloadTask>> {
        self.tasks.lock().unwrap().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<DownloadTask>> {
        self.tasks.lock().unwrap().values().cloned().collect()
    }

    pub fn list_by_state(&self, state: DownloadState) -> Vec<Arc<DownloadTask>> {
        self.tasks
            .lock()
            .unwrap()
            .values()
            .filter(|task| task.state() == state)
            .cloned()
            .collect()
    }

    pub fn start(&self, id: &TaskId) -> EngineResult<()> {
        let task = self.get(id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if !self.can_start_more() {
            self.queue.lock().unwrap().push(*id, task.priority());
            return Ok(());
        }
        task.start()?;
        let _ = self.events_tx.try_send(ManagerEvent::DownloadStarted(*id));
        Ok(())
    }

    pub fn pause(&self, id: &TaskId) -> EngineResult<()> {
        let task = self.get(id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        task.pause()?;
        let _ = self.events_tx.try_send(ManagerEvent::DownloadPaused(*id));
        self.process_queue();
        Ok(())
    }

    pub fn resume(&self, id: &TaskId) -> EngineResult<()> {
        let task = self.get(id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if !self.can_start_more() {
            return Err(EngineError::InvalidState(
                "concurrent download limit reached".to_string(),
            ));
        }
        task.resume()?;
        let _ = self.events_tx.try_send(ManagerEvent::DownloadResumed(*id));
        Ok(())
    }

    pub fn cancel(&self, id: &TaskId) -> EngineResult<()> {
        let task = self.get(id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        task.cancel();
        self.process_queue();
        Ok(())
    }

    /// Reset a Failed task and queue it again.
    pub fn retry(&self, id: &TaskId) -> EngineResult<()> {
        let task = self.get(id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        task.retry()?;
        self.queue.lock().unwrap().push(*id, task.priority());
        self.process_queue();
        Ok(())
    }

    pub fn pause_all(&self) {
        for task in self.list_by_state(DownloadState::Downloading) {
            if task.pause().is_ok() {
                let _ = self
                    .events_tx
                    .try_send(ManagerEvent::DownloadPaused(task.id()));
            }
        }
    }

    pub fn resume_all(&self) {
        for task in self.list_by_state(DownloadState::Paused) {
            if !self.can_start_more() {
                break;
            }
            if task.resume().is_ok() {
                let _ = self
                    .events_tx
                    .try_send(ManagerEvent::DownloadResumed(task.id()));
            }
        }
    }

    pub fn start_all(&self) {
        for task in self.list_by_state(DownloadState::Queued) {
            self.queue.lock().unwrap().push(task.id(), task.priority());
        }
        self.process_queue();
    }

    pub fn remove_completed(&self) -> usize {
        let completed = self.list_by_state(DownloadState::Completed);
        let count = completed.len();
        for task in completed {
            let _ = self.remove(&task.id(), false);
        }
        count
    }

    /// Fill free slots with Queued tasks, highest priority first.
    pub fn process_queue(&self) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        loop {
            if !self.can_start_more() {
                return;
            }
            let item = self.queue.lock().unwrap().pop();
            let Some(item) = item else {
                return;
            };
            let Some(task) = self.get(&item.id) else {
                continue;
            };
            if task.state() != DownloadState::Queued {
                continue;
            }
            match task.start() {
                Ok(()) => {
                    let _ = self
                        .events_tx
                        .try_send(ManagerEvent::DownloadStarted(item.id));
                }
                Err(err) => warn!(task = %item.id, %err, "failed to start queued task"),
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .values()
            .filter(|task| task.state().is_active())
            .count()
    }

    pub fn queued_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .values()
            .filter(|task| task.state() == DownloadState::Queued)
            .count()
    }

    pub fn completed_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .values()
            .filter(|task| task.state() == DownloadState::Completed)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn global_speed(&self) -> SpeedBps {
        self.tasks
            .lock()
            .unwrap()
            .values()
            .filter(|task| task.state() == DownloadState::Downloading)
            .map(|task| task.speed())
            .sum()
    }

    /// Bytes transferred since this process started, across all tasks.
    pub fn session_bytes(&self) -> ByteCount {
        let tasks = self.tasks.lock().unwrap();
        let baselines = self.baselines.lock().unwrap();
        tasks
            .values()
            .map(|task| {
                let baseline = baselines.get(&task.id()).copied().unwrap_or(0);
                (task.downloaded_bytes() - baseline).max(0)
            })
            .sum()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            active: self.active_count(),
            queued: self.queued_count(),
            completed: self.completed_count(),
            total: self.total_count(),
            global_speed: self.global_speed(),
            session_bytes: self.session_bytes(),
        }
    }

    fn can_start_more(&self) -> bool {
        self.active_count() < self.config.concurrent_limit()
    }

    fn spawn_background(self: &Arc<Self>) {
        let mut background = self.background.lock().unwrap();

        // task event pump: forwards terminal events and frees queue slots
        let weak: Weak<Self> = Arc::downgrade(self);
        let receiver = self
            .task_events_rx
            .lock()
            .unwrap()
            .take()
            .expect("task event receiver");
        let pump = std::thread::Builder::new()
            .name("parget-events".to_string())
            .spawn(move || loop {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if manager.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                drop(manager);
                match receiver.recv_timeout(Duration::from_millis(200)) {
                    Ok((id, event)) => {
                        let Some(manager) = weak.upgrade() else {
                            break;
                        };
                        match event {
                            TaskEvent::Completed => {
                                let _ = manager
                                    .events_tx
                                    .try_send(ManagerEvent::DownloadCompleted(id));
                                manager.process_queue();
                            }
                            TaskEvent::Failed(error) => {
                                let _ = manager
                                    .events_tx
                                    .try_send(ManagerEvent::DownloadFailed(id, error.message));
                                manager.process_queue();
                            }
                            _ => {}
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .expect("spawn event pump");
        background.push(pump);

        // queue pass every half second, stats once a second
        let weak: Weak<Self> = Arc::downgrade(self);
        let ticker = std::thread::Builder::new()
            .name("parget-stats".to_string())
            .spawn(move || {
                let mut tick = 0u64;
                loop {
                    std::thread::sleep(constants::QUEUE_POLL_INTERVAL);
                    let Some(manager) = weak.upgrade() else {
                        break;
                    };
                    if manager.shutting_down.load(Ordering::Acquire) {
                        break;
                    }
                    manager.process_queue();
                    tick += 1;
                    if tick % 2 == 0 {
                        let _ = manager
                            .events_tx
                            .try_send(ManagerEvent::Stats(manager.stats()));
                    }
                }
            })
            .expect("spawn stats ticker");
        background.push(ticker);
    }

    /// Pause everything, stop workers, drain persistence. The manager is
    /// unusable afterwards.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("download manager shutting down");
        self.pause_all();
        for task in self.list() {
            task.shutdown();
        }
        for handle in self.background.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        self.persistence.flush();
        self.persistence.close();
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
