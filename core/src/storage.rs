use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::segment::{SegmentSnapshot, SegmentState};
use crate::types::{ByteCount, DownloadState, Priority, TaskId};

pub const SCHEMA_VERSION: i64 = 1;

/// Persisted shape of one download task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub url: String,
    pub file_path: String,
    pub file_name: String,
    pub total_size: ByteCount,
    pub downloaded_size: ByteCount,
    pub state: DownloadState,
    pub supports_ranges: bool,
    pub priority: Priority,
    pub created_at: u64,
    pub updated_at: u64,
    pub content_type: Option<String>,
    pub error_message: Option<String>,
}

pub trait Storage: Send {
    fn save_task(&mut self, record: &TaskRecord) -> EngineResult<()>;
    fn load_task(&self, id: &TaskId) -> EngineResult<TaskRecord>;
    fn load_all_tasks(&self) -> EngineResult<Vec<TaskRecord>>;
    fn delete_task(&mut self, id: &TaskId) -> EngineResult<()>;

    fn save_segment(&mut self, task_id: &TaskId, snapshot: &SegmentSnapshot) -> EngineResult<()>;
    fn save_segments(&mut self, task_id: &TaskId, snapshots: &[SegmentSnapshot])
        -> EngineResult<()>;
    fn load_segments(&self, task_id: &TaskId) -> EngineResult<Vec<SegmentSnapshot>>;

    fn save_setting(&mut self, key: &str, value: &str) -> EngineResult<()>;
    fn load_setting(&self, key: &str) -> EngineResult<Option<String>>;

    fn checkpoint(&mut self) -> EngineResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    tasks: HashMap<TaskId, TaskRecord>,
    segments: HashMap<TaskId, HashMap<u32, SegmentSnapshot>>,
    settings: HashMap<String, String>,
}

impl Storage for MemoryStorage {
    fn save_task(&mut self, record: &TaskRecord) -> EngineResult<()> {
        self.tasks.insert(record.id, record.clone());
        Ok(())
    }

    fn load_task(&self, id: &TaskId) -> EngineResult<TaskRecord> {
        self.tasks
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    fn load_all_tasks(&self) -> EngineResult<Vec<TaskRecord>> {
        let mut tasks: Vec<TaskRecord> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|record| record.created_at);
        Ok(tasks)
    }

    fn delete_task(&mut self, id: &TaskId) -> EngineResult<()> {
        self.tasks.remove(id);
        self.segments.remove(id);
        Ok(())
    }

    fn save_segment(&mut self, task_id: &TaskId, snapshot: &SegmentSnapshot) -> EngineResult<()> {
        self.segments
            .entry(*task_id)
            .or_default()
            .insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    fn save_segments(
        &mut self,
        task_id: &TaskId,
        snapshots: &[SegmentSnapshot],
    ) -> EngineResult<()> {
        for snapshot in snapshots {
            self.save_segment(task_id, snapshot)?;
        }
        Ok(())
    }

    fn load_segments(&self, task_id: &TaskId) -> EngineResult<Vec<SegmentSnapshot>> {
        let mut snapshots: Vec<SegmentSnapshot> = self
            .segments
            .get(task_id)
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();
        snapshots.sort_by_key(|snapshot| snapshot.id);
        Ok(snapshots)
    }

    fn save_setting(&mut self, key: &str, value: &str) -> EngineResult<()> {
        self.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn load_setting(&self, key: &str) -> EngineResult<Option<String>> {
        Ok(self.settings.get(key).cloned())
    }
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        let storage = Self { conn };
        storage.configure()?;
        storage.migrate()?;
        Ok(storage)
    }

    fn configure(&self) -> EngineResult<()> {
        self.conn
            .pragma_update(None, "journal_mode", "WAL")
            .and_then(|_| self.conn.pragma_update(None, "synchronous", "NORMAL"))
            .and_then(|_| self.conn.pragma_update(None, "foreign_keys", "ON"))
            .map_err(|err| EngineError::Storage(err.to_string()))
    }

    fn migrate(&self) -> EngineResult<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS downloads (
                    id              TEXT PRIMARY KEY,
                    url             TEXT NOT NULL,
                    file_path       TEXT NOT NULL,
                    file_name       TEXT NOT NULL,
                    total_size      INTEGER NOT NULL DEFAULT -1,
                    downloaded_size INTEGER NOT NULL DEFAULT 0,
                    state           TEXT NOT NULL,
                    supports_ranges INTEGER NOT NULL DEFAULT 1,
                    priority        INTEGER NOT NULL DEFAULT 1,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL,
                    content_type    TEXT,
                    error_message   TEXT
                );
                CREATE TABLE IF NOT EXISTS segments (
                    download_id     TEXT NOT NULL,
                    id              INTEGER NOT NULL,
                    start_byte      INTEGER NOT NULL,
                    end_byte        INTEGER NOT NULL,
                    current_byte    INTEGER NOT NULL,
                    state           TEXT NOT NULL,
                    checksum        INTEGER NOT NULL DEFAULT 0,
                    temp_file       TEXT,
                    retry_count     INTEGER NOT NULL DEFAULT 0,
                    last_error      TEXT,
                    PRIMARY KEY (download_id, id),
                    FOREIGN KEY (download_id) REFERENCES downloads(id) ON DELETE CASCADE
                );
                CREATE TABLE IF NOT EXISTS settings (
                    key   TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_downloads_state ON downloads(state);
                CREATE INDEX IF NOT EXISTS idx_segments_download ON segments(download_id);
                ",
            )
            .map_err(|err| EngineError::Storage(err.to_string()))?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO settings (key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        Ok(())
    }
}

impl Storage for SqliteStorage {
    fn save_task(&mut self, record: &TaskRecord) -> EngineResult<()> {
        self.conn
            .execute(
                "
                INSERT INTO downloads (
                    id, url, file_path, file_name, total_size, downloaded_size, state,
                    supports_ranges, priority, created_at, updated_at, content_type, error_message
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(id) DO UPDATE SET
                    url=excluded.url,
                    file_path=excluded.file_path,
                    file_name=excluded.file_name,
                    total_size=excluded.total_size,
                    downloaded_size=excluded.downloaded_size,
                    state=excluded.state,
                    supports_ranges=excluded.supports_ranges,
                    priority=excluded.priority,
                    updated_at=excluded.updated_at,
                    content_type=excluded.content_type,
                    error_message=excluded.error_message
                ",
                params![
                    record.id.to_string(),
                    record.url,
                    record.file_path,
                    record.file_name,
                    record.total_size,
                    record.downloaded_size,
                    record.state.as_str(),
                    record.supports_ranges as i64,
                    record.priority.as_i64(),
                    record.created_at as i64,
                    record.updated_at as i64,
                    record.content_type,
                    record.error_message,
                ],
            )
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        Ok(())
    }

    fn load_task(&self, id: &TaskId) -> EngineResult<TaskRecord> {
        let record = self
            .conn
            .prepare(
                "SELECT id, url, file_path, file_name, total_size, downloaded_size, state,
                        supports_ranges, priority, created_at, updated_at, content_type,
                        error_message
                 FROM downloads WHERE id = ?1",
            )
            .map_err(|err| EngineError::Storage(err.to_string()))?
            .query_row(params![id.to_string()], row_to_task)
            .optional()
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        record.ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    fn load_all_tasks(&self) -> EngineResult<Vec<TaskRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, url, file_path, file_name, total_size, downloaded_size, state,
                        supports_ranges, priority, created_at, updated_at, content_type,
                        error_message
                 FROM downloads ORDER BY created_at ASC",
            )
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        let rows = stmt
            .query_map([], row_to_task)
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|err| EngineError::Storage(err.to_string()))?);
        }
        Ok(records)
    }

    fn delete_task(&mut self, id: &TaskId) -> EngineResult<()> {
        // segments cascade through the foreign key
        self.conn
            .execute(
                "DELETE FROM downloads WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        Ok(())
    }

    fn save_segment(&mut self, task_id: &TaskId, snapshot: &SegmentSnapshot) -> EngineResult<()> {
        self.conn
            .execute(
                "
                INSERT INTO segments (
                    download_id, id, start_byte, end_byte, current_byte, state,
                    checksum, temp_file, retry_count, last_error
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(download_id, id) DO UPDATE SET
                    start_byte=excluded.start_byte,
                    end_byte=excluded.end_byte,
                    current_byte=excluded.current_byte,
                    state=excluded.state,
                    checksum=excluded.checksum,
                    temp_file=excluded.temp_file,
                    retry_count=excluded.retry_count,
                    last_error=excluded.last_error
                ",
                params![
                    task_id.to_string(),
                    snapshot.id as i64,
                    snapshot.start,
                    snapshot.end,
                    snapshot.current,
                    snapshot.state.as_str(),
                    snapshot.checksum as i64,
                    snapshot.temp_file_path,
                    snapshot.retry_count as i64,
                    snapshot.last_error,
                ],
            )
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        Ok(())
    }

    fn save_segments(
        &mut self,
        task_id: &TaskId,
        snapshots: &[SegmentSnapshot],
    ) -> EngineResult<()> {
        let tx = self
            .conn
            .transaction()
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        for snapshot in snapshots {
            tx.execute(
                "
                INSERT INTO segments (
                    download_id, id, start_byte, end_byte, current_byte, state,
                    checksum, temp_file, retry_count, last_error
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(download_id, id) DO UPDATE SET
                    start_byte=excluded.start_byte,
                    end_byte=excluded.end_byte,
                    current_byte=excluded.current_byte,
                    state=excluded.state,
                    checksum=excluded.checksum,
                    temp_file=excluded.temp_file,
                    retry_count=excluded.retry_count,
                    last_error=excluded.last_error
                ",
                params![
                    task_id.to_string(),
                    snapshot.id as i64,
                    snapshot.start,
                    snapshot.end,
                    snapshot.current,
                    snapshot.state.as_str(),
                    snapshot.checksum as i64,
                    snapshot.temp_file_path,
                    snapshot.retry_count as i64,
                    snapshot.last_error,
                ],
            )
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        }
        tx.commit()
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        Ok(())
    }

    fn load_segments(&self, task_id: &TaskId) -> EngineResult<Vec<SegmentSnapshot>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, start_byte, end_byte, current_byte, state, checksum,
                        temp_file, retry_count, last_error
                 FROM segments WHERE download_id = ?1 ORDER BY id ASC",
            )
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        let rows = stmt
            .query_map(params![task_id.to_string()], |row| {
                let state: String = row.get(4)?;
                let state = SegmentState::from_str(&state)
                    .ok_or(rusqlite::Error::InvalidQuery)?;
                Ok(SegmentSnapshot {
                    id: row.get::<_, i64>(0)? as u32,
                    start: row.get(1)?,
                    end: row.get(2)?,
                    current: row.get(3)?,
                    state,
                    checksum: row.get::<_, i64>(5)? as u32,
                    temp_file_path: row.get(6)?,
                    retry_count: row.get::<_, i64>(7)? as u32,
                    last_error: row.get(8)?,
                })
            })
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row.map_err(|err| EngineError::Storage(err.to_string()))?);
        }
        Ok(snapshots)
    }

    fn save_setting(&mut self, key: &str, value: &str) -> EngineResult<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        Ok(())
    }

    fn load_setting(&self, key: &str) -> EngineResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|err| EngineError::Storage(err.to_string()))
    }

    fn checkpoint(&mut self) -> EngineResult<()> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .map_err(|err| EngineError::Storage(err.to_string()))
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let state: String = row.get(6)?;
    let state = DownloadState::from_str(&state).ok_or(rusqlite::Error::InvalidQuery)?;
    Ok(TaskRecord {
        id: TaskId::parse_str(row.get::<_, String>(0)?.as_str())
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        url: row.get(1)?,
        file_path: row.get(2)?,
        file_name: row.get(3)?,
        total_size: row.get(4)?,
        downloaded_size: row.get(5)?,
        state,
        supports_ranges: row.get::<_, i64>(7)? != 0,
        priority: Priority::from_i64(row.get(8)?),
        created_at: row.get::<_, i64>(9)? as u64,
        updated_at: row.get::<_, i64>(10)? as u64,
        content_type: row.get(11)?,
        error_message: row.get(12)?,
    })
}

pub fn default_db_path() -> PathBuf {
    if let Ok(dir) = std::env::var("PARGET_DATA_DIR") {
        return PathBuf::from(dir).join("parget.db");
    }
    if let Ok(dir) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(dir).join("parget").join("parget.db");
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("parget")
        .join("parget.db")
}

enum WriteRequest {
    SaveTask(TaskRecord),
    SaveSegment(TaskId, SegmentSnapshot),
    SaveSegments(TaskId, Vec<SegmentSnapshot>),
    DeleteTask(TaskId),
    SaveSetting(String, String),
    Flush(Sender<()>),
}

/// Crash-safe, non-blocking persistence front. Mutations are queued to a
/// dedicated writer thread in strict order; reads go straight to the
/// store. Closing drains the queue before the writer exits.
pub struct PersistenceManager {
    storage: Arc<Mutex<Box<dyn Storage>>>,
    sender: Mutex<Option<Sender<WriteRequest>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceManager {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        let storage = Arc::new(Mutex::new(storage));
        let (sender, receiver) = mpsc::channel::<WriteRequest>();

        let writer_storage = Arc::clone(&storage);
        let writer = std::thread::Builder::new()
            .name("parget-persist".to_string())
            .spawn(move || {
                debug!("persistence writer started");
                let mut writes = 0usize;
                for request in receiver {
                    let mut storage = writer_storage
                        .lock()
                        .unwrap_or_else(|poison| poison.into_inner());
                    let result = match request {
                        WriteRequest::SaveTask(record) => storage.save_task(&record),
                        WriteRequest::SaveSegment(task_id, snapshot) => {
                            storage.save_segment(&task_id, &snapshot)
                        }
                        WriteRequest::SaveSegments(task_id, snapshots) => {
                            storage.save_segments(&task_id, &snapshots)
                        }
                        WriteRequest::DeleteTask(task_id) => storage.delete_task(&task_id),
                        WriteRequest::SaveSetting(key, value) => {
                            storage.save_setting(&key, &value)
                        }
                        WriteRequest::Flush(ack) => {
                            let _ = ack.send(());
                            continue;
                        }
                    };
                    if let Err(err) = result {
                        warn!(%err, "persistence write failed");
                    }
                    writes += 1;
                    if writes % crate::types::constants::WAL_CHECKPOINT_EVERY == 0 {
                        if let Err(err) = storage.checkpoint() {
                            warn!(%err, "wal checkpoint failed");
                        }
                    }
                }
                debug!("persistence writer drained");
            })
            .expect("spawn persistence writer");

        Self {
            storage,
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStorage::default()))
    }

    fn enqueue(&self, request: WriteRequest) {
        let sender = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        match sender.as_ref() {
            Some(sender) => {
                let _ = sender.send(request);
            }
            None => warn!("persistence already closed, write dropped"),
        }
    }

    pub fn save_task(&self, record: TaskRecord) {
        self.enqueue(WriteRequest::SaveTask(record));
    }

    pub fn save_segment(&self, task_id: TaskId, snapshot: SegmentSnapshot) {
        self.enqueue(WriteRequest::SaveSegment(task_id, snapshot));
    }

    pub fn save_segments(&self, task_id: TaskId, snapshots: Vec<SegmentSnapshot>) {
        self.enqueue(WriteRequest::SaveSegments(task_id, snapshots));
    }

    pub fn delete_task(&self, task_id: TaskId) {
        self.enqueue(WriteRequest::DeleteTask(task_id));
    }

    pub fn save_setting(&self, key: &str, value: &str) {
        self.enqueue(WriteRequest::SaveSetting(key.to_string(), value.to_string()));
    }

    pub fn load_all_tasks(&self) -> EngineResult<Vec<TaskRecord>> {
        self.storage
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .load_all_tasks()
    }

    pub fn load_task(&self, id: &TaskId) -> EngineResult<TaskRecord> {
        self.storage
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .load_task(id)
    }

    pub fn load_segments(&self, id: &TaskId) -> EngineResult<Vec<SegmentSnapshot>> {
        self.storage
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .load_segments(id)
    }

    pub fn load_setting(&self, key: &str) -> EngineResult<Option<String>> {
        self.storage
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .load_setting(key)
    }

    /// Block until every write queued so far has been applied.
    pub fn flush(&self) {
        let (ack, done) = mpsc::channel();
        self.enqueue(WriteRequest::Flush(ack));
        let _ = done.recv();
    }

    /// Drain the queue and stop the writer. Further writes are dropped.
    pub fn close(&self) {
        let sender = {
            let mut guard = self.sender.lock().unwrap_or_else(|p| p.into_inner());
            guard.take()
        };
        drop(sender);
        let writer = {
            let mut guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());
            guard.take()
        };
        if let Some(writer) = writer {
            let _ = writer.join();
        }
        let mut storage = self.storage.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(err) = storage.checkpoint() {
            warn!(%err, "final checkpoint failed");
        }
    }
}

impl Drop for PersistenceManager {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::now_epoch;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn record(url: &str) -> TaskRecord {
        TaskRecord {
            id: Uuid::new_v4(),
            url: url.to_string(),
            file_path: "/tmp/file.bin".to_string(),
            file_name: "file.bin".to_string(),
            total_size: 1000,
            downloaded_size: 0,
            state: DownloadState::Queued,
            supports_ranges: true,
            priority: Priority::Normal,
            created_at: now_epoch(),
            updated_at: now_epoch(),
            content_type: Some("application/octet-stream".to_string()),
            error_message: None,
        }
    }

    fn snapshot(id: u32) -> SegmentSnapshot {
        SegmentSnapshot {
            id,
            start: id as i64 * 100,
            end: id as i64 * 100 + 99,
            current: id as i64 * 100 + 50,
            state: SegmentState::Pending,
            checksum: 0xdead_beef,
            temp_file_path: Some(format!("/tmp/.file.bin.part{}", id)),
            retry_count: 1,
            last_error: Some("connection reset".to_string()),
        }
    }

    #[test]
    fn sqlite_round_trips_tasks_and_segments() {
        let dir = TempDir::new().unwrap();
        let mut storage = SqliteStorage::open(dir.path().join("t.db")).unwrap();

        let mut rec = record("http://example.com/a");
        storage.save_task(&rec).unwrap();
        storage.save_segments(&rec.id, &[snapshot(0), snapshot(1)]).unwrap();

        let loaded = storage.load_task(&rec.id).unwrap();
        assert_eq!(loaded.url, rec.url);
        assert_eq!(loaded.state, DownloadState::Queued);
        assert_eq!(loaded.priority, Priority::Normal);

        let segments = storage.load_segments(&rec.id).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], snapshot(0));
        assert_eq!(segments[1].checksum, 0xdead_beef);

        // upsert replaces in place
        rec.state = DownloadState::Downloading;
        rec.downloaded_size = 512;
        storage.save_task(&rec).unwrap();
        let loaded = storage.load_task(&rec.id).unwrap();
        assert_eq!(loaded.state, DownloadState::Downloading);
        assert_eq!(loaded.downloaded_size, 512);
        assert_eq!(storage.load_all_tasks().unwrap().len(), 1);
    }

    #[test]
    fn delete_cascades_to_segments() {
        let dir = TempDir::new().unwrap();
        let mut storage = SqliteStorage::open(dir.path().join("t.db")).unwrap();
        let rec = record("http://example.com/a");
        storage.save_task(&rec).unwrap();
        storage.save_segment(&rec.id, &snapshot(0)).unwrap();

        storage.delete_task(&rec.id).unwrap();
        assert!(matches!(
            storage.load_task(&rec.id),
            Err(EngineError::NotFound(_))
        ));
        assert!(storage.load_segments(&rec.id).unwrap().is_empty());
    }

    #[test]
    fn schema_version_is_recorded() {
        let dir = TempDir::new().unwrap();
        let storage = SqliteStorage::open(dir.path().join("t.db")).unwrap();
        assert_eq!(
            storage.load_setting("schema_version").unwrap().as_deref(),
            Some("1")
        );
    }

    #[test]
    fn settings_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut storage = SqliteStorage::open(dir.path().join("t.db")).unwrap();
        assert_eq!(storage.load_setting("max_concurrent").unwrap(), None);
        storage.save_setting("max_concurrent", "5").unwrap();
        assert_eq!(
            storage.load_setting("max_concurrent").unwrap().as_deref(),
            Some("5")
        );
    }

    #[test]
    fn reopened_database_keeps_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.db");
        let rec = record("http://example.com/a");
        {
            let mut storage = SqliteStorage::open(&path).unwrap();
            storage.save_task(&rec).unwrap();
            storage.save_segment(&rec.id, &snapshot(2)).unwrap();
            storage.checkpoint().unwrap();
        }
        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.load_task(&rec.id).unwrap().url, rec.url);
        assert_eq!(storage.load_segments(&rec.id).unwrap().len(), 1);
    }

    #[test]
    fn write_queue_applies_in_order_and_flushes() {
        let persistence = PersistenceManager::in_memory();
        let rec = record("http://example.com/a");
        persistence.save_task(rec.clone());
        let mut updated = rec.clone();
        updated.state = DownloadState::Completed;
        persistence.save_task(updated);
        persistence.flush();

        let loaded = persistence.load_task(&rec.id).unwrap();
        assert_eq!(loaded.state, DownloadState::Completed);
    }

    #[test]
    fn close_drains_pending_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.db");
        let rec = record("http://example.com/a");
        {
            let persistence =
                PersistenceManager::new(Box::new(SqliteStorage::open(&path).unwrap()));
            persistence.save_task(rec.clone());
            for i in 0..100u32 {
                persistence.save_segment(rec.id, snapshot(i));
            }
            persistence.close();
        }
        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.load_segments(&rec.id).unwrap().len(), 100);
    }
}
