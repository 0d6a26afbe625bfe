use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parget_core::storage::{default_db_path, SqliteStorage};
use parget_core::types::DownloadState;
use parget_core::{DownloadManager, EngineConfig, EngineError, TaskId};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let manager = match build_manager() {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("error: {}", err);
            return;
        }
    };

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    match args[1].as_str() {
        "add" => {
            let Some(url) = args.get(2) else {
                print_usage();
                return;
            };
            let dest = args.get(3).map(PathBuf::from);
            match manager.add(url, dest.as_deref(), false) {
                Ok(id) => println!("added download: {}", id),
                Err(err) => eprintln!("error: {}", err),
            }
        }
        "list" => {
            for task in manager.list() {
                println!(
                    "{}\t{}\t{}\t{}",
                    task.id(),
                    task.state(),
                    format_bytes(task.downloaded_bytes().max(0) as u64),
                    task.url()
                );
            }
        }
        "run" => {
            let (progress, stop) = spawn_progress(Arc::clone(&manager));
            manager.start_all();
            loop {
                thread::sleep(Duration::from_millis(500));
                if manager.active_count() == 0 && manager.queued_count() == 0 {
                    break;
                }
            }
            stop.store(true, Ordering::SeqCst);
            let _ = progress.join();
            println!("queue complete");
        }
        "start" => run_with_id(&manager, &args, |m, id| m.start(id)),
        "pause" => run_with_id(&manager, &args, |m, id| m.pause(id)),
        "resume" => run_with_id(&manager, &args, |m, id| m.resume(id)),
        "cancel" => run_with_id(&manager, &args, |m, id| m.cancel(id)),
        "retry" => run_with_id(&manager, &args, |m, id| m.retry(id)),
        "remove" => {
            let delete_file = args.iter().any(|arg| arg == "--delete-file");
            run_with_id(&manager, &args, |m, id| m.remove(id, delete_file));
        }
        _ => print_usage(),
    }

    manager.shutdown();
}

fn build_manager() -> Result<Arc<DownloadManager>, EngineError> {
    let config = EngineConfig::default();
    let db_path = env::var("PARGET_DB")
        .map(PathBuf::from)
        .ok()
        .or_else(|| config.db_path.clone())
        .unwrap_or_else(default_db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| EngineError::Io(err.to_string()))?;
    }
    let client = parget_core::net::ReqwestHttpClient::new(&config.user_agent, config.verify_tls)
        .map_err(|err| EngineError::Network(err.message))?;
    let manager = DownloadManager::with_parts(
        config,
        Box::new(SqliteStorage::open(&db_path)?),
        Arc::new(client),
    );
    manager.load_state()?;
    Ok(manager)
}

fn run_with_id<F>(manager: &Arc<DownloadManager>, args: &[String], f: F)
where
    F: FnOnce(&DownloadManager, &TaskId) -> Result<(), EngineError>,
{
    let Some(raw) = args.get(2) else {
        print_usage();
        return;
    };
    let Ok(id) = TaskId::parse_str(raw) else {
        eprintln!("invalid download id");
        return;
    };
    if let Err(err) = f(manager, &id) {
        eprintln!("error: {}", err);
    }
}

fn spawn_progress(
    manager: Arc<DownloadManager>,
) -> (thread::JoinHandle<()>, Arc<AtomicBool>) {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let handle = thread::spawn(move || loop {
        if stop_flag.load(Ordering::SeqCst) {
            break;
        }
        for task in manager.list() {
            let state = task.state();
            if state != DownloadState::Downloading && state != DownloadState::Merging {
                continue;
            }
            let progress = task.progress();
            let total = if progress.total_bytes > 0 {
                format_bytes(progress.total_bytes as u64)
            } else {
                "?".to_string()
            };
            let eta = if progress.total_bytes > 0 && progress.current_speed > 0.0 {
                let remaining = (progress.total_bytes - progress.downloaded_bytes).max(0);
                format_duration((remaining as f64 / progress.current_speed) as u64)
            } else {
                "--:--".to_string()
            };
            println!(
                "[{}] {} {:.1}% {}/{} ({}/s) eta {} segs {}/{} {}",
                state,
                &task.id().to_string()[..8],
                progress.progress_percent,
                format_bytes(progress.downloaded_bytes.max(0) as u64),
                total,
                format_bytes(progress.current_speed as u64),
                eta,
                progress.completed_segments,
                progress.total_segments,
                task.file_name(),
            );
        }
        thread::sleep(Duration::from_secs(1));
    });
    (handle, stop)
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2}GB", b / GB)
    } else if b >= MB {
        format!("{:.2}MB", b / MB)
    } else if b >= KB {
        format!("{:.2}KB", b / KB)
    } else {
        format!("{}B", bytes)
    }
}

fn format_duration(mut seconds: u64) -> String {
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

fn print_usage() {
    eprintln!(
        "Usage: parget <command> [args]\n\
Commands:\n\
  add <url> [dest]         Add a download (dest optional)\n\
  list                     List downloads\n\
  run                      Run queued downloads until complete\n\
  start <id>               Start a download\n\
  pause <id>               Pause a download\n\
  resume <id>              Resume a paused download\n\
  cancel <id>              Cancel a download\n\
  retry <id>               Retry a failed download\n\
  remove <id> [--delete-file]  Forget a download\n\
Environment:\n\
  PARGET_DB=/path/to/db    Database location\n\
  PARGET_DOWNLOAD_DIR      Default download directory\n\
  RUST_LOG=debug           Engine logging"
    );
}
