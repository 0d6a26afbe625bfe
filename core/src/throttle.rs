use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Token bucket charged in bytes. Tokens refill continuously at the
/// configured rate up to one second of burst; drawing past the level
/// leaves a debt, and the caller sleeps until the refill covers it.
#[derive(Debug)]
struct Bucket {
    rate: f64,
    burst: f64,
    level: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn new(rate_bytes_per_sec: u64) -> Self {
        let rate = rate_bytes_per_sec.max(1) as f64;
        Self {
            rate,
            burst: rate,
            level: rate,
            refilled_at: Instant::now(),
        }
    }

    fn draw(&mut self, bytes: u64) -> Duration {
        let now = Instant::now();
        let refill = now.duration_since(self.refilled_at).as_secs_f64() * self.rate;
        self.refilled_at = now;
        self.level = (self.level + refill).min(self.burst) - bytes as f64;
        if self.level >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.level / self.rate)
        }
    }
}

/// Receive-speed limiter seen by every worker of a task. The global half
/// is shared across tasks, the per-task half is private to one task; a
/// worker sleeps for whichever debt is larger.
#[derive(Clone, Default)]
pub struct Throttle {
    global: Option<Arc<Mutex<Bucket>>>,
    per_task: Option<Arc<Mutex<Bucket>>>,
}

impl Throttle {
    pub fn new(global_limit: Option<u64>, per_task_limit: Option<u64>) -> Self {
        Self {
            global: bucket_for(global_limit),
            per_task: bucket_for(per_task_limit),
        }
    }

    /// Fork a per-task limiter that shares this throttle's global bucket.
    pub fn for_task(&self, per_task_limit: Option<u64>) -> Self {
        Self {
            global: self.global.clone(),
            per_task: bucket_for(per_task_limit),
        }
    }

    pub fn throttle(&self, bytes: u64) {
        let mut debt = Duration::ZERO;
        for bucket in [&self.global, &self.per_task].into_iter().flatten() {
            if let Ok(mut bucket) = bucket.lock() {
                debt = debt.max(bucket.draw(bytes));
            }
        }
        if !debt.is_zero() {
            std::thread::sleep(debt);
        }
    }
}

// a zero limit means unlimited, never a stalled bucket
fn bucket_for(limit: Option<u64>) -> Option<Arc<Mutex<Bucket>>> {
    limit
        .filter(|limit| *limit > 0)
        .map(|limit| Arc::new(Mutex::new(Bucket::new(limit))))
}
