//! Job registry with time-based expiry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Done(Result<Vec<u8>, String>),
}

impl JobStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, JobStatus::Done(_))
    }
}

struct Entry {
    status: JobStatus,
    touched: Instant,
}

/// Jobs expire `ttl` after creation or after their result was written.
pub struct Jobs {
    ttl: Duration,
    entries: Mutex<HashMap<JobId, Entry>>,
}

impl Jobs {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self) -> JobId {
        let id = Uuid::new_v4();
        self.lock().insert(id, Entry { status: JobStatus::Pending, touched: Instant::now() });
        id
    }

    /// `None` for unknown or expired ids.
    pub fn get(&self, id: &JobId) -> Option<JobStatus> {
        let map = self.lock();
        let entry = map.get(id)?;
        if entry.touched.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.status.clone())
    }

    /// Record the job's outcome. A job is written once; later writes are ignored.
    pub fn complete(&self, id: JobId, result: Result<Vec<u8>, String>) -> bool {
        let mut map = self.lock();
        match map.get_mut(&id) {
            Some(entry) if entry.status.is_done() => false,
            Some(entry) => {
                entry.status = JobStatus::Done(result);
                entry.touched = Instant::now();
                true
            }
            None => {
                map.insert(id, Entry { status: JobStatus::Done(result), touched: Instant::now() });
                true
            }
        }
    }

    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, e| e.touched.elapsed() < ttl);
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodically drop expired jobs until `cancel` fires.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let jobs = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let n = jobs.purge_expired();
                        if n > 0 {
                            debug!(expired = n, "values jobs reaped");
                        }
                    }
                }
            }
        })
    }
}
