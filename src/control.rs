//! Per-job pause/cancel signalling.
//!
//! Each running job owns one [`JobControl`] handle in a process-wide
//! [`ControlRegistry`]: inserted when the run is spawned, removed when the
//! task exits (terminal transition or pause). Signals are cooperative —
//! the page loop checks the flags at each iteration boundary, so an
//! in-flight classification call always finishes before a pause or cancel
//! takes effect. A process restart loses the registry, but the persisted
//! job row still allows a safe resume.

use crate::model::JobId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Cancellation/pause flags for one job.
#[derive(Debug, Default)]
pub struct JobControl {
    paused: AtomicBool,
    cancelled: AtomicBool,
}

impl JobControl {
    pub fn request_pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn request_cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn pause_requested(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Registry of control handles for currently-running jobs.
#[derive(Debug, Default)]
pub struct ControlRegistry {
    inner: Mutex<HashMap<JobId, Arc<JobControl>>>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh handle for a job about to run. Always starts with
    /// clear flags — a resume must not inherit the pause request that
    /// parked the previous run.
    pub fn register(&self, job_id: JobId) -> Arc<JobControl> {
        let control = Arc::new(JobControl::default());
        self.inner
            .lock()
            .expect("control lock")
            .insert(job_id, Arc::clone(&control));
        control
    }

    pub fn get(&self, job_id: JobId) -> Option<Arc<JobControl>> {
        self.inner.lock().expect("control lock").get(&job_id).cloned()
    }

    pub fn remove(&self, job_id: JobId) {
        self.inner.lock().expect("control lock").remove(&job_id);
    }

    /// Number of registered handles (running jobs).
    pub fn len(&self) -> usize {
        self.inner.lock().expect("control lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
