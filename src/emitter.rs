//! In-memory progress pub/sub, keyed by job id.
//!
//! The emitter is a best-effort notification layer: `emit` synchronously
//! fans an event out to whoever is subscribed *right now*, and a client
//! that connects later simply misses it. There is no persistence or replay
//! — the persisted job row is the authoritative state, and the event stream
//! is a latency optimisation only. Tests assert against the store, never
//! against event delivery.
//!
//! Listener exceptions are isolated: each callback runs inside
//! `catch_unwind` so one faulty subscriber cannot break delivery to the
//! others or unwind into the extraction loop.

use crate::model::{CookbookId, JobId};
use crate::stats::StatsSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use tracing::warn;

// ── Events ───────────────────────────────────────────────────────────────

/// One live status event for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub cookbook_id: CookbookId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl ProgressEvent {
    pub fn new(job_id: JobId, cookbook_id: CookbookId, payload: EventPayload) -> Self {
        Self {
            job_id,
            cookbook_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Typed event payloads; `kind()` yields the SSE event name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Emitted after each page's progress write commits.
    Progress {
        current_page: u32,
        total_pages: u32,
        recipes_extracted: u32,
        failed_pages: u32,
    },
    /// A recipe candidate was accepted and persisted.
    RecipeFound {
        recipe_id: i64,
        title: String,
        source_page: u32,
        needs_review: bool,
    },
    /// A page held no recipe content (table of contents, photo, ad).
    PageSkipped { page: u32, category: String },
    /// A page-level or job-level failure. `page` is None for job-level.
    Error { page: Option<u32>, message: String },
    /// The run finished naturally.
    Completed {
        recipes_extracted: u32,
        total_pages: u32,
        failed_pages: u32,
    },
    /// The run parked at a loop boundary after a pause request.
    Paused { current_page: u32 },
    /// Bounded-cadence cost/stats snapshot.
    CostUpdate { stats: StatsSnapshot },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Progress { .. } => "progress",
            EventPayload::RecipeFound { .. } => "recipe_found",
            EventPayload::PageSkipped { .. } => "page_skipped",
            EventPayload::Error { .. } => "error",
            EventPayload::Completed { .. } => "completed",
            EventPayload::Paused { .. } => "paused",
            EventPayload::CostUpdate { .. } => "cost_update",
        }
    }
}

// ── Emitter ──────────────────────────────────────────────────────────────

type Listener = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

#[derive(Default)]
struct EmitterInner {
    listeners: Mutex<HashMap<JobId, Vec<(u64, Listener)>>>,
    next_token: AtomicU64,
}

/// Single-process pub/sub registry. A cheap clone-able handle — clones
/// share the same listener table. Mutated only by short synchronous
/// sections; listeners are invoked outside the lock.
#[derive(Clone, Default)]
pub struct ProgressEmitter {
    inner: Arc<EmitterInner>,
}

impl ProgressEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one job's events. Dropping the returned
    /// [`Subscription`] (or calling `unsubscribe`) removes it.
    pub fn subscribe(
        &self,
        job_id: JobId,
        listener: impl Fn(&ProgressEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .expect("emitter lock")
            .entry(job_id)
            .or_default()
            .push((token, Arc::new(listener)));
        Subscription {
            emitter: self.clone(),
            job_id,
            token,
        }
    }

    /// Deliver an event to every current listener for its job id.
    ///
    /// Listeners run synchronously on the caller's task; a panicking
    /// listener is logged and skipped, the rest still receive the event.
    pub fn emit(&self, event: &ProgressEvent) {
        let snapshot: Vec<Listener> = {
            let guard = self.inner.listeners.lock().expect("emitter lock");
            match guard.get(&event.job_id) {
                Some(entries) => entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
                None => return,
            }
        };

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(
                    job_id = event.job_id,
                    kind = event.payload.kind(),
                    "progress listener panicked; continuing delivery"
                );
            }
        }
    }

    /// Whether anyone is watching this job. Lets the loop skip building
    /// event payloads nobody will see.
    pub fn has_listeners(&self, job_id: JobId) -> bool {
        self.inner
            .listeners
            .lock()
            .expect("emitter lock")
            .get(&job_id)
            .is_some_and(|v| !v.is_empty())
    }

    /// Bridge a subscription into a `Stream` of owned events, suitable for
    /// a server-sent-events response body. The subscription ends when the
    /// stream is dropped.
    pub fn event_stream(&self, job_id: JobId) -> EventStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let subscription = self.subscribe(job_id, move |event: &ProgressEvent| {
            // Receiver gone means the client disconnected; nothing to do.
            let _ = tx.send(event.clone());
        });
        EventStream {
            _subscription: subscription,
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    fn remove(&self, job_id: JobId, token: u64) {
        let mut guard = self.inner.listeners.lock().expect("emitter lock");
        if let Some(entries) = guard.get_mut(&job_id) {
            entries.retain(|(t, _)| *t != token);
            if entries.is_empty() {
                guard.remove(&job_id);
            }
        }
    }
}

/// Handle for one registered listener; unsubscribes on drop.
pub struct Subscription {
    emitter: ProgressEmitter,
    job_id: JobId,
    token: u64,
}

impl Subscription {
    /// Explicit early removal; equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.emitter.remove(self.job_id, self.token);
    }
}

/// Owned stream of progress events for one job.
pub struct EventStream {
    _subscription: Subscription,
    inner: UnboundedReceiverStream<ProgressEvent>,
}

impl Stream for EventStream {
    type Item = ProgressEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}
