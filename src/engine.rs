//! The extraction job state machine.
//!
//! One job runs as one logical sequential task: render page, classify,
//! dedup, persist, emit — strictly in ascending page order, committing
//! progress after every page so a crash, pause, or cancel never loses
//! extracted work. Lifecycle:
//!
//! ```text
//! pending ──▶ processing ──▶ completed
//!                │    ▲  └──▶ failed
//!                ▼    │  └──▶ cancelled
//!              paused ┘
//! ```
//!
//! ## Failure semantics
//!
//! A page-level error ([`crate::error::PageError`]) increments
//! `failed_pages` and the loop advances — partial-failure tolerance is the
//! point of the design. Job-level errors ([`ExtractionError`]) stop the
//! loop with a terminal `failed` write. The spawn wrapper catches panics
//! too: a stopped task must never leave a job stuck in `processing`.
//!
//! ## Signalling
//!
//! Pause/resume/cancel register intent on a per-job
//! [`crate::control::JobControl`] handle
//! and take effect at the next loop-iteration boundary, never mid-page.
//! This bounds worst-case latency to one page's processing time and avoids
//! half-written recipes.

use crate::config::ExtractionConfig;
use crate::control::ControlRegistry;
use crate::dedup::DedupIndex;
use crate::emitter::{EventPayload, ProgressEmitter, ProgressEvent};
use crate::error::ExtractionError;
use crate::model::{
    CookbookId, CookbookStatus, JobError, JobId, JobStatus, NewRecipe, PageOutcome,
    ProcessingJob, RecipeStatus, UserId,
};
use crate::pipeline::classify::{PageClassifier, PageContext, VisionClassifier};
use crate::pipeline::render::{PdfRenderer, PdfiumRenderer};
use crate::recovery;
use crate::stats::RunStats;
use crate::store::{
    DefaultStorage, ExtractionStore, ImageGenerator, NoopNotifier, Notifier, PageProgress,
    StorageService, UnconfiguredImageGenerator,
};
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// The extraction engine: collaborator handles plus the in-process job
/// registries. Cheap to clone via its inner `Arc`.
#[derive(Clone)]
pub struct ExtractionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: ExtractionConfig,
    store: Arc<dyn ExtractionStore>,
    storage: Arc<dyn StorageService>,
    renderer: Arc<dyn PdfRenderer>,
    classifier: Arc<dyn PageClassifier>,
    images: Arc<dyn ImageGenerator>,
    notifier: Arc<dyn Notifier>,
    emitter: ProgressEmitter,
    controls: ControlRegistry,
    /// Supervised task set keyed by job id; entries removed when the task
    /// exits.
    tasks: Mutex<HashMap<JobId, JoinHandle<()>>>,
}

/// Builder for [`ExtractionEngine`]. Only the store is mandatory; every
/// other collaborator has a production default.
pub struct ExtractionEngineBuilder {
    config: ExtractionConfig,
    store: Option<Arc<dyn ExtractionStore>>,
    storage: Option<Arc<dyn StorageService>>,
    renderer: Option<Arc<dyn PdfRenderer>>,
    classifier: Option<Arc<dyn PageClassifier>>,
    images: Option<Arc<dyn ImageGenerator>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl ExtractionEngineBuilder {
    pub fn store(mut self, store: Arc<dyn ExtractionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageService>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn PdfRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn PageClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn image_generator(mut self, images: Arc<dyn ImageGenerator>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Build the engine, constructing defaults for collaborators not
    /// provided. The default classifier resolves a vision provider from
    /// the environment, so this can fail without an API key.
    pub fn build(self) -> Result<ExtractionEngine, ExtractionError> {
        let store = self
            .store
            .ok_or_else(|| ExtractionError::InvalidConfig("engine requires a store".into()))?;
        let storage = self.storage.unwrap_or_else(|| {
            Arc::new(DefaultStorage {
                download_timeout_secs: self.config.download_timeout_secs,
            })
        });
        let renderer = self
            .renderer
            .unwrap_or_else(|| Arc::new(PdfiumRenderer::new(self.config.max_rendered_pixels)));
        let classifier = match self.classifier {
            Some(c) => c,
            None => Arc::new(VisionClassifier::from_config(&self.config)?),
        };
        let images = self
            .images
            .unwrap_or_else(|| Arc::new(UnconfiguredImageGenerator));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(NoopNotifier));

        Ok(ExtractionEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                store,
                storage,
                renderer,
                classifier,
                images,
                notifier,
                emitter: ProgressEmitter::new(),
                controls: ControlRegistry::new(),
                tasks: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl ExtractionEngine {
    pub fn builder(config: ExtractionConfig) -> ExtractionEngineBuilder {
        ExtractionEngineBuilder {
            config,
            store: None,
            storage: None,
            renderer: None,
            classifier: None,
            images: None,
            notifier: None,
        }
    }

    /// The live-status emitter; subscribe or open an event stream here.
    pub fn emitter(&self) -> &ProgressEmitter {
        &self.inner.emitter
    }

    /// Create a `pending` job row for a cookbook.
    ///
    /// Enforces the single cross-job invariant at creation time: at most
    /// one active (pending/processing/paused) job per cookbook.
    pub async fn create_job(
        &self,
        cookbook_id: CookbookId,
        user_id: UserId,
    ) -> Result<ProcessingJob, ExtractionError> {
        if self.inner.store.cookbook(cookbook_id).await?.is_none() {
            return Err(ExtractionError::CookbookNotFound { id: cookbook_id });
        }
        if let Some(active) = self.inner.store.active_job_for_cookbook(cookbook_id).await? {
            return Err(ExtractionError::ActiveJobExists {
                cookbook_id,
                job_id: active.id,
            });
        }
        Ok(self.inner.store.insert_job(cookbook_id, user_id).await?)
    }

    /// Start (or resume) extraction as a supervised background task.
    ///
    /// Fire-and-forget from the caller's perspective: the task writes its
    /// own terminal status on every exit path, including panics.
    pub fn spawn_extraction(&self, job_id: JobId) {
        // The lock is held across spawn + insert so the task's own cleanup
        // (which also takes this lock) cannot race ahead of the insert.
        let mut tasks = self.inner.tasks.lock().expect("tasks lock");
        if tasks.contains_key(&job_id) {
            warn!(job_id, "extraction task already running; ignoring duplicate spawn");
            return;
        }
        self.inner.controls.register(job_id);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            supervise(inner, job_id).await;
        });
        tasks.insert(job_id, handle);
    }

    /// Await the background task for a job (test and CLI convenience).
    /// Returns immediately if the job has no running task.
    pub async fn wait(&self, job_id: JobId) {
        let handle = self.inner.tasks.lock().expect("tasks lock").remove(&job_id);
        if let Some(handle) = handle {
            // The supervised task never propagates errors; a join error
            // would mean it was aborted externally.
            let _ = handle.await;
        }
    }

    /// Whether a background task for the job is currently running.
    pub fn is_running(&self, job_id: JobId) -> bool {
        self.inner.tasks.lock().expect("tasks lock").contains_key(&job_id)
    }

    pub fn running_count(&self) -> usize {
        self.inner.tasks.lock().expect("tasks lock").len()
    }

    /// Request a pause; takes effect at the next loop-iteration boundary.
    pub async fn pause_job(&self, job_id: JobId) -> Result<(), ExtractionError> {
        let job = self.fetch_job(job_id).await?;
        if job.status != JobStatus::Processing {
            return Err(ExtractionError::InvalidStatus {
                id: job_id,
                status: job.status,
                action: "pause",
            });
        }
        match self.inner.controls.get(job_id) {
            Some(control) => {
                control.request_pause();
                Ok(())
            }
            None => Err(ExtractionError::Internal(format!(
                "job {job_id} is processing but has no control handle (stale status?)"
            ))),
        }
    }

    /// Clear the pause and re-spawn the loop from the persisted
    /// `current_page`. Already-committed pages are never re-processed.
    pub async fn resume_job(&self, job_id: JobId) -> Result<(), ExtractionError> {
        let job = self.fetch_job(job_id).await?;
        if job.status != JobStatus::Paused {
            return Err(ExtractionError::InvalidStatus {
                id: job_id,
                status: job.status,
                action: "resume",
            });
        }
        info!(job_id, from_page = job.current_page, "resuming extraction");
        self.spawn_extraction(job_id);
        Ok(())
    }

    /// Request cancellation. A running loop observes the flag at its next
    /// boundary; a parked (pending/paused) job is finalised directly.
    /// Recipes committed so far are retained.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<(), ExtractionError> {
        let job = self.fetch_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(ExtractionError::InvalidStatus {
                id: job_id,
                status: job.status,
                action: "cancel",
            });
        }
        if let Some(control) = self.inner.controls.get(job_id) {
            control.request_cancel();
            return Ok(());
        }
        // No running task: finalise here.
        self.inner
            .store
            .set_job_status(job_id, JobStatus::Cancelled, Some("cancelled by user".into()))
            .await?;
        self.inner
            .store
            .set_cookbook_status(
                job.cookbook_id,
                CookbookStatus::Failed,
                Some("extraction cancelled before completion".into()),
            )
            .await?;
        self.inner
            .store
            .append_job_log(job_id, "extraction cancelled".into())
            .await?;
        Ok(())
    }

    /// Administrative reset: wipe the cookbook's extracted content and
    /// start a fresh job from page 0. Rejected while a job is active.
    pub async fn re_extract(
        &self,
        cookbook_id: CookbookId,
    ) -> Result<ProcessingJob, ExtractionError> {
        let cookbook = self
            .inner
            .store
            .cookbook(cookbook_id)
            .await?
            .ok_or(ExtractionError::CookbookNotFound { id: cookbook_id })?;
        if let Some(active) = self.inner.store.active_job_for_cookbook(cookbook_id).await? {
            return Err(ExtractionError::ActiveJobExists {
                cookbook_id,
                job_id: active.id,
            });
        }

        self.inner.store.cancel_jobs_for_cookbook(cookbook_id).await?;
        self.inner.store.reset_cookbook(cookbook_id).await?;
        let job = self
            .inner
            .store
            .insert_job(cookbook_id, cookbook.user_id)
            .await?;
        self.inner
            .store
            .append_job_log(job.id, "re-extraction: previous recipes cleared".into())
            .await?;
        info!(cookbook_id, job_id = job.id, "re-extraction started");
        self.spawn_extraction(job.id);
        Ok(job)
    }

    /// Position in the processing queue — computed, never stored. A
    /// `processing` job always reports 0.
    pub async fn queue_position(&self, job_id: JobId) -> Result<usize, ExtractionError> {
        let job = self.fetch_job(job_id).await?;
        if job.status == JobStatus::Processing {
            return Ok(0);
        }
        Ok(self.inner.store.queued_before(&job).await?)
    }

    /// Administrative cleanup of a failed job row.
    pub async fn delete_failed_job(&self, job_id: JobId) -> Result<(), ExtractionError> {
        let job = self.fetch_job(job_id).await?;
        if job.status != JobStatus::Failed {
            return Err(ExtractionError::InvalidStatus {
                id: job_id,
                status: job.status,
                action: "delete",
            });
        }
        Ok(self.inner.store.delete_job(job_id).await?)
    }

    /// Re-queue image generation for recipes missing imagery; returns how
    /// many were queued. Idempotent.
    pub async fn recover_missing_images(&self) -> Result<usize, ExtractionError> {
        recovery::recover_missing_images(
            &self.inner.store,
            &self.inner.images,
            self.inner.config.image_concurrency,
        )
        .await
    }

    async fn fetch_job(&self, job_id: JobId) -> Result<ProcessingJob, ExtractionError> {
        self.inner
            .store
            .job(job_id)
            .await?
            .ok_or(ExtractionError::JobNotFound { id: job_id })
    }
}

// ── Supervised run ───────────────────────────────────────────────────────

/// Panic/exception boundary around one run. Whatever happens inside, the
/// job leaves `processing` and the registries are cleaned up.
async fn supervise(inner: Arc<EngineInner>, job_id: JobId) {
    let outcome = AssertUnwindSafe(run_job(Arc::clone(&inner), job_id))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(job_id, error = %e, "extraction run failed");
            mark_failed(&inner, job_id, e.to_string()).await;
        }
        Err(panic) => {
            let message = panic_message(panic);
            error!(job_id, panic = %message, "extraction task panicked");
            mark_failed(&inner, job_id, format!("internal panic: {message}")).await;
        }
    }

    inner.controls.remove(job_id);
    inner.tasks.lock().expect("tasks lock").remove(&job_id);
}

/// Best-effort terminal `failed` write. Never overwrites a state the run
/// already finalised (completed/cancelled), and survives the store itself
/// being the broken collaborator.
async fn mark_failed(inner: &EngineInner, job_id: JobId, message: String) {
    match inner.store.job(job_id).await {
        Ok(Some(job)) if !job.status.is_terminal() => {
            if let Err(e) = inner
                .store
                .set_job_status(job_id, JobStatus::Failed, Some(message.clone()))
                .await
            {
                error!(job_id, error = %e, "could not persist failed status");
            }
            if let Err(e) = inner
                .store
                .set_cookbook_status(
                    job.cookbook_id,
                    CookbookStatus::Failed,
                    Some(message.clone()),
                )
                .await
            {
                error!(job_id, error = %e, "could not persist cookbook failure");
            }
            let _ = inner
                .store
                .append_job_log(job_id, format!("job failed: {message}"))
                .await;
            inner.emitter.emit(&ProgressEvent::new(
                job_id,
                job.cookbook_id,
                EventPayload::Error {
                    page: None,
                    message,
                },
            ));
        }
        Ok(_) => {
            warn!(job_id, "failure after terminal transition (or missing job); not recorded: {message}");
        }
        Err(e) => {
            error!(job_id, error = %e, "store unreachable while recording failure: {message}");
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ── The page loop ────────────────────────────────────────────────────────

async fn run_job(inner: Arc<EngineInner>, job_id: JobId) -> Result<(), ExtractionError> {
    let store = &inner.store;
    let emitter = &inner.emitter;
    let config = &inner.config;

    let job = store
        .job(job_id)
        .await?
        .ok_or(ExtractionError::JobNotFound { id: job_id })?;
    if job.status.is_terminal() {
        return Err(ExtractionError::InvalidStatus {
            id: job_id,
            status: job.status,
            action: "start",
        });
    }
    let cookbook = store
        .cookbook(job.cookbook_id)
        .await?
        .ok_or(ExtractionError::CookbookNotFound { id: job.cookbook_id })?;
    let control = inner
        .controls
        .get(job_id)
        .ok_or_else(|| ExtractionError::Internal("run started without control handle".into()))?;

    let origin = job.current_page;
    info!(job_id, cookbook_id = cookbook.id, origin, "extraction run starting");

    // ── Materialise the source PDF ───────────────────────────────────────
    let bytes = inner.storage.get_buffer(&cookbook.source_path).await?;
    if bytes.len() < 4 || &bytes[..4] != b"%PDF" {
        let mut magic = [0u8; 4];
        for (dst, src) in magic.iter_mut().zip(bytes.iter()) {
            *dst = *src;
        }
        return Err(ExtractionError::NotAPdf {
            path: cookbook.source_path.clone(),
            magic,
        });
    }
    // pdfium needs a file-system path; the temp file lives for the whole
    // run and is cleaned up on drop, even on panic.
    let mut tmp = tempfile::NamedTempFile::new()
        .map_err(|e| ExtractionError::Internal(format!("tempfile: {e}")))?;
    tmp.write_all(&bytes)
        .map_err(|e| ExtractionError::Internal(format!("tempfile write: {e}")))?;

    let source = inner.renderer.open(tmp.path()).await?;
    let total_pages = source.page_count();

    store.set_job_started(job_id, total_pages).await?;
    store
        .append_job_log(
            job_id,
            format!("processing started at page {origin} of {total_pages}"),
        )
        .await?;

    // ── Per-run state ────────────────────────────────────────────────────
    let mut stats = RunStats::new(config.cost_per_page_usd);
    let mut recipes_extracted = job.recipes_extracted;
    let mut failed_pages = job.failed_pages;
    let mut context = PageContext::new(config.context_window);
    let mut dedup = DedupIndex::new(config.dedup_threshold);
    dedup.seed(&store.recipes_for_cookbook(cookbook.id).await?);

    // ── The loop ─────────────────────────────────────────────────────────
    for page in origin..total_pages {
        // Signals are honoured only here, at the iteration boundary: an
        // in-flight page always completes, so a pause/cancel never leaves
        // a half-written recipe.
        if control.cancel_requested() {
            store
                .set_job_status(job_id, JobStatus::Cancelled, Some("cancelled by user".into()))
                .await?;
            store
                .set_cookbook_status(
                    cookbook.id,
                    CookbookStatus::Failed,
                    Some("extraction cancelled before completion".into()),
                )
                .await?;
            store
                .append_job_log(job_id, format!("extraction cancelled at page {page}"))
                .await?;
            info!(job_id, page, "extraction cancelled");
            return Ok(());
        }
        if control.pause_requested() {
            store.set_job_status(job_id, JobStatus::Paused, None).await?;
            store
                .append_job_log(job_id, format!("extraction paused at page {page}"))
                .await?;
            emitter.emit(&ProgressEvent::new(
                job_id,
                cookbook.id,
                EventPayload::Paused { current_page: page },
            ));
            info!(job_id, page, "extraction paused");
            return Ok(());
        }

        let page_number = page + 1;
        let outcome = match source.render_page(page).await {
            Ok(image) => inner.classifier.classify(&image, page_number, &context).await,
            Err(e) => Err(e),
        };

        let mut page_error: Option<JobError> = None;
        let log_line = match outcome {
            Err(err) => {
                // A timeout on the very first page of a fresh run means the
                // AI service is down, not that one page is bad.
                if page == 0 && origin == 0 && err.is_timeout() {
                    return Err(ExtractionError::AiUnavailable {
                        detail: err.to_string(),
                    });
                }
                failed_pages += 1;
                stats.record_failed_page();
                warn!(job_id, page = page_number, error = %err, "page failed");
                emitter.emit(&ProgressEvent::new(
                    job_id,
                    cookbook.id,
                    EventPayload::Error {
                        page: Some(page_number),
                        message: err.to_string(),
                    },
                ));
                page_error = Some(JobError {
                    page: Some(page_number),
                    message: err.to_string(),
                    at: Utc::now(),
                });
                context.push(page_number, Vec::new());
                format!("page {page_number}: failed: {err}")
            }
            Ok(PageOutcome::NonRecipe { category }) => {
                store
                    .insert_non_recipe(cookbook.id, page_number, &category)
                    .await?;
                stats.record_skipped();
                emitter.emit(&ProgressEvent::new(
                    job_id,
                    cookbook.id,
                    EventPayload::PageSkipped {
                        page: page_number,
                        category: category.clone(),
                    },
                ));
                context.push(page_number, Vec::new());
                format!("page {page_number}: no recipe ({category})")
            }
            Ok(PageOutcome::Recipes { candidates }) => {
                let mut titles = Vec::with_capacity(candidates.len());
                let mut accepted = 0u32;
                let mut duplicates = 0u32;
                let mut continuations = 0u32;

                for candidate in candidates {
                    titles.push(candidate.title.clone());

                    if candidate.continuation && dedup.contains_title(&candidate.title) {
                        // The page adds steps to a recipe we already hold;
                        // nothing new to persist.
                        continuations += 1;
                        continue;
                    }
                    if dedup.is_duplicate(&candidate) {
                        stats.record_duplicate();
                        duplicates += 1;
                        continue;
                    }

                    let needs_review = candidate.confidence < config.confidence_threshold;
                    let status = if needs_review {
                        RecipeStatus::NeedsReview
                    } else {
                        RecipeStatus::Pending
                    };
                    dedup.observe(&candidate);
                    let recipe = store
                        .insert_recipe(NewRecipe::from_candidate(
                            cookbook.id,
                            page_number,
                            candidate,
                            status,
                        ))
                        .await?;
                    recipes_extracted += 1;
                    accepted += 1;
                    stats.record_recipe(needs_review);
                    emitter.emit(&ProgressEvent::new(
                        job_id,
                        cookbook.id,
                        EventPayload::RecipeFound {
                            recipe_id: recipe.id,
                            title: recipe.title.clone(),
                            source_page: page_number,
                            needs_review,
                        },
                    ));
                }

                context.push(page_number, titles);
                let mut line = format!("page {page_number}: {accepted} recipe(s) extracted");
                if duplicates > 0 {
                    line.push_str(&format!(", {duplicates} duplicate(s) removed"));
                }
                if continuations > 0 {
                    line.push_str(&format!(", {continuations} continuation(s) merged"));
                }
                line
            }
        };

        stats.record_page();

        // Recipe writes for this page are committed above; this one call
        // atomically advances the job row and the cookbook counters. A
        // failure here aborts the run — progress can no longer be trusted.
        store
            .record_page_progress(
                job_id,
                PageProgress {
                    current_page: page_number,
                    recipes_extracted,
                    failed_pages,
                    log_line,
                    error: page_error,
                },
            )
            .await?;

        // Events fire only after the write commits, so a client reacting
        // to one can re-fetch and see consistent state.
        if emitter.has_listeners(job_id) {
            emitter.emit(&ProgressEvent::new(
                job_id,
                cookbook.id,
                EventPayload::Progress {
                    current_page: page_number,
                    total_pages,
                    recipes_extracted,
                    failed_pages,
                },
            ));
            if stats.at_cost_cadence(config.cost_update_every) {
                emitter.emit(&ProgressEvent::new(
                    job_id,
                    cookbook.id,
                    EventPayload::CostUpdate {
                        stats: stats.snapshot(),
                    },
                ));
            }
        }
    }

    // ── Natural completion ───────────────────────────────────────────────
    store.append_job_log(job_id, stats.summary_line()).await?;
    store.set_job_status(job_id, JobStatus::Completed, None).await?;
    store
        .set_cookbook_status(cookbook.id, CookbookStatus::Completed, None)
        .await?;
    emitter.emit(&ProgressEvent::new(
        job_id,
        cookbook.id,
        EventPayload::Completed {
            recipes_extracted,
            total_pages,
            failed_pages,
        },
    ));
    info!(
        job_id,
        recipes = recipes_extracted,
        failed = failed_pages,
        total = total_pages,
        "extraction completed"
    );

    if let Some(ref email) = cookbook.owner_email {
        if let Err(e) = inner
            .notifier
            .send_extraction_complete_email(
                email,
                &cookbook.title,
                recipes_extracted,
                total_pages,
                &config.app_url,
            )
            .await
        {
            // Email is best-effort; a completed job stays completed.
            warn!(job_id, error = %e, "completion email failed");
        }
    }

    Ok(())
}
