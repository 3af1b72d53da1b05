//! Collaborator seams the engine calls into.
//!
//! The REST layer, ORM, file storage, and email delivery live elsewhere;
//! the engine sees them only through the traits here. Every trait is
//! object-safe and `Send + Sync` so collaborators are injected as
//! `Arc<dyn …>` — the same seam shape the vision provider uses.
//!
//! [`MemoryStore`] is a complete in-process implementation used by the
//! test suite and the demo CLI. Its locking gives the one semantic the
//! engine depends on: `record_page_progress` applies the job update and
//! the cookbook counter update in a single step, so readers never observe
//! the two drifting apart.

use crate::error::{ExtractionError, StoreError};
use crate::model::{
    Cookbook, CookbookId, CookbookStatus, JobError, JobId, JobStatus, NewRecipe,
    NonRecipeContent, ProcessingJob, Recipe, RecipeId, RecipeStatus, UserId,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

// ── Persistence ──────────────────────────────────────────────────────────

/// Everything the engine persists for one committed page, applied
/// atomically: log/error appends plus job and cookbook counters.
#[derive(Debug, Clone)]
pub struct PageProgress {
    /// Count of pages committed so far (== the just-finished page's
    /// 1-indexed number).
    pub current_page: u32,
    pub recipes_extracted: u32,
    pub failed_pages: u32,
    pub log_line: String,
    pub error: Option<JobError>,
}

/// CRUD surface over jobs, cookbooks, recipes, and non-recipe content.
#[async_trait]
pub trait ExtractionStore: Send + Sync {
    // Jobs
    async fn insert_job(
        &self,
        cookbook_id: CookbookId,
        user_id: UserId,
    ) -> Result<ProcessingJob, StoreError>;
    async fn job(&self, id: JobId) -> Result<Option<ProcessingJob>, StoreError>;
    async fn jobs_for_cookbook(
        &self,
        cookbook_id: CookbookId,
    ) -> Result<Vec<ProcessingJob>, StoreError>;
    /// The pending/processing/paused job for a cookbook, if any.
    async fn active_job_for_cookbook(
        &self,
        cookbook_id: CookbookId,
    ) -> Result<Option<ProcessingJob>, StoreError>;
    /// Mark the run started: status `processing`, `started_at` (first run
    /// only), `total_pages`, and cookbook status `processing` in one step.
    async fn set_job_started(&self, id: JobId, total_pages: u32) -> Result<(), StoreError>;
    /// Transition job status; terminal transitions stamp `completed_at`.
    async fn set_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError>;
    async fn append_job_log(&self, id: JobId, line: String) -> Result<(), StoreError>;
    /// Atomic per-page commit: log appends + job counters + cookbook
    /// counters together.
    async fn record_page_progress(
        &self,
        id: JobId,
        progress: PageProgress,
    ) -> Result<(), StoreError>;
    /// Count of pending/processing jobs created before this one (queue
    /// position input).
    async fn queued_before(&self, job: &ProcessingJob) -> Result<usize, StoreError>;
    /// Mark every non-cancelled job for the cookbook `cancelled`
    /// (re-extract housekeeping; precondition guarantees none is active).
    async fn cancel_jobs_for_cookbook(&self, cookbook_id: CookbookId) -> Result<(), StoreError>;
    async fn delete_job(&self, id: JobId) -> Result<(), StoreError>;

    // Cookbooks
    async fn cookbook(&self, id: CookbookId) -> Result<Option<Cookbook>, StoreError>;
    async fn set_cookbook_status(
        &self,
        id: CookbookId,
        status: CookbookStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError>;
    /// Zero counters and delete all recipes and non-recipe content
    /// (re-extract reset).
    async fn reset_cookbook(&self, id: CookbookId) -> Result<(), StoreError>;

    // Recipes
    async fn insert_recipe(&self, recipe: NewRecipe) -> Result<Recipe, StoreError>;
    async fn recipes_for_cookbook(
        &self,
        cookbook_id: CookbookId,
    ) -> Result<Vec<Recipe>, StoreError>;
    async fn insert_non_recipe(
        &self,
        cookbook_id: CookbookId,
        page_number: u32,
        category: &str,
    ) -> Result<(), StoreError>;
    async fn non_recipe_for_cookbook(
        &self,
        cookbook_id: CookbookId,
    ) -> Result<Vec<NonRecipeContent>, StoreError>;
    /// Pending/approved recipes still lacking generated imagery.
    async fn recipes_missing_images(&self) -> Result<Vec<Recipe>, StoreError>;
    async fn set_recipe_image(&self, id: RecipeId, url: &str) -> Result<(), StoreError>;
}

// ── Storage service ──────────────────────────────────────────────────────

/// Fetches the source PDF bytes for a cookbook.
#[async_trait]
pub trait StorageService: Send + Sync {
    async fn get_buffer(&self, path_or_url: &str) -> Result<Vec<u8>, ExtractionError>;
}

/// Default storage: local filesystem paths plus HTTP/HTTPS URLs.
pub struct DefaultStorage {
    pub download_timeout_secs: u64,
}

impl Default for DefaultStorage {
    fn default() -> Self {
        Self {
            download_timeout_secs: 120,
        }
    }
}

fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

#[async_trait]
impl StorageService for DefaultStorage {
    async fn get_buffer(&self, path_or_url: &str) -> Result<Vec<u8>, ExtractionError> {
        if is_url(path_or_url) {
            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(self.download_timeout_secs))
                .build()
                .map_err(|e| ExtractionError::DownloadFailed {
                    url: path_or_url.to_string(),
                    reason: e.to_string(),
                })?;

            let response = client.get(path_or_url).send().await.map_err(|e| {
                if e.is_timeout() {
                    ExtractionError::DownloadTimeout {
                        url: path_or_url.to_string(),
                        secs: self.download_timeout_secs,
                    }
                } else {
                    ExtractionError::DownloadFailed {
                        url: path_or_url.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

            if !response.status().is_success() {
                return Err(ExtractionError::DownloadFailed {
                    url: path_or_url.to_string(),
                    reason: format!("HTTP {}", response.status()),
                });
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| ExtractionError::DownloadFailed {
                    url: path_or_url.to_string(),
                    reason: e.to_string(),
                })?;
            Ok(bytes.to_vec())
        } else {
            tokio::fs::read(path_or_url)
                .await
                .map_err(|e| ExtractionError::SourceUnreadable {
                    path: path_or_url.to_string(),
                    detail: e.to_string(),
                })
        }
    }
}

// ── Image generation ─────────────────────────────────────────────────────

/// Produces a hosted image URL from a recipe description.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, title: &str, summary: &str) -> Result<String, ExtractionError>;
}

/// Placeholder used until a real generator is wired in; every call fails,
/// which the sweeper logs and skips.
pub struct UnconfiguredImageGenerator;

#[async_trait]
impl ImageGenerator for UnconfiguredImageGenerator {
    async fn generate(&self, _title: &str, _summary: &str) -> Result<String, ExtractionError> {
        Err(ExtractionError::Internal(
            "image generation not configured".into(),
        ))
    }
}

// ── Notification ─────────────────────────────────────────────────────────

/// Outbound email on natural completion.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_extraction_complete_email(
        &self,
        to: &str,
        cookbook_name: &str,
        recipes_extracted: u32,
        total_pages: u32,
        app_url: &str,
    ) -> Result<(), ExtractionError>;
}

/// Default notifier: logs and drops the email.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send_extraction_complete_email(
        &self,
        to: &str,
        cookbook_name: &str,
        recipes_extracted: u32,
        _total_pages: u32,
        _app_url: &str,
    ) -> Result<(), ExtractionError> {
        debug!(to, cookbook_name, recipes_extracted, "completion email suppressed (noop notifier)");
        Ok(())
    }
}

// ── In-memory store ──────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    jobs: HashMap<JobId, ProcessingJob>,
    cookbooks: HashMap<CookbookId, Cookbook>,
    recipes: HashMap<RecipeId, Recipe>,
    non_recipe: Vec<NonRecipeContent>,
    next_id: i64,
}

impl MemoryInner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process [`ExtractionStore`] for tests and the demo CLI.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a cookbook row (upload plumbing is out of engine scope, so
    /// this lives on the concrete store, not the trait).
    pub fn insert_cookbook(
        &self,
        user_id: UserId,
        title: &str,
        source_path: &str,
        owner_email: Option<&str>,
    ) -> Cookbook {
        let mut inner = self.inner.lock().expect("store lock");
        let id = inner.next_id();
        let cookbook = Cookbook {
            id,
            user_id,
            title: title.to_string(),
            source_path: source_path.to_string(),
            owner_email: owner_email.map(str::to_string),
            status: CookbookStatus::Uploaded,
            processed_pages: 0,
            total_recipes_found: 0,
            error_message: None,
        };
        inner.cookbooks.insert(id, cookbook.clone());
        cookbook
    }
}

#[async_trait]
impl ExtractionStore for MemoryStore {
    async fn insert_job(
        &self,
        cookbook_id: CookbookId,
        user_id: UserId,
    ) -> Result<ProcessingJob, StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        if !inner.cookbooks.contains_key(&cookbook_id) {
            return Err(StoreError::NotFound {
                entity: "cookbook",
                id: cookbook_id,
            });
        }
        let id = inner.next_id();
        let job = ProcessingJob {
            id,
            cookbook_id,
            user_id,
            total_pages: None,
            current_page: 0,
            recipes_extracted: 0,
            failed_pages: 0,
            status: JobStatus::Pending,
            processing_log: Vec::new(),
            error_log: Vec::new(),
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        inner.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn job(&self, id: JobId) -> Result<Option<ProcessingJob>, StoreError> {
        Ok(self.inner.lock().expect("store lock").jobs.get(&id).cloned())
    }

    async fn jobs_for_cookbook(
        &self,
        cookbook_id: CookbookId,
    ) -> Result<Vec<ProcessingJob>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        let mut jobs: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.cookbook_id == cookbook_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn active_job_for_cookbook(
        &self,
        cookbook_id: CookbookId,
    ) -> Result<Option<ProcessingJob>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.cookbook_id == cookbook_id && j.status.is_active())
            .min_by_key(|j| j.id)
            .cloned())
    }

    async fn set_job_started(&self, id: JobId, total_pages: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let cookbook_id = {
            let job = inner
                .jobs
                .get_mut(&id)
                .ok_or(StoreError::NotFound { entity: "job", id })?;
            job.status = JobStatus::Processing;
            job.total_pages = Some(total_pages);
            if job.started_at.is_none() {
                job.started_at = Some(Utc::now());
            }
            job.cookbook_id
        };
        if let Some(cookbook) = inner.cookbooks.get_mut(&cookbook_id) {
            cookbook.status = CookbookStatus::Processing;
            cookbook.error_message = None;
        }
        Ok(())
    }

    async fn set_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "job", id })?;
        job.status = status;
        if status.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        if let Some(message) = error_message {
            job.error_message = Some(message);
        }
        Ok(())
    }

    async fn append_job_log(&self, id: JobId, line: String) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "job", id })?;
        job.processing_log.push(line);
        Ok(())
    }

    async fn record_page_progress(
        &self,
        id: JobId,
        progress: PageProgress,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let cookbook_id = {
            let job = inner
                .jobs
                .get_mut(&id)
                .ok_or(StoreError::NotFound { entity: "job", id })?;
            job.current_page = progress.current_page;
            job.recipes_extracted = progress.recipes_extracted;
            job.failed_pages = progress.failed_pages;
            job.processing_log.push(progress.log_line);
            if let Some(error) = progress.error {
                job.error_log.push(error);
            }
            job.cookbook_id
        };
        // Same lock, same step: the cookbook counters can never drift from
        // the job row.
        let cookbook = inner.cookbooks.get_mut(&cookbook_id).ok_or(StoreError::NotFound {
            entity: "cookbook",
            id: cookbook_id,
        })?;
        cookbook.processed_pages = progress.current_page;
        cookbook.total_recipes_found = progress.recipes_extracted;
        Ok(())
    }

    async fn queued_before(&self, job: &ProcessingJob) -> Result<usize, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .jobs
            .values()
            .filter(|other| {
                other.id != job.id
                    && matches!(other.status, JobStatus::Pending | JobStatus::Processing)
                    && (other.created_at, other.id) < (job.created_at, job.id)
            })
            .count())
    }

    async fn cancel_jobs_for_cookbook(&self, cookbook_id: CookbookId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let now = Utc::now();
        for job in inner
            .jobs
            .values_mut()
            .filter(|j| j.cookbook_id == cookbook_id && j.status != JobStatus::Cancelled)
        {
            job.status = JobStatus::Cancelled;
            job.completed_at.get_or_insert(now);
        }
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner
            .jobs
            .remove(&id)
            .ok_or(StoreError::NotFound { entity: "job", id })?;
        Ok(())
    }

    async fn cookbook(&self, id: CookbookId) -> Result<Option<Cookbook>, StoreError> {
        Ok(self
            .inner
            .lock()
            .expect("store lock")
            .cookbooks
            .get(&id)
            .cloned())
    }

    async fn set_cookbook_status(
        &self,
        id: CookbookId,
        status: CookbookStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let cookbook = inner.cookbooks.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "cookbook",
            id,
        })?;
        cookbook.status = status;
        if let Some(message) = error_message {
            cookbook.error_message = Some(message);
        }
        Ok(())
    }

    async fn reset_cookbook(&self, id: CookbookId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        if !inner.cookbooks.contains_key(&id) {
            return Err(StoreError::NotFound {
                entity: "cookbook",
                id,
            });
        }
        inner.recipes.retain(|_, r| r.cookbook_id != id);
        inner.non_recipe.retain(|n| n.cookbook_id != id);
        if let Some(cookbook) = inner.cookbooks.get_mut(&id) {
            cookbook.processed_pages = 0;
            cookbook.total_recipes_found = 0;
            cookbook.status = CookbookStatus::Uploaded;
            cookbook.error_message = None;
        }
        Ok(())
    }

    async fn insert_recipe(&self, recipe: NewRecipe) -> Result<Recipe, StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        if !inner.cookbooks.contains_key(&recipe.cookbook_id) {
            return Err(StoreError::NotFound {
                entity: "cookbook",
                id: recipe.cookbook_id,
            });
        }
        let id = inner.next_id();
        let row = Recipe {
            id,
            cookbook_id: recipe.cookbook_id,
            title: recipe.title,
            ingredients: recipe.ingredients,
            instructions: recipe.instructions,
            nutrition: recipe.nutrition,
            dietary_flags: recipe.dietary_flags,
            source_page: recipe.source_page,
            image_url: None,
            status: recipe.status,
            created_at: Utc::now(),
        };
        inner.recipes.insert(id, row.clone());
        Ok(row)
    }

    async fn recipes_for_cookbook(
        &self,
        cookbook_id: CookbookId,
    ) -> Result<Vec<Recipe>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        let mut recipes: Vec<_> = inner
            .recipes
            .values()
            .filter(|r| r.cookbook_id == cookbook_id)
            .cloned()
            .collect();
        recipes.sort_by_key(|r| r.id);
        Ok(recipes)
    }

    async fn insert_non_recipe(
        &self,
        cookbook_id: CookbookId,
        page_number: u32,
        category: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let id = inner.next_id();
        inner.non_recipe.push(NonRecipeContent {
            id,
            cookbook_id,
            page_number,
            category: category.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn non_recipe_for_cookbook(
        &self,
        cookbook_id: CookbookId,
    ) -> Result<Vec<NonRecipeContent>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .non_recipe
            .iter()
            .filter(|n| n.cookbook_id == cookbook_id)
            .cloned()
            .collect())
    }

    async fn recipes_missing_images(&self) -> Result<Vec<Recipe>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        let mut recipes: Vec<_> = inner
            .recipes
            .values()
            .filter(|r| {
                r.image_url.is_none()
                    && matches!(r.status, RecipeStatus::Pending | RecipeStatus::Approved)
            })
            .cloned()
            .collect();
        recipes.sort_by_key(|r| r.id);
        Ok(recipes)
    }

    async fn set_recipe_image(&self, id: RecipeId, url: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let recipe = inner.recipes.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "recipe",
            id,
        })?;
        recipe.image_url = Some(url.to_string());
        Ok(())
    }
}
