//! Data model for jobs, cookbooks, and extracted recipes.
//!
//! These are the rows the engine reads and writes through
//! [`crate::store::ExtractionStore`]. The persisted job row is the single
//! source of truth for progress; everything the emitter broadcasts can be
//! re-derived from here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Database key aliases. Collaborating services hand these out; the engine
/// never mints ids itself.
pub type JobId = i64;
pub type CookbookId = i64;
pub type UserId = i64;
pub type RecipeId = i64;

// ── Status enums ─────────────────────────────────────────────────────────

/// Lifecycle of a processing job.
///
/// `pending → processing → {completed | failed | cancelled}`, with
/// `processing ⇄ paused` as a reversible sub-loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states are immutable except for administrative cleanup.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Active states block a second job on the same cookbook.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Processing | JobStatus::Paused
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarser-grained mirror of job status kept on the cookbook row so UI
/// reads don't need a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CookbookStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl CookbookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CookbookStatus::Uploaded => "uploaded",
            CookbookStatus::Processing => "processing",
            CookbookStatus::Completed => "completed",
            CookbookStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CookbookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review state of an extracted recipe. The engine writes `Pending` or
/// `NeedsReview` only; a human reviewer (or bulk action) owns the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeStatus {
    Pending,
    Approved,
    Rejected,
    NeedsReview,
}

impl RecipeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipeStatus::Pending => "pending",
            RecipeStatus::Approved => "approved",
            RecipeStatus::Rejected => "rejected",
            RecipeStatus::NeedsReview => "needs_review",
        }
    }
}

// ── Job ──────────────────────────────────────────────────────────────────

/// A structured entry in the job's error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// 1-indexed page the error occurred on; `None` for job-level errors.
    pub page: Option<u32>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// One extraction attempt over a cookbook.
///
/// Exclusively mutated by the job state machine while running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: JobId,
    pub cookbook_id: CookbookId,
    pub user_id: UserId,
    /// Unknown until the source PDF has been opened.
    pub total_pages: Option<u32>,
    /// Count of pages committed so far; the resume origin.
    pub current_page: u32,
    pub recipes_extracted: u32,
    pub failed_pages: u32,
    pub status: JobStatus,
    /// Human-readable trace lines, append-only.
    pub processing_log: Vec<String>,
    pub error_log: Vec<JobError>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Cookbook ─────────────────────────────────────────────────────────────

/// The parent artifact being processed. Many jobs may reference one
/// cookbook over time (re-extraction), but at most one may be active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cookbook {
    pub id: CookbookId,
    pub user_id: UserId,
    pub title: String,
    /// Path or URL the storage service resolves to the PDF bytes.
    pub source_path: String,
    /// Where the completion email goes; `None` skips notification.
    pub owner_email: Option<String>,
    pub status: CookbookStatus,
    /// Denormalised from the active job so UI reads don't need a join.
    pub processed_pages: u32,
    pub total_recipes_found: u32,
    pub error_message: Option<String>,
}

// ── Recipe ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    pub name: String,
    #[serde(default)]
    pub quantity: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionStep {
    pub step: u32,
    pub text: String,
    /// Timing called out in the step, if any.
    #[serde(default)]
    pub minutes: Option<u32>,
    /// Oven/pan temperature called out in the step, e.g. "180C".
    #[serde(default)]
    pub temperature: Option<String>,
}

/// Per-serving estimates the model produces from the printed page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Nutrition {
    #[serde(default)]
    pub calories: Option<u32>,
    #[serde(default)]
    pub protein_g: Option<f32>,
    #[serde(default)]
    pub fat_g: Option<f32>,
    #[serde(default)]
    pub carbs_g: Option<f32>,
}

/// One persisted row per accepted extraction candidate. Never mutated by
/// the engine once written (the image sweeper fills `image_url` later).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub id: RecipeId,
    pub cookbook_id: CookbookId,
    pub title: String,
    pub ingredients: Vec<Ingredient>,
    pub instructions: Vec<InstructionStep>,
    pub nutrition: Option<Nutrition>,
    pub dietary_flags: Vec<String>,
    /// 1-indexed page the recipe was extracted from.
    pub source_page: u32,
    pub image_url: Option<String>,
    pub status: RecipeStatus,
    pub created_at: DateTime<Utc>,
}

/// Insert shape for a recipe — everything but the store-assigned id and
/// timestamp.
#[derive(Debug, Clone)]
pub struct NewRecipe {
    pub cookbook_id: CookbookId,
    pub title: String,
    pub ingredients: Vec<Ingredient>,
    pub instructions: Vec<InstructionStep>,
    pub nutrition: Option<Nutrition>,
    pub dietary_flags: Vec<String>,
    pub source_page: u32,
    pub status: RecipeStatus,
}

/// A page classified as not containing a recipe; recorded for
/// auditability, never shown for review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonRecipeContent {
    pub id: i64,
    pub cookbook_id: CookbookId,
    /// 1-indexed.
    pub page_number: u32,
    /// e.g. "table_of_contents", "photo", "advertisement".
    pub category: String,
    pub created_at: DateTime<Utc>,
}

// ── Classifier output ────────────────────────────────────────────────────

/// A recipe candidate as extracted from one page, before dedup and persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeCandidate {
    pub title: String,
    #[serde(default)]
    pub ingredients: Vec<Ingredient>,
    #[serde(default)]
    pub instructions: Vec<InstructionStep>,
    #[serde(default)]
    pub nutrition: Option<Nutrition>,
    #[serde(default)]
    pub dietary_flags: Vec<String>,
    /// Model's confidence the extraction is faithful, 0.0–1.0.
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    /// The page only continues a recipe begun on an earlier page.
    #[serde(default)]
    pub continuation: bool,
}

fn default_confidence() -> f32 {
    1.0
}

/// What the classifier concluded about one page.
#[derive(Debug, Clone)]
pub enum PageOutcome {
    /// Table of contents, photo spread, advertisement — no recipe content.
    NonRecipe { category: String },
    /// One or more recipe candidates (two recipes on one page is common).
    Recipes { candidates: Vec<RecipeCandidate> },
}

impl NewRecipe {
    /// Build the insert row from an accepted candidate.
    pub fn from_candidate(
        cookbook_id: CookbookId,
        source_page: u32,
        candidate: RecipeCandidate,
        status: RecipeStatus,
    ) -> Self {
        Self {
            cookbook_id,
            title: candidate.title,
            ingredients: candidate.ingredients,
            instructions: candidate.instructions,
            nutrition: candidate.nutrition,
            dietary_flags: candidate.dietary_flags,
            source_page,
            status,
        }
    }
}
