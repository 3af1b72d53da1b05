//! # cookscan
//!
//! Extract structured recipe records from scanned cookbook PDFs using
//! Vision Language Models (VLMs).
//!
//! ## Why this crate?
//!
//! Scanned cookbooks defeat text-layer extraction — decorative layouts,
//! two recipes to a page, ingredient tables set in small caps. Instead this
//! crate rasterises each page and lets a VLM read it as a cook would,
//! producing typed recipes (ingredients, steps, nutrition, dietary flags)
//! ready for human review.
//!
//! The hard part is not the model call; it is running one over a 1,000-page
//! book without losing work. The extraction engine here is a **resumable,
//! cancellable background job**: it commits progress after every page,
//! tolerates per-page failures, honours pause/resume/cancel at loop
//! boundaries, and streams live status to subscribers while keeping the
//! persisted job row as the single source of truth.
//!
//! ## Pipeline Overview
//!
//! ```text
//! cookbook PDF
//!  │
//!  ├─ 1. Fetch     storage service resolves path/URL to bytes
//!  ├─ 2. Render    rasterise one page via pdfium (spawn_blocking)
//!  ├─ 3. Encode    PNG → base64 ImageData
//!  ├─ 4. Classify  vision call with rolling page context, retry/backoff
//!  ├─ 5. Dedup     normalised title + ingredient-set similarity
//!  ├─ 6. Persist   recipe rows + atomic job/cookbook progress commit
//!  └─ 7. Emit      progress | recipe_found | page_skipped | … events
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cookscan::{ExtractionConfig, ExtractionEngine, ExtractionStore, MemoryStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let store = Arc::new(MemoryStore::new());
//!     let cookbook = store.insert_cookbook(1, "Family Recipes", "scans/family.pdf", None);
//!
//!     let engine = ExtractionEngine::builder(ExtractionConfig::default())
//!         .store(store.clone())
//!         .build()?;
//!
//!     let job = engine.create_job(cookbook.id, 1).await?;
//!     engine.spawn_extraction(job.id);
//!     engine.wait(job.id).await;
//!
//!     for recipe in store.recipes_for_cookbook(cookbook.id).await? {
//!         println!("p.{} {}", recipe.source_page, recipe.title);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Correctness model
//!
//! The persisted job row is authoritative; the [`ProgressEmitter`] is a
//! best-effort, no-replay notification layer. Events for a page are emitted
//! only after that page's database write commits, so a client reacting to
//! an event can re-fetch and see consistent state — or ignore events
//! entirely and poll.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod control;
pub mod dedup;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod prompts;
pub mod recovery;
pub mod stats;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionConfig, ExtractionConfigBuilder};
pub use emitter::{EventPayload, EventStream, ProgressEmitter, ProgressEvent, Subscription};
pub use engine::{ExtractionEngine, ExtractionEngineBuilder};
pub use error::{ExtractionError, PageError, StoreError};
pub use model::{
    Cookbook, CookbookStatus, Ingredient, InstructionStep, JobStatus, NewRecipe,
    NonRecipeContent, Nutrition, PageOutcome, ProcessingJob, Recipe, RecipeCandidate,
    RecipeStatus,
};
pub use pipeline::classify::{PageClassifier, PageContext, VisionClassifier};
pub use pipeline::render::{PageSource, PdfRenderer, PdfiumRenderer};
pub use stats::{RunStats, StatsSnapshot};
pub use store::{
    DefaultStorage, ExtractionStore, ImageGenerator, MemoryStore, NoopNotifier, Notifier,
    PageProgress, StorageService,
};
