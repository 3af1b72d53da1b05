//! Integration tests for the extraction job state machine.
//!
//! The suite drives the real engine with a stub renderer and a scripted
//! classifier, so no pdfium binary, network, or API key is needed. All
//! assertions go against the persisted `MemoryStore` state — the event
//! stream is a latency optimisation, never the source of truth.

use async_trait::async_trait;
use cookscan::{
    EventPayload, ExtractionConfig, ExtractionEngine, ExtractionError, ExtractionStore,
    Ingredient, InstructionStep, JobStatus, MemoryStore, Notifier, PageClassifier, PageContext,
    PageError, PageOutcome, PageSource, PdfRenderer, RecipeCandidate, RecipeStatus,
    StorageService,
};
use image::DynamicImage;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

// ── Test doubles ─────────────────────────────────────────────────────────────

/// Storage that always hands back a minimal PDF header.
struct StubStorage;

#[async_trait]
impl StorageService for StubStorage {
    async fn get_buffer(&self, _path_or_url: &str) -> Result<Vec<u8>, ExtractionError> {
        Ok(b"%PDF-1.4 stub".to_vec())
    }
}

/// Renderer that reports a fixed page count and renders blank rasters.
struct StubRenderer {
    pages: u32,
}

struct StubSource {
    pages: u32,
}

#[async_trait]
impl PdfRenderer for StubRenderer {
    async fn open(&self, _path: &Path) -> Result<Box<dyn PageSource>, ExtractionError> {
        Ok(Box::new(StubSource { pages: self.pages }))
    }
}

#[async_trait]
impl PageSource for StubSource {
    fn page_count(&self) -> u32 {
        self.pages
    }

    async fn render_page(&self, _index: u32) -> Result<DynamicImage, PageError> {
        Ok(DynamicImage::new_rgba8(4, 4))
    }
}

/// Rendezvous point used to park the classifier mid-run so a test can
/// signal pause/cancel at a known boundary.
struct Gate {
    reached: Notify,
    release: Notify,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            reached: Notify::new(),
            release: Notify::new(),
        })
    }

    async fn wait_reached(&self) {
        timeout(Duration::from_secs(5), self.reached.notified())
            .await
            .expect("classifier never reached the gate");
    }

    fn open(&self) {
        self.release.notify_one();
    }
}

#[derive(Clone)]
enum Script {
    Recipes(Vec<RecipeCandidate>),
    NonRecipe(String),
    Fail,
    Timeout,
    Panic,
    /// Park at the gate, then yield the candidates once released.
    Gated(Arc<Gate>, Vec<RecipeCandidate>),
}

/// Classifier driven page-by-page from a script. Pages without an entry
/// yield one unique recipe each.
struct ScriptedClassifier {
    scripts: Mutex<HashMap<u32, Script>>,
    calls: Mutex<HashMap<u32, u32>>,
}

impl ScriptedClassifier {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        })
    }

    fn set(&self, page: u32, script: Script) {
        self.scripts.lock().unwrap().insert(page, script);
    }

    fn calls_for(&self, page: u32) -> u32 {
        self.calls.lock().unwrap().get(&page).copied().unwrap_or(0)
    }
}

#[async_trait]
impl PageClassifier for ScriptedClassifier {
    async fn classify(
        &self,
        _image: &DynamicImage,
        page_number: u32,
        _context: &PageContext,
    ) -> Result<PageOutcome, PageError> {
        *self.calls.lock().unwrap().entry(page_number).or_insert(0) += 1;
        let script = self.scripts.lock().unwrap().get(&page_number).cloned();
        match script {
            None => Ok(PageOutcome::Recipes {
                candidates: vec![candidate(
                    &format!("Recipe {page_number}"),
                    &[&format!("ingredient {page_number}a"), &format!("ingredient {page_number}b")],
                    0.9,
                )],
            }),
            Some(Script::Recipes(candidates)) => Ok(PageOutcome::Recipes { candidates }),
            Some(Script::NonRecipe(category)) => Ok(PageOutcome::NonRecipe { category }),
            Some(Script::Fail) => Err(PageError::ClassificationFailed {
                page: page_number,
                retries: 0,
                detail: "scripted failure".into(),
            }),
            Some(Script::Timeout) => Err(PageError::Timeout {
                page: page_number,
                secs: 1,
            }),
            Some(Script::Panic) => panic!("scripted classifier panic"),
            Some(Script::Gated(gate, candidates)) => {
                gate.reached.notify_one();
                gate.release.notified().await;
                Ok(PageOutcome::Recipes { candidates })
            }
        }
    }
}

/// Notifier that records every completion email.
#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, String, u32, u32)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_extraction_complete_email(
        &self,
        to: &str,
        cookbook_name: &str,
        recipes_extracted: u32,
        total_pages: u32,
        _app_url: &str,
    ) -> Result<(), ExtractionError> {
        self.sent.lock().unwrap().push((
            to.to_string(),
            cookbook_name.to_string(),
            recipes_extracted,
            total_pages,
        ));
        Ok(())
    }
}

/// Image generator that counts calls and always succeeds.
#[derive(Default)]
struct CountingGenerator {
    calls: AtomicUsize,
}

#[async_trait]
impl cookscan::ImageGenerator for CountingGenerator {
    async fn generate(&self, title: &str, _summary: &str) -> Result<String, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("https://img.example/{}.png", title.to_lowercase().replace(' ', "-")))
    }
}

// ── Harness helpers ──────────────────────────────────────────────────────────

fn candidate(title: &str, ingredients: &[&str], confidence: f32) -> RecipeCandidate {
    RecipeCandidate {
        title: title.to_string(),
        ingredients: ingredients
            .iter()
            .map(|n| Ingredient {
                name: n.to_string(),
                quantity: None,
                unit: None,
            })
            .collect(),
        instructions: vec![InstructionStep {
            step: 1,
            text: format!("Make {title}."),
            minutes: None,
            temperature: None,
        }],
        nutrition: None,
        dietary_flags: vec![],
        confidence,
        continuation: false,
    }
}

fn test_config() -> ExtractionConfig {
    ExtractionConfig::builder()
        .max_retries(0)
        .retry_backoff_ms(1)
        .api_timeout_secs(1)
        .cost_update_every(3)
        .build()
        .unwrap()
}

struct Harness {
    store: Arc<MemoryStore>,
    classifier: Arc<ScriptedClassifier>,
    notifier: Arc<RecordingNotifier>,
    images: Arc<CountingGenerator>,
    engine: ExtractionEngine,
}

fn harness(pages: u32) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let classifier = ScriptedClassifier::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let images = Arc::new(CountingGenerator::default());
    let engine = ExtractionEngine::builder(test_config())
        .store(store.clone() as Arc<dyn ExtractionStore>)
        .storage(Arc::new(StubStorage))
        .renderer(Arc::new(StubRenderer { pages }))
        .classifier(classifier.clone() as Arc<dyn PageClassifier>)
        .notifier(notifier.clone() as Arc<dyn Notifier>)
        .image_generator(images.clone() as Arc<dyn cookscan::ImageGenerator>)
        .build()
        .expect("engine builds");
    Harness {
        store,
        classifier,
        notifier,
        images,
        engine,
    }
}

async fn run_to_end(h: &Harness, cookbook_id: i64) -> i64 {
    let job = h.engine.create_job(cookbook_id, 1).await.unwrap();
    h.engine.spawn_extraction(job.id);
    h.engine.wait(job.id).await;
    job.id
}

// ── Scenario: partial failure ────────────────────────────────────────────────

#[tokio::test]
async fn ten_pages_with_two_failures_completes_with_gaps() {
    let h = harness(10);
    let cookbook = h.store.insert_cookbook(1, "Soups", "/scan/soups.pdf", None);
    h.classifier.set(3, Script::Fail);
    h.classifier.set(7, Script::Fail);

    let job_id = run_to_end(&h, cookbook.id).await;

    let job = h.store.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.failed_pages, 2);
    assert_eq!(job.recipes_extracted, 8);
    assert_eq!(job.current_page, 10);
    assert_eq!(job.error_log.len(), 2);
    assert_eq!(job.error_log[0].page, Some(3));

    let cookbook = h.store.cookbook(cookbook.id).await.unwrap().unwrap();
    assert_eq!(cookbook.processed_pages, 10);
    assert_eq!(cookbook.total_recipes_found, 8);
    assert_eq!(cookbook.status.as_str(), "completed");

    // Durable run summary in the processing log.
    assert!(job
        .processing_log
        .iter()
        .any(|l| l.contains("run summary") && l.contains("8 recipes")));
}

#[tokio::test]
async fn progress_events_are_monotonic_and_bounded() {
    let h = harness(6);
    let cookbook = h.store.insert_cookbook(1, "Pies", "/scan/pies.pdf", None);
    let job = h.engine.create_job(cookbook.id, 1).await.unwrap();

    let seen: Arc<Mutex<Vec<(u32, u32)>>> = Arc::new(Mutex::new(Vec::new()));
    let kinds: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_handle = Arc::clone(&seen);
    let kinds_handle = Arc::clone(&kinds);
    let _sub = h.engine.emitter().subscribe(job.id, move |event| {
        kinds_handle.lock().unwrap().push(event.payload.kind());
        if let EventPayload::Progress {
            current_page,
            total_pages,
            ..
        } = event.payload
        {
            seen_handle.lock().unwrap().push((current_page, total_pages));
        }
    });

    h.engine.spawn_extraction(job.id);
    h.engine.wait(job.id).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 6);
    for window in seen.windows(2) {
        assert!(window[1].0 > window[0].0, "current_page must increase");
    }
    assert!(seen.iter().all(|(page, total)| page <= total));

    let kinds = kinds.lock().unwrap();
    assert_eq!(*kinds.last().unwrap(), "completed");
    assert_eq!(kinds.iter().filter(|k| **k == "recipe_found").count(), 6);
    // cost_update every 3 processed pages → pages 3 and 6.
    assert_eq!(kinds.iter().filter(|k| **k == "cost_update").count(), 2);
}

// ── Scenario: pause / resume ─────────────────────────────────────────────────

#[tokio::test]
async fn pause_then_resume_continues_from_same_page() {
    let h = harness(10);
    let cookbook = h.store.insert_cookbook(1, "Breads", "/scan/breads.pdf", None);
    let gate = Gate::new();
    h.classifier.set(
        5,
        Script::Gated(
            Arc::clone(&gate),
            vec![candidate("Recipe 5", &["ingredient 5a"], 0.9)],
        ),
    );

    let job = h.engine.create_job(cookbook.id, 1).await.unwrap();
    h.engine.spawn_extraction(job.id);

    // Park the loop inside page 5, request the pause, then let the page
    // finish: the in-flight page must complete before the pause lands.
    gate.wait_reached().await;
    h.engine.pause_job(job.id).await.unwrap();
    gate.open();
    h.engine.wait(job.id).await;

    let paused = h.store.job(job.id).await.unwrap().unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(paused.current_page, 5);
    assert_eq!(paused.recipes_extracted, 5);

    h.engine.resume_job(job.id).await.unwrap();
    h.engine.wait(job.id).await;

    let done = h.store.job(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.current_page, 10);
    assert_eq!(done.recipes_extracted, 10);

    let cookbook = h.store.cookbook(cookbook.id).await.unwrap().unwrap();
    assert_eq!(cookbook.processed_pages, 10);

    // No page was classified twice — resume is idempotent.
    for page in 1..=10 {
        assert_eq!(h.classifier.calls_for(page), 1, "page {page} reclassified");
    }
    // And no duplicate recipes were created.
    let recipes = h.store.recipes_for_cookbook(cookbook.id).await.unwrap();
    assert_eq!(recipes.len(), 10);
}

#[tokio::test]
async fn pause_requires_processing_status() {
    let h = harness(3);
    let cookbook = h.store.insert_cookbook(1, "Tarts", "/scan/tarts.pdf", None);
    let job = h.engine.create_job(cookbook.id, 1).await.unwrap();

    // Still pending: nothing to pause.
    let err = h.engine.pause_job(job.id).await.unwrap_err();
    assert!(matches!(err, ExtractionError::InvalidStatus { .. }));
}

// ── Scenario: cancel ─────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_retains_committed_recipes() {
    let h = harness(10);
    let cookbook = h.store.insert_cookbook(1, "Roasts", "/scan/roasts.pdf", Some("cook@example.com"));
    let gate = Gate::new();
    h.classifier.set(
        6,
        Script::Gated(
            Arc::clone(&gate),
            vec![candidate("Recipe 6", &["ingredient 6a"], 0.9)],
        ),
    );

    let job = h.engine.create_job(cookbook.id, 1).await.unwrap();
    h.engine.spawn_extraction(job.id);

    gate.wait_reached().await;
    h.engine.cancel_job(job.id).await.unwrap();
    gate.open();
    h.engine.wait(job.id).await;

    let job = h.store.job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.completed_at.is_some());

    let cookbook_row = h.store.cookbook(cookbook.id).await.unwrap().unwrap();
    assert_eq!(cookbook_row.status.as_str(), "failed");
    assert!(cookbook_row.error_message.is_some());

    // Everything committed before the cancellation point is retained.
    let recipes = h.store.recipes_for_cookbook(cookbook.id).await.unwrap();
    assert_eq!(recipes.len(), 6);

    // Cancellation never sends the completion email.
    assert!(h.notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancel_pending_job_without_task_finalises_directly() {
    let h = harness(3);
    let cookbook = h.store.insert_cookbook(1, "Drinks", "/scan/drinks.pdf", None);
    let job = h.engine.create_job(cookbook.id, 1).await.unwrap();

    h.engine.cancel_job(job.id).await.unwrap();

    let job = h.store.job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    let cookbook = h.store.cookbook(cookbook.id).await.unwrap().unwrap();
    assert_eq!(cookbook.status.as_str(), "failed");

    // Terminal jobs reject further transitions.
    let err = h.engine.cancel_job(job.id).await.unwrap_err();
    assert!(matches!(err, ExtractionError::InvalidStatus { .. }));
}

// ── Scenario: one active job per cookbook ────────────────────────────────────

#[tokio::test]
async fn second_job_for_same_cookbook_is_rejected() {
    let h = harness(3);
    let cookbook = h.store.insert_cookbook(1, "Salads", "/scan/salads.pdf", None);

    let first = h.engine.create_job(cookbook.id, 1).await.unwrap();
    let err = h.engine.create_job(cookbook.id, 1).await.unwrap_err();
    match err {
        ExtractionError::ActiveJobExists {
            cookbook_id,
            job_id,
        } => {
            assert_eq!(cookbook_id, cookbook.id);
            assert_eq!(job_id, first.id);
        }
        other => panic!("expected ActiveJobExists, got {other}"),
    }

    // No second row was created.
    let jobs = h.store.jobs_for_cookbook(cookbook.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
}

#[tokio::test]
async fn queue_position_is_computed_not_stored() {
    let h = harness(5);
    let first_book = h.store.insert_cookbook(1, "A", "/scan/a.pdf", None);
    let second_book = h.store.insert_cookbook(1, "B", "/scan/b.pdf", None);

    let gate = Gate::new();
    h.classifier.set(
        1,
        Script::Gated(
            Arc::clone(&gate),
            vec![candidate("Recipe 1", &["ingredient 1a"], 0.9)],
        ),
    );

    let running = h.engine.create_job(first_book.id, 1).await.unwrap();
    h.engine.spawn_extraction(running.id);
    gate.wait_reached().await;

    let queued = h.engine.create_job(second_book.id, 1).await.unwrap();

    assert_eq!(h.engine.queue_position(running.id).await.unwrap(), 0);
    assert_eq!(h.engine.queue_position(queued.id).await.unwrap(), 1);

    gate.open();
    h.engine.wait(running.id).await;
    assert_eq!(h.engine.queue_position(queued.id).await.unwrap(), 0);
}

// ── Scenario: re-extract ─────────────────────────────────────────────────────

#[tokio::test]
async fn re_extract_clears_recipes_before_new_job_writes() {
    let h = harness(8);
    let cookbook = h.store.insert_cookbook(1, "Curries", "/scan/curries.pdf", None);

    run_to_end(&h, cookbook.id).await;
    assert_eq!(
        h.store.recipes_for_cookbook(cookbook.id).await.unwrap().len(),
        8
    );

    // Gate the fresh run's first page so we can observe the reset window.
    let gate = Gate::new();
    h.classifier.set(
        1,
        Script::Gated(
            Arc::clone(&gate),
            vec![candidate("Recipe 1", &["ingredient 1a"], 0.9)],
        ),
    );

    let new_job = h.engine.re_extract(cookbook.id).await.unwrap();
    gate.wait_reached().await;

    // All 8 previous recipes deleted before the new job wrote anything.
    assert!(h
        .store
        .recipes_for_cookbook(cookbook.id)
        .await
        .unwrap()
        .is_empty());
    let jobs = h.store.jobs_for_cookbook(cookbook.id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs
        .iter()
        .filter(|j| j.id != new_job.id)
        .all(|j| j.status == JobStatus::Cancelled));

    gate.open();
    h.engine.wait(new_job.id).await;

    let job = h.store.job(new_job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        h.store.recipes_for_cookbook(cookbook.id).await.unwrap().len(),
        8
    );
}

#[tokio::test]
async fn re_extract_rejected_while_job_active() {
    let h = harness(3);
    let cookbook = h.store.insert_cookbook(1, "Stews", "/scan/stews.pdf", None);
    h.engine.create_job(cookbook.id, 1).await.unwrap();

    let err = h.engine.re_extract(cookbook.id).await.unwrap_err();
    assert!(matches!(err, ExtractionError::ActiveJobExists { .. }));
}

// ── Scenario: dedup and stitching ────────────────────────────────────────────

#[tokio::test]
async fn repeated_recipe_across_pages_is_deduplicated() {
    let h = harness(3);
    let cookbook = h.store.insert_cookbook(1, "Eggs", "/scan/eggs.pdf", None);
    h.classifier.set(
        1,
        Script::Recipes(vec![candidate(
            "Herb Omelette",
            &["eggs", "butter", "chives"],
            0.9,
        )]),
    );
    h.classifier.set(2, Script::NonRecipe("photo".into()));
    // Same dish re-extracted from its facing page, diacritics and all.
    h.classifier.set(
        3,
        Script::Recipes(vec![candidate(
            "Herb Omelette",
            &["eggs", "butter", "chives"],
            0.9,
        )]),
    );

    let job_id = run_to_end(&h, cookbook.id).await;

    let job = h.store.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.recipes_extracted, 1);

    let recipes = h.store.recipes_for_cookbook(cookbook.id).await.unwrap();
    assert_eq!(recipes.len(), 1);
    assert_eq!(recipes[0].source_page, 1);

    let non_recipe = h.store.non_recipe_for_cookbook(cookbook.id).await.unwrap();
    assert_eq!(non_recipe.len(), 1);
    assert_eq!(non_recipe[0].category, "photo");
    assert_eq!(non_recipe[0].page_number, 2);

    assert!(job
        .processing_log
        .iter()
        .any(|l| l.contains("duplicate(s) removed")));
}

#[tokio::test]
async fn continuation_page_is_merged_not_duplicated() {
    let h = harness(2);
    let cookbook = h.store.insert_cookbook(1, "Feasts", "/scan/feasts.pdf", None);
    h.classifier.set(
        1,
        Script::Recipes(vec![candidate(
            "Cassoulet",
            &["beans", "duck", "sausage"],
            0.9,
        )]),
    );
    let mut continuation = candidate("Cassoulet", &["breadcrumbs"], 0.9);
    continuation.continuation = true;
    h.classifier.set(2, Script::Recipes(vec![continuation]));

    let job_id = run_to_end(&h, cookbook.id).await;

    let job = h.store.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.recipes_extracted, 1);
    assert_eq!(
        h.store.recipes_for_cookbook(cookbook.id).await.unwrap().len(),
        1
    );
    assert!(job
        .processing_log
        .iter()
        .any(|l| l.contains("continuation(s) merged")));
}

#[tokio::test]
async fn low_confidence_candidates_need_review() {
    let h = harness(1);
    let cookbook = h.store.insert_cookbook(1, "Scrawl", "/scan/scrawl.pdf", None);
    h.classifier.set(
        1,
        Script::Recipes(vec![
            candidate("Clear Print Pie", &["apples"], 0.95),
            candidate("Smudged Stew", &["unknown"], 0.4),
        ]),
    );

    run_to_end(&h, cookbook.id).await;

    let recipes = h.store.recipes_for_cookbook(cookbook.id).await.unwrap();
    assert_eq!(recipes.len(), 2);
    let by_title: HashMap<_, _> = recipes.iter().map(|r| (r.title.as_str(), r.status)).collect();
    assert_eq!(by_title["Clear Print Pie"], RecipeStatus::Pending);
    assert_eq!(by_title["Smudged Stew"], RecipeStatus::NeedsReview);
}

// ── Scenario: failure handling ───────────────────────────────────────────────

#[tokio::test]
async fn first_page_timeout_fails_the_job_fast() {
    let h = harness(10);
    let cookbook = h.store.insert_cookbook(1, "Unreachable", "/scan/u.pdf", None);
    h.classifier.set(1, Script::Timeout);

    let job_id = run_to_end(&h, cookbook.id).await;

    let job = h.store.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .contains("AI service unreachable"));
    // No pages beyond the first were attempted.
    assert_eq!(h.classifier.calls_for(2), 0);

    let cookbook = h.store.cookbook(cookbook.id).await.unwrap().unwrap();
    assert_eq!(cookbook.status.as_str(), "failed");
}

#[tokio::test]
async fn later_timeout_is_only_a_page_failure() {
    let h = harness(3);
    let cookbook = h.store.insert_cookbook(1, "Blips", "/scan/blips.pdf", None);
    h.classifier.set(2, Script::Timeout);

    let job_id = run_to_end(&h, cookbook.id).await;

    let job = h.store.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.failed_pages, 1);
    assert_eq!(job.recipes_extracted, 2);
}

#[tokio::test]
async fn classifier_panic_still_writes_terminal_status() {
    let h = harness(3);
    let cookbook = h.store.insert_cookbook(1, "Bugs", "/scan/bugs.pdf", None);
    h.classifier.set(2, Script::Panic);

    let job_id = run_to_end(&h, cookbook.id).await;

    let job = h.store.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.as_deref().unwrap().contains("internal panic"));
    assert!(!h.engine.is_running(job_id));

    // Page 1's recipe was committed before the panic and survives.
    assert_eq!(
        h.store.recipes_for_cookbook(cookbook.id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn delete_failed_job_requires_failed_status() {
    let h = harness(2);
    let cookbook = h.store.insert_cookbook(1, "Mixed", "/scan/mixed.pdf", None);
    let job_id = run_to_end(&h, cookbook.id).await;

    let err = h.engine.delete_failed_job(job_id).await.unwrap_err();
    assert!(matches!(err, ExtractionError::InvalidStatus { .. }));
}

// ── Scenario: completion email ───────────────────────────────────────────────

#[tokio::test]
async fn completion_email_fires_once_on_natural_completion() {
    let h = harness(3);
    let cookbook =
        h.store
            .insert_cookbook(1, "Family Recipes", "/scan/family.pdf", Some("cook@example.com"));

    run_to_end(&h, cookbook.id).await;

    let sent = h.notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (to, name, recipes, pages) = &sent[0];
    assert_eq!(to, "cook@example.com");
    assert_eq!(name, "Family Recipes");
    assert_eq!(*recipes, 3);
    assert_eq!(*pages, 3);
}

// ── Scenario: image recovery sweeper ─────────────────────────────────────────

#[tokio::test]
async fn recover_missing_images_is_idempotent() {
    let h = harness(4);
    let cookbook = h.store.insert_cookbook(1, "Photogenic", "/scan/p.pdf", None);
    run_to_end(&h, cookbook.id).await;

    let queued = h.engine.recover_missing_images().await.unwrap();
    assert_eq!(queued, 4);
    assert_eq!(h.images.calls.load(Ordering::SeqCst), 4);

    // Every gap is now filled; a second sweep queues nothing.
    let queued = h.engine.recover_missing_images().await.unwrap();
    assert_eq!(queued, 0);
    assert_eq!(h.images.calls.load(Ordering::SeqCst), 4);

    for recipe in h.store.recipes_for_cookbook(cookbook.id).await.unwrap() {
        assert!(recipe.image_url.is_some());
    }
}
