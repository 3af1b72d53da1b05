//! Page classification: decide recipe vs. non-recipe and extract candidates.
//!
//! This module converts a rasterised page image into a vision-LLM call and
//! parses the structured reply. It is intentionally thin — all prompt
//! engineering lives in [`crate::prompts`] so it can be changed without
//! touching retry or error-handling logic here.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors from LLM APIs are transient and frequent.
//! Exponential backoff (`retry_backoff_ms * 2^attempt`) avoids
//! thundering-herd: with 500 ms base and 3 retries the wait sequence is
//! 500 ms → 1 s → 2 s, totalling < 4 s of back-off per page. A reply that
//! fails to parse as the JSON contract counts as a failed attempt and is
//! retried the same way — low-temperature models occasionally wrap output
//! in fences or commentary.
//!
//! ## Multi-page stitching
//!
//! The engine threads a [`PageContext`] — a rolling window of recent page
//! summaries — into every call. The model is instructed to mark a page that
//! merely continues an earlier recipe with `continuation: true` and the
//! same title, which the engine folds away instead of persisting an
//! incomplete duplicate.

use crate::config::ExtractionConfig;
use crate::error::{ExtractionError, PageError};
use crate::model::{PageOutcome, RecipeCandidate};
use crate::pipeline::encode;
use crate::prompts::{recent_pages_context, CLASSIFIER_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use image::DynamicImage;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Rolling window of recent page summaries, owned by the extraction loop.
#[derive(Debug, Clone)]
pub struct PageContext {
    window: VecDeque<(u32, Vec<String>)>,
    capacity: usize,
}

impl PageContext {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record what a just-finished page held (1-indexed page number and
    /// the recipe titles found on it; empty for non-recipe or failed
    /// pages). Oldest entries fall off the window.
    pub fn push(&mut self, page: u32, titles: Vec<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back((page, titles));
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn summaries(&self) -> Vec<(u32, Vec<String>)> {
        self.window.iter().cloned().collect()
    }
}

/// Classifies one page image. Implemented by [`VisionClassifier`] in
/// production and by scripted fakes in tests.
#[async_trait]
pub trait PageClassifier: Send + Sync {
    /// `page_number` is 1-indexed (matches `Recipe::source_page`).
    async fn classify(
        &self,
        image: &DynamicImage,
        page_number: u32,
        context: &PageContext,
    ) -> Result<PageOutcome, PageError>;
}

/// Production classifier backed by an [`LLMProvider`] vision call.
pub struct VisionClassifier {
    provider: Arc<dyn LLMProvider>,
    config: ExtractionConfig,
}

impl VisionClassifier {
    pub fn new(provider: Arc<dyn LLMProvider>, config: ExtractionConfig) -> Self {
        Self { provider, config }
    }

    /// Resolve the provider from config, from most-specific to
    /// least-specific:
    ///
    /// 1. **Pre-built provider** (`config.provider`) — used as-is; useful in
    ///    tests or when the caller needs custom middleware.
    /// 2. **Named provider + model** (`config.provider_name`) — reads the
    ///    corresponding API key from the environment.
    /// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`)
    ///    — honoured before auto-detection so the model choice wins even
    ///    when multiple API keys are present.
    /// 4. **Full auto-detection** (`ProviderFactory::from_env`) — scans all
    ///    known API key variables and picks the first available provider,
    ///    preferring OpenAI when its key is set.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, ExtractionError> {
        let provider = resolve_provider(config)?;
        Ok(Self::new(provider, config.clone()))
    }
}

#[async_trait]
impl PageClassifier for VisionClassifier {
    async fn classify(
        &self,
        image: &DynamicImage,
        page_number: u32,
        context: &PageContext,
    ) -> Result<PageOutcome, PageError> {
        let image_data = encode::encode_page(image).map_err(|e| PageError::RenderFailed {
            page: page_number,
            detail: format!("image encoding failed: {e}"),
        })?;

        let system_prompt = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(CLASSIFIER_SYSTEM_PROMPT);

        let mut messages = vec![ChatMessage::system(system_prompt)];
        if !context.is_empty() {
            messages.push(ChatMessage::system(recent_pages_context(
                &context.summaries(),
            )));
        }
        // VLM APIs require at least one user turn; the image carries all
        // the actual content.
        messages.push(ChatMessage::user_with_images("", vec![image_data]));

        let options = CompletionOptions {
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_tokens),
            ..Default::default()
        };

        let mut last_err: Option<String> = None;
        let mut timed_out = false;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff = self.config.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    page = page_number,
                    attempt,
                    max = self.config.max_retries,
                    backoff_ms = backoff,
                    "retrying classification"
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            let call = self.provider.chat(&messages, Some(&options));
            match timeout(Duration::from_secs(self.config.api_timeout_secs), call).await {
                Err(_) => {
                    warn!(page = page_number, attempt = attempt + 1, "classification call timed out");
                    timed_out = true;
                    last_err = Some(format!(
                        "timed out after {}s",
                        self.config.api_timeout_secs
                    ));
                }
                Ok(Err(e)) => {
                    let detail = format!("{e}");
                    warn!(page = page_number, attempt = attempt + 1, error = %detail, "classification call failed");
                    timed_out = false;
                    last_err = Some(detail);
                }
                Ok(Ok(response)) => {
                    debug!(
                        page = page_number,
                        input_tokens = response.prompt_tokens,
                        output_tokens = response.completion_tokens,
                        "classification reply received"
                    );
                    match parse_outcome(&response.content) {
                        Ok(outcome) => return Ok(outcome),
                        Err(detail) => {
                            warn!(page = page_number, attempt = attempt + 1, error = %detail, "classification reply unparsable");
                            timed_out = false;
                            last_err = Some(detail);
                        }
                    }
                }
            }
        }

        // All retries exhausted.
        if timed_out {
            Err(PageError::Timeout {
                page: page_number,
                secs: self.config.api_timeout_secs,
            })
        } else {
            Err(PageError::ClassificationFailed {
                page: page_number,
                retries: self.config.max_retries,
                detail: last_err.unwrap_or_else(|| "unknown error".to_string()),
            })
        }
    }
}

// ── Reply parsing ────────────────────────────────────────────────────────

/// Wire shape of the model reply; tolerant of missing optionals.
#[derive(Debug, Deserialize)]
struct WireReply {
    kind: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    recipes: Vec<RecipeCandidate>,
}

/// Parse the model's reply into a [`PageOutcome`].
///
/// Accepts the raw JSON object, optionally wrapped in markdown fences
/// (models do this despite instructions). Anything else is an error string
/// the caller treats as a retryable attempt failure.
pub fn parse_outcome(content: &str) -> Result<PageOutcome, String> {
    let stripped = strip_fences(content);
    let reply: WireReply =
        serde_json::from_str(stripped).map_err(|e| format!("invalid JSON reply: {e}"))?;

    match reply.kind.as_str() {
        "non_recipe" => Ok(PageOutcome::NonRecipe {
            category: reply.category.unwrap_or_else(|| "other".to_string()),
        }),
        "recipe" => {
            if reply.recipes.is_empty() {
                // Kind says recipe but nothing extracted: treat as
                // non-recipe rather than inventing an empty candidate.
                Ok(PageOutcome::NonRecipe {
                    category: "other".to_string(),
                })
            } else {
                Ok(PageOutcome::Recipes {
                    candidates: reply.recipes,
                })
            }
        }
        other => Err(format!("unknown page kind '{other}'")),
    }
}

/// Strip a single ```/```json fence pair if the reply is wrapped in one.
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(inner) = rest.trim_start_matches('\n').strip_suffix("```") {
            return inner.trim();
        }
    }
    trimmed
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, ExtractionError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ExtractionError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

fn resolve_provider(config: &ExtractionConfig) -> Result<Arc<dyn LLMProvider>, ExtractionError> {
    // 1) User-provided provider takes priority
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    // 2) Provider name + model
    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
        return create_vision_provider(name, model);
    }

    // 3) Honour EDGEQUAKE_LLM_PROVIDER + EDGEQUAKE_MODEL when both set
    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    // Prefer OpenAI explicitly when an OpenAI API key is present so users
    // with multiple provider keys get a deterministic default.
    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
            return create_vision_provider("openai", model);
        }
    }

    // 4) Full auto-detection
    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ExtractionError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No vision provider could be auto-detected from environment.\n\
                 Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                 Error: {e}"
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_window_evicts_oldest() {
        let mut ctx = PageContext::new(2);
        ctx.push(1, vec!["Soup".into()]);
        ctx.push(2, vec![]);
        ctx.push(3, vec!["Stew".into()]);
        let pages: Vec<u32> = ctx.summaries().iter().map(|(p, _)| *p).collect();
        assert_eq!(pages, vec![2, 3]);
    }

    #[test]
    fn zero_capacity_context_stays_empty() {
        let mut ctx = PageContext::new(0);
        ctx.push(1, vec!["Soup".into()]);
        assert!(ctx.is_empty());
    }

    #[test]
    fn parse_non_recipe() {
        let outcome =
            parse_outcome(r#"{"kind": "non_recipe", "category": "table_of_contents"}"#).unwrap();
        match outcome {
            PageOutcome::NonRecipe { category } => assert_eq!(category, "table_of_contents"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn parse_recipe_with_fences() {
        let reply = "```json\n{\"kind\": \"recipe\", \"recipes\": [{\"title\": \"Pea Soup\", \"confidence\": 0.85}]}\n```";
        let outcome = parse_outcome(reply).unwrap();
        match outcome {
            PageOutcome::Recipes { candidates } => {
                assert_eq!(candidates.len(), 1);
                assert_eq!(candidates[0].title, "Pea Soup");
                assert!((candidates[0].confidence - 0.85).abs() < 1e-6);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn recipe_kind_without_candidates_degrades_to_non_recipe() {
        let outcome = parse_outcome(r#"{"kind": "recipe", "recipes": []}"#).unwrap();
        assert!(matches!(outcome, PageOutcome::NonRecipe { .. }));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_outcome("the page shows a soup").is_err());
        assert!(parse_outcome(r#"{"kind": "poem"}"#).is_err());
    }
}
