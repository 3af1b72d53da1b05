//! Configuration for the extraction engine.
//!
//! All engine behaviour is controlled through [`ExtractionConfig`], built via
//! its [`ExtractionConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share configs across jobs, log them, and diff two runs to
//! understand why their outputs differ.
//!
//! # Design choice: builder over constructor
//! A fifteen-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on
//! well-documented defaults for the rest.

use crate::error::ExtractionError;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::sync::Arc;

/// Configuration for cookbook extraction runs.
///
/// Built via [`ExtractionConfig::builder()`] or using
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use cookscan::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .model("gpt-4.1-nano")
///     .confidence_threshold(0.8)
///     .max_retries(2)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Maximum rendered image dimension (width or height) in pixels. Default: 2000.
    ///
    /// A cookbook scanned at high DPI can produce enormous rasters; this caps
    /// either dimension, scaling the other proportionally, keeping memory
    /// bounded and matching the image-size sweet spot for vision models
    /// (around 1,024–2,048 px).
    pub max_rendered_pixels: u32,

    /// Vision model identifier, e.g. "gpt-4.1-nano", "claude-sonnet-4-20250514".
    /// If None, uses the provider default.
    pub model: Option<String>,

    /// Provider name (e.g. "openai", "anthropic", "ollama").
    /// If None along with `provider`, auto-detected from the environment.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    /// Useful in tests or when the caller needs custom middleware.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for classification calls. Default: 0.1.
    ///
    /// Low temperature keeps the model faithful to what is printed on the
    /// page — exactly what you want for extraction.
    pub temperature: f32,

    /// Maximum tokens the model may generate per page. Default: 4096.
    ///
    /// A dense two-recipe page with full ingredient lists can exceed 2,000
    /// output tokens; setting this too low silently truncates the JSON.
    pub max_tokens: usize,

    /// Maximum retry attempts on a transient classification failure. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s.
    pub retry_backoff_ms: u64,

    /// Per-classification-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Download timeout for URL sources in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Candidates below this confidence are persisted as `needs_review`
    /// instead of `pending`. Range 0.0–1.0. Default: 0.7.
    pub confidence_threshold: f32,

    /// Jaccard similarity of ingredient-name sets at or above which a
    /// title-matching candidate is dropped as a duplicate. Default: 0.6.
    pub dedup_threshold: f64,

    /// How many recent pages of context the classifier sees for multi-page
    /// recipe stitching. Default: 2.
    pub context_window: usize,

    /// Estimated cost per classified page in USD, used for the running cost
    /// snapshot. Default: 0.002 (≈1,500 input + 800 output tokens at
    /// gpt-4.1-nano pricing, rounded up).
    pub cost_per_page_usd: f64,

    /// Emit a `cost_update` event every N processed pages. Default: 5.
    pub cost_update_every: u32,

    /// Concurrent image-generation calls in the recovery sweeper. Default: 4.
    pub image_concurrency: usize,

    /// Base URL of the review app, included in completion emails.
    pub app_url: String,

    /// Custom classifier system prompt. If None, uses the built-in default.
    pub system_prompt: Option<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_rendered_pixels: 2000,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4096,
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 60,
            download_timeout_secs: 120,
            confidence_threshold: 0.7,
            dedup_threshold: 0.6,
            context_window: 2,
            cost_per_page_usd: 0.002,
            cost_update_every: 5,
            image_concurrency: 4,
            app_url: "http://localhost:3000".to_string(),
            system_prompt: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("confidence_threshold", &self.confidence_threshold)
            .field("dedup_threshold", &self.dedup_threshold)
            .field("context_window", &self.context_window)
            .field("cost_per_page_usd", &self.cost_per_page_usd)
            .field("cost_update_every", &self.cost_update_every)
            .field("image_concurrency", &self.image_concurrency)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn confidence_threshold(mut self, t: f32) -> Self {
        self.config.confidence_threshold = t;
        self
    }

    pub fn dedup_threshold(mut self, t: f64) -> Self {
        self.config.dedup_threshold = t;
        self
    }

    pub fn context_window(mut self, pages: usize) -> Self {
        self.config.context_window = pages;
        self
    }

    pub fn cost_per_page_usd(mut self, usd: f64) -> Self {
        self.config.cost_per_page_usd = usd.max(0.0);
        self
    }

    pub fn cost_update_every(mut self, pages: u32) -> Self {
        self.config.cost_update_every = pages.max(1);
        self
    }

    pub fn image_concurrency(mut self, n: usize) -> Self {
        self.config.image_concurrency = n.max(1);
        self
    }

    pub fn app_url(mut self, url: impl Into<String>) -> Self {
        self.config.app_url = url.into();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ExtractionError> {
        let c = &self.config;
        if !(0.0..=1.0).contains(&c.confidence_threshold) {
            return Err(ExtractionError::InvalidConfig(format!(
                "confidence_threshold must be 0.0–1.0, got {}",
                c.confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&c.dedup_threshold) {
            return Err(ExtractionError::InvalidConfig(format!(
                "dedup_threshold must be 0.0–1.0, got {}",
                c.dedup_threshold
            )));
        }
        if c.cost_update_every == 0 {
            return Err(ExtractionError::InvalidConfig(
                "cost_update_every must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}
