//! CLI binary for cookscan.
//!
//! A thin shim over the library crate: seeds an in-memory store with one
//! cookbook, runs the extraction engine over a local PDF (or URL), renders
//! live progress from the event stream, and prints the extracted recipes.

use anyhow::{Context, Result};
use clap::Parser;
use cookscan::{
    EventPayload, ExtractionConfig, ExtractionEngine, ExtractionStore, JobStatus, MemoryStore,
    PdfRenderer, PdfiumRenderer,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract recipes from a scanned cookbook (JSON to stdout)
  cookscan grandmas_cookbook.pdf --json > recipes.json

  # Human-readable summary with a specific model
  cookscan --model gpt-4.1 --provider openai cookbook.pdf

  # Stricter review gate: anything under 0.9 confidence needs review
  cookscan --confidence-threshold 0.9 cookbook.pdf

  # Page count and sanity check only (no API key needed)
  cookscan --inspect-only cookbook.pdf

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to an existing libpdfium

SETUP:
  1. Set API key:     export OPENAI_API_KEY=sk-...
  2. Extract:         cookscan cookbook.pdf --json > recipes.json
"#;

/// Extract structured recipes from scanned cookbook PDFs using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "cookscan",
    version,
    about = "Extract structured recipes from scanned cookbook PDFs using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Vision model ID (e.g. gpt-4.1-nano, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Candidates below this confidence are flagged needs_review.
    #[arg(long, env = "COOKSCAN_CONFIDENCE", default_value_t = 0.7)]
    confidence_threshold: f32,

    /// Ingredient-set similarity at which a title match counts as duplicate.
    #[arg(long, env = "COOKSCAN_DEDUP", default_value_t = 0.6)]
    dedup_threshold: f64,

    /// Recent pages of context for multi-page recipe stitching.
    #[arg(long, env = "COOKSCAN_CONTEXT_WINDOW", default_value_t = 2)]
    context_window: usize,

    /// Retries per page on classification failure.
    #[arg(long, env = "COOKSCAN_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-page classification timeout in seconds.
    #[arg(long, env = "COOKSCAN_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// HTTP download timeout in seconds (URL inputs).
    #[arg(long, env = "COOKSCAN_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Max model output tokens per page.
    #[arg(long, env = "COOKSCAN_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// Output extracted recipes as pretty-printed JSON.
    #[arg(long, env = "COOKSCAN_JSON")]
    json: bool,

    /// Disable the progress display.
    #[arg(long, env = "COOKSCAN_NO_PROGRESS")]
    no_progress: bool,

    /// Print the page count only, no extraction.
    #[arg(long)]
    inspect_only: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "COOKSCAN_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and results.
    #[arg(short, long, env = "COOKSCAN_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress display is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let renderer = PdfiumRenderer::new(config.max_rendered_pixels);
        let source = renderer
            .open(Path::new(&cli.input))
            .await
            .context("Failed to open PDF")?;
        println!("File:   {}", cli.input);
        println!("Pages:  {}", source.page_count());
        return Ok(());
    }

    // ── Seed the in-memory store ─────────────────────────────────────────
    let store = Arc::new(MemoryStore::new());
    let title = Path::new(&cli.input)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| cli.input.clone());
    let cookbook = store.insert_cookbook(1, &title, &cli.input, None);

    let engine = ExtractionEngine::builder(config)
        .store(store.clone() as Arc<dyn ExtractionStore>)
        .build()
        .context("Failed to build extraction engine")?;

    let job = engine
        .create_job(cookbook.id, 1)
        .await
        .context("Failed to create extraction job")?;

    // ── Live progress from the event stream ──────────────────────────────
    let _subscription = if show_progress {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} pages  ⏱ {elapsed_precise}  {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        bar.set_prefix("Extracting");
        bar.enable_steady_tick(Duration::from_millis(80));

        let bar_handle = bar.clone();
        Some(engine.emitter().subscribe(job.id, move |event| {
            match &event.payload {
                EventPayload::Progress {
                    current_page,
                    total_pages,
                    ..
                } => {
                    if bar_handle.length().unwrap_or(0) != u64::from(*total_pages) {
                        bar_handle.set_length(u64::from(*total_pages));
                    }
                    bar_handle.set_position(u64::from(*current_page));
                }
                EventPayload::RecipeFound {
                    title,
                    source_page,
                    needs_review,
                    ..
                } => {
                    let flag = if *needs_review {
                        cyan(" (needs review)")
                    } else {
                        String::new()
                    };
                    bar_handle.println(format!(
                        "  {} p.{:<4} {}{}",
                        green("✓"),
                        source_page,
                        bold(title),
                        flag
                    ));
                }
                EventPayload::PageSkipped { page, category } => {
                    bar_handle.println(format!("  {} p.{:<4} {}", dim("·"), page, dim(category)));
                }
                EventPayload::Error { page, message } => {
                    let loc = page.map(|p| format!("p.{p:<4} ")).unwrap_or_default();
                    bar_handle.println(format!("  {} {}{}", red("✗"), loc, red(message)));
                }
                EventPayload::CostUpdate { stats } => {
                    bar_handle.set_message(format!("~${:.3}", stats.estimated_cost_usd));
                }
                EventPayload::Completed { .. } | EventPayload::Paused { .. } => {
                    bar_handle.finish_and_clear();
                }
            }
        }))
    } else {
        None
    };

    // ── Run to completion ────────────────────────────────────────────────
    engine.spawn_extraction(job.id);
    engine.wait(job.id).await;

    let job = store
        .job(job.id)
        .await?
        .context("job row vanished")?;

    if job.status == JobStatus::Failed {
        anyhow::bail!(
            "extraction failed: {}",
            job.error_message.as_deref().unwrap_or("unknown error")
        );
    }

    let recipes = store.recipes_for_cookbook(cookbook.id).await?;

    if cli.json {
        let json = serde_json::to_string_pretty(&recipes).context("Failed to serialise recipes")?;
        println!("{json}");
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        for recipe in &recipes {
            writeln!(
                handle,
                "p.{:<4} {}  {}",
                recipe.source_page,
                bold(&recipe.title),
                dim(&format!(
                    "{} ingredients, {} steps",
                    recipe.ingredients.len(),
                    recipe.instructions.len()
                )),
            )?;
        }
    }

    if !cli.quiet {
        let total = job.total_pages.unwrap_or(0);
        eprintln!(
            "{} {} recipes from {} pages{}",
            if job.failed_pages == 0 {
                green("✔")
            } else {
                cyan("⚠")
            },
            bold(&job.recipes_extracted.to_string()),
            total,
            if job.failed_pages > 0 {
                red(&format!("  ({} pages failed)", job.failed_pages))
            } else {
                String::new()
            },
        );
    }

    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
fn build_config(cli: &Cli) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .confidence_threshold(cli.confidence_threshold)
        .dedup_threshold(cli.dedup_threshold)
        .context_window(cli.context_window)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .download_timeout_secs(cli.download_timeout)
        .max_tokens(cli.max_tokens);

    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }

    builder.build().context("Invalid configuration")
}
