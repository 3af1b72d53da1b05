//! Pipeline stages for page-by-page recipe extraction.
//!
//! Each submodule implements exactly one transformation step.
//! Keeping stages separate makes each independently testable and lets us
//! swap implementations (stub renderer and scripted classifier in tests)
//! without touching other stages.
//!
//! ## Data Flow
//!
//! ```text
//! render ──▶ encode ──▶ classify
//! (pdfium)   (base64)   (vision LLM + context window)
//! ```
//!
//! 1. [`render`]   — rasterise one page; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 2. [`encode`]   — PNG-encode and base64-wrap the `DynamicImage` for the
//!    multimodal API request body
//! 3. [`classify`] — drive the VLM call with retry/backoff/timeout and
//!    parse the JSON reply; the only stage with network I/O

pub mod classify;
pub mod encode;
pub mod render;
