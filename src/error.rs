//! Error types for the cookscan extraction engine.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ExtractionError`] — **Fatal for the job**: the run cannot proceed at
//!   all (source PDF unreadable, persistence write failed, AI provider
//!   unreachable from the very first page). The engine converts these into a
//!   terminal `failed` status so a stopped task never leaves a job stuck in
//!   `processing`.
//!
//! * [`PageError`] — **Non-fatal**: a single page failed (render glitch,
//!   classification call exhausted its retries) but the rest of the book is
//!   fine. The loop counts it, logs it, and advances to the next page.
//!
//! The separation lets the state machine keep its partial-failure guarantee:
//! a `completed` job with `failed_pages > 0` is a success with gaps, not an
//! error.

use crate::model::JobStatus;
use thiserror::Error;

/// Errors raised by persistence collaborators behind [`crate::store::ExtractionStore`].
///
/// The engine cannot safely continue without durable progress tracking, so
/// any of these aborts the run via [`ExtractionError::Store`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// A row the engine expected to exist was missing.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// The backing store rejected or lost a write.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// All job-level errors returned by the extraction engine.
///
/// Page-level failures use [`PageError`] and are recorded in the job's
/// `error_log` rather than propagated here.
#[derive(Debug, Error)]
pub enum ExtractionError {
    // ── Precondition errors ──────────────────────────────────────────────
    /// No job row with this id exists.
    #[error("processing job {id} not found")]
    JobNotFound { id: i64 },

    /// No cookbook row with this id exists.
    #[error("cookbook {id} not found")]
    CookbookNotFound { id: i64 },

    /// Another job for the same cookbook is already pending or running.
    #[error("cookbook {cookbook_id} already has an active job ({job_id}); wait for it or cancel it first")]
    ActiveJobExists { cookbook_id: i64, job_id: i64 },

    /// The requested operation is not valid for the job's current status.
    #[error("cannot {action} job {id} in status '{status}'")]
    InvalidStatus {
        id: i64,
        status: JobStatus,
        action: &'static str,
    },

    // ── Source errors ────────────────────────────────────────────────────
    /// The storage service could not produce the source bytes.
    #[error("failed to read source '{path}': {detail}")]
    SourceUnreadable { path: String, detail: String },

    /// The fetched bytes are not a PDF.
    #[error("source '{path}' is not a valid PDF (first bytes: {magic:?})")]
    NotAPdf { path: String, magic: [u8; 4] },

    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("source PDF is corrupt: {detail}")]
    CorruptPdf { detail: String },

    /// HTTP URL was syntactically valid but the download failed.
    #[error("failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    // ── AI errors ────────────────────────────────────────────────────────
    /// The configured vision provider is not initialised (missing API key etc.).
    #[error("vision provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The classifier timed out on the very first page of a fresh run —
    /// treated as a systemic outage rather than a page glitch.
    #[error("AI service unreachable on first page: {detail}")]
    AiUnavailable { detail: String },

    // ── Persistence ──────────────────────────────────────────────────────
    /// A durable write failed; progress can no longer be tracked safely.
    #[error(transparent)]
    Store(#[from] StoreError),

    // ── Config errors ────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// Recorded in the job's `error_log`, counted in `failed_pages`, and emitted
/// as an `error` progress event. The run continues with the next page.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// Page rasterisation failed (index out of range, corrupt page,
    /// unsupported PDF feature).
    #[error("page {page}: render failed: {detail}")]
    RenderFailed { page: u32, detail: String },

    /// Classification call failed after all retries.
    #[error("page {page}: classification failed after {retries} retries: {detail}")]
    ClassificationFailed {
        page: u32,
        retries: u32,
        detail: String,
    },

    /// Classification call timed out.
    #[error("page {page}: classification timed out after {secs}s")]
    Timeout { page: u32, secs: u64 },
}

impl PageError {
    /// 1-indexed page number the error occurred on.
    pub fn page(&self) -> u32 {
        match self {
            PageError::RenderFailed { page, .. }
            | PageError::ClassificationFailed { page, .. }
            | PageError::Timeout { page, .. } => *page,
        }
    }

    /// True for timeout-shaped failures (used by the first-page
    /// fail-fast rule).
    pub fn is_timeout(&self) -> bool {
        matches!(self, PageError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_job_display() {
        let e = ExtractionError::ActiveJobExists {
            cookbook_id: 7,
            job_id: 42,
        };
        let msg = e.to_string();
        assert!(msg.contains("cookbook 7"), "got: {msg}");
        assert!(msg.contains("42"), "got: {msg}");
    }

    #[test]
    fn invalid_status_display() {
        let e = ExtractionError::InvalidStatus {
            id: 3,
            status: JobStatus::Completed,
            action: "pause",
        };
        assert!(e.to_string().contains("pause"));
        assert!(e.to_string().contains("completed"));
    }

    #[test]
    fn page_error_page_accessor() {
        let e = PageError::RenderFailed {
            page: 12,
            detail: "corrupt xobject".into(),
        };
        assert_eq!(e.page(), 12);
        assert!(!e.is_timeout());

        let t = PageError::Timeout { page: 3, secs: 60 };
        assert_eq!(t.page(), 3);
        assert!(t.is_timeout());
    }

    #[test]
    fn store_error_converts() {
        let e: ExtractionError = StoreError::Backend("connection reset".into()).into();
        assert!(e.to_string().contains("connection reset"));
    }
}
