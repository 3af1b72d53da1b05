//! PDF rasterisation: render single pages to `DynamicImage` via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async
//! contexts. `tokio::task::spawn_blocking` moves the work onto a dedicated
//! thread-pool thread designed for blocking operations, preventing the
//! Tokio worker threads from stalling during CPU-heavy rendering.
//!
//! ## Why one page at a time?
//!
//! A cookbook can run to 1,000 pages and half a gigabyte. Rasterising the
//! whole document up front would hold every bitmap in memory at once; the
//! extraction loop instead asks for exactly the page it is about to
//! classify, so peak memory stays at one page regardless of document size.
//!
//! ## Why cap pixels, not DPI?
//!
//! Page sizes vary wildly across cookbooks. `max_rendered_pixels` caps the
//! longest edge regardless of physical size, keeping memory bounded and
//! matching the image-size sweet spot for vision models (around
//! 1,024–2,048 px).

use crate::error::{ExtractionError, PageError};
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tokio::task::spawn_blocking;
use tracing::{debug, info};

/// Opens a source document for page-by-page rendering.
#[async_trait]
pub trait PdfRenderer: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Box<dyn PageSource>, ExtractionError>;
}

/// One open document. Deterministic: the same index always yields the same
/// raster at a fixed configuration.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Total pages in the document.
    fn page_count(&self) -> u32;

    /// Render one page (0-indexed). Failures are per-page: the job state
    /// machine records them and moves on.
    async fn render_page(&self, index: u32) -> Result<DynamicImage, PageError>;
}

/// Production renderer backed by pdfium.
pub struct PdfiumRenderer {
    max_rendered_pixels: u32,
}

impl PdfiumRenderer {
    pub fn new(max_rendered_pixels: u32) -> Self {
        Self {
            max_rendered_pixels,
        }
    }
}

#[async_trait]
impl PdfRenderer for PdfiumRenderer {
    async fn open(&self, path: &Path) -> Result<Box<dyn PageSource>, ExtractionError> {
        let path = path.to_path_buf();
        let max_pixels = self.max_rendered_pixels;

        let probed = spawn_blocking(move || probe_page_count(&path).map(|n| (path, n)))
            .await
            .map_err(|e| ExtractionError::Internal(format!("probe task panicked: {e}")))?;

        let (path, page_count) = probed?;
        info!(pages = page_count, "opened source PDF");

        Ok(Box::new(PdfiumPageSource {
            path,
            page_count,
            max_pixels,
        }))
    }
}

struct PdfiumPageSource {
    path: PathBuf,
    page_count: u32,
    max_pixels: u32,
}

#[async_trait]
impl PageSource for PdfiumPageSource {
    fn page_count(&self) -> u32 {
        self.page_count
    }

    async fn render_page(&self, index: u32) -> Result<DynamicImage, PageError> {
        let path = self.path.clone();
        let max_pixels = self.max_pixels;
        let total = self.page_count;

        spawn_blocking(move || render_page_blocking(&path, index, total, max_pixels))
            .await
            .map_err(|e| PageError::RenderFailed {
                page: index + 1,
                detail: format!("render task panicked: {e}"),
            })?
    }
}

/// Blocking page-count probe; also validates the document opens at all.
fn probe_page_count(path: &Path) -> Result<u32, ExtractionError> {
    let pdfium = Pdfium::default();
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| ExtractionError::CorruptPdf {
            detail: format!("{e:?}"),
        })?;
    Ok(document.pages().len() as u32)
}

/// Blocking implementation of single-page rendering.
///
/// The document is re-opened per call: pdfium documents are tied to the
/// thread-local library instance and cannot be held across `spawn_blocking`
/// invocations. Opening is cheap relative to rasterising plus the
/// classification round-trip that follows every render.
fn render_page_blocking(
    path: &Path,
    index: u32,
    total: u32,
    max_pixels: u32,
) -> Result<DynamicImage, PageError> {
    if index >= total {
        return Err(PageError::RenderFailed {
            page: index + 1,
            detail: format!("page index out of range (document has {total} pages)"),
        });
    }

    let pdfium = Pdfium::default();
    let document =
        pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| PageError::RenderFailed {
                page: index + 1,
                detail: format!("{e:?}"),
            })?;

    let page = document
        .pages()
        .get(index as u16)
        .map_err(|e| PageError::RenderFailed {
            page: index + 1,
            detail: format!("{e:?}"),
        })?;

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let bitmap = page
        .render_with_config(&render_config)
        .map_err(|e| PageError::RenderFailed {
            page: index + 1,
            detail: format!("{e:?}"),
        })?;

    let image = bitmap.as_image();
    debug!(
        page = index + 1,
        width = image.width(),
        height = image.height(),
        "rendered page"
    );

    Ok(image)
}
