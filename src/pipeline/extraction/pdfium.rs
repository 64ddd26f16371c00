//! Page rasterization through PDFium.
//!
//! Scanned course packs carry no text runs, so the OCR strategies need each
//! page as an image. PDFium's document handle is `!Send`, so the rasterizer
//! only remembers *where* the library lives and binds it per call.

use std::io::Cursor;

use image::ImageOutputFormat;
use pdfium_render::prelude::*;
use tracing::{debug, warn};

use super::types::{PdfRasterizer, RasterImage};
use super::ExtractionError;

/// Longest edge of a rendered page, in pixels.
const MAX_EDGE_PX: u32 = 4096;

/// Explicit library path override.
const LIBRARY_PATH_VAR: &str = "PDFIUM_DYNAMIC_LIB_PATH";

/// Where a loadable PDFium library was found.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LibraryLocation {
    /// Full path to the shared library, from the environment.
    Explicit(String),
    /// Directory shipped next to the executable.
    Bundled(String),
    /// Platform loader search path.
    System,
}

impl LibraryLocation {
    fn bind(&self) -> Result<Box<dyn PdfiumLibraryBindings>, PdfiumError> {
        match self {
            Self::Explicit(path) => Pdfium::bind_to_library(path),
            Self::Bundled(dir) => {
                let lib_path = Pdfium::pdfium_platform_library_name_at_path(dir.as_str());
                Pdfium::bind_to_library(&lib_path)
            }
            Self::System => Pdfium::bind_to_system_library(),
        }
    }
}

/// Candidates in lookup order. An explicit path disables the fallbacks.
fn candidate_locations() -> Vec<LibraryLocation> {
    if let Ok(path) = std::env::var(LIBRARY_PATH_VAR) {
        return vec![LibraryLocation::Explicit(path)];
    }

    let mut candidates = Vec::new();
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
    {
        for dir in [exe_dir.clone(), exe_dir.join("pdfium"), exe_dir.join("lib")] {
            candidates.push(LibraryLocation::Bundled(dir.to_string_lossy().into_owned()));
        }
    }
    candidates.push(LibraryLocation::System);
    candidates
}

/// `PdfRasterizer` backed by a PDFium shared library.
pub struct PdfiumRasterizer {
    library: LibraryLocation,
}

impl PdfiumRasterizer {
    /// Probe the candidate locations and keep the first that binds.
    pub fn new() -> Result<Self, ExtractionError> {
        let mut failures = Vec::new();
        for location in candidate_locations() {
            match location.bind() {
                Ok(_) => {
                    debug!(location = ?location, "PDFium library bound");
                    return Ok(Self { library: location });
                }
                Err(e) => failures.push(format!("{location:?}: {e}")),
            }
        }
        Err(ExtractionError::ResourceUnavailable(format!(
            "PDFium library not found (set {LIBRARY_PATH_VAR}): {}",
            failures.join("; ")
        )))
    }

    fn open(&self) -> Result<Pdfium, ExtractionError> {
        self.library.bind().map(Pdfium::new).map_err(|e| {
            ExtractionError::ResourceUnavailable(format!("PDFium bind failed: {e}"))
        })
    }
}

fn load_error(e: PdfiumError) -> ExtractionError {
    match e {
        PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::PasswordError) => {
            ExtractionError::Input("PDF is password-protected".into())
        }
        other => ExtractionError::PdfParsing(format!("PDFium could not open the document: {other}")),
    }
}

/// Pixel size for a page of `width_pt` x `height_pt` points at `scale`,
/// shrunk uniformly so the longer edge fits `MAX_EDGE_PX`.
fn target_size(width_pt: f32, height_pt: f32, scale: f32) -> (u32, u32) {
    let width = (width_pt * scale).max(1.0);
    let height = (height_pt * scale).max(1.0);
    let long_edge = width.max(height);
    if long_edge <= MAX_EDGE_PX as f32 {
        return (width as u32, height as u32);
    }
    let fit = |v: f32| ((v / long_edge * MAX_EDGE_PX as f32).round() as u32).clamp(1, MAX_EDGE_PX);
    (fit(width), fit(height))
}

impl PdfRasterizer for PdfiumRasterizer {
    fn page_count(&self, pdf_bytes: &[u8]) -> Result<usize, ExtractionError> {
        let pdfium = self.open()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf_bytes, None)
            .map_err(load_error)?;
        Ok(document.pages().len() as usize)
    }

    fn render_page(
        &self,
        pdf_bytes: &[u8],
        page_index: usize,
        scale: f32,
    ) -> Result<RasterImage, ExtractionError> {
        let render_error = |reason: String| ExtractionError::PdfRendering {
            page: page_index + 1,
            reason,
        };

        if !scale.is_finite() || scale <= 0.0 {
            return Err(render_error(format!("scale must be positive, got {scale}")));
        }
        let index = u16::try_from(page_index)
            .map_err(|_| render_error(format!("page index {page_index} is too large")))?;

        let pdfium = self.open()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf_bytes, None)
            .map_err(load_error)?;
        let page = document.pages().get(index).map_err(|e| render_error(e.to_string()))?;

        let (width_pt, height_pt) = (page.width().value, page.height().value);
        let (width, height) = target_size(width_pt, height_pt, scale);
        if width < (width_pt * scale) as u32 || height < (height_pt * scale) as u32 {
            warn!(
                page = page_index + 1,
                width, height, "Oversized page shrunk to {MAX_EDGE_PX}px"
            );
        }

        let config = PdfRenderConfig::new()
            .set_target_width(width as i32)
            .set_maximum_height(height as i32);
        let bitmap = page
            .render_with_config(&config)
            .map_err(|e| render_error(e.to_string()))?;

        let mut png = Cursor::new(Vec::new());
        bitmap
            .as_image()
            .write_to(&mut png, ImageOutputFormat::Png)
            .map_err(|e| ExtractionError::ImageProcessing(format!("PNG encode failed: {e}")))?;
        let png = png.into_inner();

        debug!(page = page_index + 1, width, height, bytes = png.len(), "Page rasterized");

        Ok(RasterImage {
            page_number: page_index as u32 + 1,
            width,
            height,
            png,
        })
    }
}

// ── Mock ─────────────────────────────────────────────────

/// Rasterizer with a fixed page count that renders blank pages.
/// Indices in `failing_pages` (0-based) fail like a corrupt page would.
pub struct MockPdfRasterizer {
    page_count: usize,
    failing_pages: Vec<usize>,
}

impl MockPdfRasterizer {
    pub fn new(page_count: usize) -> Self {
        Self {
            page_count,
            failing_pages: Vec::new(),
        }
    }

    pub fn with_failing_pages(mut self, pages: &[usize]) -> Self {
        self.failing_pages = pages.to_vec();
        self
    }
}

impl PdfRasterizer for MockPdfRasterizer {
    fn page_count(&self, _pdf_bytes: &[u8]) -> Result<usize, ExtractionError> {
        Ok(self.page_count)
    }

    fn render_page(
        &self,
        _pdf_bytes: &[u8],
        page_index: usize,
        _scale: f32,
    ) -> Result<RasterImage, ExtractionError> {
        if page_index >= self.page_count || self.failing_pages.contains(&page_index) {
            return Err(ExtractionError::PdfRendering {
                page: page_index + 1,
                reason: "mock page unavailable".into(),
            });
        }
        Ok(RasterImage {
            page_number: page_index as u32 + 1,
            width: 1,
            height: 1,
            png: blank_page_png(),
        })
    }
}

/// A 1x1 white PNG.
pub fn blank_page_png() -> Vec<u8> {
    let pixel = image::GrayImage::from_pixel(1, 1, image::Luma([255u8]));
    let mut out = Cursor::new(Vec::new());
    match image::DynamicImage::ImageLuma8(pixel).write_to(&mut out, ImageOutputFormat::Png) {
        Ok(()) => out.into_inner(),
        Err(_) => Vec::new(),
    }
}
