use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::async_job::ExtractionJob;
use super::ExtractionError;

/// An uploaded document, owned by one extraction call.
///
/// Bytes are shared so blocking workers can hold them without copying.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub bytes: Arc<[u8]>,
    pub mime_type: String,
    pub file_name: String,
}

impl SourceDocument {
    pub fn new(bytes: impl Into<Arc<[u8]>>, mime_type: &str, file_name: &str) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.to_string(),
            file_name: file_name.to_string(),
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }
}

/// How text was extracted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Structural,
    LocalOcr,
    SyncCloudOcr,
    AsyncCloudJob,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structural => "structural",
            Self::LocalOcr => "local_ocr",
            Self::SyncCloudOcr => "sync_cloud_ocr",
            Self::AsyncCloudJob => "async_cloud_job",
        }
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text recovered from one page, with the raw block confidences (0-100)
/// the backend reported for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedPage {
    pub page_number: u32,
    pub text: String,
    pub block_confidences: Vec<f32>,
}

impl ExtractedPage {
    pub fn new(page_number: u32, text: impl Into<String>, block_confidences: Vec<f32>) -> Self {
        Self {
            page_number,
            text: text.into(),
            block_confidences,
        }
    }

    pub fn empty(page_number: u32) -> Self {
        Self::new(page_number, String::new(), Vec::new())
    }
}

/// Final output of one extraction call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub full_text: String,
    pub overall_confidence: f32,
    pub method: ExtractionMethod,
    pub page_count: usize,
    pub processing_time_ms: u64,
}

/// Raster image embedded in a PDF page (an `/XObject` with `/Subtype /Image`).
#[derive(Debug, Clone)]
pub struct EmbeddedImage {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub filter: Option<String>,
    /// Decodable image file bytes (JPEG or PNG). `None` when the stream
    /// could not be turned into an image the OCR engine accepts.
    pub data: Option<Vec<u8>>,
}

/// One page as seen by the structural parser.
#[derive(Debug, Clone)]
pub struct StructuralPage {
    pub page_number: u32,
    pub text: String,
    pub images: Vec<EmbeddedImage>,
}

/// One rendered PDF page, PNG-encoded.
#[derive(Debug, Clone)]
pub struct RasterImage {
    pub page_number: u32,
    pub width: u32,
    pub height: u32,
    pub png: Vec<u8>,
}

/// Raw result from an OCR engine for one image.
#[derive(Debug, Clone)]
pub struct OcrOutput {
    pub text: String,
    /// Engine-reported mean confidence, 0-100.
    pub confidence: f32,
    /// Per-word or per-block confidences, 0-100.
    pub block_confidences: Vec<f32>,
}

/// Output of a successful strategy, one variant per extraction method.
#[derive(Debug, Clone)]
pub enum MethodOutput {
    Structural {
        pages: Vec<ExtractedPage>,
        images_found: usize,
    },
    LocalOcr {
        pages: Vec<ExtractedPage>,
    },
    SyncCloudOcr {
        pages: Vec<ExtractedPage>,
    },
    AsyncCloudJob {
        job: ExtractionJob,
        pages: Vec<ExtractedPage>,
    },
}

impl MethodOutput {
    pub fn method(&self) -> ExtractionMethod {
        match self {
            Self::Structural { .. } => ExtractionMethod::Structural,
            Self::LocalOcr { .. } => ExtractionMethod::LocalOcr,
            Self::SyncCloudOcr { .. } => ExtractionMethod::SyncCloudOcr,
            Self::AsyncCloudJob { .. } => ExtractionMethod::AsyncCloudJob,
        }
    }

    pub fn pages(&self) -> &[ExtractedPage] {
        match self {
            Self::Structural { pages, .. }
            | Self::LocalOcr { pages }
            | Self::SyncCloudOcr { pages }
            | Self::AsyncCloudJob { pages, .. } => pages,
        }
    }

    pub fn pages_mut(&mut self) -> &mut Vec<ExtractedPage> {
        match self {
            Self::Structural { pages, .. }
            | Self::LocalOcr { pages }
            | Self::SyncCloudOcr { pages }
            | Self::AsyncCloudJob { pages, .. } => pages,
        }
    }

    pub fn into_pages(self) -> Vec<ExtractedPage> {
        match self {
            Self::Structural { pages, .. }
            | Self::LocalOcr { pages }
            | Self::SyncCloudOcr { pages }
            | Self::AsyncCloudJob { pages, .. } => pages,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Component seams
// ═══════════════════════════════════════════════════════════

/// Reads natively encoded text and embedded images from a PDF.
pub trait StructuralTextExtractor: Send + Sync {
    fn page_count(&self, pdf_bytes: &[u8]) -> Result<usize, ExtractionError>;

    /// Pages in ascending order. A page without text yields an empty string.
    fn extract_pages(&self, pdf_bytes: &[u8]) -> Result<Vec<StructuralPage>, ExtractionError>;
}

/// Renders PDF pages to raster images for OCR.
pub trait PdfRasterizer: Send + Sync {
    fn page_count(&self, pdf_bytes: &[u8]) -> Result<usize, ExtractionError>;

    /// `page_index` is 0-based.
    fn render_page(
        &self,
        pdf_bytes: &[u8],
        page_index: usize,
        scale: f32,
    ) -> Result<RasterImage, ExtractionError>;
}

/// In-process OCR over a single raster image.
pub trait OcrEngine: Send + Sync {
    fn ocr_image(
        &self,
        image_bytes: &[u8],
        lang: &str,
        progress: &dyn ProgressSink,
    ) -> Result<OcrOutput, ExtractionError>;
}

/// Receives fractional completion (0.0-1.0) from long-running OCR work.
pub trait ProgressSink: Send + Sync {
    fn report(&self, stage: &str, fraction: f32);
}

impl<F> ProgressSink for F
where
    F: Fn(&str, f32) + Send + Sync,
{
    fn report(&self, stage: &str, fraction: f32) {
        self(stage, fraction)
    }
}

/// Progress sink that discards everything.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _stage: &str, _fraction: f32) {}
}
