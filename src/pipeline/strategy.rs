//! Extraction strategy selection.
//!
//! Maps (mime type, byte size) to the ordered list of strategies the
//! orchestrator walks, cheapest first. Pure: no I/O, no side effects.

use serde::Serialize;
use std::fmt;

use crate::config::ExtractionSettings;
use crate::pipeline::extraction::cloud_vision::encoded_payload_len;
use crate::pipeline::extraction::{ExtractionError, ExtractionMethod};
use crate::pipeline::import::{categorize, FileCategory};

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// One way of turning a document into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Natively encoded PDF text.
    Structural,
    /// Rasterise (PDFs only) and run the embedded OCR engine.
    LocalOcr,
    /// One synchronous cloud request per image or rendered page.
    SyncCloudOcr,
    /// Stage the whole document and run an asynchronous cloud job.
    AsyncCloudJob,
}

impl Strategy {
    /// Method reported when this strategy succeeds.
    pub fn method(&self) -> ExtractionMethod {
        match self {
            Self::Structural => ExtractionMethod::Structural,
            Self::LocalOcr => ExtractionMethod::LocalOcr,
            Self::SyncCloudOcr => ExtractionMethod::SyncCloudOcr,
            Self::AsyncCloudJob => ExtractionMethod::AsyncCloudJob,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structural => write!(f, "structural"),
            Self::LocalOcr => write!(f, "local_ocr"),
            Self::SyncCloudOcr => write!(f, "sync_cloud_ocr"),
            Self::AsyncCloudJob => write!(f, "async_cloud_job"),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Selection
// ═══════════════════════════════════════════════════════════

/// Ordered candidate strategies for a document.
///
/// - PDF: structural, local OCR, sync cloud (only if the whole document
///   fits the encoded payload ceiling), async cloud job.
/// - Image: sync cloud (if it fits), local OCR.
/// - Anything else: `UnsupportedType`.
pub fn select_strategies(
    mime_type: &str,
    size_bytes: usize,
    settings: &ExtractionSettings,
) -> Result<Vec<Strategy>, ExtractionError> {
    let fits_sync = fits_sync_payload(size_bytes, settings.sync_payload_limit);

    match categorize(mime_type) {
        FileCategory::Pdf => {
            let mut strategies = vec![Strategy::Structural, Strategy::LocalOcr];
            if fits_sync {
                strategies.push(Strategy::SyncCloudOcr);
            }
            strategies.push(Strategy::AsyncCloudJob);
            Ok(strategies)
        }
        FileCategory::Image => {
            let mut strategies = Vec::with_capacity(2);
            if fits_sync {
                strategies.push(Strategy::SyncCloudOcr);
            }
            strategies.push(Strategy::LocalOcr);
            Ok(strategies)
        }
        FileCategory::Unsupported => Err(ExtractionError::UnsupportedType(mime_type.to_string())),
    }
}

/// Whether `size_bytes` stays within `limit` once base64-encoded.
pub fn fits_sync_payload(size_bytes: usize, limit: usize) -> bool {
    encoded_payload_len(size_bytes) <= limit
}
