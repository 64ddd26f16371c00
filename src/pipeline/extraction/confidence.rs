//! Confidence aggregation across heterogeneous OCR backends.
//!
//! Every backend reports block- or word-level confidences on its own scale;
//! callers normalise to 0-100 before handing them here.

use super::types::{ExtractedPage, ExtractionMethod};

/// Method-specific floors and fixed block scores (0-100).
pub mod thresholds {
    /// Synchronous cloud OCR rarely reports below this on a successful detection.
    pub const SYNC_CLOUD_FLOOR: f32 = 75.0;

    /// Asynchronous cloud OCR jobs rarely report below this on success.
    pub const ASYNC_CLOUD_FLOOR: f32 = 80.0;

    /// Block score for a page with natively encoded text.
    pub const STRUCTURAL_PAGE: f32 = 95.0;

    pub const MAX: f32 = 100.0;
}

/// Floor applied to a non-empty aggregate, if the method has one.
pub fn floor_for(method: ExtractionMethod) -> Option<f32> {
    match method {
        ExtractionMethod::SyncCloudOcr => Some(thresholds::SYNC_CLOUD_FLOOR),
        ExtractionMethod::AsyncCloudJob => Some(thresholds::ASYNC_CLOUD_FLOOR),
        ExtractionMethod::Structural | ExtractionMethod::LocalOcr => None,
    }
}

/// Reduce block confidences to one 0-100 score.
///
/// Arithmetic mean, then the method floor. Only finite, positive values are
/// confidence-bearing: providers use 0 or -1 for "no score". No bearing blocks
/// means 0, and the floor is never applied to an empty set.
pub fn aggregate(method: ExtractionMethod, blocks: &[f32]) -> f32 {
    let bearing: Vec<f32> = blocks
        .iter()
        .copied()
        .filter(|c| c.is_finite() && *c > 0.0)
        .map(|c| c.min(thresholds::MAX))
        .collect();

    if bearing.is_empty() {
        return 0.0;
    }

    let mean = bearing.iter().sum::<f32>() / bearing.len() as f32;

    match floor_for(method) {
        Some(floor) => mean.max(floor),
        None => mean,
    }
}

/// Aggregate over every page's blocks.
pub fn aggregate_pages(method: ExtractionMethod, pages: &[ExtractedPage]) -> f32 {
    let blocks: Vec<f32> = pages
        .iter()
        .flat_map(|p| p.block_confidences.iter().copied())
        .collect();
    aggregate(method, &blocks)
}
