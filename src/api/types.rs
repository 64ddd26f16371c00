//! Shared state and wire types for the API layer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::pipeline::extraction::{ExtractionMethod, ExtractionOrchestrator, ExtractionResult};
use crate::pipeline::material::MaterialStore;
use crate::pipeline::processor::{ExtractionSummary, MaterialProcessor};
use crate::pipeline::strategy::Strategy;

// ═══════════════════════════════════════════════════════════
// API context
// ═══════════════════════════════════════════════════════════

/// Shared context for all API routes.
#[derive(Clone)]
pub struct ApiContext {
    pub config: Arc<AppConfig>,
    pub orchestrator: Arc<ExtractionOrchestrator>,
    pub processor: Arc<MaterialProcessor>,
}

impl ApiContext {
    pub fn new(
        config: Arc<AppConfig>,
        orchestrator: Arc<ExtractionOrchestrator>,
        store: Arc<dyn MaterialStore>,
    ) -> Self {
        let processor = Arc::new(MaterialProcessor::new(store, orchestrator.clone()));
        Self {
            config,
            orchestrator,
            processor,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Requests
// ═══════════════════════════════════════════════════════════

/// `POST /api/extract` body. Exactly one of `file_bytes_base64` and
/// `file_path` must be set.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractRequest {
    /// Raw base64 or a `data:<mime>;base64,` URL.
    pub file_bytes_base64: Option<String>,
    /// Relative to the configured upload root.
    pub file_path: Option<String>,
    pub file_type: Option<String>,
    pub file_name: String,
}

// ═══════════════════════════════════════════════════════════
// Responses
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractMetadata {
    pub page_count: usize,
    pub processing_time_ms: u64,
    pub file_name: String,
    pub character_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractResponse {
    pub success: bool,
    pub extracted_text: String,
    pub confidence: f32,
    pub method: ExtractionMethod,
    pub metadata: ExtractMetadata,
}

impl ExtractResponse {
    pub fn from_result(result: ExtractionResult, file_name: &str) -> Self {
        let character_count = result.full_text.chars().count();
        Self {
            success: true,
            confidence: result.overall_confidence,
            method: result.method,
            metadata: ExtractMetadata {
                page_count: result.page_count,
                processing_time_ms: result.processing_time_ms,
                file_name: file_name.to_string(),
                character_count,
            },
            extracted_text: result.full_text,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MaterialExtractResponse {
    pub success: bool,
    #[serde(flatten)]
    pub summary: ExtractionSummary,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub strategies: Vec<Strategy>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_request_accepts_camel_case_and_missing_fields() {
        let request: ExtractRequest =
            serde_json::from_str(r#"{"fileBytesBase64":"JVBERg==","fileName":"a.pdf"}"#).unwrap();
        assert_eq!(request.file_bytes_base64.as_deref(), Some("JVBERg=="));
        assert_eq!(request.file_name, "a.pdf");
        assert!(request.file_path.is_none());

        let empty: ExtractRequest = serde_json::from_str("{}").unwrap();
        assert!(empty.file_name.is_empty());
    }

    #[test]
    fn extract_response_serializes_wire_shape() {
        let result = ExtractionResult {
            full_text: "Mitosis".into(),
            overall_confidence: 95.0,
            method: ExtractionMethod::Structural,
            page_count: 2,
            processing_time_ms: 12,
        };
        let json = serde_json::to_value(ExtractResponse::from_result(result, "bio.pdf")).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["extractedText"], "Mitosis");
        assert_eq!(json["method"], "structural");
        assert_eq!(json["metadata"]["pageCount"], 2);
        assert_eq!(json["metadata"]["processingTimeMs"], 12);
        assert_eq!(json["metadata"]["fileName"], "bio.pdf");
        assert_eq!(json["metadata"]["characterCount"], 7);
    }
}
