//! Material processing: fetch source → extract text → persist result.
//!
//! Uses trait-based DI for the store and every extraction backend so the
//! processor stays testable with mock implementations.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::pipeline::extraction::async_job::{AsyncCloudJobOrchestrator, HttpAsyncOcrClient};
use crate::pipeline::extraction::cloud_vision::SyncCloudOcrClient;
use crate::pipeline::extraction::ocr::{default_backend, EmbeddedOcrEngine, ResourceLocator, ResourceSource};
use crate::pipeline::extraction::pdf::PdfTextExtractor;
use crate::pipeline::extraction::pdfium::PdfiumRasterizer;
use crate::pipeline::extraction::staging::{FsObjectStore, HttpObjectStore, ObjectStore};
use crate::pipeline::extraction::{ExtractionError, ExtractionOrchestrator};
use crate::pipeline::material::{MaterialError, MaterialStore};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Material store error: {0}")]
    Material(#[from] MaterialError),

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Summary returned after processing a material.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionSummary {
    pub material_id: String,
    pub method: String,
    pub confidence: f32,
    pub page_count: usize,
    pub text_length: usize,
    pub processing_time_ms: u64,
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

pub struct MaterialProcessor {
    store: Arc<dyn MaterialStore>,
    orchestrator: Arc<ExtractionOrchestrator>,
}

impl MaterialProcessor {
    pub fn new(store: Arc<dyn MaterialStore>, orchestrator: Arc<ExtractionOrchestrator>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    /// Extract one stored material and persist its text.
    ///
    /// Nothing is persisted when extraction fails.
    pub async fn process(
        &self,
        material_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExtractionSummary, ProcessingError> {
        let document = self.store.fetch_source_bytes(material_id).await?;

        tracing::info!(
            material_id,
            file = %document.file_name,
            mime = %document.mime_type,
            "Processing: starting extraction"
        );
        let result = self.orchestrator.extract(&document, cancel).await?;

        self.store.persist_extracted_text(material_id, &result).await?;

        tracing::info!(
            material_id,
            method = %result.method,
            confidence = result.overall_confidence,
            "Processing complete"
        );

        Ok(ExtractionSummary {
            material_id: material_id.to_string(),
            method: result.method.to_string(),
            confidence: result.overall_confidence,
            page_count: result.page_count,
            text_length: result.full_text.chars().count(),
            processing_time_ms: result.processing_time_ms,
        })
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build an `ExtractionOrchestrator` with production implementations.
///
/// - Structural: lopdf, always available
/// - Rasterizer: PDFium, when the library loads
/// - Local OCR: Tesseract (`ocr` feature) over the configured resource sources
/// - Sync cloud: when `STUDYSCAN_VISION_ENDPOINT` is set
/// - Async cloud job: when `STUDYSCAN_ASYNC_OCR_ENDPOINT` is set, staging
///   over HTTP if `STUDYSCAN_STAGING_ENDPOINT` is set, else a local directory
///
/// Missing optional backends are logged; their strategies escalate at runtime.
pub fn build_orchestrator(config: &AppConfig) -> Result<ExtractionOrchestrator, ExtractionError> {
    let mut orchestrator = ExtractionOrchestrator::new(config.extraction.clone())
        .with_structural(Arc::new(PdfTextExtractor));

    match PdfiumRasterizer::new() {
        Ok(rasterizer) => orchestrator = orchestrator.with_rasterizer(Arc::new(rasterizer)),
        Err(e) => tracing::warn!(error = %e, "PDFium unavailable, scanned PDFs cannot be rasterized"),
    }

    match default_backend() {
        Some(backend) => {
            let sources = ocr_sources(config);
            tracing::info!(sources = ?sources, "Local OCR enabled");
            let locator = ResourceLocator::new(sources, config.ocr_cache_dir());
            orchestrator =
                orchestrator.with_local_ocr(Arc::new(EmbeddedOcrEngine::new(locator, backend)));
        }
        None => tracing::info!("Built without the `ocr` feature, local OCR unavailable"),
    }

    if let Some(endpoint) = &config.vision_endpoint {
        let client = SyncCloudOcrClient::new(
            endpoint,
            config.vision_api_key.clone(),
            config.extraction.sync_payload_limit,
            config.request_timeout,
        )?;
        tracing::info!(endpoint = %endpoint, "Sync cloud OCR enabled");
        orchestrator = orchestrator.with_sync_cloud(Arc::new(client));
    }

    if let Some(endpoint) = &config.async_ocr_endpoint {
        let store: Arc<dyn ObjectStore> = match &config.staging_endpoint {
            Some(staging) => Arc::new(HttpObjectStore::new(
                staging,
                &config.staging_bucket,
                config.async_ocr_api_key.clone(),
                config.request_timeout,
            )?),
            None => Arc::new(FsObjectStore::new(config.effective_staging_dir())),
        };
        let provider = HttpAsyncOcrClient::new(
            endpoint,
            config.async_ocr_api_key.clone(),
            config.request_timeout,
        )?;
        tracing::info!(endpoint = %endpoint, "Async cloud OCR enabled");
        orchestrator = orchestrator.with_async_job(Arc::new(AsyncCloudJobOrchestrator::new(
            store,
            Arc::new(provider),
            config.extraction.async_job(),
        )));
    }

    Ok(orchestrator)
}

/// Configured sources in order, then `TESSDATA_PREFIX` and common system
/// tessdata directories as last-resort candidates.
fn ocr_sources(config: &AppConfig) -> Vec<ResourceSource> {
    let mut sources = config.effective_ocr_sources();

    if let Ok(prefix) = std::env::var("TESSDATA_PREFIX") {
        sources.push(ResourceSource::Directory(PathBuf::from(prefix)));
    }

    let system = [
        "/usr/share/tesseract-ocr/5/tessdata",
        "/usr/share/tesseract-ocr/4.00/tessdata",
        "/usr/share/tessdata",
        "/usr/local/share/tessdata",
        "/opt/homebrew/share/tessdata",
    ];
    for dir in system {
        let source = ResourceSource::Directory(PathBuf::from(dir));
        if !sources.contains(&source) {
            sources.push(source);
        }
    }

    sources
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractionSettings;
    use crate::pipeline::extraction::ocr::MockOcrEngine;
    use crate::pipeline::extraction::pdf::MockStructuralExtractor;
    use crate::pipeline::extraction::ErrorKind;
    use crate::pipeline::material::FsMaterialStore;
    use crate::pipeline::strategy::Strategy;

    fn processor(dir: &std::path::Path, orchestrator: ExtractionOrchestrator) -> (Arc<FsMaterialStore>, MaterialProcessor) {
        let store = Arc::new(FsMaterialStore::new(dir));
        let processor = MaterialProcessor::new(store.clone(), Arc::new(orchestrator));
        (store, processor)
    }

    #[tokio::test]
    async fn process_extracts_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ExtractionOrchestrator::new(ExtractionSettings::default())
            .with_local_ocr(Arc::new(MockOcrEngine::new("Krebs cycle summary", 87.0)));
        let (store, processor) = processor(dir.path(), orchestrator);

        store
            .save_source("chem-7", "board.jpg", None, &[0xFF, 0xD8, 0xFF, 0xE0, 0, 0])
            .await
            .unwrap();

        let summary = processor.process("chem-7", &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.material_id, "chem-7");
        assert_eq!(summary.method, "local_ocr");
        assert_eq!(summary.page_count, 1);
        assert_eq!(summary.text_length, "Krebs cycle summary".len());

        let stored = store.load_extraction("chem-7").await.unwrap().unwrap();
        assert_eq!(stored.extracted_text, "Krebs cycle summary");
    }

    #[tokio::test]
    async fn failed_extraction_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ExtractionOrchestrator::new(ExtractionSettings::default())
            .with_structural(Arc::new(MockStructuralExtractor::new(&["", ""])));
        let (store, processor) = processor(dir.path(), orchestrator);

        store
            .save_source("scan-1", "scan.pdf", Some("application/pdf"), b"%PDF-1.4")
            .await
            .unwrap();

        let err = processor.process("scan-1", &CancellationToken::new()).await.unwrap_err();
        match err {
            ProcessingError::Extraction(e) => assert_eq!(e.kind(), ErrorKind::ExtractionFailed),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(store.load_extraction("scan-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_material_is_a_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_, processor) = processor(dir.path(), ExtractionOrchestrator::new(ExtractionSettings::default()));
        let err = processor.process("missing", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Material(MaterialError::NotFound(_))));
    }

    #[test]
    fn factory_enables_cloud_backends_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            data_dir: dir.path().to_path_buf(),
            vision_endpoint: Some("http://127.0.0.1:9/vision".into()),
            async_ocr_endpoint: Some("http://127.0.0.1:9/jobs".into()),
            ..AppConfig::default()
        };

        let strategies = build_orchestrator(&config).unwrap().available_strategies();
        assert!(strategies.contains(&Strategy::Structural));
        assert!(strategies.contains(&Strategy::SyncCloudOcr));
        assert!(strategies.contains(&Strategy::AsyncCloudJob));
    }

    #[test]
    fn factory_without_endpoints_has_no_cloud_backends() {
        let config = AppConfig::default();
        let strategies = build_orchestrator(&config).unwrap().available_strategies();
        assert!(!strategies.contains(&Strategy::SyncCloudOcr));
        assert!(!strategies.contains(&Strategy::AsyncCloudJob));
    }

    #[test]
    fn ocr_sources_keep_configured_order_first() {
        let config = AppConfig {
            ocr_sources: vec![
                ResourceSource::Remote("https://primary.example.com".into()),
                ResourceSource::Remote("https://fallback.example.com".into()),
            ],
            ..AppConfig::default()
        };
        let sources = ocr_sources(&config);
        assert_eq!(sources[0], ResourceSource::Remote("https://primary.example.com".into()));
        assert_eq!(sources[1], ResourceSource::Remote("https://fallback.example.com".into()));
        assert!(sources.contains(&ResourceSource::Directory(PathBuf::from("/usr/share/tessdata"))));
    }
}
