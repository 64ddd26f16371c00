use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use super::async_job::{or_cancel, AsyncCloudJobOrchestrator};
use super::cloud_vision::SyncCloudOcr;
use super::confidence::{aggregate_pages, thresholds};
use super::sanitize::{meaningful_chars, sanitize_extracted_text};
use super::types::{
    ExtractedPage, ExtractionMethod, ExtractionResult, MethodOutput, NoopProgress, OcrEngine,
    OcrOutput, PdfRasterizer, ProgressSink, RasterImage, SourceDocument, StructuralPage,
    StructuralTextExtractor,
};
use super::ExtractionError;
use crate::config::ExtractionSettings;
use crate::pipeline::import::{categorize, FileCategory};
use crate::pipeline::strategy::{select_strategies, Strategy};

/// Separator between pages in `ExtractionResult::full_text`.
pub const PAGE_BREAK: &str = "\n\n--- Page Break ---\n\n";

/// Drives a document through the strategy ladder.
///
/// Every backend is optional and injected; a strategy whose backend is not
/// configured fails with `ResourceUnavailable` and the next one is tried.
/// Holds no mutable state, so one instance serves concurrent requests.
pub struct ExtractionOrchestrator {
    settings: ExtractionSettings,
    structural: Option<Arc<dyn StructuralTextExtractor>>,
    rasterizer: Option<Arc<dyn PdfRasterizer>>,
    local_ocr: Option<Arc<dyn OcrEngine>>,
    sync_cloud: Option<Arc<dyn SyncCloudOcr>>,
    async_job: Option<Arc<AsyncCloudJobOrchestrator>>,
    progress: Arc<dyn ProgressSink>,
}

impl ExtractionOrchestrator {
    pub fn new(settings: ExtractionSettings) -> Self {
        Self {
            settings,
            structural: None,
            rasterizer: None,
            local_ocr: None,
            sync_cloud: None,
            async_job: None,
            progress: Arc::new(NoopProgress),
        }
    }

    pub fn with_structural(mut self, extractor: Arc<dyn StructuralTextExtractor>) -> Self {
        self.structural = Some(extractor);
        self
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn PdfRasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    pub fn with_local_ocr(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.local_ocr = Some(engine);
        self
    }

    pub fn with_sync_cloud(mut self, client: Arc<dyn SyncCloudOcr>) -> Self {
        self.sync_cloud = Some(client);
        self
    }

    pub fn with_async_job(mut self, orchestrator: Arc<AsyncCloudJobOrchestrator>) -> Self {
        self.async_job = Some(orchestrator);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn settings(&self) -> &ExtractionSettings {
        &self.settings
    }

    /// Strategies whose backends are configured, in ladder order.
    pub fn available_strategies(&self) -> Vec<Strategy> {
        let mut available = Vec::new();
        if self.structural.is_some() {
            available.push(Strategy::Structural);
        }
        if self.local_ocr.is_some() {
            available.push(Strategy::LocalOcr);
        }
        if self.sync_cloud.is_some() {
            available.push(Strategy::SyncCloudOcr);
        }
        if self.async_job.is_some() {
            available.push(Strategy::AsyncCloudJob);
        }
        available
    }

    /// Extract text, escalating through strategies on recoverable failures.
    ///
    /// `Input`, `UnsupportedType`, `TimedOut` and `Cancelled` surface as-is.
    /// When every strategy fails recoverably the last error is returned
    /// wrapped in `ExtractionFailed`.
    pub async fn extract(
        &self,
        document: &SourceDocument,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult, ExtractionError> {
        let started = Instant::now();
        validate(document)?;

        let strategies =
            select_strategies(&document.mime_type, document.size_bytes(), &self.settings)?;

        tracing::info!(
            document = %document.file_name,
            mime = %document.mime_type,
            size = document.size_bytes(),
            strategies = ?strategies,
            "Starting text extraction"
        );

        let mut last_error = None;

        for strategy in strategies {
            if cancel.is_cancelled() {
                return Err(ExtractionError::Cancelled);
            }
            tracing::info!(document = %document.file_name, strategy = %strategy, "Trying strategy");

            let attempt = self
                .run_strategy(strategy, document, cancel)
                .await
                .map(sanitize_output)
                .and_then(|output| self.ensure_useful(output));

            match attempt {
                Ok(output) => {
                    let method = output.method();
                    if let MethodOutput::Structural { images_found, .. } = &output {
                        tracing::debug!(images_found, "Structural output accepted");
                    }
                    let result = assemble_result(method, output.pages(), started);
                    tracing::info!(
                        document = %document.file_name,
                        method = %result.method,
                        pages = result.page_count,
                        confidence = result.overall_confidence,
                        text_length = result.full_text.len(),
                        elapsed_ms = result.processing_time_ms,
                        "Text extraction complete"
                    );
                    return Ok(result);
                }
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(
                        document = %document.file_name,
                        strategy = %strategy,
                        kind = %e.kind(),
                        error = %e,
                        "Strategy failed, escalating"
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    tracing::warn!(
                        document = %document.file_name,
                        strategy = %strategy,
                        kind = %e.kind(),
                        error = %e,
                        "Strategy failed, not retrying"
                    );
                    return Err(e);
                }
            }
        }

        let last = last_error.unwrap_or_else(|| {
            ExtractionError::ResourceUnavailable("no extraction strategy applies".into())
        });
        Err(ExtractionError::ExtractionFailed {
            last: Box::new(last),
        })
    }

    async fn run_strategy(
        &self,
        strategy: Strategy,
        document: &SourceDocument,
        cancel: &CancellationToken,
    ) -> Result<MethodOutput, ExtractionError> {
        match strategy {
            Strategy::Structural => self.run_structural(document, cancel).await,
            Strategy::LocalOcr => self.run_local_ocr(document, cancel).await,
            Strategy::SyncCloudOcr => self.run_sync_cloud(document, cancel).await,
            Strategy::AsyncCloudJob => {
                let job = require(&self.async_job, "async OCR job provider")?;
                let output = job.run(document, cancel).await?;
                Ok(MethodOutput::AsyncCloudJob {
                    job: output.job,
                    pages: output.pages,
                })
            }
        }
    }

    async fn run_structural(
        &self,
        document: &SourceDocument,
        cancel: &CancellationToken,
    ) -> Result<MethodOutput, ExtractionError> {
        let extractor = require(&self.structural, "structural PDF extractor")?;
        let engine = self.local_ocr.clone();
        let bytes = Arc::clone(&document.bytes);
        let lang = self.settings.ocr_language.clone();
        let progress = Arc::clone(&self.progress);

        run_blocking(cancel, move || {
            let pages = extractor.extract_pages(&bytes)?;
            let images_found = pages.iter().map(|p| p.images.len()).sum();
            let pages = pages
                .into_iter()
                .map(|page| structural_page(page, engine.as_deref(), &lang, progress.as_ref()))
                .collect();
            Ok(MethodOutput::Structural {
                pages,
                images_found,
            })
        })
        .await
    }

    async fn run_local_ocr(
        &self,
        document: &SourceDocument,
        cancel: &CancellationToken,
    ) -> Result<MethodOutput, ExtractionError> {
        let engine = require(&self.local_ocr, "local OCR engine")?;
        let bytes = Arc::clone(&document.bytes);
        let lang = self.settings.ocr_language.clone();
        let progress = Arc::clone(&self.progress);

        if categorize(&document.mime_type) != FileCategory::Pdf {
            let page = run_blocking(cancel, move || {
                let output = engine.ocr_image(&bytes, &lang, progress.as_ref())?;
                Ok(page_from_ocr(1, output))
            })
            .await?;
            return Ok(MethodOutput::LocalOcr { pages: vec![page] });
        }

        let rasterizer = require(&self.rasterizer, "PDF rasterizer")?;
        let scale = self.settings.raster_scale;
        let token = cancel.clone();

        let pages = run_blocking(cancel, move || {
            let page_count = rasterizer.page_count(&bytes)?;
            let mut pages = Vec::with_capacity(page_count);

            for index in 0..page_count {
                if token.is_cancelled() {
                    return Err(ExtractionError::Cancelled);
                }
                let page_number = index as u32 + 1;
                let page = match rasterizer.render_page(&bytes, index, scale) {
                    Ok(image) => match engine.ocr_image(&image.png, &lang, progress.as_ref()) {
                        Ok(output) => page_from_ocr(page_number, output),
                        Err(e @ ExtractionError::ResourceUnavailable(_)) => return Err(e),
                        Err(e) => {
                            tracing::warn!(page = page_number, error = %e, "OCR failed for page, skipping");
                            ExtractedPage::empty(page_number)
                        }
                    },
                    Err(e) => {
                        tracing::warn!(page = page_number, error = %e, "Page render failed, skipping");
                        ExtractedPage::empty(page_number)
                    }
                };
                pages.push(page);
                progress.report("pages", page_number as f32 / page_count as f32);
            }
            Ok(pages)
        })
        .await?;

        Ok(MethodOutput::LocalOcr { pages })
    }

    async fn run_sync_cloud(
        &self,
        document: &SourceDocument,
        cancel: &CancellationToken,
    ) -> Result<MethodOutput, ExtractionError> {
        let client = require(&self.sync_cloud, "sync cloud OCR client")?;

        if categorize(&document.mime_type) != FileCategory::Pdf {
            let page = or_cancel(cancel, client.detect_document_text(&document.bytes, 1)).await?;
            return Ok(MethodOutput::SyncCloudOcr { pages: vec![page] });
        }

        let images = self.render_all_pages(document, cancel).await?;
        let mut pages = Vec::with_capacity(images.len());
        for (index, image) in images.into_iter().enumerate() {
            let page_number = index as u32 + 1;
            let page = match image {
                Some(image) => {
                    or_cancel(cancel, client.detect_document_text(&image.png, page_number)).await?
                }
                None => ExtractedPage::empty(page_number),
            };
            pages.push(page);
        }

        Ok(MethodOutput::SyncCloudOcr { pages })
    }

    /// Render every page; a page that fails to render is `None`.
    async fn render_all_pages(
        &self,
        document: &SourceDocument,
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<RasterImage>>, ExtractionError> {
        let rasterizer = require(&self.rasterizer, "PDF rasterizer")?;
        let bytes = Arc::clone(&document.bytes);
        let scale = self.settings.raster_scale;

        run_blocking(cancel, move || {
            let page_count = rasterizer.page_count(&bytes)?;
            Ok((0..page_count)
                .map(|index| match rasterizer.render_page(&bytes, index, scale) {
                    Ok(image) => Some(image),
                    Err(e) => {
                        tracing::warn!(page = index + 1, error = %e, "Page render failed, skipping");
                        None
                    }
                })
                .collect())
        })
        .await
    }

    /// Reject output with no text, or too little for a multi-page document.
    fn ensure_useful(&self, output: MethodOutput) -> Result<MethodOutput, ExtractionError> {
        let pages = output.pages();
        let chars: usize = pages.iter().map(|p| meaningful_chars(&p.text)).sum();
        let multi_page = pages.len() > 1;

        if chars == 0 || (multi_page && chars < self.settings.min_useful_chars) {
            return Err(ExtractionError::InsufficientText {
                chars,
                pages: pages.len(),
            });
        }
        Ok(output)
    }
}

/// Build the final result: page-ordered text, aggregated confidence, timing.
pub fn assemble_result(
    method: ExtractionMethod,
    pages: &[ExtractedPage],
    started: Instant,
) -> ExtractionResult {
    ExtractionResult {
        full_text: merge_pages(pages),
        overall_confidence: aggregate_pages(method, pages),
        method,
        page_count: pages.len(),
        processing_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}

/// Join page texts in ascending page number, whatever order they arrived in.
pub fn merge_pages(pages: &[ExtractedPage]) -> String {
    let mut ordered: Vec<&ExtractedPage> = pages.iter().collect();
    ordered.sort_by_key(|p| p.page_number);
    ordered
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join(PAGE_BREAK)
}

fn validate(document: &SourceDocument) -> Result<(), ExtractionError> {
    if document.file_name.trim().is_empty() {
        return Err(ExtractionError::Input("fileName is required".into()));
    }
    if document.bytes.is_empty() {
        return Err(ExtractionError::Input("document is empty".into()));
    }
    Ok(())
}

fn require<T: ?Sized>(
    component: &Option<Arc<T>>,
    name: &str,
) -> Result<Arc<T>, ExtractionError> {
    component
        .clone()
        .ok_or_else(|| ExtractionError::ResourceUnavailable(format!("no {name} configured")))
}

/// Run CPU-bound work on the blocking pool. Cancellation stops waiting for it.
async fn run_blocking<T, F>(cancel: &CancellationToken, work: F) -> Result<T, ExtractionError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ExtractionError> + Send + 'static,
{
    or_cancel(cancel, async move {
        tokio::task::spawn_blocking(work)
            .await
            .map_err(|e| ExtractionError::Worker(e.to_string()))?
    })
    .await
}

fn sanitize_output(mut output: MethodOutput) -> MethodOutput {
    for page in output.pages_mut() {
        page.text = sanitize_extracted_text(&page.text);
    }
    output
}

/// Native text scores a fixed confidence. A page without text falls back
/// to OCR over its embedded images; per-image failures are skipped.
fn structural_page(
    page: StructuralPage,
    engine: Option<&dyn OcrEngine>,
    lang: &str,
    progress: &dyn ProgressSink,
) -> ExtractedPage {
    if !page.text.trim().is_empty() {
        return ExtractedPage::new(page.page_number, page.text, vec![thresholds::STRUCTURAL_PAGE]);
    }

    let Some(engine) = engine else {
        return ExtractedPage::empty(page.page_number);
    };

    let mut texts = Vec::new();
    let mut confidences = Vec::new();
    for image in &page.images {
        let Some(data) = image.data.as_deref() else {
            continue;
        };
        match engine.ocr_image(data, lang, progress) {
            Ok(output) => {
                let ocr_page = page_from_ocr(page.page_number, output);
                if !ocr_page.text.trim().is_empty() {
                    texts.push(ocr_page.text);
                    confidences.extend(ocr_page.block_confidences);
                }
            }
            Err(e) => {
                tracing::warn!(
                    page = page.page_number,
                    image = %image.name,
                    error = %e,
                    "Embedded image OCR failed, skipping"
                );
            }
        }
    }

    ExtractedPage::new(page.page_number, texts.join("\n"), confidences)
}

fn page_from_ocr(page_number: u32, output: OcrOutput) -> ExtractedPage {
    let block_confidences = if output.block_confidences.is_empty() && !output.text.trim().is_empty()
    {
        vec![output.confidence]
    } else {
        output.block_confidences
    };
    ExtractedPage::new(page_number, output.text, block_confidences)
}
