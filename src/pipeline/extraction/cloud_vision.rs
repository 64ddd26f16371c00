//! Synchronous cloud OCR (`images:annotate` with `DOCUMENT_TEXT_DETECTION`).
//!
//! One image per request. The base64-encoded payload is checked against the
//! provider's ceiling before any network call is made.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::types::ExtractedPage;
use super::ExtractionError;

/// Provider ceiling on the encoded request payload (~10 MB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Synchronous single-image OCR against a remote provider.
#[async_trait]
pub trait SyncCloudOcr: Send + Sync {
    /// Largest accepted raw image size, after accounting for base64 inflation.
    fn max_raw_bytes(&self) -> usize;

    async fn detect_document_text(
        &self,
        image_bytes: &[u8],
        page_number: u32,
    ) -> Result<ExtractedPage, ExtractionError>;
}

/// Size of `raw_len` bytes once base64-encoded with padding.
pub fn encoded_payload_len(raw_len: usize) -> usize {
    base64::encoded_len(raw_len, true).unwrap_or(usize::MAX)
}

/// Largest raw size whose encoding fits within `limit`.
pub fn max_raw_for_limit(limit: usize) -> usize {
    (limit / 4) * 3
}

/// Reject payloads that would exceed the provider ceiling once encoded.
pub fn check_payload(raw_len: usize, limit: usize) -> Result<usize, ExtractionError> {
    let encoded = encoded_payload_len(raw_len);
    if encoded > limit {
        return Err(ExtractionError::PayloadTooLarge { encoded, limit });
    }
    Ok(encoded)
}

// ── Wire types ─────────────────────────────────────────────

#[derive(Serialize)]
struct AnnotateRequest<'a> {
    requests: [AnnotateImageRequest<'a>; 1],
}

#[derive(Serialize)]
struct AnnotateImageRequest<'a> {
    image: ImageContent,
    features: [Feature<'a>; 1],
}

#[derive(Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Serialize)]
struct Feature<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    full_text_annotation: Option<TextAnnotation>,
    error: Option<ProviderStatus>,
}

#[derive(Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: String,
    #[serde(default)]
    pages: Vec<AnnotationPage>,
}

#[derive(Deserialize)]
struct AnnotationPage {
    #[serde(default)]
    blocks: Vec<AnnotationBlock>,
}

#[derive(Deserialize)]
struct AnnotationBlock {
    confidence: Option<f32>,
}

#[derive(Deserialize)]
struct ProviderStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

// ── Client ─────────────────────────────────────────────────

/// HTTP client for the synchronous cloud OCR API.
pub struct SyncCloudOcrClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    max_payload_bytes: usize,
}

impl SyncCloudOcrClient {
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        max_payload_bytes: usize,
        timeout: Duration,
    ) -> Result<Self, ExtractionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractionError::ResourceUnavailable(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            max_payload_bytes,
        })
    }

    fn build_request_body(image_bytes: &[u8]) -> AnnotateRequest<'static> {
        AnnotateRequest {
            requests: [AnnotateImageRequest {
                image: ImageContent {
                    content: base64::engine::general_purpose::STANDARD.encode(image_bytes),
                },
                features: [Feature {
                    kind: "DOCUMENT_TEXT_DETECTION",
                }],
            }],
        }
    }
}

#[async_trait]
impl SyncCloudOcr for SyncCloudOcrClient {
    fn max_raw_bytes(&self) -> usize {
        max_raw_for_limit(self.max_payload_bytes)
    }

    async fn detect_document_text(
        &self,
        image_bytes: &[u8],
        page_number: u32,
    ) -> Result<ExtractedPage, ExtractionError> {
        let encoded = check_payload(image_bytes.len(), self.max_payload_bytes)?;
        let body = Self::build_request_body(image_bytes);
        let start = Instant::now();

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key.as_str())]);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                ExtractionError::TransientProvider(format!("Cannot connect to {}", self.endpoint))
            } else if e.is_timeout() {
                ExtractionError::TransientProvider("Cloud OCR request timed out".into())
            } else {
                ExtractionError::TransientProvider(format!("Cloud OCR request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::TransientProvider(format!(
                "Cloud OCR returned HTTP {}: {}",
                status.as_u16(),
                truncate(&body, 200)
            )));
        }

        let parsed: AnnotateResponse = response.json().await.map_err(|e| {
            ExtractionError::TransientProvider(format!("Malformed cloud OCR response: {e}"))
        })?;

        let page = parse_annotation(parsed, page_number)?;

        tracing::debug!(
            page = page_number,
            encoded_bytes = encoded,
            blocks = page.block_confidences.len(),
            chars = page.text.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sync cloud OCR page complete"
        );

        Ok(page)
    }
}

/// Convert the provider response into a page. Block confidences arrive on
/// a 0-1 scale and are returned on 0-100.
fn parse_annotation(
    response: AnnotateResponse,
    page_number: u32,
) -> Result<ExtractedPage, ExtractionError> {
    let first = response.responses.into_iter().next().ok_or_else(|| {
        ExtractionError::TransientProvider("Cloud OCR response contained no results".into())
    })?;

    if let Some(err) = first.error {
        return Err(ExtractionError::TransientProvider(format!(
            "Cloud OCR error {}: {}",
            err.code, err.message
        )));
    }

    // No annotation means the provider found no text on this image
    let Some(annotation) = first.full_text_annotation else {
        return Ok(ExtractedPage::empty(page_number));
    };

    let block_confidences = annotation
        .pages
        .iter()
        .flat_map(|p| p.blocks.iter())
        .filter_map(|b| b.confidence)
        .map(|c| (c * 100.0).clamp(0.0, 100.0))
        .collect();

    Ok(ExtractedPage::new(page_number, annotation.text, block_confidences))
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ── Mock for testing ──────────────────────────────────────

/// Mock sync cloud OCR returning fixed text, counting calls.
pub struct MockSyncCloudOcr {
    text: String,
    block_confidences: Vec<f32>,
    max_raw_bytes: usize,
    fail: bool,
    calls: std::sync::atomic::AtomicUsize,
}

impl MockSyncCloudOcr {
    pub fn new(text: &str, block_confidences: Vec<f32>) -> Self {
        Self {
            text: text.to_string(),
            block_confidences,
            max_raw_bytes: max_raw_for_limit(DEFAULT_MAX_PAYLOAD_BYTES),
            fail: false,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Every call fails with a transient provider error.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new("", Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncCloudOcr for MockSyncCloudOcr {
    fn max_raw_bytes(&self) -> usize {
        self.max_raw_bytes
    }

    async fn detect_document_text(
        &self,
        image_bytes: &[u8],
        page_number: u32,
    ) -> Result<ExtractedPage, ExtractionError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        check_payload(image_bytes.len(), DEFAULT_MAX_PAYLOAD_BYTES)?;
        if self.fail {
            return Err(ExtractionError::TransientProvider("mock provider returned 503".into()));
        }
        Ok(ExtractedPage::new(
            page_number,
            self.text.clone(),
            self.block_confidences.clone(),
        ))
    }
}
