//! Asynchronous cloud OCR jobs.
//!
//! Stage → submit → poll → retrieve pages → clean up. The staged object is
//! owned by a [`StagingGuard`] from the moment it exists, so it is deleted on
//! every exit path, including provider failure, timeout and cancellation.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::staging::{staging_key, ObjectStore, StagingGuard, StagingLocation};
use super::types::{ExtractedPage, SourceDocument};
use super::ExtractionError;

// ═══════════════════════════════════════════════════════════
// Job model
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    InProgress,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }
}

/// One submitted async OCR job. Mutated only by the polling step.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionJob {
    pub job_id: String,
    pub staging_location: StagingLocation,
    pub status: JobStatus,
    pub poll_attempts: u32,
    pub next_page_token: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Status reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderJobStatus {
    InProgress,
    Succeeded,
    Failed,
    PartialSuccess,
}

/// One detected block. Only `LINE` blocks carry text into the result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultBlock {
    #[serde(default)]
    pub block_type: String,
    #[serde(default)]
    pub text: String,
    /// 0-100
    #[serde(default)]
    pub confidence: f32,
    #[serde(default = "first_page")]
    pub page: u32,
}

fn first_page() -> u32 {
    1
}

impl ResultBlock {
    pub fn line(page: u32, text: &str, confidence: f32) -> Self {
        Self {
            block_type: "LINE".into(),
            text: text.to_string(),
            confidence,
            page,
        }
    }

    fn is_line(&self) -> bool {
        self.block_type.is_empty() || self.block_type.eq_ignore_ascii_case("LINE")
    }
}

/// Response to a status/result request: job status plus one page of results.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusPage {
    pub job_status: ProviderJobStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub blocks: Vec<ResultBlock>,
    #[serde(default)]
    pub next_token: Option<String>,
}

/// Async OCR provider API.
#[async_trait]
pub trait AsyncOcrProvider: Send + Sync {
    /// Start a job over a staged object, returning the provider job id.
    async fn submit(&self, location: &StagingLocation) -> Result<String, ExtractionError>;

    /// Fetch job status and, once succeeded, the result page for `next_token`
    /// (the first page when `None`).
    async fn get_status(
        &self,
        job_id: &str,
        next_token: Option<&str>,
    ) -> Result<JobStatusPage, ExtractionError>;
}

// ═══════════════════════════════════════════════════════════
// HTTP provider client
// ═══════════════════════════════════════════════════════════

/// JSON job API: `POST {endpoint}/jobs`, `GET {endpoint}/jobs/{id}[?nextToken=]`.
pub struct HttpAsyncOcrClient {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest<'a> {
    document_location: DocumentLocation<'a>,
}

#[derive(Serialize)]
struct DocumentLocation<'a> {
    bucket: &'a str,
    name: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    job_id: String,
}

impl HttpAsyncOcrClient {
    pub fn new(
        endpoint: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ExtractionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractionError::ResourceUnavailable(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, ExtractionError> {
        let response = self.authorize(request).send().await.map_err(|e| {
            if e.is_timeout() {
                ExtractionError::TransientProvider(format!("{what} timed out"))
            } else {
                ExtractionError::TransientProvider(format!("{what} failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::TransientProvider(format!(
                "{what} returned HTTP {}",
                status.as_u16()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ExtractionError::TransientProvider(format!("{what}: malformed response: {e}")))
    }
}

#[async_trait]
impl AsyncOcrProvider for HttpAsyncOcrClient {
    async fn submit(&self, location: &StagingLocation) -> Result<String, ExtractionError> {
        let body = SubmitRequest {
            document_location: DocumentLocation {
                bucket: &location.bucket,
                name: &location.key,
            },
        };
        let request = self.client.post(format!("{}/jobs", self.endpoint)).json(&body);
        let response: SubmitResponse = self.send_json(request, "Job submission").await?;

        if response.job_id.trim().is_empty() {
            return Err(ExtractionError::TransientProvider(
                "Job submission returned an empty job id".into(),
            ));
        }
        Ok(response.job_id)
    }

    async fn get_status(
        &self,
        job_id: &str,
        next_token: Option<&str>,
    ) -> Result<JobStatusPage, ExtractionError> {
        let mut request = self.client.get(format!("{}/jobs/{job_id}", self.endpoint));
        if let Some(token) = next_token {
            request = request.query(&[("nextToken", token)]);
        }
        self.send_json(request, "Job status").await
    }
}

// ═══════════════════════════════════════════════════════════
// Orchestration
// ═══════════════════════════════════════════════════════════

/// Default fixed polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default poll budget (10 minutes at the default interval).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;

/// Upper bound on continuation pages, against a provider that never stops paginating.
pub const DEFAULT_MAX_RESULT_PAGES: u32 = 1000;

#[derive(Debug, Clone, Copy)]
pub struct AsyncJobSettings {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub max_result_pages: u32,
}

impl Default for AsyncJobSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_result_pages: DEFAULT_MAX_RESULT_PAGES,
        }
    }
}

/// Successful job with its page-ordered output.
#[derive(Debug, Clone)]
pub struct AsyncJobOutput {
    pub job: ExtractionJob,
    pub pages: Vec<ExtractedPage>,
}

pub struct AsyncCloudJobOrchestrator {
    store: Arc<dyn ObjectStore>,
    provider: Arc<dyn AsyncOcrProvider>,
    settings: AsyncJobSettings,
}

impl AsyncCloudJobOrchestrator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        provider: Arc<dyn AsyncOcrProvider>,
        settings: AsyncJobSettings,
    ) -> Self {
        Self {
            store,
            provider,
            settings,
        }
    }

    /// Run one document through the async job lifecycle.
    ///
    /// A staging failure returns before anything exists to clean up. From
    /// then on the staged object is released exactly once, whatever the outcome;
    /// a failed release is logged and never replaces the primary result.
    pub async fn run(
        &self,
        document: &SourceDocument,
        cancel: &CancellationToken,
    ) -> Result<AsyncJobOutput, ExtractionError> {
        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }

        let key = staging_key(&document.file_name);
        let location = self
            .store
            .put(&key, Arc::clone(&document.bytes), &document.mime_type)
            .await?;
        let guard = StagingGuard::new(Arc::clone(&self.store), location);

        let outcome = self.submit_and_collect(guard.location(), cancel).await;
        guard.release().await;
        outcome
    }

    async fn submit_and_collect(
        &self,
        location: &StagingLocation,
        cancel: &CancellationToken,
    ) -> Result<AsyncJobOutput, ExtractionError> {
        let job_id = or_cancel(cancel, self.provider.submit(location)).await?;

        let mut job = ExtractionJob {
            job_id,
            staging_location: location.clone(),
            status: JobStatus::Submitted,
            poll_attempts: 0,
            next_page_token: None,
            submitted_at: Utc::now(),
        };
        tracing::info!(job_id = %job.job_id, location = %location, "Async OCR job submitted");

        let mut blocks = self.poll_until_done(&mut job, cancel).await?;
        self.drain_result_pages(&mut job, &mut blocks, cancel).await?;

        let pages = blocks_to_pages(&blocks);
        tracing::info!(
            job_id = %job.job_id,
            polls = job.poll_attempts,
            pages = pages.len(),
            blocks = blocks.len(),
            elapsed_ms = (Utc::now() - job.submitted_at).num_milliseconds(),
            "Async OCR job complete"
        );

        Ok(AsyncJobOutput { job, pages })
    }

    /// Poll at a fixed interval until a terminal status or the attempt budget
    /// runs out. Returns the first result page's blocks on success.
    async fn poll_until_done(
        &self,
        job: &mut ExtractionJob,
        cancel: &CancellationToken,
    ) -> Result<Vec<ResultBlock>, ExtractionError> {
        loop {
            if job.poll_attempts >= self.settings.max_attempts {
                job.status = JobStatus::TimedOut;
                tracing::warn!(job_id = %job.job_id, attempts = job.poll_attempts, "Async OCR job timed out");
                return Err(ExtractionError::TimedOut {
                    job_id: job.job_id.clone(),
                    attempts: job.poll_attempts,
                });
            }

            or_cancel(cancel, async {
                tokio::time::sleep(self.settings.poll_interval).await;
                Ok(())
            })
            .await?;

            job.poll_attempts += 1;
            let page = or_cancel(cancel, self.provider.get_status(&job.job_id, None)).await?;
            tracing::debug!(job_id = %job.job_id, attempt = job.poll_attempts, status = ?page.job_status, "Polled async OCR job");

            match page.job_status {
                ProviderJobStatus::InProgress => {
                    job.status = JobStatus::InProgress;
                }
                ProviderJobStatus::Succeeded => {
                    job.status = JobStatus::Succeeded;
                    job.next_page_token = page.next_token;
                    return Ok(page.blocks);
                }
                ProviderJobStatus::Failed | ProviderJobStatus::PartialSuccess => {
                    job.status = JobStatus::Failed;
                    let message = page
                        .status_message
                        .unwrap_or_else(|| format!("job ended with status {:?}", page.job_status));
                    tracing::warn!(job_id = %job.job_id, message = %message, "Async OCR job failed");
                    return Err(ExtractionError::TransientProvider(message));
                }
            }
        }
    }

    /// Follow continuation tokens until none remain.
    async fn drain_result_pages(
        &self,
        job: &mut ExtractionJob,
        blocks: &mut Vec<ResultBlock>,
        cancel: &CancellationToken,
    ) -> Result<(), ExtractionError> {
        let mut pages_fetched: u32 = 1;

        while let Some(token) = job.next_page_token.take() {
            if pages_fetched >= self.settings.max_result_pages {
                return Err(ExtractionError::TransientProvider(format!(
                    "Result pagination exceeded {} pages",
                    self.settings.max_result_pages
                )));
            }

            let page = or_cancel(cancel, self.provider.get_status(&job.job_id, Some(&token))).await?;
            if page.job_status != ProviderJobStatus::Succeeded {
                return Err(ExtractionError::TransientProvider(format!(
                    "Result page reported status {:?}",
                    page.job_status
                )));
            }

            blocks.extend(page.blocks);
            job.next_page_token = page.next_token;
            pages_fetched += 1;
        }

        Ok(())
    }
}

/// Race `fut` against the token; cancellation wins ties.
pub(crate) async fn or_cancel<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, ExtractionError>>,
) -> Result<T, ExtractionError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExtractionError::Cancelled),
        result = fut => result,
    }
}

/// Group blocks by page. Lines keep arrival order within a page; pages come
/// out in ascending page number whatever order they arrived in.
pub fn blocks_to_pages(blocks: &[ResultBlock]) -> Vec<ExtractedPage> {
    let mut pages: BTreeMap<u32, ExtractedPage> = BTreeMap::new();

    for block in blocks {
        let page = pages
            .entry(block.page)
            .or_insert_with(|| ExtractedPage::empty(block.page));
        if !block.is_line() || block.text.trim().is_empty() {
            continue;
        }
        if !page.text.is_empty() {
            page.text.push('\n');
        }
        page.text.push_str(block.text.trim());
        page.block_confidences.push(block.confidence);
    }

    pages.into_values().collect()
}

// ── Mock for testing ──────────────────────────────────────

/// Scripted provider. Statuses are returned in order and the last one
/// repeats forever; on success, `result_pages` are served one per token.
pub struct MockAsyncOcrProvider {
    statuses: Mutex<VecDeque<ProviderJobStatus>>,
    result_pages: Vec<Vec<ResultBlock>>,
    failure_message: Option<String>,
    fail_submit: bool,
    submits: AtomicUsize,
    status_polls: AtomicUsize,
    page_fetches: AtomicUsize,
}

impl MockAsyncOcrProvider {
    pub fn new(statuses: Vec<ProviderJobStatus>, result_pages: Vec<Vec<ResultBlock>>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into()),
            result_pages,
            failure_message: None,
            fail_submit: false,
            submits: AtomicUsize::new(0),
            status_polls: AtomicUsize::new(0),
            page_fetches: AtomicUsize::new(0),
        }
    }

    /// Never leaves `IN_PROGRESS`.
    pub fn stuck() -> Self {
        Self::new(vec![ProviderJobStatus::InProgress], Vec::new())
    }

    pub fn with_failure_message(mut self, message: &str) -> Self {
        self.failure_message = Some(message.to_string());
        self
    }

    pub fn failing_submit() -> Self {
        Self {
            fail_submit: true,
            ..Self::stuck()
        }
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn status_polls(&self) -> usize {
        self.status_polls.load(Ordering::SeqCst)
    }

    pub fn page_fetches(&self) -> usize {
        self.page_fetches.load(Ordering::SeqCst)
    }

    fn next_status(&self) -> ProviderJobStatus {
        let mut queue = match self.statuses.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(ProviderJobStatus::InProgress)
        } else {
            queue.front().copied().unwrap_or(ProviderJobStatus::InProgress)
        }
    }

    fn result_page(&self, index: usize) -> JobStatusPage {
        let next_token = (index + 1 < self.result_pages.len()).then(|| format!("page-{}", index + 1));
        JobStatusPage {
            job_status: ProviderJobStatus::Succeeded,
            status_message: None,
            blocks: self.result_pages.get(index).cloned().unwrap_or_default(),
            next_token,
        }
    }
}

#[async_trait]
impl AsyncOcrProvider for MockAsyncOcrProvider {
    async fn submit(&self, _location: &StagingLocation) -> Result<String, ExtractionError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if self.fail_submit {
            return Err(ExtractionError::TransientProvider("mock submit rejected".into()));
        }
        Ok("mock-job-1".into())
    }

    async fn get_status(
        &self,
        _job_id: &str,
        next_token: Option<&str>,
    ) -> Result<JobStatusPage, ExtractionError> {
        if let Some(token) = next_token {
            self.page_fetches.fetch_add(1, Ordering::SeqCst);
            let index = token
                .strip_prefix("page-")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| ExtractionError::TransientProvider(format!("bad token {token}")))?;
            return Ok(self.result_page(index));
        }

        self.status_polls.fetch_add(1, Ordering::SeqCst);
        match self.next_status() {
            ProviderJobStatus::Succeeded => Ok(self.result_page(0)),
            status => Ok(JobStatusPage {
                job_status: status,
                status_message: self.failure_message.clone(),
                blocks: Vec::new(),
                next_token: None,
            }),
        }
    }
}
