//! Staging storage for asynchronous OCR jobs.
//!
//! A document is copied into object storage only so the async provider can
//! read it. `StagingGuard` owns that copy and deletes it exactly once: either
//! through `release()` on the normal path, or from `Drop` if the owning
//! future is cancelled or panics first.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ExtractionError;
use crate::pipeline::import::sanitize_filename;

/// Where a staged document lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingLocation {
    pub bucket: String,
    pub key: String,
}

impl fmt::Display for StagingLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Unique staging key for one upload: `staging/<uuid>/<file name>`.
pub fn staging_key(file_name: &str) -> String {
    format!("staging/{}/{}", Uuid::new_v4(), sanitize_filename(file_name))
}

/// Object storage used to stage documents for async OCR.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: Arc<[u8]>,
        content_type: &str,
    ) -> Result<StagingLocation, ExtractionError>;

    /// Delete the object if present. `Ok(true)` if deleted, `Ok(false)` if it
    /// did not exist, so repeated deletes never fail.
    async fn delete(&self, location: &StagingLocation) -> Result<bool, ExtractionError>;
}

// ═══════════════════════════════════════════════════════════
// HTTP object store
// ═══════════════════════════════════════════════════════════

/// Path-style HTTP object store: `PUT`/`DELETE {endpoint}/{bucket}/{key}`.
/// Key segments are percent-encoded, so file names may carry `#`, `?` or spaces.
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    bucket: String,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: &str,
        bucket: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ExtractionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractionError::ResourceUnavailable(format!("HTTP client: {e}")))?;
        let endpoint = reqwest::Url::parse(endpoint)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| {
                ExtractionError::ResourceUnavailable(format!("Invalid staging endpoint: {endpoint}"))
            })?;
        Ok(Self {
            client,
            endpoint,
            bucket: bucket.to_string(),
            token,
        })
    }

    fn object_url(&self, location: &StagingLocation) -> reqwest::Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push(&location.bucket)
                .extend(location.key.split('/'));
        }
        url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Arc<[u8]>,
        content_type: &str,
    ) -> Result<StagingLocation, ExtractionError> {
        let location = StagingLocation {
            bucket: self.bucket.clone(),
            key: key.to_string(),
        };

        let response = self
            .authorize(self.client.put(self.object_url(&location)))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| ExtractionError::TransientProvider(format!("Staging upload failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::TransientProvider(format!(
                "Staging upload returned HTTP {}",
                status.as_u16()
            )));
        }

        tracing::debug!(location = %location, size = bytes.len(), "Document staged");
        Ok(location)
    }

    async fn delete(&self, location: &StagingLocation) -> Result<bool, ExtractionError> {
        let response = self
            .authorize(self.client.delete(self.object_url(location)))
            .send()
            .await
            .map_err(|e| ExtractionError::TransientProvider(format!("Staging delete failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(ExtractionError::TransientProvider(format!(
                "Staging delete returned HTTP {}",
                status.as_u16()
            )));
        }
        Ok(true)
    }
}

// ═══════════════════════════════════════════════════════════
// Filesystem object store
// ═══════════════════════════════════════════════════════════

/// Local-directory object store for single-host deployments.
pub struct FsObjectStore {
    root: PathBuf,
}

/// Bucket name reported for filesystem-staged objects.
const FS_BUCKET: &str = "local";

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ExtractionError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(ExtractionError::Input(format!("Invalid staging key: {key:?}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Arc<[u8]>,
        _content_type: &str,
    ) -> Result<StagingLocation, ExtractionError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes[..]).await?;

        Ok(StagingLocation {
            bucket: FS_BUCKET.to_string(),
            key: key.to_string(),
        })
    }

    async fn delete(&self, location: &StagingLocation) -> Result<bool, ExtractionError> {
        let path = self.path_for(&location.key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                // Remove the per-upload directory if it is now empty
                if let Some(parent) = path.parent() {
                    let _ = tokio::fs::remove_dir(parent).await;
                }
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Guard
// ═══════════════════════════════════════════════════════════

/// Owns a staged object and guarantees a single deletion attempt.
pub struct StagingGuard {
    store: Arc<dyn ObjectStore>,
    location: StagingLocation,
    released: bool,
}

impl StagingGuard {
    pub fn new(store: Arc<dyn ObjectStore>, location: StagingLocation) -> Self {
        Self {
            store,
            location,
            released: false,
        }
    }

    pub fn location(&self) -> &StagingLocation {
        &self.location
    }

    /// Delete the staged object. Failures are logged, never returned.
    pub async fn release(mut self) {
        self.released = true;
        cleanup(self.store.as_ref(), &self.location).await;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let store = Arc::clone(&self.store);
        let location = self.location.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(location = %location, "Staging guard dropped before release, scheduling cleanup");
                handle.spawn(async move {
                    cleanup(store.as_ref(), &location).await;
                });
            }
            Err(_) => {
                tracing::error!(location = %location, "No async runtime to clean up staged object; it is orphaned");
            }
        }
    }
}

async fn cleanup(store: &dyn ObjectStore, location: &StagingLocation) {
    match store.delete(location).await {
        Ok(true) => tracing::debug!(location = %location, "Staged object deleted"),
        Ok(false) => tracing::debug!(location = %location, "Staged object already absent"),
        Err(e) => tracing::warn!(location = %location, error = %e, "Staging cleanup failed; object may be orphaned"),
    }
}

// ── Mock for testing ──────────────────────────────────────

/// In-memory store that counts operations and can be told to fail.
#[derive(Default)]
pub struct MockObjectStore {
    puts: AtomicUsize,
    deletes: AtomicUsize,
    fail_put: bool,
    fail_delete: bool,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_put() -> Self {
        Self {
            fail_put: true,
            ..Self::default()
        }
    }

    pub fn failing_delete() -> Self {
        Self {
            fail_delete: true,
            ..Self::default()
        }
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn put(
        &self,
        key: &str,
        _bytes: Arc<[u8]>,
        _content_type: &str,
    ) -> Result<StagingLocation, ExtractionError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_put {
            return Err(ExtractionError::TransientProvider("mock put failed".into()));
        }
        Ok(StagingLocation {
            bucket: "mock".into(),
            key: key.to_string(),
        })
    }

    async fn delete(&self, _location: &StagingLocation) -> Result<bool, ExtractionError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete {
            return Err(ExtractionError::TransientProvider("mock delete failed".into()));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn bytes(data: &[u8]) -> Arc<[u8]> {
        Arc::from(data)
    }

    #[test]
    fn staging_keys_are_unique_and_sanitized() {
        let a = staging_key("../../etc/lecture 1.pdf");
        let b = staging_key("../../etc/lecture 1.pdf");
        assert_ne!(a, b);
        assert!(a.starts_with("staging/"));
        assert!(a.ends_with("/lecture 1.pdf"));
        assert!(!a.contains(".."));
    }

    #[tokio::test]
    async fn fs_store_put_then_delete_twice() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        let location = store
            .put("staging/abc/notes.pdf", bytes(b"%PDF-1.4"), "application/pdf")
            .await
            .unwrap();
        assert_eq!(location.bucket, "local");
        assert!(dir.path().join("staging/abc/notes.pdf").is_file());

        assert!(store.delete(&location).await.unwrap());
        assert!(!store.delete(&location).await.unwrap());
        assert!(!dir.path().join("staging/abc").exists());
    }

    #[tokio::test]
    async fn fs_store_rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let err = store
            .put("../escape.pdf", bytes(b"x"), "application/pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Input(_)));
    }

    #[tokio::test]
    async fn http_store_put_and_idempotent_delete() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/uploads/staging/k1/doc.pdf"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/uploads/staging/k1/doc.pdf"))
            .respond_with(ResponseTemplate::new(204))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/uploads/staging/k1/doc.pdf"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store =
            HttpObjectStore::new(&server.uri(), "uploads", Some("tok".into()), Duration::from_secs(5))
                .unwrap();
        let location = store
            .put("staging/k1/doc.pdf", bytes(b"%PDF"), "application/pdf")
            .await
            .unwrap();
        assert_eq!(location.to_string(), "uploads/staging/k1/doc.pdf");

        assert!(store.delete(&location).await.unwrap());
        assert!(!store.delete(&location).await.unwrap());
    }

    #[tokio::test]
    async fn http_store_encodes_reserved_characters_in_keys() {
        let server = MockServer::start().await;
        let encoded = "/b/staging/k2/week%233%20notes%3F.pdf";
        Mock::given(method("PUT"))
            .and(path(encoded))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(encoded))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpObjectStore::new(&server.uri(), "b", None, Duration::from_secs(5)).unwrap();
        let location = store
            .put("staging/k2/week#3 notes?.pdf", bytes(b"%PDF"), "application/pdf")
            .await
            .unwrap();
        assert_eq!(location.key, "staging/k2/week#3 notes?.pdf");
        assert!(store.delete(&location).await.unwrap());

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.url.query().is_none()));
    }

    #[tokio::test]
    async fn http_store_keeps_endpoint_path_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/storage/v1/b/staging/k3/a.pdf"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = format!("{}/storage/v1/", server.uri());
        let store = HttpObjectStore::new(&endpoint, "b", None, Duration::from_secs(5)).unwrap();
        store
            .put("staging/k3/a.pdf", bytes(b"%PDF"), "application/pdf")
            .await
            .unwrap();
    }

    #[test]
    fn http_store_rejects_unusable_endpoint() {
        let err = HttpObjectStore::new("not a url", "b", None, Duration::from_secs(5)).err();
        assert!(matches!(err, Some(ExtractionError::ResourceUnavailable(_))));
    }

    #[tokio::test]
    async fn http_store_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = HttpObjectStore::new(&server.uri(), "b", None, Duration::from_secs(5)).unwrap();
        let put = store.put("k", bytes(b"x"), "image/png").await.unwrap_err();
        assert!(matches!(put, ExtractionError::TransientProvider(ref m) if m.contains("403")));

        let location = StagingLocation {
            bucket: "b".into(),
            key: "k".into(),
        };
        assert!(store.delete(&location).await.is_err());
    }

    #[tokio::test]
    async fn release_deletes_exactly_once() {
        let store = Arc::new(MockObjectStore::new());
        let location = StagingLocation {
            bucket: "mock".into(),
            key: "staging/x/doc.pdf".into(),
        };
        let guard = StagingGuard::new(store.clone(), location.clone());
        assert_eq!(guard.location(), &location);

        guard.release().await;
        tokio::task::yield_now().await;
        assert_eq!(store.deletes(), 1);
    }

    #[tokio::test]
    async fn release_swallows_cleanup_failure() {
        let store = Arc::new(MockObjectStore::failing_delete());
        let guard = StagingGuard::new(
            store.clone(),
            StagingLocation {
                bucket: "mock".into(),
                key: "k".into(),
            },
        );
        guard.release().await;
        assert_eq!(store.deletes(), 1);
    }

    #[tokio::test]
    async fn dropped_guard_schedules_cleanup() {
        let store = Arc::new(MockObjectStore::new());
        {
            let _guard = StagingGuard::new(
                store.clone(),
                StagingLocation {
                    bucket: "mock".into(),
                    key: "k".into(),
                },
            );
        }

        for _ in 0..100 {
            if store.deletes() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(store.deletes(), 1);
    }
}
