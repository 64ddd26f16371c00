//! API router.
//!
//! Returns a composable `Router` that can be mounted on any axum server.
//! Routes are nested under `/api/`.
//!
//! Layers (outermost → innermost): trace → CORS → body limit → handler.

use axum::extract::DefaultBodyLimit;
use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::api::endpoints;
use crate::api::types::ApiContext;

/// Build the API router from a pre-constructed `ApiContext`.
///
/// The body limit is the upload cap after base64 inflation; axum's own 2 MB
/// default is disabled in favour of it.
pub fn build_router(ctx: ApiContext) -> Router {
    let body_limit = ctx.config.max_request_body_bytes();

    // NOTE: Path params use `:param` syntax (matchit 0.7 / axum 0.7).
    let api = Router::new()
        .route("/health", get(endpoints::health::check))
        .route("/extract", post(endpoints::extract::extract))
        .route(
            "/materials/:id/extract",
            post(endpoints::materials::extract_material),
        )
        .with_state(ctx);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .nest("/api", api)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use base64::Engine;
    use tower::ServiceExt;

    use crate::config::{AppConfig, ExtractionSettings};
    use crate::pipeline::extraction::async_job::{
        AsyncCloudJobOrchestrator, AsyncJobSettings, MockAsyncOcrProvider,
    };
    use crate::pipeline::extraction::ocr::MockOcrEngine;
    use crate::pipeline::extraction::pdf::MockStructuralExtractor;
    use crate::pipeline::extraction::staging::FsObjectStore;
    use crate::pipeline::extraction::ExtractionOrchestrator;
    use crate::pipeline::material::FsMaterialStore;

    struct TestApp {
        router: Router,
        store: Arc<FsMaterialStore>,
        _dir: tempfile::TempDir,
    }

    fn test_app(orchestrator: ExtractionOrchestrator, max_upload_bytes: usize) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let upload_root = dir.path().join("uploads");
        std::fs::create_dir_all(&upload_root).unwrap();
        let config = AppConfig {
            data_dir: dir.path().to_path_buf(),
            upload_root,
            max_upload_bytes,
            extraction_timeout: Duration::from_secs(30),
            ..AppConfig::default()
        };
        let store = Arc::new(FsMaterialStore::new(config.materials_dir()));
        let ctx = ApiContext::new(Arc::new(config), Arc::new(orchestrator), store.clone());
        TestApp {
            router: build_router(ctx),
            store,
            _dir: dir,
        }
    }

    fn pdf_orchestrator(pages: &[&str]) -> ExtractionOrchestrator {
        ExtractionOrchestrator::new(ExtractionSettings::default())
            .with_structural(Arc::new(MockStructuralExtractor::new(pages)))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json(response: axum::response::Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn encode(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    const LONG_PAGE: &str = "Photosynthesis converts light energy into chemical energy stored in glucose molecules.";

    #[tokio::test]
    async fn health_lists_configured_strategies() {
        let app = test_app(pdf_orchestrator(&[LONG_PAGE]), 1024);
        let req = Request::builder().uri("/api/health").body(Body::empty()).unwrap();
        let response = app.router.oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = read_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], crate::config::APP_VERSION);
        assert_eq!(json["strategies"], serde_json::json!(["structural"]));
    }

    #[tokio::test]
    async fn extract_base64_pdf_returns_text_and_metadata() {
        let app = test_app(pdf_orchestrator(&[LONG_PAGE, LONG_PAGE]), 1024 * 1024);
        let body = serde_json::json!({
            "fileBytesBase64": encode(b"%PDF-1.4 fake"),
            "fileName": "biology.pdf",
        });
        let response = app.router.oneshot(post_json("/api/extract", body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = read_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["method"], "structural");
        assert_eq!(json["metadata"]["pageCount"], 2);
        assert_eq!(json["metadata"]["fileName"], "biology.pdf");
        let text = json["extractedText"].as_str().unwrap();
        assert!(text.contains("--- Page Break ---"));
        assert_eq!(
            json["metadata"]["characterCount"].as_u64().unwrap() as usize,
            text.chars().count()
        );
    }

    #[tokio::test]
    async fn extract_from_upload_root_path() {
        let app = test_app(pdf_orchestrator(&[LONG_PAGE]), 1024 * 1024);
        let upload_root = app._dir.path().join("uploads");
        std::fs::write(upload_root.join("lecture.pdf"), b"%PDF-1.7 fake").unwrap();

        let body = serde_json::json!({ "filePath": "lecture.pdf", "fileName": "" });
        let response = app.router.oneshot(post_json("/api/extract", body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = read_json(response).await;
        assert_eq!(json["metadata"]["fileName"], "lecture.pdf");
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let app = test_app(pdf_orchestrator(&[LONG_PAGE]), 1024 * 1024);
        std::fs::write(app._dir.path().join("outside.pdf"), b"%PDF-1.7").unwrap();

        let body = serde_json::json!({ "filePath": "../outside.pdf", "fileName": "x.pdf" });
        let response = app.router.oneshot(post_json("/api/extract", body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = read_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "INPUT_ERROR");
    }

    #[tokio::test]
    async fn missing_source_is_bad_request() {
        let app = test_app(pdf_orchestrator(&[LONG_PAGE]), 1024);
        let body = serde_json::json!({ "fileName": "a.pdf" });
        let response = app.router.oneshot(post_json("/api/extract", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let app = test_app(pdf_orchestrator(&[LONG_PAGE]), 1024);
        let req = Request::builder()
            .method("POST")
            .uri("/api/extract")
            .header("Content-Type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await["code"], "INPUT_ERROR");
    }

    #[tokio::test]
    async fn unsupported_type_is_400() {
        let app = test_app(pdf_orchestrator(&[LONG_PAGE]), 1024);
        let body = serde_json::json!({
            "fileBytesBase64": encode(b"<html><body>hi</body></html>"),
            "fileName": "page.html",
            "fileType": "text/html",
        });
        let response = app.router.oneshot(post_json("/api/extract", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await["code"], "UNSUPPORTED_TYPE");
    }

    #[tokio::test]
    async fn oversized_upload_is_400_payload_too_large() {
        let app = test_app(pdf_orchestrator(&[LONG_PAGE]), 16);
        let body = serde_json::json!({
            "fileBytesBase64": encode(&[0x25; 64]),
            "fileName": "big.pdf",
        });
        let response = app.router.oneshot(post_json("/api/extract", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await["code"], "PAYLOAD_TOO_LARGE");
    }

    #[tokio::test]
    async fn exhausted_ladder_is_500() {
        // Structural text too short, no other backends configured
        let app = test_app(pdf_orchestrator(&["ab", ""]), 1024 * 1024);
        let body = serde_json::json!({
            "fileBytesBase64": encode(b"%PDF-1.4 scanned"),
            "fileName": "scan.pdf",
        });
        let response = app.router.oneshot(post_json("/api/extract", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = read_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "EXTRACTION_FAILED");
    }

    #[tokio::test]
    async fn async_job_timeout_is_504() {
        let dir = tempfile::tempdir().unwrap();
        let async_job = AsyncCloudJobOrchestrator::new(
            Arc::new(FsObjectStore::new(dir.path())),
            Arc::new(MockAsyncOcrProvider::stuck()),
            AsyncJobSettings {
                poll_interval: Duration::from_millis(1),
                max_attempts: 3,
                ..AsyncJobSettings::default()
            },
        );
        let orchestrator = pdf_orchestrator(&["", ""]).with_async_job(Arc::new(async_job));
        let app = test_app(orchestrator, 1024 * 1024);

        let body = serde_json::json!({
            "fileBytesBase64": encode(b"%PDF-1.4 scanned"),
            "fileName": "scan.pdf",
        });
        let response = app.router.oneshot(post_json("/api/extract", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(read_json(response).await["code"], "TIMED_OUT");
    }

    #[tokio::test]
    async fn material_extract_persists_result() {
        let orchestrator = ExtractionOrchestrator::new(ExtractionSettings::default())
            .with_local_ocr(Arc::new(MockOcrEngine::new("Cell membrane notes", 88.0)));
        let app = test_app(orchestrator, 1024 * 1024);
        app.store
            .save_source("bio-1", "photo.png", None, &[0x89, 0x50, 0x4E, 0x47, 0, 0])
            .await
            .unwrap();

        let req = Request::builder()
            .method("POST")
            .uri("/api/materials/bio-1/extract")
            .body(Body::empty())
            .unwrap();
        let response = app.router.oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = read_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["materialId"], "bio-1");
        assert_eq!(json["method"], "local_ocr");

        let stored = app.store.load_extraction("bio-1").await.unwrap().unwrap();
        assert_eq!(stored.extracted_text, "Cell membrane notes");
    }

    #[tokio::test]
    async fn unknown_material_is_404() {
        let app = test_app(pdf_orchestrator(&[LONG_PAGE]), 1024);
        let req = Request::builder()
            .method("POST")
            .uri("/api/materials/ghost/extract")
            .body(Body::empty())
            .unwrap();
        let response = app.router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let app = test_app(pdf_orchestrator(&[LONG_PAGE]), 1024);
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let response = app.router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
