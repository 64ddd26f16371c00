//! `POST /api/extract`: extract text from an uploaded document.
//!
//! The document arrives either inline as base64 (raw or a data URL) or as a
//! path under the configured upload root. Paths are canonicalised and must
//! stay inside that root.

use std::path::{Path, PathBuf};

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use base64::Engine;

use crate::api::endpoints::RequestDeadline;
use crate::api::error::ApiError;
use crate::api::types::{ApiContext, ExtractRequest, ExtractResponse};
use crate::pipeline::extraction::SourceDocument;
use crate::pipeline::import::{detect_mime, sanitize_filename};

/// `POST /api/extract`
pub async fn extract(
    State(ctx): State<ApiContext>,
    payload: Result<Json<ExtractRequest>, JsonRejection>,
) -> Result<Json<ExtractResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let document = load_document(&ctx, request).await?;

    let deadline = RequestDeadline::start(ctx.config.extraction_timeout);
    let result = ctx.orchestrator.extract(&document, deadline.token()).await?;

    Ok(Json(ExtractResponse::from_result(result, &document.file_name)))
}

/// Turn a request into a `SourceDocument`, enforcing the upload size cap.
async fn load_document(
    ctx: &ApiContext,
    request: ExtractRequest,
) -> Result<SourceDocument, ApiError> {
    let limit = ctx.config.max_upload_bytes;

    let (bytes, declared, fallback_name) = match (request.file_bytes_base64, request.file_path) {
        (Some(encoded), None) => {
            let (data_url_mime, bytes) = decode_data_url(&encoded, limit)?;
            (bytes, data_url_mime, None)
        }
        (None, Some(relative)) => {
            let path = resolve_upload_path(&ctx.config.upload_root, &relative).await?;
            let bytes = read_capped(&path, limit).await?;
            let name = path.file_name().and_then(|n| n.to_str()).map(str::to_string);
            (bytes, None, name)
        }
        (Some(_), Some(_)) => {
            return Err(ApiError::BadRequest(
                "Provide either fileBytesBase64 or filePath, not both".into(),
            ))
        }
        (None, None) => {
            return Err(ApiError::BadRequest(
                "One of fileBytesBase64 or filePath is required".into(),
            ))
        }
    };

    let file_name = match (request.file_name.trim(), fallback_name) {
        ("", Some(name)) => name,
        ("", None) => return Err(ApiError::BadRequest("fileName is required".into())),
        (name, _) => name.to_string(),
    };
    let file_name = sanitize_filename(&file_name);

    let declared = request.file_type.or(declared);
    let mime_type = detect_mime(&bytes, declared.as_deref(), &file_name);

    tracing::debug!(file = %file_name, mime = %mime_type, size = bytes.len(), "Upload decoded");
    Ok(SourceDocument::new(bytes, &mime_type, &file_name))
}

/// Decode raw base64 or a `data:<mime>;base64,<payload>` URL.
///
/// Returns the mime type carried by the data URL, if any.
fn decode_data_url(data: &str, limit: usize) -> Result<(Option<String>, Vec<u8>), ApiError> {
    let (mime, payload) = match data.strip_prefix("data:").and_then(|rest| rest.split_once(',')) {
        Some((header, payload)) => {
            let mime = header
                .strip_suffix(";base64")
                .unwrap_or(header)
                .split(';')
                .next()
                .filter(|m| !m.is_empty())
                .map(str::to_string);
            (mime, payload)
        }
        None => (None, data),
    };
    let payload = payload.trim();

    // Reject before decoding when the encoded length alone proves the size
    let decoded_estimate = payload.len() / 4 * 3;
    if decoded_estimate > limit.saturating_add(3) {
        return Err(ApiError::UploadTooLarge {
            size: decoded_estimate,
            limit,
        });
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| ApiError::BadRequest(format!("Invalid base64 data: {e}")))?;
    if bytes.len() > limit {
        return Err(ApiError::UploadTooLarge {
            size: bytes.len(),
            limit,
        });
    }
    Ok((mime, bytes))
}

/// Resolve `relative` under `root`, refusing anything that escapes it.
async fn resolve_upload_path(root: &Path, relative: &str) -> Result<PathBuf, ApiError> {
    if relative.trim().is_empty() {
        return Err(ApiError::BadRequest("filePath is empty".into()));
    }

    let root = tokio::fs::canonicalize(root).await.map_err(|e| {
        ApiError::Internal(format!("Upload root {} unavailable: {e}", root.display()))
    })?;

    let candidate = root.join(relative.trim_start_matches(['/', '\\']));
    let resolved = match tokio::fs::canonicalize(&candidate).await {
        Ok(path) => path,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::BadRequest(format!("File not found: {relative}")));
        }
        Err(e) => return Err(ApiError::BadRequest(format!("Cannot resolve {relative}: {e}"))),
    };

    if !resolved.starts_with(&root) {
        tracing::warn!(path = relative, "Rejected filePath outside the upload root");
        return Err(ApiError::BadRequest(
            "filePath must stay inside the upload directory".into(),
        ));
    }
    Ok(resolved)
}

async fn read_capped(path: &Path, limit: usize) -> Result<Vec<u8>, ApiError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| ApiError::BadRequest(format!("Cannot read file: {e}")))?;
    if !metadata.is_file() {
        return Err(ApiError::BadRequest("filePath is not a file".into()));
    }
    let size = usize::try_from(metadata.len()).unwrap_or(usize::MAX);
    if size > limit {
        return Err(ApiError::UploadTooLarge { size, limit });
    }

    tokio::fs::read(path)
        .await
        .map_err(|e| ApiError::Internal(format!("Reading {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn decodes_raw_base64() {
        let (mime, bytes) = decode_data_url(&encode(b"hello"), 1024).unwrap();
        assert!(mime.is_none());
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn decodes_data_url_and_keeps_its_mime() {
        let url = format!("data:image/png;base64,{}", encode(&[0x89, 0x50, 0x4E, 0x47]));
        let (mime, bytes) = decode_data_url(&url, 1024).unwrap();
        assert_eq!(mime.as_deref(), Some("image/png"));
        assert_eq!(bytes, [0x89, 0x50, 0x4E, 0x47]);
    }

    #[test]
    fn invalid_base64_is_bad_request() {
        assert!(matches!(
            decode_data_url("not-valid-base64!!!", 1024),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn oversized_upload_is_rejected() {
        let encoded = encode(&[7u8; 64]);
        assert!(matches!(
            decode_data_url(&encoded, 32),
            Err(ApiError::UploadTooLarge { limit: 32, .. })
        ));
        assert!(decode_data_url(&encoded, 64).is_ok());
    }

    #[tokio::test]
    async fn resolves_paths_inside_root() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("week1")).unwrap();
        std::fs::write(root.path().join("week1/notes.pdf"), b"%PDF-1.4").unwrap();

        let path = resolve_upload_path(root.path(), "week1/notes.pdf").await.unwrap();
        assert!(path.ends_with("week1/notes.pdf"));

        // Leading slashes are treated as relative to the root
        let path = resolve_upload_path(root.path(), "/week1/notes.pdf").await.unwrap();
        assert!(path.ends_with("week1/notes.pdf"));
    }

    #[tokio::test]
    async fn traversal_outside_root_is_rejected() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("uploads");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(outer.path().join("secret.pdf"), b"%PDF-1.4").unwrap();

        let err = resolve_upload_path(&root, "../secret.pdf").await.unwrap_err();
        match err {
            ApiError::BadRequest(msg) => assert!(msg.contains("inside the upload directory")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_file_is_bad_request() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_upload_path(root.path(), "nope.pdf").await,
            Err(ApiError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn read_capped_enforces_limit() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("big.png");
        std::fs::write(&path, vec![0u8; 100]).unwrap();

        assert!(matches!(
            read_capped(&path, 99).await,
            Err(ApiError::UploadTooLarge { size: 100, limit: 99 })
        ));
        assert_eq!(read_capped(&path, 100).await.unwrap().len(), 100);
    }
}
