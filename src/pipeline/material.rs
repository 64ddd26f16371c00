//! Material store: where uploaded study materials live and where their
//! extracted text is persisted.
//!
//! Layout under the materials root:
//! ```text
//! <id>/source.bin        original bytes
//! <id>/meta.json         {"fileName": ..., "mimeType": ...}
//! <id>/extraction.json   last successful extraction
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::extraction::{ExtractionMethod, ExtractionResult, SourceDocument};
use crate::pipeline::import::{detect_mime, sanitize_filename};

const SOURCE_FILE: &str = "source.bin";
const META_FILE: &str = "meta.json";
const EXTRACTION_FILE: &str = "extraction.json";

/// Longest accepted material id.
const MAX_ID_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum MaterialError {
    #[error("Invalid material id: {0:?}")]
    InvalidId(String),

    #[error("Material not found: {0}")]
    NotFound(String),

    #[error("Material metadata is unreadable: {0}")]
    Metadata(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Collaborator that owns durable storage of source files and results.
#[async_trait]
pub trait MaterialStore: Send + Sync {
    async fn fetch_source_bytes(&self, material_id: &str) -> Result<SourceDocument, MaterialError>;

    async fn persist_extracted_text(
        &self,
        material_id: &str,
        result: &ExtractionResult,
    ) -> Result<(), MaterialError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialMeta {
    pub file_name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Persisted form of an extraction result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredExtraction {
    pub material_id: String,
    pub extracted_text: String,
    pub confidence: f32,
    pub method: ExtractionMethod,
    pub page_count: usize,
    pub processing_time_ms: u64,
    pub extracted_at: DateTime<Utc>,
}

/// Material ids name directories, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_material_id(material_id: &str) -> Result<(), MaterialError> {
    let valid = !material_id.is_empty()
        && material_id.len() <= MAX_ID_LEN
        && material_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MaterialError::InvalidId(material_id.to_string()))
    }
}

/// Directory-per-material store on the local filesystem.
pub struct FsMaterialStore {
    root: PathBuf,
}

impl FsMaterialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn material_dir(&self, material_id: &str) -> Result<PathBuf, MaterialError> {
        validate_material_id(material_id)?;
        Ok(self.root.join(material_id))
    }

    /// Store a new material's source bytes and metadata.
    pub async fn save_source(
        &self,
        material_id: &str,
        file_name: &str,
        mime_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<(), MaterialError> {
        let dir = self.material_dir(material_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(SOURCE_FILE), bytes).await?;

        let meta = MaterialMeta {
            file_name: sanitize_filename(file_name),
            mime_type: mime_type.map(str::to_string),
        };
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| MaterialError::Metadata(e.to_string()))?;
        tokio::fs::write(dir.join(META_FILE), json).await?;
        Ok(())
    }

    /// Last persisted extraction, if any.
    pub async fn load_extraction(
        &self,
        material_id: &str,
    ) -> Result<Option<StoredExtraction>, MaterialError> {
        let path = self.material_dir(material_id)?.join(EXTRACTION_FILE);
        match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| MaterialError::Metadata(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl MaterialStore for FsMaterialStore {
    async fn fetch_source_bytes(&self, material_id: &str) -> Result<SourceDocument, MaterialError> {
        let dir = self.material_dir(material_id)?;

        let bytes = match tokio::fs::read(dir.join(SOURCE_FILE)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MaterialError::NotFound(material_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let meta: MaterialMeta = match tokio::fs::read(dir.join(META_FILE)).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| MaterialError::Metadata(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MaterialMeta {
                file_name: material_id.to_string(),
                mime_type: None,
            },
            Err(e) => return Err(e.into()),
        };

        let mime_type = detect_mime(&bytes, meta.mime_type.as_deref(), &meta.file_name);
        Ok(SourceDocument::new(bytes, &mime_type, &meta.file_name))
    }

    async fn persist_extracted_text(
        &self,
        material_id: &str,
        result: &ExtractionResult,
    ) -> Result<(), MaterialError> {
        let dir = self.material_dir(material_id)?;
        if !tokio::fs::try_exists(&dir).await? {
            return Err(MaterialError::NotFound(material_id.to_string()));
        }

        let stored = StoredExtraction {
            material_id: material_id.to_string(),
            extracted_text: result.full_text.clone(),
            confidence: result.overall_confidence,
            method: result.method,
            page_count: result.page_count,
            processing_time_ms: result.processing_time_ms,
            extracted_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&stored)
            .map_err(|e| MaterialError::Metadata(e.to_string()))?;

        // Write-then-rename so readers never see a half-written file
        let tmp = dir.join(format!("{EXTRACTION_FILE}.tmp"));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, dir.join(EXTRACTION_FILE)).await?;

        tracing::debug!(material_id, chars = result.full_text.len(), "Extraction persisted");
        Ok(())
    }
}
