pub mod types;
pub mod confidence;
pub mod sanitize;
pub mod pdf;
pub mod pdfium;
pub mod ocr;
pub mod cloud_vision;
pub mod staging;
pub mod async_job;
pub mod orchestrator;

pub use types::*;
pub use confidence::*;
pub use sanitize::*;
pub use orchestrator::*;

use std::fmt;

use serde::Serialize;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════
// Error taxonomy
// ═══════════════════════════════════════════════════════════

/// Flat classification of an [`ExtractionError`].
///
/// Escalation and HTTP status mapping branch on this, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Input,
    UnsupportedType,
    PayloadTooLarge,
    TransientProvider,
    TimedOut,
    ResourceUnavailable,
    InsufficientText,
    Cancelled,
    ExtractionFailed,
    Internal,
}

impl ErrorKind {
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::Input => "INPUT_ERROR",
            Self::UnsupportedType => "UNSUPPORTED_TYPE",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::TransientProvider => "TRANSIENT_PROVIDER",
            Self::TimedOut => "TIMED_OUT",
            Self::ResourceUnavailable => "RESOURCE_UNAVAILABLE",
            Self::InsufficientText => "INSUFFICIENT_TEXT",
            Self::Cancelled => "CANCELLED",
            Self::ExtractionFailed => "EXTRACTION_FAILED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Unsupported document type: {0}")]
    UnsupportedType(String),

    #[error("Encoded payload of {encoded} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { encoded: usize, limit: usize },

    #[error("OCR provider error: {0}")]
    TransientProvider(String),

    #[error("OCR job {job_id} still in progress after {attempts} polls")]
    TimedOut { job_id: String, attempts: u32 },

    #[error("No OCR resource source could be loaded: {0}")]
    ResourceUnavailable(String),

    #[error("Extracted text too short to be useful: {chars} characters across {pages} pages")]
    InsufficientText { chars: usize, pages: usize },

    #[error("Extraction cancelled")]
    Cancelled,

    #[error("All extraction strategies failed; last error: {last}")]
    ExtractionFailed { last: Box<ExtractionError> },

    #[error("PDF parsing failed: {0}")]
    PdfParsing(String),

    #[error("PDF page {page} rendering failed: {reason}")]
    PdfRendering { page: usize, reason: String },

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("OCR processing failed: {0}")]
    OcrProcessing(String),

    #[error("Extraction worker failed: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Input(_) => ErrorKind::Input,
            Self::UnsupportedType(_) => ErrorKind::UnsupportedType,
            Self::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Self::TransientProvider(_) => ErrorKind::TransientProvider,
            Self::TimedOut { .. } => ErrorKind::TimedOut,
            Self::ResourceUnavailable(_) => ErrorKind::ResourceUnavailable,
            Self::InsufficientText { .. } => ErrorKind::InsufficientText,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ExtractionFailed { .. } => ErrorKind::ExtractionFailed,
            Self::PdfParsing(_)
            | Self::PdfRendering { .. }
            | Self::ImageProcessing(_)
            | Self::OcrProcessing(_)
            | Self::Worker(_)
            | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether the orchestrator may move on to the next strategy.
    ///
    /// Internal failures are scoped to one strategy's backend (a PDF the
    /// structural parser chokes on may still rasterize), so they escalate too.
    pub fn is_recoverable(&self) -> bool {
        match self.kind() {
            ErrorKind::TransientProvider
            | ErrorKind::ResourceUnavailable
            | ErrorKind::InsufficientText
            | ErrorKind::PayloadTooLarge
            | ErrorKind::Internal => true,
            ErrorKind::Input
            | ErrorKind::UnsupportedType
            | ErrorKind::TimedOut
            | ErrorKind::Cancelled
            | ErrorKind::ExtractionFailed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_and_unsupported_are_terminal() {
        assert!(!ExtractionError::Input("missing fileName".into()).is_recoverable());
        assert!(!ExtractionError::UnsupportedType("text/html".into()).is_recoverable());
    }

    #[test]
    fn provider_and_resource_errors_escalate() {
        assert!(ExtractionError::TransientProvider("503".into()).is_recoverable());
        assert!(ExtractionError::ResourceUnavailable("eng".into()).is_recoverable());
        assert!(ExtractionError::InsufficientText { chars: 10, pages: 5 }.is_recoverable());
        assert!(ExtractionError::PayloadTooLarge { encoded: 11, limit: 10 }.is_recoverable());
        assert!(ExtractionError::PdfParsing("bad xref".into()).is_recoverable());
    }

    #[test]
    fn timed_out_is_distinct_from_transient() {
        let err = ExtractionError::TimedOut {
            job_id: "job-1".into(),
            attempts: 60,
        };
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert_ne!(err.kind(), ErrorKind::TransientProvider);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn exhausted_wraps_last_error() {
        let err = ExtractionError::ExtractionFailed {
            last: Box::new(ExtractionError::TransientProvider("HTTP 500".into())),
        };
        assert_eq!(err.kind(), ErrorKind::ExtractionFailed);
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(ErrorKind::TimedOut.as_code(), "TIMED_OUT");
        assert_eq!(ErrorKind::Input.to_string(), "INPUT_ERROR");
        let json = serde_json::to_string(&ErrorKind::ResourceUnavailable).unwrap();
        assert_eq!(json, "\"resource_unavailable\"");
    }
}
