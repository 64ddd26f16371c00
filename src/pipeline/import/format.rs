use std::path::Path;

use serde::Serialize;

/// Broad file categories we handle
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Pdf,
    Image,
    Unsupported,
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Image => "image",
            Self::Unsupported => "unsupported",
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported)
    }
}

/// Mime type used when nothing else is known.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Mime types the extraction pipeline accepts.
pub const SUPPORTED_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "image/jpeg",
    "image/png",
    "image/tiff",
    "image/gif",
    "image/bmp",
    "image/webp",
];

/// Lower-case the essence of a mime type, drop parameters, fold aliases.
pub fn normalize_mime(raw: &str) -> String {
    let essence = raw.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    match essence.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        "image/x-png" => "image/png".to_string(),
        "image/x-ms-bmp" => "image/bmp".to_string(),
        "application/x-pdf" => "application/pdf".to_string(),
        _ => essence,
    }
}

/// Classify a (normalized) mime type.
pub fn categorize(mime_type: &str) -> FileCategory {
    let mime = normalize_mime(mime_type);
    if mime == "application/pdf" {
        FileCategory::Pdf
    } else if SUPPORTED_MIME_TYPES.contains(&mime.as_str()) {
        FileCategory::Image
    } else {
        FileCategory::Unsupported
    }
}

/// Detect a mime type from magic bytes.
/// Extensions can be wrong, so the content decides first.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        // PDF: starts with %PDF
        [0x25, 0x50, 0x44, 0x46, ..] => Some("application/pdf"),
        // JPEG: starts with FF D8 FF
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        // PNG: starts with 89 50 4E 47
        [0x89, 0x50, 0x4E, 0x47, ..] => Some("image/png"),
        // TIFF: little-endian (49 49 2A 00) or big-endian (4D 4D 00 2A)
        [0x49, 0x49, 0x2A, 0x00, ..] | [0x4D, 0x4D, 0x00, 0x2A, ..] => Some("image/tiff"),
        [b'G', b'I', b'F', b'8', ..] => Some("image/gif"),
        [b'B', b'M', ..] if bytes.len() >= 14 => Some("image/bmp"),
        // WEBP: RIFF....WEBP
        _ if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" => {
            Some("image/webp")
        }
        _ => None,
    }
}

/// Resolve the mime type of an upload.
///
/// Magic bytes win; then the declared type unless it is empty or generic;
/// then the file extension. Unknown input maps to `application/octet-stream`.
pub fn detect_mime(bytes: &[u8], declared: Option<&str>, file_name: &str) -> String {
    if let Some(sniffed) = sniff_mime(bytes) {
        return sniffed.to_string();
    }

    if let Some(declared) = declared.map(normalize_mime) {
        if !declared.is_empty() && declared != OCTET_STREAM {
            return declared;
        }
    }

    mime_guess::from_path(file_name)
        .first()
        .map(|m| normalize_mime(m.essence_str()))
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

/// Strip path components and cap the length of an uploaded file name.
pub fn sanitize_filename(original: &str) -> String {
    let name = Path::new(original)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");

    let clean: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0'))
        .take(255)
        .collect();

    if clean.is_empty() || clean == "." || clean == ".." {
        "document".to_string()
    } else {
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_known_magic_bytes() {
        assert_eq!(sniff_mime(b"%PDF-1.7\n"), Some("application/pdf"));
        assert_eq!(sniff_mime(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00]), Some("image/jpeg"));
        assert_eq!(sniff_mime(&[0x89, 0x50, 0x4E, 0x47, 0x0D]), Some("image/png"));
        assert_eq!(sniff_mime(&[0x49, 0x49, 0x2A, 0x00]), Some("image/tiff"));
        assert_eq!(sniff_mime(&[0x4D, 0x4D, 0x00, 0x2A]), Some("image/tiff"));
        assert_eq!(sniff_mime(b"GIF89a...."), Some("image/gif"));
        assert_eq!(sniff_mime(b"RIFF\x10\x00\x00\x00WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_mime(b"BM\x00\x00\x00\x00\x00\x00\x00\x00\x36\x00\x00\x00"), Some("image/bmp"));
    }

    #[test]
    fn sniff_unknown_returns_none() {
        assert_eq!(sniff_mime(b""), None);
        assert_eq!(sniff_mime(b"Hello, world"), None);
        assert_eq!(sniff_mime(b"BM"), None);
    }

    #[test]
    fn magic_bytes_override_declared_type() {
        assert_eq!(detect_mime(b"%PDF-1.4", Some("image/jpeg"), "x.jpg"), "application/pdf");
        assert_eq!(detect_mime(b"%PDF-1.4", Some(OCTET_STREAM), "upload"), "application/pdf");
    }

    #[test]
    fn declared_type_used_for_unknown_bytes() {
        assert_eq!(detect_mime(b"????", Some("image/JPG"), "x.pdf"), "image/jpeg");
        assert_eq!(
            detect_mime(b"", Some("application/pdf; charset=binary"), "x"),
            "application/pdf"
        );
        assert_eq!(detect_mime(b"<html>", Some("text/html"), "page.png"), "text/html");
    }

    #[test]
    fn generic_declared_type_falls_through_to_extension() {
        assert_eq!(detect_mime(b"????", Some(OCTET_STREAM), "scan.tiff"), "image/tiff");
        assert_eq!(detect_mime(b"????", Some("  "), "scan.jpg"), "image/jpeg");
    }

    #[test]
    fn extension_is_last_resort() {
        assert_eq!(detect_mime(b"????", None, "scan.png"), "image/png");
        assert_eq!(detect_mime(b"????", None, "mystery"), OCTET_STREAM);
    }

    #[test]
    fn categorize_supported_types() {
        assert_eq!(categorize("application/pdf"), FileCategory::Pdf);
        assert_eq!(categorize("image/webp"), FileCategory::Image);
        assert_eq!(categorize("IMAGE/PNG"), FileCategory::Image);
        assert_eq!(categorize("text/plain"), FileCategory::Unsupported);
        assert_eq!(categorize("image/heic"), FileCategory::Unsupported);
        assert!(!FileCategory::Unsupported.is_supported());
        assert_eq!(FileCategory::Pdf.as_str(), "pdf");
    }

    #[test]
    fn sanitize_strips_path_components() {
        assert_eq!(sanitize_filename("/home/user/../secret/notes.pdf"), "notes.pdf");
        assert_eq!(sanitize_filename("lecture\0.pdf"), "lecture.pdf");
        assert_eq!(sanitize_filename(""), "document");
        assert_eq!(sanitize_filename(".."), "document");
    }

    #[test]
    fn sanitize_limits_length() {
        let long = "a".repeat(400);
        assert_eq!(sanitize_filename(&long).len(), 255);
    }
}
