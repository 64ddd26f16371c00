//! Embedded (in-process) OCR.
//!
//! `EmbeddedOcrEngine` walks an ordered, immutable list of candidate
//! language-data sources on every call and hands the image to a recognition
//! backend with the first source whose data actually loads. The Tesseract
//! backend is compiled behind the `ocr` feature.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::types::{OcrEngine, OcrOutput, ProgressSink};
use super::ExtractionError;

/// Timeout for downloading one language data file.
const RESOURCE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

// ═══════════════════════════════════════════════════════════
// Resource sources
// ═══════════════════════════════════════════════════════════

/// Where language data (`<lang>.traineddata`) can be loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSource {
    /// A local tessdata directory.
    Directory(PathBuf),
    /// A base URL serving `<lang>.traineddata`, downloaded into the cache.
    Remote(String),
}

impl ResourceSource {
    /// `http(s)://` entries are remote, anything else is a directory.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Self::Remote(raw.trim_end_matches('/').to_string())
        } else {
            Self::Directory(PathBuf::from(raw))
        }
    }
}

impl fmt::Display for ResourceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory(dir) => write!(f, "dir:{}", dir.display()),
            Self::Remote(url) => write!(f, "url:{url}"),
        }
    }
}

/// Resolves a tessdata directory for a language from candidate sources,
/// trying each in order until one provides every requested language file.
pub struct ResourceLocator {
    sources: Vec<ResourceSource>,
    cache_dir: PathBuf,
}

impl ResourceLocator {
    pub fn new(sources: Vec<ResourceSource>, cache_dir: PathBuf) -> Self {
        Self { sources, cache_dir }
    }

    pub fn sources(&self) -> &[ResourceSource] {
        &self.sources
    }

    /// Blocking: remote sources download over HTTP. Call from a blocking context.
    pub fn locate(&self, lang: &str) -> Result<PathBuf, ExtractionError> {
        self.load_with(lang, |dir| Ok(dir.to_path_buf()))
    }

    /// Resolve each source in order and hand its directory to `load`.
    ///
    /// A source that cannot be resolved, or whose data `load` rejects with
    /// `ResourceUnavailable`, is skipped in favour of the next one. Any other
    /// error from `load` is returned as-is.
    pub fn load_with<T, F>(&self, lang: &str, mut load: F) -> Result<T, ExtractionError>
    where
        F: FnMut(&Path) -> Result<T, ExtractionError>,
    {
        let files = traineddata_files(lang)?;
        let mut failures = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            let attempt = match source {
                ResourceSource::Directory(dir) => locate_in_directory(dir, &files),
                ResourceSource::Remote(base) => self.fetch_remote(base, &files),
            };
            let dir = match attempt {
                Ok(dir) => dir,
                Err(reason) => {
                    tracing::warn!(source = %source, lang, reason = %reason, "OCR resource source failed, trying next");
                    failures.push(format!("{source}: {reason}"));
                    continue;
                }
            };

            match load(&dir) {
                Ok(loaded) => {
                    tracing::debug!(source = %source, lang, "OCR resources loaded");
                    return Ok(loaded);
                }
                Err(ExtractionError::ResourceUnavailable(reason)) => {
                    tracing::warn!(source = %source, lang, reason = %reason, "OCR resources failed to load, trying next");
                    failures.push(format!("{source}: {reason}"));
                }
                Err(other) => return Err(other),
            }
        }

        if failures.is_empty() {
            failures.push("no sources configured".into());
        }
        Err(ExtractionError::ResourceUnavailable(format!(
            "{lang}: {}",
            failures.join("; ")
        )))
    }

    fn fetch_remote(&self, base: &str, files: &[String]) -> Result<PathBuf, String> {
        std::fs::create_dir_all(&self.cache_dir)
            .map_err(|e| format!("cannot create cache dir {}: {e}", self.cache_dir.display()))?;

        let missing: Vec<&String> = files
            .iter()
            .filter(|f| !self.cache_dir.join(f).is_file())
            .collect();
        if missing.is_empty() {
            return Ok(self.cache_dir.clone());
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(RESOURCE_DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| format!("HTTP client error: {e}"))?;

        for file in missing {
            let url = format!("{base}/{file}");
            let response = client
                .get(&url)
                .send()
                .map_err(|e| format!("GET {url} failed: {e}"))?;
            if !response.status().is_success() {
                return Err(format!("GET {url} returned {}", response.status()));
            }
            let bytes = response
                .bytes()
                .map_err(|e| format!("reading {url} failed: {e}"))?;
            if bytes.is_empty() {
                return Err(format!("GET {url} returned an empty body"));
            }

            // Write then rename so a partial download is never picked up as cached.
            let partial = self.cache_dir.join(format!("{file}.part"));
            std::fs::write(&partial, &bytes).map_err(|e| format!("cache write failed: {e}"))?;
            std::fs::rename(&partial, self.cache_dir.join(file))
                .map_err(|e| format!("cache rename failed: {e}"))?;

            tracing::info!(url = %url, size = bytes.len(), "Downloaded OCR language data");
        }

        Ok(self.cache_dir.clone())
    }
}

/// `eng+fra` → `["eng.traineddata", "fra.traineddata"]`.
fn traineddata_files(lang: &str) -> Result<Vec<String>, ExtractionError> {
    let codes: Vec<&str> = lang.split('+').map(str::trim).collect();
    let valid = |c: &&str| {
        !c.is_empty() && c.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    };
    if codes.is_empty() || !codes.iter().all(valid) {
        return Err(ExtractionError::Input(format!("Invalid OCR language code: {lang:?}")));
    }
    Ok(codes.iter().map(|c| format!("{c}.traineddata")).collect())
}

fn locate_in_directory(dir: &Path, files: &[String]) -> Result<PathBuf, String> {
    if !dir.is_dir() {
        return Err("directory does not exist".into());
    }
    match files.iter().find(|f| !dir.join(f).is_file()) {
        Some(missing) => Err(format!("{missing} not found")),
        None => Ok(dir.to_path_buf()),
    }
}

// ═══════════════════════════════════════════════════════════
// Recognition backends
// ═══════════════════════════════════════════════════════════

/// Runs recognition once language data has been located.
pub trait OcrBackend: Send + Sync {
    fn recognize(
        &self,
        tessdata_dir: &Path,
        image_bytes: &[u8],
        lang: &str,
    ) -> Result<OcrOutput, ExtractionError>;
}

/// Tesseract OCR backend.
#[cfg(feature = "ocr")]
pub struct TesseractBackend;

#[cfg(feature = "ocr")]
impl OcrBackend for TesseractBackend {
    fn recognize(
        &self,
        tessdata_dir: &Path,
        image_bytes: &[u8],
        lang: &str,
    ) -> Result<OcrOutput, ExtractionError> {
        let tessdata_str = tessdata_dir
            .to_str()
            .ok_or_else(|| ExtractionError::ResourceUnavailable("Invalid tessdata path".into()))?;

        let tess = tesseract::Tesseract::new(Some(tessdata_str), Some(lang))
            .map_err(|e| ExtractionError::ResourceUnavailable(format!("Tesseract init: {e:?}")))?;

        let mut tess = tess
            .set_image_from_mem(image_bytes)
            .map_err(|e| ExtractionError::OcrProcessing(format!("{e:?}")))?;

        let text = tess
            .get_text()
            .map_err(|e| ExtractionError::OcrProcessing(format!("{e:?}")))?;

        let confidence = tess.mean_text_conf().max(0) as f32;

        // Word-level confidences via TSV; fall back to the page mean per word.
        let block_confidences = match tess.get_tsv_text(0) {
            Ok(tsv) => parse_tsv_word_confidences(&tsv),
            Err(_) => text.split_whitespace().map(|_| confidence).collect(),
        };

        Ok(OcrOutput {
            text,
            confidence,
            block_confidences,
        })
    }
}

/// Build the default backend for this build, if any.
pub fn default_backend() -> Option<Box<dyn OcrBackend>> {
    #[cfg(feature = "ocr")]
    {
        Some(Box::new(TesseractBackend))
    }
    #[cfg(not(feature = "ocr"))]
    {
        None
    }
}

/// Parse Tesseract TSV output into per-word confidences (0-100).
/// TSV columns: level page_num block_num par_num line_num word_num left top width height conf text
/// Level 5 = individual word entries. Words Tesseract could not score (-1) are dropped.
pub fn parse_tsv_word_confidences(tsv: &str) -> Vec<f32> {
    let mut results = Vec::new();

    for line in tsv.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 12 {
            continue;
        }

        // Header row and non-word levels fail here
        let Ok(5) = fields[0].parse::<i32>() else {
            continue;
        };

        let conf: f32 = match fields[10].parse() {
            Ok(c) => c,
            Err(_) => continue,
        };
        if conf < 0.0 || fields[11].trim().is_empty() {
            continue;
        }

        results.push(conf.min(100.0));
    }

    results
}

// ═══════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════

/// Local OCR engine: resource resolution followed by recognition.
pub struct EmbeddedOcrEngine {
    locator: ResourceLocator,
    backend: Box<dyn OcrBackend>,
}

impl EmbeddedOcrEngine {
    pub fn new(locator: ResourceLocator, backend: Box<dyn OcrBackend>) -> Self {
        Self { locator, backend }
    }
}

impl OcrEngine for EmbeddedOcrEngine {
    fn ocr_image(
        &self,
        image_bytes: &[u8],
        lang: &str,
        progress: &dyn ProgressSink,
    ) -> Result<OcrOutput, ExtractionError> {
        progress.report("loading_resources", 0.0);
        let mut reported = false;
        let output = self.locator.load_with(lang, |tessdata| {
            if !reported {
                progress.report("recognizing", 0.1);
                reported = true;
            }
            self.backend.recognize(tessdata, image_bytes, lang)
        })?;

        progress.report("recognizing", 1.0);
        tracing::debug!(
            lang,
            chars = output.text.len(),
            confidence = output.confidence,
            "Local OCR complete"
        );
        Ok(output)
    }
}

// ── Mocks for testing ─────────────────────────────────────

/// Mock OCR engine for unit testing without Tesseract.
pub struct MockOcrEngine {
    pub text: String,
    pub confidence: f32,
    calls: AtomicUsize,
}

impl MockOcrEngine {
    /// `confidence` is on the 0-100 scale.
    pub fn new(text: &str, confidence: f32) -> Self {
        Self {
            text: text.to_string(),
            confidence,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OcrEngine for MockOcrEngine {
    fn ocr_image(
        &self,
        _image_bytes: &[u8],
        _lang: &str,
        progress: &dyn ProgressSink,
    ) -> Result<OcrOutput, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        progress.report("recognizing", 1.0);
        Ok(OcrOutput {
            text: self.text.clone(),
            confidence: self.confidence,
            block_confidences: self.text.split_whitespace().map(|_| self.confidence).collect(),
        })
    }
}

/// Backend that echoes the tessdata directory it was given.
pub struct MockOcrBackend;

impl OcrBackend for MockOcrBackend {
    fn recognize(
        &self,
        tessdata_dir: &Path,
        _image_bytes: &[u8],
        lang: &str,
    ) -> Result<OcrOutput, ExtractionError> {
        Ok(OcrOutput {
            text: format!("{lang} via {}", tessdata_dir.display()),
            confidence: 88.0,
            block_confidences: vec![88.0],
        })
    }
}
