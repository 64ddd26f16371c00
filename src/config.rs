use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::pipeline::extraction::async_job::{AsyncJobSettings, DEFAULT_MAX_RESULT_PAGES};
use crate::pipeline::extraction::ocr::ResourceSource;

/// Application-level constants
pub const APP_NAME: &str = "StudyScan";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix shared by every configuration variable.
pub const ENV_PREFIX: &str = "STUDYSCAN_";

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "studyscan_lib=info,tower_http=info"
}

/// Get the application data directory.
/// ~/StudyScan/ when a home directory exists, else ./StudyScan.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{key}: must be greater than zero")]
    NotPositive { key: String },
}

// ═══════════════════════════════════════════════════════════
// Extraction tunables
// ═══════════════════════════════════════════════════════════

/// Pipeline tunables handed to the orchestrator at construction.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionSettings {
    /// Ceiling on the base64-encoded sync cloud payload, in bytes.
    pub sync_payload_limit: usize,
    /// Multi-page results with fewer non-whitespace characters escalate.
    pub min_useful_chars: usize,
    /// Render scale for rasterised PDF pages.
    pub raster_scale: f32,
    /// Tesseract language code, e.g. `eng` or `eng+fra`.
    pub ocr_language: String,
    pub poll_interval_secs: u64,
    pub poll_max_attempts: u32,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            sync_payload_limit: 10 * 1024 * 1024,
            min_useful_chars: 50,
            raster_scale: 2.0,
            ocr_language: "eng".into(),
            poll_interval_secs: 10,
            poll_max_attempts: 60,
        }
    }
}

impl ExtractionSettings {
    pub fn async_job(&self) -> AsyncJobSettings {
        AsyncJobSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_attempts: self.poll_max_attempts,
            max_result_pages: DEFAULT_MAX_RESULT_PAGES,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Application config
// ═══════════════════════════════════════════════════════════

/// Everything the server needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    /// `filePath` requests must resolve inside this directory.
    pub upload_root: PathBuf,
    pub max_upload_bytes: usize,
    pub extraction: ExtractionSettings,
    /// Ordered OCR resource candidates. Empty means `<data_dir>/tessdata`.
    pub ocr_sources: Vec<ResourceSource>,
    pub vision_endpoint: Option<String>,
    pub vision_api_key: Option<String>,
    pub async_ocr_endpoint: Option<String>,
    pub async_ocr_api_key: Option<String>,
    pub staging_endpoint: Option<String>,
    pub staging_bucket: String,
    pub staging_dir: Option<PathBuf>,
    pub request_timeout: Duration,
    pub extraction_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = app_data_dir();
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            upload_root: data_dir.join("uploads"),
            data_dir,
            max_upload_bytes: 50 * 1024 * 1024,
            extraction: ExtractionSettings::default(),
            ocr_sources: Vec::new(),
            vision_endpoint: None,
            vision_api_key: None,
            async_ocr_endpoint: None,
            async_ocr_api_key: None,
            staging_endpoint: None,
            staging_bucket: "studyscan-staging".into(),
            staging_dir: None,
            request_timeout: Duration::from_secs(60),
            extraction_timeout: Duration::from_secs(900),
        }
    }
}

impl AppConfig {
    /// Read `STUDYSCAN_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or blank keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| -> Option<(String, String)> {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (key, v))
        };

        let mut config = Self::default();

        if let Some((_, value)) = get("DATA_DIR") {
            config.data_dir = PathBuf::from(value);
            config.upload_root = config.data_dir.join("uploads");
        }
        if let Some((_, value)) = get("UPLOAD_ROOT") {
            config.upload_root = PathBuf::from(value);
        }
        if let Some((key, value)) = get("BIND_ADDR") {
            config.bind_addr = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = parse_positive(&key, &value)?;
        }

        let extraction = &mut config.extraction;
        if let Some((key, value)) = get("SYNC_PAYLOAD_LIMIT") {
            extraction.sync_payload_limit = parse_positive(&key, &value)?;
        }
        if let Some((key, value)) = get("MIN_USEFUL_CHARS") {
            extraction.min_useful_chars = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("RASTER_SCALE") {
            let scale: f32 = parse(&key, &value)?;
            if !(scale.is_finite() && scale > 0.0) {
                return Err(ConfigError::NotPositive { key });
            }
            extraction.raster_scale = scale;
        }
        if let Some((_, value)) = get("OCR_LANGUAGE") {
            extraction.ocr_language = value;
        }
        if let Some((key, value)) = get("POLL_INTERVAL_SECS") {
            extraction.poll_interval_secs = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("POLL_MAX_ATTEMPTS") {
            extraction.poll_max_attempts = parse_positive(&key, &value)?;
        }

        if let Some((_, value)) = get("OCR_SOURCES") {
            config.ocr_sources = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ResourceSource::parse)
                .collect();
        }

        config.vision_endpoint = get("VISION_ENDPOINT").map(|(_, v)| v);
        config.vision_api_key = get("VISION_API_KEY").map(|(_, v)| v);
        config.async_ocr_endpoint = get("ASYNC_OCR_ENDPOINT").map(|(_, v)| v);
        config.async_ocr_api_key = get("ASYNC_OCR_API_KEY").map(|(_, v)| v);
        config.staging_endpoint = get("STAGING_ENDPOINT").map(|(_, v)| v);
        if let Some((_, value)) = get("STAGING_BUCKET") {
            config.staging_bucket = value;
        }
        config.staging_dir = get("STAGING_DIR").map(|(_, v)| PathBuf::from(v));

        if let Some((key, value)) = get("REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(parse_positive(&key, &value)?);
        }
        if let Some((key, value)) = get("EXTRACTION_TIMEOUT_SECS") {
            config.extraction_timeout = Duration::from_secs(parse_positive(&key, &value)?);
        }

        Ok(config)
    }

    pub fn materials_dir(&self) -> PathBuf {
        self.data_dir.join("materials")
    }

    pub fn ocr_cache_dir(&self) -> PathBuf {
        self.data_dir.join("ocr-cache")
    }

    /// Configured OCR sources, or the bundled tessdata directory.
    pub fn effective_ocr_sources(&self) -> Vec<ResourceSource> {
        if self.ocr_sources.is_empty() {
            vec![ResourceSource::Directory(self.data_dir.join("tessdata"))]
        } else {
            self.ocr_sources.clone()
        }
    }

    /// Local staging directory when no HTTP object store is configured.
    pub fn effective_staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("staging"))
    }

    /// Largest accepted request body: the upload cap after base64 inflation,
    /// plus room for the JSON envelope.
    pub fn max_request_body_bytes(&self) -> usize {
        self.max_upload_bytes
            .saturating_add(2)
            .saturating_div(3)
            .saturating_mul(4)
            .saturating_add(64 * 1024)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_positive<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialOrd,
    T::Err: std::fmt::Display,
{
    let parsed: T = parse(key, value)?;
    if parsed <= T::default() {
        return Err(ConfigError::NotPositive {
            key: key.to_string(),
        });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn app_data_dir_ends_with_app_name() {
        assert!(app_data_dir().ends_with("StudyScan"));
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.1.0");
    }

    #[test]
    fn defaults_without_environment() {
        let config = AppConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8787");
        assert_eq!(config.max_upload_bytes, 50 * 1024 * 1024);
        assert_eq!(config.extraction.sync_payload_limit, 10 * 1024 * 1024);
        assert_eq!(config.extraction.poll_interval_secs, 10);
        assert_eq!(config.extraction.poll_max_attempts, 60);
        assert_eq!(config.extraction.min_useful_chars, 50);
        assert_eq!(config.extraction.ocr_language, "eng");
        assert_eq!(config.extraction_timeout, Duration::from_secs(900));
        assert!(config.vision_endpoint.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = AppConfig::from_lookup(lookup(&[
            ("STUDYSCAN_BIND_ADDR", "0.0.0.0:9000"),
            ("STUDYSCAN_DATA_DIR", "/srv/studyscan"),
            ("STUDYSCAN_POLL_MAX_ATTEMPTS", "5"),
            ("STUDYSCAN_RASTER_SCALE", "1.5"),
            ("STUDYSCAN_OCR_SOURCES", "/opt/tessdata, https://assets.example.com/tessdata"),
            ("STUDYSCAN_VISION_ENDPOINT", "https://vision.example.com"),
            ("STUDYSCAN_STAGING_BUCKET", "  scans  "),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.upload_root, PathBuf::from("/srv/studyscan/uploads"));
        assert_eq!(config.materials_dir(), PathBuf::from("/srv/studyscan/materials"));
        assert_eq!(config.extraction.poll_max_attempts, 5);
        assert_eq!(config.extraction.raster_scale, 1.5);
        assert_eq!(
            config.ocr_sources,
            vec![
                ResourceSource::Directory(PathBuf::from("/opt/tessdata")),
                ResourceSource::Remote("https://assets.example.com/tessdata".into()),
            ]
        );
        assert_eq!(config.vision_endpoint.as_deref(), Some("https://vision.example.com"));
        assert_eq!(config.staging_bucket, "scans");
    }

    #[test]
    fn blank_values_keep_defaults() {
        let config = AppConfig::from_lookup(lookup(&[("STUDYSCAN_VISION_API_KEY", "   ")])).unwrap();
        assert!(config.vision_api_key.is_none());
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = AppConfig::from_lookup(lookup(&[("STUDYSCAN_POLL_MAX_ATTEMPTS", "many")])).unwrap_err();
        assert!(err.to_string().contains("STUDYSCAN_POLL_MAX_ATTEMPTS"));

        let err = AppConfig::from_lookup(lookup(&[("STUDYSCAN_MAX_UPLOAD_BYTES", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::NotPositive { .. }));

        let err = AppConfig::from_lookup(lookup(&[("STUDYSCAN_RASTER_SCALE", "-2")])).unwrap_err();
        assert!(matches!(err, ConfigError::NotPositive { .. }));
    }

    #[test]
    fn fallback_paths_derive_from_data_dir() {
        let config = AppConfig::from_lookup(lookup(&[("STUDYSCAN_DATA_DIR", "/data")])).unwrap();
        assert_eq!(
            config.effective_ocr_sources(),
            vec![ResourceSource::Directory(PathBuf::from("/data/tessdata"))]
        );
        assert_eq!(config.effective_staging_dir(), PathBuf::from("/data/staging"));
        assert_eq!(config.ocr_cache_dir(), PathBuf::from("/data/ocr-cache"));
    }

    #[test]
    fn async_job_settings_follow_extraction_settings() {
        let settings = ExtractionSettings {
            poll_interval_secs: 3,
            poll_max_attempts: 7,
            ..ExtractionSettings::default()
        };
        let job = settings.async_job();
        assert_eq!(job.poll_interval, Duration::from_secs(3));
        assert_eq!(job.max_attempts, 7);
    }

    #[test]
    fn request_body_limit_covers_base64_upload() {
        let config = AppConfig {
            max_upload_bytes: 3,
            ..AppConfig::default()
        };
        assert_eq!(config.max_request_body_bytes(), 4 + 64 * 1024);
    }
}
