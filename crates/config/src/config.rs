//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Values parsed but are inconsistent with each other
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Remote source configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    /// Base address of the comic source. Changing it invalidates the metadata cache.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Timeout applied to every network request, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Base address of the MangaDex API used for title enrichment
    #[serde(default = "default_mangadex_url")]
    pub mangadex_url: String,
    /// Whether to enrich titles with MangaDex cross references
    #[serde(default = "default_true")]
    pub enrich: bool,
}

fn default_base_url() -> String {
    "https://toonkor429.com".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/58.0.3029.110 Safari/537.3".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_mangadex_url() -> String {
    "https://api.mangadex.org".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
            mangadex_url: default_mangadex_url(),
            enrich: default_true(),
        }
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Root for downloaded and translated chapters
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory holding one JSON document per library title
    #[serde(default = "default_library_dir")]
    pub library_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_library_dir() -> PathBuf {
    PathBuf::from("data/library")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            library_dir: default_library_dir(),
        }
    }
}

/// Page download configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadConfig {
    /// Concurrent page fetches per chapter (0 = auto-derive)
    #[serde(default)]
    pub page_concurrency: u32,
    /// Extra attempts for a single page before the chapter fails
    #[serde(default = "default_page_retries")]
    pub page_retries: u32,
}

fn default_page_retries() -> u32 {
    1
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            page_concurrency: 0,
            page_retries: default_page_retries(),
        }
    }
}

/// Text rendering options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderConfig {
    /// Font file used for typesetting
    #[serde(default)]
    pub font: Option<PathBuf>,
    /// Draw an outline around rendered glyphs
    #[serde(default = "default_true")]
    pub outline: bool,
    #[serde(default = "default_min_font_size")]
    pub min_font_size: u32,
    #[serde(default = "default_max_font_size")]
    pub max_font_size: u32,
    /// Upper-case translated text before rendering
    #[serde(default = "default_true")]
    pub uppercase: bool,
}

fn default_min_font_size() -> u32 {
    12
}

fn default_max_font_size() -> u32 {
    40
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            font: None,
            outline: default_true(),
            min_font_size: default_min_font_size(),
            max_font_size: default_max_font_size(),
            uppercase: default_true(),
        }
    }
}

/// Optional export trees written next to the translated images
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExportConfig {
    #[serde(default)]
    pub raw_text: bool,
    #[serde(default)]
    pub translated_text: bool,
    #[serde(default)]
    pub cleaned_images: bool,
}

/// Translation pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    #[serde(default = "default_source_lang")]
    pub source_lang: String,
    #[serde(default = "default_target_lang")]
    pub target_lang: String,
    /// Compute device handed to the model factory ("cpu", "cuda", ...)
    #[serde(default = "default_device")]
    pub device: String,
    /// Model files backing the text detector
    #[serde(default)]
    pub detector_models: Vec<PathBuf>,
    /// Selected inpainter kind
    #[serde(default = "default_inpainter")]
    pub inpainter: String,
    /// Extra context passed to the translator with every image
    #[serde(default)]
    pub extra_context: String,
    /// Output archive extension per input archive extension
    #[serde(default = "default_archive_formats")]
    pub archive_formats: BTreeMap<String, String>,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

fn default_source_lang() -> String {
    "Korean".to_string()
}

fn default_target_lang() -> String {
    "English".to_string()
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_inpainter() -> String {
    "lama".to_string()
}

fn default_archive_formats() -> BTreeMap<String, String> {
    [
        ("cbz", "cbz"),
        ("zip", "zip"),
        ("cbr", "cbz"),
        ("rar", "cbz"),
        ("cb7", "cbz"),
        ("7z", "cbz"),
    ]
    .into_iter()
    .map(|(from, to)| (from.to_string(), to.to_string()))
    .collect()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_lang: default_source_lang(),
            target_lang: default_target_lang(),
            device: default_device(),
            detector_models: Vec::new(),
            inpainter: default_inpainter(),
            extra_context: String::new(),
            archive_formats: default_archive_formats(),
            render: RenderConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

/// Pipeline engine handshake configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    /// Ready probes sent before giving up on the engine
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    /// How long to wait for each probe reply, in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_probe_attempts() -> u32 {
    5
}

fn default_probe_timeout_ms() -> u64 {
    500
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            probe_attempts: default_probe_attempts(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// Progress bus configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
    /// Buffered events per topic before slow subscribers start lagging
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

fn default_bus_capacity() -> usize {
    1024
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
}

fn default_metrics_addr() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            addr: default_metrics_addr(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - TOONKOR_BASE_URL -> source.base_url
    /// - TOONKOR_DATA_DIR -> storage.data_dir
    /// - TOONKOR_LIBRARY_DIR -> storage.library_dir
    /// - DOWNLOAD_PAGE_CONCURRENCY -> download.page_concurrency
    /// - DOWNLOAD_PAGE_RETRIES -> download.page_retries
    /// - PIPELINE_DEVICE -> pipeline.device
    /// - PIPELINE_SOURCE_LANG -> pipeline.source_lang
    /// - PIPELINE_TARGET_LANG -> pipeline.target_lang
    /// - PIPELINE_INPAINTER -> pipeline.inpainter
    /// - SOURCE_ENRICH -> source.enrich
    /// - METRICS_ADDR -> metrics.addr
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("TOONKOR_BASE_URL") {
            if !val.trim().is_empty() {
                self.source.base_url = val.trim().trim_end_matches('/').to_string();
            }
        }

        if let Ok(val) = env::var("TOONKOR_DATA_DIR") {
            if !val.is_empty() {
                self.storage.data_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("TOONKOR_LIBRARY_DIR") {
            if !val.is_empty() {
                self.storage.library_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("DOWNLOAD_PAGE_CONCURRENCY") {
            if let Ok(workers) = val.parse::<u32>() {
                self.download.page_concurrency = workers;
            }
        }

        if let Ok(val) = env::var("DOWNLOAD_PAGE_RETRIES") {
            if let Ok(retries) = val.parse::<u32>() {
                self.download.page_retries = retries;
            }
        }

        if let Ok(val) = env::var("PIPELINE_DEVICE") {
            if !val.is_empty() {
                self.pipeline.device = val;
            }
        }

        if let Ok(val) = env::var("PIPELINE_SOURCE_LANG") {
            if !val.is_empty() {
                self.pipeline.source_lang = val;
            }
        }

        if let Ok(val) = env::var("PIPELINE_TARGET_LANG") {
            if !val.is_empty() {
                self.pipeline.target_lang = val;
            }
        }

        if let Ok(val) = env::var("PIPELINE_INPAINTER") {
            if !val.is_empty() {
                self.pipeline.inpainter = val;
            }
        }

        if let Ok(val) = env::var("SOURCE_ENRICH") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.source.enrich = true,
                "false" | "0" | "no" => self.source.enrich = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("METRICS_ADDR") {
            if !val.is_empty() {
                self.metrics.addr = val;
            }
        }
    }

    /// Check cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let render = &self.pipeline.render;
        if render.min_font_size == 0 || render.min_font_size > render.max_font_size {
            return Err(ConfigError::Invalid(format!(
                "font size bounds {}..{} are not a valid range",
                render.min_font_size, render.max_font_size
            )));
        }
        if self.bus.capacity == 0 {
            return Err(ConfigError::Invalid("bus.capacity must be at least 1".to_string()));
        }
        if self.bridge.probe_attempts == 0 {
            return Err(ConfigError::Invalid(
                "bridge.probe_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        for key in [
            "TOONKOR_BASE_URL",
            "TOONKOR_DATA_DIR",
            "TOONKOR_LIBRARY_DIR",
            "DOWNLOAD_PAGE_CONCURRENCY",
            "DOWNLOAD_PAGE_RETRIES",
            "PIPELINE_DEVICE",
            "PIPELINE_SOURCE_LANG",
            "PIPELINE_TARGET_LANG",
            "PIPELINE_INPAINTER",
            "SOURCE_ENRICH",
            "METRICS_ADDR",
        ] {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            concurrency in 0u32..64,
            retries in 0u32..5,
            min_font in 1u32..30,
            extra in 0u32..30,
            enrich in proptest::bool::ANY,
            cleaned in proptest::bool::ANY,
            device in "(cpu|cuda|mps)",
        ) {
            let toml_str = format!(
                r#"
[source]
base_url = "https://toonkor.example"
enrich = {}

[storage]
data_dir = "/srv/toonkor"

[download]
page_concurrency = {}
page_retries = {}

[pipeline]
device = "{}"

[pipeline.render]
min_font_size = {}
max_font_size = {}

[pipeline.export]
cleaned_images = {}
"#,
                enrich,
                concurrency,
                retries,
                device,
                min_font,
                min_font + extra,
                cleaned,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(&config.source.base_url, "https://toonkor.example");
            prop_assert_eq!(config.source.enrich, enrich);
            prop_assert_eq!(&config.storage.data_dir, &PathBuf::from("/srv/toonkor"));
            prop_assert_eq!(config.download.page_concurrency, concurrency);
            prop_assert_eq!(config.download.page_retries, retries);
            prop_assert_eq!(&config.pipeline.device, &device);
            prop_assert_eq!(config.pipeline.render.min_font_size, min_font);
            prop_assert_eq!(config.pipeline.render.max_font_size, min_font + extra);
            prop_assert_eq!(config.pipeline.export.cleaned_images, cleaned);
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_env_overrides_page_concurrency(
            initial in 0u32..32,
            override_workers in 0u32..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[download]\npage_concurrency = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("DOWNLOAD_PAGE_CONCURRENCY", override_workers.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.download.page_concurrency, override_workers);
        }

        #[test]
        fn prop_env_overrides_enrich(
            initial in proptest::bool::ANY,
            override_enrich in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[source]\nenrich = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("SOURCE_ENRICH", override_enrich.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.source.enrich, override_enrich);
        }
    }

    #[test]
    fn test_env_overrides_strings() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("TOONKOR_BASE_URL", "https://toonkor430.com/");
        env::set_var("PIPELINE_DEVICE", "cuda");
        env::set_var("PIPELINE_INPAINTER", "aot");
        env::set_var("TOONKOR_DATA_DIR", "/tmp/toonkor");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.source.base_url, "https://toonkor430.com");
        assert_eq!(config.pipeline.device, "cuda");
        assert_eq!(config.pipeline.inpainter, "aot");
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/toonkor"));
    }

    #[test]
    fn test_invalid_enrich_value_keeps_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("SOURCE_ENRICH", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert!(config.source.enrich);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.source.base_url, "https://toonkor429.com");
        assert_eq!(config.source.request_timeout_secs, 30);
        assert_eq!(config.storage.data_dir, PathBuf::from("data"));
        assert_eq!(config.download.page_concurrency, 0);
        assert_eq!(config.download.page_retries, 1);
        assert_eq!(config.pipeline.device, "cpu");
        assert_eq!(config.pipeline.inpainter, "lama");
        assert_eq!(config.pipeline.render.min_font_size, 12);
        assert_eq!(config.pipeline.render.max_font_size, 40);
        assert!(!config.pipeline.export.raw_text);
        assert_eq!(config.bridge.probe_attempts, 5);
        assert_eq!(config.bus.capacity, 1024);
        assert_eq!(config.metrics.addr, "127.0.0.1:7878");
        assert_eq!(
            config.pipeline.archive_formats.get("cbr").map(String::as_str),
            Some("cbz")
        );
    }

    #[test]
    fn test_partial_archive_mapping_replaces_defaults() {
        let toml_str = r#"
[pipeline.archive_formats]
cbz = "zip"
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");
        assert_eq!(config.pipeline.archive_formats.len(), 1);
        assert_eq!(config.pipeline.archive_formats["cbz"], "zip");
    }

    #[test]
    fn test_validate_rejects_inverted_font_bounds() {
        let mut config = Config::default();
        config.pipeline.render.min_font_size = 50;
        config.pipeline.render.max_font_size = 20;

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("50..20"));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.bus.capacity = 0;
        assert!(config.validate().is_err());
    }
}
