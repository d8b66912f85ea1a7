//! Startup checks module
//!
//! Preflight checks run before the collector starts taking jobs:
//! - the data and library directories are writable
//! - the source base url is an absolute http(s) url
//! - the pipeline device is one the model backends understand
//! - the configured font exists

use crate::config::Config;
use reqwest::Url;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Device families accepted by the model factory. `cuda` and `mps` may carry
/// an ordinal (`cuda:1`).
const KNOWN_DEVICES: &[&str] = &["cpu", "cuda", "mps", "directml"];

const PROBE_FILE: &str = ".write-probe";

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Directory {path} is not writable: {source}")]
    NotWritable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid source base url: {0}")]
    InvalidBaseUrl(String),

    #[error("Unknown pipeline device: {0}")]
    UnknownDevice(String),

    #[error("Font file not found: {0}")]
    FontMissing(PathBuf),
}

/// Parse a device string into its family and optional ordinal.
///
/// Returns None for unknown families or malformed ordinals.
pub fn parse_device(device: &str) -> Option<(&'static str, Option<u32>)> {
    let lower = device.trim().to_ascii_lowercase();
    let (family, ordinal) = match lower.split_once(':') {
        Some((family, ordinal)) => (family.to_string(), Some(ordinal.parse::<u32>().ok()?)),
        None => (lower, None),
    };
    let family = KNOWN_DEVICES.iter().find(|&&known| known == family)?;
    if ordinal.is_some() && *family == "cpu" {
        return None;
    }
    Some((family, ordinal))
}

pub fn check_device(device: &str) -> Result<(), StartupError> {
    parse_device(device)
        .map(|_| ())
        .ok_or_else(|| StartupError::UnknownDevice(device.to_string()))
}

/// Check that a source base url is an absolute http(s) url with a host
pub fn check_base_url(url: &str) -> Result<(), StartupError> {
    let parsed = Url::parse(url).map_err(|e| StartupError::InvalidBaseUrl(format!("{}: {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(StartupError::InvalidBaseUrl(url.to_string()));
    }
    Ok(())
}

/// Create `dir` if needed and verify a file can be written into it
pub fn check_dir_writable(dir: &Path) -> Result<(), StartupError> {
    let not_writable = |source| StartupError::NotWritable {
        path: dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(not_writable)?;
    let probe = dir.join(PROBE_FILE);
    fs::write(&probe, b"ok").map_err(not_writable)?;
    fs::remove_file(&probe).map_err(not_writable)?;
    Ok(())
}

pub fn check_font(font: Option<&Path>) -> Result<(), StartupError> {
    match font {
        Some(path) if !path.is_file() => Err(StartupError::FontMissing(path.to_path_buf())),
        _ => Ok(()),
    }
}

/// Run all startup checks in order
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_dir_writable(&cfg.storage.data_dir)?;
    check_dir_writable(&cfg.storage.library_dir)?;
    check_base_url(&cfg.source.base_url)?;
    if cfg.source.enrich {
        check_base_url(&cfg.source.mangadex_url)?;
    }
    check_device(&cfg.pipeline.device)?;
    check_font(cfg.pipeline.render.font.as_deref())?;
    info!("startup checks passed");
    Ok(())
}
