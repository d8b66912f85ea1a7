//! Remote comic source.
//!
//! [`RemoteSource`] is the seam the cache and downloader talk to.
//! [`ToonkorSource`] implements it over HTTP. Title page scraping is
//! delegated to a pluggable [`TitleParser`]; the page list of a chapter is
//! decoded here because its format is fixed by the reader script.

use crate::models::{ChapterRef, Title};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::RwLock;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use toonkor_collector_config::SourceConfig;
use tracing::debug;

static TOON_IMG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"toon_img\s*=\s*'(.*?)'").expect("valid regex"));
static PAGE_SRC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"src="([^"]*)""#).expect("valid regex"));

/// Error type for remote source operations
#[derive(Debug, Error)]
pub enum SourceError {
    /// Transport level failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status
    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },

    /// Document did not have the expected shape
    #[error("Failed to parse document: {0}")]
    Parse(String),

    /// The title does not exist on the source
    #[error("Title not found: {0}")]
    NotFound(String),

    /// Operation is not available for this source
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    /// Chapter has no source id to build its page url from
    #[error("Chapter {index} has no source id")]
    MissingChapterUrl { index: u32 },
}

/// Operations the collector needs from a comic source.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Live record for a title, including the chapter list.
    async fn fetch_title(&self, title_id: &str) -> Result<Title, SourceError>;

    /// Absolute page image urls of a chapter, in reading order.
    async fn page_urls(&self, title_id: &str, chapter: &ChapterRef)
        -> Result<Vec<String>, SourceError>;

    /// Raw bytes of one page image.
    async fn fetch_page(&self, url: &str) -> Result<Vec<u8>, SourceError>;

    fn base_url(&self) -> String;

    /// Point the source at a new domain. Returns whether the value changed.
    fn set_base_url(&self, url: &str) -> bool;
}

/// Turns a fetched title page into a [`Title`].
pub trait TitleParser: Send + Sync {
    fn parse_title(&self, title_id: &str, document: &str) -> Result<Title, SourceError>;
}

/// Normalize a base url: trimmed, no trailing slash.
pub fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Extract page urls from a chapter reader document.
///
/// The reader embeds the page markup base64 encoded in a `toon_img` script
/// variable; relative `src` values are resolved against `base_url`.
pub fn decode_page_list(document: &str, base_url: &str) -> Result<Vec<String>, SourceError> {
    let encoded = TOON_IMG_RE
        .captures(document)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SourceError::Parse("toon_img script not found".to_string()))?;

    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| SourceError::Parse(format!("toon_img is not base64: {}", e)))?;
    let markup = String::from_utf8(bytes)
        .map_err(|e| SourceError::Parse(format!("toon_img is not utf-8: {}", e)))?;

    let base = normalize_base_url(base_url);
    Ok(PAGE_SRC_RE
        .captures_iter(&markup)
        .filter_map(|c| c.get(1))
        .map(|m| {
            let src = m.as_str();
            if src.starts_with("http") {
                src.to_string()
            } else if src.starts_with('/') {
                format!("{}{}", base, src)
            } else {
                format!("{}/{}", base, src)
            }
        })
        .collect())
}

/// HTTP implementation of [`RemoteSource`] for Toonkor mirrors.
pub struct ToonkorSource {
    client: reqwest::Client,
    base_url: RwLock<String>,
    parser: Option<Arc<dyn TitleParser>>,
}

impl ToonkorSource {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: RwLock::new(normalize_base_url(&config.base_url)),
            parser: None,
        })
    }

    pub fn with_parser(mut self, parser: Arc<dyn TitleParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.read(), path.trim_start_matches('/'))
    }

    async fn get_text(&self, url: &str) -> Result<String, SourceError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(SourceError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl RemoteSource for ToonkorSource {
    async fn fetch_title(&self, title_id: &str) -> Result<Title, SourceError> {
        let parser = self
            .parser
            .as_ref()
            .ok_or(SourceError::Unsupported("no title parser configured"))?;
        let url = self.url_for(title_id);
        debug!(%url, "fetching title page");
        let document = self.get_text(&url).await?;
        let mut title = parser.parse_title(title_id, &document)?;
        title.id = title_id.to_string();
        Ok(title)
    }

    async fn page_urls(
        &self,
        _title_id: &str,
        chapter: &ChapterRef,
    ) -> Result<Vec<String>, SourceError> {
        let source_id = chapter
            .source_id
            .as_deref()
            .ok_or(SourceError::MissingChapterUrl {
                index: chapter.index,
            })?;
        let url = self.url_for(source_id);
        debug!(%url, chapter = chapter.index, "fetching page list");
        let document = self.get_text(&url).await?;
        decode_page_list(&document, &self.base_url())
    }

    async fn fetch_page(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let referer = self.base_url();
        let response = self
            .client
            .get(url)
            .header(reqwest::header::REFERER, referer)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    fn base_url(&self) -> String {
        self.base_url.read().clone()
    }

    fn set_base_url(&self, url: &str) -> bool {
        let url = normalize_base_url(url);
        let mut current = self.base_url.write();
        if *current == url {
            return false;
        }
        *current = url;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader_document(markup: &str) -> String {
        format!(
            "<html><script>var toon_img = '{}';</script></html>",
            STANDARD.encode(markup)
        )
    }

    #[test]
    fn test_decode_page_list_resolves_relative_urls() {
        let markup = r#"<img src="https://cdn.example/1.jpg"><img src="/data/2.jpg"><img src="data/3.png">"#;
        let urls = decode_page_list(&reader_document(markup), "https://toonkor429.com/").unwrap();
        assert_eq!(
            urls,
            vec![
                "https://cdn.example/1.jpg".to_string(),
                "https://toonkor429.com/data/2.jpg".to_string(),
                "https://toonkor429.com/data/3.png".to_string(),
            ]
        );
    }

    #[test]
    fn test_decode_page_list_without_script_fails() {
        let err = decode_page_list("<html></html>", "https://toonkor429.com").unwrap_err();
        assert!(matches!(err, SourceError::Parse(_)));
    }

    #[test]
    fn test_decode_page_list_rejects_bad_base64() {
        let doc = "<script>toon_img = '***';</script>";
        assert!(matches!(
            decode_page_list(doc, "https://toonkor429.com"),
            Err(SourceError::Parse(_))
        ));
    }

    #[test]
    fn test_decode_page_list_no_images_is_empty() {
        let urls = decode_page_list(&reader_document("<p>no pages</p>"), "https://x").unwrap();
        assert!(urls.is_empty());
    }

    #[test]
    fn test_set_base_url_reports_change() {
        let source = ToonkorSource::new(&SourceConfig::default()).unwrap();
        assert_eq!(source.base_url(), "https://toonkor429.com");
        assert!(!source.set_base_url("https://toonkor429.com/"));
        assert!(source.set_base_url("https://toonkor430.com"));
        assert_eq!(source.url_for("/abc_1화.html"), "https://toonkor430.com/abc_1화.html");
    }

    #[tokio::test]
    async fn test_page_urls_needs_source_id() {
        let source = ToonkorSource::new(&SourceConfig::default()).unwrap();
        let err = source
            .page_urls("T1", &ChapterRef::new(4))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::MissingChapterUrl { index: 4 }));
    }

    #[tokio::test]
    async fn test_fetch_title_without_parser_is_unsupported() {
        let source = ToonkorSource::new(&SourceConfig::default()).unwrap();
        assert!(matches!(
            source.fetch_title("T1").await,
            Err(SourceError::Unsupported(_))
        ));
    }
}
