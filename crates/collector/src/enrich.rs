//! MangaDex cross references for titles.
//!
//! Toonkor titles are Korean; MangaDex lists the same series with a `ko`
//! alternative title, which gives us an English title, description and a
//! stable external id.

use crate::models::Title;
use crate::source::{normalize_base_url, SourceError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::time::Duration;
use toonkor_collector_config::SourceConfig;
use tracing::debug;

/// Fields copied from a MangaDex match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrichment {
    /// Korean title the match was found under.
    pub korean_title: String,
    pub en_title: Option<String>,
    pub en_description: Option<String>,
    pub mangadex_id: String,
}

impl Enrichment {
    /// Copy the English fields onto `title`, keeping values it already has.
    pub fn apply_to(&self, title: &mut Title) {
        if title.en_title.is_none() {
            title.en_title = self.en_title.clone();
        }
        if title.en_description.is_none() {
            title.en_description = self.en_description.clone();
        }
        if title.mangadex_id.is_none() {
            title.mangadex_id = Some(self.mangadex_id.clone());
        }
    }
}

/// Adds cross reference fields to a title.
#[async_trait]
pub trait TitleEnricher: Send + Sync {
    /// Returns whether anything on `title` changed.
    async fn enrich(&self, title: &mut Title) -> Result<bool, SourceError>;
}

/// Pull enrichments out of a `/manga` response.
///
/// `data` may be a list or a single object. Entries without a `ko`
/// alternative title are ignored.
pub fn extract_enrichments(response: &Value) -> Vec<Enrichment> {
    let entries: Vec<&Value> = match response.get("data") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(item @ Value::Object(_)) => vec![item],
        _ => Vec::new(),
    };

    entries
        .into_iter()
        .filter_map(|entry| {
            let attributes = entry.get("attributes")?;
            let korean_title = attributes
                .get("altTitles")?
                .as_array()?
                .iter()
                .find_map(|alt| alt.get("ko").and_then(Value::as_str))?;
            let english = |key: &str| {
                attributes
                    .get(key)
                    .and_then(|v| v.get("en"))
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };
            Some(Enrichment {
                korean_title: korean_title.to_string(),
                en_title: english("title"),
                en_description: english("description"),
                mangadex_id: entry.get("id")?.as_str()?.to_string(),
            })
        })
        .collect()
}

/// MangaDex API client with an in-memory cache keyed by Korean title.
pub struct MangadexClient {
    client: reqwest::Client,
    base_url: String,
    cache: DashMap<String, Enrichment>,
}

impl MangadexClient {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: normalize_base_url(&config.mangadex_url),
            cache: DashMap::new(),
        })
    }

    /// Search MangaDex by title. Every match is cached.
    pub async fn search(&self, query: &str) -> Result<Vec<Enrichment>, SourceError> {
        if let Some(hit) = self.cache.get(query) {
            return Ok(vec![hit.clone()]);
        }

        let url = format!("{}/manga", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("title", query)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SourceError::Status {
                url,
                status: response.status().as_u16(),
            });
        }
        let body: Value = response.json().await?;
        let found = extract_enrichments(&body);
        self.remember(&found);
        debug!(query, matches = found.len(), "mangadex search");
        Ok(found)
    }

    fn remember(&self, found: &[Enrichment]) {
        for enrichment in found {
            self.cache
                .insert(enrichment.korean_title.clone(), enrichment.clone());
        }
    }

    pub fn cached(&self, korean_title: &str) -> Option<Enrichment> {
        self.cache.get(korean_title).map(|e| e.clone())
    }
}

#[async_trait]
impl TitleEnricher for MangadexClient {
    async fn enrich(&self, title: &mut Title) -> Result<bool, SourceError> {
        if title.en_title.is_some() && title.mangadex_id.is_some() {
            return Ok(false);
        }
        let found = self.search(&title.title).await?;
        let Some(best) = found
            .iter()
            .find(|e| e.korean_title == title.title)
            .or_else(|| found.first())
        else {
            return Ok(false);
        };
        let before = title.clone();
        best.apply_to(title);
        Ok(*title != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manga(id: &str, ko: Option<&str>, en: &str) -> Value {
        let mut alt = vec![json!({"ja": "ジャ"})];
        if let Some(ko) = ko {
            alt.push(json!({ "ko": ko }));
        }
        json!({
            "id": id,
            "attributes": {
                "title": {"en": en},
                "altTitles": alt,
                "description": {"en": format!("{} description", en)}
            }
        })
    }

    #[test]
    fn test_extract_from_list() {
        let body = json!({"data": [
            manga("m1", Some("나 혼자만 레벨업"), "Solo Leveling"),
            manga("m2", None, "No Korean"),
        ]});
        let found = extract_enrichments(&body);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].korean_title, "나 혼자만 레벨업");
        assert_eq!(found[0].en_title.as_deref(), Some("Solo Leveling"));
        assert_eq!(
            found[0].en_description.as_deref(),
            Some("Solo Leveling description")
        );
        assert_eq!(found[0].mangadex_id, "m1");
    }

    #[test]
    fn test_extract_from_single_object() {
        let body = json!({"data": manga("m3", Some("전지적 독자 시점"), "Omniscient Reader")});
        let found = extract_enrichments(&body);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].mangadex_id, "m3");
    }

    #[test]
    fn test_extract_tolerates_missing_data() {
        assert!(extract_enrichments(&json!({"result": "error"})).is_empty());
    }

    #[test]
    fn test_apply_keeps_existing_fields() {
        let enrichment = Enrichment {
            korean_title: "제목".into(),
            en_title: Some("Title".into()),
            en_description: Some("Desc".into()),
            mangadex_id: "m1".into(),
        };
        let mut title = Title::bare("T1");
        title.en_title = Some("Curated".into());
        enrichment.apply_to(&mut title);

        assert_eq!(title.en_title.as_deref(), Some("Curated"));
        assert_eq!(title.en_description.as_deref(), Some("Desc"));
        assert_eq!(title.mangadex_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_enrich_uses_cache_without_network() {
        let client = MangadexClient::new(&SourceConfig {
            mangadex_url: "http://127.0.0.1:9".into(),
            ..SourceConfig::default()
        })
        .unwrap();
        client.remember(&extract_enrichments(&json!({"data": [
            manga("m1", Some("나 혼자만 레벨업"), "Solo Leveling")
        ]})));

        let mut title = Title::bare("solo");
        title.title = "나 혼자만 레벨업".into();
        assert!(client.enrich(&mut title).await.unwrap());
        assert_eq!(title.mangadex_id.as_deref(), Some("m1"));

        // already complete, nothing to do
        assert!(!client.enrich(&mut title).await.unwrap());
    }
}
