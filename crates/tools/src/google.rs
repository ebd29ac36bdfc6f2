//! Google Custom Search JSON API client.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::info;

use termagent_config::SearchConfig;

use crate::{SearchHit, SearchProvider};

const ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";

/// Searches through a Programmable Search Engine (`cx`) with an API key.
pub struct GoogleSearch {
    client: reqwest::Client,
    api_key: String,
    cse_id: String,
    num_results: u32,
}

impl GoogleSearch {
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("termagent/0.1")
            .build()?;
        Ok(Self {
            client,
            api_key: config.google_api_key.clone(),
            cse_id: config.google_cse_id.clone(),
            // The API rejects num outside 1..=10.
            num_results: config.num_results.clamp(1, 10),
        })
    }

    fn check_configured(&self) -> Result<()> {
        if self.api_key.trim().is_empty() || self.api_key.contains("YOUR_GOOGLE_API_KEY") {
            bail!("Google API key is not configured (set GOOGLE_API_KEY)");
        }
        if self.cse_id.trim().is_empty() || self.cse_id.contains("YOUR_GOOGLE_CSE_ID") {
            bail!("Google CSE ID is not configured (set GOOGLE_CSE_ID)");
        }
        Ok(())
    }
}

#[async_trait]
impl SearchProvider for GoogleSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        self.check_configured()?;

        let num = self.num_results.to_string();
        let resp = self
            .client
            .get(ENDPOINT)
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.cse_id.as_str()),
                ("q", query),
                ("num", num.as_str()),
            ])
            .send()
            .await
            .context("Google search request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Google search API error {status}: {body}");
        }

        let json: serde_json::Value = resp.json().await?;
        let hits = format_search_results(&json);
        info!(query, count = hits.len(), "google search complete");
        Ok(hits)
    }
}

/// Reduce a raw Custom Search response to title/link/snippet triples.
fn format_search_results(json: &serde_json::Value) -> Vec<SearchHit> {
    let Some(items) = json["items"].as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .map(|item| SearchHit {
            title: item["title"].as_str().unwrap_or("").trim().to_string(),
            link: item["link"].as_str().unwrap_or("").trim().to_string(),
            snippet: item["snippet"].as_str().unwrap_or("").trim().to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn formats_items() {
        let raw = json!({
            "items": [
                {"title": " Rust ", "link": "https://rust-lang.org", "snippet": "fast", "kind": "x"},
                {"title": "No snippet", "link": "https://example.com"}
            ]
        });
        let hits = format_search_results(&raw);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Rust");
        assert_eq!(hits[1].snippet, "");
    }

    #[test]
    fn no_items_means_no_hits() {
        assert!(format_search_results(&json!({"searchInformation": {}})).is_empty());
    }

    #[tokio::test]
    async fn unconfigured_key_is_an_error() {
        let search = GoogleSearch::from_config(&SearchConfig::default()).unwrap();
        let err = search.search("rust").await.unwrap_err();
        assert!(err.to_string().contains("GOOGLE_API_KEY"));
    }

    #[tokio::test]
    async fn placeholder_cse_id_is_an_error() {
        let config = SearchConfig {
            google_api_key: "real-key".into(),
            google_cse_id: "YOUR_GOOGLE_CSE_ID".into(),
            num_results: 5,
        };
        let search = GoogleSearch::from_config(&config).unwrap();
        let err = search.search("rust").await.unwrap_err();
        assert!(err.to_string().contains("GOOGLE_CSE_ID"));
    }
}
