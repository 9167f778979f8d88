use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::models::{CompensationRange, Posting, SearchCriteria};

#[derive(Debug, Clone, Copy)]
pub struct AdapterCapabilities {
    pub supports_direct_apply: bool,
}

/// One job platform, seen uniformly by the core. Adapter-internal scraping
/// mechanics stay behind this seam.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> &str;
    fn capabilities(&self) -> AdapterCapabilities;
    async fn fetch(&self, criteria: &SearchCriteria) -> Result<Vec<Posting>>;
}

// --- HTTP JSON feed adapter ---

/// Listing shape served by feed endpoints.
#[derive(Debug, Deserialize)]
struct FeedItem {
    id: String,
    title: String,
    #[serde(alias = "company")]
    organization: String,
    #[serde(default)]
    location: String,
    url: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    salary_min: Option<i64>,
    #[serde(default)]
    salary_max: Option<i64>,
}

pub struct HttpFeedAdapter {
    id: String,
    feed_url: String,
    supports_direct_apply: bool,
    client: reqwest::Client,
}

impl HttpFeedAdapter {
    pub fn new(
        id: String,
        feed_url: String,
        supports_direct_apply: bool,
        client: reqwest::Client,
    ) -> Self {
        Self {
            id,
            feed_url,
            supports_direct_apply,
            client,
        }
    }

    fn to_posting(&self, item: FeedItem) -> Posting {
        let compensation = match (item.salary_min, item.salary_max) {
            (Some(min), Some(max)) if min <= max => Some(CompensationRange { min, max }),
            (Some(min), Some(max)) => Some(CompensationRange { min: max, max: min }),
            (Some(v), None) | (None, Some(v)) => Some(CompensationRange { min: v, max: v }),
            (None, None) => None,
        };
        Posting {
            source_id: self.id.clone(),
            external_id: item.id,
            url: item.url,
            title: item.title,
            organization: item.organization,
            location: item.location,
            compensation,
            description: item.description,
            discovered_at: Utc::now(),
        }
    }
}

#[async_trait]
impl SourceAdapter for HttpFeedAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_direct_apply: self.supports_direct_apply,
        }
    }

    async fn fetch(&self, criteria: &SearchCriteria) -> Result<Vec<Posting>> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if !criteria.titles.is_empty() {
            query.push(("titles", criteria.titles.join(",")));
        }
        if !criteria.locations.is_empty() {
            query.push(("locations", criteria.locations.join(",")));
        }
        if let Some(floor) = criteria.salary_floor {
            query.push(("salary_floor", floor.to_string()));
        }

        let items: Vec<FeedItem> = self
            .client
            .get(&self.feed_url)
            .query(&query)
            .send()
            .await
            .with_context(|| format!("Failed to reach feed for source '{}'", self.id))?
            .error_for_status()
            .with_context(|| format!("Feed for source '{}' returned an error", self.id))?
            .json()
            .await
            .with_context(|| format!("Failed to parse feed for source '{}'", self.id))?;

        Ok(items.into_iter().map(|i| self.to_posting(i)).collect())
    }
}

// --- Test double ---


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_items_parse_and_convert() {
        let raw = r#"[
            {
                "id": "j-1",
                "title": "Platform Engineer",
                "company": "Example Corp",
                "location": "Portland, OR",
                "url": "https://jobs.example.com/j-1",
                "description": "rust services",
                "salary_min": 140000,
                "salary_max": 180000
            },
            {
                "id": "j-2",
                "title": "SRE",
                "organization": "Other Co",
                "url": "https://jobs.example.com/j-2"
            }
        ]"#;
        let items: Vec<FeedItem> = serde_json::from_str(raw).unwrap();
        let adapter = HttpFeedAdapter::new(
            "feedco".into(),
            "https://feedco.example.com/jobs".into(),
            true,
            reqwest::Client::new(),
        );
        let postings: Vec<Posting> = items.into_iter().map(|i| adapter.to_posting(i)).collect();

        assert_eq!(postings[0].source_id, "feedco");
        assert_eq!(postings[0].compensation.unwrap().min, 140_000);
        assert_eq!(postings[1].organization, "Other Co");
        assert!(postings[1].compensation.is_none());
        assert_eq!(postings[1].location, "");
    }

    #[test]
    fn inverted_salary_bounds_are_swapped() {
        let adapter = HttpFeedAdapter::new(
            "feedco".into(),
            "https://feedco.example.com/jobs".into(),
            true,
            reqwest::Client::new(),
        );
        let item: FeedItem = serde_json::from_str(
            r#"{"id": "x", "title": "t", "company": "c", "url": "u",
                "salary_min": 90000, "salary_max": 60000}"#,
        )
        .unwrap();
        let p = adapter.to_posting(item);
        let range = p.compensation.unwrap();
        assert!(range.min <= range.max);
    }

    #[tokio::test]
    async fn static_adapter_serves_fixtures() {
        use testing::StaticAdapter;
        let adapter = StaticAdapter::new("s", vec![]);
        let out = adapter.fetch(&SearchCriteria::default()).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(*adapter.fetches.lock().unwrap(), 1);
        assert!(adapter.capabilities().supports_direct_apply);
    }
}
