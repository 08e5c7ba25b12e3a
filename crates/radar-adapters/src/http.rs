use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use radar_storage::{FetchRequest, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use strsim::jaro_winkler;
use tracing::{debug, info};

use crate::normalize::{json_str, unwrap_content};
use crate::{ProductSource, RawPayload, SourceContext, SourceError};

const SEARCH_QUERY_MAX_WORDS: usize = 8;

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    /// Realtime scraper endpoint root; queries go to `{base_url}/v1/queries`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub max_competitors: usize,
}

/// Product source backed by a realtime scraping API (`amazon_product` / `amazon_search`).
#[derive(Debug, Clone)]
pub struct HttpProductSource {
    config: HttpSourceConfig,
    http: Arc<HttpFetcher>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub asin: String,
    pub title: Option<String>,
}

impl HttpProductSource {
    pub fn new(config: HttpSourceConfig, http: Arc<HttpFetcher>) -> Self {
        Self { config, http }
    }

    fn queries_url(&self) -> String {
        format!("{}/v1/queries", self.config.base_url.trim_end_matches('/'))
    }

    async fn query(
        &self,
        ctx: &SourceContext,
        marketplace_domain: &str,
        mut body: JsonValue,
        locale_hint: Option<&str>,
    ) -> Result<JsonValue, SourceError> {
        if let (Some(geo), Some(obj)) = (locale_hint, body.as_object_mut()) {
            obj.insert("geo_location".to_string(), JsonValue::String(geo.to_string()));
        }
        let request = FetchRequest::post_json(self.queries_url(), body)
            .with_bearer(self.config.api_key.clone());
        let response = self.http.fetch(ctx.run_id, marketplace_domain, &request).await?;
        Ok(response.json()?)
    }

    async fn search(
        &self,
        ctx: &SourceContext,
        query: &str,
        marketplace_domain: &str,
        locale_hint: Option<&str>,
    ) -> Result<Vec<SearchHit>, SourceError> {
        let body = json!({
            "source": "amazon_search",
            "query": query,
            "domain": marketplace_domain,
            "pages": 1,
            "parse": true,
        });
        let response = self.query(ctx, marketplace_domain, body, locale_hint).await?;
        Ok(search_hits(&response))
    }
}

fn search_hits(response: &JsonValue) -> Vec<SearchHit> {
    let content = unwrap_content(response);
    let items = content
        .pointer("/results/organic")
        .or_else(|| content.get("organic"))
        .or_else(|| content.get("results"))
        .and_then(JsonValue::as_array);
    let Some(items) = items else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let asin = json_str(item, "asin")?.trim();
            if asin.is_empty() {
                return None;
            }
            Some(SearchHit {
                asin: asin.to_string(),
                title: json_str(item, "title").map(ToString::to_string),
            })
        })
        .collect()
}

/// Marketplace search text for a parent listing: brand-prefixed, first words of the title.
pub fn search_query_for(parent: &JsonValue) -> Option<String> {
    let doc = unwrap_content(parent);
    let title = json_str(doc, "title").map(str::trim).filter(|t| !t.is_empty())?;
    let short_title = title
        .split_whitespace()
        .take(SEARCH_QUERY_MAX_WORDS)
        .collect::<Vec<_>>()
        .join(" ");
    match json_str(doc, "brand").map(str::trim).filter(|b| !b.is_empty()) {
        Some(brand) if !short_title.to_lowercase().starts_with(&brand.to_lowercase()) => {
            Some(format!("{brand} {short_title}"))
        }
        _ => Some(short_title),
    }
}

/// Drop the parent and repeated ids, then order by title similarity to the parent.
pub fn rank_candidates(
    parent_id: &str,
    parent_title: &str,
    hits: Vec<SearchHit>,
    limit: usize,
) -> Vec<SearchHit> {
    let parent_title = parent_title.to_lowercase();
    let mut seen = HashSet::new();
    let mut scored = hits
        .into_iter()
        .filter(|hit| hit.asin != parent_id && seen.insert(hit.asin.clone()))
        .map(|hit| {
            let score = hit
                .title
                .as_deref()
                .map(|t| jaro_winkler(&parent_title, &t.to_lowercase()))
                .unwrap_or(0.0);
            (score, hit)
        })
        .collect::<Vec<_>>();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(limit).map(|(_, hit)| hit).collect()
}

#[async_trait]
impl ProductSource for HttpProductSource {
    fn source_id(&self) -> &'static str {
        "realtime-api"
    }

    async fn fetch_product(
        &self,
        ctx: &SourceContext,
        id: &str,
        locale_hint: Option<&str>,
        marketplace_domain: &str,
    ) -> Result<RawPayload, SourceError> {
        let body = json!({
            "source": "amazon_product",
            "query": id,
            "domain": marketplace_domain,
            "parse": true,
        });
        let response = self.query(ctx, marketplace_domain, body, locale_hint).await?;
        if unwrap_content(&response).is_null() {
            return Err(SourceError::NotListed {
                id: id.to_string(),
                marketplace_domain: marketplace_domain.to_string(),
            });
        }
        Ok(response)
    }

    async fn discover_competitors(
        &self,
        ctx: &SourceContext,
        parent_id: &str,
        marketplace_domain: &str,
        locale_hint: Option<&str>,
    ) -> Result<Vec<RawPayload>, SourceError> {
        let parent = self
            .fetch_product(ctx, parent_id, locale_hint, marketplace_domain)
            .await?;
        let query = search_query_for(&parent).ok_or_else(|| {
            SourceError::Malformed(format!("listing {parent_id} has no title to search with"))
        })?;
        let parent_title = json_str(unwrap_content(&parent), "title").unwrap_or_default();

        let hits = self
            .search(ctx, &query, marketplace_domain, locale_hint)
            .await?;
        let total_hits = hits.len();
        let picked = rank_candidates(parent_id, parent_title, hits, self.config.max_competitors);
        debug!(run_id = %ctx.run_id, parent_id, %query, total_hits, picked = picked.len(), "ranked search hits");

        let mut payloads = Vec::with_capacity(picked.len());
        for hit in &picked {
            payloads.push(
                self.fetch_product(ctx, &hit.asin, locale_hint, marketplace_domain)
                    .await?,
            );
        }
        info!(run_id = %ctx.run_id, parent_id, competitors = payloads.len(), "competitor discovery finished");
        Ok(payloads)
    }
}
