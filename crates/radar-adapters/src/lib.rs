//! Product-data source contracts, payload normalization + fixture/HTTP sources.

mod http;
mod normalize;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radar_storage::FetchError;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub use http::{rank_candidates, search_query_for, HttpProductSource, HttpSourceConfig, SearchHit};
pub use normalize::{listing_url, normalize, parse_display_price, NormalizationError};

pub const CRATE_NAME: &str = "radar-adapters";

/// Raw provider document, exactly as returned.
pub type RawPayload = JsonValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl SourceContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for SourceContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("provider has no listing for {id} on amazon.{marketplace_domain}")]
    NotListed { id: String, marketplace_domain: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected provider response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Remote product-data collaborator: one listing by id, or the candidate
/// competitor listings for a parent. Implementations return raw payloads;
/// normalization happens in the caller.
#[async_trait]
pub trait ProductSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_product(
        &self,
        ctx: &SourceContext,
        id: &str,
        locale_hint: Option<&str>,
        marketplace_domain: &str,
    ) -> Result<RawPayload, SourceError>;

    async fn discover_competitors(
        &self,
        ctx: &SourceContext,
        parent_id: &str,
        marketplace_domain: &str,
        locale_hint: Option<&str>,
    ) -> Result<Vec<RawPayload>, SourceError>;
}

/// Offline source reading `products/{id}.json` and `competitors/{parent_id}.json`
/// under a fixtures root. A missing competitors file means "no competitors".
#[derive(Debug, Clone)]
pub struct FixtureProductSource {
    root: PathBuf,
}

impl FixtureProductSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn product_path(&self, id: &str) -> PathBuf {
        self.root.join("products").join(format!("{}.json", file_stem(id)))
    }

    fn competitors_path(&self, parent_id: &str) -> PathBuf {
        self.root
            .join("competitors")
            .join(format!("{}.json", file_stem(parent_id)))
    }
}

fn file_stem(id: &str) -> String {
    id.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

async fn read_json_file(path: &Path) -> Result<Option<JsonValue>, SourceError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| SourceError::Malformed(format!("parsing {}: {e}", path.display()))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(anyhow::Error::new(err)
            .context(format!("reading {}", path.display()))
            .into()),
    }
}

#[async_trait]
impl ProductSource for FixtureProductSource {
    fn source_id(&self) -> &'static str {
        "fixtures"
    }

    async fn fetch_product(
        &self,
        ctx: &SourceContext,
        id: &str,
        _locale_hint: Option<&str>,
        marketplace_domain: &str,
    ) -> Result<RawPayload, SourceError> {
        let path = self.product_path(id);
        debug!(run_id = %ctx.run_id, path = %path.display(), "reading product fixture");
        read_json_file(&path).await?.ok_or_else(|| SourceError::NotListed {
            id: id.to_string(),
            marketplace_domain: marketplace_domain.to_string(),
        })
    }

    async fn discover_competitors(
        &self,
        ctx: &SourceContext,
        parent_id: &str,
        _marketplace_domain: &str,
        _locale_hint: Option<&str>,
    ) -> Result<Vec<RawPayload>, SourceError> {
        let path = self.competitors_path(parent_id);
        debug!(run_id = %ctx.run_id, path = %path.display(), "reading competitor fixtures");
        match read_json_file(&path).await? {
            None => Ok(Vec::new()),
            Some(JsonValue::Array(items)) => Ok(items),
            Some(_) => Err(SourceError::Malformed(format!(
                "{} must contain a JSON array of payloads",
                path.display()
            ))),
        }
    }
}
