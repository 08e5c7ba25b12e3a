use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use radar_core::is_supported_domain;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "radar.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Fixtures,
    Api,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            temperature: 0.2,
        }
    }
}

/// Runtime settings: defaults, then `radar.yaml` (or `RADAR_CONFIG`), then env vars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadarConfig {
    pub store: StoreBackend,
    pub database_url: String,
    pub source: SourceKind,
    pub fixtures_dir: PathBuf,
    pub api_base_url: String,
    pub api_key: Option<String>,
    pub artifacts_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_competitors: usize,
    pub prompt_max_competitors: usize,
    pub default_domain: String,
    pub llm: LlmConfig,
    pub web_port: u16,
    pub log_filter: String,
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::Sqlite,
            database_url: "sqlite://radar.db".to_string(),
            source: SourceKind::Fixtures,
            fixtures_dir: PathBuf::from("./fixtures"),
            api_base_url: "https://realtime.oxylabs.io".to_string(),
            api_key: None,
            artifacts_dir: None,
            user_agent: "price-radar/0.1".to_string(),
            http_timeout_secs: 60,
            max_competitors: 5,
            prompt_max_competitors: 10,
            default_domain: "com".to_string(),
            llm: LlmConfig::default(),
            web_port: 8000,
            log_filter: "info,radar_sync=debug".to_string(),
        }
    }
}

impl RadarConfig {
    pub fn load() -> Result<Self> {
        let path = std::env::var("RADAR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            Self::from_yaml_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Overlay environment variables looked up through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("RADAR_STORE") {
            self.store = match v.to_ascii_lowercase().as_str() {
                "memory" => StoreBackend::Memory,
                "sqlite" => StoreBackend::Sqlite,
                other => bail!("RADAR_STORE must be memory or sqlite, got {other}"),
            };
        }
        if let Some(v) = lookup("DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = lookup("RADAR_SOURCE") {
            self.source = match v.to_ascii_lowercase().as_str() {
                "fixtures" => SourceKind::Fixtures,
                "api" => SourceKind::Api,
                other => bail!("RADAR_SOURCE must be fixtures or api, got {other}"),
            };
        }
        if let Some(v) = lookup("RADAR_FIXTURES_DIR") {
            self.fixtures_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("RADAR_API_BASE_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = lookup("RADAR_API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = lookup("RADAR_ARTIFACTS_DIR") {
            self.artifacts_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("RADAR_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = lookup("RADAR_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = parse_env("RADAR_HTTP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("RADAR_MAX_COMPETITORS") {
            self.max_competitors = parse_env("RADAR_MAX_COMPETITORS", &v)?;
        }
        if let Some(v) = lookup("RADAR_DEFAULT_DOMAIN") {
            self.default_domain = v;
        }
        if let Some(v) = lookup("RADAR_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = lookup("RADAR_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = lookup("RADAR_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = lookup("RADAR_WEB_PORT") {
            self.web_port = parse_env("RADAR_WEB_PORT", &v)?;
        }
        if let Some(v) = lookup("RADAR_LOG") {
            self.log_filter = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !is_supported_domain(&self.default_domain) {
            bail!("default_domain {} is not a supported marketplace", self.default_domain);
        }
        if self.max_competitors == 0 {
            bail!("max_competitors must be at least 1");
        }
        if self.source == SourceKind::Api && self.api_base_url.trim().is_empty() {
            bail!("api_base_url is required when source is api");
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{key}={value} is invalid: {e}"))
}
