use std::sync::Arc;

use async_trait::async_trait;
use radar_core::AnalysisPayload;
use radar_storage::{FetchError, FetchRequest, HttpFetcher};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::LlmConfig;

const SYSTEM_PROMPT: &str = "You are a retail pricing analyst. Compare the product against its \
competitors on price, brand positioning and listing quality. Answer in Markdown with a short \
summary, a comparison table and three concrete recommendations for the seller.";

#[derive(Debug, Error)]
pub enum SummarizationError {
    #[error("no summarizer is configured")]
    NotConfigured,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("summarizer response has no message content")]
    EmptyResponse,
}

/// Turns an assembled analysis payload into prose.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, payload: &AnalysisPayload) -> Result<String, SummarizationError>;
}

/// Summarizer for OpenAI-compatible `/chat/completions` endpoints.
#[derive(Debug, Clone)]
pub struct ChatCompletionsSummarizer {
    config: LlmConfig,
    max_competitors: usize,
    http: Arc<HttpFetcher>,
}

impl ChatCompletionsSummarizer {
    pub fn new(config: LlmConfig, max_competitors: usize, http: Arc<HttpFetcher>) -> Self {
        Self {
            config,
            max_competitors,
            http,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    pub fn request_body(&self, payload: &AnalysisPayload) -> JsonValue {
        json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": payload.render_prompt(self.max_competitors) },
            ],
        })
    }
}

fn completion_text(response: &JsonValue) -> Option<&str> {
    response
        .pointer("/choices/0/message/content")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

#[async_trait]
impl Summarizer for ChatCompletionsSummarizer {
    async fn summarize(&self, payload: &AnalysisPayload) -> Result<String, SummarizationError> {
        let request = FetchRequest::post_json(self.endpoint(), self.request_body(payload))
            .with_bearer(self.config.api_key.clone());
        let response = self.http.fetch(Uuid::new_v4(), "llm", &request).await?;
        let body = response.json()?;
        let text = completion_text(&body).ok_or(SummarizationError::EmptyResponse)?;
        info!(
            parent_id = %payload.parent.id,
            competitors = payload.competitors.len(),
            model = %self.config.model,
            "analysis summary generated"
        );
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use radar_core::ProductRecord;
    use radar_storage::HttpClientConfig;

    fn record(id: &str, parent: Option<&str>) -> ProductRecord {
        ProductRecord {
            id: id.to_string(),
            title: Some(format!("Listing {id}")),
            price: None,
            currency: None,
            brand: None,
            secondary_id: None,
            images: Vec::new(),
            url: format!("https://www.amazon.com/dp/{id}"),
            marketplace_domain: "com".to_string(),
            locale_hint: None,
            parent_id: parent.map(ToString::to_string),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn request_body_bounds_competitors_in_prompt() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let summarizer = ChatCompletionsSummarizer::new(LlmConfig::default(), 1, http);
        let payload = AnalysisPayload {
            parent: record("P1", None),
            competitors: vec![record("C1", Some("P1")), record("C2", Some("P1"))],
        };

        let body = summarizer.request_body(&payload);
        assert_eq!(body["model"], "gpt-4o-mini");
        let user = body["messages"][1]["content"].as_str().unwrap();
        assert!(user.contains("C1"));
        assert!(!user.contains("C2"));
        assert!(user.contains("1 more competitors omitted"));
    }

    #[test]
    fn completion_text_requires_non_blank_content() {
        let ok = json!({"choices": [{"message": {"content": "  Summary  "}}]});
        assert_eq!(completion_text(&ok), Some("Summary"));
        assert_eq!(completion_text(&json!({"choices": [{"message": {"content": " "}}]})), None);
        assert_eq!(completion_text(&json!({"choices": []})), None);
    }
}
