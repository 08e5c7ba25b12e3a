//! Core domain model for Price Radar: product records, filters and analysis payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "radar-core";

/// Marketplace suffixes the acquisition surfaces accept (`amazon.{domain}`).
pub const SUPPORTED_DOMAINS: &[&str] = &["com", "ca", "co.uk", "de", "fr", "it", "ae", "in"];

pub const DEFAULT_PAGE_SIZE: usize = 10;

pub fn is_supported_domain(domain: &str) -> bool {
    SUPPORTED_DOMAINS.contains(&domain)
}

/// Provider-reported listing fields after normalization, before request context is stamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDraft {
    pub id: String,
    pub title: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub brand: Option<String>,
    pub secondary_id: Option<String>,
    pub images: Vec<String>,
    pub url: String,
}

/// Request-time context. Never read from the provider payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionContext {
    pub marketplace_domain: String,
    pub locale_hint: Option<String>,
    pub parent_id: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl AcquisitionContext {
    pub fn root(marketplace_domain: impl Into<String>, locale_hint: Option<String>) -> Self {
        Self {
            marketplace_domain: marketplace_domain.into(),
            locale_hint,
            parent_id: None,
            fetched_at: Utc::now(),
        }
    }

    pub fn competitor_of(
        parent_id: impl Into<String>,
        marketplace_domain: impl Into<String>,
        locale_hint: Option<String>,
    ) -> Self {
        Self {
            marketplace_domain: marketplace_domain.into(),
            locale_hint,
            parent_id: Some(parent_id.into()),
            fetched_at: Utc::now(),
        }
    }
}

/// Canonical persisted product. `parent_id == None` marks a root acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: String,
    pub title: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub brand: Option<String>,
    pub secondary_id: Option<String>,
    pub images: Vec<String>,
    pub url: String,
    pub marketplace_domain: String,
    pub locale_hint: Option<String>,
    pub parent_id: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl ProductRecord {
    pub fn from_draft(draft: ProductDraft, ctx: &AcquisitionContext) -> Self {
        Self {
            id: draft.id,
            title: draft.title,
            price: draft.price,
            currency: draft.currency,
            brand: draft.brand,
            secondary_id: draft.secondary_id,
            images: draft.images,
            url: draft.url,
            marketplace_domain: ctx.marketplace_domain.clone(),
            locale_hint: ctx.locale_hint.clone(),
            parent_id: ctx.parent_id.clone(),
            fetched_at: ctx.fetched_at,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn display_title(&self) -> &str {
        match self.title.as_deref() {
            Some(title) if !title.trim().is_empty() => title,
            _ => &self.id,
        }
    }

    pub fn display_price(&self) -> Option<String> {
        let price = self.price?;
        Some(match self.currency.as_deref() {
            Some(currency) if !currency.is_empty() => format!("{currency} {price:.2}"),
            _ => format!("{price:.2}"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum ParentRef {
    Root,
    /// Any competitor record, whatever its parent.
    AnyParent,
    Of(String),
}

/// Equality filter over record fields; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFilter {
    pub parent: Option<ParentRef>,
    pub brand: Option<String>,
    pub currency: Option<String>,
    pub marketplace_domain: Option<String>,
    pub locale_hint: Option<String>,
}

impl ProductFilter {
    pub fn children_of(parent_id: impl Into<String>) -> Self {
        Self {
            parent: Some(ParentRef::Of(parent_id.into())),
            ..Default::default()
        }
    }

    pub fn roots() -> Self {
        Self {
            parent: Some(ParentRef::Root),
            ..Default::default()
        }
    }

    pub fn competitors() -> Self {
        Self {
            parent: Some(ParentRef::AnyParent),
            ..Default::default()
        }
    }

    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = Some(brand.into());
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.marketplace_domain = Some(domain.into());
        self
    }

    pub fn with_locale(mut self, locale_hint: impl Into<String>) -> Self {
        self.locale_hint = Some(locale_hint.into());
        self
    }

    pub fn matches(&self, record: &ProductRecord) -> bool {
        let parent_ok = match &self.parent {
            None => true,
            Some(ParentRef::Root) => record.parent_id.is_none(),
            Some(ParentRef::AnyParent) => record.parent_id.is_some(),
            Some(ParentRef::Of(id)) => record.parent_id.as_deref() == Some(id.as_str()),
        };
        parent_ok
            && eq_opt(&self.brand, &record.brand)
            && eq_opt(&self.currency, &record.currency)
            && eq_opt(&self.locale_hint, &record.locale_hint)
            && self
                .marketplace_domain
                .as_ref()
                .map_or(true, |d| *d == record.marketplace_domain)
    }
}

fn eq_opt(wanted: &Option<String>, actual: &Option<String>) -> bool {
    match wanted {
        None => true,
        Some(w) => actual.as_deref() == Some(w.as_str()),
    }
}

/// One page of an ordered listing. Pages are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
    pub total: usize,
}

impl<T> Page<T> {
    pub fn paginate(all: Vec<T>, page: Option<usize>, per_page: Option<usize>) -> Self {
        let total = all.len();
        let per_page = per_page.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        let total_pages = total.max(1).div_ceil(per_page);
        let page = page.unwrap_or(1).clamp(1, total_pages);
        let start = (page - 1) * per_page;
        let items = all.into_iter().skip(start).take(per_page).collect();
        Self {
            items,
            page,
            per_page,
            total_pages,
            total,
        }
    }

    /// 1-based index range shown on this page, `None` when empty.
    pub fn showing(&self) -> Option<(usize, usize)> {
        if self.items.is_empty() {
            return None;
        }
        let first = (self.page - 1) * self.per_page + 1;
        Some((first, first + self.items.len() - 1))
    }
}

/// Summarizer input: the parent first, then its competitors in store order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisPayload {
    pub parent: ProductRecord,
    pub competitors: Vec<ProductRecord>,
}

impl AnalysisPayload {
    /// Markdown prompt body listing at most `max_competitors` competitors.
    pub fn render_prompt(&self, max_competitors: usize) -> String {
        let mut lines = vec![
            "# Competitor Analysis Input".to_string(),
            String::new(),
            "## Product".to_string(),
        ];
        push_product_lines(&mut lines, &self.parent);

        lines.push(String::new());
        lines.push(format!("## Competitors ({})", self.competitors.len()));
        if self.competitors.is_empty() {
            lines.push("No known competitors.".to_string());
        }
        for (idx, competitor) in self.competitors.iter().take(max_competitors).enumerate() {
            lines.push(String::new());
            lines.push(format!("### Competitor {}", idx + 1));
            push_product_lines(&mut lines, competitor);
        }
        let omitted = self.competitors.len().saturating_sub(max_competitors);
        if omitted > 0 {
            lines.push(String::new());
            lines.push(format!("_{omitted} more competitors omitted._"));
        }
        lines.join("\n")
    }
}

fn push_product_lines(lines: &mut Vec<String>, record: &ProductRecord) {
    lines.push(format!("- ASIN: {}", record.id));
    lines.push(format!("- Title: {}", record.title.as_deref().unwrap_or("n/a")));
    lines.push(format!("- Brand: {}", record.brand.as_deref().unwrap_or("n/a")));
    lines.push(format!(
        "- Price: {}",
        record.display_price().unwrap_or_else(|| "n/a".to_string())
    ));
    lines.push(format!("- Marketplace: amazon.{}", record.marketplace_domain));
    lines.push(format!("- Link: {}", record.url));
}
