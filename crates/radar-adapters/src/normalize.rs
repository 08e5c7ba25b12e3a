//! Provider payload → [`ProductDraft`] mapping.

use radar_core::ProductDraft;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("provider payload is not a JSON object")]
    NotAnObject,
    #[error("provider payload has no usable product id (asin)")]
    MissingId,
    #[error("provider payload for {id} has no url and no marketplace domain to build one")]
    MissingUrl { id: String },
}

/// Map a raw provider document into the canonical draft.
///
/// Absent keys and JSON `null` become `None`; present strings are kept verbatim
/// (including empty ones). Only `id` and `url` are required.
pub fn normalize(raw: &JsonValue) -> Result<ProductDraft, NormalizationError> {
    let doc = unwrap_content(raw);
    if !doc.is_object() {
        return Err(NormalizationError::NotAnObject);
    }

    let id = first_str(doc, &["asin", "id"])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(NormalizationError::MissingId)?
        .to_string();

    let url = match first_str(doc, &["url", "product_url"])
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        Some(url) => url.to_string(),
        None => {
            let domain = first_str(doc, &["amazon_domain", "domain"])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| NormalizationError::MissingUrl { id: id.clone() })?;
            listing_url(domain, &id)
        }
    };

    Ok(ProductDraft {
        title: json_str(doc, "title").map(ToString::to_string),
        price: json_price(doc, "price"),
        currency: json_str(doc, "currency").map(ToString::to_string),
        brand: json_str(doc, "brand").map(ToString::to_string),
        secondary_id: json_scalar_string(doc, "product_id")
            .or_else(|| json_scalar_string(doc, "product")),
        images: json_string_list(doc, "images"),
        url,
        id,
    })
}

/// Canonical listing link for a marketplace domain suffix.
pub fn listing_url(marketplace_domain: &str, id: &str) -> String {
    let domain = marketplace_domain.trim().trim_start_matches('.');
    format!("https://www.amazon.{domain}/dp/{id}")
}

/// Realtime scraper responses wrap the parsed document as `{"results":[{"content":{..}}]}`.
pub(crate) fn unwrap_content(raw: &JsonValue) -> &JsonValue {
    if let Some(content) = raw.pointer("/results/0/content") {
        return content;
    }
    raw.get("content").filter(|c| c.is_object()).unwrap_or(raw)
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value.get(key)?.as_str()
}

fn first_str<'a>(value: &'a JsonValue, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| json_str(value, k))
}

fn json_scalar_string(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_string_list(value: &JsonValue, key: &str) -> Vec<String> {
    match value.get(key) {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(ToString::to_string))
            .collect(),
        Some(JsonValue::String(single)) if !single.trim().is_empty() => vec![single.clone()],
        _ => Vec::new(),
    }
}

fn json_price(value: &JsonValue, key: &str) -> Option<f64> {
    match value.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_display_price(s),
        _ => None,
    }
}

/// First decimal amount in a display string: `"$1,299.00"` → 1299.0, `"19,99 €"` → 19.99.
pub fn parse_display_price(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let token = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect::<String>();
    let token = token.trim_end_matches(['.', ',']);

    let normalized = match (token.rfind(','), token.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => token.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => token.replace(',', ""),
        (Some(comma), None) if token.len() - comma - 1 == 3 => token.replace(',', ""),
        (Some(_), None) => token.replacen(',', ".", 1),
        _ => token.to_string(),
    };
    normalized.parse::<f64>().ok()
}
