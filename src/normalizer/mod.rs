use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use html_escape::decode_html_entities;
use serde_json::Value;
use tracing::warn;

use crate::app::{Result, WirefeedError};
use crate::domain::{Article, Category, EntityMap, RawArticle};

#[derive(Clone)]
pub struct Normalizer;

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    /// Convert one wire article. Returns `None` for articles without an id.
    ///
    /// Malformed `companies` / `countries` payloads become `None`; they never
    /// fail the article.
    pub fn normalize(&self, raw: RawArticle, received_at: DateTime<Utc>) -> Option<Article> {
        let id = raw.id.trim().to_string();
        if id.is_empty() {
            warn!("Dropping article without id");
            return None;
        }

        let timestamp = parse_timestamp(raw.timestamp.as_ref()).unwrap_or(received_at);
        let mut article = Article::new(id, timestamp);

        article.received_at = received_at;
        article.source = raw.source;
        article.title = raw.title.map(|t| decode_html_entities(&t).to_string());
        article.summary = raw.summary.map(|s| decode_html_entities(&s).to_string());
        article.industry = raw.industry;
        article.link = raw.link;
        article.language = raw.language;
        article.companies = entity_field(&article.id, "companies", raw.companies.as_ref());
        article.countries = entity_field(&article.id, "countries", raw.countries.as_ref());
        article.category = raw
            .category
            .as_deref()
            .map(Category::parse)
            .unwrap_or_default();
        article.priority_until = parse_timestamp(raw.priority_until.as_ref());

        Some(article)
    }

    /// Normalize a fetched batch: drops id-less and duplicate entries and
    /// orders the result newest first.
    pub fn normalize_batch(&self, raws: Vec<RawArticle>, received_at: DateTime<Utc>) -> Vec<Article> {
        let mut seen_ids = HashSet::new();
        let mut articles: Vec<Article> = raws
            .into_iter()
            .filter_map(|raw| self.normalize(raw, received_at))
            .filter(|article| seen_ids.insert(article.id.clone()))
            .collect();

        articles.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        articles
    }
}

fn entity_field(article_id: &str, field: &str, value: Option<&Value>) -> Option<EntityMap> {
    match parse_entity_map(value) {
        Ok(map) => map,
        Err(e) => {
            warn!(article_id, field, error = %e, "Ignoring malformed entity payload");
            None
        }
    }
}

/// Parse a `companies` / `countries` payload, which may be a JSON-encoded
/// string or an already-decoded object.
pub fn parse_entity_map(value: Option<&Value>) -> Result<Option<EntityMap>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone().into_iter().collect())),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let decoded: Value = serde_json::from_str(trimmed)
                .map_err(|e| WirefeedError::DataShape(e.to_string()))?;
            match decoded {
                Value::String(_) => Err(WirefeedError::DataShape(
                    "doubly encoded string".to_string(),
                )),
                other => parse_entity_map(Some(&other)),
            }
        }
        Some(other) => Err(WirefeedError::DataShape(format!(
            "expected object, got {}",
            type_name(other)
        ))),
    }
}

/// RFC 3339 strings, naive `YYYY-MM-DDTHH:MM:SS` strings (taken as UTC) and
/// epoch milliseconds are accepted.
pub fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BATCH_SAMPLE: &str = r#"[
      {
        "id": "a-1",
        "timestamp": "2024-01-01T10:00:00Z",
        "source": "Reuters",
        "title": "Chips &amp; Cloud",
        "industry": "Semiconductors",
        "companies": "{\"ACME\": {\"ticker\": \"ACM\"}}",
        "countries": {"US": 1},
        "language": "en"
      },
      {
        "id": "a-2",
        "timestamp": "2024-01-01T12:00:00Z",
        "title": "Later",
        "companies": "{broken",
        "category": "SPONSORED",
        "priorityUntil": "2030-01-01T00:00:00Z"
      },
      { "id": "", "title": "No id" }
    ]"#;

    fn batch() -> Vec<RawArticle> {
        serde_json::from_str(BATCH_SAMPLE).unwrap()
    }

    #[test]
    fn test_normalize_batch_sorts_newest_first() {
        let normalizer = Normalizer::new();
        let articles = normalizer.normalize_batch(batch(), Utc::now());

        assert_eq!(articles.len(), 2);
        assert_eq!(articles[0].id, "a-2");
        assert_eq!(articles[1].id, "a-1");
    }

    #[test]
    fn test_entity_fields_parsed_from_string_and_object() {
        let normalizer = Normalizer::new();
        let articles = normalizer.normalize_batch(batch(), Utc::now());
        let first = articles.iter().find(|a| a.id == "a-1").unwrap();

        let companies = first.companies.as_ref().unwrap();
        assert_eq!(companies["ACME"]["ticker"], json!("ACM"));
        assert_eq!(first.countries.as_ref().unwrap()["US"], json!(1));
    }

    #[test]
    fn test_malformed_entities_become_none() {
        let normalizer = Normalizer::new();
        let articles = normalizer.normalize_batch(batch(), Utc::now());
        let second = articles.iter().find(|a| a.id == "a-2").unwrap();

        assert!(second.companies.is_none());
        assert_eq!(second.category, Category::Sponsored);
        assert!(second.priority_until.is_some());
    }

    #[test]
    fn test_html_entities_decoded() {
        let normalizer = Normalizer::new();
        let articles = normalizer.normalize_batch(batch(), Utc::now());
        let first = articles.iter().find(|a| a.id == "a-1").unwrap();
        assert_eq!(first.display_title(), "Chips & Cloud");
    }

    #[test]
    fn test_duplicate_ids_in_batch_collapsed() {
        let normalizer = Normalizer::new();
        let raws = vec![
            RawArticle::new("dup").with_title("first"),
            RawArticle::new("dup").with_title("second"),
        ];
        let articles = normalizer.normalize_batch(raws, Utc::now());
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].display_title(), "first");
    }

    #[test]
    fn test_missing_timestamp_uses_arrival_time() {
        let normalizer = Normalizer::new();
        let now = Utc::now();
        let article = normalizer.normalize(RawArticle::new("x"), now).unwrap();
        assert_eq!(article.timestamp, now);
        assert_eq!(article.received_at, now);
    }

    #[test]
    fn test_parse_entity_map_shapes() {
        assert!(parse_entity_map(None).unwrap().is_none());
        assert!(parse_entity_map(Some(&json!(null))).unwrap().is_none());
        assert!(parse_entity_map(Some(&json!(""))).unwrap().is_none());
        assert!(parse_entity_map(Some(&json!("null"))).unwrap().is_none());
        assert!(parse_entity_map(Some(&json!([1, 2]))).is_err());
        assert!(parse_entity_map(Some(&json!("[1, 2]"))).is_err());
        assert!(parse_entity_map(Some(&json!("\"x\""))).is_err());

        let map = parse_entity_map(Some(&json!("{\"DE\": 2}"))).unwrap().unwrap();
        assert_eq!(map["DE"], json!(2));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            parse_timestamp(Some(&json!("2024-01-01T00:00:00Z"))),
            Some(expected)
        );
        assert_eq!(
            parse_timestamp(Some(&json!("2024-01-01T00:00:00"))),
            Some(expected)
        );
        assert_eq!(
            parse_timestamp(Some(&json!(expected.timestamp_millis()))),
            Some(expected)
        );
        assert_eq!(parse_timestamp(Some(&json!("yesterday"))), None);
        assert_eq!(parse_timestamp(Some(&json!(true))), None);
    }
}
