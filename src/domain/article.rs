use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Entity name -> payload, as delivered in `companies` / `countries`.
pub type EntityMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Sponsored,
    Statistics,
    #[default]
    #[serde(other)]
    Standard,
}

impl Category {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "SPONSORED" => Self::Sponsored,
            "STATISTICS" => Self::Statistics,
            _ => Self::Standard,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,
    pub title: Option<String>,
    pub industry: Option<String>,
    pub summary: Option<String>,
    pub link: Option<String>,
    pub companies: Option<EntityMap>,
    pub countries: Option<EntityMap>,
    pub language: Option<String>,
    pub seen: bool,
    pub received_at: DateTime<Utc>,
    pub category: Category,
    pub priority_until: Option<DateTime<Utc>>,
}

impl Article {
    pub fn new(id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            timestamp,
            source: None,
            title: None,
            industry: None,
            summary: None,
            link: None,
            companies: None,
            countries: None,
            language: None,
            seen: false,
            received_at: timestamp,
            category: Category::Standard,
            priority_until: None,
        }
    }

    /// Sponsored and statistics articles float to the top until their
    /// `priority_until` passes.
    pub fn is_prioritized(&self, now: DateTime<Utc>) -> bool {
        matches!(self.category, Category::Sponsored | Category::Statistics)
            && self.priority_until.is_some_and(|until| until > now)
    }

    /// Sort tier: 0 = prioritized sponsored, 1 = prioritized statistics,
    /// 2 = everything else.
    pub fn priority_tier(&self, now: DateTime<Utc>) -> u8 {
        if !self.is_prioritized(now) {
            return 2;
        }
        match self.category {
            Category::Sponsored => 0,
            Category::Statistics => 1,
            Category::Standard => 2,
        }
    }

    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("(Untitled)")
    }
}

/// Partial update applied by `ArticleStore::update`.
#[derive(Debug, Clone, Default)]
pub struct ArticleUpdate {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub link: Option<String>,
    pub industry: Option<String>,
    pub language: Option<String>,
    pub source: Option<String>,
    pub category: Option<Category>,
    pub priority_until: Option<DateTime<Utc>>,
    pub seen: Option<bool>,
}

impl ArticleUpdate {
    /// Applies the set fields. Returns true when the article went from
    /// unseen to seen.
    pub fn apply(&self, article: &mut Article) -> bool {
        if let Some(ref title) = self.title {
            article.title = Some(title.clone());
        }
        if let Some(ref summary) = self.summary {
            article.summary = Some(summary.clone());
        }
        if let Some(ref link) = self.link {
            article.link = Some(link.clone());
        }
        if let Some(ref industry) = self.industry {
            article.industry = Some(industry.clone());
        }
        if let Some(ref language) = self.language {
            article.language = Some(language.clone());
        }
        if let Some(ref source) = self.source {
            article.source = Some(source.clone());
        }
        if let Some(category) = self.category {
            article.category = category;
        }
        if let Some(until) = self.priority_until {
            article.priority_until = Some(until);
        }

        let was_seen = article.seen;
        if let Some(seen) = self.seen {
            article.seen = seen;
        }
        !was_seen && article.seen
    }
}

/// Article as it arrives from the transport, before normalization.
///
/// `companies` and `countries` are either JSON-encoded strings or objects;
/// timestamps are RFC 3339 strings or epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawArticle {
    pub id: String,
    pub timestamp: Option<Value>,
    pub source: Option<String>,
    pub title: Option<String>,
    pub industry: Option<String>,
    pub summary: Option<String>,
    pub link: Option<String>,
    pub companies: Option<Value>,
    pub countries: Option<Value>,
    pub language: Option<String>,
    pub category: Option<String>,
    pub priority_until: Option<Value>,
}

impl RawArticle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(Value::String(timestamp.to_rfc3339()));
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}
