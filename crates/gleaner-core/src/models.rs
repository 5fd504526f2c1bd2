use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::AppError;

/// The closed set of source kinds a task can target.
///
/// Selects both the extractor a worker dispatches to and the bucket a
/// record lands in at consolidation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Category {
    Blog,
    News,
    Rss,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Blog, Category::News, Category::Rss];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Blog => "blog",
            Category::News => "news",
            Category::Rss => "rss",
        }
    }

    /// Feed searches need a term to filter on; listing pages do not.
    pub fn requires_search_term(&self) -> bool {
        matches!(self, Category::Rss)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Category {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "blog" => Ok(Category::Blog),
            "news" => Ok(Category::News),
            "rss" => Ok(Category::Rss),
            other => Err(AppError::UnsupportedCategory(other.to_string())),
        }
    }
}

impl TryFrom<String> for Category {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One structured item produced by an extractor (typically an article).
///
/// The URL is the identity key: consolidation and the persistent store both
/// deduplicate on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default, alias = "publication_date_datetime")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Missing or unrecognised values deserialize as `None` so the record
    /// can still be reclassified during consolidation.
    #[serde(default, alias = "source_type", deserialize_with = "lenient_category")]
    pub category: Option<Category>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "unix_epoch")]
    pub scraped_at: DateTime<Utc>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<u64>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            author: None,
            published_at: None,
            summary: None,
            tags: Vec::new(),
            category: None,
            source: None,
            scraped_at: Utc::now(),
            worker_id: None,
            task_id: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_scraped_at(mut self, scraped_at: DateTime<Utc>) -> Self {
        self.scraped_at = scraped_at;
        self
    }

    /// Turn blank optional text fields into `None`. CSV cannot tell an
    /// empty string from a missing value, so every output stores the `None`.
    pub fn clear_blank_fields(&mut self) {
        for field in [
            &mut self.author,
            &mut self.summary,
            &mut self.source,
            &mut self.worker_id,
        ] {
            if field.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *field = None;
            }
        }
    }
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

fn lenient_category<'de, D>(deserializer: D) -> Result<Option<Category>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.parse().ok()))
}
