use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gleaner_core::error::AppError;
use gleaner_core::models::{Category, Record};
use gleaner_core::task::Task;
use gleaner_core::traits::{Extractor, Fetcher};
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// CSS selectors describing a listing page: one `item` per article, the
/// rest evaluated inside each item.
#[derive(Debug, Clone)]
pub struct ListingSelectors {
    pub item: String,
    pub title: String,
    pub link: String,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub time: Option<String>,
}

impl ListingSelectors {
    pub fn news() -> Self {
        Self {
            item: "article, .story, .news-item".into(),
            title: "h1, h2, h3, .headline, .title".into(),
            link: "a[href]".into(),
            summary: Some(".summary, .description, p".into()),
            author: Some(".author, .byline, [rel=author]".into()),
            time: Some("time".into()),
        }
    }

    pub fn blog() -> Self {
        Self {
            item: "article, .post, .blog-post, .entry".into(),
            title: ".entry-title, .post-title, h2, h1".into(),
            link: "a[href]".into(),
            summary: Some(".excerpt, .entry-summary, p".into()),
            author: Some(".author, .byline, [rel=author]".into()),
            time: Some("time".into()),
        }
    }

    pub fn compile(&self) -> Result<CompiledSelectors, AppError> {
        Ok(CompiledSelectors {
            item: parse_selector(&self.item)?,
            title: parse_selector(&self.title)?,
            link: parse_selector(&self.link)?,
            summary: self.summary.as_deref().map(parse_selector).transpose()?,
            author: self.author.as_deref().map(parse_selector).transpose()?,
            time: self.time.as_deref().map(parse_selector).transpose()?,
        })
    }
}

fn parse_selector(css: &str) -> Result<Selector, AppError> {
    Selector::parse(css).map_err(|e| AppError::ConfigError(format!("invalid selector '{css}': {e}")))
}

#[derive(Debug)]
pub struct CompiledSelectors {
    item: Selector,
    title: Selector,
    link: Selector,
    summary: Option<Selector>,
    author: Option<Selector>,
    time: Option<Selector>,
}

/// Extracts article records from an HTML listing page (news front pages,
/// blog indexes).
#[derive(Clone)]
pub struct HtmlListingExtractor<F: Fetcher> {
    fetcher: F,
    category: Category,
    selectors: Arc<CompiledSelectors>,
}

impl<F: Fetcher> HtmlListingExtractor<F> {
    pub fn new(fetcher: F, category: Category, selectors: Arc<CompiledSelectors>) -> Self {
        Self {
            fetcher,
            category,
            selectors,
        }
    }
}

impl<F: Fetcher> Extractor for HtmlListingExtractor<F> {
    async fn extract(&self, url: &str, task: &Task) -> Result<Vec<Record>, AppError> {
        let html = self.fetcher.fetch(url).await?;
        let records = parse_listing(&html, url, self.category, &self.selectors)?;
        let records = match task.search_term.as_deref() {
            Some(term) => filter_by_term(records, term),
            None => records,
        };
        tracing::debug!(%url, count = %records.len(), "Listing parsed");
        Ok(records)
    }
}

/// Parse every item on a listing page. Items without a title or link are
/// skipped; links are resolved against `page_url`.
pub fn parse_listing(
    html: &str,
    page_url: &str,
    category: Category,
    selectors: &CompiledSelectors,
) -> Result<Vec<Record>, AppError> {
    let base = Url::parse(page_url)
        .map_err(|e| AppError::ParseError(format!("invalid page url {page_url}: {e}")))?;
    let source = base.host_str().map(str::to_string);
    let document = Html::parse_document(html);

    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for item in document.select(&selectors.item) {
        let Some(title) = first_text(item, &selectors.title) else {
            continue;
        };
        let Some(link) = item
            .select(&selectors.link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| base.join(href).ok())
        else {
            continue;
        };
        if !seen.insert(link.to_string()) {
            continue;
        }

        let mut record = Record::new(link.as_str(), title).with_category(category);
        record.summary = selectors
            .summary
            .as_ref()
            .and_then(|s| first_text(item, s));
        record.author = selectors.author.as_ref().and_then(|s| first_text(item, s));
        record.published_at = selectors.time.as_ref().and_then(|s| {
            let time = item.select(s).next()?;
            let raw = time
                .value()
                .attr("datetime")
                .map(str::to_string)
                .unwrap_or_else(|| collapse(time.text()));
            parse_timestamp(&raw)
        });
        record.source = source.clone();
        records.push(record);
    }
    Ok(records)
}

/// Keep records whose title or summary mention `term`, tagging them with it.
pub fn filter_by_term(records: Vec<Record>, term: &str) -> Vec<Record> {
    let needle = term.trim().to_lowercase();
    if needle.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|r| {
            r.title.to_lowercase().contains(&needle)
                || r
                    .summary
                    .as_deref()
                    .is_some_and(|s| s.to_lowercase().contains(&needle))
                || r.tags.iter().any(|t| t.to_lowercase().contains(&needle))
        })
        .map(|mut r| {
            if !r.tags.iter().any(|t| t.eq_ignore_ascii_case(term)) {
                r.tags.push(term.to_string());
            }
            r.metadata
                .insert("search_term".into(), serde_json::Value::String(term.to_string()));
            r
        })
        .collect()
}

/// RFC 3339 or RFC 2822, whichever parses.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .map(|el| collapse(el.text()))
        .find(|text| !text.is_empty())
}

/// Join text nodes and squeeze runs of whitespace.
pub(crate) fn collapse<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
