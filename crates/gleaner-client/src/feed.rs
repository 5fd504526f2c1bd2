use std::sync::Arc;

use gleaner_core::error::AppError;
use gleaner_core::models::{Category, Record};
use gleaner_core::task::Task;
use gleaner_core::traits::{Extractor, Fetcher};
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::listing::{collapse, filter_by_term, parse_timestamp};

/// Element selectors for RSS 2.0 and Atom documents.
///
/// The HTML parser lowercases tag names, so `pubDate` arrives as `pubdate`.
#[derive(Debug)]
pub struct FeedSelectors {
    item: Selector,
    title: Selector,
    link: Selector,
    guid: Selector,
    description: Selector,
    pub_date: Selector,
    category: Selector,
    author: Selector,
}

impl FeedSelectors {
    pub fn new() -> Result<Self, AppError> {
        let parse = |css: &str| {
            Selector::parse(css)
                .map_err(|e| AppError::ConfigError(format!("invalid selector '{css}': {e}")))
        };
        Ok(Self {
            item: parse("item, entry")?,
            title: parse("title")?,
            link: parse("link")?,
            guid: parse("guid, id")?,
            description: parse("description, summary, content")?,
            pub_date: parse("pubdate, published, updated")?,
            category: parse("category")?,
            author: parse("author, creator")?,
        })
    }
}

/// Extracts records from an RSS (or Atom) feed, optionally keeping only
/// items that mention the task's search term.
#[derive(Clone)]
pub struct FeedExtractor<F: Fetcher> {
    fetcher: F,
    selectors: Arc<FeedSelectors>,
}

impl<F: Fetcher> FeedExtractor<F> {
    pub fn new(fetcher: F, selectors: Arc<FeedSelectors>) -> Self {
        Self { fetcher, selectors }
    }
}

impl<F: Fetcher> Extractor for FeedExtractor<F> {
    async fn extract(&self, url: &str, task: &Task) -> Result<Vec<Record>, AppError> {
        let body = self.fetcher.fetch(url).await?;
        let records = parse_feed(&body, url, &self.selectors)?;
        let total = records.len();
        let records = match task.search_term.as_deref() {
            Some(term) => filter_by_term(records, term),
            None => records,
        };
        tracing::debug!(%url, %total, kept = %records.len(), "Feed parsed");
        Ok(records)
    }
}

/// Parse feed items into records. A body with no items at all is a parse
/// error so the worker retries it.
pub fn parse_feed(
    body: &str,
    feed_url: &str,
    selectors: &FeedSelectors,
) -> Result<Vec<Record>, AppError> {
    let base = Url::parse(feed_url)
        .map_err(|e| AppError::ParseError(format!("invalid feed url {feed_url}: {e}")))?;
    let source = base.host_str().map(str::to_string);

    // CDATA sections are bogus comments to an HTML parser; unwrap them first.
    let body = body.replace("<![CDATA[", "").replace("]]>", "");
    let document = Html::parse_document(&body);

    let items: Vec<_> = document.select(&selectors.item).collect();
    if items.is_empty() {
        return Err(AppError::ParseError(format!("no feed items found at {feed_url}")));
    }

    let mut records = Vec::new();
    for item in items {
        let title = text_of(item, &selectors.title).unwrap_or_default();
        let Some(link) = item_link(item, selectors).and_then(|l| base.join(&l).ok()) else {
            tracing::debug!(%title, "Skipping feed item without a link");
            continue;
        };

        let mut record = Record::new(link.as_str(), title).with_category(Category::Rss);
        record.summary = text_of(item, &selectors.description);
        record.author = text_of(item, &selectors.author);
        record.published_at = text_of(item, &selectors.pub_date).and_then(|d| parse_timestamp(&d));
        record.tags = item
            .select(&selectors.category)
            .map(|c| collapse(c.text()))
            .filter(|c| !c.is_empty())
            .collect();
        record.source = source.clone();
        records.push(record);
    }
    Ok(records)
}

/// `<link>` is a void element to the HTML parser, so an RSS link's URL ends
/// up in the text node right after it. Atom links carry it in `href`.
fn item_link(item: ElementRef<'_>, selectors: &FeedSelectors) -> Option<String> {
    let from_link = item.select(&selectors.link).find_map(|link| {
        if let Some(href) = link.value().attr("href") {
            return Some(href.trim().to_string());
        }
        let inline = collapse(link.text());
        if !inline.is_empty() {
            return Some(inline);
        }
        link.next_sibling()
            .and_then(|node| node.value().as_text().map(|t| t.trim().to_string()))
            .filter(|t| !t.is_empty())
    });
    from_link.or_else(|| text_of(item, &selectors.guid).filter(|g| g.starts_with("http")))
}

fn text_of(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .map(|el| collapse(el.text()))
        .find(|text| !text.is_empty())
}
