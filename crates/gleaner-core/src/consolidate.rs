//! Merge per-worker partial files into one deduplicated dataset.
//!
//! Pipeline: read partials → order → bucket by category → merge bucket files
//! → merge combined CSV → load into the store → delete the partials read.
//! Any error before the last step leaves every partial file in place.
//!
//! Ordering: records are sorted by `scraped_at`; ties keep partial-file name
//! order, then line order. Deduplication keeps the last record per URL under
//! that order, so the most recently scraped version wins.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::{Category, Record};
use crate::output::OutputManager;
use crate::traits::{LoadReport, RecordStore};

const BLOG_KEYWORDS: &[&str] = &["blog", "medium", "wordpress"];
const NEWS_KEYWORDS: &[&str] = &["news", "cnn", "bbc", "reuters"];
const RSS_KEYWORDS: &[&str] = &["rss", "feed", "xml"];

/// Where a record is filed during consolidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    Category(Category),
    /// Records with no category and no URL heuristic match.
    Unclassified,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Category(category) => category.as_str(),
            Bucket::Unclassified => "unclassified",
        }
    }
}

/// Counts from one consolidation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationReport {
    pub files_read: usize,
    /// Partial files that could not be read; they are kept on disk.
    pub files_skipped: usize,
    /// Lines that did not parse as a record or had no URL.
    pub fragments_skipped: usize,
    pub records_read: usize,
    /// Records without a category that a URL heuristic assigned one.
    pub reclassified: usize,
    /// Records filed under the `unclassified` bucket.
    pub unclassified: usize,
    /// Size of each bucket file after the merge.
    pub bucket_totals: BTreeMap<String, usize>,
    pub combined_total: usize,
    pub load: LoadReport,
    pub files_removed: usize,
}

/// Runs the consolidation pipeline over an output directory.
pub struct Consolidator<S: RecordStore> {
    output: OutputManager,
    store: S,
}

impl<S: RecordStore> Consolidator<S> {
    pub fn new(output: OutputManager, store: S) -> Self {
        Self { output, store }
    }

    pub async fn consolidate(&self) -> Result<ConsolidationReport, AppError> {
        let mut report = ConsolidationReport::default();

        let paths = self.output.list_partials().await?;
        if paths.is_empty() {
            tracing::info!(dir = %self.output.dir().display(), "No partial files to consolidate");
            return Ok(report);
        }

        let mut stamped = Vec::new();
        let mut consumed = Vec::new();
        for (file_index, path) in paths.iter().enumerate() {
            let body = match tokio::fs::read_to_string(path).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable partial file");
                    report.files_skipped += 1;
                    continue;
                }
            };

            let (records, skipped) = parse_partial(&body);
            if skipped > 0 {
                tracing::warn!(path = %path.display(), %skipped, "Skipped malformed fragments");
            }
            report.fragments_skipped += skipped;
            report.files_read += 1;
            consumed.push(path.clone());

            for (line, record) in records {
                stamped.push((record.scraped_at, file_index, line, record));
            }
        }

        stamped.sort_by_key(|(scraped_at, file_index, line, _)| (*scraped_at, *file_index, *line));
        report.records_read = stamped.len();

        let mut buckets: BTreeMap<Bucket, Vec<Record>> = BTreeMap::new();
        let mut incoming = Vec::with_capacity(stamped.len());
        for (_, _, _, mut record) in stamped {
            let bucket = match record.category {
                Some(category) => Bucket::Category(category),
                None => match classify_by_url(&record.url) {
                    Some(category) => {
                        record.category = Some(category);
                        record
                            .metadata
                            .insert("reclassified".into(), serde_json::Value::Bool(true));
                        report.reclassified += 1;
                        Bucket::Category(category)
                    }
                    None => {
                        report.unclassified += 1;
                        Bucket::Unclassified
                    }
                },
            };
            buckets.entry(bucket).or_default().push(record.clone());
            incoming.push(record);
        }

        if report.reclassified > 0 || report.unclassified > 0 {
            tracing::warn!(
                reclassified = %report.reclassified,
                unclassified = %report.unclassified,
                "Records arrived without a category"
            );
        }

        for (bucket, records) in buckets {
            let total = self.merge_bucket(bucket, records).await?;
            tracing::info!(bucket = %bucket.as_str(), %total, "Bucket file updated");
            report.bucket_totals.insert(bucket.as_str().to_string(), total);
        }

        let combined = self.merge_combined(incoming).await?;
        report.combined_total = combined.len();

        report.load = self.store.upsert_records(&combined).await?;
        tracing::info!(
            inserted = %report.load.inserted,
            updated = %report.load.updated,
            unchanged = %report.load.unchanged,
            "Combined dataset loaded into store"
        );

        for path in consumed {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => report.files_removed += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial file")
                }
            }
        }
        tracing::info!(removed = %report.files_removed, "Partial files cleaned up");

        Ok(report)
    }

    /// Create-or-append the bucket's JSON file, returning its new size.
    async fn merge_bucket(&self, bucket: Bucket, records: Vec<Record>) -> Result<usize, AppError> {
        let path = self.output.bucket_path(bucket.as_str());
        let mut merged = match read_optional(&path).await? {
            Some(body) => serde_json::from_str::<Vec<Record>>(&body)
                .map_err(|e| AppError::ParseError(format!("{}: {e}", path.display())))?,
            None => Vec::new(),
        };
        merged.extend(records);
        let merged = dedup_by_url(merged);

        let body = serde_json::to_vec_pretty(&merged)?;
        self.output.write_atomic(&path, &body).await?;
        Ok(merged.len())
    }

    /// Merge `records` into `combined.csv` and return the full dataset.
    async fn merge_combined(&self, records: Vec<Record>) -> Result<Vec<Record>, AppError> {
        let path = self.output.combined_path();
        let mut merged = match read_optional(&path).await? {
            Some(body) => read_combined(&body)
                .map_err(|e| AppError::CsvError(format!("{}: {e}", path.display())))?,
            None => Vec::new(),
        };
        merged.extend(records);
        let merged = dedup_by_url(merged);

        self.output
            .write_atomic(&path, &write_combined(&merged)?)
            .await?;
        Ok(merged)
    }
}

/// Guess a category from keywords in the URL.
pub fn classify_by_url(url: &str) -> Option<Category> {
    let url = url.to_lowercase();
    let matches = |keywords: &[&str]| keywords.iter().any(|k| url.contains(k));

    if matches(BLOG_KEYWORDS) {
        Some(Category::Blog)
    } else if matches(NEWS_KEYWORDS) {
        Some(Category::News)
    } else if matches(RSS_KEYWORDS) {
        Some(Category::Rss)
    } else {
        None
    }
}

/// Keep one record per URL: the latest by `scraped_at`, and among equal
/// timestamps the one that came last. Output is ordered by `scraped_at`.
pub fn dedup_by_url(mut records: Vec<Record>) -> Vec<Record> {
    records.sort_by_key(|r| r.scraped_at);

    let mut seen = HashSet::new();
    let mut kept: Vec<Record> = records
        .into_iter()
        .rev()
        .filter(|r| seen.insert(r.url.clone()))
        .collect();
    kept.reverse();
    kept
}

/// Parse a JSON-lines partial file, returning `(line, record)` pairs and
/// the number of lines that had to be skipped.
fn parse_partial(body: &str) -> (Vec<(usize, Record)>, usize) {
    let mut records = Vec::new();
    let mut skipped = 0;

    for (line_no, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Record>(line) {
            Ok(mut record) if !record.url.trim().is_empty() => {
                record.clear_blank_fields();
                records.push((line_no, record));
            }
            Ok(_) => skipped += 1,
            Err(e) => {
                tracing::debug!(line = %line_no, error = %e, "Unparseable fragment");
                skipped += 1;
            }
        }
    }

    (records, skipped)
}

async fn read_optional(path: &Path) -> Result<Option<String>, AppError> {
    match tokio::fs::read_to_string(path).await {
        Ok(body) => Ok(Some(body)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// -- Combined CSV row: one column per record field, lists and maps as JSON --

#[derive(Debug, Serialize, Deserialize)]
struct CombinedRow {
    url: String,
    title: String,
    author: Option<String>,
    published_at: Option<DateTime<Utc>>,
    summary: Option<String>,
    tags: String,
    category: Option<String>,
    source: Option<String>,
    scraped_at: DateTime<Utc>,
    worker_id: Option<String>,
    task_id: Option<u64>,
    metadata: String,
}

impl CombinedRow {
    fn from_record(record: &Record) -> Result<Self, AppError> {
        let mut record = record.clone();
        record.clear_blank_fields();
        Ok(Self {
            tags: serde_json::to_string(&record.tags)?,
            metadata: serde_json::to_string(&record.metadata)?,
            url: record.url,
            title: record.title,
            author: record.author,
            published_at: record.published_at,
            summary: record.summary,
            category: record.category.map(|c| c.as_str().to_string()),
            source: record.source,
            scraped_at: record.scraped_at,
            worker_id: record.worker_id,
            task_id: record.task_id,
        })
    }

    fn into_record(self) -> Record {
        Record {
            url: self.url,
            title: self.title,
            author: self.author,
            published_at: self.published_at,
            summary: self.summary,
            tags: serde_json::from_str(&self.tags).unwrap_or_default(),
            category: self.category.and_then(|c| c.parse().ok()),
            source: self.source,
            scraped_at: self.scraped_at,
            worker_id: self.worker_id,
            task_id: self.task_id,
            metadata: serde_json::from_str(&self.metadata).unwrap_or_default(),
        }
    }
}

fn read_combined(body: &str) -> Result<Vec<Record>, csv::Error> {
    let mut reader = csv::Reader::from_reader(body.as_bytes());
    reader
        .deserialize::<CombinedRow>()
        .map(|row| row.map(CombinedRow::into_record))
        .collect()
}

fn write_combined(records: &[Record]) -> Result<Vec<u8>, AppError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in records {
        writer.serialize(CombinedRow::from_record(record)?)?;
    }
    writer
        .into_inner()
        .map_err(|e| AppError::CsvError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockStore, record_at};
    use chrono::TimeDelta;

    fn setup() -> (tempfile::TempDir, OutputManager) {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputManager::new(dir.path());
        (dir, output)
    }

    fn read_bucket(output: &OutputManager, bucket: &str) -> Vec<Record> {
        let body = std::fs::read_to_string(output.bucket_path(bucket)).unwrap();
        serde_json::from_str(&body).unwrap()
    }

    fn read_combined_file(output: &OutputManager) -> Vec<Record> {
        let body = std::fs::read_to_string(output.combined_path()).unwrap();
        read_combined(&body).unwrap()
    }

    #[tokio::test]
    async fn groups_by_category_loads_store_and_removes_partials() {
        let (_dir, output) = setup();
        let store = MockStore::empty();
        output
            .write_partial("worker-0", &[record_at("https://a.example/1", Some(Category::Blog), 0)])
            .await
            .unwrap();
        output
            .write_partial(
                "worker-1",
                &[
                    record_at("https://b.example/1", Some(Category::News), 1),
                    record_at("https://c.example/1", Some(Category::Rss), 2),
                ],
            )
            .await
            .unwrap();

        let report = Consolidator::new(output.clone(), store.clone())
            .consolidate()
            .await
            .unwrap();

        assert_eq!(report.files_read, 2);
        assert_eq!(report.records_read, 3);
        assert_eq!(report.combined_total, 3);
        assert_eq!(report.load.inserted, 3);
        assert_eq!(report.files_removed, 2);
        assert_eq!(report.bucket_totals.get("blog"), Some(&1));
        assert_eq!(report.bucket_totals.get("news"), Some(&1));
        assert_eq!(report.bucket_totals.get("rss"), Some(&1));

        assert_eq!(read_bucket(&output, "news")[0].url, "https://b.example/1");
        assert_eq!(read_combined_file(&output).len(), 3);
        assert_eq!(store.len(), 3);
        assert!(output.list_partials().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn uncategorized_records_are_reclassified_or_flagged() {
        let (_dir, output) = setup();
        output
            .write_partial(
                "worker-0",
                &[
                    record_at("https://someone.wordpress.com/post", None, 0),
                    record_at("https://example.com/feed.xml", None, 1),
                    record_at("https://example.com/page", None, 2),
                ],
            )
            .await
            .unwrap();

        let report = Consolidator::new(output.clone(), MockStore::empty())
            .consolidate()
            .await
            .unwrap();

        assert_eq!(report.reclassified, 2);
        assert_eq!(report.unclassified, 1);

        let blog = read_bucket(&output, "blog");
        assert_eq!(blog[0].category, Some(Category::Blog));
        assert_eq!(blog[0].metadata.get("reclassified"), Some(&serde_json::Value::Bool(true)));
        assert_eq!(read_bucket(&output, "rss").len(), 1);
        assert_eq!(read_bucket(&output, "unclassified")[0].url, "https://example.com/page");
        assert!(!output.bucket_path("news").exists());
    }

    #[tokio::test]
    async fn malformed_fragments_are_skipped_not_fatal() {
        let (dir, output) = setup();
        let good = serde_json::to_string(&record_at("https://a.example/1", Some(Category::News), 0))
            .unwrap();
        std::fs::write(
            dir.path().join("partial_worker-0_x.jsonl"),
            format!("{good}\n{{\"url\": \"https://trunc\n[1,2,3]\n{{\"title\": \"no url\"}}\n"),
        )
        .unwrap();

        let report = Consolidator::new(output.clone(), MockStore::empty())
            .consolidate()
            .await
            .unwrap();

        assert_eq!(report.records_read, 1);
        assert_eq!(report.fragments_skipped, 3);
        assert_eq!(report.combined_total, 1);
    }

    #[tokio::test]
    async fn consolidating_the_same_partials_twice_is_idempotent() {
        let (_dir, output) = setup();
        let store = MockStore::empty();
        let records = vec![
            record_at("https://a.example/1", Some(Category::Blog), 0),
            record_at("https://b.example/1", Some(Category::News), 1),
        ];
        let consolidator = Consolidator::new(output.clone(), store.clone());

        output.write_partial("worker-0", &records).await.unwrap();
        let first = consolidator.consolidate().await.unwrap();

        output.write_partial("worker-0", &records).await.unwrap();
        let second = consolidator.consolidate().await.unwrap();

        assert_eq!(first.combined_total, 2);
        assert_eq!(second.combined_total, 2);
        assert_eq!(second.load.inserted, 0);
        assert_eq!(second.load.updated, 0);
        assert_eq!(store.len(), 2);

        let combined = read_combined_file(&output);
        let urls: HashSet<_> = combined.iter().map(|r| r.url.clone()).collect();
        assert_eq!(urls.len(), combined.len());
        assert_eq!(read_bucket(&output, "blog").len(), 1);
    }

    #[tokio::test]
    async fn same_url_in_two_partials_keeps_the_latest_scrape() {
        let (_dir, output) = setup();
        let mut older = record_at("https://a.example/story", Some(Category::News), 0);
        older.title = "old headline".into();
        let mut newer = record_at("https://a.example/story", Some(Category::News), 10);
        newer.title = "new headline".into();

        // Written newest first, so file order alone would pick the wrong one.
        output.write_partial("worker-0", &[newer]).await.unwrap();
        output.write_partial("worker-1", &[older]).await.unwrap();

        let report = Consolidator::new(output.clone(), MockStore::empty())
            .consolidate()
            .await
            .unwrap();

        assert_eq!(report.records_read, 2);
        assert_eq!(report.combined_total, 1);
        let combined = read_combined_file(&output);
        assert_eq!(combined[0].title, "new headline");
        assert_eq!(read_bucket(&output, "news")[0].title, "new headline");
    }

    #[tokio::test]
    async fn corrupt_bucket_file_aborts_and_keeps_partials() {
        let (_dir, output) = setup();
        std::fs::write(output.bucket_path("news"), "{not json").unwrap();
        output
            .write_partial("worker-0", &[record_at("https://a.example/1", Some(Category::News), 0)])
            .await
            .unwrap();

        let err = Consolidator::new(output.clone(), MockStore::empty())
            .consolidate()
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::ParseError(_)));
        assert_eq!(output.list_partials().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_failure_keeps_partials() {
        let (_dir, output) = setup();
        let store = MockStore::failing("locked");
        output
            .write_partial("worker-0", &[record_at("https://a.example/1", Some(Category::Blog), 0)])
            .await
            .unwrap();

        let err = Consolidator::new(output.clone(), store)
            .consolidate()
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::DatabaseError(_)));
        assert_eq!(output.list_partials().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_partials_is_a_no_op() {
        let (_dir, output) = setup();
        let store = MockStore::empty();
        let report = Consolidator::new(output.clone(), store.clone())
            .consolidate()
            .await
            .unwrap();

        assert_eq!(report.files_read, 0);
        assert_eq!(store.upsert_calls(), 0);
        assert!(!output.combined_path().exists());
    }

    #[test]
    fn dedup_keeps_latest_and_orders_by_scrape_time() {
        let base = DateTime::UNIX_EPOCH;
        let mut a1 = Record::new("https://a", "a1").with_scraped_at(base + TimeDelta::seconds(5));
        a1.summary = Some("first".into());
        let b = Record::new("https://b", "b").with_scraped_at(base + TimeDelta::seconds(1));
        let a2 = Record::new("https://a", "a2").with_scraped_at(base + TimeDelta::seconds(9));

        let deduped = dedup_by_url(vec![a1, b, a2]);
        let titles: Vec<_> = deduped.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["b", "a2"]);
    }

    #[test]
    fn dedup_tie_goes_to_the_later_record() {
        let at = DateTime::UNIX_EPOCH;
        let first = Record::new("https://a", "first").with_scraped_at(at);
        let second = Record::new("https://a", "second").with_scraped_at(at);
        assert_eq!(dedup_by_url(vec![first, second])[0].title, "second");
    }

    #[test]
    fn classify_by_url_follows_keyword_priority() {
        assert_eq!(classify_by_url("https://medium.com/@x/post"), Some(Category::Blog));
        assert_eq!(classify_by_url("https://www.BBC.com/news/1"), Some(Category::News));
        assert_eq!(classify_by_url("https://example.com/rss"), Some(Category::Rss));
        // "blog" outranks "feed"
        assert_eq!(classify_by_url("https://blog.example.com/feed"), Some(Category::Blog));
        assert_eq!(classify_by_url("https://example.com/"), None);
    }

    #[test]
    fn combined_csv_preserves_fields() {
        let mut record = record_at("https://a.example/1", Some(Category::Rss), 3);
        record.tags = vec!["inflation".into(), "rates".into()];
        record.author = Some("Jane, Doe".into());
        record.task_id = Some(4);
        record
            .metadata
            .insert("search_term".into(), serde_json::json!("inflation"));

        let bytes = write_combined(std::slice::from_ref(&record)).unwrap();
        let parsed = read_combined(std::str::from_utf8(&bytes).unwrap()).unwrap();

        assert_eq!(parsed, vec![record]);
    }

    #[tokio::test]
    async fn blank_text_fields_agree_across_outputs() {
        let (_dir, output) = setup();
        let store = MockStore::empty();
        let mut record = record_at("https://a.example/1", Some(Category::News), 0);
        record.summary = Some(String::new());
        record.author = Some("  ".into());
        output.write_partial("worker-0", &[record]).await.unwrap();

        Consolidator::new(output.clone(), store.clone())
            .consolidate()
            .await
            .unwrap();

        let bucket = read_bucket(&output, "news");
        let combined = read_combined_file(&output);
        let stored = store.get("https://a.example/1").unwrap();
        assert_eq!(bucket[0].summary, None);
        assert_eq!(bucket[0].author, None);
        assert_eq!(combined, bucket);
        assert_eq!(stored, bucket[0]);
    }
}
