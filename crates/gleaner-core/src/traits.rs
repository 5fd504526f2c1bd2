use std::collections::BTreeMap;
use std::future::Future;

use serde::Serialize;

use crate::error::AppError;
use crate::models::{Category, Record};
use crate::task::Task;

/// Fetches raw page or feed content from a URL.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Turns a URL into records for one category of source.
///
/// Workers retry failed calls on the same instance, so implementations
/// must not leave side effects behind that would corrupt a later attempt.
pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        url: &str,
        task: &Task,
    ) -> impl Future<Output = Result<Vec<Record>, AppError>> + Send;
}

/// Registry that hands out an extractor for each supported category.
///
/// Workers ask `supports` before dispatching, and create one extractor per
/// task which then serves every retry of that task.
pub trait ExtractorFactory: Send + Sync + Clone + 'static {
    type Extractor: Extractor;

    fn supports(&self, category: Category) -> bool;

    fn create(&self, category: Category) -> Result<Self::Extractor, AppError>;
}

/// Outcome of loading records into a [`RecordStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// URLs the store had never seen.
    pub inserted: u64,
    /// Known URLs whose stored row was older than the loaded record.
    pub updated: u64,
    /// Known URLs left as they were.
    pub unchanged: u64,
}

impl LoadReport {
    /// Rows the load actually wrote.
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Aggregate figures about the persisted dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_records: i64,
    pub by_category: BTreeMap<String, i64>,
    /// The most frequent sources, largest first.
    pub top_sources: Vec<(String, i64)>,
}

/// Persistent, queryable record storage keyed on URL.
///
/// `upsert_records` must be idempotent: loading the same records twice
/// leaves exactly one row per URL.
pub trait RecordStore: Send + Sync + Clone {
    fn upsert_records(
        &self,
        records: &[Record],
    ) -> impl Future<Output = Result<LoadReport, AppError>> + Send;

    /// Most recently scraped records first.
    fn recent(&self, limit: usize) -> impl Future<Output = Result<Vec<Record>, AppError>> + Send;

    fn stats(&self) -> impl Future<Output = Result<StoreStats, AppError>> + Send;
}
