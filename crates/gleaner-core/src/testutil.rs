//! Shared mock implementations for testing.
//!
//! Available in this crate's tests and, through the `testutil` feature, in
//! the tests of the other workspace crates.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::AppError;
use crate::models::{Category, Record};
use crate::orchestrator::{ProgressSnapshot, RunEvent, RunReporter};
use crate::task::Task;
use crate::traits::{Extractor, ExtractorFactory, LoadReport, RecordStore, StoreStats};
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// MockExtractorFactory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Succeed,
    AlwaysFail,
    NonRetryable,
    /// Fail this many calls per URL, then succeed.
    FailTimes(usize),
}

/// Mock extractor factory with configurable behavior.
///
/// Every extractor it creates shares one call log, so tests can inspect how
/// many times (and when) each URL was extracted.
#[derive(Debug, Clone)]
pub struct MockExtractorFactory {
    behavior: Behavior,
    records_per_task: usize,
    delay: Duration,
    unsupported: HashSet<Category>,
    calls: Arc<Mutex<Vec<(String, Instant)>>>,
}

impl MockExtractorFactory {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            records_per_task: 1,
            delay: Duration::ZERO,
            unsupported: HashSet::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// One record per task, every time.
    pub fn succeeding() -> Self {
        Self::with_behavior(Behavior::Succeed)
    }

    pub fn with_records(records_per_task: usize) -> Self {
        Self {
            records_per_task,
            ..Self::succeeding()
        }
    }

    pub fn always_failing() -> Self {
        Self::with_behavior(Behavior::AlwaysFail)
    }

    /// Fails with an error that is not worth retrying.
    pub fn non_retryable() -> Self {
        Self::with_behavior(Behavior::NonRetryable)
    }

    pub fn failing_times(n: usize) -> Self {
        Self::with_behavior(Behavior::FailTimes(n))
    }

    /// Mark a category as having no extractor.
    pub fn without(mut self, category: Category) -> Self {
        self.unsupported.insert(category);
        self
    }

    /// Sleep this long inside every extraction.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, url: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, at)| *at)
            .collect()
    }
}

impl ExtractorFactory for MockExtractorFactory {
    type Extractor = MockExtractor;

    fn supports(&self, category: Category) -> bool {
        !self.unsupported.contains(&category)
    }

    fn create(&self, category: Category) -> Result<MockExtractor, AppError> {
        if !self.supports(category) {
            return Err(AppError::UnsupportedCategory(category.to_string()));
        }
        Ok(MockExtractor {
            factory: self.clone(),
        })
    }
}

/// Extractor produced by [`MockExtractorFactory`].
#[derive(Debug, Clone)]
pub struct MockExtractor {
    factory: MockExtractorFactory,
}

impl Extractor for MockExtractor {
    async fn extract(&self, url: &str, task: &Task) -> Result<Vec<Record>, AppError> {
        let previous_calls = {
            let mut calls = self.factory.calls.lock().unwrap();
            let previous = calls.iter().filter(|(u, _)| u == url).count();
            calls.push((url.to_string(), Instant::now()));
            previous
        };

        if !self.factory.delay.is_zero() {
            tokio::time::sleep(self.factory.delay).await;
        }

        match self.factory.behavior {
            Behavior::AlwaysFail => Err(AppError::HttpError(format!("HTTP 503 for {url}"))),
            Behavior::NonRetryable => Err(AppError::ConfigError("extractor misconfigured".into())),
            Behavior::FailTimes(n) if previous_calls < n => {
                Err(AppError::NetworkError(format!("connection reset ({url})")))
            }
            Behavior::Succeed | Behavior::FailTimes(_) => Ok((0..self.factory.records_per_task)
                .map(|i| {
                    let mut record = Record::new(
                        format!("{url}/item-{i}"),
                        format!("Item {i} of task {}", task.id),
                    );
                    record.source = Some("mock".into());
                    record
                })
                .collect()),
        }
    }
}

// ---------------------------------------------------------------------------
// MockStore
// ---------------------------------------------------------------------------

/// In-memory record store with the same upsert rules as the database.
#[derive(Debug, Clone, Default)]
pub struct MockStore {
    records: Arc<Mutex<HashMap<String, Record>>>,
    upsert_error: Option<String>,
    upsert_calls: Arc<AtomicUsize>,
}

impl MockStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every upsert fails with a database error carrying `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            upsert_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, url: &str) -> Option<Record> {
        self.records.lock().unwrap().get(url).cloned()
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }
}

impl RecordStore for MockStore {
    async fn upsert_records(&self, records: &[Record]) -> Result<LoadReport, AppError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.upsert_error {
            return Err(AppError::DatabaseError(message.clone()));
        }

        let mut stored = self.records.lock().unwrap();
        let mut report = LoadReport::default();
        for record in records {
            match stored.get(&record.url) {
                None => report.inserted += 1,
                Some(existing) if existing.scraped_at < record.scraped_at => report.updated += 1,
                Some(_) => {
                    report.unchanged += 1;
                    continue;
                }
            }
            stored.insert(record.url.clone(), record.clone());
        }
        Ok(report)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Record>, AppError> {
        let mut records: Vec<_> = self.records.lock().unwrap().values().cloned().collect();
        records.sort_by(|a, b| b.scraped_at.cmp(&a.scraped_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn stats(&self) -> Result<StoreStats, AppError> {
        let records = self.records.lock().unwrap();
        let mut by_category = BTreeMap::new();
        let mut sources: HashMap<String, i64> = HashMap::new();
        for record in records.values() {
            let category = record.category.map_or("unclassified", |c| c.as_str());
            *by_category.entry(category.to_string()).or_insert(0) += 1;
            if let Some(source) = &record.source {
                *sources.entry(source.clone()).or_insert(0) += 1;
            }
        }
        let mut top_sources: Vec<_> = sources.into_iter().collect();
        top_sources.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_sources.truncate(10);

        Ok(StoreStats {
            total_records: records.len() as i64,
            by_category,
            top_sources,
        })
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock reporter that records worker and run events by label, keeping a
/// copy of every progress snapshot.
#[derive(Debug, Default, Clone)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
    pub snapshots: Arc<Mutex<Vec<ProgressSnapshot>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.as_str() == label)
            .count()
    }

    /// Progress snapshots in the order they were reported.
    pub fn progress(&self) -> Vec<ProgressSnapshot> {
        self.snapshots.lock().unwrap().clone()
    }

    fn push(&self, label: &str) {
        self.events.lock().unwrap().push(label.to_string());
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        self.push(match &event {
            WorkerEvent::Started { .. } => "Started",
            WorkerEvent::Polling => "Polling",
            WorkerEvent::TaskClaimed { .. } => "TaskClaimed",
            WorkerEvent::AttemptFailed { .. } => "AttemptFailed",
            WorkerEvent::TaskCompleted { .. } => "TaskCompleted",
            WorkerEvent::TaskFailed { .. } => "TaskFailed",
            WorkerEvent::SentinelReceived { .. } => "SentinelReceived",
            WorkerEvent::Stopped { .. } => "Stopped",
        });
    }
}

impl RunReporter for MockReporter {
    fn report(&self, event: RunEvent<'_>) {
        if let RunEvent::Progress(snapshot) = &event {
            self.snapshots.lock().unwrap().push((*snapshot).clone());
        }
        self.push(match &event {
            RunEvent::TasksAdded { .. } => "TasksAdded",
            RunEvent::WorkersStarted { .. } => "WorkersStarted",
            RunEvent::Progress(_) => "Progress",
            RunEvent::ResultCollected { .. } => "ResultCollected",
            RunEvent::CollectionAborted { .. } => "CollectionAborted",
            RunEvent::ConsolidationFinished { .. } => "ConsolidationFinished",
            RunEvent::ConsolidationFailed { .. } => "ConsolidationFailed",
            RunEvent::SummaryWritten { .. } => "SummaryWritten",
            RunEvent::WorkersStopped { .. } => "WorkersStopped",
        });
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// A fixed instant that test timestamps are offset from.
pub fn test_epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH + TimeDelta::days(20_000)
}

/// A record scraped `offset_secs` after [`test_epoch`].
pub fn record_at(url: &str, category: Option<Category>, offset_secs: i64) -> Record {
    let mut record = Record::new(url, format!("Title for {url}"))
        .with_scraped_at(test_epoch() + TimeDelta::seconds(offset_secs));
    record.category = category;
    record.source = Some("example".into());
    record
}

/// One task per category, ids starting at 1.
pub fn one_task_per_category() -> Vec<Task> {
    vec![
        Task::new(1, "https://blog.example.com", Category::Blog),
        Task::new(2, "https://news.example.com", Category::News),
        Task::new(3, "https://feeds.example.com/rss", Category::Rss).with_search_term("rust"),
    ]
}
