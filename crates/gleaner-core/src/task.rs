use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{Category, Record};

/// An immutable job descriptor: what to fetch and which extractor to use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    /// Carried through the pipeline but not used to order dispatch.
    pub priority: i32,
    pub url: String,
    pub category: Category,
    pub search_term: Option<String>,
    /// Number of times this task went back on the queue after a worker
    /// exhausted its local retries.
    #[serde(default)]
    pub resubmissions: u32,
}

impl Task {
    pub fn new(id: u64, url: impl Into<String>, category: Category) -> Self {
        Self {
            id,
            priority: 1,
            url: url.into(),
            category,
            search_term: None,
            resubmissions: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_search_term(mut self, term: impl Into<String>) -> Self {
        self.search_term = Some(term.into());
        self
    }

    /// Whether another worker may pick this task up after local retries ran out.
    pub fn can_resubmit(&self, policy: &RetryPolicy) -> bool {
        self.resubmissions < policy.max_resubmissions
    }

    /// A copy of this task to put back on the queue.
    pub fn resubmitted(&self) -> Self {
        Self {
            resubmissions: self.resubmissions + 1,
            ..self.clone()
        }
    }
}

/// Local retry behaviour of a worker.
///
/// Backoff is constant: every failed attempt waits the same `backoff`
/// before the next one.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    /// How many times a task may be re-enqueued before its failure is final.
    pub max_resubmissions: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
            max_resubmissions: 3,
        }
    }
}

impl RetryPolicy {
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_max_resubmissions(mut self, max: u32) -> Self {
        self.max_resubmissions = max;
        self
    }
}

/// Outcome of one dispatch of a task to a worker.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: u64,
    pub worker_id: String,
    pub category: Category,
    pub records: Vec<Record>,
    pub succeeded: bool,
    /// Present iff `succeeded` is false.
    pub error_message: Option<String>,
    pub duration: Duration,
    /// Every error seen during this dispatch, including retried ones.
    pub errors: Vec<String>,
    pub extra: serde_json::Map<String, serde_json::Value>,
    pub attempts: u32,
    /// True when this result settles the task; false when the task was
    /// put back on the queue for another try.
    pub terminal: bool,
    pub partial_file: Option<PathBuf>,
}

impl TaskResult {
    pub fn success(
        task: &Task,
        worker_id: &str,
        records: Vec<Record>,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            task_id: task.id,
            worker_id: worker_id.to_string(),
            category: task.category,
            records,
            succeeded: true,
            error_message: None,
            duration,
            errors: Vec::new(),
            extra: serde_json::Map::new(),
            attempts,
            terminal: true,
            partial_file: None,
        }
    }

    pub fn failure(
        task: &Task,
        worker_id: &str,
        error: impl Into<String>,
        duration: Duration,
        attempts: u32,
        terminal: bool,
    ) -> Self {
        Self {
            task_id: task.id,
            worker_id: worker_id.to_string(),
            category: task.category,
            records: Vec::new(),
            succeeded: false,
            error_message: Some(error.into()),
            duration,
            errors: Vec::new(),
            extra: serde_json::Map::new(),
            attempts,
            terminal,
            partial_file: None,
        }
    }

    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }
}

/// What a worker is doing right now, as seen by the orchestrator's monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
        }
    }
}

/// Configuration for a single worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// How long a dequeue waits before re-checking the stop flag.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
