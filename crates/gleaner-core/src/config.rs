use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;
use crate::models::Category;
use crate::orchestrator::OrchestratorConfig;
use crate::task::{RetryPolicy, Task};
use crate::throttle::{MIN_RATE, RateLimitConfig};

/// The JSON document describing one run.
///
/// ```json
/// {
///   "min_workers": 1,
///   "max_workers": 4,
///   "rate_limit": { "max_requests_per_second": 1.0, "scope": "per_worker" },
///   "tasks": [
///     { "id": 1, "url": "https://example.com/news", "category": "news" },
///     { "id": 2, "url": "https://example.com/feed", "type": "rss", "search_word": "rust" }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Requested pool size; falls back to `max_workers`.
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    pub tasks: Vec<TaskConfig>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_resubmissions")]
    pub max_resubmissions: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_resubmissions: default_max_resubmissions(),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        RetryPolicy::default()
            .with_max_attempts(settings.max_attempts)
            .with_backoff(Duration::from_millis(settings.backoff_ms))
            .with_max_resubmissions(settings.max_resubmissions)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub id: u64,
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub url: String,
    #[serde(alias = "type")]
    pub category: Category,
    #[serde(default, alias = "search_word")]
    pub search_term: Option<String>,
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    4
}

fn default_monitor_interval() -> u64 {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    2000
}

fn default_max_resubmissions() -> u32 {
    3
}

fn default_priority() -> i32 {
    1
}

impl RunConfig {
    /// Load and validate a run configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path)
            .map_err(|e| AppError::ConfigError(format!("{}: {e}", path.display())))?;
        Self::from_json(&body)
    }

    pub fn from_json(body: &str) -> Result<Self, AppError> {
        let config: RunConfig =
            serde_json::from_str(body).map_err(|e| AppError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.min_workers < 1 {
            return Err(AppError::ConfigError("min_workers must be at least 1".into()));
        }
        if self.min_workers > self.max_workers {
            return Err(AppError::ConfigError(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        let rate = self.rate_limit.max_requests_per_second;
        if !(rate.is_finite() && rate > 0.0) {
            return Err(AppError::ConfigError(format!(
                "max_requests_per_second must be positive, got {rate}"
            )));
        }
        if rate < MIN_RATE {
            return Err(AppError::ConfigError(format!(
                "max_requests_per_second must be at least {MIN_RATE} (one request per day), got {rate}"
            )));
        }
        if self.tasks.is_empty() {
            return Err(AppError::ConfigError("no tasks configured".into()));
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id) {
                return Err(AppError::ConfigError(format!("duplicate task id {}", task.id)));
            }
            if !(task.url.starts_with("http://") || task.url.starts_with("https://")) {
                return Err(AppError::ConfigError(format!(
                    "task {}: url must be http(s), got '{}'",
                    task.id, task.url
                )));
            }
            let has_term = task
                .search_term
                .as_deref()
                .is_some_and(|t| !t.trim().is_empty());
            if task.category.requires_search_term() && !has_term {
                return Err(AppError::ConfigError(format!(
                    "task {}: category '{}' requires a search_term",
                    task.id, task.category
                )));
            }
        }
        Ok(())
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks
            .iter()
            .map(|t| {
                let task = Task::new(t.id, t.url.clone(), t.category).with_priority(t.priority);
                match &t.search_term {
                    Some(term) => task.with_search_term(term.clone()),
                    None => task,
                }
            })
            .collect()
    }

    /// Tasks whose category is in `categories`; all tasks when it is empty.
    pub fn tasks_in(&self, categories: &[Category]) -> Vec<Task> {
        self.tasks()
            .into_iter()
            .filter(|t| categories.is_empty() || categories.contains(&t.category))
            .collect()
    }

    /// Orchestrator settings, with `requested` overriding the configured pool size.
    pub fn orchestrator_config(&self, requested: Option<usize>) -> OrchestratorConfig {
        let requested = requested.or(self.workers).unwrap_or(self.max_workers);
        OrchestratorConfig::default()
            .with_bounds(self.min_workers, self.max_workers)
            .with_workers(requested)
            .with_retry(RetryPolicy::from(&self.retry))
            .with_rate_limit(self.rate_limit.clone())
            .with_monitor_interval(Duration::from_secs(self.monitor_interval_secs.max(1)))
    }
}
