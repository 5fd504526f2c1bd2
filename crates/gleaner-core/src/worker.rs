use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::Record;
use crate::output::OutputManager;
use crate::task::{Task, TaskResult, WorkerConfig, WorkerStatus};
use crate::task_queue::{QueueMessage, TaskQueue};
use crate::throttle::RateLimiter;
use crate::traits::{Extractor, ExtractorFactory};

/// Worker id → current status, written by each worker for its own key only.
pub type WorkerStatusMap = Arc<DashMap<String, WorkerStatus>>;

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Polling,
    TaskClaimed {
        task: &'a Task,
    },
    AttemptFailed {
        task_id: u64,
        attempt: u32,
        error: &'a str,
        will_retry: bool,
    },
    TaskCompleted {
        task_id: u64,
        records: usize,
        attempts: u32,
        partial_file: Option<&'a PathBuf>,
    },
    TaskFailed {
        task_id: u64,
        error: &'a str,
        resubmitted: bool,
    },
    SentinelReceived {
        worker_id: &'a str,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Polling => {
                tracing::trace!("Polling for tasks");
            }
            WorkerEvent::TaskClaimed { task } => {
                tracing::info!(
                    task_id = %task.id,
                    url = %task.url,
                    category = %task.category,
                    resubmissions = %task.resubmissions,
                    "Task claimed"
                );
            }
            WorkerEvent::AttemptFailed {
                task_id,
                attempt,
                error,
                will_retry,
            } => {
                tracing::warn!(%task_id, %attempt, %error, %will_retry, "Extraction attempt failed");
            }
            WorkerEvent::TaskCompleted {
                task_id,
                records,
                attempts,
                partial_file,
            } => {
                tracing::info!(%task_id, %records, %attempts, ?partial_file, "Task completed");
            }
            WorkerEvent::TaskFailed {
                task_id,
                error,
                resubmitted,
            } => {
                tracing::error!(%task_id, %error, %resubmitted, "Task failed");
            }
            WorkerEvent::SentinelReceived { worker_id } => {
                tracing::debug!(%worker_id, "Shutdown sentinel received");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// Pulls tasks off the shared queue and turns each into a [`TaskResult`].
pub struct Worker<EF: ExtractorFactory> {
    config: WorkerConfig,
    queue: TaskQueue,
    results: mpsc::UnboundedSender<TaskResult>,
    extractor_factory: EF,
    limiter: RateLimiter,
    output: OutputManager,
    statuses: WorkerStatusMap,
}

impl<EF: ExtractorFactory> Worker<EF> {
    pub fn new(
        config: WorkerConfig,
        queue: TaskQueue,
        results: mpsc::UnboundedSender<TaskResult>,
        extractor_factory: EF,
        limiter: RateLimiter,
        output: OutputManager,
        statuses: WorkerStatusMap,
    ) -> Self {
        Self {
            config,
            queue,
            results,
            extractor_factory,
            limiter,
            output,
            statuses,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run the worker loop until cancellation, a shutdown sentinel, or the
    /// result channel closing.
    pub async fn run<WR: WorkerReporter + ?Sized>(
        &self,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) {
        reporter.report(WorkerEvent::Started {
            worker_id: self.id(),
        });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            self.set_status(WorkerStatus::Idle);
            reporter.report(WorkerEvent::Polling);

            let message = tokio::select! {
                message = self.queue.pop(self.config.poll_interval) => message,
                () = cancel_token.cancelled() => break,
            };

            match message {
                None => continue,
                Some(QueueMessage::Shutdown) => {
                    reporter.report(WorkerEvent::SentinelReceived {
                        worker_id: self.id(),
                    });
                    break;
                }
                Some(QueueMessage::Task(task)) => {
                    self.set_status(WorkerStatus::Busy);
                    reporter.report(WorkerEvent::TaskClaimed { task: &task });

                    let result = self.process(&task, reporter).await;
                    if self.results.send(result).is_err() {
                        tracing::warn!(worker_id = %self.id(), "Result channel closed, exiting");
                        break;
                    }
                }
            }
        }

        self.set_status(WorkerStatus::Idle);
        reporter.report(WorkerEvent::Stopped {
            worker_id: self.id(),
        });
    }

    /// Dispatch one task with local retries and build its result.
    ///
    /// Never fails: every error ends up in the returned result.
    pub async fn process<WR: WorkerReporter + ?Sized>(
        &self,
        task: &Task,
        reporter: &WR,
    ) -> TaskResult {
        let started = Instant::now();

        let extractor = match self.extractor_for(task) {
            Ok(extractor) => extractor,
            Err(e) => {
                let error = e.to_string();
                reporter.report(WorkerEvent::TaskFailed {
                    task_id: task.id,
                    error: &error,
                    resubmitted: false,
                });
                return TaskResult::failure(task, self.id(), &error, started.elapsed(), 0, true)
                    .with_errors(vec![error]);
            }
        };

        let retry = &self.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut errors = Vec::new();
        let mut attempts = 0;
        let mut retryable = true;

        while attempts < max_attempts {
            if attempts > 0 {
                tokio::time::sleep(retry.backoff).await;
            }
            attempts += 1;

            match self.attempt(task, &extractor).await {
                Ok((records, partial_file)) => {
                    reporter.report(WorkerEvent::TaskCompleted {
                        task_id: task.id,
                        records: records.len(),
                        attempts,
                        partial_file: partial_file.as_ref(),
                    });
                    let mut result =
                        TaskResult::success(task, self.id(), records, started.elapsed(), attempts)
                            .with_errors(errors);
                    result.partial_file = partial_file;
                    result.extra = self.annotations(task);
                    return result;
                }
                Err(e) => {
                    let error = e.to_string();
                    retryable = e.is_retryable();
                    let will_retry = retryable && attempts < max_attempts;
                    reporter.report(WorkerEvent::AttemptFailed {
                        task_id: task.id,
                        attempt: attempts,
                        error: &error,
                        will_retry,
                    });
                    errors.push(error);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        let last_error = errors.last().cloned().unwrap_or_default();
        let resubmit = retryable && task.can_resubmit(retry);
        if resubmit {
            self.queue.push(task.resubmitted());
        }
        reporter.report(WorkerEvent::TaskFailed {
            task_id: task.id,
            error: &last_error,
            resubmitted: resubmit,
        });

        let mut result = TaskResult::failure(
            task,
            self.id(),
            last_error,
            started.elapsed(),
            attempts,
            !resubmit,
        )
        .with_errors(errors);
        result.extra = self.annotations(task);
        result
    }

    fn extractor_for(&self, task: &Task) -> Result<EF::Extractor, AppError> {
        if !self.extractor_factory.supports(task.category) {
            return Err(AppError::UnsupportedCategory(task.category.to_string()));
        }
        self.extractor_factory.create(task.category)
    }

    /// One throttled extraction, annotated and persisted.
    async fn attempt(
        &self,
        task: &Task,
        extractor: &EF::Extractor,
    ) -> Result<(Vec<Record>, Option<PathBuf>), AppError> {
        self.limiter.wait_if_needed().await;

        let mut records = extractor.extract(&task.url, task).await?;
        for record in &mut records {
            record.worker_id = Some(self.config.worker_id.clone());
            record.task_id = Some(task.id);
            record.category.get_or_insert(task.category);
        }

        if records.is_empty() {
            return Ok((records, None));
        }
        let path = self.output.write_partial(self.id(), &records).await?;
        Ok((records, Some(path)))
    }

    fn annotations(&self, task: &Task) -> serde_json::Map<String, serde_json::Value> {
        let mut extra = serde_json::Map::new();
        extra.insert("url".into(), task.url.clone().into());
        extra.insert("resubmissions".into(), task.resubmissions.into());
        extra
    }

    fn set_status(&self, status: WorkerStatus) {
        self.statuses.insert(self.config.worker_id.clone(), status);
    }
}
