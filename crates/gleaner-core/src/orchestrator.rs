//! Run supervision: spawn the worker pool, collect results until every task
//! has settled, then consolidate, export, and shut the pool down.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::consolidate::{ConsolidationReport, Consolidator};
use crate::error::AppError;
use crate::output::OutputManager;
use crate::summary::{RunStats, write_summary};
use crate::task::{RetryPolicy, Task, TaskResult, WorkerConfig, WorkerStatus};
use crate::task_queue::TaskQueue;
use crate::throttle::{LimiterScope, RateLimitConfig, RateLimiter};
use crate::traits::{ExtractorFactory, RecordStore};
use crate::worker::{TracingWorkerReporter, Worker, WorkerReporter, WorkerStatusMap};

/// Shortest period between progress snapshots.
pub const MIN_MONITOR_INTERVAL: Duration = Duration::from_millis(10);

/// Pool sizing and timing for one run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub requested_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitConfig,
    /// How long a worker's dequeue waits before re-checking the stop flag.
    pub poll_interval: Duration,
    /// How long the collector waits on the result channel per read.
    pub collect_timeout: Duration,
    pub monitor_interval: Duration,
    /// How long shutdown waits for each worker before aborting it.
    pub join_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            requested_workers: 2,
            min_workers: 1,
            max_workers: 4,
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            poll_interval: Duration::from_secs(1),
            collect_timeout: Duration::from_secs(1),
            monitor_interval: Duration::from_secs(4),
            join_timeout: Duration::from_secs(5),
        }
    }
}

impl OrchestratorConfig {
    /// `requested_workers` clamped into `[min_workers, max_workers]`.
    pub fn worker_count(&self) -> usize {
        let min = self.min_workers.max(1);
        let max = self.max_workers.max(min);
        self.requested_workers.clamp(min, max)
    }

    pub fn with_workers(mut self, requested: usize) -> Self {
        self.requested_workers = requested;
        self
    }

    pub fn with_bounds(mut self, min_workers: usize, max_workers: usize) -> Self {
        self.min_workers = min_workers;
        self.max_workers = max_workers;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Clamped to [`MIN_MONITOR_INTERVAL`]; a zero period would stall the monitor.
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval.max(MIN_MONITOR_INTERVAL);
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Shorten both the worker poll and the collector read timeouts.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self.collect_timeout = interval;
        self
    }
}

/// Point-in-time view of a run, emitted by the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    /// Tasks with a terminal result.
    pub completed: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub workers: BTreeMap<String, WorkerStatus>,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed as f64 * 100.0 / self.total as f64
        }
    }
}

/// What `stop_workers` had to do.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub joined: usize,
    /// Workers that did not exit within the join timeout.
    pub aborted: usize,
    /// Tasks still queued when the pool went down.
    pub leftover_tasks: Vec<Task>,
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunReport {
    pub results: Vec<TaskResult>,
    pub stats: RunStats,
    pub consolidation: Option<ConsolidationReport>,
    pub consolidation_error: Option<String>,
    pub summary_file: Option<PathBuf>,
    pub shutdown: ShutdownReport,
}

/// Events emitted by the orchestrator for monitoring/logging.
#[derive(Debug, Clone)]
pub enum RunEvent<'a> {
    TasksAdded { count: usize, total: usize },
    WorkersStarted { count: usize },
    Progress(&'a ProgressSnapshot),
    ResultCollected { result: &'a TaskResult, completed: usize, total: usize },
    CollectionAborted { completed: usize, total: usize },
    ConsolidationFinished { report: &'a ConsolidationReport },
    ConsolidationFailed { error: &'a str },
    SummaryWritten { path: &'a Path },
    WorkersStopped { report: &'a ShutdownReport },
}

/// Trait for receiving run events (decoupled logging).
pub trait RunReporter: Send + Sync {
    fn report(&self, event: RunEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunReporter;

impl RunReporter for TracingRunReporter {
    fn report(&self, event: RunEvent<'_>) {
        match event {
            RunEvent::TasksAdded { count, total } => {
                tracing::info!(%count, %total, "Tasks queued");
            }
            RunEvent::WorkersStarted { count } => {
                tracing::info!(%count, "Workers started");
            }
            RunEvent::Progress(snapshot) => {
                let busy = snapshot
                    .workers
                    .values()
                    .filter(|s| **s == WorkerStatus::Busy)
                    .count();
                tracing::info!(
                    completed = %snapshot.completed,
                    total = %snapshot.total,
                    percent = %format!("{:.1}", snapshot.percent()),
                    succeeded = %snapshot.succeeded,
                    failed = %snapshot.failed,
                    %busy,
                    workers = ?snapshot.workers,
                    "Progress"
                );
            }
            RunEvent::ResultCollected {
                result,
                completed,
                total,
            } => {
                tracing::debug!(
                    task_id = %result.task_id,
                    worker_id = %result.worker_id,
                    succeeded = %result.succeeded,
                    terminal = %result.terminal,
                    %completed,
                    %total,
                    "Result collected"
                );
            }
            RunEvent::CollectionAborted { completed, total } => {
                tracing::error!(%completed, %total, "All workers exited before every task settled");
            }
            RunEvent::ConsolidationFinished { report } => {
                tracing::info!(
                    records = %report.records_read,
                    combined = %report.combined_total,
                    inserted = %report.load.inserted,
                    updated = %report.load.updated,
                    "Consolidation finished"
                );
            }
            RunEvent::ConsolidationFailed { error } => {
                tracing::error!(%error, "Consolidation failed, partial files kept");
            }
            RunEvent::SummaryWritten { path } => {
                tracing::info!(path = %path.display(), "Summary written");
            }
            RunEvent::WorkersStopped { report } => {
                tracing::info!(
                    joined = %report.joined,
                    aborted = %report.aborted,
                    leftover = %report.leftover_tasks.len(),
                    "Workers stopped"
                );
            }
        }
    }
}

#[derive(Default)]
struct Tally {
    completed: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl Tally {
    fn record(&self, result: &TaskResult) -> usize {
        if result.succeeded {
            self.succeeded.fetch_add(1, Ordering::SeqCst);
        } else if result.terminal {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        if result.terminal {
            self.completed.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.completed.load(Ordering::SeqCst)
        }
    }
}

/// Owns the task queue and the worker pool for a single run.
pub struct Orchestrator<EF: ExtractorFactory, S: RecordStore> {
    config: OrchestratorConfig,
    extractor_factory: EF,
    store: S,
    output: OutputManager,
    queue: TaskQueue,
    results_rx: Option<mpsc::UnboundedReceiver<TaskResult>>,
    statuses: WorkerStatusMap,
    stop: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
    total_tasks: usize,
    worker_reporter: Arc<dyn WorkerReporter>,
    run_reporter: Arc<dyn RunReporter>,
}

impl<EF, S> Orchestrator<EF, S>
where
    EF: ExtractorFactory,
    S: RecordStore + 'static,
{
    pub fn new(config: OrchestratorConfig, extractor_factory: EF, store: S, output: OutputManager) -> Self {
        Self {
            config,
            extractor_factory,
            store,
            output,
            queue: TaskQueue::new(),
            results_rx: None,
            statuses: Arc::new(DashMap::new()),
            stop: CancellationToken::new(),
            handles: Vec::new(),
            total_tasks: 0,
            worker_reporter: Arc::new(TracingWorkerReporter),
            run_reporter: Arc::new(TracingRunReporter),
        }
    }

    pub fn with_worker_reporter(mut self, reporter: Arc<dyn WorkerReporter>) -> Self {
        self.worker_reporter = reporter;
        self
    }

    pub fn with_run_reporter(mut self, reporter: Arc<dyn RunReporter>) -> Self {
        self.run_reporter = reporter;
        self
    }

    /// Queue tasks for this run. Ids must be unique across every call.
    pub fn add_tasks(&mut self, tasks: Vec<Task>) -> Result<usize, AppError> {
        let count = tasks.len();
        for task in tasks {
            self.queue.push(task);
        }
        self.total_tasks += count;
        self.run_reporter.report(RunEvent::TasksAdded {
            count,
            total: self.total_tasks,
        });
        Ok(count)
    }

    /// Spawn `clamp(requested, min, max)` workers.
    pub async fn start_workers(&mut self) -> Result<usize, AppError> {
        if !self.handles.is_empty() || self.results_rx.is_some() {
            return Err(AppError::ConfigError("workers already started".into()));
        }
        self.output.ensure_dir().await?;

        let count = self.config.worker_count();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let shared_limiter = RateLimiter::new(self.config.rate_limit.max_requests_per_second);

        for index in 0..count {
            let worker_id = format!("worker-{index}");
            let limiter = match self.config.rate_limit.scope {
                LimiterScope::Global => shared_limiter.clone(),
                LimiterScope::PerWorker => {
                    RateLimiter::new(self.config.rate_limit.max_requests_per_second)
                }
            };
            let worker_config = WorkerConfig::default()
                .with_worker_id(worker_id.clone())
                .with_poll_interval(self.config.poll_interval)
                .with_retry(self.config.retry.clone());

            self.statuses.insert(worker_id.clone(), WorkerStatus::Idle);
            let worker = Worker::new(
                worker_config,
                self.queue.clone(),
                results_tx.clone(),
                self.extractor_factory.clone(),
                limiter,
                self.output.clone(),
                self.statuses.clone(),
            );
            let stop = self.stop.clone();
            let reporter = self.worker_reporter.clone();
            let handle = tokio::spawn(async move { worker.run(stop, &*reporter).await });
            self.handles.push((worker_id, handle));
        }

        // Only workers hold senders now, so the channel closes when the last one exits.
        drop(results_tx);
        self.results_rx = Some(results_rx);

        self.run_reporter.report(RunEvent::WorkersStarted { count });
        Ok(count)
    }

    /// Drain the result channel until every queued task has a terminal result,
    /// while the monitor reports progress.
    pub async fn collect(&mut self) -> Vec<TaskResult> {
        let Some(mut results_rx) = self.results_rx.take() else {
            return Vec::new();
        };
        let total = self.total_tasks;
        let tally = Tally::default();
        let done = CancellationToken::new();

        let collector = async {
            let mut results = Vec::new();
            while tally.completed.load(Ordering::SeqCst) < total {
                match tokio::time::timeout(self.config.collect_timeout, results_rx.recv()).await {
                    Ok(Some(result)) => {
                        let completed = tally.record(&result);
                        self.run_reporter.report(RunEvent::ResultCollected {
                            result: &result,
                            completed,
                            total,
                        });
                        results.push(result);
                    }
                    Ok(None) => {
                        self.run_reporter.report(RunEvent::CollectionAborted {
                            completed: tally.completed.load(Ordering::SeqCst),
                            total,
                        });
                        break;
                    }
                    Err(_) => continue,
                }
            }
            done.cancel();
            results
        };

        let monitor = async {
            let mut ticker = tokio::time::interval(self.config.monitor_interval.max(MIN_MONITOR_INTERVAL));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = self.snapshot(&tally, total);
                        self.run_reporter.report(RunEvent::Progress(&snapshot));
                    }
                    () = done.cancelled() => break,
                }
            }
            let snapshot = self.snapshot(&tally, total);
            self.run_reporter.report(RunEvent::Progress(&snapshot));
        };

        let (results, ()) = tokio::join!(collector, monitor);
        self.results_rx = Some(results_rx);
        results
    }

    /// Full run: queue, spawn, collect, consolidate, export, shut down.
    ///
    /// Only setup failures are returned as errors; later phases are recorded
    /// in the report and never skip the shutdown.
    pub async fn run(&mut self, tasks: Vec<Task>) -> Result<RunReport, AppError> {
        let started_at = Utc::now();

        self.add_tasks(tasks)?;
        if let Err(e) = self.start_workers().await {
            self.stop_workers().await;
            return Err(e);
        }

        let results = self.collect().await;

        let consolidator = Consolidator::new(self.output.clone(), self.store.clone());
        let (consolidation, consolidation_error) = match consolidator.consolidate().await {
            Ok(report) => {
                self.run_reporter
                    .report(RunEvent::ConsolidationFinished { report: &report });
                (Some(report), None)
            }
            Err(e) => {
                let error = e.to_string();
                self.run_reporter
                    .report(RunEvent::ConsolidationFailed { error: &error });
                (None, Some(error))
            }
        };

        let stats = RunStats::from_results(started_at, Utc::now(), &results)
            .with_consolidation(consolidation.as_ref());

        let summary_file = match write_summary(&self.output, &results, &stats).await {
            Ok(path) => {
                self.run_reporter
                    .report(RunEvent::SummaryWritten { path: &path });
                Some(path)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to write run summary");
                None
            }
        };

        if let Err(e) = self.export_store_stats().await {
            tracing::warn!(error = %e, "Failed to export store statistics");
        }

        let shutdown = self.stop_workers().await;

        Ok(RunReport {
            results,
            stats,
            consolidation,
            consolidation_error,
            summary_file,
            shutdown,
        })
    }

    /// Set the stop flag, send one sentinel per worker, join each with a
    /// timeout and abort the ones that do not exit in time.
    pub async fn stop_workers(&mut self) -> ShutdownReport {
        self.stop.cancel();
        for _ in &self.handles {
            self.queue.push_shutdown();
        }

        let mut report = ShutdownReport::default();
        for (worker_id, mut handle) in self.handles.drain(..) {
            match tokio::time::timeout(self.config.join_timeout, &mut handle).await {
                Ok(Ok(())) => report.joined += 1,
                Ok(Err(e)) => {
                    tracing::warn!(%worker_id, error = %e, "Worker task ended abnormally");
                    report.joined += 1;
                }
                Err(_) => {
                    tracing::warn!(%worker_id, "Worker did not stop in time, aborting");
                    handle.abort();
                    let _ = tokio::time::timeout(Duration::from_millis(100), handle).await;
                    report.aborted += 1;
                }
            }
            self.statuses.remove(&worker_id);
        }

        report.leftover_tasks = self.queue.drain_tasks().await;
        if !report.leftover_tasks.is_empty() {
            tracing::warn!(count = %report.leftover_tasks.len(), "Tasks left on the queue at shutdown");
        }

        self.run_reporter
            .report(RunEvent::WorkersStopped { report: &report });
        report
    }

    async fn export_store_stats(&self) -> Result<(), AppError> {
        let stats = self.store.stats().await?;
        let body = serde_json::to_vec_pretty(&stats)?;
        self.output.write_atomic(&self.output.stats_path(), &body).await
    }

    fn snapshot(&self, tally: &Tally, total: usize) -> ProgressSnapshot {
        ProgressSnapshot {
            completed: tally.completed.load(Ordering::SeqCst),
            total,
            succeeded: tally.succeeded.load(Ordering::SeqCst),
            failed: tally.failed.load(Ordering::SeqCst),
            workers: self.statuses(),
        }
    }

    /// Live workers.
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    pub fn total_tasks(&self) -> usize {
        self.total_tasks
    }

    pub fn statuses(&self) -> BTreeMap<String, WorkerStatus> {
        self.statuses
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }
}

impl<EF: ExtractorFactory, S: RecordStore> Drop for Orchestrator<EF, S> {
    fn drop(&mut self) {
        self.stop.cancel();
        for (_, handle) in &self.handles {
            handle.abort();
        }
    }
}
