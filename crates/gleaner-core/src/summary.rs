use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::consolidate::ConsolidationReport;
use crate::error::AppError;
use crate::output::OutputManager;
use crate::task::TaskResult;

/// Aggregate figures for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    /// Terminal results that succeeded.
    pub successful: usize,
    /// Terminal results that failed.
    pub failed: usize,
    /// Failed dispatches whose task went back on the queue.
    pub resubmitted: usize,
    /// Every error message seen across all results, retried ones included.
    pub total_errors: usize,
    pub records: usize,
    pub reclassified: usize,
    pub unclassified: usize,
}

impl RunStats {
    pub fn from_results(
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        results: &[TaskResult],
    ) -> Self {
        let mut stats = Self {
            started_at,
            finished_at,
            duration: (finished_at - started_at).to_std().unwrap_or_default(),
            successful: 0,
            failed: 0,
            resubmitted: 0,
            total_errors: 0,
            records: 0,
            reclassified: 0,
            unclassified: 0,
        };

        for result in results {
            match (result.succeeded, result.terminal) {
                (true, _) => stats.successful += 1,
                (false, true) => stats.failed += 1,
                (false, false) => stats.resubmitted += 1,
            }
            stats.total_errors += result.errors.len();
            stats.records += result.records.len();
        }
        stats
    }

    pub fn with_consolidation(mut self, report: Option<&ConsolidationReport>) -> Self {
        if let Some(report) = report {
            self.reclassified = report.reclassified;
            self.unclassified = report.unclassified;
        }
        self
    }

    /// Percentage of settled tasks that succeeded.
    pub fn success_rate(&self) -> f64 {
        let settled = self.successful + self.failed;
        if settled == 0 {
            0.0
        } else {
            self.successful as f64 * 100.0 / settled as f64
        }
    }
}

#[derive(Serialize)]
struct SummaryRow<'a> {
    task_id: u64,
    worker_id: &'a str,
    category: &'a str,
    succeeded: bool,
    terminal: bool,
    attempts: u32,
    duration_secs: String,
    records: usize,
    error_message: &'a str,
}

/// Write the per-run summary CSV: one row per collected result, then a
/// `metric,value` block of aggregates.
pub async fn write_summary(
    output: &OutputManager,
    results: &[TaskResult],
    stats: &RunStats,
) -> Result<PathBuf, AppError> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());

    for result in results {
        writer.serialize(SummaryRow {
            task_id: result.task_id,
            worker_id: &result.worker_id,
            category: result.category.as_str(),
            succeeded: result.succeeded,
            terminal: result.terminal,
            attempts: result.attempts,
            duration_secs: format!("{:.3}", result.duration.as_secs_f64()),
            records: result.records.len(),
            error_message: result.error_message.as_deref().unwrap_or_default(),
        })?;
    }

    writer.write_record(["", ""])?;
    writer.write_record(["metric", "value"])?;
    let aggregates = [
        ("started_at", stats.started_at.to_rfc3339()),
        ("finished_at", stats.finished_at.to_rfc3339()),
        ("duration_secs", format!("{:.3}", stats.duration.as_secs_f64())),
        ("successful", stats.successful.to_string()),
        ("failed", stats.failed.to_string()),
        ("resubmitted", stats.resubmitted.to_string()),
        ("total_errors", stats.total_errors.to_string()),
        ("success_rate", format!("{:.1}", stats.success_rate())),
        ("records", stats.records.to_string()),
        ("reclassified", stats.reclassified.to_string()),
        ("unclassified", stats.unclassified.to_string()),
    ];
    for (metric, value) in aggregates {
        writer.write_record([metric, value.as_str()])?;
    }

    let body = writer
        .into_inner()
        .map_err(|e| AppError::CsvError(e.to_string()))?;
    let path = output.summary_path(stats.started_at);
    output.write_atomic(&path, &body).await?;
    Ok(path)
}
