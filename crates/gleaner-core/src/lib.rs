pub mod config;
pub mod consolidate;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod output;
pub mod summary;
pub mod task;
pub mod task_queue;
pub mod throttle;
pub mod traits;
pub mod worker;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use config::RunConfig;
pub use consolidate::{Bucket, ConsolidationReport, Consolidator};
pub use error::AppError;
pub use models::{Category, Record};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunEvent, RunReport, RunReporter};
pub use output::OutputManager;
pub use task::{RetryPolicy, Task, TaskResult, WorkerStatus};
pub use traits::{Extractor, ExtractorFactory, Fetcher, LoadReport, RecordStore, StoreStats};
