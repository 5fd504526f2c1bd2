//! File layout of a run's output directory.
//!
//! ```text
//! <dir>/partial_<worker>_<timestamp>_<id>.jsonl   one per successful task, JSON lines
//! <dir>/<bucket>_data.json                        merged records per category
//! <dir>/combined.csv                              merged records across categories
//! <dir>/summary_<timestamp>.csv                   one row per collected result
//! <dir>/database_stats.json                       store statistics after the load
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::Record;

const PARTIAL_PREFIX: &str = "partial_";
const PARTIAL_EXTENSION: &str = "jsonl";

/// Owns the paths inside an output directory and the writes into it.
///
/// Constructed once per run and handed to every worker and to the
/// consolidator.
#[derive(Debug, Clone)]
pub struct OutputManager {
    dir: PathBuf,
}

impl OutputManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> Result<(), AppError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Persist one task's records to a fresh partial file and return its path.
    ///
    /// The file appears under its final name only once fully written.
    pub async fn write_partial(
        &self,
        worker_id: &str,
        records: &[Record],
    ) -> Result<PathBuf, AppError> {
        let name = format!(
            "{PARTIAL_PREFIX}{}_{}_{}.{PARTIAL_EXTENSION}",
            sanitize(worker_id),
            Utc::now().format("%Y%m%d_%H%M%S_%6f"),
            &Uuid::new_v4().simple().to_string()[..8],
        );
        let path = self.dir.join(name);

        let mut body = String::new();
        for record in records {
            body.push_str(&serde_json::to_string(record)?);
            body.push('\n');
        }

        self.write_atomic(&path, body.as_bytes()).await?;
        Ok(path)
    }

    /// Partial files currently on disk, sorted by file name.
    pub async fn list_partials(&self) -> Result<Vec<PathBuf>, AppError> {
        let mut paths = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(paths),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_partial(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub fn bucket_path(&self, bucket: &str) -> PathBuf {
        self.dir.join(format!("{bucket}_data.json"))
    }

    pub fn combined_path(&self) -> PathBuf {
        self.dir.join("combined.csv")
    }

    pub fn summary_path(&self, started_at: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("summary_{}.csv", started_at.format("%Y%m%d_%H%M%S")))
    }

    pub fn stats_path(&self) -> PathBuf {
        self.dir.join("database_stats.json")
    }

    /// Write to a sibling temporary file, then rename over `path`.
    pub async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), AppError> {
        let mut tmp: OsString = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn is_partial(path: &Path) -> bool {
    let has_prefix = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(PARTIAL_PREFIX));
    let has_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == PARTIAL_EXTENSION);
    has_prefix && has_extension
}

fn sanitize(worker_id: &str) -> String {
    worker_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}
