use thiserror::Error;

/// Application-wide error types for Gleaner.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed (fetching a page).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Page or feed content could not be turned into records.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// No extractor is registered for the task's category.
    #[error("Unsupported category: {0}")]
    UnsupportedCategory(String),

    /// Run configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Reading or writing a CSV dataset failed.
    #[error("CSV error: {0}")]
    CsvError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if another attempt at the same task could succeed.
    ///
    /// Extraction failures are retried by default; only errors that no
    /// amount of retrying can fix short-circuit the worker's retry loop.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AppError::UnsupportedCategory(_) | AppError::ConfigError(_)
        )
    }
}

impl From<csv::Error> for AppError {
    fn from(e: csv::Error) -> Self {
        AppError::CsvError(e.to_string())
    }
}
