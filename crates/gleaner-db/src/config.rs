use std::path::Path;

use gleaner_core::AppError;

/// Configuration for the database connection pool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
        }
    }

    /// A SQLite database file, created on first connect.
    pub fn sqlite_file(path: impl AsRef<Path>) -> Self {
        Self::new(format!("sqlite://{}", path.as_ref().display()))
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// Read configuration from environment variables.
    ///
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_MAX_CONNECTIONS` (optional, defaults to 5)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let url = lookup("DATABASE_URL").ok_or_else(|| {
            AppError::ConfigError("DATABASE_URL not set. Required for database operations.".into())
        })?;

        let max_connections = match lookup("DATABASE_MAX_CONNECTIONS") {
            None => 5,
            Some(raw) => parse_max_connections(&raw)?,
        };

        Ok(Self {
            url,
            max_connections,
        })
    }
}

fn parse_max_connections(raw: &str) -> Result<u32, AppError> {
    let parsed: u32 = raw.trim().parse().map_err(|_| {
        AppError::ConfigError(format!(
            "Invalid DATABASE_MAX_CONNECTIONS '{raw}': must be a positive integer"
        ))
    })?;
    if parsed == 0 {
        return Err(AppError::ConfigError(
            "DATABASE_MAX_CONNECTIONS must be at least 1".into(),
        ));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_file_builds_url() {
        let config = DatabaseConfig::sqlite_file("/tmp/out/gleaner.db");
        assert_eq!(config.url, "sqlite:///tmp/out/gleaner.db");
        assert_eq!(config.max_connections, 5);
    }

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    #[test]
    fn env_config_reads_url_and_pool_size() {
        let config = DatabaseConfig::from_lookup(env(&[
            ("DATABASE_URL", "sqlite:///var/lib/gleaner.db"),
            ("DATABASE_MAX_CONNECTIONS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.url, "sqlite:///var/lib/gleaner.db");
        assert_eq!(config.max_connections, 3);

        let defaulted =
            DatabaseConfig::from_lookup(env(&[("DATABASE_URL", "sqlite::memory:")])).unwrap();
        assert_eq!(defaulted.max_connections, 5);
    }

    #[test]
    fn env_config_requires_url_and_valid_pool_size() {
        assert!(matches!(
            DatabaseConfig::from_lookup(env(&[])),
            Err(AppError::ConfigError(_))
        ));
        assert!(
            DatabaseConfig::from_lookup(env(&[
                ("DATABASE_URL", "sqlite::memory:"),
                ("DATABASE_MAX_CONNECTIONS", "0"),
            ]))
            .is_err()
        );
    }

    #[test]
    fn max_connections_parsing() {
        assert_eq!(parse_max_connections("8").unwrap(), 8);
        assert!(parse_max_connections("0").is_err());
        assert!(parse_max_connections("many").is_err());
    }

    #[test]
    fn max_connections_never_zero() {
        assert_eq!(DatabaseConfig::new("sqlite::memory:").with_max_connections(0).max_connections, 1);
    }
}
