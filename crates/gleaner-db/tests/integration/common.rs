use gleaner_db::{Database, DatabaseConfig};
use tempfile::TempDir;

/// A migrated database in a fresh temp directory.
///
/// Keep the `TempDir` alive for the duration of the test: dropping it
/// deletes the database file.
pub async fn setup_test_db() -> (Database, TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = DatabaseConfig::sqlite_file(dir.path().join("test.db"));

    let db = Database::connect(&config)
        .await
        .expect("failed to connect to test database");
    db.migrate().await.expect("failed to run migrations");

    (db, dir)
}
