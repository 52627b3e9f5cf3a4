pub mod cache;
pub mod models;

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use cache::FeatureCache;
pub use models::{CacheEntry, CacheStatistics};

/// Cache location relative to the scanned folder root.
pub const CACHE_DIR: &str = ".lookalike";
pub const CACHE_FILE: &str = "features.db";
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS feature_cache (
    path TEXT PRIMARY KEY NOT NULL,
    file_size INTEGER NOT NULL,
    last_modified INTEGER NOT NULL,
    embedding BLOB NOT NULL,
    embedding_len INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL
);

INSERT OR IGNORE INTO cache_version (id, version) VALUES (1, 1);
";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt entry for {path}: {message}")]
    CorruptEntry { path: String, message: String },

    #[error("Cache lock poisoned")]
    Poisoned,
}

pub fn cache_path_for(root: &Path) -> PathBuf {
    root.join(CACHE_DIR).join(CACHE_FILE)
}

/// Open (or create) the database at `db_path` and make sure the schema
/// exists. A file that fails the integrity probe is deleted and recreated.
pub fn open_database(db_path: &Path) -> Result<Connection, CacheError> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }

    if db_path.exists() {
        match open_and_probe(db_path) {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                log::warn!(
                    "Feature cache {} failed integrity check ({}); recreating",
                    db_path.display(),
                    e
                );
                remove_database_files(db_path)?;
            }
        }
    }

    let conn = Connection::open(db_path)?;
    initialize_schema(&conn)?;
    Ok(conn)
}

fn open_and_probe(db_path: &Path) -> Result<Connection, CacheError> {
    let conn = Connection::open(db_path)?;
    let result: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if result != "ok" {
        return Err(CacheError::CorruptEntry {
            path: db_path.to_string_lossy().to_string(),
            message: result,
        });
    }
    initialize_schema(&conn)?;
    Ok(conn)
}

fn initialize_schema(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch(SCHEMA)?;
    let version: i64 = conn.query_row(
        "SELECT version FROM cache_version WHERE id = 1",
        [],
        |row| row.get(0),
    )?;
    if version != SCHEMA_VERSION {
        log::warn!(
            "Feature cache schema version {} differs from {}",
            version,
            SCHEMA_VERSION
        );
    }
    Ok(())
}

fn remove_database_files(db_path: &Path) -> Result<(), CacheError> {
    fs::remove_file(db_path)?;
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut side = db_path.as_os_str().to_owned();
        side.push(suffix);
        let side = PathBuf::from(side);
        if side.exists() {
            fs::remove_file(side)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_schema() {
        let temp_dir = tempdir().unwrap();
        let db_path = cache_path_for(temp_dir.path());

        let conn = open_database(&db_path).unwrap();
        assert!(db_path.exists());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM feature_cache", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let version: i64 = conn
            .query_row("SELECT version FROM cache_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_corrupt_file_is_recreated() {
        let temp_dir = tempdir().unwrap();
        let db_path = cache_path_for(temp_dir.path());
        fs::create_dir_all(db_path.parent().unwrap()).unwrap();
        fs::write(&db_path, vec![0xAB; 4096]).unwrap();

        let conn = open_database(&db_path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM feature_cache", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let temp_dir = tempdir().unwrap();
        let db_path = cache_path_for(temp_dir.path());

        {
            let conn = open_database(&db_path).unwrap();
            conn.execute(
                "INSERT INTO feature_cache VALUES ('a', 1, 2, x'00000000', 1, 'now', 'now')",
                [],
            )
            .unwrap();
        }

        let conn = open_database(&db_path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM feature_cache", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
