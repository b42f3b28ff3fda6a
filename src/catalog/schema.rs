//! Catalog schema and embedded migrations
//!
//! The catalog is a single SQLite file evolved by an append-only list of
//! numbered migration scripts. Each script runs in its own transaction and
//! is recorded in the `migrations` table; opening an up-to-date database is
//! a no-op.

use crate::error::{CatalogError, CatalogResult};
use rusqlite::Connection;

/// One numbered schema evolution step
pub struct Migration {
    pub version: u32,
    pub sql: &'static str,
}

/// Append-only migration list; never edit an entry, only add new ones
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        // AUTOINCREMENT is deliberate: image ids must never be reused, so a
        // deleted row leaves a tombstone in sqlite_sequence.
        sql: r#"
CREATE TABLE path (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE
);
CREATE TABLE info (
    id INTEGER PRIMARY KEY,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    orientation INTEGER NOT NULL DEFAULT 1,
    taken_at INTEGER NOT NULL DEFAULT 0,
    color INTEGER NOT NULL DEFAULT 0,
    lat REAL,
    lon REAL,
    location TEXT,
    FOREIGN KEY (id) REFERENCES path(id)
);
CREATE INDEX idx_info_taken_at ON info(taken_at);
"#,
    },
    Migration {
        version: 2,
        sql: r#"
CREATE TABLE dir (
    path TEXT PRIMARY KEY,
    indexed_at INTEGER
);
"#,
    },
    Migration {
        version: 3,
        sql: r#"
CREATE TABLE tag (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    rev INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE tag_ids (
    tag_id INTEGER PRIMARY KEY,
    blob BLOB NOT NULL,
    FOREIGN KEY (tag_id) REFERENCES tag(id)
);
"#,
    },
    Migration {
        version: 4,
        sql: r#"
CREATE TABLE embedding (
    id INTEGER PRIMARY KEY,
    model INTEGER NOT NULL,
    inv_norm REAL NOT NULL,
    vec BLOB NOT NULL,
    FOREIGN KEY (id) REFERENCES path(id)
);
"#,
    },
];

/// SQLite pragmas for the dedicated writer connection
const WRITE_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA busy_timeout = 5000;
"#;

/// SQLite pragmas for reader connections
const READ_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA query_only = ON;
PRAGMA busy_timeout = 5000;
"#;

/// Configure a connection for the writer thread
pub fn configure_writer(conn: &Connection) -> CatalogResult<()> {
    conn.execute_batch(WRITE_PRAGMAS)?;
    Ok(())
}

/// Configure a read-only connection
pub fn configure_reader(conn: &Connection) -> CatalogResult<()> {
    conn.execute_batch(READ_PRAGMAS)?;
    Ok(())
}

/// Apply all unapplied migrations in version order
pub fn apply_migrations(conn: &Connection) -> CatalogResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)
            .map_err(|e| CatalogError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO migrations (version, applied_at) VALUES (?1, datetime('now'))",
            [migration.version],
        )?;
        tx.commit()?;
        tracing::info!(version = migration.version, "applied catalog migration");
    }

    Ok(())
}

/// Current schema version of a database
pub fn schema_version(conn: &Connection) -> CatalogResult<u32> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_in_order() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();

        assert_eq!(
            schema_version(&conn).unwrap(),
            MIGRATIONS.last().unwrap().version
        );

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        for expected in ["dir", "embedding", "info", "path", "tag", "tag_ids"] {
            assert!(tables.iter().any(|t| t == expected), "missing {}", expected);
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        apply_migrations(&conn).unwrap();
        assert_eq!(
            schema_version(&conn).unwrap(),
            MIGRATIONS.last().unwrap().version
        );
    }

    #[test]
    fn test_versions_are_strictly_increasing() {
        let mut last = 0;
        for migration in MIGRATIONS {
            assert!(migration.version > last);
            last = migration.version;
        }
    }
}
