//! SQLite thumbnail sink
//!
//! A sibling `*.thumbs.db` database persisting generated thumbnails as
//! (id, size_name, data, created_at). The sink doubles as a read source:
//! one chain entry per configured size exposes its stored variant, so a
//! thumbnail generated once is served from here forever after.
//!
//! Like the catalog, the schema is evolved by an embedded append-only
//! migration list.

use crate::error::{CatalogError, CatalogResult, SourceError, SourceResult};
use crate::sources::{Declared, ReadSource, SourceMeta};
use crate::types::{CancelToken, ImageId, SharedBytes};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

struct ThumbMigration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[ThumbMigration] = &[ThumbMigration {
    version: 1,
    sql: r#"
CREATE TABLE thumbs (
    id INTEGER NOT NULL,
    size_name TEXT NOT NULL,
    data BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (id, size_name)
);
"#,
}];

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
"#;

/// The thumbnail database
pub struct ThumbDb {
    conn: Mutex<Connection>,
}

impl ThumbDb {
    pub fn open(db_path: &Path) -> CatalogResult<Self> {
        let conn = Connection::open(db_path).map_err(|e| CatalogError::OpenFailed {
            path: db_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        conn.execute_batch(PRAGMAS)?;

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
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Stored bytes for (id, size), or `NotFound`
    pub fn read(&self, id: ImageId, size_name: &str) -> SourceResult<SharedBytes> {
        let conn = self.conn.lock();
        let result: Result<Option<Vec<u8>>, rusqlite::Error> = conn
            .query_row(
                "SELECT data FROM thumbs WHERE id = ?1 AND size_name = ?2",
                params![id.0 as i64, size_name],
                |row| row.get(0),
            )
            .optional();
        match result {
            Ok(Some(bytes)) => Ok(bytes.into()),
            Ok(None) => Err(SourceError::NotFound),
            Err(e) => Err(SourceError::transient("sqlite-thumbs", e)),
        }
    }

    /// Persist bytes for (id, size), replacing any previous variant
    pub fn write(&self, id: ImageId, size_name: &str, data: &[u8]) -> SourceResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO thumbs (id, size_name, data, created_at)
             VALUES (?1, ?2, ?3, strftime('%s','now'))
             ON CONFLICT(id, size_name) DO UPDATE SET
                data = excluded.data,
                created_at = excluded.created_at",
            params![id.0 as i64, size_name, data],
        )
        .map_err(|e| SourceError::transient("sqlite-thumbs", e))?;
        Ok(())
    }

    /// Drop every stored variant of `id`
    pub fn delete(&self, id: ImageId) -> SourceResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM thumbs WHERE id = ?1", params![id.0 as i64])
            .map_err(|e| SourceError::transient("sqlite-thumbs", e))?;
        Ok(())
    }

    pub fn exists(&self, id: ImageId, size_name: &str) -> bool {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT 1 FROM thumbs WHERE id = ?1 AND size_name = ?2",
            params![id.0 as i64, size_name],
            |_row| Ok(()),
        )
        .optional()
        .map(|found| found.is_some())
        .unwrap_or_else(|e| {
            warn!("thumbnail existence probe failed: {}", e);
            false
        })
    }
}

/// One stored size exposed as a chain source
pub struct ThumbDbSource {
    name: String,
    db: Arc<ThumbDb>,
    size_name: String,
    declared: Declared,
}

impl ThumbDbSource {
    pub fn new(db: Arc<ThumbDb>, size_name: &str, declared: Declared) -> Self {
        Self {
            name: format!("sqlite-thumbs-{}", size_name),
            db,
            size_name: size_name.to_string(),
            declared,
        }
    }
}

impl SourceMeta for ThumbDbSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn declared(&self) -> Declared {
        self.declared
    }

    fn exists(&self, id: ImageId, _path: &str) -> bool {
        self.db.exists(id, &self.size_name)
    }
}

impl ReadSource for ThumbDbSource {
    fn read(&self, _ctx: &CancelToken, id: ImageId, _path: &str) -> SourceResult<SharedBytes> {
        self.db.read(id, &self.size_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Fit;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_delete() {
        let dir = tempdir().unwrap();
        let db = ThumbDb::open(&dir.path().join("test.thumbs.db")).unwrap();

        db.write(ImageId(7), "S", b"small bytes").unwrap();
        db.write(ImageId(7), "M", b"medium bytes").unwrap();

        assert_eq!(&db.read(ImageId(7), "S").unwrap()[..], b"small bytes");
        assert!(db.exists(ImageId(7), "M"));
        assert_eq!(db.read(ImageId(8), "S").unwrap_err(), SourceError::NotFound);

        db.delete(ImageId(7)).unwrap();
        assert!(!db.exists(ImageId(7), "S"));
        assert!(!db.exists(ImageId(7), "M"));
    }

    #[test]
    fn test_write_replaces() {
        let dir = tempdir().unwrap();
        let db = ThumbDb::open(&dir.path().join("test.thumbs.db")).unwrap();

        db.write(ImageId(1), "S", b"old").unwrap();
        db.write(ImageId(1), "S", b"new").unwrap();
        assert_eq!(&db.read(ImageId(1), "S").unwrap()[..], b"new");
    }

    #[test]
    fn test_source_wrapper() {
        let dir = tempdir().unwrap();
        let db = Arc::new(ThumbDb::open(&dir.path().join("test.thumbs.db")).unwrap());
        db.write(ImageId(3), "S", b"bytes").unwrap();

        let source = ThumbDbSource::new(
            Arc::clone(&db),
            "S",
            Declared::bounded(120, 120, Fit::Inside),
        );
        assert_eq!(source.name(), "sqlite-thumbs-S");
        assert!(source.exists(ImageId(3), "/ignored"));
        let bytes = source
            .read(&CancelToken::new(), ImageId(3), "/ignored")
            .unwrap();
        assert_eq!(&bytes[..], b"bytes");
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.thumbs.db");
        {
            let db = ThumbDb::open(&path).unwrap();
            db.write(ImageId(1), "S", b"x").unwrap();
        }
        let db = ThumbDb::open(&path).unwrap();
        assert!(db.exists(ImageId(1), "S"));
    }
}
