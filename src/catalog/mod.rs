//! Catalog store
//!
//! A single-file SQLite database owning all durable pipeline state: the
//! path <-> id mapping, per-image info, embeddings, directory stamps and
//! tag bitmaps. Mutations funnel through the batched [`writer`]; reads go
//! through a small pool of read-only connections (one dedicated writer, N
//! readers, matching the single-writer nature of the store).
//!
//! Listing queries return lazy sequences: each spawns a producer thread
//! that publishes rows into a bounded channel and closes it on completion,
//! consumer disconnect or cancellation.

pub mod schema;
pub mod writer;

use crate::embedding::Embedding;
use crate::error::{CatalogError, CatalogResult};
use crate::stream::send_cancellable;
use crate::tags::{Ids, Tag, TagId};
use crate::types::{
    CancelToken, IdPath, ImageId, Info, Missing, MissingInfo, SimilarityInfo, SourcedInfo,
    WriteMode,
};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};
pub use writer::{WriterHandle, WriterStats};

/// Capacity of listing output channels
const LIST_CHANNEL_CAP: usize = 1000;

/// Upper bound on pooled reader connections kept around
const READER_POOL_CAP: usize = 8;

/// Ordering for [`Catalog::list`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListOrder {
    #[default]
    DateAsc,
    DateDesc,
    Path,
    /// Descending cosine similarity against `ListOptions::similar_to`
    Similarity,
}

/// Options for [`Catalog::list`]
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub order: ListOrder,
    /// Inclusive unix-second bounds on the capture timestamp
    pub date_range: Option<(i64, i64)>,
    /// 0 = unbounded
    pub limit: usize,
    /// Reference embedding for similarity ordering
    pub similar_to: Option<Embedding>,
}

/// Aggregate information about an indexed directory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirRow {
    pub file_count: u64,
    /// Latest capture timestamp below the directory, unix seconds
    pub latest_taken_at: i64,
    pub indexed_at: Option<i64>,
}

/// Small pool of read-only connections
struct ReaderPool {
    db_path: PathBuf,
    idle: Mutex<Vec<Connection>>,
}

impl ReaderPool {
    fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            idle: Mutex::new(Vec::new()),
        }
    }

    fn get(self: &Arc<Self>) -> CatalogResult<PooledConn> {
        let existing = self.idle.lock().pop();
        let conn = match existing {
            Some(conn) => conn,
            None => {
                let conn =
                    Connection::open(&self.db_path).map_err(|e| CatalogError::OpenFailed {
                        path: self.db_path.clone(),
                        reason: e.to_string(),
                    })?;
                schema::configure_reader(&conn)?;
                conn
            }
        };
        Ok(PooledConn {
            conn: Some(conn),
            pool: Arc::clone(self),
        })
    }
}

/// RAII pooled connection; returns to the pool on drop
struct PooledConn {
    conn: Option<Connection>,
    pool: Arc<ReaderPool>,
}

impl std::ops::Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut idle = self.pool.idle.lock();
            if idle.len() < READER_POOL_CAP {
                idle.push(conn);
            }
        }
    }
}

/// The catalog store
pub struct Catalog {
    writer: writer::BatchedWriter,
    readers: Arc<ReaderPool>,
    /// Serializes tag mutations and vacuum; separate from the batched
    /// writer because tag revisions are returned synchronously
    tag_conn: Mutex<Connection>,
}

impl Catalog {
    /// Open (creating if needed) and migrate the catalog database
    pub fn open(db_path: &Path) -> CatalogResult<Self> {
        let conn = Connection::open(db_path).map_err(|e| CatalogError::OpenFailed {
            path: db_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        schema::configure_writer(&conn)?;
        schema::apply_migrations(&conn)?;
        drop(conn);

        let writer = writer::BatchedWriter::start(db_path)?;

        let tag_conn = Connection::open(db_path).map_err(|e| CatalogError::OpenFailed {
            path: db_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        schema::configure_writer(&tag_conn)?;

        Ok(Self {
            writer,
            readers: Arc::new(ReaderPool::new(db_path.to_path_buf())),
            tag_conn: Mutex::new(tag_conn),
        })
    }

    /// Enqueue a write; returns once buffered, never fails synchronously
    pub fn write(&self, path: &str, info: Info, mode: WriteMode) {
        self.writer.handle().write(path, info, mode);
    }

    pub fn write_embedding(&self, id: ImageId, embedding: Embedding) {
        self.writer.handle().write_embedding(id, embedding);
    }

    pub fn delete(&self, id: ImageId) {
        self.writer.handle().delete(id);
    }

    pub fn set_indexed(&self, dir: &str) {
        self.writer.handle().set_indexed(dir);
    }

    /// Block until the write queue is drained
    pub fn wait_for_commit(&self) {
        self.writer.handle().wait_for_commit();
    }

    // ---- point reads ----

    pub fn get_path_from_id(&self, id: ImageId) -> CatalogResult<String> {
        let conn = self.readers.get()?;
        conn.query_row(
            "SELECT path FROM path WHERE id = ?1",
            params![id.0 as i64],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(CatalogError::NotFound)
    }

    pub fn get_id_from_path(&self, path: &str) -> CatalogResult<ImageId> {
        let conn = self.readers.get()?;
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM path WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        id.map(|v| ImageId(v as u32)).ok_or(CatalogError::NotFound)
    }

    pub fn get_info(&self, id: ImageId) -> CatalogResult<Info> {
        let conn = self.readers.get()?;
        conn.query_row(
            "SELECT width, height, orientation, taken_at, color, lat, lon, location
             FROM info WHERE id = ?1",
            params![id.0 as i64],
            info_from_row,
        )
        .optional()?
        .ok_or(CatalogError::NotFound)
    }

    /// Aggregate info for a directory plus its index stamp
    pub fn get_dir(&self, dir: &str) -> CatalogResult<DirRow> {
        let (lo, hi) = prefix_bounds(dir);
        let conn = self.readers.get()?;
        let (file_count, latest): (u64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(MAX(i.taken_at), 0)
             FROM path p JOIN info i ON i.id = p.id
             WHERE p.path >= ?1 AND p.path < ?2",
            params![lo, hi],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get(1)?)),
        )?;
        let indexed_at: Option<i64> = conn
            .query_row(
                "SELECT indexed_at FROM dir WHERE path = ?1",
                params![dir],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(DirRow {
            file_count,
            latest_taken_at: latest,
            indexed_at,
        })
    }

    /// Total number of indexed files under the given roots
    pub fn get_dirs_count(&self, dirs: &[String]) -> CatalogResult<u64> {
        let conn = self.readers.get()?;
        let mut total = 0u64;
        for dir in dirs {
            let (lo, hi) = prefix_bounds(dir);
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM path WHERE path >= ?1 AND path < ?2",
                params![lo, hi],
                |row| row.get(0),
            )?;
            total += count as u64;
        }
        Ok(total)
    }

    pub fn get_image_embedding(&self, id: ImageId) -> CatalogResult<Embedding> {
        let conn = self.readers.get()?;
        conn.query_row(
            "SELECT model, inv_norm, vec FROM embedding WHERE id = ?1",
            params![id.0 as i64],
            |row| {
                Ok(Embedding::from_blob(
                    row.get::<_, i64>(0)? as u32,
                    row.get(2)?,
                    row.get::<_, f64>(1)? as f32,
                ))
            },
        )
        .optional()?
        .ok_or(CatalogError::NotFound)
    }

    // ---- lazy listings ----

    /// Paths under `dirs` in insertion order, capped at `max` per root
    pub fn list_paths(
        &self,
        dirs: &[String],
        max: usize,
        cancel: CancelToken,
    ) -> Receiver<String> {
        let (tx, rx) = bounded(LIST_CHANNEL_CAP);
        let readers = Arc::clone(&self.readers);
        let dirs = dirs.to_vec();
        spawn_producer("catalog-list-paths", move || {
            let conn = match readers.get() {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("list_paths: {}", e);
                    return;
                }
            };
            for dir in &dirs {
                let (lo, hi) = prefix_bounds(dir);
                let result = (|| -> CatalogResult<bool> {
                    let mut stmt = conn.prepare_cached(
                        "SELECT path FROM path WHERE path >= ?1 AND path < ?2
                         ORDER BY id LIMIT ?3",
                    )?;
                    let rows = stmt.query_map(params![lo, hi, limit_param(max)], |row| {
                        row.get::<_, String>(0)
                    })?;
                    for row in rows {
                        if !send_cancellable(&tx, row?, &cancel) {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                })();
                match result {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(e) => {
                        warn!(dir = %dir, "list_paths failed: {}", e);
                        return;
                    }
                }
            }
        });
        rx
    }

    /// Ids under `dirs`; optionally only ids lacking an embedding row for
    /// `model`
    pub fn list_ids(
        &self,
        dirs: &[String],
        max: usize,
        missing_embedding_only: bool,
        model: u32,
        cancel: CancelToken,
    ) -> Receiver<ImageId> {
        let (tx, rx) = bounded(LIST_CHANNEL_CAP);
        let readers = Arc::clone(&self.readers);
        let dirs = dirs.to_vec();
        spawn_producer("catalog-list-ids", move || {
            let conn = match readers.get() {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("list_ids: {}", e);
                    return;
                }
            };
            for dir in &dirs {
                let (lo, hi) = prefix_bounds(dir);
                let result = (|| -> CatalogResult<bool> {
                    let mut forward = |row: rusqlite::Result<i64>| -> CatalogResult<bool> {
                        Ok(send_cancellable(&tx, ImageId(row? as u32), &cancel))
                    };
                    if missing_embedding_only {
                        let mut stmt = conn.prepare_cached(
                            "SELECT p.id FROM path p
                             LEFT JOIN embedding e ON e.id = p.id AND e.model = ?4
                             WHERE p.path >= ?1 AND p.path < ?2 AND e.id IS NULL
                             ORDER BY p.id LIMIT ?3",
                        )?;
                        let rows = stmt.query_map(
                            params![lo, hi, limit_param(max), model as i64],
                            |row| row.get::<_, i64>(0),
                        )?;
                        for row in rows {
                            if !forward(row)? {
                                return Ok(false);
                            }
                        }
                    } else {
                        let mut stmt = conn.prepare_cached(
                            "SELECT id FROM path WHERE path >= ?1 AND path < ?2
                             ORDER BY id LIMIT ?3",
                        )?;
                        let rows = stmt
                            .query_map(params![lo, hi, limit_param(max)], |row| {
                                row.get::<_, i64>(0)
                            })?;
                        for row in rows {
                            if !forward(row)? {
                                return Ok(false);
                            }
                        }
                    }
                    Ok(true)
                })();
                match result {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(e) => {
                        warn!(dir = %dir, "list_ids failed: {}", e);
                        return;
                    }
                }
            }
        });
        rx
    }

    /// Listing rows under `dirs`, ordered per `options`
    pub fn list(
        &self,
        dirs: &[String],
        options: ListOptions,
        cancel: CancelToken,
    ) -> Receiver<SourcedInfo> {
        if options.order == ListOrder::Similarity {
            return self.list_by_similarity(dirs, options, cancel);
        }

        let (tx, rx) = bounded(LIST_CHANNEL_CAP);
        if dirs.is_empty() {
            drop(tx);
            return rx;
        }
        let readers = Arc::clone(&self.readers);
        let dirs = dirs.to_vec();
        spawn_producer("catalog-list", move || {
            let conn = match readers.get() {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("list: {}", e);
                    return;
                }
            };

            let order_sql = match options.order {
                ListOrder::DateAsc => "i.taken_at ASC, p.id ASC",
                ListOrder::DateDesc => "i.taken_at DESC, p.id ASC",
                ListOrder::Path => "p.path ASC",
                ListOrder::Similarity => unreachable!("handled above"),
            };
            let mut sql = String::from(
                "SELECT p.id, i.width, i.height, i.orientation, i.taken_at, i.color,
                        i.lat, i.lon, i.location
                 FROM path p JOIN info i ON i.id = p.id WHERE (",
            );
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            for (n, dir) in dirs.iter().enumerate() {
                let (lo, hi) = prefix_bounds(dir);
                if n > 0 {
                    sql.push_str(" OR ");
                }
                sql.push_str(&format!(
                    "(p.path >= ?{} AND p.path < ?{})",
                    args.len() + 1,
                    args.len() + 2
                ));
                args.push(Box::new(lo));
                args.push(Box::new(hi));
            }
            sql.push(')');
            if let Some((from, to)) = options.date_range {
                sql.push_str(&format!(
                    " AND i.taken_at BETWEEN ?{} AND ?{}",
                    args.len() + 1,
                    args.len() + 2
                ));
                args.push(Box::new(from));
                args.push(Box::new(to));
            }
            sql.push_str(&format!(" ORDER BY {} LIMIT ?{}", order_sql, args.len() + 1));
            args.push(Box::new(limit_param(options.limit)));

            let result = (|| -> CatalogResult<()> {
                let mut stmt = conn.prepare(&sql)?;
                let params_ref: Vec<&dyn rusqlite::ToSql> =
                    args.iter().map(|a| a.as_ref()).collect();
                let rows = stmt.query_map(params_ref.as_slice(), sourced_info_from_row)?;
                for row in rows {
                    if !send_cancellable(&tx, row?, &cancel) {
                        break;
                    }
                }
                Ok(())
            })();
            if let Err(e) = result {
                warn!("list failed: {}", e);
            }
        });
        rx
    }

    /// Similarity ordering: score every candidate embedding against the
    /// reference and emit descending
    fn list_by_similarity(
        &self,
        dirs: &[String],
        options: ListOptions,
        cancel: CancelToken,
    ) -> Receiver<SourcedInfo> {
        let (tx, rx) = bounded(LIST_CHANNEL_CAP);
        let readers = Arc::clone(&self.readers);
        let dirs = dirs.to_vec();
        spawn_producer("catalog-list-similar", move || {
            let reference = match &options.similar_to {
                Some(reference) => reference.clone(),
                None => {
                    warn!("similarity listing without a reference embedding");
                    return;
                }
            };
            let conn = match readers.get() {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("list_by_similarity: {}", e);
                    return;
                }
            };

            let mut scored: Vec<SimilarityInfo> = Vec::new();
            for dir in &dirs {
                let (lo, hi) = prefix_bounds(dir);
                let result = (|| -> CatalogResult<()> {
                    let mut stmt = conn.prepare_cached(
                        "SELECT p.id, i.width, i.height, i.orientation, i.taken_at,
                                i.color, i.lat, i.lon, i.location,
                                e.model, e.inv_norm, e.vec
                         FROM path p
                         JOIN info i ON i.id = p.id
                         JOIN embedding e ON e.id = p.id AND e.model = ?3
                         WHERE p.path >= ?1 AND p.path < ?2",
                    )?;
                    let rows = stmt.query_map(
                        params![lo, hi, reference.model as i64],
                        |row| {
                            let sourced = sourced_info_from_row(row)?;
                            let embedding = Embedding::from_blob(
                                row.get::<_, i64>(9)? as u32,
                                row.get(11)?,
                                row.get::<_, f64>(10)? as f32,
                            );
                            Ok((sourced, embedding))
                        },
                    )?;
                    for row in rows {
                        let (sourced, embedding) = row?;
                        scored.push(SimilarityInfo {
                            similarity: reference.cosine_similarity(&embedding),
                            sourced,
                        });
                    }
                    Ok(())
                })();
                if let Err(e) = result {
                    warn!(dir = %dir, "list_by_similarity failed: {}", e);
                    return;
                }
            }

            scored.sort_by(|a, b| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.sourced.id.cmp(&b.sourced.id))
            });
            if options.limit > 0 {
                scored.truncate(options.limit);
            }
            for info in scored {
                if !send_cancellable(&tx, info.sourced, &cancel) {
                    return;
                }
            }
        });
        rx
    }

    /// Work orders for rows with any requested flag unsatisfied
    ///
    /// With no flags requested, every row is emitted with all flags clear;
    /// callers forcing a full re-index OR their own flags back in.
    pub fn list_missing(
        &self,
        dirs: &[String],
        max: usize,
        want: Missing,
        model: u32,
        cancel: CancelToken,
    ) -> Receiver<MissingInfo> {
        let (tx, rx) = bounded(LIST_CHANNEL_CAP);
        let readers = Arc::clone(&self.readers);
        let dirs = dirs.to_vec();
        spawn_producer("catalog-list-missing", move || {
            let conn = match readers.get() {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("list_missing: {}", e);
                    return;
                }
            };
            for dir in &dirs {
                let (lo, hi) = prefix_bounds(dir);
                let result = (|| -> CatalogResult<bool> {
                    let mut stmt = conn.prepare_cached(
                        "SELECT p.id, p.path,
                                (i.width = 0 OR i.taken_at = 0) AS needs_meta,
                                (i.color = 0) AS needs_color,
                                (e.id IS NULL) AS needs_embedding
                         FROM path p
                         JOIN info i ON i.id = p.id
                         LEFT JOIN embedding e ON e.id = p.id AND e.model = ?4
                         WHERE p.path >= ?1 AND p.path < ?2
                           AND ((?5 AND (i.width = 0 OR i.taken_at = 0))
                             OR (?6 AND i.color = 0)
                             OR (?7 AND e.id IS NULL)
                             OR NOT (?5 OR ?6 OR ?7))
                         ORDER BY p.id LIMIT ?3",
                    )?;
                    let rows = stmt.query_map(
                        params![
                            lo,
                            hi,
                            limit_param(max),
                            model as i64,
                            want.metadata,
                            want.color,
                            want.embedding
                        ],
                        |row| {
                            Ok(MissingInfo {
                                id: ImageId(row.get::<_, i64>(0)? as u32),
                                path: row.get(1)?,
                                missing: Missing {
                                    metadata: want.metadata && row.get::<_, bool>(2)?,
                                    color: want.color && row.get::<_, bool>(3)?,
                                    embedding: want.embedding && row.get::<_, bool>(4)?,
                                },
                            })
                        },
                    )?;
                    for row in rows {
                        if !send_cancellable(&tx, row?, &cancel) {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                })();
                match result {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(e) => {
                        warn!(dir = %dir, "list_missing failed: {}", e);
                        return;
                    }
                }
            }
        });
        rx
    }

    /// Every row under `dir` whose path is not in `observed`
    pub fn delete_nonexistent(
        &self,
        dir: &str,
        observed: HashSet<String>,
        cancel: CancelToken,
    ) -> Receiver<IdPath> {
        let (tx, rx) = bounded(LIST_CHANNEL_CAP);
        let readers = Arc::clone(&self.readers);
        let (lo, hi) = prefix_bounds(dir);
        spawn_producer("catalog-nonexistent", move || {
            let conn = match readers.get() {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("delete_nonexistent: {}", e);
                    return;
                }
            };
            let result = (|| -> CatalogResult<()> {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, path FROM path WHERE path >= ?1 AND path < ?2 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![lo, hi], |row| {
                    Ok(IdPath {
                        id: ImageId(row.get::<_, i64>(0)? as u32),
                        path: row.get(1)?,
                    })
                })?;
                for row in rows {
                    let id_path = row?;
                    if observed.contains(&id_path.path) {
                        continue;
                    }
                    if !send_cancellable(&tx, id_path, &cancel) {
                        break;
                    }
                }
                Ok(())
            })();
            if let Err(e) = result {
                warn!("delete_nonexistent failed: {}", e);
            }
        });
        rx
    }

    /// Compact the database file
    pub fn vacuum(&self) -> CatalogResult<()> {
        let conn = self.tag_conn.lock();
        conn.execute("VACUUM", [])?;
        Ok(())
    }

    // ---- tags ----

    /// Create a tag if absent; idempotent by name, first revision is 1
    pub fn add_tag(&self, name: &str) -> CatalogResult<Tag> {
        let conn = self.tag_conn.lock();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO tag (name, rev) VALUES (?1, 1) ON CONFLICT(name) DO NOTHING",
            params![name],
        )?;
        let tag = tx.query_row(
            "SELECT id, name, rev FROM tag WHERE name = ?1",
            params![name],
            tag_from_row,
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO tag_ids (tag_id, blob) VALUES (?1, ?2)",
            params![tag.id.0, Ids::new().to_blob()],
        )?;
        tx.commit()?;
        Ok(tag)
    }

    pub fn get_tag_by_name(&self, name: &str) -> CatalogResult<Tag> {
        let conn = self.readers.get()?;
        conn.query_row(
            "SELECT id, name, rev FROM tag WHERE name = ?1",
            params![name],
            tag_from_row,
        )
        .optional()?
        .ok_or(CatalogError::NotFound)
    }

    pub fn get_tag_id(&self, name: &str) -> CatalogResult<TagId> {
        self.get_tag_by_name(name).map(|t| t.id)
    }

    /// Set-union `ids` into the tag; returns the new revision
    pub fn add_tag_ids(&self, tag_id: TagId, ids: &Ids) -> CatalogResult<i64> {
        self.mutate_tag_ids(tag_id, |set| set.union_with(ids))
    }

    /// Set-difference `ids` out of the tag; returns the new revision
    pub fn remove_tag_ids(&self, tag_id: TagId, ids: &Ids) -> CatalogResult<i64> {
        self.mutate_tag_ids(tag_id, |set| set.difference_with(ids))
    }

    /// Toggle membership of every id in `ids`; returns the new revision
    pub fn invert_tag_ids(&self, tag_id: TagId, ids: &Ids) -> CatalogResult<i64> {
        self.mutate_tag_ids(tag_id, |set| set.symmetric_difference_with(ids))
    }

    fn mutate_tag_ids<F: FnOnce(&mut Ids)>(
        &self,
        tag_id: TagId,
        mutate: F,
    ) -> CatalogResult<i64> {
        let conn = self.tag_conn.lock();
        let tx = conn.unchecked_transaction()?;

        let blob: Option<Vec<u8>> = tx
            .query_row(
                "SELECT blob FROM tag_ids WHERE tag_id = ?1",
                params![tag_id.0],
                |row| row.get(0),
            )
            .optional()?;
        let mut set = match blob {
            Some(blob) => Ids::from_blob(&blob).map_err(|_| CatalogError::Corruption {
                operation: format!("tag {} bitmap", tag_id.0),
            })?,
            None => Ids::new(),
        };

        mutate(&mut set);

        tx.execute(
            "INSERT INTO tag_ids (tag_id, blob) VALUES (?1, ?2)
             ON CONFLICT(tag_id) DO UPDATE SET blob = excluded.blob",
            params![tag_id.0, set.to_blob()],
        )?;
        let rev: Option<i64> = tx
            .query_row(
                "UPDATE tag SET rev = rev + 1 WHERE id = ?1 RETURNING rev",
                params![tag_id.0],
                |row| row.get(0),
            )
            .optional()?;
        let rev = rev.ok_or(CatalogError::NotFound)?;
        tx.commit()?;
        Ok(rev)
    }

    /// Copy of the tag's full id set
    pub fn get_tag_image_ids(&self, tag_id: TagId) -> CatalogResult<Ids> {
        let conn = self.readers.get()?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT blob FROM tag_ids WHERE tag_id = ?1",
                params![tag_id.0],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            Some(blob) => Ids::from_blob(&blob).map_err(|_| CatalogError::Corruption {
                operation: format!("tag {} bitmap", tag_id.0),
            }),
            None => Err(CatalogError::NotFound),
        }
    }

    /// Tags whose id set contains `id`
    pub fn list_image_tags(&self, id: ImageId, cancel: CancelToken) -> Receiver<Tag> {
        let (tx, rx) = bounded(100);
        let readers = Arc::clone(&self.readers);
        spawn_producer("catalog-image-tags", move || {
            let conn = match readers.get() {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("list_image_tags: {}", e);
                    return;
                }
            };
            let result = (|| -> CatalogResult<()> {
                let mut stmt = conn.prepare_cached(
                    "SELECT t.id, t.name, t.rev, ti.blob
                     FROM tag t JOIN tag_ids ti ON ti.tag_id = t.id
                     ORDER BY t.name",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((tag_from_row(row)?, row.get::<_, Vec<u8>>(3)?))
                })?;
                for row in rows {
                    let (tag, blob) = row?;
                    let set = match Ids::from_blob(&blob) {
                        Ok(set) => set,
                        Err(e) => {
                            warn!(tag = %tag.name, "skipping corrupt bitmap: {}", e);
                            continue;
                        }
                    };
                    if set.contains(id) && !send_cancellable(&tx, tag, &cancel) {
                        break;
                    }
                }
                Ok(())
            })();
            if let Err(e) = result {
                warn!("list_image_tags failed: {}", e);
            }
        });
        rx
    }

    /// Tags matching a name prefix, ordered by name
    pub fn list_tags(&self, prefix: &str, limit: usize, cancel: CancelToken) -> Receiver<Tag> {
        let (tx, rx) = bounded(100);
        let readers = Arc::clone(&self.readers);
        let prefix = prefix.to_string();
        spawn_producer("catalog-list-tags", move || {
            let conn = match readers.get() {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("list_tags: {}", e);
                    return;
                }
            };
            let result = (|| -> CatalogResult<()> {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, name, rev FROM tag
                     WHERE name LIKE ?1 || '%' ESCAPE '\\'
                     ORDER BY name LIMIT ?2",
                )?;
                let escaped = prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
                let rows =
                    stmt.query_map(params![escaped, limit_param(limit)], tag_from_row)?;
                for row in rows {
                    if !send_cancellable(&tx, row?, &cancel) {
                        break;
                    }
                }
                Ok(())
            })();
            if let Err(e) = result {
                warn!("list_tags failed: {}", e);
            }
        });
        rx
    }
}

/// Half-open lexicographic range covering every path directly or
/// transitively under `dir`
fn prefix_bounds(dir: &str) -> (String, String) {
    let sep = std::path::MAIN_SEPARATOR;
    let mut lo = dir.to_string();
    if !lo.ends_with(sep) {
        lo.push(sep);
    }
    let mut hi = lo.clone().into_bytes();
    // The separator is ASCII, so bumping the final byte is safe.
    let last = hi.len() - 1;
    hi[last] += 1;
    (lo, String::from_utf8(hi).expect("ascii separator increment"))
}

/// SQLite LIMIT parameter: 0 means unbounded
fn limit_param(max: usize) -> i64 {
    if max == 0 {
        -1
    } else {
        max as i64
    }
}

fn info_from_row(row: &Row<'_>) -> rusqlite::Result<Info> {
    Ok(Info {
        width: row.get(0)?,
        height: row.get(1)?,
        orientation: row.get(2)?,
        taken_at_unix: row.get(3)?,
        color: row.get(4)?,
        lat: row.get(5)?,
        lon: row.get(6)?,
        location: row.get(7)?,
    })
}

fn sourced_info_from_row(row: &Row<'_>) -> rusqlite::Result<SourcedInfo> {
    Ok(SourcedInfo {
        id: ImageId(row.get::<_, i64>(0)? as u32),
        info: Info {
            width: row.get(1)?,
            height: row.get(2)?,
            orientation: row.get(3)?,
            taken_at_unix: row.get(4)?,
            color: row.get(5)?,
            lat: row.get(6)?,
            lon: row.get(7)?,
            location: row.get(8)?,
        },
    })
}

fn tag_from_row(row: &Row<'_>) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: TagId(row.get(0)?),
        name: row.get(1)?,
        revision: row.get(2)?,
    })
}

fn spawn_producer<F: FnOnce() + Send + 'static>(name: &str, f: F) {
    if let Err(e) = thread::Builder::new().name(name.to_string()).spawn(f) {
        debug!(name, "failed to spawn producer: {}", e);
    }
}
