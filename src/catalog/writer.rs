//! Batched catalog writer
//!
//! All catalog mutations funnel through one dedicated thread so SQLite sees
//! a single writer. Calls enqueue a message and return immediately; the
//! thread coalesces pending writes into transactions bounded by batch size
//! or batch delay, whichever is reached first.
//!
//! State machine: idle -> (first write) -> collecting -> (batch full OR
//! timer fired) -> committing -> idle. A shutdown request drains through
//! one final commit. Commit I/O errors are logged and retried with
//! exponential backoff; the buffered batch is kept until it lands.

use crate::catalog::schema;
use crate::embedding::Embedding;
use crate::error::{CatalogError, CatalogResult};
use crate::types::{ImageId, Info, WriteMode};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rusqlite::{params, Connection, ErrorCode};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Writes per transaction before an early commit
const BATCH_SIZE: usize = 1024;

/// Longest a buffered write waits before a commit
const BATCH_DELAY: Duration = Duration::from_millis(250);

/// Capacity of the writer inbox; enqueueing blocks beyond this
const CHANNEL_SIZE: usize = 4096;

/// Backoff bounds for failed commits
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(5);

/// Messages accepted by the writer thread
enum WriterMessage {
    Write {
        path: String,
        info: Info,
        mode: WriteMode,
    },
    WriteEmbedding {
        id: ImageId,
        embedding: Embedding,
    },
    Delete(ImageId),
    SetIndexed(String),
    /// Commit everything buffered, then ack
    Flush(Sender<()>),
}

/// Statistics about write operations
#[derive(Debug, Default)]
pub struct WriterStats {
    pub writes_applied: AtomicU64,
    pub batches_committed: AtomicU64,
    pub commit_retries: AtomicU64,
}

impl WriterStats {
    pub fn writes_applied(&self) -> u64 {
        self.writes_applied.load(Ordering::Relaxed)
    }

    pub fn batches_committed(&self) -> u64 {
        self.batches_committed.load(Ordering::Relaxed)
    }
}

/// Handle for enqueueing catalog mutations
#[derive(Clone)]
pub struct WriterHandle {
    sender: Sender<WriterMessage>,
    stats: Arc<WriterStats>,
}

impl WriterHandle {
    /// Enqueue a write; never fails synchronously
    pub fn write(&self, path: &str, info: Info, mode: WriteMode) {
        let msg = WriterMessage::Write {
            path: path.to_string(),
            info,
            mode,
        };
        if self.sender.send(msg).is_err() {
            warn!(path, "catalog writer is gone; write dropped");
        }
    }

    pub fn write_embedding(&self, id: ImageId, embedding: Embedding) {
        if self
            .sender
            .send(WriterMessage::WriteEmbedding { id, embedding })
            .is_err()
        {
            warn!(%id, "catalog writer is gone; embedding dropped");
        }
    }

    pub fn delete(&self, id: ImageId) {
        if self.sender.send(WriterMessage::Delete(id)).is_err() {
            warn!(%id, "catalog writer is gone; delete dropped");
        }
    }

    pub fn set_indexed(&self, dir: &str) {
        if self
            .sender
            .send(WriterMessage::SetIndexed(dir.to_string()))
            .is_err()
        {
            warn!(dir, "catalog writer is gone; set_indexed dropped");
        }
    }

    /// Block until every previously enqueued write has committed
    pub fn wait_for_commit(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.sender.send(WriterMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }
}

/// The batched writer and its thread
pub struct BatchedWriter {
    handle: Option<WriterHandle>,
    thread: Option<JoinHandle<()>>,
}

impl BatchedWriter {
    /// Open the database for writing and start the committer thread
    pub fn start(db_path: &Path) -> CatalogResult<Self> {
        let conn = Connection::open(db_path).map_err(|e| CatalogError::OpenFailed {
            path: db_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        schema::configure_writer(&conn)?;

        let (sender, receiver) = bounded(CHANNEL_SIZE);
        let stats = Arc::new(WriterStats::default());
        let stats_clone = Arc::clone(&stats);

        let thread = thread::Builder::new()
            .name("catalog-writer".into())
            .spawn(move || writer_thread(conn, receiver, stats_clone))
            .map_err(|e| CatalogError::OpenFailed {
                path: db_path.to_path_buf(),
                reason: format!("failed to spawn writer thread: {}", e),
            })?;

        Ok(Self {
            handle: Some(WriterHandle { sender, stats }),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> WriterHandle {
        self.handle
            .as_ref()
            .expect("writer handle present until drop")
            .clone()
    }
}

impl Drop for BatchedWriter {
    fn drop(&mut self) {
        // Once every cloned handle is gone the inbox disconnects and the
        // thread drains through its final commit.
        if let Some(handle) = self.handle.take() {
            handle.wait_for_commit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn writer_thread(conn: Connection, receiver: Receiver<WriterMessage>, stats: Arc<WriterStats>) {
    let mut buffer: Vec<WriterMessage> = Vec::with_capacity(BATCH_SIZE);
    let mut collecting_since: Option<Instant> = None;
    let mut pending_acks: Vec<Sender<()>> = Vec::new();

    loop {
        // Idle: block for the first write. Collecting: wait at most until
        // the batch timer for the buffered writes fires.
        let msg = match collecting_since {
            None => match receiver.recv() {
                Ok(msg) => Some(msg),
                Err(_) => None,
            },
            Some(since) => {
                let deadline = since + BATCH_DELAY;
                match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(msg) => Some(msg),
                    Err(RecvTimeoutError::Timeout) => {
                        flush(&conn, &mut buffer, &mut pending_acks, &stats);
                        collecting_since = None;
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => None,
                }
            }
        };

        match msg {
            Some(WriterMessage::Flush(ack)) => {
                pending_acks.push(ack);
                flush(&conn, &mut buffer, &mut pending_acks, &stats);
                collecting_since = None;
            }
            Some(msg) => {
                if collecting_since.is_none() {
                    collecting_since = Some(Instant::now());
                }
                buffer.push(msg);
                if buffer.len() >= BATCH_SIZE {
                    flush(&conn, &mut buffer, &mut pending_acks, &stats);
                    collecting_since = None;
                }
            }
            None => {
                // Input closed: drain through one last commit.
                flush(&conn, &mut buffer, &mut pending_acks, &stats);
                break;
            }
        }
    }
}

/// Commit the buffered batch, retrying with backoff until it lands
fn flush(
    conn: &Connection,
    buffer: &mut Vec<WriterMessage>,
    pending_acks: &mut Vec<Sender<()>>,
    stats: &WriterStats,
) {
    let mut backoff = RETRY_BASE;
    while !buffer.is_empty() {
        match commit_batch(conn, buffer) {
            Ok(applied) => {
                buffer.clear();
                stats.writes_applied.fetch_add(applied, Ordering::Relaxed);
                stats.batches_committed.fetch_add(1, Ordering::Relaxed);
                break;
            }
            Err(e) => {
                if is_corruption(&e) {
                    error!("catalog corruption during commit: {}; aborting", e);
                    std::process::abort();
                }
                stats.commit_retries.fetch_add(1, Ordering::Relaxed);
                warn!("catalog commit failed: {}; retrying in {:?}", e, backoff);
                thread::sleep(backoff);
                backoff = (backoff * 2).min(RETRY_MAX);
            }
        }
    }
    for ack in pending_acks.drain(..) {
        let _ = ack.send(());
    }
}

fn is_corruption(err: &CatalogError) -> bool {
    match err {
        CatalogError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
            e.code,
            ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase
        ),
        CatalogError::Corruption { .. } => true,
        _ => false,
    }
}

fn commit_batch(conn: &Connection, buffer: &[WriterMessage]) -> CatalogResult<u64> {
    let tx = conn.unchecked_transaction()?;
    let mut applied = 0u64;

    for msg in buffer {
        match msg {
            WriterMessage::Write { path, info, mode } => {
                apply_write(&tx, path, info, *mode)?;
                applied += 1;
            }
            WriterMessage::WriteEmbedding { id, embedding } => {
                tx.prepare_cached(
                    "INSERT INTO embedding (id, model, inv_norm, vec)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                        model = excluded.model,
                        inv_norm = excluded.inv_norm,
                        vec = excluded.vec",
                )?
                .execute(params![
                    id.0 as i64,
                    embedding.model as i64,
                    embedding.inv_norm as f64,
                    embedding.data,
                ])?;
                applied += 1;
            }
            WriterMessage::Delete(id) => {
                tx.prepare_cached("DELETE FROM embedding WHERE id = ?1")?
                    .execute(params![id.0 as i64])?;
                tx.prepare_cached("DELETE FROM info WHERE id = ?1")?
                    .execute(params![id.0 as i64])?;
                tx.prepare_cached("DELETE FROM path WHERE id = ?1")?
                    .execute(params![id.0 as i64])?;
                applied += 1;
            }
            WriterMessage::SetIndexed(dir) => {
                tx.prepare_cached(
                    "INSERT INTO dir (path, indexed_at) VALUES (?1, strftime('%s','now'))
                     ON CONFLICT(path) DO UPDATE SET indexed_at = excluded.indexed_at",
                )?
                .execute(params![dir])?;
                applied += 1;
            }
            WriterMessage::Flush(_) => unreachable!("flush is handled before buffering"),
        }
    }

    tx.commit()?;
    Ok(applied)
}

/// Apply one write according to its mode
///
/// All modes first make sure the path and info rows exist, preserving any
/// existing id; APPEND stops there, MERGE overwrites only non-default
/// fields, UPDATE replaces the row fully.
fn apply_write(
    tx: &rusqlite::Transaction<'_>,
    path: &str,
    info: &Info,
    mode: WriteMode,
) -> CatalogResult<()> {
    tx.prepare_cached("INSERT INTO path (path) VALUES (?1) ON CONFLICT(path) DO NOTHING")?
        .execute(params![path])?;
    tx.prepare_cached(
        "INSERT OR IGNORE INTO info (id) SELECT id FROM path WHERE path = ?1",
    )?
    .execute(params![path])?;

    match mode {
        WriteMode::Append => {}
        WriteMode::Merge => {
            tx.prepare_cached(
                "UPDATE info SET
                    width = CASE WHEN ?2 != 0 THEN ?2 ELSE width END,
                    height = CASE WHEN ?3 != 0 THEN ?3 ELSE height END,
                    orientation = CASE WHEN ?4 != 1 THEN ?4 ELSE orientation END,
                    taken_at = CASE WHEN ?5 != 0 THEN ?5 ELSE taken_at END,
                    color = CASE WHEN ?6 != 0 THEN ?6 ELSE color END,
                    lat = COALESCE(?7, lat),
                    lon = COALESCE(?8, lon),
                    location = COALESCE(?9, location)
                 WHERE id = (SELECT id FROM path WHERE path = ?1)",
            )?
            .execute(params![
                path,
                info.width,
                info.height,
                info.orientation,
                info.taken_at_unix,
                info.color,
                info.lat,
                info.lon,
                info.location,
            ])?;
        }
        WriteMode::Update => {
            tx.prepare_cached(
                "UPDATE info SET
                    width = ?2, height = ?3, orientation = ?4, taken_at = ?5,
                    color = ?6, lat = ?7, lon = ?8, location = ?9
                 WHERE id = (SELECT id FROM path WHERE path = ?1)",
            )?
            .execute(params![
                path,
                info.width,
                info.height,
                info.orientation,
                info.taken_at_unix,
                info.color,
                info.lat,
                info.lon,
                info.location,
            ])?;
        }
    }
    Ok(())
}
