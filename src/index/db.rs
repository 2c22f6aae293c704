use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::records::{row_to_file, FileRecord, IndexStats, FILE_COLUMNS};
use super::schema::{self, configure_connection, init_schema, SchemaState};
use crate::error::{Error, Result};

/// Type alias for connection pool
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// Attempts made on a busy write transaction before giving up
const WRITE_ATTEMPTS: u32 = 5;
const WRITE_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct ConnectionCustomizer;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ConnectionCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        configure_connection(conn)
    }

    fn on_release(&self, _conn: Connection) {}
}

struct Inner {
    db_path: PathBuf,
    writer: Mutex<Connection>,
    read_pool: ConnectionPool,
    schema_state: Mutex<SchemaState>,
}

/// Database handle: one serialized writer plus a pool of snapshot readers
#[derive(Clone)]
pub struct IndexDatabase {
    inner: Arc<Inner>,
}

impl IndexDatabase {
    /// Create or open a database
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        info!("Opening index at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Open write connection first and run migrations
        let writer = Connection::open(&db_path)?;
        configure_connection(&writer)?;
        let schema_state = init_schema(&writer)?;

        let manager = SqliteConnectionManager::file(&db_path);
        let read_pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .connection_timeout(Duration::from_secs(10))
            .connection_customizer(Box::new(ConnectionCustomizer))
            .build(manager)?;

        debug!("Read pool ready for {}", db_path.display());

        Ok(Self {
            inner: Arc::new(Inner {
                db_path,
                writer: Mutex::new(writer),
                read_pool,
                schema_state: Mutex::new(schema_state),
            }),
        })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.inner.db_path
    }

    pub fn schema_state(&self) -> SchemaState {
        self.inner.schema_state.lock().clone()
    }

    /// Drop every table and recreate the current schema
    pub fn reset_schema(&self) -> Result<()> {
        let conn = self.inner.writer.lock();
        warn!("Resetting index schema at {}", self.inner.db_path.display());
        schema::drop_schema(&conn)?;
        let state = init_schema(&conn)?;
        *self.inner.schema_state.lock() = state;
        Ok(())
    }

    /// Run `f` inside an IMMEDIATE transaction on the single writer.
    ///
    /// A busy database is retried with linear backoff; `f` may therefore run
    /// more than once and must not have side effects outside the transaction.
    pub fn write<T, F>(&self, target: &str, mut f: F) -> Result<T>
    where
        F: FnMut(&mut Transaction) -> Result<T>,
    {
        let mut conn = self.inner.writer.lock();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match run_immediate(&mut conn, &mut f) {
                Err(e) if e.is_busy() => {
                    if attempt >= WRITE_ATTEMPTS {
                        return Err(Error::ConcurrentWrite {
                            target: target.to_string(),
                            attempts: attempt,
                        });
                    }
                    warn!("Write to {} busy (attempt {}), retrying", target, attempt);
                    std::thread::sleep(WRITE_BACKOFF * attempt);
                }
                other => return other,
            }
        }
    }

    /// Run `f` inside a deferred transaction on a pooled reader, so every
    /// statement sees the same committed snapshot
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let mut conn = self.inner.read_pool.get()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.finish()?;
        Ok(value)
    }

    /// Get index statistics
    pub fn stats(&self) -> Result<IndexStats> {
        self.read(|conn| stats(conn))
    }

    pub fn file(&self, path: &str) -> Result<Option<FileRecord>> {
        self.read(|conn| file_by_path(conn, path))
    }

    pub fn files(&self) -> Result<Vec<FileRecord>> {
        self.read(|conn| list_files(conn))
    }

    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        self.read(|conn| get_meta(conn, key))
    }

    pub fn knowledge(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.read(|conn| get_knowledge(conn, key))
    }

    pub fn set_knowledge(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.write("knowledge", |tx| set_knowledge(tx, key, value))
    }
}

fn run_immediate<T, F>(conn: &mut Connection, f: &mut F) -> Result<T>
where
    F: FnMut(&mut Transaction) -> Result<T>,
{
    let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&mut tx)?;
    tx.commit()?;
    Ok(value)
}

/// Current timestamp, RFC 3339 in UTC
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM index_meta WHERE key = ?1", [key], |row| row.get(0))
        .optional()?)
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO index_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn get_knowledge(conn: &Connection, key: &str) -> Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM knowledge WHERE key = ?1", [key], |row| row.get(0))
        .optional()?;
    match raw {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn set_knowledge(conn: &Connection, key: &str, value: &serde_json::Value) -> Result<()> {
    conn.execute(
        "INSERT INTO knowledge (key, value_json, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
        params![key, serde_json::to_string(value)?, now()],
    )?;
    Ok(())
}

pub fn clear_knowledge(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM knowledge", [])?;
    Ok(())
}

pub fn file_by_path(conn: &Connection, path: &str) -> Result<Option<FileRecord>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM files WHERE path = ?1", FILE_COLUMNS),
            [path],
            row_to_file,
        )
        .optional()?)
}

pub fn list_files(conn: &Connection) -> Result<Vec<FileRecord>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM files ORDER BY path", FILE_COLUMNS))?;
    let files = stmt
        .query_map([], row_to_file)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(files)
}

/// Id of the session that has not ended yet, if any
pub fn active_session_id(conn: &Connection) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT session_id FROM sessions WHERE ended_at IS NULL
             ORDER BY session_id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

fn count(conn: &Connection, sql: &str) -> Result<usize> {
    let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(n.max(0) as usize)
}

pub fn stats(conn: &Connection) -> Result<IndexStats> {
    Ok(IndexStats {
        files: count(conn, "SELECT COUNT(*) FROM files")?,
        errored_files: count(conn, "SELECT COUNT(*) FROM files WHERE parse_error IS NOT NULL")?,
        symbols: count(conn, "SELECT COUNT(*) FROM symbols")?,
        calls: count(conn, "SELECT COUNT(*) FROM calls")?,
        resolved_calls: count(conn, "SELECT COUNT(*) FROM calls WHERE callee_id IS NOT NULL")?,
        refs: count(conn, "SELECT COUNT(*) FROM refs")?,
        imports: count(conn, "SELECT COUNT(*) FROM imports")?,
        resolved_imports: count(
            conn,
            "SELECT COUNT(*) FROM imports WHERE resolved_file_id IS NOT NULL",
        )?,
        rules: count(conn, "SELECT COUNT(*) FROM rules")?,
        open_diagnostics: count(conn, "SELECT COUNT(*) FROM diagnostics WHERE status = 'open'")?,
        annotations: count(conn, "SELECT COUNT(*) FROM annotations")?,
        orphaned_annotations: count(conn, "SELECT COUNT(*) FROM annotations WHERE orphaned = 1")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");

        let db = IndexDatabase::open(&db_path).unwrap();
        assert!(db_path.exists());
        assert_eq!(db.schema_state(), SchemaState::Current);
        assert_eq!(db.path(), db_path.as_path());
    }

    #[test]
    fn test_open_under_a_file_is_io_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();

        let result = IndexDatabase::open(blocker.join("nested").join("test.db"));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_stats_on_empty_index() {
        let dir = tempdir().unwrap();
        let db = IndexDatabase::open(dir.path().join("test.db")).unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats, IndexStats::default());
    }

    #[test]
    fn test_write_is_visible_to_readers_after_commit() {
        let dir = tempdir().unwrap();
        let db = IndexDatabase::open(dir.path().join("test.db")).unwrap();

        db.write("files", |tx| {
            tx.execute(
                "INSERT INTO files (path, module, language, content_hash, last_indexed)
                 VALUES ('a.py', 'a', 'python', 'h1', ?1)",
                [now()],
            )?;
            Ok(())
        })
        .unwrap();

        let file = db.file("a.py").unwrap().unwrap();
        assert_eq!(file.content_hash, "h1");
        assert!(db.file("b.py").unwrap().is_none());
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let dir = tempdir().unwrap();
        let db = IndexDatabase::open(dir.path().join("test.db")).unwrap();

        let result: Result<()> = db.write("files", |tx| {
            tx.execute(
                "INSERT INTO files (path, module, language, content_hash, last_indexed)
                 VALUES ('a.py', 'a', 'python', 'h1', 'now')",
                [],
            )?;
            Err(Error::InvalidInput("abort".to_string()))
        });
        assert!(result.is_err());
        assert!(db.files().unwrap().is_empty());
    }

    #[test]
    fn test_knowledge_and_meta() {
        let dir = tempdir().unwrap();
        let db = IndexDatabase::open(dir.path().join("test.db")).unwrap();

        db.set_knowledge("index.created_at", &serde_json::json!("2024-01-01"))
            .unwrap();
        assert_eq!(
            db.knowledge("index.created_at").unwrap(),
            Some(serde_json::json!("2024-01-01"))
        );

        db.write("meta", |tx| set_meta(tx, "extractor_version", "python:1"))
            .unwrap();
        assert_eq!(db.meta("extractor_version").unwrap().as_deref(), Some("python:1"));

        db.write("knowledge", |tx| clear_knowledge(tx)).unwrap();
        assert!(db.knowledge("index.created_at").unwrap().is_none());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let db = IndexDatabase::open(&path).unwrap();
            db.write("meta", |tx| set_meta(tx, "k", "v")).unwrap();
        }
        let db = IndexDatabase::open(&path).unwrap();
        assert_eq!(db.meta("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_reset_schema_clears_incompatible_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE legacy (id INTEGER);").unwrap();
        }

        let db = IndexDatabase::open(&path).unwrap();
        assert_eq!(db.schema_state(), SchemaState::Incompatible { found: 0 });

        db.reset_schema().unwrap();
        assert_eq!(db.schema_state(), SchemaState::Current);
        assert_eq!(db.stats().unwrap().files, 0);
    }
}
