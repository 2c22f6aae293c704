// Work sessions and their file change log

pub mod annotations;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::error::{Error, Result};
use crate::index::db::{active_session_id, now, IndexDatabase};
use crate::index::records::{row_to_change, row_to_session, ChangeLogEntry, Session};

pub use annotations::{AnnotationStore, NewAnnotation};

const SESSION_SELECT: &str = "SELECT s.session_id, s.started_at, s.ended_at, s.summary, s.transcript_path,
            (SELECT COUNT(*) FROM change_log c WHERE c.session_id = s.session_id)
     FROM sessions s";

/// Records session boundaries; the indexer appends changes to the active one
pub struct SessionTracker {
    db: IndexDatabase,
}

impl SessionTracker {
    pub fn new(db: IndexDatabase) -> Self {
        Self { db }
    }

    /// Open a new session, closing any session still running
    pub fn start(&self, transcript_path: Option<&str>) -> Result<Session> {
        let session = self.db.write("sessions", |tx| {
            let started_at = now();
            if let Some(previous) = active_session_id(tx)? {
                tx.execute(
                    "UPDATE sessions SET ended_at = ?1,
                         summary = COALESCE(summary, 'ended by a new session')
                     WHERE session_id = ?2",
                    params![started_at, previous],
                )?;
                info!("Ended session {} before starting a new one", previous);
            }
            tx.execute(
                "INSERT INTO sessions (started_at, transcript_path) VALUES (?1, ?2)",
                params![started_at, transcript_path],
            )?;
            let id = tx.last_insert_rowid();
            session_by_id(tx, id)?.ok_or_else(|| Error::not_found("session", id.to_string()))
        })?;
        info!("Started session {}", session.session_id);
        Ok(session)
    }

    /// Close the active session; `None` when there is none
    pub fn end(&self, summary: Option<&str>) -> Result<Option<Session>> {
        self.db.write("sessions", |tx| {
            let Some(id) = active_session_id(tx)? else {
                return Ok(None);
            };
            tx.execute(
                "UPDATE sessions SET ended_at = ?1, summary = ?2 WHERE session_id = ?3",
                params![now(), summary, id],
            )?;
            info!("Ended session {}", id);
            session_by_id(tx, id)
        })
    }

    pub fn active(&self) -> Result<Option<Session>> {
        self.db.read(|conn| match active_session_id(conn)? {
            Some(id) => session_by_id(conn, id),
            None => Ok(None),
        })
    }

    /// Most recent sessions first
    pub fn history(&self, limit: usize) -> Result<Vec<Session>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "{} ORDER BY s.session_id DESC LIMIT ?1",
                SESSION_SELECT
            ))?;
            let sessions = stmt
                .query_map([limit as i64], row_to_session)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(sessions)
        })
    }

    /// File changes logged during a session
    pub fn changes(&self, session_id: i64) -> Result<Vec<ChangeLogEntry>> {
        self.db.read(|conn| {
            if session_by_id(conn, session_id)?.is_none() {
                return Err(Error::not_found("session", session_id.to_string()));
            }
            let mut stmt = conn.prepare_cached(
                "SELECT change_id, session_id, path, change_kind, old_hash, new_hash, changed_at
                 FROM change_log WHERE session_id = ?1 ORDER BY change_id",
            )?;
            let changes = stmt
                .query_map([session_id], row_to_change)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(changes)
        })
    }
}

fn session_by_id(conn: &Connection, session_id: i64) -> Result<Option<Session>> {
    Ok(conn
        .query_row(
            &format!("{} WHERE s.session_id = ?1", SESSION_SELECT),
            [session_id],
            row_to_session,
        )
        .optional()?)
}
