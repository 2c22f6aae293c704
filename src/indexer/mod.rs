// Incremental indexing: change detection, extraction and atomic write-back

pub mod parser;
pub mod resolve;
pub mod scan;
pub mod watcher;

use dashmap::DashMap;
use rusqlite::{params, Connection, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::IndexingConfig;
use crate::error::{Error, ExtractionError, Result};
use crate::index::db::{self, IndexDatabase};
use crate::index::records::{ChangeKind, FileRecord};
use crate::index::schema::SCHEMA_VERSION;
use crate::index::{content_hash, module_name, ExtractedFacts, ExtractorRegistry, SourceFile};
use crate::rules::builtin;

/// Metadata key holding the extractor version tag the index was built with
pub const EXTRACTOR_VERSION_KEY: &str = "extractor_version";
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

pub const KNOWLEDGE_CREATED_AT: &str = "index.created_at";
pub const KNOWLEDGE_LAST_REBUILD: &str = "index.last_rebuild";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    /// Re-extract every file regardless of its hash
    Full,
    /// Only touch added, modified and removed files
    Incremental,
}

impl IndexMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexMode::Full => "full",
            IndexMode::Incremental => "incremental",
        }
    }
}

/// A file that could not be indexed in this pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileError {
    pub path: String,
    pub message: String,
    pub line: Option<usize>,
}

/// Summary of one indexing pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexReport {
    pub mode: IndexMode,
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: usize,
    pub errored: Vec<FileError>,
    pub duration_ms: u64,
}

impl IndexReport {
    fn new(mode: IndexMode) -> Self {
        Self {
            mode,
            added: Vec::new(),
            modified: Vec::new(),
            removed: Vec::new(),
            unchanged: 0,
            errored: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Number of files whose stored facts changed
    pub fn changed(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

/// One file scheduled for extraction
struct Job<'f> {
    path: &'f str,
    content: &'f str,
    language: &'static str,
    hash: String,
    prior: Option<FileRecord>,
    read_error: Option<&'f str>,
}

impl Job<'_> {
    fn change_kind(&self) -> ChangeKind {
        if self.prior.is_some() {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        }
    }
}

enum Work<'j, 'f> {
    Write(&'j Job<'f>),
    Remove(&'j FileRecord),
}

/// What a committed batch did
#[derive(Default)]
struct BatchOutcome {
    added: Vec<String>,
    modified: Vec<String>,
    removed: Vec<String>,
    errored: Vec<FileError>,
    /// Modules of files stored for the first time
    new_modules: BTreeSet<String>,
}

/// Prior symbol of a file, used for identity reconciliation
struct PriorSymbol {
    stable_id: String,
    kind: String,
    name: String,
    qualified_name: String,
}

/// The main indexer: reconciles a file list against the store
pub struct Indexer {
    db: IndexDatabase,
    registry: Arc<ExtractorRegistry>,
    batch_size: usize,
    workers: usize,
    default_rule_weight: f64,
}

impl Indexer {
    pub fn new(
        db: IndexDatabase,
        registry: Arc<ExtractorRegistry>,
        config: &IndexingConfig,
        default_rule_weight: f64,
    ) -> Self {
        Self {
            db,
            registry,
            batch_size: config.batch_size.max(1),
            workers: config.workers.max(1),
            default_rule_weight,
        }
    }

    /// Bring the store in line with `files`, the complete current file set
    pub fn run(&self, files: &[SourceFile], mode: IndexMode) -> Result<IndexReport> {
        let started = Instant::now();
        let mut report = IndexReport::new(mode);

        let stored: HashMap<String, FileRecord> = self
            .db
            .files()?
            .into_iter()
            .map(|f| (f.path.clone(), f))
            .collect();

        let mut seen = BTreeSet::new();
        let mut jobs = Vec::new();
        for file in files {
            let Some(extractor) = self.registry.for_path(&file.path) else {
                continue;
            };
            if !seen.insert(file.path.as_str()) {
                continue;
            }
            let hash = content_hash(&file.content);
            let prior = stored.get(&file.path).cloned();
            let unchanged = file.read_error.is_none()
                && matches!(
                    (&prior, mode),
                    (Some(p), IndexMode::Incremental) if p.content_hash == hash && p.parse_error.is_none()
                );
            if unchanged {
                report.unchanged += 1;
                continue;
            }
            jobs.push(Job {
                path: &file.path,
                content: &file.content,
                language: extractor.language(),
                hash,
                prior,
                read_error: file.read_error.as_deref(),
            });
        }

        let removed: Vec<&FileRecord> = stored
            .values()
            .filter(|f| !seen.contains(f.path.as_str()))
            .collect();

        info!(
            "Indexing ({}): {} to extract, {} removed, {} unchanged",
            mode.as_str(),
            jobs.len(),
            removed.len(),
            report.unchanged
        );

        if mode == IndexMode::Full {
            self.db.write("knowledge", |tx| db::clear_knowledge(tx))?;
        }

        let extracted = self.extract_all(&jobs);

        let mut work: Vec<Work> = removed.into_iter().map(Work::Remove).collect();
        work.extend(jobs.iter().map(Work::Write));

        let mut new_modules = BTreeSet::new();
        for batch in work.chunks(self.batch_size) {
            let outcome = self.db.write("index batch", |tx| {
                self.write_batch(tx, batch, &extracted)
            })?;
            report.added.extend(outcome.added);
            report.modified.extend(outcome.modified);
            report.removed.extend(outcome.removed);
            report.errored.extend(outcome.errored);
            new_modules.extend(outcome.new_modules);
        }

        // Imports written before their target module existed
        if !new_modules.is_empty() {
            self.db.write("import resolution", |tx| {
                resolve::re_resolve_imports_of(tx, &new_modules)
            })?;
        }

        report.added.sort();
        report.modified.sort();
        report.removed.sort();
        report.duration_ms = started.elapsed().as_millis() as u64;

        self.finish(&report)?;

        info!(
            "Indexed: {} added, {} modified, {} removed, {} unchanged, {} errored in {}ms",
            report.added.len(),
            report.modified.len(),
            report.removed.len(),
            report.unchanged,
            report.errored.len(),
            report.duration_ms
        );

        Ok(report)
    }

    /// Run extraction for every job on a bounded set of scoped threads
    fn extract_all(&self, jobs: &[Job]) -> DashMap<String, std::result::Result<ExtractedFacts, ExtractionError>> {
        let results = DashMap::with_capacity(jobs.len());
        if jobs.is_empty() {
            return results;
        }

        let next = AtomicUsize::new(0);
        let workers = self.workers.min(jobs.len());
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(job) = jobs.get(i) else {
                        break;
                    };
                    let outcome = match job.read_error {
                        Some(message) => Err(ExtractionError::new(format!("cannot read file: {}", message))),
                        None => self.extract_one(job),
                    };
                    results.insert(job.path.to_string(), outcome);
                });
            }
        });

        debug!("Extracted {} file(s) on {} worker(s)", jobs.len(), workers);
        results
    }

    /// Run one extractor, turning a panic into a failure of that file alone
    fn extract_one(&self, job: &Job) -> std::result::Result<ExtractedFacts, ExtractionError> {
        panic::catch_unwind(AssertUnwindSafe(|| {
            self.registry.extract(job.path, job.content, job.language)
        }))
        .unwrap_or_else(|payload| {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ExtractionError::new(format!("extractor panicked: {}", reason)))
        })
    }

    fn write_batch(
        &self,
        tx: &mut Transaction,
        batch: &[Work],
        extracted: &DashMap<String, std::result::Result<ExtractedFacts, ExtractionError>>,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut touched: BTreeSet<String> = BTreeSet::new();
        let session = db::active_session_id(tx)?;

        for item in batch {
            let path = match item {
                Work::Write(job) => job.path,
                Work::Remove(file) => file.path.as_str(),
            };

            let sp = tx.savepoint()?;
            let result = match item {
                Work::Remove(file) => remove_file(&sp, file, session).map(Some),
                Work::Write(job) => match extracted.get(job.path).as_deref() {
                    Some(Ok(facts)) => apply_file(&sp, job, facts, session).map(Some),
                    Some(Err(err)) => record_failure(&sp, job, err).map(|_| None),
                    None => Err(Error::InvalidInput(format!("{} was not extracted", job.path))),
                },
            };

            if result.is_ok() {
                if let Work::Write(job) = item {
                    if job.prior.is_none() {
                        outcome.new_modules.insert(module_name(job.path));
                    }
                }
            }

            match result {
                Ok(Some(names)) => {
                    sp.commit()?;
                    touched.extend(names);
                    match item {
                        Work::Remove(_) => outcome.removed.push(path.to_string()),
                        Work::Write(job) => match job.change_kind() {
                            ChangeKind::Added => outcome.added.push(path.to_string()),
                            _ => outcome.modified.push(path.to_string()),
                        },
                    }
                }
                Ok(None) => {
                    sp.commit()?;
                    if let Work::Write(job) = item {
                        if let Some(Err(err)) = extracted.get(job.path).as_deref() {
                            warn!("Extraction failed for {}: {}", path, err);
                            outcome.errored.push(FileError {
                                path: path.to_string(),
                                message: err.message.clone(),
                                line: err.line,
                            });
                        }
                    }
                }
                Err(e) if e.is_busy() => return Err(e),
                Err(e) => {
                    // Dropping the savepoint rolls this file back alone
                    drop(sp);
                    warn!("Failed to write {}: {}", path, e);
                    outcome.errored.push(FileError {
                        path: path.to_string(),
                        message: e.to_string(),
                        line: None,
                    });
                }
            }
        }

        if !touched.is_empty() {
            resolve::re_resolve_calls_named(tx, &touched)?;
        }

        Ok(outcome)
    }

    /// Stamp versions and lifecycle knowledge after a pass
    fn finish(&self, report: &IndexReport) -> Result<()> {
        let version_tag = self.registry.version_tag();
        self.db.write("index metadata", |tx| {
            db::set_meta(tx, EXTRACTOR_VERSION_KEY, &version_tag)?;
            db::set_meta(tx, SCHEMA_VERSION_KEY, &SCHEMA_VERSION.to_string())?;

            if db::get_knowledge(tx, KNOWLEDGE_CREATED_AT)?.is_none() {
                db::set_knowledge(tx, KNOWLEDGE_CREATED_AT, &serde_json::json!(db::now()))?;
            }
            if report.mode == IndexMode::Full {
                let stats = db::stats(tx)?;
                db::set_knowledge(
                    tx,
                    KNOWLEDGE_LAST_REBUILD,
                    &serde_json::json!({
                        "at": db::now(),
                        "files": stats.files,
                        "symbols": stats.symbols,
                        "errored": report.errored.len(),
                        "duration_ms": report.duration_ms,
                    }),
                )?;
            }

            builtin::seed(tx, self.default_rule_weight)?;
            Ok(())
        })
    }
}

fn prior_symbols(conn: &Connection, file_id: i64) -> Result<Vec<PriorSymbol>> {
    let mut stmt = conn.prepare_cached(
        "SELECT stable_id, kind, name, qualified_name FROM symbols
         WHERE file_id = ?1 ORDER BY symbol_id",
    )?;
    let rows = stmt.query_map([file_id], |row| {
        Ok(PriorSymbol {
            stable_id: row.get(0)?,
            kind: row.get(1)?,
            name: row.get(2)?,
            qualified_name: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// Replace all facts of one file; returns the symbol names it touched
fn apply_file(
    conn: &Connection,
    job: &Job,
    facts: &ExtractedFacts,
    session: Option<i64>,
) -> Result<BTreeSet<String>> {
    let now = db::now();
    let module = module_name(job.path);

    let file_id: i64 = conn.query_row(
        "INSERT INTO files (path, module, language, content_hash, line_count, parse_error, last_indexed)
         VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)
         ON CONFLICT(path) DO UPDATE SET
             module = excluded.module,
             language = excluded.language,
             content_hash = excluded.content_hash,
             line_count = excluded.line_count,
             parse_error = NULL,
             last_indexed = excluded.last_indexed
         RETURNING file_id",
        params![
            job.path,
            module,
            job.language,
            job.hash,
            job.content.lines().count() as i64,
            now
        ],
        |row| row.get(0),
    )?;

    let prior = prior_symbols(conn, file_id)?;
    let mut touched: BTreeSet<String> = prior.iter().map(|s| s.name.clone()).collect();

    // (qualified_name, kind) -> prior stable ids, in declaration order
    let mut identities: HashMap<(&str, &str), VecDeque<&str>> = HashMap::new();
    for symbol in &prior {
        identities
            .entry((symbol.qualified_name.as_str(), symbol.kind.as_str()))
            .or_default()
            .push_back(symbol.stable_id.as_str());
    }

    conn.execute("DELETE FROM calls WHERE file_id = ?1", [file_id])?;
    conn.execute("DELETE FROM refs WHERE file_id = ?1", [file_id])?;
    conn.execute("DELETE FROM imports WHERE file_id = ?1", [file_id])?;
    conn.execute("DELETE FROM symbols WHERE file_id = ?1", [file_id])?;

    let mut ids: Vec<i64> = Vec::with_capacity(facts.symbols.len());
    let mut kept: BTreeSet<&str> = BTreeSet::new();
    {
        let mut insert = conn.prepare_cached(
            "INSERT INTO symbols (stable_id, file_id, parent_id, kind, name, qualified_name,
                                  signature, docstring, start_line, end_line, complexity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;
        for symbol in &facts.symbols {
            let inherited = identities
                .get_mut(&(symbol.qualified_name.as_str(), symbol.kind.as_str()))
                .and_then(|ids| ids.pop_front());
            let stable_id = match inherited {
                Some(id) => {
                    kept.insert(id);
                    id.to_string()
                }
                None => uuid::Uuid::new_v4().to_string(),
            };
            let parent_id = symbol.parent.and_then(|p| ids.get(p).copied());
            insert.execute(params![
                stable_id,
                file_id,
                parent_id,
                symbol.kind.as_str(),
                symbol.name,
                symbol.qualified_name,
                symbol.signature,
                symbol.docstring,
                symbol.start_line as i64,
                symbol.end_line as i64,
                symbol.complexity as i64,
            ])?;
            ids.push(conn.last_insert_rowid());
            touched.insert(symbol.name.clone());
        }
    }

    {
        let mut insert = conn.prepare_cached(
            "INSERT INTO calls (file_id, caller_id, callee_expr, line) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for call in &facts.calls {
            let caller_id = call.caller.and_then(|c| ids.get(c).copied());
            insert.execute(params![file_id, caller_id, call.callee_expr, call.line as i64])?;
        }
    }
    {
        let mut insert = conn.prepare_cached(
            "INSERT INTO refs (file_id, symbol_id, kind, target, line) VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for reference in &facts.refs {
            let symbol_id = reference.symbol.and_then(|s| ids.get(s).copied());
            insert.execute(params![
                file_id,
                symbol_id,
                reference.kind.as_str(),
                reference.target,
                reference.line as i64
            ])?;
        }
    }
    {
        let mut insert = conn.prepare_cached(
            "INSERT INTO imports (file_id, module, names, line) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for import in &facts.imports {
            insert.execute(params![
                file_id,
                import.module,
                serde_json::to_string(&import.names)?,
                import.line as i64
            ])?;
        }
    }

    let orphaned: Vec<&str> = prior
        .iter()
        .map(|s| s.stable_id.as_str())
        .filter(|id| !kept.contains(id))
        .collect();
    orphan_symbols(conn, &orphaned, &now)?;
    if !orphaned.is_empty() {
        debug!("{}: {} symbol identities retired", job.path, orphaned.len());
    }

    // A file annotation comes back when its path is indexed again
    conn.execute(
        "UPDATE annotations SET orphaned = 0, orphaned_at = NULL
         WHERE target_type = 'file' AND target_id = ?1 AND orphaned = 1",
        [job.path],
    )?;

    resolve::resolve_file_calls(conn, file_id)?;
    resolve::resolve_file_imports(conn, file_id)?;

    if let Some(session_id) = session {
        log_change(
            conn,
            session_id,
            job.path,
            job.change_kind(),
            job.prior.as_ref().map(|p| p.content_hash.as_str()),
            Some(&job.hash),
        )?;
    }

    Ok(touched)
}

/// Keep the previous facts of a file that failed to extract and mark it
fn record_failure(conn: &Connection, job: &Job, err: &ExtractionError) -> Result<()> {
    let message = match err.line {
        Some(line) => format!("line {}: {}", line, err.message),
        None => err.message.clone(),
    };
    // New files are stored with an empty hash so the next pass retries them
    conn.execute(
        "INSERT INTO files (path, module, language, content_hash, line_count, parse_error, last_indexed)
         VALUES (?1, ?2, ?3, '', ?4, ?5, ?6)
         ON CONFLICT(path) DO UPDATE SET
             parse_error = excluded.parse_error,
             last_indexed = excluded.last_indexed",
        params![
            job.path,
            module_name(job.path),
            job.language,
            job.content.lines().count() as i64,
            message,
            db::now()
        ],
    )?;
    Ok(())
}

/// Delete a file and everything derived from it
fn remove_file(conn: &Connection, file: &FileRecord, session: Option<i64>) -> Result<BTreeSet<String>> {
    let now = db::now();
    let prior = prior_symbols(conn, file.file_id)?;
    let stable_ids: Vec<&str> = prior.iter().map(|s| s.stable_id.as_str()).collect();
    orphan_symbols(conn, &stable_ids, &now)?;

    conn.execute(
        "UPDATE annotations SET orphaned = 1, orphaned_at = ?2
         WHERE target_type = 'file' AND target_id = ?1 AND orphaned = 0",
        params![file.path, now],
    )?;
    conn.execute(
        "UPDATE diagnostics SET status = 'resolved', resolved_at = ?2
         WHERE path = ?1 AND status = 'open'",
        params![file.path, now],
    )?;

    conn.execute("DELETE FROM files WHERE file_id = ?1", [file.file_id])?;

    if let Some(session_id) = session {
        log_change(
            conn,
            session_id,
            &file.path,
            ChangeKind::Removed,
            Some(&file.content_hash),
            None,
        )?;
    }

    debug!("Removed {} ({} symbols)", file.path, prior.len());
    Ok(prior.into_iter().map(|s| s.name).collect())
}

/// Detach notes and findings from symbol identities that no longer exist
fn orphan_symbols(conn: &Connection, stable_ids: &[&str], now: &str) -> Result<()> {
    if stable_ids.is_empty() {
        return Ok(());
    }
    let mut annotations = conn.prepare_cached(
        "UPDATE annotations SET orphaned = 1, orphaned_at = ?2
         WHERE target_type = 'symbol' AND target_id = ?1 AND orphaned = 0",
    )?;
    let mut diagnostics = conn.prepare_cached(
        "UPDATE diagnostics SET status = 'resolved', resolved_at = ?2
         WHERE symbol_stable_id = ?1 AND status = 'open'",
    )?;
    for id in stable_ids {
        annotations.execute(params![id, now])?;
        diagnostics.execute(params![id, now])?;
    }
    Ok(())
}

fn log_change(
    conn: &Connection,
    session_id: i64,
    path: &str,
    kind: ChangeKind,
    old_hash: Option<&str>,
    new_hash: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO change_log (session_id, path, change_kind, old_hash, new_hash, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![session_id, path, kind.as_str(), old_hash, new_hash, db::now()],
    )?;
    Ok(())
}
