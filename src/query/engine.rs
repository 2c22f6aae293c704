// Query execution engine

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::error::Result;
use crate::index::db::{file_by_path, IndexDatabase};
use crate::index::records::{
    row_to_annotation, row_to_diagnostic, row_to_import, row_to_symbol, row_to_symbol_ref,
    Annotation, CallEdge, Diagnostic, FileRecord, ImportRecord, RefRecord, SymbolRecord,
    SymbolRef, ANNOTATION_COLUMNS, DIAGNOSTIC_COLUMNS, IMPORT_SELECT, SYMBOL_COLUMNS,
};
use crate::index::{RefKind, SymbolKind};

/// Everything directly connected to one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolContext {
    pub symbol: SymbolRecord,
    /// Calls resolved to this symbol
    pub callers: Vec<CallEdge>,
    /// Calls made by this symbol, resolved or not
    pub callees: Vec<CallEdge>,
    pub refs: Vec<RefRecord>,
    pub annotations: Vec<Annotation>,
    /// Open diagnostics on this symbol or inside its line range
    pub diagnostics: Vec<Diagnostic>,
    /// Other symbols the same name matched
    pub other_matches: Vec<SymbolRef>,
}

/// One file with the facts, notes and findings stored for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSummary {
    pub file: FileRecord,
    pub symbols: Vec<SymbolRecord>,
    pub imports: Vec<ImportRecord>,
    /// Live notes on the file and on its symbols
    pub annotations: Vec<Annotation>,
    pub diagnostics: Vec<Diagnostic>,
}

/// File-level import dependencies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportGraph {
    /// Importing files and the files they resolve to, sorted
    pub nodes: Vec<String>,
    pub edges: Vec<ImportRecord>,
}

/// Optional narrowing for `search`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub kind: Option<SymbolKind>,
    pub path_prefix: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub symbol: SymbolRef,
    pub signature: Option<String>,
    pub docstring: Option<String>,
    /// Higher is better
    pub score: f64,
}

const EDGE_SELECT: &str = "SELECT c.callee_expr, cf.path, c.line,
            cs.stable_id, cs.qualified_name, cs.kind, csf.path, cs.start_line,
            ts.stable_id, ts.qualified_name, ts.kind, tsf.path, ts.start_line
     FROM calls c
     JOIN files cf ON cf.file_id = c.file_id
     LEFT JOIN symbols cs ON cs.symbol_id = c.caller_id
     LEFT JOIN files csf ON csf.file_id = cs.file_id
     LEFT JOIN symbols ts ON ts.symbol_id = c.callee_id
     LEFT JOIN files tsf ON tsf.file_id = ts.file_id";

fn row_to_edge(row: &rusqlite::Row) -> rusqlite::Result<CallEdge> {
    Ok(CallEdge {
        callee_expr: row.get(0)?,
        path: row.get(1)?,
        line: row.get::<_, i64>(2)?.max(0) as usize,
        caller: row_to_symbol_ref(row, 3)?,
        resolved: row_to_symbol_ref(row, 8)?,
    })
}

/// Symbols a user-supplied name refers to, best match first.
///
/// An exact qualified name (`Parser.parse`) or module-qualified name
/// (`pkg.io.Parser.parse`) wins over a plain short-name match.
pub fn find_symbols(
    conn: &Connection,
    name: &str,
    kind: Option<SymbolKind>,
) -> Result<Vec<SymbolRecord>> {
    let kind = kind.map(|k| k.as_str());
    for predicate in [
        "(s.qualified_name = ?1 OR f.module || '.' || s.qualified_name = ?1)",
        "s.name = ?1",
    ] {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM symbols s JOIN files f ON f.file_id = s.file_id
             WHERE {} AND (?2 IS NULL OR s.kind = ?2)
             ORDER BY f.path, s.start_line, s.symbol_id",
            SYMBOL_COLUMNS, predicate
        ))?;
        let symbols = stmt
            .query_map(params![name, kind], row_to_symbol)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if !symbols.is_empty() {
            return Ok(symbols);
        }
    }
    Ok(Vec::new())
}

/// Query engine
pub struct QueryEngine {
    db: IndexDatabase,
}

impl QueryEngine {
    pub fn new(db: IndexDatabase) -> Self {
        Self { db }
    }

    /// Direct context of the best match for `name`; `None` when nothing matches
    pub fn get_context(&self, name: &str, kind: Option<SymbolKind>) -> Result<Option<SymbolContext>> {
        self.db.read(|conn| {
            let mut matches = find_symbols(conn, name, kind)?;
            if matches.is_empty() {
                debug!("No symbol matches {}", name);
                return Ok(None);
            }
            let symbol = matches.remove(0);
            let other_matches = matches.iter().map(SymbolRef::from).collect();

            Ok(Some(SymbolContext {
                callers: callers(conn, symbol.symbol_id)?,
                callees: callees(conn, symbol.symbol_id)?,
                refs: refs(conn, symbol.symbol_id)?,
                annotations: symbol_annotations(conn, &symbol.stable_id)?,
                diagnostics: open_diagnostics(conn, &symbol)?,
                other_matches,
                symbol,
            }))
        })
    }

    /// Symbols, imports, notes and open findings of one file
    pub fn file_summary(&self, path: &str) -> Result<Option<FileSummary>> {
        let path = path.replace('\\', "/");
        let path = path.strip_prefix("./").unwrap_or(&path);
        self.db.read(|conn| {
            let Some(file) = file_by_path(conn, path)? else {
                debug!("No indexed file at {}", path);
                return Ok(None);
            };

            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM symbols s JOIN files f ON f.file_id = s.file_id
                 WHERE s.file_id = ?1
                 ORDER BY s.start_line, s.symbol_id",
                SYMBOL_COLUMNS
            ))?;
            let symbols = stmt
                .query_map([file.file_id], row_to_symbol)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare_cached(&format!(
                "{} WHERE i.file_id = ?1 ORDER BY i.line, i.import_id",
                IMPORT_SELECT
            ))?;
            let imports = stmt
                .query_map([file.file_id], row_to_import)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM annotations
                 WHERE orphaned = 0
                   AND ((target_type = 'file' AND target_id = ?1)
                     OR (target_type = 'symbol'
                         AND target_id IN (SELECT stable_id FROM symbols WHERE file_id = ?2)))
                 ORDER BY created_at, annotation_id",
                ANNOTATION_COLUMNS
            ))?;
            let annotations = stmt
                .query_map(params![file.path, file.file_id], row_to_annotation)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM diagnostics
                 WHERE path = ?1 AND status = 'open'
                 ORDER BY line, diag_id",
                DIAGNOSTIC_COLUMNS
            ))?;
            let diagnostics = stmt
                .query_map([&file.path], row_to_diagnostic)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(Some(FileSummary {
                file,
                symbols,
                imports,
                annotations,
                diagnostics,
            }))
        })
    }

    /// Every import edge, optionally only those of files whose path contains
    /// `path_filter`
    pub fn imports_graph(&self, path_filter: Option<&str>) -> Result<ImportGraph> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "{} WHERE (?1 IS NULL OR instr(f.path, ?1) > 0)
                 ORDER BY f.path, i.line, i.import_id",
                IMPORT_SELECT
            ))?;
            let edges = stmt
                .query_map([path_filter], row_to_import)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let nodes: BTreeSet<&str> = edges
                .iter()
                .flat_map(|e| std::iter::once(e.path.as_str()).chain(e.resolved_path.as_deref()))
                .collect();
            Ok(ImportGraph {
                nodes: nodes.into_iter().map(str::to_string).collect(),
                edges,
            })
        })
    }

    /// Full-text search over symbol names, qualified names and docstrings
    pub fn search(&self, query: &str, filters: &SearchFilters, default_limit: usize) -> Result<Vec<SearchHit>> {
        let Some(fts_query) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let limit = filters.limit.unwrap_or(default_limit).max(1) as i64;
        let kind = filters.kind.map(|k| k.as_str());
        let prefix = filters.path_prefix.as_deref();

        self.db.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT s.stable_id, s.qualified_name, s.kind, f.path, s.start_line,
                        s.signature, s.docstring,
                        -bm25(symbols_fts, 10.0, 5.0, 1.0) AS score
                 FROM symbols_fts
                 JOIN symbols s ON s.symbol_id = symbols_fts.rowid
                 JOIN files f ON f.file_id = s.file_id
                 WHERE symbols_fts MATCH ?1
                   AND (?2 IS NULL OR s.kind = ?2)
                   AND (?3 IS NULL OR substr(f.path, 1, length(?3)) = ?3)
                 ORDER BY score DESC, s.qualified_name, s.symbol_id
                 LIMIT ?4",
            )?;
            let hits = stmt
                .query_map(params![fts_query, kind, prefix, limit], |row| {
                    Ok(SearchHit {
                        symbol: row_to_symbol_ref(row, 0)?.ok_or(rusqlite::Error::InvalidQuery)?,
                        signature: row.get(5)?,
                        docstring: row.get(6)?,
                        score: row.get(7)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(hits)
        })
    }
}

/// Turn free text into an FTS5 query: every word must prefix-match
fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"*", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

fn callers(conn: &Connection, symbol_id: i64) -> Result<Vec<CallEdge>> {
    let mut stmt = conn.prepare_cached(&format!(
        "{} WHERE c.callee_id = ?1 ORDER BY cf.path, c.line, c.call_id",
        EDGE_SELECT
    ))?;
    let edges = stmt
        .query_map([symbol_id], row_to_edge)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(edges)
}

fn callees(conn: &Connection, symbol_id: i64) -> Result<Vec<CallEdge>> {
    let mut stmt = conn.prepare_cached(&format!(
        "{} WHERE c.caller_id = ?1 ORDER BY c.line, c.call_id",
        EDGE_SELECT
    ))?;
    let edges = stmt
        .query_map([symbol_id], row_to_edge)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(edges)
}

fn refs(conn: &Connection, symbol_id: i64) -> Result<Vec<RefRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT r.kind, r.target, f.path, r.line
         FROM refs r JOIN files f ON f.file_id = r.file_id
         WHERE r.symbol_id = ?1
         ORDER BY r.line, r.ref_id",
    )?;
    let rows = stmt.query_map([symbol_id], |row| {
        let kind: String = row.get(0)?;
        Ok((kind, row.get(1)?, row.get(2)?, row.get::<_, i64>(3)?))
    })?;

    let mut refs = Vec::new();
    for row in rows {
        let (kind, target, path, line): (String, String, String, i64) = row?;
        if let Some(kind) = RefKind::parse(&kind) {
            refs.push(RefRecord {
                kind,
                target,
                path,
                line: line.max(0) as usize,
            });
        }
    }
    Ok(refs)
}

fn symbol_annotations(conn: &Connection, stable_id: &str) -> Result<Vec<Annotation>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM annotations
         WHERE target_type = 'symbol' AND target_id = ?1 AND orphaned = 0
         ORDER BY created_at, annotation_id",
        ANNOTATION_COLUMNS
    ))?;
    let annotations = stmt
        .query_map([stable_id], row_to_annotation)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(annotations)
}

fn open_diagnostics(conn: &Connection, symbol: &SymbolRecord) -> Result<Vec<Diagnostic>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM diagnostics
         WHERE status = 'open'
           AND (symbol_stable_id = ?1 OR (path = ?2 AND line BETWEEN ?3 AND ?4))
         ORDER BY line, diag_id",
        DIAGNOSTIC_COLUMNS
    ))?;
    let diagnostics = stmt
        .query_map(
            params![
                symbol.stable_id,
                symbol.path,
                symbol.start_line as i64,
                symbol.end_line as i64
            ],
            row_to_diagnostic,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::index::{ExtractorRegistry, SourceFile};
    use crate::indexer::{IndexMode, Indexer};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn indexed(files: Vec<SourceFile>) -> (tempfile::TempDir, IndexDatabase, QueryEngine) {
        let dir = tempdir().unwrap();
        let db = IndexDatabase::open(dir.path().join("index.db")).unwrap();
        let config = Config::default();
        Indexer::new(
            db.clone(),
            Arc::new(ExtractorRegistry::default()),
            &config.indexing,
            config.rules.default_weight,
        )
        .run(&files, IndexMode::Incremental)
        .unwrap();
        let engine = QueryEngine::new(db.clone());
        (dir, db, engine)
    }

    fn caller_callee_project() -> Vec<SourceFile> {
        vec![
            SourceFile::new("a.py", "def f():\n    x = g()\n    return helper(x)\n"),
            SourceFile::new("b.py", "def g():\n    \"\"\"Compute the answer.\"\"\"\n    return 42\n"),
        ]
    }

    #[test]
    fn test_context_lists_direct_caller() {
        let (_dir, _db, engine) = indexed(caller_callee_project());

        let context = engine.get_context("g", None).unwrap().unwrap();
        assert_eq!(context.symbol.path, "b.py");
        assert_eq!(context.symbol.docstring.as_deref(), Some("Compute the answer."));
        assert_eq!(context.callers.len(), 1);
        let caller = context.callers[0].caller.as_ref().unwrap();
        assert_eq!(caller.qualified_name, "f");
        assert_eq!(caller.path, "a.py");
        assert_eq!(context.callers[0].line, 2);
    }

    #[test]
    fn test_context_shows_unresolved_callees() {
        let (_dir, _db, engine) = indexed(caller_callee_project());

        let context = engine.get_context("f", Some(SymbolKind::Function)).unwrap().unwrap();
        let callees: Vec<(&str, bool)> = context
            .callees
            .iter()
            .map(|c| (c.callee_expr.as_str(), c.resolved.is_some()))
            .collect();
        assert_eq!(callees, vec![("g", true), ("helper", false)]);
    }

    #[test]
    fn test_context_not_found() {
        let (_dir, _db, engine) = indexed(caller_callee_project());
        assert!(engine.get_context("missing", None).unwrap().is_none());
        assert!(engine.get_context("g", Some(SymbolKind::Class)).unwrap().is_none());
    }

    #[test]
    fn test_qualified_name_beats_short_name() {
        let (_dir, _db, engine) = indexed(vec![
            SourceFile::new("m.py", "class A:\n    def run(self):\n        pass\n\nclass B:\n    def run(self):\n        pass\n"),
        ]);

        let context = engine.get_context("B.run", None).unwrap().unwrap();
        assert_eq!(context.symbol.qualified_name, "B.run");
        assert!(context.other_matches.is_empty());

        let context = engine.get_context("run", None).unwrap().unwrap();
        assert_eq!(context.symbol.qualified_name, "A.run");
        assert_eq!(context.other_matches.len(), 1);

        let context = engine.get_context("m.A.run", None).unwrap().unwrap();
        assert_eq!(context.symbol.qualified_name, "A.run");
    }

    #[test]
    fn test_context_includes_annotations_and_open_diagnostics() {
        let (_dir, db, engine) = indexed(caller_callee_project());
        let stable_id = engine.get_context("g", None).unwrap().unwrap().symbol.stable_id;

        db.write("test", |tx| {
            tx.execute(
                "INSERT INTO annotations (target_type, target_id, text, created_at)
                 VALUES ('symbol', ?1, 'hot path', 'now')",
                [&stable_id],
            )?;
            tx.execute(
                "INSERT INTO rules (rule_id, name, query, weight, created_at)
                 VALUES ('R', 'r', 'SELECT 1', 0.5, 'now')",
                [],
            )?;
            tx.execute(
                "INSERT INTO diagnostics (rule_id, path, line, severity, message, first_seen, last_seen)
                 VALUES ('R', 'b.py', 3, 'warning', 'magic number', 'now', 'now')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let context = engine.get_context("g", None).unwrap().unwrap();
        assert_eq!(context.annotations.len(), 1);
        assert_eq!(context.annotations[0].text, "hot path");
        assert_eq!(context.diagnostics.len(), 1);
        assert_eq!(context.diagnostics[0].message, "magic number");
    }

    #[test]
    fn test_search_ranks_and_filters() {
        let (_dir, _db, engine) = indexed(vec![
            SourceFile::new("io/reader.py", "def parse_header(data):\n    \"\"\"Read the file header.\"\"\"\n    pass\n"),
            SourceFile::new("io/writer.py", "def write_header(out):\n    pass\n"),
            SourceFile::new("app.py", "class HeaderCache:\n    pass\n"),
        ]);

        let hits = engine.search("parse", &SearchFilters::default(), 20).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].symbol.qualified_name, "parse_header");

        // Prefix matching also reaches `HeaderCache`
        let hits = engine.search("header", &SearchFilters::default(), 20).unwrap();
        assert_eq!(hits.len(), 3);

        let filters = SearchFilters {
            path_prefix: Some("io/".to_string()),
            ..Default::default()
        };
        let names: Vec<String> = engine
            .search("head", &filters, 20)
            .unwrap()
            .into_iter()
            .map(|h| h.symbol.qualified_name)
            .collect();
        assert!(names.contains(&"parse_header".to_string()));
        assert!(names.contains(&"write_header".to_string()));
        assert!(!names.contains(&"HeaderCache".to_string()));

        let filters = SearchFilters {
            kind: Some(SymbolKind::Class),
            limit: Some(5),
            ..Default::default()
        };
        let hits = engine.search("header", &filters, 20).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].symbol.qualified_name, "HeaderCache");
    }

    #[test]
    fn test_search_ignores_punctuation_only_queries() {
        let (_dir, _db, engine) = indexed(caller_callee_project());
        assert!(engine.search("  (*) ", &SearchFilters::default(), 20).unwrap().is_empty());
        assert!(engine.search("\"g", &SearchFilters::default(), 20).is_ok());
    }

    fn layered_project() -> Vec<SourceFile> {
        vec![
            SourceFile::new("app/main.py", "import os\nfrom core import store\n\ndef run():\n    return store.load()\n"),
            SourceFile::new("core/store.py", "class Store:\n    def load(self):\n        pass\n\ndef load():\n    return Store()\n"),
        ]
    }

    #[test]
    fn test_file_summary() {
        let (_dir, db, engine) = indexed(layered_project());
        let load = engine.get_context("Store.load", None).unwrap().unwrap().symbol.stable_id;

        db.write("test", |tx| {
            tx.execute(
                "INSERT INTO annotations (target_type, target_id, text, created_at)
                 VALUES ('file', 'core/store.py', 'persistence layer', 'a'),
                        ('symbol', ?1, 'slow', 'b'),
                        ('file', 'app/main.py', 'entry point', 'c')",
                [&load],
            )?;
            tx.execute(
                "INSERT INTO rules (rule_id, name, query, weight, created_at)
                 VALUES ('R', 'r', 'SELECT 1', 0.5, 'now')",
                [],
            )?;
            tx.execute(
                "INSERT INTO diagnostics (rule_id, path, line, severity, message, status, first_seen, last_seen)
                 VALUES ('R', 'core/store.py', 5, 'info', 'open one', 'open', 'now', 'now'),
                        ('R', 'core/store.py', 6, 'info', 'done', 'resolved', 'now', 'now')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let summary = engine.file_summary("./core/store.py").unwrap().unwrap();
        assert_eq!(summary.file.path, "core/store.py");
        let names: Vec<&str> = summary.symbols.iter().map(|s| s.qualified_name.as_str()).collect();
        assert_eq!(names, vec!["Store", "Store.load", "load"]);
        assert!(summary.imports.is_empty());
        let notes: Vec<&str> = summary.annotations.iter().map(|a| a.text.as_str()).collect();
        assert_eq!(notes, vec!["persistence layer", "slow"]);
        assert_eq!(summary.diagnostics.len(), 1);
        assert_eq!(summary.diagnostics[0].message, "open one");

        let summary = engine.file_summary("app/main.py").unwrap().unwrap();
        let imports: Vec<(&str, Option<&str>)> = summary
            .imports
            .iter()
            .map(|i| (i.module.as_str(), i.resolved_path.as_deref()))
            .collect();
        assert_eq!(imports, vec![("os", None), ("core", Some("core/store.py"))]);

        assert!(engine.file_summary("missing.py").unwrap().is_none());
    }

    #[test]
    fn test_imports_graph() {
        let (_dir, _db, engine) = indexed(layered_project());

        let graph = engine.imports_graph(None).unwrap();
        assert_eq!(graph.nodes, vec!["app/main.py".to_string(), "core/store.py".to_string()]);
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.edges[1].names, vec!["store".to_string()]);

        assert!(engine.imports_graph(Some("core/")).unwrap().edges.is_empty());
        assert_eq!(engine.imports_graph(Some("main")).unwrap().edges.len(), 2);
    }

    #[test]
    fn test_fts_query() {
        assert_eq!(fts_query("parse header").as_deref(), Some("\"parse\"* \"header\"*"));
        assert_eq!(fts_query("Parser.parse").as_deref(), Some("\"Parser\"* \"parse\"*"));
        assert_eq!(fts_query("--"), None);
    }
}
