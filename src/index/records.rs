use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use super::{RefKind, SymbolKind};

/// Indexed file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: i64,
    pub path: String,
    pub module: String,
    pub language: String,
    pub content_hash: String,
    pub line_count: usize,
    pub parse_error: Option<String>,
    pub last_indexed: String,
}

pub const FILE_COLUMNS: &str =
    "file_id, path, module, language, content_hash, line_count, parse_error, last_indexed";

/// Symbol stored in the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRecord {
    #[serde(skip)]
    pub symbol_id: i64,
    pub stable_id: String,
    #[serde(skip)]
    pub file_id: i64,
    pub path: String,
    #[serde(skip)]
    pub parent_id: Option<i64>,
    pub kind: SymbolKind,
    pub name: String,
    pub qualified_name: String,
    pub signature: Option<String>,
    pub docstring: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub complexity: u32,
}

/// Select list matching `row_to_symbol`; expects `symbols s JOIN files f`
pub const SYMBOL_COLUMNS: &str = "s.symbol_id, s.stable_id, s.file_id, f.path, s.parent_id, s.kind, \
     s.name, s.qualified_name, s.signature, s.docstring, s.start_line, s.end_line, s.complexity";

/// Short reference to a symbol, used in edges and impact results
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolRef {
    pub stable_id: String,
    pub qualified_name: String,
    pub kind: SymbolKind,
    pub path: String,
    pub line: usize,
}

impl From<&SymbolRecord> for SymbolRef {
    fn from(symbol: &SymbolRecord) -> Self {
        Self {
            stable_id: symbol.stable_id.clone(),
            qualified_name: symbol.qualified_name.clone(),
            kind: symbol.kind,
            path: symbol.path.clone(),
            line: symbol.start_line,
        }
    }
}

/// One call site as seen from either end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEdge {
    pub callee_expr: String,
    pub path: String,
    pub line: usize,
    /// Calling symbol; `None` for module-level calls
    pub caller: Option<SymbolRef>,
    /// Resolved target; `None` when the expression matched nothing or too much
    pub resolved: Option<SymbolRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefRecord {
    pub kind: RefKind,
    pub target: String,
    pub path: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRecord {
    pub import_id: i64,
    pub path: String,
    pub module: String,
    pub names: Vec<String>,
    pub line: usize,
    pub resolved_path: Option<String>,
}

pub const IMPORT_SELECT: &str = "SELECT i.import_id, f.path, i.module, i.names, i.line, t.path
     FROM imports i
     JOIN files f ON f.file_id = i.file_id
     LEFT JOIN files t ON t.file_id = i.resolved_file_id";

/// Finding severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "error" => Some(Severity::Error),
            "warning" | "warn" => Some(Severity::Warning),
            "info" => Some(Severity::Info),
            _ => None,
        }
    }
}

/// Stored diagnostics rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub name: String,
    pub description: String,
    pub severity: Severity,
    pub query: String,
    pub weight: f64,
    pub learned_from: Option<String>,
    pub builtin: bool,
    pub enabled: bool,
    pub created_at: String,
}

pub const RULE_COLUMNS: &str =
    "rule_id, name, description, severity, query, weight, learned_from, builtin, enabled, created_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
    Timeout,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
            RunStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(RunStatus::Ok),
            "error" => Some(RunStatus::Error),
            "timeout" => Some(RunStatus::Timeout),
            _ => None,
        }
    }
}

/// One execution of one rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRun {
    pub run_id: i64,
    pub rule_id: String,
    pub ran_at: String,
    pub status: RunStatus,
    pub row_count: usize,
    pub new_count: usize,
    pub duration_ms: u64,
    pub error: Option<String>,
}

pub const RULE_RUN_COLUMNS: &str =
    "run_id, rule_id, ran_at, status, row_count, new_count, duration_ms, error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticStatus {
    Open,
    Resolved,
    Ignored,
}

impl DiagnosticStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticStatus::Open => "open",
            DiagnosticStatus::Resolved => "resolved",
            DiagnosticStatus::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(DiagnosticStatus::Open),
            "resolved" => Some(DiagnosticStatus::Resolved),
            "ignored" => Some(DiagnosticStatus::Ignored),
            _ => None,
        }
    }
}

/// A materialized rule finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub diag_id: i64,
    pub rule_id: String,
    pub path: String,
    pub symbol_stable_id: Option<String>,
    pub line: usize,
    pub severity: Severity,
    pub message: String,
    pub status: DiagnosticStatus,
    pub first_seen: String,
    pub last_seen: String,
    pub resolved_at: Option<String>,
}

pub const DIAGNOSTIC_COLUMNS: &str = "diag_id, rule_id, path, symbol_stable_id, line, severity, \
     message, status, first_seen, last_seen, resolved_at";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: i64,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub summary: Option<String>,
    pub transcript_path: Option<String>,
    pub change_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Removed => "removed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "added" => Some(ChangeKind::Added),
            "modified" => Some(ChangeKind::Modified),
            "removed" => Some(ChangeKind::Removed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub change_id: i64,
    pub session_id: i64,
    pub path: String,
    pub change_kind: ChangeKind,
    pub old_hash: Option<String>,
    pub new_hash: Option<String>,
    pub changed_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Symbol,
    File,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Symbol => "symbol",
            TargetType::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "symbol" => Some(TargetType::Symbol),
            "file" => Some(TargetType::File),
            _ => None,
        }
    }
}

/// A note attached to a symbol stable id or a file path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub annotation_id: i64,
    pub target_type: TargetType,
    pub target_id: String,
    pub text: String,
    pub author: String,
    pub created_at: String,
    pub orphaned: bool,
    pub orphaned_at: Option<String>,
}

pub const ANNOTATION_COLUMNS: &str =
    "annotation_id, target_type, target_id, text, author, created_at, orphaned, orphaned_at";

/// Index statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub files: usize,
    pub errored_files: usize,
    pub symbols: usize,
    pub calls: usize,
    pub resolved_calls: usize,
    pub refs: usize,
    pub imports: usize,
    pub resolved_imports: usize,
    pub rules: usize,
    pub open_diagnostics: usize,
    pub annotations: usize,
    pub orphaned_annotations: usize,
}

fn bad_value(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unknown {}: {}", what, value).into(),
    )
}

fn text_enum<T>(row: &Row, idx: usize, what: &str, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let value: String = row.get(idx)?;
    parse(&value).ok_or_else(|| bad_value(idx, what, &value))
}

fn get_usize(row: &Row, idx: usize) -> rusqlite::Result<usize> {
    Ok(row.get::<_, i64>(idx)?.max(0) as usize)
}

/// Convert database row to FileRecord (`FILE_COLUMNS`)
pub fn row_to_file(row: &Row) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        file_id: row.get(0)?,
        path: row.get(1)?,
        module: row.get(2)?,
        language: row.get(3)?,
        content_hash: row.get(4)?,
        line_count: get_usize(row, 5)?,
        parse_error: row.get(6)?,
        last_indexed: row.get(7)?,
    })
}

/// Convert database row to ImportRecord (`IMPORT_SELECT`)
pub fn row_to_import(row: &Row) -> rusqlite::Result<ImportRecord> {
    let names: String = row.get(3)?;
    let names = serde_json::from_str(&names)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(ImportRecord {
        import_id: row.get(0)?,
        path: row.get(1)?,
        module: row.get(2)?,
        names,
        line: get_usize(row, 4)?,
        resolved_path: row.get(5)?,
    })
}

/// Convert database row to SymbolRecord (`SYMBOL_COLUMNS`)
pub fn row_to_symbol(row: &Row) -> rusqlite::Result<SymbolRecord> {
    Ok(SymbolRecord {
        symbol_id: row.get(0)?,
        stable_id: row.get(1)?,
        file_id: row.get(2)?,
        path: row.get(3)?,
        parent_id: row.get(4)?,
        kind: text_enum(row, 5, "symbol kind", SymbolKind::parse)?,
        name: row.get(6)?,
        qualified_name: row.get(7)?,
        signature: row.get(8)?,
        docstring: row.get(9)?,
        start_line: get_usize(row, 10)?,
        end_line: get_usize(row, 11)?,
        complexity: row.get::<_, i64>(12)?.max(0) as u32,
    })
}

/// Read a `SymbolRef` from five consecutive columns starting at `base`:
/// stable_id, qualified_name, kind, path, start_line. All NULL yields `None`.
pub fn row_to_symbol_ref(row: &Row, base: usize) -> rusqlite::Result<Option<SymbolRef>> {
    let stable_id: Option<String> = row.get(base)?;
    let Some(stable_id) = stable_id else {
        return Ok(None);
    };
    Ok(Some(SymbolRef {
        stable_id,
        qualified_name: row.get(base + 1)?,
        kind: text_enum(row, base + 2, "symbol kind", SymbolKind::parse)?,
        path: row.get(base + 3)?,
        line: get_usize(row, base + 4)?,
    }))
}

pub fn row_to_rule(row: &Row) -> rusqlite::Result<Rule> {
    Ok(Rule {
        rule_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        severity: text_enum(row, 3, "severity", Severity::parse)?,
        query: row.get(4)?,
        weight: row.get(5)?,
        learned_from: row.get(6)?,
        builtin: row.get(7)?,
        enabled: row.get(8)?,
        created_at: row.get(9)?,
    })
}

pub fn row_to_rule_run(row: &Row) -> rusqlite::Result<RuleRun> {
    Ok(RuleRun {
        run_id: row.get(0)?,
        rule_id: row.get(1)?,
        ran_at: row.get(2)?,
        status: text_enum(row, 3, "run status", RunStatus::parse)?,
        row_count: get_usize(row, 4)?,
        new_count: get_usize(row, 5)?,
        duration_ms: row.get::<_, i64>(6)?.max(0) as u64,
        error: row.get(7)?,
    })
}

pub fn row_to_diagnostic(row: &Row) -> rusqlite::Result<Diagnostic> {
    Ok(Diagnostic {
        diag_id: row.get(0)?,
        rule_id: row.get(1)?,
        path: row.get(2)?,
        symbol_stable_id: row.get(3)?,
        line: get_usize(row, 4)?,
        severity: text_enum(row, 5, "severity", Severity::parse)?,
        message: row.get(6)?,
        status: text_enum(row, 7, "diagnostic status", DiagnosticStatus::parse)?,
        first_seen: row.get(8)?,
        last_seen: row.get(9)?,
        resolved_at: row.get(10)?,
    })
}

/// Session row: id, started_at, ended_at, summary, transcript_path, change_count
pub fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: row.get(0)?,
        started_at: row.get(1)?,
        ended_at: row.get(2)?,
        summary: row.get(3)?,
        transcript_path: row.get(4)?,
        change_count: get_usize(row, 5)?,
    })
}

pub fn row_to_change(row: &Row) -> rusqlite::Result<ChangeLogEntry> {
    Ok(ChangeLogEntry {
        change_id: row.get(0)?,
        session_id: row.get(1)?,
        path: row.get(2)?,
        change_kind: text_enum(row, 3, "change kind", ChangeKind::parse)?,
        old_hash: row.get(4)?,
        new_hash: row.get(5)?,
        changed_at: row.get(6)?,
    })
}

pub fn row_to_annotation(row: &Row) -> rusqlite::Result<Annotation> {
    Ok(Annotation {
        annotation_id: row.get(0)?,
        target_type: text_enum(row, 1, "annotation target", TargetType::parse)?,
        target_id: row.get(2)?,
        text: row.get(3)?,
        author: row.get(4)?,
        created_at: row.get(5)?,
        orphaned: row.get(6)?,
        orphaned_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_strings() {
        assert_eq!(Severity::parse("warn"), Some(Severity::Warning));
        assert_eq!(Severity::Error.as_str(), "error");
        assert_eq!(RunStatus::parse("timeout"), Some(RunStatus::Timeout));
        assert_eq!(DiagnosticStatus::parse("ignored"), Some(DiagnosticStatus::Ignored));
        assert_eq!(ChangeKind::Removed.as_str(), "removed");
        assert_eq!(TargetType::parse("file"), Some(TargetType::File));
        assert!(TargetType::parse("module").is_none());
    }

    #[test]
    fn test_symbol_refs_order_and_dedup() {
        let symbol = |id: &str, kind| SymbolRef {
            stable_id: id.to_string(),
            qualified_name: "g".to_string(),
            kind,
            path: "b.py".to_string(),
            line: 1,
        };
        let refs: std::collections::BTreeSet<SymbolRef> = [
            symbol("b", SymbolKind::Function),
            symbol("a", SymbolKind::Class),
            symbol("a", SymbolKind::Function),
            symbol("b", SymbolKind::Function),
        ]
        .into_iter()
        .collect();

        let order: Vec<(&str, SymbolKind)> = refs.iter().map(|r| (r.stable_id.as_str(), r.kind)).collect();
        assert_eq!(
            order,
            vec![
                ("a", SymbolKind::Function),
                ("a", SymbolKind::Class),
                ("b", SymbolKind::Function),
            ]
        );
    }

    #[test]
    fn test_bad_enum_value_is_conversion_error() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let result = conn.query_row("SELECT 'sideways'", [], |row| {
            text_enum(row, 0, "severity", Severity::parse)
        });
        assert!(matches!(
            result,
            Err(rusqlite::Error::FromSqlConversionFailure(0, Type::Text, _))
        ));
    }
}
