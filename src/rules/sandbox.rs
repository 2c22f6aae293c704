// Capability-limited execution of rule queries

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags, Statement};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::QueryError;
use crate::index::schema::RULE_READABLE;

/// String literals and comments, masked before keyword screening
static LITERALS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)'(?:[^']|'')*'|--[^\n]*|/\*.*?\*/").expect("valid regex"));

static LEADING_KEYWORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Za-z]+)").expect("valid regex"));

static MUTATING_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(INSERT|UPDATE|DELETE|DROP|CREATE|ALTER|ATTACH|DETACH|PRAGMA|VACUUM|REINDEX|SAVEPOINT|RELEASE)\b",
    )
    .expect("valid regex")
});

const DENIED_FUNCTIONS: &[&str] = &["load_extension", "fts3_tokenizer", "readfile", "writefile", "edit"];

const PATH_COLUMNS: &[&str] = &["path", "file", "file_path"];
const LINE_COLUMNS: &[&str] = &["line", "line_no", "start_line"];
const NAME_COLUMNS: &[&str] = &["qualified_name", "name"];

/// Progress callback granularity in VM instructions
const PROGRESS_OPS: i32 = 1000;

/// One finding produced by a rule query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRow {
    pub path: String,
    pub line: usize,
    pub message: Option<String>,
    pub stable_id: Option<String>,
    pub name: Option<String>,
}

/// Positions of the meaningful columns in a rule's result
#[derive(Debug, Clone, Copy)]
struct RowShape {
    path: usize,
    line: usize,
    message: Option<usize>,
    stable_id: Option<usize>,
    name: Option<usize>,
}

impl RowShape {
    fn from_columns(columns: &[String]) -> Result<Self, QueryError> {
        let find = |candidates: &[&str]| {
            candidates
                .iter()
                .find_map(|c| columns.iter().position(|col| col.eq_ignore_ascii_case(c)))
        };

        let path = find(PATH_COLUMNS);
        let line = find(LINE_COLUMNS);
        let mut missing = Vec::new();
        if path.is_none() {
            missing.push(PATH_COLUMNS.join("|"));
        }
        if line.is_none() {
            missing.push(LINE_COLUMNS.join("|"));
        }
        match (path, line) {
            (Some(path), Some(line)) => Ok(Self {
                path,
                line,
                message: find(&["message"]),
                stable_id: find(&["stable_id"]),
                name: find(NAME_COLUMNS),
            }),
            _ => Err(QueryError::MissingColumns(missing.join(", "))),
        }
    }
}

/// Rows returned by one execution, plus the result column names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<RuleRow>,
}

/// Lexical screening: one SELECT statement, nothing that writes.
///
/// Returns the statement text without trailing semicolons.
pub fn screen(query: &str) -> Result<&str, QueryError> {
    let statement = query.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if statement.is_empty() {
        return Err(QueryError::Empty);
    }

    let masked = LITERALS.replace_all(statement, |caps: &regex::Captures| {
        if caps[0].starts_with('\'') {
            "''".to_string()
        } else {
            " ".to_string()
        }
    });
    if masked.trim().is_empty() {
        return Err(QueryError::Empty);
    }
    if masked.contains(';') {
        return Err(QueryError::MultipleStatements);
    }

    let leading = LEADING_KEYWORD
        .captures(&masked)
        .map(|c| c[1].to_ascii_uppercase())
        .unwrap_or_default();
    if leading != "SELECT" && leading != "WITH" {
        return Err(QueryError::NotReadOnly(leading));
    }
    if let Some(keyword) = MUTATING_KEYWORD.find(&masked) {
        return Err(QueryError::NotReadOnly(keyword.as_str().to_ascii_uppercase()));
    }

    Ok(statement)
}

fn column_allowed(table: &str, column: &str) -> Result<(), QueryError> {
    let Some((_, columns)) = RULE_READABLE
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(table))
    else {
        return Err(QueryError::TableNotAllowed(table.to_string()));
    };
    if column.is_empty()
        || column.eq_ignore_ascii_case("rowid")
        || columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    {
        Ok(())
    } else {
        Err(QueryError::ColumnNotAllowed {
            table: table.to_string(),
            column: column.to_string(),
        })
    }
}

fn authorize(action: AuthAction<'_>) -> Result<(), QueryError> {
    match action {
        AuthAction::Select | AuthAction::Recursive => Ok(()),
        AuthAction::Read {
            table_name,
            column_name,
        } => column_allowed(table_name, column_name),
        AuthAction::Function { function_name } => {
            if DENIED_FUNCTIONS
                .iter()
                .any(|f| f.eq_ignore_ascii_case(function_name))
            {
                Err(QueryError::FunctionNotAllowed(function_name.to_string()))
            } else {
                Ok(())
            }
        }
        other => Err(QueryError::OperationNotAllowed(format!("{:?}", other))),
    }
}

/// Read-only connection that only runs screened rule queries
pub struct Sandbox {
    conn: Connection,
    timeout: Duration,
    max_rows: usize,
    violation: Arc<Mutex<Option<QueryError>>>,
}

impl Sandbox {
    pub fn open(db_path: &Path, timeout_ms: u64, max_rows: usize) -> crate::error::Result<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA query_only = ON;")?;

        // std Mutex: the authorizer callback must be unwind safe
        let violation: Arc<Mutex<Option<QueryError>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&violation);
        conn.authorizer(Some(move |ctx: AuthContext<'_>| match authorize(ctx.action) {
            Ok(()) => Authorization::Allow,
            Err(e) => {
                let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.is_none() {
                    *slot = Some(e);
                }
                Authorization::Deny
            }
        }));

        Ok(Self {
            conn,
            timeout: Duration::from_millis(timeout_ms),
            max_rows,
            violation,
        })
    }

    /// Check that `query` is acceptable without running it
    pub fn validate(&self, query: &str) -> Result<Vec<String>, QueryError> {
        let stmt = self.prepare(query)?;
        let columns = column_names(&stmt);
        RowShape::from_columns(&columns)?;
        Ok(columns)
    }

    /// Run `query` under the time and row budgets
    pub fn execute(&self, query: &str) -> Result<QueryOutput, QueryError> {
        let deadline = Instant::now() + self.timeout;
        self.conn
            .progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= deadline));
        let result = self.collect(query);
        self.conn.progress_handler(PROGRESS_OPS, None::<fn() -> bool>);
        result
    }

    fn collect(&self, query: &str) -> Result<QueryOutput, QueryError> {
        let mut stmt = self.prepare(query)?;
        let columns = column_names(&stmt);
        let shape = RowShape::from_columns(&columns)?;

        let mut rows = stmt.query([]).map_err(|e| self.map_error(e))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| self.map_error(e))? {
            if out.len() >= self.max_rows {
                return Err(QueryError::RowBudgetExceeded(self.max_rows));
            }
            let Some(path) = text_at(row, shape.path) else {
                debug!("Skipping rule row without a path");
                continue;
            };
            out.push(RuleRow {
                path,
                line: line_at(row, shape.line),
                message: shape.message.and_then(|i| text_at(row, i)),
                stable_id: shape.stable_id.and_then(|i| text_at(row, i)),
                name: shape.name.and_then(|i| text_at(row, i)),
            });
        }

        Ok(QueryOutput { columns, rows: out })
    }

    fn prepare(&self, query: &str) -> Result<Statement<'_>, QueryError> {
        let statement = screen(query)?;
        *self.violation.lock().unwrap_or_else(PoisonError::into_inner) = None;
        let stmt = self
            .conn
            .prepare(statement)
            .map_err(|e| self.map_error(e))?;
        if !stmt.readonly() {
            return Err(QueryError::NotReadOnly("statement writes".to_string()));
        }
        Ok(stmt)
    }

    fn map_error(&self, err: rusqlite::Error) -> QueryError {
        if let Some(violation) = self
            .violation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return violation;
        }
        match err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::OperationInterrupted => {
                QueryError::Timeout(self.timeout.as_millis() as u64)
            }
            rusqlite::Error::MultipleStatement => QueryError::MultipleStatements,
            other => QueryError::Sqlite(other.to_string()),
        }
    }
}

fn column_names(stmt: &Statement<'_>) -> Vec<String> {
    stmt.column_names().into_iter().map(str::to_string).collect()
}

fn text_at(row: &rusqlite::Row<'_>, idx: usize) -> Option<String> {
    match row.get_ref(idx).ok()? {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(r) => Some(r.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    }
}

fn line_at(row: &rusqlite::Row<'_>, idx: usize) -> usize {
    match row.get_ref(idx) {
        Ok(ValueRef::Integer(i)) => i.max(0) as usize,
        Ok(ValueRef::Real(r)) if r > 0.0 => r as usize,
        Ok(ValueRef::Text(t)) => std::str::from_utf8(t)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0),
        _ => 0,
    }
}
