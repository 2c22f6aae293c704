// Error taxonomy for the index core

use thiserror::Error;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by core operations.
///
/// Per-file and per-rule failures are captured as data (file `parse_error`,
/// rule run status); a rule failure only appears here when a caller tests
/// that query directly.
#[derive(Debug, Error)]
pub enum Error {
    #[error("rule query rejected: {0}")]
    Query(#[from] QueryError),

    #[error(
        "index was built with schema v{found_schema} / extractor '{found_extractor}', \
         this build expects v{expected_schema} / '{expected_extractor}'; run a full rebuild"
    )]
    SchemaVersion {
        found_schema: i64,
        expected_schema: i64,
        found_extractor: String,
        expected_extractor: String,
    },

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("write to {target} kept conflicting after {attempts} attempts")]
    ConcurrentWrite { target: String, attempts: u32 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Pool(#[from] r2d2::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// True when the underlying SQLite error is a lock/busy condition
    pub fn is_busy(&self) -> bool {
        match self {
            Error::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// A per-file failure reported by an extraction adapter
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExtractionError {
    pub message: String,
    pub line: Option<usize>,
}

impl ExtractionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }

    pub fn at_line(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line: Some(line),
        }
    }
}

/// Why a rule query was refused or failed inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("query is empty")]
    Empty,

    #[error("only a single statement is allowed")]
    MultipleStatements,

    #[error("query must be a read-only SELECT (found '{0}')")]
    NotReadOnly(String),

    #[error("table '{0}' is not readable by rules")]
    TableNotAllowed(String),

    #[error("column '{table}.{column}' is not readable by rules")]
    ColumnNotAllowed { table: String, column: String },

    #[error("function '{0}' is not allowed in rules")]
    FunctionNotAllowed(String),

    #[error("operation not allowed in rules: {0}")]
    OperationNotAllowed(String),

    #[error("result is missing required column(s): {0}")]
    MissingColumns(String),

    #[error("query produced more than {0} rows")]
    RowBudgetExceeded(usize),

    #[error("query exceeded the {0} ms time budget")]
    Timeout(u64),

    #[error("sqlite: {0}")]
    Sqlite(String),
}

impl QueryError {
    /// Timeouts are recorded with their own run status
    pub fn is_timeout(&self) -> bool {
        matches!(self, QueryError::Timeout(_))
    }
}
