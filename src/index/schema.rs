use rusqlite::{Connection, OptionalExtension, Result};
use tracing::{debug, info, warn};

/// SQLite schema version
pub const SCHEMA_VERSION: i64 = 1;

/// Tables a rule query may read, with their readable columns
pub const RULE_READABLE: &[(&str, &[&str])] = &[
    (
        "files",
        &[
            "file_id", "path", "module", "language", "content_hash", "line_count", "parse_error",
            "last_indexed",
        ],
    ),
    (
        "symbols",
        &[
            "symbol_id", "stable_id", "file_id", "parent_id", "kind", "name", "qualified_name",
            "signature", "docstring", "start_line", "end_line", "complexity",
        ],
    ),
    (
        "calls",
        &["call_id", "file_id", "caller_id", "callee_expr", "callee_id", "line"],
    ),
    (
        "refs",
        &["ref_id", "file_id", "symbol_id", "kind", "target", "line"],
    ),
    (
        "imports",
        &["import_id", "file_id", "module", "names", "line", "resolved_file_id"],
    ),
    (
        "diagnostics",
        &[
            "diag_id", "rule_id", "path", "symbol_stable_id", "line", "severity", "message",
            "status", "first_seen", "last_seen",
        ],
    ),
    (
        "annotations",
        &[
            "annotation_id", "target_type", "target_id", "text", "author", "created_at", "orphaned",
        ],
    ),
];

/// Outcome of inspecting an existing database file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaState {
    /// Schema is at `SCHEMA_VERSION`
    Current,
    /// Stored layout cannot be migrated; only a destructive rebuild helps
    Incompatible { found: i64 },
}

/// Apply connection pragmas shared by the writer and the read pool
pub fn configure_connection(conn: &Connection) -> Result<()> {
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        ",
    )?;
    Ok(())
}

/// Initialize the database schema, migrating older layouts forward
pub fn init_schema(conn: &Connection) -> Result<SchemaState> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    debug!("Current schema version: {}", current_version);

    if current_version > SCHEMA_VERSION {
        warn!(
            "Index schema v{} is newer than supported v{}",
            current_version, SCHEMA_VERSION
        );
        return Ok(SchemaState::Incompatible {
            found: current_version,
        });
    }

    if current_version == 0 && has_foreign_tables(conn)? {
        warn!("Database contains tables from an unknown layout");
        return Ok(SchemaState::Incompatible { found: 0 });
    }

    if current_version < SCHEMA_VERSION {
        info!(
            "Upgrading schema from v{} to v{}",
            current_version, SCHEMA_VERSION
        );
        apply_migrations(conn, current_version)?;
    }

    Ok(SchemaState::Current)
}

fn has_foreign_tables(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master
         WHERE type = 'table' AND name NOT IN ('schema_version') AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Apply migrations from current version to latest
fn apply_migrations(conn: &Connection, from_version: i64) -> Result<()> {
    for version in (from_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration v{}", version);
        let tx = conn.unchecked_transaction()?;
        match version {
            1 => create_v1_schema(&tx)?,
            _ => unreachable!("Unknown schema version: {}", version),
        }

        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
        tx.commit()?;
    }

    Ok(())
}

/// Create v1 schema (initial schema)
fn create_v1_schema(conn: &Connection) -> Result<()> {
    info!("Creating v1 schema tables");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS files (
            file_id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL UNIQUE,
            module TEXT NOT NULL,
            language TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            line_count INTEGER NOT NULL DEFAULT 0,
            parse_error TEXT,
            last_indexed TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_files_module ON files(module);

        CREATE TABLE IF NOT EXISTS symbols (
            symbol_id INTEGER PRIMARY KEY AUTOINCREMENT,
            stable_id TEXT NOT NULL UNIQUE,
            file_id INTEGER NOT NULL REFERENCES files(file_id) ON DELETE CASCADE,
            parent_id INTEGER REFERENCES symbols(symbol_id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            qualified_name TEXT NOT NULL,
            signature TEXT,
            docstring TEXT,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            complexity INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(name);
        CREATE INDEX IF NOT EXISTS idx_symbols_qualified_name ON symbols(qualified_name);
        CREATE INDEX IF NOT EXISTS idx_symbols_file ON symbols(file_id);
        CREATE INDEX IF NOT EXISTS idx_symbols_parent ON symbols(parent_id);

        CREATE TABLE IF NOT EXISTS calls (
            call_id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL REFERENCES files(file_id) ON DELETE CASCADE,
            caller_id INTEGER REFERENCES symbols(symbol_id) ON DELETE CASCADE,
            callee_expr TEXT NOT NULL,
            callee_id INTEGER REFERENCES symbols(symbol_id) ON DELETE SET NULL,
            line INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_calls_file ON calls(file_id);
        CREATE INDEX IF NOT EXISTS idx_calls_caller ON calls(caller_id);
        CREATE INDEX IF NOT EXISTS idx_calls_callee ON calls(callee_id);

        CREATE TABLE IF NOT EXISTS refs (
            ref_id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL REFERENCES files(file_id) ON DELETE CASCADE,
            symbol_id INTEGER REFERENCES symbols(symbol_id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            target TEXT NOT NULL,
            line INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_refs_file ON refs(file_id);
        CREATE INDEX IF NOT EXISTS idx_refs_symbol ON refs(symbol_id);
        CREATE INDEX IF NOT EXISTS idx_refs_target ON refs(target);

        CREATE TABLE IF NOT EXISTS imports (
            import_id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL REFERENCES files(file_id) ON DELETE CASCADE,
            module TEXT NOT NULL,
            names TEXT NOT NULL DEFAULT '[]',
            line INTEGER NOT NULL,
            resolved_file_id INTEGER REFERENCES files(file_id) ON DELETE SET NULL
        );
        CREATE INDEX IF NOT EXISTS idx_imports_file ON imports(file_id);
        CREATE INDEX IF NOT EXISTS idx_imports_module ON imports(module);
        CREATE INDEX IF NOT EXISTS idx_imports_resolved ON imports(resolved_file_id);

        CREATE TABLE IF NOT EXISTS rules (
            rule_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            severity TEXT NOT NULL DEFAULT 'warning',
            query TEXT NOT NULL,
            weight REAL NOT NULL,
            learned_from TEXT,
            builtin INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rule_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            rule_id TEXT NOT NULL REFERENCES rules(rule_id) ON DELETE CASCADE,
            ran_at TEXT NOT NULL,
            status TEXT NOT NULL,
            row_count INTEGER NOT NULL DEFAULT 0,
            new_count INTEGER NOT NULL DEFAULT 0,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            useful_count INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_rule_runs_rule ON rule_runs(rule_id);

        CREATE TABLE IF NOT EXISTS diagnostics (
            diag_id INTEGER PRIMARY KEY AUTOINCREMENT,
            rule_id TEXT NOT NULL REFERENCES rules(rule_id) ON DELETE CASCADE,
            path TEXT NOT NULL,
            symbol_stable_id TEXT,
            line INTEGER NOT NULL,
            severity TEXT NOT NULL,
            message TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            resolved_at TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_diagnostics_open_fingerprint
            ON diagnostics(rule_id, path, line) WHERE status = 'open';
        CREATE INDEX IF NOT EXISTS idx_diagnostics_path ON diagnostics(path);
        CREATE INDEX IF NOT EXISTS idx_diagnostics_symbol ON diagnostics(symbol_stable_id);

        CREATE TABLE IF NOT EXISTS sessions (
            session_id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            summary TEXT,
            transcript_path TEXT
        );

        CREATE TABLE IF NOT EXISTS change_log (
            change_id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
            path TEXT NOT NULL,
            change_kind TEXT NOT NULL,
            old_hash TEXT,
            new_hash TEXT,
            changed_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_change_log_session ON change_log(session_id);

        CREATE TABLE IF NOT EXISTS annotations (
            annotation_id INTEGER PRIMARY KEY AUTOINCREMENT,
            target_type TEXT NOT NULL,
            target_id TEXT NOT NULL,
            text TEXT NOT NULL,
            author TEXT NOT NULL DEFAULT 'user',
            created_at TEXT NOT NULL,
            orphaned INTEGER NOT NULL DEFAULT 0,
            orphaned_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_annotations_target ON annotations(target_type, target_id);

        CREATE TABLE IF NOT EXISTS knowledge (
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        ",
    )?;

    // Full-text search over symbol names and docstrings
    conn.execute(
        "CREATE VIRTUAL TABLE IF NOT EXISTS symbols_fts USING fts5(
            name,
            qualified_name,
            docstring,
            content='symbols',
            content_rowid='symbol_id'
        )",
        [],
    )?;

    // Triggers to keep FTS table in sync
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS symbols_fts_insert AFTER INSERT ON symbols
         BEGIN
             INSERT INTO symbols_fts(rowid, name, qualified_name, docstring)
             VALUES (new.symbol_id, new.name, new.qualified_name, new.docstring);
         END",
        [],
    )?;

    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS symbols_fts_delete AFTER DELETE ON symbols
         BEGIN
             INSERT INTO symbols_fts(symbols_fts, rowid, name, qualified_name, docstring)
             VALUES ('delete', old.symbol_id, old.name, old.qualified_name, old.docstring);
         END",
        [],
    )?;

    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS symbols_fts_update AFTER UPDATE ON symbols
         BEGIN
             INSERT INTO symbols_fts(symbols_fts, rowid, name, qualified_name, docstring)
             VALUES ('delete', old.symbol_id, old.name, old.qualified_name, old.docstring);
             INSERT INTO symbols_fts(rowid, name, qualified_name, docstring)
             VALUES (new.symbol_id, new.name, new.qualified_name, new.docstring);
         END",
        [],
    )?;

    info!("v1 schema created successfully");

    Ok(())
}

/// Drop every object in the database (destructive rebuild)
pub fn drop_schema(conn: &Connection) -> Result<()> {
    info!("Dropping all schema objects");

    let objects: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT type, name FROM sqlite_master
             WHERE type IN ('table', 'trigger', 'view') AND name NOT LIKE 'sqlite_%'",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<Vec<_>>>()?
    };

    conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
    for (kind, name) in objects.iter().filter(|(kind, _)| kind != "table") {
        conn.execute_batch(&format!("DROP {} IF EXISTS \"{}\";", kind.to_uppercase(), name))?;
    }
    for (_, name) in objects.iter().filter(|(kind, _)| kind == "table") {
        // Shadow tables of an FTS table disappear with it
        let still_there: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        if still_there.is_some() {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\";", name))?;
        }
    }
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_init_schema() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(init_schema(&conn).unwrap(), SchemaState::Current);

        let tables = table_names(&conn);
        for expected in [
            "files", "symbols", "calls", "refs", "imports", "rules", "rule_runs", "diagnostics",
            "sessions", "change_log", "annotations", "knowledge", "symbols_fts",
            "schema_version",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[test]
    fn test_schema_version() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_idempotent_init() {
        let conn = Connection::open_in_memory().unwrap();

        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_newer_schema_is_incompatible() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [SCHEMA_VERSION + 1],
        )
        .unwrap();

        assert_eq!(
            init_schema(&conn).unwrap(),
            SchemaState::Incompatible {
                found: SCHEMA_VERSION + 1
            }
        );
    }

    #[test]
    fn test_unknown_layout_is_incompatible() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE symbols (id TEXT PRIMARY KEY);")
            .unwrap();
        assert_eq!(
            init_schema(&conn).unwrap(),
            SchemaState::Incompatible { found: 0 }
        );
    }

    #[test]
    fn test_drop_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        drop_schema(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);

        assert_eq!(init_schema(&conn).unwrap(), SchemaState::Current);
    }

    #[test]
    fn test_fts_follows_symbol_deletes() {
        let conn = Connection::open_in_memory().unwrap();
        configure_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO files (path, module, language, content_hash, last_indexed)
                 VALUES ('a.py', 'a', 'python', 'h', 'now');
             INSERT INTO symbols (stable_id, file_id, kind, name, qualified_name, docstring, start_line, end_line)
                 VALUES ('s1', 1, 'function', 'parse_header', 'parse_header', 'Reads the header', 1, 3);",
        )
        .unwrap();

        let hits = |conn: &Connection| -> i64 {
            conn.query_row(
                "SELECT COUNT(*) FROM symbols_fts WHERE symbols_fts MATCH 'header'",
                [],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert_eq!(hits(&conn), 1);

        conn.execute("DELETE FROM files WHERE path = 'a.py'", []).unwrap();
        assert_eq!(hits(&conn), 0);
    }
}
