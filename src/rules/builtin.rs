// Rules every index starts with

use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::Result;
use crate::index::db::now;
use crate::index::records::Severity;

pub const BUILTIN_PROVENANCE: &str = "builtin";

pub struct BuiltinRule {
    pub rule_id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub severity: Severity,
    pub query: &'static str,
}

pub const BUILTIN_RULES: &[BuiltinRule] = &[
    BuiltinRule {
        rule_id: "DEAD_SYMBOL",
        name: "Dead symbol",
        description: "Public function or method that nothing calls, imports or names",
        severity: Severity::Info,
        query: "SELECT f.path AS path, s.start_line AS line, s.stable_id AS stable_id,
                       s.qualified_name AS name,
                       'No callers found for ' || s.kind || ' ' || s.qualified_name AS message
                FROM symbols s
                JOIN files f ON f.file_id = s.file_id
                WHERE s.kind IN ('function', 'method')
                  AND substr(s.name, 1, 1) <> '_'
                  AND substr(s.name, 1, 4) <> 'test'
                  AND NOT EXISTS (SELECT 1 FROM calls c WHERE c.callee_id = s.symbol_id)
                  AND NOT EXISTS (
                      SELECT 1 FROM calls c
                      WHERE c.callee_id IS NULL
                        AND (c.callee_expr = s.name OR c.callee_expr LIKE '%.' || s.name)
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM imports i WHERE i.names LIKE '%\"' || s.name || '\"%'
                  )",
    },
    BuiltinRule {
        rule_id: "LARGE_SYMBOL",
        name: "Large symbol",
        description: "Function or method longer than 50 lines or with complexity above 15",
        severity: Severity::Warning,
        query: "SELECT f.path AS path, s.start_line AS line, s.stable_id AS stable_id,
                       s.qualified_name AS name,
                       s.qualified_name || ' spans ' || (s.end_line - s.start_line + 1)
                           || ' lines with complexity ' || s.complexity AS message
                FROM symbols s
                JOIN files f ON f.file_id = s.file_id
                WHERE s.kind IN ('function', 'method')
                  AND (s.end_line - s.start_line + 1 > 50 OR s.complexity > 15)",
    },
    BuiltinRule {
        rule_id: "CIRCULAR_IMPORT",
        name: "Circular import",
        description: "Two modules that import each other",
        severity: Severity::Warning,
        query: "SELECT fa.path AS path, ia.line AS line,
                       fa.path || ' and ' || fb.path || ' import each other' AS message
                FROM imports ia
                JOIN files fa ON fa.file_id = ia.file_id
                JOIN imports ib ON ib.file_id = ia.resolved_file_id
                               AND ib.resolved_file_id = ia.file_id
                JOIN files fb ON fb.file_id = ib.file_id
                WHERE ia.file_id <> ia.resolved_file_id",
    },
];

/// Insert the built-in rules that are not stored yet
pub fn seed(conn: &Connection, weight: f64) -> Result<usize> {
    let created_at = now();
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO rules
             (rule_id, name, description, severity, query, weight, learned_from, builtin, enabled, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, 1, ?8)",
    )?;

    let mut inserted = 0;
    for rule in BUILTIN_RULES {
        inserted += stmt.execute(params![
            rule.rule_id,
            rule.name,
            rule.description,
            rule.severity.as_str(),
            rule.query,
            weight,
            BUILTIN_PROVENANCE,
            created_at,
        ])?;
    }
    if inserted > 0 {
        debug!("Seeded {} builtin rule(s)", inserted);
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::db::IndexDatabase;
    use crate::rules::sandbox::Sandbox;
    use tempfile::tempdir;

    #[test]
    fn test_seed_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = IndexDatabase::open(dir.path().join("index.db")).unwrap();

        assert_eq!(db.write("rules", |tx| seed(tx, 0.5)).unwrap(), 3);
        assert_eq!(db.write("rules", |tx| seed(tx, 0.5)).unwrap(), 0);
    }

    #[test]
    fn test_builtin_queries_pass_the_sandbox() {
        let dir = tempdir().unwrap();
        let db = IndexDatabase::open(dir.path().join("index.db")).unwrap();
        let sandbox = Sandbox::open(db.path(), 2000, 1000).unwrap();

        for rule in BUILTIN_RULES {
            assert!(sandbox.validate(rule.query).is_ok(), "{} rejected", rule.rule_id);
            assert!(sandbox.execute(rule.query).unwrap().rows.is_empty());
        }
    }
}
