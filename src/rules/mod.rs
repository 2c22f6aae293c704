// Diagnostics rule engine: stored queries, findings and effectiveness

pub mod builtin;
pub mod sandbox;

use std::time::Instant;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RulesConfig;
use crate::error::{Error, Result};
use crate::index::db::{now, IndexDatabase};
use crate::index::records::{
    row_to_diagnostic, row_to_rule, row_to_rule_run, Diagnostic, DiagnosticStatus, Rule, RuleRun,
    RunStatus, Severity, DIAGNOSTIC_COLUMNS, RULE_COLUMNS, RULE_RUN_COLUMNS,
};
use sandbox::{RuleRow, Sandbox};

/// A rule as submitted by a user or agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub rule_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub query: String,
    pub severity: Severity,
    /// Where the rule came from, e.g. an incident or review
    pub learned_from: Option<String>,
}

/// Result of a dry run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulePreview {
    pub columns: Vec<String>,
    pub rows: Vec<RuleRow>,
    pub total_rows: usize,
}

/// What one rule execution did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub rule_id: String,
    pub status: RunStatus,
    pub row_count: usize,
    pub new_count: usize,
    pub resolved_count: usize,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub outcomes: Vec<RuleOutcome>,
}

impl DiagnosticsReport {
    pub fn new_diagnostics(&self) -> usize {
        self.outcomes.iter().map(|o| o.new_count).sum()
    }

    pub fn failed(&self) -> impl Iterator<Item = &RuleOutcome> {
        self.outcomes.iter().filter(|o| o.status != RunStatus::Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEffectiveness {
    pub rule_id: String,
    pub weight: f64,
    pub enabled: bool,
    pub runs: usize,
    pub failed_runs: usize,
    pub findings: usize,
    pub open_diagnostics: usize,
    pub useful_votes: usize,
}

/// Narrowing for `list_diagnostics`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticFilter {
    pub status: Option<DiagnosticStatus>,
    pub rule_id: Option<String>,
    pub path_prefix: Option<String>,
}

/// Rule engine over one index
pub struct RuleEngine {
    db: IndexDatabase,
    config: RulesConfig,
}

impl RuleEngine {
    pub fn new(db: IndexDatabase, config: RulesConfig) -> Self {
        Self { db, config }
    }

    fn sandbox(&self, max_rows: usize) -> Result<Sandbox> {
        Sandbox::open(self.db.path(), self.config.timeout_ms, max_rows)
    }

    /// Persist a new enabled rule at the default weight
    pub fn add_rule(&self, rule: NewRule) -> Result<Rule> {
        if rule.rule_id.trim().is_empty() {
            return Err(Error::InvalidInput("rule id cannot be empty".to_string()));
        }
        if rule.name.trim().is_empty() {
            return Err(Error::InvalidInput("rule name cannot be empty".to_string()));
        }
        self.sandbox(self.config.max_rows)?.validate(&rule.query)?;

        let weight = self.config.default_weight;
        let stored = self.db.write("rules", |tx| {
            let exists: Option<i64> = tx
                .query_row("SELECT 1 FROM rules WHERE rule_id = ?1", [&rule.rule_id], |row| {
                    row.get(0)
                })
                .optional()?;
            if exists.is_some() {
                return Err(Error::InvalidInput(format!(
                    "rule {} already exists",
                    rule.rule_id
                )));
            }
            tx.execute(
                "INSERT INTO rules
                     (rule_id, name, description, severity, query, weight, learned_from, builtin, enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 1, ?8)",
                params![
                    rule.rule_id,
                    rule.name,
                    rule.description,
                    rule.severity.as_str(),
                    rule.query,
                    weight,
                    rule.learned_from,
                    now(),
                ],
            )?;
            rule_by_id(tx, &rule.rule_id)?.ok_or_else(|| Error::not_found("rule", &rule.rule_id))
        })?;

        info!("Added rule {} (weight {:.2})", stored.rule_id, stored.weight);
        Ok(stored)
    }

    /// Execute `query` in the sandbox without storing anything
    pub fn test_rule(&self, query: &str) -> Result<RulePreview> {
        let output = self.sandbox(self.config.max_rows)?.execute(query)?;
        let total_rows = output.rows.len();
        let mut rows = output.rows;
        rows.truncate(self.config.preview_rows);
        Ok(RulePreview {
            columns: output.columns,
            rows,
            total_rows,
        })
    }

    /// Run one rule (even if disabled) or every enabled rule by weight
    pub fn run(&self, rule_id: Option<&str>) -> Result<DiagnosticsReport> {
        let rules = match rule_id {
            Some(id) => {
                let rule = self
                    .db
                    .read(|conn| rule_by_id(conn, id))?
                    .ok_or_else(|| Error::not_found("rule", id))?;
                vec![rule]
            }
            None => self.db.read(|conn| enabled_rules(conn))?,
        };

        let sandbox = self.sandbox(self.config.max_rows)?;
        let mut report = DiagnosticsReport::default();
        for rule in &rules {
            let started = Instant::now();
            let result = sandbox.execute(&rule.query);
            let duration_ms = started.elapsed().as_millis() as u64;

            let outcome = match result {
                Ok(output) => self.record_success(rule, &output.rows, duration_ms)?,
                Err(e) => {
                    warn!("Rule {} failed: {}", rule.rule_id, e);
                    let status = if e.is_timeout() {
                        RunStatus::Timeout
                    } else {
                        RunStatus::Error
                    };
                    self.record_failure(rule, status, &e.to_string(), duration_ms)?
                }
            };
            debug!(
                "Rule {}: {} row(s), {} new, {} resolved",
                outcome.rule_id, outcome.row_count, outcome.new_count, outcome.resolved_count
            );
            report.outcomes.push(outcome);
        }

        info!(
            "Ran {} rule(s): {} new diagnostic(s)",
            report.outcomes.len(),
            report.new_diagnostics()
        );
        Ok(report)
    }

    fn record_success(&self, rule: &Rule, rows: &[RuleRow], duration_ms: u64) -> Result<RuleOutcome> {
        self.db.write("diagnostics", |tx| {
            let seen_at = now();
            let mut new_count = 0;
            for row in rows {
                if upsert_diagnostic(tx, rule, row, &seen_at)? {
                    new_count += 1;
                }
            }

            // Findings this run no longer reproduces
            let resolved_count = tx.execute(
                "UPDATE diagnostics SET status = 'resolved', resolved_at = ?1
                 WHERE rule_id = ?2 AND status = 'open' AND last_seen <> ?1",
                params![seen_at, rule.rule_id],
            )?;

            insert_run(tx, &rule.rule_id, &seen_at, RunStatus::Ok, rows.len(), new_count, duration_ms, None)?;

            Ok(RuleOutcome {
                rule_id: rule.rule_id.clone(),
                status: RunStatus::Ok,
                row_count: rows.len(),
                new_count,
                resolved_count,
                duration_ms,
                error: None,
            })
        })
    }

    fn record_failure(
        &self,
        rule: &Rule,
        status: RunStatus,
        error: &str,
        duration_ms: u64,
    ) -> Result<RuleOutcome> {
        self.db.write("rule runs", |tx| {
            insert_run(tx, &rule.rule_id, &now(), status, 0, 0, duration_ms, Some(error))
        })?;
        Ok(RuleOutcome {
            rule_id: rule.rule_id.clone(),
            status,
            row_count: 0,
            new_count: 0,
            resolved_count: 0,
            duration_ms,
            error: Some(error.to_string()),
        })
    }

    /// Move the rule's weight toward 1 (useful) or 0 and disable it below the threshold
    pub fn rate(&self, rule_id: &str, useful: bool) -> Result<Rule> {
        let alpha = self.config.rating_alpha;
        let threshold = self.config.disable_threshold;

        let rule = self.db.write("rules", |tx| {
            let rule = rule_by_id(tx, rule_id)?.ok_or_else(|| Error::not_found("rule", rule_id))?;
            let weight = next_weight(rule.weight, useful, alpha);
            let enabled = if weight < threshold {
                false
            } else {
                rule.enabled || useful
            };
            tx.execute(
                "UPDATE rules SET weight = ?1, enabled = ?2 WHERE rule_id = ?3",
                params![weight, enabled, rule_id],
            )?;
            if useful {
                tx.execute(
                    "UPDATE rule_runs SET useful_count = useful_count + 1
                     WHERE run_id = (SELECT MAX(run_id) FROM rule_runs WHERE rule_id = ?1)",
                    [rule_id],
                )?;
            }
            rule_by_id(tx, rule_id)?.ok_or_else(|| Error::not_found("rule", rule_id))
        })?;

        if !rule.enabled {
            info!("Rule {} disabled at weight {:.3}", rule.rule_id, rule.weight);
        }
        Ok(rule)
    }

    pub fn rules(&self) -> Result<Vec<Rule>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM rules ORDER BY weight DESC, rule_id",
                RULE_COLUMNS
            ))?;
            let rules = stmt
                .query_map([], row_to_rule)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rules)
        })
    }

    /// Most recent runs of a rule, newest first
    pub fn runs(&self, rule_id: &str, limit: usize) -> Result<Vec<RuleRun>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM rule_runs WHERE rule_id = ?1 ORDER BY run_id DESC LIMIT ?2",
                RULE_RUN_COLUMNS
            ))?;
            let runs = stmt
                .query_map(params![rule_id, limit as i64], row_to_rule_run)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(runs)
        })
    }

    pub fn effectiveness(&self) -> Result<Vec<RuleEffectiveness>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT r.rule_id, r.weight, r.enabled,
                        (SELECT COUNT(*) FROM rule_runs x WHERE x.rule_id = r.rule_id),
                        (SELECT COUNT(*) FROM rule_runs x WHERE x.rule_id = r.rule_id AND x.status <> 'ok'),
                        (SELECT COALESCE(SUM(x.new_count), 0) FROM rule_runs x WHERE x.rule_id = r.rule_id),
                        (SELECT COUNT(*) FROM diagnostics d WHERE d.rule_id = r.rule_id AND d.status = 'open'),
                        (SELECT COALESCE(SUM(x.useful_count), 0) FROM rule_runs x WHERE x.rule_id = r.rule_id)
                 FROM rules r
                 ORDER BY r.weight DESC, r.rule_id",
            )?;
            let stats = stmt
                .query_map([], |row| {
                    Ok(RuleEffectiveness {
                        rule_id: row.get(0)?,
                        weight: row.get(1)?,
                        enabled: row.get(2)?,
                        runs: count_at(row, 3)?,
                        failed_runs: count_at(row, 4)?,
                        findings: count_at(row, 5)?,
                        open_diagnostics: count_at(row, 6)?,
                        useful_votes: count_at(row, 7)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(stats)
        })
    }

    pub fn list_diagnostics(&self, filter: &DiagnosticFilter) -> Result<Vec<Diagnostic>> {
        let status = filter.status.map(|s| s.as_str());
        self.db.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM diagnostics
                 WHERE (?1 IS NULL OR status = ?1)
                   AND (?2 IS NULL OR rule_id = ?2)
                   AND (?3 IS NULL OR substr(path, 1, length(?3)) = ?3)
                 ORDER BY path, line, rule_id, diag_id",
                DIAGNOSTIC_COLUMNS
            ))?;
            let diagnostics = stmt
                .query_map(
                    params![status, filter.rule_id, filter.path_prefix],
                    row_to_diagnostic,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(diagnostics)
        })
    }

    /// Mark a finding open, resolved or ignored
    pub fn set_diagnostic_status(&self, diag_id: i64, status: DiagnosticStatus) -> Result<Diagnostic> {
        self.db.write("diagnostics", |tx| {
            let current = diagnostic_by_id(tx, diag_id)?
                .ok_or_else(|| Error::not_found("diagnostic", diag_id.to_string()))?;
            if status == DiagnosticStatus::Open && current.status != DiagnosticStatus::Open {
                let duplicate: Option<i64> = tx
                    .query_row(
                        "SELECT diag_id FROM diagnostics
                         WHERE rule_id = ?1 AND path = ?2 AND line = ?3 AND status = 'open'",
                        params![current.rule_id, current.path, current.line as i64],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(other) = duplicate {
                    return Err(Error::InvalidInput(format!(
                        "diagnostic {} is already open for the same finding",
                        other
                    )));
                }
            }
            let resolved_at = match status {
                DiagnosticStatus::Open => None,
                _ => Some(now()),
            };
            tx.execute(
                "UPDATE diagnostics SET status = ?1, resolved_at = ?2 WHERE diag_id = ?3",
                params![status.as_str(), resolved_at, diag_id],
            )?;
            diagnostic_by_id(tx, diag_id)?
                .ok_or_else(|| Error::not_found("diagnostic", diag_id.to_string()))
        })
    }
}

fn count_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<usize> {
    Ok(row.get::<_, i64>(idx)?.max(0) as usize)
}

/// Exponential moving average toward 1.0 or 0.0
pub fn next_weight(weight: f64, useful: bool, alpha: f64) -> f64 {
    let target = if useful { 1.0 } else { 0.0 };
    (weight + alpha * (target - weight)).clamp(0.0, 1.0)
}

fn rule_by_id(conn: &Connection, rule_id: &str) -> Result<Option<Rule>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM rules WHERE rule_id = ?1", RULE_COLUMNS),
            [rule_id],
            row_to_rule,
        )
        .optional()?)
}

fn enabled_rules(conn: &Connection) -> Result<Vec<Rule>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM rules WHERE enabled = 1 ORDER BY weight DESC, rule_id",
        RULE_COLUMNS
    ))?;
    let rules = stmt
        .query_map([], row_to_rule)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rules)
}

fn diagnostic_by_id(conn: &Connection, diag_id: i64) -> Result<Option<Diagnostic>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM diagnostics WHERE diag_id = ?1", DIAGNOSTIC_COLUMNS),
            [diag_id],
            row_to_diagnostic,
        )
        .optional()?)
}

#[allow(clippy::too_many_arguments)]
fn insert_run(
    conn: &Connection,
    rule_id: &str,
    ran_at: &str,
    status: RunStatus,
    row_count: usize,
    new_count: usize,
    duration_ms: u64,
    error: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO rule_runs (rule_id, ran_at, status, row_count, new_count, duration_ms, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            rule_id,
            ran_at,
            status.as_str(),
            row_count as i64,
            new_count as i64,
            duration_ms as i64,
            error
        ],
    )?;
    Ok(())
}

/// Innermost symbol of `path` whose range covers `line`
fn enclosing_symbol(conn: &Connection, path: &str, line: usize) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT s.stable_id FROM symbols s JOIN files f ON f.file_id = s.file_id
             WHERE f.path = ?1 AND s.start_line <= ?2 AND s.end_line >= ?2
             ORDER BY s.end_line - s.start_line, s.symbol_id
             LIMIT 1",
            params![path, line as i64],
            |row| row.get(0),
        )
        .optional()?)
}

/// Record one finding; true when it opened a new diagnostic
fn upsert_diagnostic(conn: &Connection, rule: &Rule, row: &RuleRow, seen_at: &str) -> Result<bool> {
    let message = row.message.clone().unwrap_or_else(|| match &row.name {
        Some(name) => format!("{}: {}", rule.name, name),
        None => rule.name.clone(),
    });
    let line = row.line as i64;

    let refreshed = conn.execute(
        "UPDATE diagnostics SET last_seen = ?1, message = ?2
         WHERE rule_id = ?3 AND path = ?4 AND line = ?5 AND status = 'open'",
        params![seen_at, message, rule.rule_id, row.path, line],
    )?;
    if refreshed > 0 {
        return Ok(false);
    }

    // A finding the user dismissed stays dismissed
    let ignored = conn.execute(
        "UPDATE diagnostics SET last_seen = ?1
         WHERE rule_id = ?2 AND path = ?3 AND line = ?4 AND status = 'ignored'",
        params![seen_at, rule.rule_id, row.path, line],
    )?;
    if ignored > 0 {
        return Ok(false);
    }

    let symbol = match &row.stable_id {
        Some(stable_id) => Some(stable_id.clone()),
        None => enclosing_symbol(conn, &row.path, row.line)?,
    };
    conn.execute(
        "INSERT INTO diagnostics
             (rule_id, path, symbol_stable_id, line, severity, message, status, first_seen, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open', ?7, ?7)",
        params![
            rule.rule_id,
            row.path,
            symbol,
            line,
            rule.severity.as_str(),
            message,
            seen_at
        ],
    )?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::index::{ExtractorRegistry, SourceFile};
    use crate::indexer::{IndexMode, Indexer};
    use crate::error::QueryError;
    use std::sync::Arc;
    use tempfile::tempdir;

    const SCIPY_RULE: &str = "SELECT f.path AS path, i.line AS line, 'scipy imported early' AS message
                              FROM imports i JOIN files f ON f.file_id = i.file_id
                              WHERE i.module = 'scipy' AND i.line < 20";

    fn setup(files: Vec<SourceFile>) -> (tempfile::TempDir, IndexDatabase, Indexer, RuleEngine) {
        let dir = tempdir().unwrap();
        let db = IndexDatabase::open(dir.path().join("index.db")).unwrap();
        let config = Config::default();
        let indexer = Indexer::new(
            db.clone(),
            Arc::new(ExtractorRegistry::default()),
            &config.indexing,
            config.rules.default_weight,
        );
        indexer.run(&files, IndexMode::Incremental).unwrap();
        let engine = RuleEngine::new(db.clone(), config.rules);
        (dir, db, indexer, engine)
    }

    fn scipy_rule() -> NewRule {
        NewRule {
            rule_id: "EARLY_SCIPY".to_string(),
            name: "Early scipy import".to_string(),
            description: String::new(),
            query: SCIPY_RULE.to_string(),
            severity: Severity::Warning,
            learned_from: Some("slow CLI startup".to_string()),
        }
    }

    fn scipy_file() -> SourceFile {
        SourceFile::new("calc.py", "import os\n\n\n\nimport scipy\n\ndef solve():\n    return scipy.linalg\n")
    }

    #[test]
    fn test_rule_run_is_idempotent() {
        let (_dir, _db, _indexer, engine) = setup(vec![scipy_file()]);
        let rule = engine.add_rule(scipy_rule()).unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.weight, 0.5);
        assert_eq!(rule.learned_from.as_deref(), Some("slow CLI startup"));

        let report = engine.run(Some("EARLY_SCIPY")).unwrap();
        assert_eq!(report.new_diagnostics(), 1);

        let report = engine.run(Some("EARLY_SCIPY")).unwrap();
        assert_eq!(report.new_diagnostics(), 0);

        let filter = DiagnosticFilter {
            rule_id: Some("EARLY_SCIPY".to_string()),
            ..Default::default()
        };
        let diagnostics = engine.list_diagnostics(&filter).unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].path, "calc.py");
        assert_eq!(diagnostics[0].line, 5);
        assert_eq!(diagnostics[0].status, DiagnosticStatus::Open);
        assert_eq!(engine.runs("EARLY_SCIPY", 10).unwrap().len(), 2);
    }

    #[test]
    fn test_fixed_finding_is_resolved_on_rerun() {
        let (_dir, _db, indexer, engine) = setup(vec![scipy_file()]);
        engine.add_rule(scipy_rule()).unwrap();
        engine.run(Some("EARLY_SCIPY")).unwrap();

        indexer
            .run(
                &[SourceFile::new("calc.py", "import os\n\ndef solve():\n    return os\n")],
                IndexMode::Incremental,
            )
            .unwrap();
        let outcome = &engine.run(Some("EARLY_SCIPY")).unwrap().outcomes[0];
        assert_eq!(outcome.resolved_count, 1);

        let open = engine
            .list_diagnostics(&DiagnosticFilter {
                status: Some(DiagnosticStatus::Open),
                rule_id: Some("EARLY_SCIPY".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(open.is_empty());
    }

    #[test]
    fn test_failing_rule_does_not_stop_others() {
        let (_dir, db, _indexer, engine) = setup(vec![scipy_file()]);
        engine.add_rule(scipy_rule()).unwrap();

        // Sneak a broken rule past add_rule validation
        db.write("rules", |tx| {
            tx.execute(
                "INSERT INTO rules (rule_id, name, query, weight, created_at)
                 VALUES ('BROKEN', 'broken', 'SELECT path, line FROM nowhere', 0.9, 'now')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let report = engine.run(None).unwrap();
        let ids: Vec<&str> = report.outcomes.iter().map(|o| o.rule_id.as_str()).collect();
        assert_eq!(ids[0], "BROKEN");
        assert!(ids.contains(&"EARLY_SCIPY"));

        let broken = &report.outcomes[0];
        assert_eq!(broken.status, RunStatus::Error);
        assert!(broken.error.is_some());
        assert_eq!(report.failed().count(), 1);
        let scipy = report.outcomes.iter().find(|o| o.rule_id == "EARLY_SCIPY").unwrap();
        assert_eq!(scipy.new_count, 1);
    }

    #[test]
    fn test_add_rule_rejects_unsafe_queries() {
        let (_dir, _db, _indexer, engine) = setup(vec![scipy_file()]);

        let mut rule = scipy_rule();
        rule.query = "DELETE FROM files".to_string();
        assert!(matches!(
            engine.add_rule(rule),
            Err(Error::Query(QueryError::NotReadOnly(_)))
        ));

        let mut rule = scipy_rule();
        rule.query = "SELECT 'x' AS path, 1 AS line FROM sessions".to_string();
        assert!(matches!(
            engine.add_rule(rule),
            Err(Error::Query(QueryError::TableNotAllowed(_)))
        ));

        engine.add_rule(scipy_rule()).unwrap();
        assert!(matches!(engine.add_rule(scipy_rule()), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_test_rule_previews_without_storing() {
        let (_dir, db, _indexer, engine) = setup(vec![scipy_file()]);

        let preview = engine.test_rule(SCIPY_RULE).unwrap();
        assert_eq!(preview.total_rows, 1);
        assert_eq!(preview.rows[0].line, 5);
        assert_eq!(db.stats().unwrap().open_diagnostics, 0);
    }

    #[test]
    fn test_unknown_rule_is_not_found() {
        let (_dir, _db, _indexer, engine) = setup(vec![]);
        assert!(matches!(engine.run(Some("NOPE")), Err(Error::NotFound { .. })));
        assert!(matches!(engine.rate("NOPE", true), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_rating_moves_weight_and_disables() {
        let (_dir, _db, _indexer, engine) = setup(vec![scipy_file()]);
        engine.add_rule(scipy_rule()).unwrap();
        engine.run(Some("EARLY_SCIPY")).unwrap();

        let rule = engine.rate("EARLY_SCIPY", true).unwrap();
        assert!(rule.weight > 0.5);

        let mut rule = rule;
        while rule.enabled {
            rule = engine.rate("EARLY_SCIPY", false).unwrap();
        }
        assert!(rule.weight < 0.2);

        // Disabled rules are skipped unless asked for by id
        let report = engine.run(None).unwrap();
        assert!(report.outcomes.iter().all(|o| o.rule_id != "EARLY_SCIPY"));
        assert_eq!(engine.run(Some("EARLY_SCIPY")).unwrap().outcomes.len(), 1);

        let stats = engine.effectiveness().unwrap();
        let scipy = stats.iter().find(|s| s.rule_id == "EARLY_SCIPY").unwrap();
        assert_eq!(scipy.useful_votes, 1);
        assert_eq!(scipy.runs, 2);
        assert!(!scipy.enabled);
    }

    #[test]
    fn test_ignored_finding_stays_ignored() {
        let (_dir, _db, _indexer, engine) = setup(vec![scipy_file()]);
        engine.add_rule(scipy_rule()).unwrap();
        engine.run(Some("EARLY_SCIPY")).unwrap();

        let diagnostics = engine.list_diagnostics(&DiagnosticFilter::default()).unwrap();
        let diag = engine
            .set_diagnostic_status(diagnostics[0].diag_id, DiagnosticStatus::Ignored)
            .unwrap();
        assert_eq!(diag.status, DiagnosticStatus::Ignored);
        assert!(diag.resolved_at.is_some());

        let report = engine.run(Some("EARLY_SCIPY")).unwrap();
        assert_eq!(report.new_diagnostics(), 0);
        assert!(matches!(
            engine.set_diagnostic_status(999, DiagnosticStatus::Open),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_diagnostic_is_attached_to_enclosing_symbol() {
        let (_dir, db, _indexer, engine) = setup(vec![SourceFile::new(
            "calc.py",
            "def solve():\n    import scipy\n    return scipy\n",
        )]);
        engine.add_rule(scipy_rule()).unwrap();
        engine.run(Some("EARLY_SCIPY")).unwrap();

        let stable_id: String = db
            .read(|conn| {
                Ok(conn.query_row(
                    "SELECT stable_id FROM symbols WHERE qualified_name = 'solve'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        let diagnostics = engine.list_diagnostics(&DiagnosticFilter::default()).unwrap();
        assert_eq!(diagnostics[0].symbol_stable_id.as_deref(), Some(stable_id.as_str()));
    }

    #[test]
    fn test_next_weight() {
        assert!((next_weight(0.5, true, 0.3) - 0.65).abs() < 1e-9);
        assert!((next_weight(0.5, false, 0.3) - 0.35).abs() < 1e-9);
        assert_eq!(next_weight(1.0, true, 0.3), 1.0);
    }
}
