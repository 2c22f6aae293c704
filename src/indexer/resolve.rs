// Name-based call and import resolution

use rusqlite::types::Type;
use rusqlite::{params, Connection};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::Result;
use crate::index::{package_dir, SymbolKind};

/// Outcome of resolving one call expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved(i64),
    Unresolved(Unresolved),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unresolved {
    /// No symbol carries the called name
    NoMatch,
    /// Several symbols in the deciding tier and nothing singles one out
    Ambiguous(usize),
}

/// A symbol that could be the target of a call
#[derive(Debug, Clone)]
pub struct Candidate {
    pub symbol_id: i64,
    pub kind: SymbolKind,
    pub qualified_name: String,
    pub module: String,
    pub path: String,
}

impl Candidate {
    fn full_name(&self) -> String {
        if self.module.is_empty() {
            self.qualified_name.clone()
        } else {
            format!("{}.{}", self.module, self.qualified_name)
        }
    }

    /// Qualified name of the enclosing class (or function) scope
    fn owner(&self) -> Option<&str> {
        self.qualified_name.rsplit_once('.').map(|(owner, _)| owner)
    }

    fn is_module_level(&self) -> bool {
        !self.qualified_name.contains('.')
    }
}

/// The calling side of an expression
#[derive(Debug, Clone, Copy)]
pub struct CallSite<'a> {
    pub path: &'a str,
    /// Qualified name of the calling symbol, if the call is inside one
    pub caller: Option<&'a str>,
}

/// Split `a.b.c` into (`a.b`, `c`); `None` for expressions that are not a
/// plain dotted name
pub fn split_callee(expr: &str) -> Option<(&str, &str)> {
    let valid = !expr.is_empty()
        && expr
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_alphanumeric() || c == '_'));
    if !valid {
        return None;
    }
    Some(match expr.rsplit_once('.') {
        Some((qualifier, name)) => (qualifier, name),
        None => ("", expr),
    })
}

/// Pick the target of `expr` among `candidates` (all symbols named like the
/// last segment of `expr`)
pub fn choose(expr: &str, site: CallSite, candidates: &[Candidate]) -> Resolution {
    let Some((qualifier, _)) = split_callee(expr) else {
        return Resolution::Unresolved(Unresolved::NoMatch);
    };
    let via_self = qualifier == "self" || qualifier == "cls";

    let eligible: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.kind.is_callable())
        .filter(|c| {
            if qualifier.is_empty() {
                c.kind != SymbolKind::Method
            } else if via_self {
                c.kind == SymbolKind::Method
            } else if c.is_module_level() {
                qualifier_matches(c, expr)
            } else {
                true
            }
        })
        .collect();

    let dir = package_dir(site.path);
    let tiers: [&dyn Fn(&Candidate) -> bool; 3] = [
        &|c| c.path == site.path,
        &|c| package_dir(&c.path) == dir,
        &|_| true,
    ];

    for in_tier in tiers {
        let tier: Vec<&Candidate> = eligible.iter().copied().filter(|c| in_tier(*c)).collect();
        match tier.len() {
            0 => continue,
            1 => return Resolution::Resolved(tier[0].symbol_id),
            n => {
                let narrowed: Vec<&Candidate> = tier
                    .iter()
                    .copied()
                    .filter(|c| {
                        if via_self {
                            match (site.caller, c.owner()) {
                                (Some(caller), Some(owner)) => {
                                    caller.starts_with(&format!("{}.", owner))
                                }
                                _ => false,
                            }
                        } else {
                            !qualifier.is_empty() && qualifier_matches(c, expr)
                        }
                    })
                    .collect();
                return match narrowed.as_slice() {
                    [only] => Resolution::Resolved(only.symbol_id),
                    _ => Resolution::Unresolved(Unresolved::Ambiguous(n)),
                };
            }
        }
    }

    Resolution::Unresolved(Unresolved::NoMatch)
}

fn qualifier_matches(candidate: &Candidate, expr: &str) -> bool {
    let full = candidate.full_name();
    full == expr || full.ends_with(&format!(".{}", expr))
}

/// Candidate cache keyed by short name, valid for one transaction
#[derive(Default)]
pub struct CandidateCache {
    by_name: HashMap<String, Vec<Candidate>>,
}

impl CandidateCache {
    pub fn get(&mut self, conn: &Connection, name: &str) -> Result<&[Candidate]> {
        if !self.by_name.contains_key(name) {
            let mut stmt = conn.prepare_cached(
                "SELECT s.symbol_id, s.kind, s.qualified_name, f.module, f.path
                 FROM symbols s JOIN files f ON f.file_id = s.file_id
                 WHERE s.name = ?1
                 ORDER BY s.symbol_id",
            )?;
            let rows = stmt.query_map([name], |row| {
                let kind: String = row.get(1)?;
                Ok((row.get(0)?, kind, row.get(2)?, row.get(3)?, row.get(4)?))
            })?;
            let mut candidates = Vec::new();
            for row in rows {
                let (symbol_id, kind, qualified_name, module, path): (i64, String, String, String, String) = row?;
                if let Some(kind) = SymbolKind::parse(&kind) {
                    candidates.push(Candidate {
                        symbol_id,
                        kind,
                        qualified_name,
                        module,
                        path,
                    });
                }
            }
            self.by_name.insert(name.to_string(), candidates);
        }
        Ok(self
            .by_name
            .get(name)
            .map(|v| v.as_slice())
            .unwrap_or_default())
    }
}

struct PendingCall {
    call_id: i64,
    callee_expr: String,
    path: String,
    caller: Option<String>,
    current: Option<i64>,
}

fn resolve_pending(conn: &Connection, pending: Vec<PendingCall>) -> Result<usize> {
    let mut cache = CandidateCache::default();
    let mut changed = 0;
    let mut update = conn.prepare_cached("UPDATE calls SET callee_id = ?1 WHERE call_id = ?2")?;
    for call in pending {
        let resolution = match split_callee(&call.callee_expr) {
            Some((_, name)) => {
                let site = CallSite {
                    path: &call.path,
                    caller: call.caller.as_deref(),
                };
                choose(&call.callee_expr, site, cache.get(conn, name)?)
            }
            None => Resolution::Unresolved(Unresolved::NoMatch),
        };
        let target = match resolution {
            Resolution::Resolved(id) => Some(id),
            Resolution::Unresolved(_) => None,
        };
        if target != call.current {
            update.execute(params![target, call.call_id])?;
            changed += 1;
        }
    }
    Ok(changed)
}

const PENDING_CALL_SELECT: &str = "SELECT c.call_id, c.callee_expr, f.path, cs.qualified_name, c.callee_id
     FROM calls c
     JOIN files f ON f.file_id = c.file_id
     LEFT JOIN symbols cs ON cs.symbol_id = c.caller_id";

fn row_to_pending(row: &rusqlite::Row) -> rusqlite::Result<PendingCall> {
    Ok(PendingCall {
        call_id: row.get(0)?,
        callee_expr: row.get(1)?,
        path: row.get(2)?,
        caller: row.get(3)?,
        current: row.get(4)?,
    })
}

/// Resolve every call site in one file
pub fn resolve_file_calls(conn: &Connection, file_id: i64) -> Result<usize> {
    let pending = {
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE c.file_id = ?1 ORDER BY c.call_id",
            PENDING_CALL_SELECT
        ))?;
        let rows = stmt.query_map([file_id], row_to_pending)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
    };
    resolve_pending(conn, pending)
}

/// Re-resolve calls anywhere whose called name is one of `names`.
///
/// Used after symbols with these names appeared or disappeared, since that
/// can change which tier decides or make a call ambiguous.
pub fn re_resolve_calls_named(conn: &Connection, names: &BTreeSet<String>) -> Result<usize> {
    let mut pending = Vec::new();
    {
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE c.callee_expr = ?1 OR c.callee_expr LIKE '%.' || ?1
             ORDER BY c.call_id",
            PENDING_CALL_SELECT
        ))?;
        for name in names {
            let rows = stmt.query_map([name], row_to_pending)?;
            for row in rows {
                let call = row?;
                // LIKE treats `_` as a wildcard; keep exact matches only
                if split_callee(&call.callee_expr).map(|(_, n)| n) == Some(name.as_str()) {
                    pending.push(call);
                }
            }
        }
    }
    let changed = resolve_pending(conn, pending)?;
    if changed > 0 {
        debug!("Re-resolved {} call(s) for {} name(s)", changed, names.len());
    }
    Ok(changed)
}

/// Turn a possibly relative module (`.util`, `..core`) into an absolute
/// dotted name, as seen from the file at `importer_path`
pub fn absolutize(module: &str, importer_module: &str, importer_path: &str) -> Option<String> {
    let dots = module.chars().take_while(|c| *c == '.').count();
    if dots == 0 {
        return Some(module.to_string());
    }
    let rest = &module[dots..];

    let mut package: Vec<&str> = if importer_module.is_empty() {
        Vec::new()
    } else {
        importer_module.split('.').collect()
    };
    let is_package_init = importer_path.ends_with("__init__.py");
    if !is_package_init {
        package.pop()?;
    }
    for _ in 1..dots {
        package.pop()?;
    }
    if !rest.is_empty() {
        package.push(rest);
    }
    Some(package.join("."))
}

fn file_for_module(conn: &Connection, module: &str) -> Result<Option<i64>> {
    let mut stmt =
        conn.prepare_cached("SELECT file_id FROM files WHERE module = ?1 ORDER BY path LIMIT 1")?;
    let mut rows = stmt.query([module])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

/// Modules an import may point at, most specific first: the module itself,
/// then `module.name` for `from pkg import mod`
fn import_targets(
    module: &str,
    names: &[String],
    importer_module: &str,
    importer_path: &str,
) -> Vec<String> {
    let Some(absolute) = absolutize(module, importer_module, importer_path) else {
        return Vec::new();
    };
    let mut targets = Vec::with_capacity(names.len() + 1);
    for name in names.iter().filter(|n| n.as_str() != "*") {
        targets.push(if absolute.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", absolute, name)
        });
    }
    if !absolute.is_empty() {
        targets.insert(0, absolute);
    }
    targets
}

/// Target file of one import, or `None` for external modules
pub fn resolve_import(
    conn: &Connection,
    module: &str,
    names: &[String],
    importer_module: &str,
    importer_path: &str,
) -> Result<Option<i64>> {
    for target in import_targets(module, names, importer_module, importer_path) {
        if let Some(file_id) = file_for_module(conn, &target)? {
            return Ok(Some(file_id));
        }
    }
    Ok(None)
}

struct PendingImport {
    import_id: i64,
    module: String,
    names: Vec<String>,
    importer_module: String,
    importer_path: String,
    current: Option<i64>,
}

impl PendingImport {
    fn targets(&self) -> Vec<String> {
        import_targets(&self.module, &self.names, &self.importer_module, &self.importer_path)
    }
}

fn row_to_pending_import(row: &rusqlite::Row) -> rusqlite::Result<PendingImport> {
    let names: String = row.get(2)?;
    let names = serde_json::from_str(&names)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    Ok(PendingImport {
        import_id: row.get(0)?,
        module: row.get(1)?,
        names,
        importer_module: row.get(3)?,
        importer_path: row.get(4)?,
        current: row.get(5)?,
    })
}

fn pending_imports(conn: &Connection, filter: &str, param: Option<i64>) -> Result<Vec<PendingImport>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT i.import_id, i.module, i.names, f.module, f.path, i.resolved_file_id
         FROM imports i JOIN files f ON f.file_id = i.file_id
         WHERE {}
         ORDER BY i.import_id",
        filter
    ))?;
    let rows = match param {
        Some(p) => stmt.query_map([p], row_to_pending_import)?,
        None => stmt.query_map([], row_to_pending_import)?,
    };
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

fn resolve_imports(conn: &Connection, pending: Vec<PendingImport>) -> Result<usize> {
    let mut changed = 0;
    let mut update =
        conn.prepare_cached("UPDATE imports SET resolved_file_id = ?1 WHERE import_id = ?2")?;
    for import in pending {
        let target = resolve_import(
            conn,
            &import.module,
            &import.names,
            &import.importer_module,
            &import.importer_path,
        )?;
        if target != import.current {
            update.execute(params![target, import.import_id])?;
            changed += 1;
        }
    }
    Ok(changed)
}

/// Resolve the imports of one file
pub fn resolve_file_imports(conn: &Connection, file_id: i64) -> Result<usize> {
    let pending = pending_imports(conn, "i.file_id = ?1", Some(file_id))?;
    resolve_imports(conn, pending)
}

/// Retry imports that point nowhere but name one of `modules`.
///
/// Only a newly added module can give a dangling import a target, so imports
/// of external packages are never looked up again.
pub fn re_resolve_imports_of(conn: &Connection, modules: &BTreeSet<String>) -> Result<usize> {
    if modules.is_empty() {
        return Ok(0);
    }
    let pending: Vec<PendingImport> = pending_imports(conn, "i.resolved_file_id IS NULL", None)?
        .into_iter()
        .filter(|import| import.targets().iter().any(|t| modules.contains(t)))
        .collect();
    let changed = resolve_imports(conn, pending)?;
    if changed > 0 {
        debug!("Resolved {} dangling import(s) against {} new module(s)", changed, modules.len());
    }
    Ok(changed)
}
