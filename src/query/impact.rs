// Transitive impact analysis over reversed call edges

use std::collections::{BTreeSet, HashSet, VecDeque};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::engine::find_symbols;
use crate::error::Result;
use crate::index::db::IndexDatabase;
use crate::index::records::{row_to_symbol_ref, SymbolRef};
use crate::index::SymbolKind;

/// A symbol reached by the traversal, `depth` hops from the nearest seed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffectedSymbol {
    #[serde(flatten)]
    pub symbol: SymbolRef,
    pub depth: usize,
}

/// What may break if the seed symbols change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactReport {
    pub seeds: Vec<SymbolRef>,
    /// Breadth-first order, seeds excluded
    pub affected: Vec<AffectedSymbol>,
    /// Files containing at least one affected symbol
    pub files: BTreeSet<String>,
    pub max_depth: usize,
    /// Stopped at the node cap
    pub truncated: bool,
    /// Some callers lie beyond `max_depth`
    pub depth_limited: bool,
}

/// Raw traversal result over symbol ids
#[derive(Debug, Default)]
struct Traversal {
    reached: Vec<(i64, usize)>,
    truncated: bool,
    depth_limited: bool,
}

/// Bounded BFS from `seeds` following `callers_of`.
///
/// Every node is visited at most once, so cycles terminate; a node's depth is
/// its shortest distance from any seed.
fn traverse<F>(seeds: &[i64], max_depth: usize, max_nodes: usize, mut callers_of: F) -> Result<Traversal>
where
    F: FnMut(i64) -> Result<Vec<i64>>,
{
    let mut result = Traversal::default();
    let mut visited: HashSet<i64> = seeds.iter().copied().collect();
    let mut queue: VecDeque<(i64, usize)> = seeds.iter().map(|&id| (id, 0)).collect();

    'bfs: while let Some((node, depth)) = queue.pop_front() {
        let callers = callers_of(node)?;
        if depth >= max_depth {
            if callers.iter().any(|c| !visited.contains(c)) {
                result.depth_limited = true;
            }
            continue;
        }
        for caller in callers {
            if !visited.insert(caller) {
                continue;
            }
            if result.reached.len() >= max_nodes {
                result.truncated = true;
                break 'bfs;
            }
            result.reached.push((caller, depth + 1));
            queue.push_back((caller, depth + 1));
        }
    }

    Ok(result)
}

fn direct_callers(conn: &Connection, symbol_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT caller_id FROM calls
         WHERE callee_id = ?1 AND caller_id IS NOT NULL
         ORDER BY caller_id",
    )?;
    let ids = stmt
        .query_map([symbol_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    Ok(ids)
}

fn symbol_ref(conn: &Connection, symbol_id: i64) -> Result<Option<SymbolRef>> {
    let mut stmt = conn.prepare_cached(
        "SELECT s.stable_id, s.qualified_name, s.kind, f.path, s.start_line
         FROM symbols s JOIN files f ON f.file_id = s.file_id
         WHERE s.symbol_id = ?1",
    )?;
    let mut rows = stmt.query([symbol_id])?;
    match rows.next()? {
        Some(row) => Ok(row_to_symbol_ref(row, 0)?),
        None => Ok(None),
    }
}

/// Impact of changing every symbol `name` matches; `None` when nothing matches
pub fn get_impact(
    db: &IndexDatabase,
    name: &str,
    kind: Option<SymbolKind>,
    max_depth: usize,
    max_nodes: usize,
) -> Result<Option<ImpactReport>> {
    db.read(|conn| {
        let targets = find_symbols(conn, name, kind)?;
        if targets.is_empty() {
            return Ok(None);
        }

        let seed_ids: Vec<i64> = targets.iter().map(|s| s.symbol_id).collect();
        let traversal = traverse(&seed_ids, max_depth, max_nodes, |id| direct_callers(conn, id))?;

        let mut affected = Vec::with_capacity(traversal.reached.len());
        let mut files = BTreeSet::new();
        for (symbol_id, depth) in traversal.reached {
            if let Some(symbol) = symbol_ref(conn, symbol_id)? {
                files.insert(symbol.path.clone());
                affected.push(AffectedSymbol { symbol, depth });
            }
        }

        debug!(
            "Impact of {}: {} symbol(s) in {} file(s){}",
            name,
            affected.len(),
            files.len(),
            if traversal.truncated { " (truncated)" } else { "" }
        );

        Ok(Some(ImpactReport {
            seeds: targets.iter().map(SymbolRef::from).collect(),
            affected,
            files,
            max_depth,
            truncated: traversal.truncated,
            depth_limited: traversal.depth_limited,
        }))
    })
}
