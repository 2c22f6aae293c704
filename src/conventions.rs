// Architectural layer checks over resolved imports

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

use crate::config::LayerConfig;
use crate::error::{Error, Result};
use crate::index::db::IndexDatabase;
use crate::indexer::resolve::absolutize;

/// An import that crosses into a layer it may not use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub file: String,
    pub line: usize,
    pub imported_module: String,
    pub target_path: String,
    pub from_layer: String,
    pub to_layer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConventionReport {
    pub layers: usize,
    pub imports_checked: usize,
    pub violations: Vec<Violation>,
}

/// One import as seen by the checker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEdge {
    pub file: String,
    pub file_module: String,
    pub module: String,
    pub line: usize,
    pub resolved_path: Option<String>,
}

struct Layer {
    name: String,
    globs: GlobSet,
    prefixes: Vec<String>,
    allowed: HashSet<String>,
}

impl Layer {
    fn contains(&self, path: &str) -> bool {
        self.globs.is_match(path)
            || self
                .prefixes
                .iter()
                .any(|p| path == p || path.starts_with(&format!("{}/", p)))
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// Checks imports against the configured layers; the first matching layer owns a file
pub struct ConventionChecker {
    layers: Vec<Layer>,
}

impl ConventionChecker {
    pub fn new(configs: &[LayerConfig]) -> Result<Self> {
        let mut layers = Vec::with_capacity(configs.len());
        for config in configs {
            let mut builder = GlobSetBuilder::new();
            let mut prefixes = Vec::new();
            for pattern in &config.paths {
                let pattern = pattern.trim().trim_start_matches("./");
                if is_glob(pattern) {
                    let glob = Glob::new(pattern).map_err(|e| {
                        Error::InvalidInput(format!("layer {}: bad pattern {}: {}", config.name, pattern, e))
                    })?;
                    builder.add(glob);
                } else {
                    prefixes.push(pattern.trim_end_matches('/').to_string());
                }
            }
            let globs = builder
                .build()
                .map_err(|e| Error::InvalidInput(format!("layer {}: {}", config.name, e)))?;
            layers.push(Layer {
                name: config.name.clone(),
                globs,
                prefixes,
                allowed: config.allowed_imports.iter().cloned().collect(),
            });
        }
        Ok(Self { layers })
    }

    fn layer_index(&self, path: &str) -> Option<usize> {
        self.layers.iter().position(|layer| layer.contains(path))
    }

    /// Name of the layer owning `path`, if any
    pub fn layer_of(&self, path: &str) -> Option<&str> {
        self.layer_index(path).map(|i| self.layers[i].name.as_str())
    }

    /// Where an import lands: its resolved file, else paths derived from the module name
    fn target_of(&self, edge: &ImportEdge) -> Option<(usize, String)> {
        if let Some(path) = &edge.resolved_path {
            return self.layer_index(path).map(|i| (i, path.clone()));
        }
        let module = absolutize(&edge.module, &edge.file_module, &edge.file)?;
        if module.is_empty() {
            return None;
        }
        let base = module.replace('.', "/");
        [format!("{}.py", base), format!("{}/__init__.py", base), base]
            .into_iter()
            .find_map(|path| self.layer_index(&path).map(|i| (i, path)))
    }

    /// Violations among `imports`, in input order
    pub fn check_imports(&self, imports: &[ImportEdge]) -> Vec<Violation> {
        let mut violations = Vec::new();
        for edge in imports {
            let Some(from) = self.layer_index(&edge.file) else {
                continue;
            };
            let Some((to, target_path)) = self.target_of(edge) else {
                continue;
            };
            if from == to {
                continue;
            }
            let from_layer = &self.layers[from];
            let to_layer = &self.layers[to];
            if from_layer.allowed.contains(&to_layer.name) {
                continue;
            }
            violations.push(Violation {
                file: edge.file.clone(),
                line: edge.line,
                imported_module: edge.module.clone(),
                target_path,
                from_layer: from_layer.name.clone(),
                to_layer: to_layer.name.clone(),
            });
        }
        violations
    }

    /// Check every stored import
    pub fn check(&self, db: &IndexDatabase) -> Result<ConventionReport> {
        if self.layers.is_empty() {
            debug!("No layers configured; nothing to check");
            return Ok(ConventionReport::default());
        }

        let imports = db.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT f.path, f.module, i.module, i.line, rf.path
                 FROM imports i
                 JOIN files f ON f.file_id = i.file_id
                 LEFT JOIN files rf ON rf.file_id = i.resolved_file_id
                 ORDER BY f.path, i.line, i.import_id",
            )?;
            let edges = stmt
                .query_map([], |row| {
                    Ok(ImportEdge {
                        file: row.get(0)?,
                        file_module: row.get(1)?,
                        module: row.get(2)?,
                        line: row.get::<_, i64>(3)?.max(0) as usize,
                        resolved_path: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(edges)
        })?;

        let violations = self.check_imports(&imports);
        info!(
            "Checked {} import(s) against {} layer(s): {} violation(s)",
            imports.len(),
            self.layers.len(),
            violations.len()
        );
        Ok(ConventionReport {
            layers: self.layers.len(),
            imports_checked: imports.len(),
            violations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::index::{ExtractorRegistry, SourceFile};
    use crate::indexer::{IndexMode, Indexer};
    use proptest::prelude::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn layer(name: &str, paths: &[&str], allowed: &[&str]) -> LayerConfig {
        LayerConfig {
            name: name.to_string(),
            paths: paths.iter().map(|s| s.to_string()).collect(),
            allowed_imports: allowed.iter().map(|s| s.to_string()).collect(),
            description: String::new(),
        }
    }

    fn edge(file: &str, module: &str, resolved: Option<&str>) -> ImportEdge {
        ImportEdge {
            file: file.to_string(),
            file_module: crate::index::module_name(file),
            module: module.to_string(),
            line: 1,
            resolved_path: resolved.map(str::to_string),
        }
    }

    #[test]
    fn test_first_matching_layer_wins() {
        let checker = ConventionChecker::new(&[
            layer("generated", &["app/gen/**"], &[]),
            layer("app", &["app"], &[]),
        ])
        .unwrap();
        assert_eq!(checker.layer_of("app/gen/models.py"), Some("generated"));
        assert_eq!(checker.layer_of("app/views.py"), Some("app"));
        assert_eq!(checker.layer_of("application.py"), None);
        assert_eq!(checker.layer_of("scripts/run.py"), None);
    }

    #[test]
    fn test_pure_layer_flags_only_cross_layer_imports() {
        let checker = ConventionChecker::new(&[
            layer("domain", &["domain/**"], &[]),
            layer("api", &["api/**"], &["domain"]),
        ])
        .unwrap();

        let violations = checker.check_imports(&[
            edge("domain/model.py", "domain.rules", Some("domain/rules.py")),
            edge("domain/model.py", "api.routes", Some("api/routes.py")),
            edge("api/routes.py", "domain.model", Some("domain/model.py")),
            edge("scripts/seed.py", "api.routes", Some("api/routes.py")),
            edge("domain/model.py", "os", None),
        ]);

        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].file, "domain/model.py");
        assert_eq!(violations[0].from_layer, "domain");
        assert_eq!(violations[0].to_layer, "api");
        assert_eq!(violations[0].imported_module, "api.routes");
    }

    #[test]
    fn test_unresolved_import_mapped_by_module_path() {
        let checker = ConventionChecker::new(&[
            layer("core", &["core/**"], &[]),
            layer("plugins", &["plugins/**"], &["core"]),
        ])
        .unwrap();

        let violations = checker.check_imports(&[
            edge("core/engine.py", "plugins.extra", None),
            edge("plugins/a/loader.py", "..b", None),
        ]);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].target_path, "plugins/extra.py");
    }

    #[test]
    fn test_check_against_index() {
        let dir = tempdir().unwrap();
        let db = IndexDatabase::open(dir.path().join("index.db")).unwrap();
        let config = Config::default();
        Indexer::new(
            db.clone(),
            Arc::new(ExtractorRegistry::default()),
            &config.indexing,
            config.rules.default_weight,
        )
        .run(
            &[
                SourceFile::new("domain/__init__.py", ""),
                SourceFile::new("domain/model.py", "from api import routes\n"),
                SourceFile::new("api/__init__.py", ""),
                SourceFile::new("api/routes.py", "from domain.model import Order\nfrom . import helpers\n"),
                SourceFile::new("api/helpers.py", "import json\n"),
            ],
            IndexMode::Incremental,
        )
        .unwrap();

        let checker = ConventionChecker::new(&[
            layer("domain", &["domain/**"], &[]),
            layer("api", &["api/**"], &["domain"]),
        ])
        .unwrap();
        let report = checker.check(&db).unwrap();

        assert_eq!(report.layers, 2);
        assert_eq!(report.imports_checked, 4);
        assert_eq!(report.violations.len(), 1);
        let violation = &report.violations[0];
        assert_eq!(violation.file, "domain/model.py");
        assert_eq!(violation.to_layer, "api");
    }

    #[test]
    fn test_bad_pattern_is_invalid_input() {
        assert!(matches!(
            ConventionChecker::new(&[layer("x", &["src/[a"], &[])]),
            Err(Error::InvalidInput(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_leaf_layers_flag_exactly_cross_layer_edges(
            edges in proptest::collection::vec((0usize..4, 0usize..4), 0..30),
        ) {
            let names = ["l0", "l1", "l2", "l3"];
            let configs: Vec<LayerConfig> = names
                .iter()
                .map(|n| layer(n, &[&format!("{}/**", n)], &[]))
                .collect();
            let checker = ConventionChecker::new(&configs).unwrap();

            let imports: Vec<ImportEdge> = edges
                .iter()
                .map(|(from, to)| {
                    let target = format!("{}/m.py", names[*to]);
                    edge(&format!("{}/a.py", names[*from]), &format!("{}.m", names[*to]), Some(&target))
                })
                .collect();

            let violations = checker.check_imports(&imports);
            let expected = edges.iter().filter(|(from, to)| from != to).count();
            prop_assert_eq!(violations.len(), expected);
            for v in &violations {
                prop_assert_ne!(&v.from_layer, &v.to_layer);
            }
        }
    }
}
