// Core operation surface for one project index

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{Config, PathFilter, DB_FILE};
use crate::conventions::{ConventionChecker, ConventionReport};
use crate::error::{Error, Result};
use crate::index::db::IndexDatabase;
use crate::index::records::{
    Annotation, ChangeLogEntry, Diagnostic, DiagnosticStatus, IndexStats, Rule, RuleRun, Session,
    TargetType,
};
use crate::index::schema::{SchemaState, SCHEMA_VERSION};
use crate::index::{ExtractorRegistry, SourceFile, SymbolKind};
use crate::indexer::scan::scan_project;
use crate::indexer::{IndexMode, IndexReport, Indexer, EXTRACTOR_VERSION_KEY};
use crate::query::{
    get_impact, FileSummary, ImportGraph, ImpactReport, QueryEngine, SearchFilters, SearchHit,
    SymbolContext,
};
use crate::rules::{
    DiagnosticFilter, DiagnosticsReport, NewRule, RuleEffectiveness, RuleEngine, RulePreview,
};
use crate::session::{AnnotationStore, NewAnnotation, SessionTracker};

/// Why the stored index cannot be used as is
#[derive(Debug, Clone, PartialEq, Eq)]
enum Staleness {
    Fresh,
    /// Layout must be dropped and rebuilt
    IncompatibleSchema { found: i64 },
    /// Facts must be re-extracted; identities and user data survive
    ExtractorChanged { found: String },
}

/// One project's index and every operation on it
pub struct CodeIndex {
    root: PathBuf,
    config: Config,
    filter: PathFilter,
    db: IndexDatabase,
    registry: Arc<ExtractorRegistry>,
}

impl CodeIndex {
    /// Open (or create) the index at `<root>/.codelens.db`
    pub fn open(root: impl AsRef<Path>, config: Config) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let db_path = root.join(DB_FILE);
        Self::open_with(root, config, db_path, Arc::new(ExtractorRegistry::default()))
    }

    pub fn open_with(
        root: impl Into<PathBuf>,
        config: Config,
        db_path: impl AsRef<Path>,
        registry: Arc<ExtractorRegistry>,
    ) -> Result<Self> {
        let filter = config
            .path_filter()
            .map_err(|e| Error::InvalidInput(format!("bad include/exclude pattern: {}", e)))?;
        let db = IndexDatabase::open(db_path)?;
        Ok(Self {
            root: root.into(),
            config,
            filter,
            db,
            registry,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &IndexDatabase {
        &self.db
    }

    /// True when `rel_path` passes the filters and has an extractor
    pub fn can_index(&self, rel_path: &str) -> bool {
        self.filter.should_index(rel_path) && self.registry.for_path(rel_path).is_some()
    }

    fn staleness(&self) -> Result<Staleness> {
        if let SchemaState::Incompatible { found } = self.db.schema_state() {
            return Ok(Staleness::IncompatibleSchema { found });
        }
        match self.db.meta(EXTRACTOR_VERSION_KEY)? {
            Some(found) if found != self.registry.version_tag() => {
                Ok(Staleness::ExtractorChanged { found })
            }
            _ => Ok(Staleness::Fresh),
        }
    }

    /// Refuse to serve anything but `index` from a stale store
    fn ensure_current(&self) -> Result<()> {
        let expected_extractor = self.registry.version_tag();
        match self.staleness()? {
            Staleness::Fresh => Ok(()),
            Staleness::IncompatibleSchema { found } => Err(Error::SchemaVersion {
                found_schema: found,
                expected_schema: SCHEMA_VERSION,
                found_extractor: String::new(),
                expected_extractor,
            }),
            Staleness::ExtractorChanged { found } => Err(Error::SchemaVersion {
                found_schema: SCHEMA_VERSION,
                expected_schema: SCHEMA_VERSION,
                found_extractor: found,
                expected_extractor,
            }),
        }
    }

    /// Reconcile the store with `files`; a stale store forces a full rebuild
    pub fn index(&self, mode: IndexMode, files: &[SourceFile]) -> Result<IndexReport> {
        let mode = match self.staleness()? {
            Staleness::Fresh => mode,
            Staleness::IncompatibleSchema { found } => {
                warn!(
                    "Index schema v{} cannot be migrated to v{}; rebuilding from scratch",
                    found, SCHEMA_VERSION
                );
                self.db.reset_schema()?;
                IndexMode::Full
            }
            Staleness::ExtractorChanged { found } => {
                warn!(
                    "Extractor changed ({} -> {}); re-extracting every file",
                    found,
                    self.registry.version_tag()
                );
                IndexMode::Full
            }
        };

        let indexer = Indexer::new(
            self.db.clone(),
            Arc::clone(&self.registry),
            &self.config.indexing,
            self.config.rules.default_weight,
        );
        indexer.run(files, mode)
    }

    /// Scan the project directory and index what it contains
    pub fn index_project(&self, mode: IndexMode) -> Result<IndexReport> {
        let files = scan_project(&self.root, &self.filter, &self.registry)?;
        info!("Indexing {} file(s) under {}", files.len(), self.root.display());
        self.index(mode, &files)
    }

    pub fn get_context(&self, name: &str, kind: Option<SymbolKind>) -> Result<Option<SymbolContext>> {
        self.ensure_current()?;
        QueryEngine::new(self.db.clone()).get_context(name, kind)
    }

    pub fn get_impact(
        &self,
        name: &str,
        kind: Option<SymbolKind>,
        max_depth: Option<usize>,
    ) -> Result<Option<ImpactReport>> {
        self.ensure_current()?;
        let max_depth = max_depth.unwrap_or(self.config.query.max_depth);
        get_impact(&self.db, name, kind, max_depth, self.config.query.max_nodes)
    }

    pub fn search(&self, query: &str, filters: &SearchFilters) -> Result<Vec<SearchHit>> {
        self.ensure_current()?;
        QueryEngine::new(self.db.clone()).search(query, filters, self.config.query.search_limit)
    }

    /// `Ok(None)` when `path` is not indexed
    pub fn file_summary(&self, path: &str) -> Result<Option<FileSummary>> {
        self.ensure_current()?;
        QueryEngine::new(self.db.clone()).file_summary(path)
    }

    pub fn imports_graph(&self, path_filter: Option<&str>) -> Result<ImportGraph> {
        self.ensure_current()?;
        QueryEngine::new(self.db.clone()).imports_graph(path_filter)
    }

    fn rules_engine(&self) -> RuleEngine {
        RuleEngine::new(self.db.clone(), self.config.rules.clone())
    }

    pub fn run_diagnostics(&self, rule_id: Option<&str>) -> Result<DiagnosticsReport> {
        self.ensure_current()?;
        self.rules_engine().run(rule_id)
    }

    pub fn add_rule(&self, rule: NewRule) -> Result<Rule> {
        self.ensure_current()?;
        self.rules_engine().add_rule(rule)
    }

    pub fn test_rule(&self, query: &str) -> Result<RulePreview> {
        self.ensure_current()?;
        self.rules_engine().test_rule(query)
    }

    pub fn rate_rule(&self, rule_id: &str, useful: bool) -> Result<Rule> {
        self.ensure_current()?;
        self.rules_engine().rate(rule_id, useful)
    }

    pub fn rules(&self) -> Result<Vec<Rule>> {
        self.ensure_current()?;
        self.rules_engine().rules()
    }

    /// Most recent runs of one rule, newest first
    pub fn rule_runs(&self, rule_id: &str, limit: usize) -> Result<Vec<RuleRun>> {
        self.ensure_current()?;
        self.rules_engine().runs(rule_id, limit)
    }

    pub fn rule_effectiveness(&self) -> Result<Vec<RuleEffectiveness>> {
        self.ensure_current()?;
        self.rules_engine().effectiveness()
    }

    pub fn diagnostics(&self, filter: &DiagnosticFilter) -> Result<Vec<Diagnostic>> {
        self.ensure_current()?;
        self.rules_engine().list_diagnostics(filter)
    }

    pub fn set_diagnostic_status(&self, diag_id: i64, status: DiagnosticStatus) -> Result<Diagnostic> {
        self.ensure_current()?;
        self.rules_engine().set_diagnostic_status(diag_id, status)
    }

    pub fn check_conventions(&self) -> Result<ConventionReport> {
        self.ensure_current()?;
        ConventionChecker::new(&self.config.layers)?.check(&self.db)
    }

    pub fn start_session(&self, transcript_path: Option<&str>) -> Result<Session> {
        self.ensure_current()?;
        SessionTracker::new(self.db.clone()).start(transcript_path)
    }

    pub fn end_session(&self, summary: Option<&str>) -> Result<Option<Session>> {
        self.ensure_current()?;
        SessionTracker::new(self.db.clone()).end(summary)
    }

    pub fn active_session(&self) -> Result<Option<Session>> {
        self.ensure_current()?;
        SessionTracker::new(self.db.clone()).active()
    }

    pub fn session_history(&self, limit: usize) -> Result<Vec<Session>> {
        self.ensure_current()?;
        SessionTracker::new(self.db.clone()).history(limit)
    }

    pub fn session_changes(&self, session_id: i64) -> Result<Vec<ChangeLogEntry>> {
        self.ensure_current()?;
        SessionTracker::new(self.db.clone()).changes(session_id)
    }

    pub fn annotate(&self, note: NewAnnotation) -> Result<Annotation> {
        self.ensure_current()?;
        AnnotationStore::new(self.db.clone()).annotate(note)
    }

    /// Notes on one symbol stable id or file path, orphaned ones included
    pub fn annotations(&self, target_type: TargetType, target_id: &str) -> Result<Vec<Annotation>> {
        self.ensure_current()?;
        AnnotationStore::new(self.db.clone()).list(target_type, target_id)
    }

    pub fn orphaned_annotations(&self) -> Result<Vec<Annotation>> {
        self.ensure_current()?;
        AnnotationStore::new(self.db.clone()).orphaned()
    }

    pub fn stats(&self) -> Result<IndexStats> {
        self.ensure_current()?;
        self.db.stats()
    }

    /// Lifecycle metadata such as `index.created_at`
    pub fn knowledge(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.ensure_current()?;
        self.db.knowledge(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractionError;
    use crate::index::records::Severity;
    use crate::index::{ExtractedFacts, Extractor};
    use crate::indexer::parser::PythonExtractor;
    use crate::indexer::KNOWLEDGE_CREATED_AT;
    use std::fs;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    /// Python extractor reporting a different version
    struct BumpedPython(PythonExtractor);

    impl Extractor for BumpedPython {
        fn language(&self) -> &'static str {
            self.0.language()
        }
        fn version(&self) -> u32 {
            self.0.version() + 1
        }
        fn can_extract(&self, path: &str) -> bool {
            self.0.can_extract(path)
        }
        fn extract(&self, path: &str, content: &str) -> std::result::Result<ExtractedFacts, ExtractionError> {
            self.0.extract(path, content)
        }
    }

    #[test]
    fn test_end_to_end_project() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(root, "a.py", "from b import g\n\ndef f():\n    return g()\n");
        write(root, "b.py", "def g():\n    \"\"\"The answer.\"\"\"\n    return 42\n");

        let index = CodeIndex::open(root, Config::default()).unwrap();
        let report = index.index_project(IndexMode::Incremental).unwrap();
        assert_eq!(report.added.len(), 2);
        assert!(root.join(DB_FILE).exists());

        let context = index.get_context("g", None).unwrap().unwrap();
        assert_eq!(context.callers.len(), 1);
        assert_eq!(context.callers[0].caller.as_ref().unwrap().qualified_name, "f");

        let impact = index.get_impact("g", None, None).unwrap().unwrap();
        let affected: Vec<&str> = impact
            .affected
            .iter()
            .map(|a| a.symbol.qualified_name.as_str())
            .collect();
        assert_eq!(affected, vec!["f"]);
        assert_eq!(impact.files.iter().collect::<Vec<_>>(), vec!["a.py"]);

        let hits = index.search("answer", &SearchFilters::default()).unwrap();
        assert_eq!(hits[0].symbol.qualified_name, "g");

        let summary = index.file_summary("a.py").unwrap().unwrap();
        assert_eq!(summary.symbols[0].qualified_name, "f");
        assert_eq!(summary.imports[0].resolved_path.as_deref(), Some("b.py"));
        assert!(index.file_summary("c.py").unwrap().is_none());
        let graph = index.imports_graph(None).unwrap();
        assert_eq!(graph.nodes, vec!["a.py".to_string(), "b.py".to_string()]);

        // Nothing changed on disk
        let report = index.index_project(IndexMode::Incremental).unwrap();
        assert_eq!(report.changed(), 0);
        assert_eq!(report.unchanged, 2);
        assert!(index.knowledge(KNOWLEDGE_CREATED_AT).unwrap().is_some());
    }

    #[test]
    fn test_rules_sessions_and_annotations_through_facade() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(root, "calc.py", "import scipy\n\ndef solve():\n    return scipy\n");
        let index = CodeIndex::open(root, Config::default()).unwrap();

        let session = index.start_session(None).unwrap();
        index.index_project(IndexMode::Incremental).unwrap();

        index
            .add_rule(NewRule {
                rule_id: "EARLY_SCIPY".to_string(),
                name: "Early scipy import".to_string(),
                description: String::new(),
                query: "SELECT f.path AS path, i.line AS line FROM imports i
                        JOIN files f ON f.file_id = i.file_id WHERE i.module = 'scipy'"
                    .to_string(),
                severity: Severity::Info,
                learned_from: None,
            })
            .unwrap();
        let report = index.run_diagnostics(Some("EARLY_SCIPY")).unwrap();
        assert_eq!(report.new_diagnostics(), 1);
        let rated = index.rate_rule("EARLY_SCIPY", true).unwrap();
        assert!((rated.weight - 0.65).abs() < 1e-9);

        index
            .annotate(NewAnnotation {
                target_type: TargetType::File,
                target_id: "calc.py".to_string(),
                text: "numerics entry point".to_string(),
                author: Some("reviewer".to_string()),
            })
            .unwrap();

        assert_eq!(index.annotations(TargetType::File, "calc.py").unwrap().len(), 1);
        assert_eq!(index.rule_runs("EARLY_SCIPY", 5).unwrap().len(), 1);
        assert_eq!(index.active_session().unwrap().unwrap().session_id, session.session_id);

        let ended = index.end_session(Some("added scipy rule")).unwrap().unwrap();
        assert_eq!(ended.session_id, session.session_id);
        assert_eq!(ended.change_count, 1);
        assert_eq!(index.session_changes(session.session_id).unwrap()[0].path, "calc.py");
        assert!(index.check_conventions().unwrap().violations.is_empty());
    }

    #[test]
    fn test_extractor_change_blocks_queries_until_rebuild() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(root, "b.py", "def g():\n    return 1\n");

        let index = CodeIndex::open(root, Config::default()).unwrap();
        index.index_project(IndexMode::Incremental).unwrap();
        let stable_id = index.get_context("g", None).unwrap().unwrap().symbol.stable_id;
        drop(index);

        let mut registry = ExtractorRegistry::empty();
        registry.register(Box::new(BumpedPython(PythonExtractor::new())));
        let index = CodeIndex::open_with(
            root,
            Config::default(),
            root.join(DB_FILE),
            Arc::new(registry),
        )
        .unwrap();

        assert!(matches!(
            index.get_context("g", None),
            Err(Error::SchemaVersion { .. })
        ));
        assert!(matches!(index.stats(), Err(Error::SchemaVersion { .. })));

        let report = index.index_project(IndexMode::Incremental).unwrap();
        assert_eq!(report.mode, IndexMode::Full);
        let context = index.get_context("g", None).unwrap().unwrap();
        assert_eq!(context.symbol.stable_id, stable_id);
    }

    #[test]
    fn test_incompatible_schema_is_rebuilt() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(root, "b.py", "def g():\n    return 1\n");
        {
            let conn = rusqlite::Connection::open(root.join(DB_FILE)).unwrap();
            conn.execute_batch("CREATE TABLE legacy_nodes (id TEXT);").unwrap();
        }

        let index = CodeIndex::open(root, Config::default()).unwrap();
        assert!(matches!(index.search("g", &SearchFilters::default()), Err(Error::SchemaVersion { .. })));

        let report = index.index_project(IndexMode::Incremental).unwrap();
        assert_eq!(report.mode, IndexMode::Full);
        assert_eq!(report.added, vec!["b.py".to_string()]);
        assert!(index.get_context("g", None).unwrap().is_some());
    }

    #[test]
    fn test_can_index_respects_filters() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.indexing.exclude.push("**/migrations/**".to_string());
        let index = CodeIndex::open(dir.path(), config).unwrap();

        assert!(index.can_index("app/models.py"));
        assert!(!index.can_index("app/migrations/0001.py"));
        assert!(!index.can_index("README.md"));
    }
}
