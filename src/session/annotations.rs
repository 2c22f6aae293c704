// Durable notes keyed by symbol stable id or file path

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::index::db::{file_by_path, now, IndexDatabase};
use crate::index::records::{row_to_annotation, Annotation, TargetType, ANNOTATION_COLUMNS};
use crate::query::engine::find_symbols;

const DEFAULT_AUTHOR: &str = "user";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAnnotation {
    pub target_type: TargetType,
    /// Stable id or symbol name for symbols, project-relative path for files
    pub target_id: String,
    pub text: String,
    pub author: Option<String>,
}

pub struct AnnotationStore {
    db: IndexDatabase,
}

impl AnnotationStore {
    pub fn new(db: IndexDatabase) -> Self {
        Self { db }
    }

    /// Attach a note to a live symbol or file
    pub fn annotate(&self, note: NewAnnotation) -> Result<Annotation> {
        if note.text.trim().is_empty() {
            return Err(Error::InvalidInput("annotation text cannot be empty".to_string()));
        }
        let author = note.author.as_deref().unwrap_or(DEFAULT_AUTHOR);

        self.db.write("annotations", |tx| {
            let target_id = match note.target_type {
                TargetType::Symbol => symbol_target(tx, &note.target_id)?,
                TargetType::File => {
                    let path = note.target_id.replace('\\', "/");
                    file_by_path(tx, &path)?.ok_or_else(|| Error::not_found("file", &path))?;
                    path
                }
            };
            tx.execute(
                "INSERT INTO annotations (target_type, target_id, text, author, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![note.target_type.as_str(), target_id, note.text, author, now()],
            )?;
            let id = tx.last_insert_rowid();
            debug!("Annotated {} {}", note.target_type.as_str(), target_id);
            annotation_by_id(tx, id)?.ok_or_else(|| Error::not_found("annotation", id.to_string()))
        })
    }

    /// Notes on one target, attached or not
    pub fn list(&self, target_type: TargetType, target_id: &str) -> Result<Vec<Annotation>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM annotations WHERE target_type = ?1 AND target_id = ?2
                 ORDER BY created_at, annotation_id",
                ANNOTATION_COLUMNS
            ))?;
            let annotations = stmt
                .query_map(params![target_type.as_str(), target_id], row_to_annotation)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(annotations)
        })
    }

    /// Notes whose target disappeared
    pub fn orphaned(&self) -> Result<Vec<Annotation>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM annotations WHERE orphaned = 1
                 ORDER BY orphaned_at, annotation_id",
                ANNOTATION_COLUMNS
            ))?;
            let annotations = stmt
                .query_map([], row_to_annotation)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(annotations)
        })
    }
}

/// Accept a stable id directly, or a name that matches exactly one symbol
fn symbol_target(conn: &Connection, target: &str) -> Result<String> {
    let by_id: Option<String> = conn
        .query_row(
            "SELECT stable_id FROM symbols WHERE stable_id = ?1",
            [target],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(stable_id) = by_id {
        return Ok(stable_id);
    }

    let mut matches = find_symbols(conn, target, None)?;
    match matches.len() {
        0 => Err(Error::not_found("symbol", target)),
        1 => Ok(matches.remove(0).stable_id),
        n => Err(Error::InvalidInput(format!(
            "{} matches {} symbols; use a qualified name or stable id",
            target, n
        ))),
    }
}

fn annotation_by_id(conn: &Connection, id: i64) -> Result<Option<Annotation>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM annotations WHERE annotation_id = ?1", ANNOTATION_COLUMNS),
            [id],
            row_to_annotation,
        )
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::index::{ExtractorRegistry, SourceFile};
    use crate::indexer::{IndexMode, Indexer};
    use crate::query::engine::QueryEngine;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn setup(files: &[SourceFile]) -> (tempfile::TempDir, IndexDatabase, Indexer, AnnotationStore) {
        let dir = tempdir().unwrap();
        let db = IndexDatabase::open(dir.path().join("index.db")).unwrap();
        let config = Config::default();
        let indexer = Indexer::new(
            db.clone(),
            Arc::new(ExtractorRegistry::default()),
            &config.indexing,
            config.rules.default_weight,
        );
        indexer.run(files, IndexMode::Incremental).unwrap();
        let store = AnnotationStore::new(db.clone());
        (dir, db, indexer, store)
    }

    fn note(target_type: TargetType, target_id: &str, text: &str) -> NewAnnotation {
        NewAnnotation {
            target_type,
            target_id: target_id.to_string(),
            text: text.to_string(),
            author: None,
        }
    }

    #[test]
    fn test_annotation_survives_edit() {
        let (_dir, db, indexer, store) = setup(&[SourceFile::new("b.py", "def g():\n    return 1\n")]);

        let annotation = store.annotate(note(TargetType::Symbol, "g", "keep it pure")).unwrap();
        assert_eq!(annotation.author, "user");

        indexer
            .run(
                &[SourceFile::new("b.py", "\n\ndef g():\n    return 2\n")],
                IndexMode::Incremental,
            )
            .unwrap();

        let context = QueryEngine::new(db).get_context("g", None).unwrap().unwrap();
        assert_eq!(context.annotations.len(), 1);
        assert_eq!(context.annotations[0].annotation_id, annotation.annotation_id);
        assert!(store.orphaned().unwrap().is_empty());
    }

    #[test]
    fn test_rename_orphans_annotation() {
        let (_dir, db, indexer, store) = setup(&[
            SourceFile::new("a.py", "def f():\n    return g()\n"),
            SourceFile::new("b.py", "def g():\n    return 1\n"),
        ]);
        let annotation = store.annotate(note(TargetType::Symbol, "g", "hot path")).unwrap();
        let old_id = annotation.target_id.clone();

        indexer
            .run(
                &[
                    SourceFile::new("a.py", "def f():\n    return g()\n"),
                    SourceFile::new("b.py", "def g2():\n    return 1\n"),
                ],
                IndexMode::Incremental,
            )
            .unwrap();

        let engine = QueryEngine::new(db);
        assert!(engine.get_context("g", None).unwrap().is_none());
        let renamed = engine.get_context("g2", None).unwrap().unwrap();
        assert_ne!(renamed.symbol.stable_id, old_id);

        let orphaned = store.orphaned().unwrap();
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].annotation_id, annotation.annotation_id);
        assert!(orphaned[0].orphaned_at.is_some());
        assert_eq!(store.list(TargetType::Symbol, &old_id).unwrap().len(), 1);
    }

    #[test]
    fn test_file_annotation_reattaches() {
        let (_dir, _db, indexer, store) = setup(&[SourceFile::new("cfg.py", "DEBUG = False\n")]);
        store.annotate(note(TargetType::File, "cfg.py", "deploy flags")).unwrap();

        indexer.run(&[], IndexMode::Incremental).unwrap();
        assert_eq!(store.orphaned().unwrap().len(), 1);

        indexer
            .run(&[SourceFile::new("cfg.py", "DEBUG = True\n")], IndexMode::Incremental)
            .unwrap();
        assert!(store.orphaned().unwrap().is_empty());
    }

    #[test]
    fn test_annotate_missing_or_ambiguous_target() {
        let (_dir, _db, _indexer, store) = setup(&[SourceFile::new(
            "m.py",
            "class A:\n    def run(self):\n        pass\n\nclass B:\n    def run(self):\n        pass\n",
        )]);

        assert!(matches!(
            store.annotate(note(TargetType::Symbol, "missing", "x")),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            store.annotate(note(TargetType::File, "nope.py", "x")),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            store.annotate(note(TargetType::Symbol, "run", "x")),
            Err(Error::InvalidInput(_))
        ));
        assert!(store.annotate(note(TargetType::Symbol, "B.run", "x")).is_ok());
        assert!(matches!(
            store.annotate(note(TargetType::Symbol, "B.run", "  ")),
            Err(Error::InvalidInput(_))
        ));
    }
}
