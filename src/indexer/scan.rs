// Project traversal: turns a directory into the file list the indexer reconciles

use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::PathFilter;
use crate::error::Result;
use crate::index::{ExtractorRegistry, SourceFile};

/// Project-relative path with `/` separators
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let rel = rel.to_string_lossy().replace('\\', "/");
    if rel.is_empty() {
        None
    } else {
        Some(rel)
    }
}

/// Collect every indexable file under `root`, sorted by path
pub fn scan_project(
    root: &Path,
    filter: &PathFilter,
    registry: &ExtractorRegistry,
) -> Result<Vec<SourceFile>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if !entry.file_type().is_dir() {
                return true;
            }
            match relative_path(root, entry.path()) {
                Some(rel) => !filter.excludes_dir(&rel),
                None => true,
            }
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative_path(root, entry.path()) else {
            continue;
        };
        if !filter.should_index(&rel) || registry.for_path(&rel).is_none() {
            continue;
        }

        match std::fs::read(entry.path()) {
            Ok(bytes) => {
                let content = match String::from_utf8(bytes) {
                    Ok(content) => content,
                    Err(e) => {
                        debug!("{} is not UTF-8, decoding lossily", rel);
                        String::from_utf8_lossy(e.as_bytes()).into_owned()
                    }
                };
                files.push(SourceFile::new(rel, content));
            }
            // Still on disk: hand it on so its stored facts are kept
            Err(e) => {
                warn!("Failed to read {}: {}", rel, e);
                files.push(SourceFile::unreadable(rel, e.to_string()));
            }
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    debug!("Scanned {} source file(s) under {}", files.len(), root.display());
    Ok(files)
}
