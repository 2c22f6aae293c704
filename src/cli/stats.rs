use anyhow::Result;
use std::path::Path;

use codelens::config::Config;
use codelens::indexer::{KNOWLEDGE_CREATED_AT, KNOWLEDGE_LAST_REBUILD};
use codelens::ExtractorRegistry;

use super::{open_index, print_json, OutputFormat};

pub async fn show_stats(project: String, config: Config, format: OutputFormat) -> Result<()> {
    let index = open_index(&project, config)?;
    let stats = index.stats()?;
    let created_at = index.knowledge(KNOWLEDGE_CREATED_AT)?;
    let last_rebuild = index.knowledge(KNOWLEDGE_LAST_REBUILD)?;
    let db_size = get_db_size(index.database().path());

    if format == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "stats": stats,
            "created_at": created_at,
            "last_rebuild": last_rebuild,
            "db_size_bytes": db_size,
        }));
    }

    println!("Index statistics for {}", index.root().display());
    println!("  Files:        {} ({} with parse errors)", stats.files, stats.errored_files);
    println!("  Symbols:      {}", stats.symbols);
    println!(
        "  Calls:        {} ({} resolved, {} unresolved)",
        stats.calls,
        stats.resolved_calls,
        stats.calls.saturating_sub(stats.resolved_calls)
    );
    println!("  Refs:         {}", stats.refs);
    println!("  Imports:      {} ({} resolved)", stats.imports, stats.resolved_imports);
    println!("  Rules:        {}", stats.rules);
    println!("  Open diags:   {}", stats.open_diagnostics);
    println!(
        "  Annotations:  {} ({} orphaned)",
        stats.annotations, stats.orphaned_annotations
    );
    if let Some(size) = db_size {
        println!("  Index size:   {:.2} MB", size as f64 / (1024.0 * 1024.0));
    }
    if let Some(created_at) = created_at {
        println!("  Created:      {}", created_at);
    }
    if let Some(rebuild) = last_rebuild {
        println!("  Last rebuild: {}", rebuild);
    }

    Ok(())
}

fn get_db_size(db_path: &Path) -> Option<u64> {
    std::fs::metadata(db_path).map(|m| m.len()).ok()
}

pub fn list_languages(format: OutputFormat) -> Result<()> {
    let registry = ExtractorRegistry::default();
    let languages = registry.languages();

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "languages": languages,
            "extractor_version": registry.version_tag(),
        }))?,
        OutputFormat::Text => {
            println!("Supported languages:");
            for language in languages {
                println!("  {}", language);
            }
        }
    }

    Ok(())
}
