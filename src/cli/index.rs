use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use codelens::config::Config;
use codelens::indexer::watcher::start_watcher;
use codelens::{IndexMode, IndexReport};

use super::{open_index, print_json, OutputFormat};

pub async fn index_project(
    project: String,
    config: Config,
    full: bool,
    watch: bool,
    format: OutputFormat,
) -> Result<()> {
    let should_watch = watch || config.indexing.watch;
    let index = Arc::new(open_index(&project, config)?);
    let mode = if full { IndexMode::Full } else { IndexMode::Incremental };
    info!("Indexing {} ({})", index.root().display(), mode.as_str());

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")?);
    spinner.set_message(format!("Indexing {}", index.root().display()));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let worker = Arc::clone(&index);
    let result = tokio::task::spawn_blocking(move || worker.index_project(mode))
        .await
        .context("Indexing task panicked")?;
    spinner.finish_and_clear();
    let report = result.context("Indexing failed")?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => print_report(&report),
    }

    if should_watch {
        println!("\nWatching for changes. Press Ctrl+C to stop.");
        start_watcher(index).await?;
    }

    Ok(())
}

fn print_report(report: &IndexReport) {
    println!("Indexing complete ({}, {} ms)", report.mode.as_str(), report.duration_ms);
    println!("  Added:     {}", report.added.len());
    println!("  Modified:  {}", report.modified.len());
    println!("  Removed:   {}", report.removed.len());
    println!("  Unchanged: {}", report.unchanged);

    if !report.errored.is_empty() {
        println!("\n{} file(s) could not be parsed:", report.errored.len());
        for error in &report.errored {
            match error.line {
                Some(line) => println!("  {}:{} - {}", error.path, line, error.message),
                None => println!("  {} - {}", error.path, error.message),
            }
        }
    }
}
