// CLI command implementations

pub mod conventions;
pub mod diagnostics;
pub mod impact;
pub mod index;
pub mod query;
pub mod session;
pub mod stats;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;
use std::path::Path;

use codelens::config::Config;
use codelens::index::records::{DiagnosticStatus, Severity};
use codelens::{CodeIndex, SymbolKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Open the project's index, creating it if needed
pub fn open_index(project: &str, config: Config) -> Result<CodeIndex> {
    let root = Path::new(project);
    let root = root
        .canonicalize()
        .with_context(|| format!("Project directory not found: {}", project))?;
    CodeIndex::open(&root, config)
        .with_context(|| format!("Failed to open index for {}", root.display()))
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Inline SQL, or `@path` to read it from a file
pub fn read_query(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read query file {}", path)),
        None => Ok(arg.to_string()),
    }
}

pub fn parse_kind(s: &str) -> std::result::Result<SymbolKind, String> {
    SymbolKind::parse(&s.to_lowercase()).ok_or_else(|| {
        format!("unknown kind '{}' (function, method, class, interface, enum, module, variable)", s)
    })
}

pub fn parse_severity(s: &str) -> std::result::Result<Severity, String> {
    Severity::parse(&s.to_lowercase())
        .ok_or_else(|| format!("unknown severity '{}' (error, warning, info)", s))
}

pub fn parse_status(s: &str) -> std::result::Result<DiagnosticStatus, String> {
    DiagnosticStatus::parse(&s.to_lowercase())
        .ok_or_else(|| format!("unknown status '{}' (open, resolved, ignored)", s))
}
