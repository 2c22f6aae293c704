use anyhow::Result;

use codelens::config::Config;
use codelens::query::ImpactReport;
use codelens::SymbolKind;

use super::{open_index, print_json, OutputFormat};

pub async fn analyze_impact(
    project: String,
    config: Config,
    name: String,
    kind: Option<SymbolKind>,
    depth: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let index = open_index(&project, config)?;
    let report = index.get_impact(&name, kind, depth)?;

    match (format, report) {
        (OutputFormat::Json, report) => print_json(&report)?,
        (OutputFormat::Text, None) => println!("No symbol named '{}'", name),
        (OutputFormat::Text, Some(report)) => print_impact(&name, &report),
    }

    Ok(())
}

fn print_impact(name: &str, report: &ImpactReport) {
    println!("Impact of changing '{}'", name);
    for seed in &report.seeds {
        println!("  seed: {} ({}) {}:{}", seed.qualified_name, seed.kind.as_str(), seed.path, seed.line);
    }

    if report.affected.is_empty() {
        println!("\nNo callers found - safe to change");
        return;
    }

    println!(
        "\n{} affected symbol(s) in {} file(s):",
        report.affected.len(),
        report.files.len()
    );
    let mut depth = 0;
    for affected in &report.affected {
        if affected.depth != depth {
            depth = affected.depth;
            println!("  depth {}:", depth);
        }
        let symbol = &affected.symbol;
        println!("    {} {}:{}", symbol.qualified_name, symbol.path, symbol.line);
    }

    if report.truncated {
        println!("\nStopped at the node limit; the list is incomplete");
    }
    if report.depth_limited {
        println!(
            "\nMore callers exist beyond depth {}; rerun with a larger --depth",
            report.max_depth
        );
    }
}
