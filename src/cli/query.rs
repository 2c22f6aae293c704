use anyhow::Result;

use codelens::config::Config;
use codelens::index::records::{CallEdge, SymbolRef};
use codelens::query::{FileSummary, ImportGraph, SearchFilters, SymbolContext};
use codelens::SymbolKind;

use super::{open_index, print_json, OutputFormat};

pub async fn show_context(
    project: String,
    config: Config,
    name: String,
    kind: Option<SymbolKind>,
    format: OutputFormat,
) -> Result<()> {
    let index = open_index(&project, config)?;
    let context = index.get_context(&name, kind)?;

    match (format, context) {
        (OutputFormat::Json, context) => print_json(&context)?,
        (OutputFormat::Text, None) => println!("No symbol named '{}'", name),
        (OutputFormat::Text, Some(context)) => print_context(&context),
    }

    Ok(())
}

fn describe(symbol: &SymbolRef) -> String {
    format!("{} ({}) {}:{}", symbol.qualified_name, symbol.kind.as_str(), symbol.path, symbol.line)
}

fn print_context(context: &SymbolContext) {
    let symbol = &context.symbol;
    println!("{} {}", symbol.kind.as_str(), symbol.qualified_name);
    println!("  {}:{}-{}", symbol.path, symbol.start_line, symbol.end_line);
    if let Some(signature) = &symbol.signature {
        println!("  signature:  {}", signature);
    }
    println!("  complexity: {}", symbol.complexity);
    println!("  stable id:  {}", symbol.stable_id);
    if let Some(docstring) = &symbol.docstring {
        println!("\n  {}", docstring.lines().next().unwrap_or_default());
    }

    print_edges("Callers", &context.callers, |edge| match &edge.caller {
        Some(caller) => format!("{} at {}:{}", describe(caller), edge.path, edge.line),
        None => format!("<module> at {}:{}", edge.path, edge.line),
    });
    print_edges("Callees", &context.callees, |edge| match &edge.resolved {
        Some(target) => format!("{} -> {}", edge.callee_expr, describe(target)),
        None => format!("{} (unresolved) at {}:{}", edge.callee_expr, edge.path, edge.line),
    });

    if !context.refs.is_empty() {
        println!("\nReferences ({}):", context.refs.len());
        for r in &context.refs {
            println!("  {} {} at {}:{}", r.kind.as_str(), r.target, r.path, r.line);
        }
    }
    if !context.annotations.is_empty() {
        println!("\nAnnotations:");
        for note in &context.annotations {
            println!("  [{}] {} ({})", note.author, note.text, note.created_at);
        }
    }
    if !context.diagnostics.is_empty() {
        println!("\nOpen diagnostics:");
        for diag in &context.diagnostics {
            println!(
                "  {} {} line {}: {}",
                diag.severity.as_str(),
                diag.rule_id,
                diag.line,
                diag.message
            );
        }
    }
    if !context.other_matches.is_empty() {
        println!("\nOther matches:");
        for other in &context.other_matches {
            println!("  {}", describe(other));
        }
    }
}

fn print_edges(title: &str, edges: &[CallEdge], line: impl Fn(&CallEdge) -> String) {
    if edges.is_empty() {
        println!("\n{}: none", title);
        return;
    }
    println!("\n{} ({}):", title, edges.len());
    for edge in edges {
        println!("  {}", line(edge));
    }
}

pub async fn search(
    project: String,
    config: Config,
    query: String,
    kind: Option<SymbolKind>,
    path_prefix: Option<String>,
    limit: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let index = open_index(&project, config)?;
    let filters = SearchFilters {
        kind,
        path_prefix,
        limit,
    };
    let hits = index.search(&query, &filters)?;

    match format {
        OutputFormat::Json => print_json(&hits)?,
        OutputFormat::Text if hits.is_empty() => println!("No results for '{}'", query),
        OutputFormat::Text => {
            println!("Found {} result(s):", hits.len());
            for hit in &hits {
                println!("  {:>6.2}  {}", hit.score, describe(&hit.symbol));
                if let Some(doc) = hit.docstring.as_deref().and_then(|d| d.lines().next()) {
                    println!("          {}", doc);
                }
            }
        }
    }

    Ok(())
}

pub async fn file_summary(
    project: String,
    config: Config,
    path: String,
    format: OutputFormat,
) -> Result<()> {
    let index = open_index(&project, config)?;
    let summary = index.file_summary(&path)?;

    match (format, summary) {
        (OutputFormat::Json, summary) => print_json(&summary)?,
        (OutputFormat::Text, None) => println!("'{}' is not indexed", path),
        (OutputFormat::Text, Some(summary)) => print_file_summary(&summary),
    }

    Ok(())
}

fn print_file_summary(summary: &FileSummary) {
    let file = &summary.file;
    println!("{} ({}, {} lines)", file.path, file.language, file.line_count);
    println!("  module: {}", file.module);
    if let Some(error) = &file.parse_error {
        println!("  parse error: {}", error);
    }

    println!("\nSymbols ({}):", summary.symbols.len());
    for symbol in &summary.symbols {
        println!(
            "  {:<9} {} {}-{}",
            symbol.kind.as_str(),
            symbol.qualified_name,
            symbol.start_line,
            symbol.end_line
        );
    }

    if !summary.imports.is_empty() {
        println!("\nImports ({}):", summary.imports.len());
        for import in &summary.imports {
            let target = import.resolved_path.as_deref().unwrap_or("(external)");
            if import.names.is_empty() {
                println!("  line {}: {} -> {}", import.line, import.module, target);
            } else {
                println!(
                    "  line {}: {} [{}] -> {}",
                    import.line,
                    import.module,
                    import.names.join(", "),
                    target
                );
            }
        }
    }
    if !summary.annotations.is_empty() {
        println!("\nAnnotations:");
        for note in &summary.annotations {
            println!("  {} {}: {}", note.target_type.as_str(), note.author, note.text);
        }
    }
    if !summary.diagnostics.is_empty() {
        println!("\nOpen diagnostics:");
        for diag in &summary.diagnostics {
            println!(
                "  {} {} line {}: {}",
                diag.severity.as_str(),
                diag.rule_id,
                diag.line,
                diag.message
            );
        }
    }
}

pub async fn imports(
    project: String,
    config: Config,
    path_filter: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let index = open_index(&project, config)?;
    let graph = index.imports_graph(path_filter.as_deref())?;

    match format {
        OutputFormat::Json => print_json(&graph)?,
        OutputFormat::Text => print_import_graph(&graph),
    }

    Ok(())
}

fn print_import_graph(graph: &ImportGraph) {
    if graph.edges.is_empty() {
        println!("No imports");
        return;
    }
    println!("{} file(s), {} import(s):", graph.nodes.len(), graph.edges.len());
    let mut current = "";
    for edge in &graph.edges {
        if edge.path != current {
            current = &edge.path;
            println!("\n{}", current);
        }
        match &edge.resolved_path {
            Some(target) => println!("  {:>4}  {} -> {}", edge.line, edge.module, target),
            None => println!("  {:>4}  {} (external)", edge.line, edge.module),
        }
    }
}
