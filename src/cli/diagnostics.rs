use anyhow::{Context, Result};

use codelens::config::Config;
use codelens::index::records::{Diagnostic, RunStatus};
use codelens::rules::{DiagnosticFilter, NewRule};

use super::{open_index, print_json, read_query, OutputFormat};
use crate::{DiagnosticsAction, RuleAction};

pub async fn diagnostics(
    project: String,
    config: Config,
    action: DiagnosticsAction,
    format: OutputFormat,
) -> Result<()> {
    let index = open_index(&project, config)?;

    match action {
        DiagnosticsAction::Run { rule } => {
            let report = index.run_diagnostics(rule.as_deref())?;
            if format == OutputFormat::Json {
                return print_json(&report);
            }
            for outcome in &report.outcomes {
                match outcome.status {
                    RunStatus::Ok => println!(
                        "  {:<24} {} row(s), {} new, {} resolved ({} ms)",
                        outcome.rule_id,
                        outcome.row_count,
                        outcome.new_count,
                        outcome.resolved_count,
                        outcome.duration_ms
                    ),
                    status => println!(
                        "  {:<24} {}: {}",
                        outcome.rule_id,
                        status.as_str(),
                        outcome.error.as_deref().unwrap_or("unknown error")
                    ),
                }
            }
            println!(
                "\n{} rule(s) ran, {} failed, {} new diagnostic(s)",
                report.outcomes.len(),
                report.failed().count(),
                report.new_diagnostics()
            );
        }

        DiagnosticsAction::List { status, rule, path } => {
            let filter = DiagnosticFilter {
                status,
                rule_id: rule,
                path_prefix: path,
            };
            let diagnostics = index.diagnostics(&filter)?;
            match format {
                OutputFormat::Json => print_json(&diagnostics)?,
                OutputFormat::Text if diagnostics.is_empty() => println!("No diagnostics"),
                OutputFormat::Text => {
                    for diag in &diagnostics {
                        print_diagnostic(diag);
                    }
                    println!("\n{} diagnostic(s)", diagnostics.len());
                }
            }
        }

        DiagnosticsAction::Set { id, status } => {
            let diag = index.set_diagnostic_status(id, status)?;
            match format {
                OutputFormat::Json => print_json(&diag)?,
                OutputFormat::Text => print_diagnostic(&diag),
            }
        }
    }

    Ok(())
}

fn print_diagnostic(diag: &Diagnostic) {
    println!(
        "  #{} {}:{} {} [{}] {} ({})",
        diag.diag_id,
        diag.path,
        diag.line,
        diag.severity.as_str(),
        diag.rule_id,
        diag.message,
        diag.status.as_str()
    );
}

pub async fn rule(
    project: String,
    config: Config,
    action: RuleAction,
    format: OutputFormat,
) -> Result<()> {
    let index = open_index(&project, config)?;

    match action {
        RuleAction::Add {
            id,
            query,
            name,
            description,
            severity,
            learned_from,
        } => {
            let rule = NewRule {
                name: name.unwrap_or_else(|| id.clone()),
                rule_id: id,
                description,
                query: read_query(&query)?,
                severity,
                learned_from,
            };
            let rule = index.add_rule(rule).context("Rule was not stored")?;
            match format {
                OutputFormat::Json => print_json(&rule)?,
                OutputFormat::Text => println!(
                    "Added rule {} ({}, weight {:.2})",
                    rule.rule_id,
                    rule.severity.as_str(),
                    rule.weight
                ),
            }
        }

        RuleAction::Test { query } => {
            let preview = index.test_rule(&read_query(&query)?)?;
            match format {
                OutputFormat::Json => print_json(&preview)?,
                OutputFormat::Text => {
                    println!("Columns: {}", preview.columns.join(", "));
                    for row in &preview.rows {
                        let label = row.name.as_deref().unwrap_or("");
                        let message = row.message.as_deref().unwrap_or("");
                        println!("  {}:{} {} {}", row.path, row.line, label, message);
                    }
                    if preview.total_rows > preview.rows.len() {
                        println!("  ... {} more", preview.total_rows - preview.rows.len());
                    }
                    println!("\n{} row(s)", preview.total_rows);
                }
            }
        }

        RuleAction::Rate {
            id,
            useful,
            not_useful,
        } => {
            let rule = index.rate_rule(&id, useful && !not_useful)?;
            match format {
                OutputFormat::Json => print_json(&rule)?,
                OutputFormat::Text => println!(
                    "Rule {} weight {:.2}{}",
                    rule.rule_id,
                    rule.weight,
                    if rule.enabled { "" } else { " (disabled)" }
                ),
            }
        }

        RuleAction::Runs { id, limit } => {
            let runs = index.rule_runs(&id, limit)?;
            match format {
                OutputFormat::Json => print_json(&runs)?,
                OutputFormat::Text if runs.is_empty() => println!("Rule {} has not run yet", id),
                OutputFormat::Text => {
                    for run in &runs {
                        println!(
                            "  #{} {} {:<7} {} row(s), {} new ({} ms){}",
                            run.run_id,
                            run.ran_at,
                            run.status.as_str(),
                            run.row_count,
                            run.new_count,
                            run.duration_ms,
                            run.error.as_deref().map(|e| format!(": {}", e)).unwrap_or_default()
                        );
                    }
                }
            }
        }

        RuleAction::List { effectiveness } => {
            if effectiveness {
                let rows = index.rule_effectiveness()?;
                match format {
                    OutputFormat::Json => print_json(&rows)?,
                    OutputFormat::Text => {
                        println!(
                            "  {:<24} {:>6} {:>5} {:>6} {:>8} {:>5} {:>6}",
                            "rule", "weight", "runs", "failed", "findings", "open", "useful"
                        );
                        for row in &rows {
                            println!(
                                "  {:<24} {:>6.2} {:>5} {:>6} {:>8} {:>5} {:>6}{}",
                                row.rule_id,
                                row.weight,
                                row.runs,
                                row.failed_runs,
                                row.findings,
                                row.open_diagnostics,
                                row.useful_votes,
                                if row.enabled { "" } else { "  disabled" }
                            );
                        }
                    }
                }
                return Ok(());
            }

            let rules = index.rules()?;
            match format {
                OutputFormat::Json => print_json(&rules)?,
                OutputFormat::Text => {
                    for rule in &rules {
                        println!(
                            "  {:<24} {:<8} {:.2} {}{}",
                            rule.rule_id,
                            rule.severity.as_str(),
                            rule.weight,
                            rule.name,
                            if rule.enabled { "" } else { " (disabled)" }
                        );
                    }
                    println!("\n{} rule(s)", rules.len());
                }
            }
        }
    }

    Ok(())
}
