use anyhow::Result;

use codelens::config::Config;

use super::{open_index, print_json, OutputFormat};

pub async fn check_conventions(project: String, config: Config, format: OutputFormat) -> Result<()> {
    let index = open_index(&project, config)?;
    let report = index.check_conventions()?;

    if format == OutputFormat::Json {
        return print_json(&report);
    }

    if report.layers == 0 {
        println!("No layers configured; add [[layers]] to .codelens.toml");
        return Ok(());
    }
    for violation in &report.violations {
        println!(
            "  {}:{} {} -> {}: imports {} ({})",
            violation.file,
            violation.line,
            violation.from_layer,
            violation.to_layer,
            violation.imported_module,
            violation.target_path
        );
    }
    println!(
        "\nChecked {} import(s) against {} layer(s): {} violation(s)",
        report.imports_checked,
        report.layers,
        report.violations.len()
    );

    Ok(())
}
