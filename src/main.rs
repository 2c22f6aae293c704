use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use codelens::config::{Config, LoggingConfig};
use codelens::index::records::{DiagnosticStatus, Severity};
use codelens::SymbolKind;

mod cli;

use cli::OutputFormat;

#[derive(Parser)]
#[command(name = "codelens")]
#[command(author = "Intent Project Team")]
#[command(version)]
#[command(about = "Persistent structural index of a codebase for AI agents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory
    #[arg(short, long, global = true, default_value = ".")]
    project: String,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Index the project (incremental unless --full)
    Index {
        /// Re-extract every file
        #[arg(long)]
        full: bool,

        /// Keep running and re-index on file changes
        #[arg(short, long)]
        watch: bool,
    },

    /// Show a symbol with its callers, callees, refs and notes
    Context {
        /// Symbol name or qualified name
        name: String,

        /// Restrict to one symbol kind
        #[arg(short, long, value_parser = cli::parse_kind)]
        kind: Option<SymbolKind>,
    },

    /// Transitive callers of a symbol
    Impact {
        /// Symbol name or qualified name
        name: String,

        #[arg(short, long, value_parser = cli::parse_kind)]
        kind: Option<SymbolKind>,

        /// Maximum caller depth
        #[arg(long)]
        depth: Option<usize>,
    },

    /// Symbols, imports, notes and open findings of one file
    File {
        /// Project-relative path
        path: String,
    },

    /// File-level import edges
    Imports {
        /// Only importing files whose path contains this text
        #[arg(long)]
        path: Option<String>,
    },

    /// Full-text search over names and docstrings
    Search {
        query: String,

        #[arg(short, long, value_parser = cli::parse_kind)]
        kind: Option<SymbolKind>,

        /// Only paths under this prefix
        #[arg(long)]
        path: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Run or inspect diagnostics
    Diagnostics {
        #[command(subcommand)]
        action: DiagnosticsAction,
    },

    /// Manage diagnostics rules
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Check imports against the configured layers
    Conventions,

    /// Work sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Attach a note to a symbol or file
    Annotate {
        /// Stable id or name of a symbol, or a file path with --file
        target: String,

        text: String,

        /// Target is a project-relative file path
        #[arg(long)]
        file: bool,

        #[arg(long)]
        author: Option<String>,
    },

    /// List notes on a symbol stable id or file path
    Annotations {
        target: String,

        /// Target is a project-relative file path
        #[arg(long)]
        file: bool,
    },

    /// List notes whose target no longer exists
    Orphans,

    /// Show index statistics
    Stats,

    /// List supported languages
    Languages,
}

#[derive(Subcommand)]
pub enum DiagnosticsAction {
    /// Run enabled rules, or one rule by id
    Run {
        #[arg(short, long)]
        rule: Option<String>,
    },

    /// List stored diagnostics
    List {
        #[arg(short, long, value_parser = cli::parse_status)]
        status: Option<DiagnosticStatus>,

        #[arg(short, long)]
        rule: Option<String>,

        #[arg(long)]
        path: Option<String>,
    },

    /// Change the status of one diagnostic
    Set {
        id: i64,

        #[arg(value_parser = cli::parse_status)]
        status: DiagnosticStatus,
    },
}

#[derive(Subcommand)]
pub enum RuleAction {
    /// Store a new rule
    Add {
        /// Rule id, e.g. NO_BARE_EXCEPT
        id: String,

        /// SQL query, or @path to read it from a file
        query: String,

        #[arg(short, long)]
        name: Option<String>,

        #[arg(long, default_value = "")]
        description: String,

        #[arg(short, long, value_parser = cli::parse_severity, default_value = "warning")]
        severity: Severity,

        /// Where the rule came from
        #[arg(long)]
        learned_from: Option<String>,
    },

    /// Dry-run a query without storing anything
    Test {
        /// SQL query, or @path to read it from a file
        query: String,
    },

    /// Record whether a rule's findings were useful
    Rate {
        id: String,

        #[arg(long, conflicts_with = "not_useful", required_unless_present = "not_useful")]
        useful: bool,

        #[arg(long)]
        not_useful: bool,
    },

    /// Recent runs of one rule
    Runs {
        id: String,

        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// List rules
    List {
        /// Include run and rating counts
        #[arg(short, long)]
        effectiveness: bool,
    },
}

#[derive(Subcommand)]
pub enum SessionAction {
    /// Start a session, ending any active one
    Start {
        #[arg(long)]
        transcript: Option<String>,
    },

    /// End the active session
    End {
        #[arg(short, long)]
        summary: Option<String>,
    },

    /// Show the active session
    Current,

    /// Recent sessions
    History {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Files changed during a session
    Changes { id: i64 },
}

fn init_logging(debug: bool, verbose: bool, logging: &LoggingConfig) {
    let level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match logging.format.as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_project_dir(&cli.project);
    init_logging(cli.debug, cli.verbose, &config.logging);
    debug!("codelens {} on {}", env!("CARGO_PKG_VERSION"), cli.project);

    let project = cli.project;
    let format = cli.format;

    match cli.command {
        Commands::Index { full, watch } => {
            cli::index::index_project(project, config, full, watch, format).await?;
        }

        Commands::Context { name, kind } => {
            cli::query::show_context(project, config, name, kind, format).await?;
        }

        Commands::Impact { name, kind, depth } => {
            cli::impact::analyze_impact(project, config, name, kind, depth, format).await?;
        }

        Commands::File { path } => {
            cli::query::file_summary(project, config, path, format).await?;
        }

        Commands::Imports { path } => {
            cli::query::imports(project, config, path, format).await?;
        }

        Commands::Search {
            query,
            kind,
            path,
            limit,
        } => {
            cli::query::search(project, config, query, kind, path, limit, format).await?;
        }

        Commands::Diagnostics { action } => {
            cli::diagnostics::diagnostics(project, config, action, format).await?;
        }

        Commands::Rule { action } => {
            cli::diagnostics::rule(project, config, action, format).await?;
        }

        Commands::Conventions => {
            cli::conventions::check_conventions(project, config, format).await?;
        }

        Commands::Session { action } => {
            cli::session::session(project, config, action, format).await?;
        }

        Commands::Annotate {
            target,
            text,
            file,
            author,
        } => {
            cli::session::annotate(project, config, target, text, file, author, format).await?;
        }

        Commands::Annotations { target, file } => {
            cli::session::annotations(project, config, target, file, format).await?;
        }

        Commands::Orphans => {
            cli::session::orphans(project, config, format).await?;
        }

        Commands::Stats => {
            cli::stats::show_stats(project, config, format).await?;
        }

        Commands::Languages => {
            cli::stats::list_languages(format)?;
        }
    }

    Ok(())
}
