mod output;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use pgdrift_core::config::{CliOverrides, DriftConfig};
use pgdrift_core::error::DriftError;
use pgdrift_core::progress::{LogProgress, NoProgress, ProgressSink};
use pgdrift_core::{PgDrift, Side};

#[derive(Parser)]
#[command(
    name = "pgdrift",
    about = "Compare two PostgreSQL databases and apply the resulting patches",
    version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("GIT_HASH"), " ", env!("BUILD_TIME"), ")"
    ),
    propagate_version = true
)]
struct Cli {
    /// Config file path
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Source database URL (overrides config)
    #[arg(long, value_name = "URL")]
    source_url: Option<String>,

    /// Target database URL (overrides config)
    #[arg(long, value_name = "URL")]
    target_url: Option<String>,

    /// Directory patches are applied from (overrides config)
    #[arg(long, value_name = "DIR")]
    patches_directory: Option<PathBuf>,

    /// Directory new patches are written to (overrides config)
    #[arg(long, value_name = "DIR")]
    output_directory: Option<PathBuf>,

    /// History table schema (overrides config)
    #[arg(long, value_name = "SCHEMA")]
    history_schema: Option<String>,

    /// History table name (overrides config)
    #[arg(long, value_name = "TABLE")]
    history_table: Option<String>,

    /// Number of retries when connecting to a database
    #[arg(long, value_name = "N")]
    connect_retries: Option<u32>,

    /// SSL/TLS mode: disable, prefer, require
    #[arg(long, value_name = "MODE")]
    ssl_mode: Option<String>,

    /// Connection timeout in seconds (default: 30, 0 = no timeout)
    #[arg(long, value_name = "SECS")]
    connect_timeout: Option<u32>,

    /// Statement timeout in seconds (default: 0 = no limit)
    #[arg(long, value_name = "SECS")]
    statement_timeout: Option<u32>,

    /// Output results as JSON
    #[arg(long)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Enable verbose/debug output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diff source against target and write a patch
    Compare {
        /// Patch name, used in the file name
        name: String,
    },

    /// Apply pending patches
    Migrate {
        /// Re-run patches left in WIP or ERROR
        #[arg(long)]
        replay: bool,

        /// Migrate the source database instead of the target
        #[arg(long)]
        to_source: bool,
    },

    /// Mark a patch as applied without running it
    Save {
        /// Patch file name, or a path to it
        file: String,

        /// Record on the source database instead of the target
        #[arg(long)]
        to_source: bool,
    },

    /// Show patch status
    Info {
        /// Read history from the source database instead of the target
        #[arg(long)]
        source: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging (suppress when JSON output is requested)
    let filter = if cli.json {
        "error"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .without_time()
        .init();

    if let Err(e) = run(cli).await {
        print_error(&e);
        process::exit(exit_code(&e));
    }
}

/// Map error types to differentiated exit codes.
fn exit_code(error: &DriftError) -> i32 {
    match error {
        DriftError::ConfigError(_) => 2,
        DriftError::DatabaseError(_) => 4,
        DriftError::IntrospectionError { .. } => 4,
        DriftError::ExecutionError { .. } => 5,
        DriftError::LockError(_) => 6,
        DriftError::PatchStateError { .. } => 7,
        DriftError::IntegrityError(_) => 8,
        DriftError::IoError(_) => 1,
    }
}

fn side(to_source: bool) -> Side {
    if to_source {
        Side::Source
    } else {
        Side::Target
    }
}

async fn run(cli: Cli) -> Result<(), DriftError> {
    let json_output = cli.json;

    let overrides = CliOverrides {
        source_url: cli.source_url,
        target_url: cli.target_url,
        patches_directory: cli.patches_directory,
        output_directory: cli.output_directory,
        history_table_schema: cli.history_schema,
        history_table_name: cli.history_table,
        connect_retries: cli.connect_retries,
        ssl_mode: cli.ssl_mode,
        connect_timeout: cli.connect_timeout,
        statement_timeout: cli.statement_timeout,
    };

    // Load config
    let config = DriftConfig::load(cli.config.as_deref(), &overrides)?;

    // Verbose runs log progress as debug events instead of redrawing a line.
    let show_progress = !(json_output || cli.quiet || cli.verbose);
    let progress: &dyn ProgressSink = if json_output || cli.quiet {
        &NoProgress
    } else if cli.verbose {
        &LogProgress
    } else {
        &output::ConsoleProgress
    };

    match cli.command {
        Commands::Compare { name } => {
            let drift = PgDrift::new(config, &[Side::Source, Side::Target]).await?;
            let report = drift.compare(&name, progress).await;
            output::finish_progress(show_progress);
            let report = report?;
            if json_output {
                output::print_json(&report);
            } else {
                output::print_compare_summary(&report);
            }
        }
        Commands::Migrate { replay, to_source } => {
            let side = side(to_source);
            let drift = PgDrift::new(config, &[side]).await?;
            let report = drift.migrate(side, replay, progress).await;
            output::finish_progress(show_progress);
            let report = report?;
            if json_output {
                output::print_json(&report);
            } else {
                output::print_migrate_summary(&report, side);
            }
        }
        Commands::Save { file, to_source } => {
            let side = side(to_source);
            let drift = PgDrift::new(config, &[side]).await?;
            let report = drift.save(side, &file).await?;
            if json_output {
                output::print_json(&report);
            } else {
                output::print_save_result(&report, side);
            }
        }
        Commands::Info { source } => {
            let side = side(source);
            let drift = PgDrift::new(config, &[side]).await?;
            let infos = drift.info(side).await?;
            if json_output {
                output::print_json(&infos);
            } else {
                output::print_info_table(&infos);
            }
        }
    }

    Ok(())
}

fn print_error(error: &DriftError) {
    eprintln!("{} {}", "ERROR:".red().bold(), error);

    // Provide actionable guidance
    match error {
        DriftError::ConfigError(_) => {
            eprintln!(
                "{}",
                "Hint: Check your pgdrift.toml or set PGDRIFT_SOURCE_URL / PGDRIFT_TARGET_URL."
                    .dimmed()
            );
        }
        DriftError::DatabaseError(_) => {
            eprintln!(
                "{}",
                "Hint: Verify both databases are running and connection details are correct."
                    .dimmed()
            );
        }
        DriftError::PatchStateError { .. } => {
            eprintln!(
                "{}",
                "Hint: Inspect the target, then rerun with --replay, or mark the patch with 'pgdrift save'."
                    .dimmed()
            );
        }
        DriftError::ExecutionError { .. } => {
            eprintln!(
                "{}",
                "Hint: The failing block is stored in the history table's script column. Fix it and rerun with --replay."
                    .dimmed()
            );
        }
        DriftError::LockError(_) => {
            eprintln!(
                "{}",
                "Hint: Another migrate run may hold the lock on this history table.".dimmed()
            );
        }
        _ => {}
    }
}
