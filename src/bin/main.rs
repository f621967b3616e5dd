//! tds-bridge CLI - run SQL through the worker
//!
//! Usage:
//!   tds-bridge query "<sql>" [--config <file>] [--format json|table]
//!   tds-bridge check [--config <file>]
//!
//! Examples:
//!   tds-bridge check --config tds-bridge.toml
//!   tds-bridge query "SELECT name FROM sys.databases" --format table

use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use tds_bridge::config::Settings;
use tds_bridge::logging::{init_logging, LogConfig};
use tds_bridge::rows::{ResultSet, Value};
use tds_bridge::Bridge;

#[derive(Parser)]
#[command(name = "tds-bridge")]
#[command(about = "Run SQL against a TDS server through the tds-bridge worker")]
#[command(version)]
struct Cli {
    /// Path to the configuration file (searched for when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one SQL batch and print every result set
    Query {
        /// SQL text to execute
        sql: String,

        /// Output format
        #[arg(short, long, default_value = "json")]
        format: OutputFormat,
    },

    /// Start the worker, run a trivial query and report timings
    Check,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// One JSON array per result set
    Json,
    /// Tab-separated columns with a header row
    Table,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LogConfig {
        verbose: cli.verbose,
    }) {
        eprintln!("Error initializing logging: {}", e);
        return ExitCode::FAILURE;
    }

    let settings = match load_settings(cli.config.as_ref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Query { sql, format } => block_on(cmd_query(settings, sql, format)),
        Commands::Check => block_on(cmd_check(settings)),
    }
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings, tds_bridge::config::SettingsError> {
    let settings = match path {
        Some(path) => Settings::from_file(path)?,
        None => Settings::load()?,
    };
    settings.validate()?;
    Ok(settings)
}

fn block_on<F: Future<Output = ExitCode>>(future: F) -> ExitCode {
    match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime.block_on(future),
        Err(e) => {
            eprintln!("Error starting runtime: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_query(settings: Settings, sql: String, format: OutputFormat) -> ExitCode {
    let bridge = match Bridge::connect(&settings).await {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Error connecting: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = bridge.raw_query(&sql).await;
    bridge.disconnect().await;

    match result {
        Ok(result_sets) => {
            for set in &result_sets {
                match format {
                    OutputFormat::Json => print_json(set),
                    OutputFormat::Table => print_table(set),
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_check(settings: Settings) -> ExitCode {
    println!("Worker target: {}", settings.database.describe());

    let started = Instant::now();
    let bridge = match Bridge::connect(&settings).await {
        Ok(b) => b,
        Err(e) => {
            eprintln!("✗ Worker failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };
    println!("✓ Worker started in {}ms", started.elapsed().as_millis());

    let started = Instant::now();
    let result = bridge.query_first("SELECT 1 AS ok").await;
    bridge.disconnect().await;

    match result {
        Ok(_) => {
            println!("✓ Query round trip in {}ms", started.elapsed().as_millis());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Query failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_json(set: &ResultSet) {
    match serde_json::to_string_pretty(set) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error encoding result: {}", e),
    }
}

fn print_table(set: &ResultSet) {
    let Some(first) = set.first() else {
        println!("(0 rows)");
        println!();
        return;
    };

    let header: Vec<&str> = first.column_names().collect();
    println!("{}", header.join("\t"));
    for row in set {
        let cells: Vec<String> = row.iter().map(|(_, value)| display_value(value)).collect();
        println!("{}", cells.join("\t"));
    }
    println!("({} rows)", set.len());
    println!();
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
    }
}
