use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use cube_executor::CubeService;
use cube_parser::CubeParams;
use cube_storage::MemorySource;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod repl;

use commands::*;
use config::Config;
use repl::Repl;

#[derive(Parser)]
#[command(name = "cubeproxy")]
#[command(author, version, about = "Cube Cache Engine - caching proxy for analytical aggregates", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// CSV files to register with the source (format: name=path)
    #[arg(short, long, global = true)]
    load: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start interactive REPL
    Repl,

    /// Resolve an aggregation statement
    Query {
        /// SQL statement to resolve
        #[arg(short, long)]
        sql: String,
    },

    /// Resolve a cube request given as parameters
    Cube {
        /// Comma-separated dimensions
        #[arg(short, long)]
        dims: String,

        /// Measure, e.g. SUM(count)
        #[arg(short, long)]
        metric: Option<String>,

        /// Filter expression, e.g. "p3 = 1 AND p2 <> 'x'"
        #[arg(short, long)]
        filters: Option<String>,

        /// Fact table
        #[arg(short, long)]
        table: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let config = if let Some(config_path) = &cli.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    debug!(?config, "Loaded configuration");

    let source = Arc::new(MemorySource::new());
    for spec in &cli.load {
        let (name, path) = parse_load_spec(spec)?;
        load_table(&source, &name, &path)?;
    }

    let service = Arc::new(CubeService::new(config.service.clone(), source.clone()));
    service.start();

    let outcome = match cli.command {
        Some(Commands::Query { sql }) => run_query(&service, &sql, &config).await,
        Some(Commands::Cube {
            dims,
            metric,
            filters,
            table,
        }) => {
            let mut params = CubeParams::from_dims_str(&dims);
            params.metric = metric;
            params.filters = filters;
            params.table = table;
            run_cube(&service, &params, &config).await
        }
        Some(Commands::Repl) | None => {
            print_banner();
            match Repl::new(config, Arc::clone(&service), source) {
                Ok(mut repl) => repl.run().await,
                Err(e) => Err(e),
            }
        }
    };

    service.shutdown().await;
    outcome
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        "cube_cli=debug,cube_parser=debug,cube_cache=debug,cube_executor=debug,cube_storage=debug"
    } else {
        "cube_cli=info,cube_cache=info,cube_executor=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
   ____      _            ____
  / ___|   _| |__   ___  |  _ \ _ __ _____  ___   _
 | |  | | | | '_ \ / _ \ | |_) | '__/ _ \ \/ / | | |
 | |__| |_| | |_) |  __/ |  __/| | | (_) >  <| |_| |
  \____\__,_|_.__/ \___| |_|   |_|  \___/_/\_\\__, |
                                              |___/
    "#
        .bright_cyan()
    );
    println!(
        "{}",
        format!("Cube Cache Engine v{}", env!("CARGO_PKG_VERSION")).bright_yellow()
    );
    println!("{}", "Type '.help' for available commands\n".bright_black());
}
