//! TenantDB CLI
//!
//! Command-line tools for running and inspecting a TenantDB node.
//!
//! # Commands
//!
//! - `serve` - Load every database hosted on this node and run until Ctrl-C
//! - `write` - Push a concurrent write workload through one database
//! - `inspect` - Replay a database journal and print what it holds

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// TenantDB multi-tenant database tools.
#[derive(Parser)]
#[command(name = "tenantdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Root directory holding one subdirectory per database
    #[arg(global = true, short, long, default_value = "tenantdb-data")]
    data_dir: PathBuf,

    /// Tag of the node this process runs as
    #[arg(global = true, short, long, default_value = "A")]
    node: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every database hosted on this node and serve until Ctrl-C
    Serve {
        /// JSON file holding the database records
        #[arg(short, long)]
        topology: PathBuf,

        /// Unload databases idle for this many seconds
        #[arg(long)]
        idle_secs: Option<u64>,

        /// Databases allowed to load at the same time
        #[arg(long)]
        max_concurrent_loads: Option<usize>,
    },

    /// Submit concurrent puts to one database and report batching
    Write {
        /// Database to write to
        #[arg(long)]
        database: String,

        /// Number of documents to put
        #[arg(short, long, default_value = "1000")]
        count: usize,

        /// Number of concurrent writers
        #[arg(short = 'j', long, default_value = "16")]
        concurrency: usize,

        /// Skip fsync on commit
        #[arg(long)]
        no_sync: bool,
    },

    /// Replay a database journal and print its contents
    Inspect {
        /// Database to inspect
        #[arg(long)]
        database: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            topology,
            idle_secs,
            max_concurrent_loads,
        } => {
            let options = commands::serve::ServeOptions {
                data_dir: cli.data_dir,
                node: cli.node,
                topology,
                idle_secs,
                max_concurrent_loads,
            };
            commands::serve::run(options).await?;
        }
        Commands::Write {
            database,
            count,
            concurrency,
            no_sync,
        } => {
            let options = commands::write::WriteOptions {
                data_dir: cli.data_dir,
                node: cli.node,
                database,
                count,
                concurrency,
                sync: !no_sync,
            };
            commands::write::run(options).await?;
        }
        Commands::Inspect { database, format } => {
            commands::inspect::run(&cli.data_dir, &database, &format)?;
        }
        Commands::Version => {
            println!("TenantDB CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
