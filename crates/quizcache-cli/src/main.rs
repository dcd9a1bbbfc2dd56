//! quizcache: run the drone quiz offline cache from the command line.
//!
//! The cache store is a JSON snapshot on disk, so each invocation picks up
//! where the previous one left off.
//!
//! ## Usage
//!
//! ```bash
//! # Precache the current generation and activate it
//! quizcache --scope https://quiz.example/ install
//!
//! # Run one request through the fetch handler
//! quizcache fetch https://quiz.example/icon-192.png
//!
//! # Offline navigation falls back to the shell page
//! quizcache --offline fetch https://quiz.example/results --navigate
//!
//! # List stored generations
//! quizcache status
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use quizcache_common::{init_logging, LogConfig, LogFormat};
use tracing::debug;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "quizcache", version)]
#[command(about = "Offline cache manager for the drone quiz app")]
struct Cli {
    /// Worker config file (JSON). Built-in defaults when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Cache store file
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Scope the assets are resolved against, overriding the config
    #[arg(long, global = true)]
    scope: Option<String>,

    /// Treat the network as unreachable
    #[arg(long, global = true)]
    offline: bool,

    /// More log output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Log format: pretty, compact or json
    #[arg(long, default_value = "compact", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Precache the current generation and activate it
    Install {
        /// Attempts before giving up on transient failures
        #[arg(long, default_value_t = 3)]
        attempts: u32,
    },

    /// Run one request through the fetch handler
    Fetch {
        /// Absolute URL to request
        url: String,
        /// Request method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        /// Treat the request as a top-level document navigation
        #[arg(long)]
        navigate: bool,
        /// Request destination (document, script, style, image, font, ...)
        #[arg(long)]
        destination: Option<String>,
        /// Seconds to wait for the response
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Show stored cache generations
    Status {
        /// List every entry, not just counts
        #[arg(long)]
        entries: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format: LogFormat = cli.log_format.parse()?;
    init_logging(LogConfig::from_verbosity(cli.verbose).with_format(format))?;

    let store = match cli.store {
        Some(path) => path,
        None => commands::default_store_path(),
    };
    debug!(store = %store.display(), "Using cache store");

    let mut config = match &cli.config {
        Some(path) => quizcache_sw::WorkerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => quizcache_sw::WorkerConfig::default(),
    };
    if let Some(scope) = cli.scope {
        config = config.with_scope(scope);
    }

    let session = commands::Session {
        config,
        store,
        offline: cli.offline,
    };

    let output = match cli.command {
        Commands::Install { attempts } => commands::install(&session, attempts).await?,
        Commands::Fetch {
            url,
            method,
            navigate,
            destination,
            timeout,
        } => {
            let request = commands::build_request(&url, &method, navigate, destination.as_deref())?;
            commands::fetch(&session, request, Duration::from_secs(timeout)).await?
        }
        Commands::Status { entries } => commands::status(&session, entries).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
