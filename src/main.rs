//! # Chat Search CLI (`chat-search`)
//!
//! Reconstructs conversation threads from chat exports, keeps an
//! incrementally built embedding index of them, and answers semantic
//! queries from the CLI or over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! chat-search --config ./config/chat-search.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chat-search threads <in> <out>` | Rebuild reply threads from a message export |
//! | `chat-search index <threads>` | Embed and append threads not yet indexed |
//! | `chat-search rebuild <threads>` | Reindex into a fresh generation and swap it in |
//! | `chat-search merge <V,M>...` | Concatenate generations and swap the result in |
//! | `chat-search rollback` | Restore the generation kept by the last swap |
//! | `chat-search search "<query>"` | Ranked threads for a query |
//! | `chat-search stats` | Describe the served generation |
//! | `chat-search serve` | Start the HTTP search API |
//!
//! ## Examples
//!
//! ```bash
//! chat-search threads export/result.json data/threads.jsonl
//! chat-search index data/threads.jsonl --batch-size 16
//! chat-search search "how do I pin a future?" --top-k 5
//! chat-search serve
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chat_search::config;
use chat_search::progress::ProgressMode;
use chat_search::store::Generation;
use chat_search::{embed_cmd, ingest, search, server, stats, swap_cmd};

/// Chat Search: semantic retrieval over reconstructed chat threads.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/chat-search.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "chat-search",
    about = "Chat Search: semantic retrieval over reconstructed chat threads",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/chat-search.toml")]
    config: PathBuf,

    /// Enable debug logging (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Progress output on stderr. Defaults to `human` on a TTY, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Reconstruct reply threads from a message export.
    ///
    /// Reads `.json` (`{"messages": [...]}`) or `.jsonl` and writes one
    /// thread record per line. Runs without a config file.
    Threads {
        input: PathBuf,
        output: PathBuf,

        /// Drop threads shorter than this many characters.
        #[arg(long)]
        min_text_length: Option<usize>,
    },

    /// Embed thread records that are not yet indexed and append them.
    ///
    /// Safe to re-run: already indexed records are skipped without any
    /// embedding call, and an interrupted run resumes after the last
    /// committed batch.
    Index {
        threads: PathBuf,

        /// Override the batch size from config (records per embedding call).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Only consider the first N thread records.
        #[arg(long)]
        limit: Option<usize>,

        /// Show counts without embedding anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Reindex all threads into a new generation and swap it in.
    ///
    /// The previous generation is kept under an `.old` suffix.
    Rebuild {
        threads: PathBuf,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Concatenate generations, in order, and swap the result in.
    Merge {
        /// Source generations as `VECTORS,METADATA` path pairs.
        #[arg(required = true, value_parser = swap_cmd::parse_generation)]
        sources: Vec<Generation>,
    },

    /// Restore the generation kept by the last rebuild, merge, or rollback.
    Rollback,

    /// Search the index.
    Search {
        query: String,

        /// Number of results to return.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Show index statistics.
    Stats,

    /// Start the HTTP search API.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let progress = cli
        .progress
        .map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty);

    // Commands that don't require config
    if let Commands::Threads {
        input,
        output,
        min_text_length,
    } = &cli.command
    {
        let cfg = if cli.config.exists() {
            config::load_config(&cli.config)?
        } else {
            config::Config::minimal()
        };
        ingest::run_threads(&cfg, input, output, *min_text_length)?;
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Threads { .. } => {
            // Handled above (before config loading)
        }
        Commands::Index {
            threads,
            batch_size,
            limit,
            dry_run,
        } => {
            embed_cmd::run_index(&cfg, &threads, batch_size, limit, dry_run, progress).await?;
        }
        Commands::Rebuild {
            threads,
            batch_size,
            limit,
        } => {
            embed_cmd::run_rebuild(&cfg, &threads, batch_size, limit, progress).await?;
        }
        Commands::Merge { sources } => {
            swap_cmd::run_merge(&cfg, &sources)?;
        }
        Commands::Rollback => {
            swap_cmd::run_rollback(&cfg)?;
        }
        Commands::Search { query, top_k } => {
            search::run_search(&cfg, &query, top_k).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg)?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
