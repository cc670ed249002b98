//! # Cjenik CLI (`cjenik`)
//!
//! The `cjenik` binary ingests daily retail-price archives published by the
//! upstream catalog service and answers price queries against the local
//! catalog, falling back to on-demand range extraction from the remote ZIP
//! when a date is not ingested.
//!
//! ## Usage
//!
//! ```bash
//! cjenik --config ./config/cjenik.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cjenik init` | Create the SQLite database and run schema migrations |
//! | `cjenik ingest` | Load one archive-day into the catalog (idempotent) |
//! | `cjenik search "<query>"` | Search products by name, brand, or barcode |
//! | `cjenik history` | Price evolution for one product over the last N days |
//! | `cjenik cities` | List known city names |
//! | `cjenik status` | Show the ingestion log |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! cjenik init
//!
//! # Ingest the most recent published archive
//! cjenik ingest
//!
//! # Re-ingest a specific day
//! cjenik ingest --date 2025-06-01 --force
//!
//! # Search milk prices in Zagreb
//! cjenik search "mlijeko" --city Zagreb
//!
//! # A week of price history for one EAN at one chain
//! cjenik history --barcode 5901234123457 --chain lidl --days 7
//! ```

mod catalog;
mod config;
mod dates;
mod db;
mod error;
mod ingest;
mod migrate;
mod models;
mod query;
mod rows;
mod upstream;
mod zip;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Cjenik — retail-price archive ingestion and query tool.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/cjenik.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cjenik",
    about = "Ingest and query daily retail-price archives",
    version,
    long_about = "Cjenik ingests the upstream's daily ZIP snapshots of retail prices \
    (per-chain stores, products, and prices CSVs) into a SQLite catalog and answers \
    product search and price-history queries. Days that are not ingested are answered \
    directly from the remote archive via HTTP range requests."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cjenik.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the four catalog tables
    /// (stores, products, prices, ingestion_log). Idempotent.
    Init,

    /// Ingest one archive-day into the catalog.
    ///
    /// Reads the archive's chains with bounded concurrency and replaces all
    /// catalog rows for the date atomically. A date that already ingested
    /// successfully is a no-op unless `--force` is given.
    Ingest {
        /// Day to ingest (YYYY-MM-DD). Defaults to the most recent archive
        /// the upstream lists, or today when the list is unavailable.
        #[arg(long)]
        date: Option<String>,

        /// Re-ingest even when the date already ingested successfully.
        #[arg(long)]
        force: bool,
    },

    /// Search products by name, brand, or exact barcode.
    Search {
        /// The search text. Matched as a substring of product name and
        /// brand, or as an exact barcode.
        query: String,

        /// Day to answer for (YYYY-MM-DD). Defaults to today; falls back to
        /// the latest ingested or published day when missing.
        #[arg(long)]
        date: Option<String>,

        /// Only prices from stores whose city contains this text.
        #[arg(long)]
        city: Option<String>,
    },

    /// Price evolution for one product over the last N days.
    ///
    /// Requires `--barcode` or `--name`; when both are given the barcode
    /// wins.
    History {
        /// Exact product barcode (EAN).
        #[arg(long)]
        barcode: Option<String>,

        /// Product name substring.
        #[arg(long)]
        name: Option<String>,

        /// Only prices from stores whose city contains this text.
        #[arg(long)]
        city: Option<String>,

        /// Restrict to one chain code (e.g. `lidl`).
        #[arg(long)]
        chain: Option<String>,

        /// How many days back to aggregate.
        #[arg(long, default_value_t = 30)]
        days: u32,
    },

    /// List known city names.
    Cities,

    /// Show the ingestion log: which dates are queryable and their counts.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { date, force } => {
            ingest::run_ingest(&cfg, date, force).await?;
        }
        Commands::Search { query, date, city } => {
            query::run_search(&cfg, &query, date, city).await?;
        }
        Commands::History {
            barcode,
            name,
            city,
            chain,
            days,
        } => {
            if barcode.as_deref().map_or(true, |s| s.trim().is_empty())
                && name.as_deref().map_or(true, |s| s.trim().is_empty())
            {
                anyhow::bail!("history requires --barcode or --name");
            }
            let request = query::HistoryRequest {
                barcode,
                name,
                city,
                chain,
                days,
            };
            query::run_history(&cfg, &request).await?;
        }
        Commands::Cities => {
            query::run_cities(&cfg).await?;
        }
        Commands::Status => {
            query::run_status(&cfg).await?;
        }
    }

    Ok(())
}
