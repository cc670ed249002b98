//! Ingest driver.
//!
//! Loads one archive-day into the catalog: enumerate the chains in the
//! archive, read and decode the three CSVs per chain with bounded
//! concurrency, stamp `chain` and `date` from context, and hand the
//! accumulated rows to [`catalog::replace_date`]. Every attempt ends with a
//! row in `ingestion_log`, so re-running a date is a plain retry.
//!
//! # Failure policy
//!
//! Individual chain failures (malformed member, unsupported compression,
//! truncated payload) are logged and swallowed — partial ingest is better
//! than none, and the log still records `success` with the totals actually
//! written. A full-archive failure (size probe, directory fetch, catalog
//! write) aborts and records `status='error'`.
//!
//! Concurrent ingests of the same date serialize on an in-process per-date
//! lock; different dates are independent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{Context, Result};
use tokio::sync::Semaphore;

use crate::catalog::{self, DateBundle};
use crate::config::Config;
use crate::dates;
use crate::error::ArchiveError;
use crate::models::{PriceRec, ProductRec, StoreRec};
use crate::rows::{self, Table};
use crate::upstream::{Archive, Upstream, PRICES_CSV, PRODUCTS_CSV, STORES_CSV};
use crate::{db, migrate};

/// At most this many chain tasks in flight per ingest. A fixed property of
/// the pipeline: it keeps upstream load predictable.
pub const CHAIN_CONCURRENCY: usize = 5;

static DATE_LOCKS: OnceLock<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> = OnceLock::new();

fn date_lock(date: &str) -> Arc<tokio::sync::Mutex<()>> {
    let locks = DATE_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = locks.lock().unwrap();
    Arc::clone(
        map.entry(date.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
    )
}

/// What an ingest attempt did.
#[derive(Debug)]
pub struct IngestOutcome {
    pub date: String,
    pub chains_total: usize,
    pub chains_loaded: usize,
    pub store_count: usize,
    pub product_count: usize,
    pub price_count: usize,
    /// True when a prior `success` row short-circuited the run.
    pub skipped: bool,
}

/// Idempotently ingest `date`. Without `force`, an existing `success` row
/// is a no-op; the log row (and its `ingested_at`) stays untouched.
pub async fn ingest(
    pool: &sqlx::SqlitePool,
    upstream: &Upstream,
    date: &str,
    force: bool,
) -> Result<IngestOutcome> {
    let lock = date_lock(date);
    let _guard = lock.lock().await;

    if !force && catalog::is_date_ingested(pool, date).await? {
        let log = catalog::log_row(pool, date).await?;
        let (stores, products, prices) = log
            .map(|l| (l.store_count, l.product_count, l.price_count))
            .unwrap_or_default();
        return Ok(IngestOutcome {
            date: date.to_string(),
            chains_total: 0,
            chains_loaded: 0,
            store_count: stores as usize,
            product_count: products as usize,
            price_count: prices as usize,
            skipped: true,
        });
    }

    let archive = match upstream.open(date).await {
        Ok(archive) => archive,
        Err(err) => {
            catalog::record_failure(pool, date, &err.to_string()).await?;
            return Err(err).with_context(|| format!("failed to open archive for {}", date));
        }
    };

    ingest_archive(pool, &archive, date).await
}

/// Ingest an already opened archive. Split out of [`ingest`] so the full
/// pipeline runs against local range sources in tests.
pub async fn ingest_archive(
    pool: &sqlx::SqlitePool,
    archive: &Archive,
    date: &str,
) -> Result<IngestOutcome> {
    let chains = archive.chains();
    tracing::info!(date, chains = chains.len(), "ingest started");

    let semaphore = Arc::new(Semaphore::new(CHAIN_CONCURRENCY));
    let mut handles = Vec::with_capacity(chains.len());
    for chain in &chains {
        let semaphore = Arc::clone(&semaphore);
        let archive = archive.clone();
        let chain = chain.clone();
        let date = date.to_string();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            let result = load_chain(&archive, &chain, &date).await;
            (chain, result)
        }));
    }

    let mut bundle = DateBundle::default();
    let mut chains_loaded = 0usize;
    for handle in handles {
        let (chain, result) = handle.await?;
        match result {
            Ok(load) => {
                chains_loaded += 1;
                bundle.stores.extend(load.stores);
                bundle.products.extend(load.products);
                bundle.prices.extend(load.prices);
            }
            Err(err) => {
                tracing::warn!(chain = %chain, error = %err, "chain skipped");
            }
        }
    }

    let outcome = IngestOutcome {
        date: date.to_string(),
        chains_total: chains.len(),
        chains_loaded,
        store_count: bundle.stores.len(),
        product_count: bundle.products.len(),
        price_count: bundle.prices.len(),
        skipped: false,
    };

    if let Err(err) = catalog::replace_date(pool, date, &bundle).await {
        catalog::record_failure(pool, date, &err.to_string()).await?;
        return Err(err);
    }

    tracing::info!(
        date,
        stores = outcome.store_count,
        products = outcome.product_count,
        prices = outcome.price_count,
        "ingest finished"
    );
    Ok(outcome)
}

/// Read and decode one chain's three CSVs. Any member failure fails the
/// whole chain; the caller decides whether that is fatal.
async fn load_chain(archive: &Archive, chain: &str, date: &str) -> Result<DateBundle, ArchiveError> {
    let stores_text = archive.read_csv(chain, STORES_CSV).await?;
    let products_text = archive.read_csv(chain, PRODUCTS_CSV).await?;
    let prices_text = archive.read_csv(chain, PRICES_CSV).await?;

    let mut bundle = DateBundle::default();
    if let Ok(table) = Table::parse(&stores_text) {
        bundle.stores = table.map(|row| map_store(&row, chain, date)).collect();
    }
    if let Ok(table) = Table::parse(&products_text) {
        bundle.products = table.map(|row| map_product(&row, chain, date)).collect();
    }
    if let Ok(table) = Table::parse(&prices_text) {
        bundle.prices = table.map(|row| map_price(&row, chain, date)).collect();
    }
    Ok(bundle)
}

pub(crate) fn map_store(row: &rows::Row, chain: &str, date: &str) -> StoreRec {
    StoreRec {
        store_id: row.get("store_id").to_string(),
        chain: chain.to_string(),
        date: date.to_string(),
        kind: row.get("type").to_string(),
        address: row.get("address").to_string(),
        city: row.get("city").to_string(),
        zipcode: row.get("zipcode").to_string(),
    }
}

pub(crate) fn map_product(row: &rows::Row, chain: &str, date: &str) -> ProductRec {
    ProductRec {
        product_id: row.get("product_id").to_string(),
        chain: chain.to_string(),
        date: date.to_string(),
        barcode: row.get("barcode").to_string(),
        name: row.get("name").to_string(),
        brand: row.get("brand").to_string(),
        category: row.get("category").to_string(),
        unit: row.get("unit").to_string(),
        quantity: row.get("quantity").to_string(),
    }
}

pub(crate) fn map_price(row: &rows::Row, chain: &str, date: &str) -> PriceRec {
    PriceRec {
        chain: chain.to_string(),
        store_id: row.get("store_id").to_string(),
        product_id: row.get("product_id").to_string(),
        date: date.to_string(),
        price: rows::price_or_zero(row.get("price")),
        unit_price: rows::optional_price(row.get("unit_price")),
        best_price_30: rows::optional_price(row.get("best_price_30")),
        anchor_price: rows::optional_price(row.get("anchor_price")),
        special_price: rows::optional_price(row.get("special_price")),
    }
}

/// `cjenik ingest` entry point.
pub async fn run_ingest(config: &Config, date: Option<String>, force: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let upstream = Upstream::new(&config.upstream)?;

    let date = match date {
        Some(date) => {
            dates::validate(&date)?;
            date
        }
        None => default_date(&upstream).await,
    };

    let outcome = ingest(&pool, &upstream, &date, force).await?;
    if outcome.skipped {
        println!(
            "ingest {} already ingested, nothing to do (use --force to re-ingest)",
            outcome.date
        );
    } else {
        println!("ingest {}", outcome.date);
        println!(
            "  chains loaded: {} of {}",
            outcome.chains_loaded, outcome.chains_total
        );
        println!("  stores: {}", outcome.store_count);
        println!("  products: {}", outcome.product_count);
        println!("  prices: {}", outcome.price_count);
        println!("ok");
    }

    pool.close().await;
    Ok(())
}

/// Default ingest date: the most recent archive the upstream lists, or
/// today's date in the target locale when the list is unavailable.
async fn default_date(upstream: &Upstream) -> String {
    match upstream.list_archives().await {
        Ok(archives) => archives
            .first()
            .map(|a| a.date.clone())
            .unwrap_or_else(dates::today),
        Err(err) => {
            tracing::warn!(error = %err, "archive list unavailable, defaulting to today");
            dates::today()
        }
    }
}
