//! Query layer: product search and price-history aggregation.
//!
//! Both entry points answer from the catalog when the requested day is
//! ingested and fall back to on-demand range extraction from the remote
//! archive otherwise. The fallback order is deterministic:
//!
//! 1. requested date ingested → catalog, `source = db`;
//! 2. any other date ingested → catalog against the latest one, `source = db`;
//! 3. otherwise → remote archive, `source = zip`, with the requested date
//!    resolved against the upstream's published list.
//!
//! # Two-phase remote search
//!
//! The remote path defers expensive fetches until the set of chains that
//! matter is known: phase A reads only `products.csv` from every chain and
//! applies the filter; phase B fetches `stores.csv` and `prices.csv` for
//! the chains that matched. A miss costs O(chains) small range requests
//! instead of the whole ~80 MB archive.
//!
//! # Merging
//!
//! Matched products merge by fingerprint: `barcode` when non-empty (the
//! same EAN across chains is one group), else `(chain, product_id)`. Every
//! price whose store survives the city filter attaches to its group;
//! groups with no observable price are dropped; groups sort by number of
//! attached prices, capped at 50.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::models::{
    ChainStat, HistoryPoint, PriceEntry, PriceRec, ProductGroup, ProductRec, Source,
    SearchResponse, StoreRec,
};
use crate::upstream::{Archive, Upstream, PRICES_CSV, PRODUCTS_CSV, STORES_CSV};
use crate::{catalog, dates, db, ingest, migrate, rows};

/// Bound on concurrent member fetches in each remote search phase.
pub const FETCH_CONCURRENCY: usize = 8;

/// Bound on concurrently processed dates in remote history.
pub const HISTORY_DATE_CONCURRENCY: usize = 5;

/// Merged product groups returned per search, at most.
pub const GROUP_LIMIT: usize = 50;

/// Floor for the city list while the catalog is still empty.
pub const MAJOR_CITIES: &[&str] = &[
    "Zagreb",
    "Split",
    "Rijeka",
    "Osijek",
    "Zadar",
    "Velika Gorica",
    "Slavonski Brod",
    "Pula",
    "Karlovac",
    "Varaždin",
    "Šibenik",
    "Dubrovnik",
];

// ─── Search ─────────────────────────────────────────────────────────────

/// Search products matching `q` on `date`, optionally restricted to stores
/// whose city contains `city`.
pub async fn search(
    pool: &SqlitePool,
    upstream: &Upstream,
    date: &str,
    q: &str,
    city: Option<&str>,
) -> Result<SearchResponse> {
    let q = q.trim().to_lowercase();
    if q.is_empty() {
        return Ok(SearchResponse {
            products: Vec::new(),
            actual_date: date.to_string(),
            source: Source::Db,
        });
    }

    if catalog::is_date_ingested(pool, date).await? {
        let products = search_catalog(pool, date, &q, city).await?;
        return Ok(SearchResponse {
            products,
            actual_date: date.to_string(),
            source: Source::Db,
        });
    }

    if let Some(latest) = catalog::latest_ingested_date(pool).await? {
        let products = search_catalog(pool, &latest, &q, city).await?;
        return Ok(SearchResponse {
            products,
            actual_date: latest,
            source: Source::Db,
        });
    }

    search_remote(upstream, date, &q, city).await
}

async fn search_catalog(
    pool: &SqlitePool,
    date: &str,
    q: &str,
    city: Option<&str>,
) -> Result<Vec<ProductGroup>> {
    let products = catalog::match_products(pool, date, q).await?;
    if products.is_empty() {
        return Ok(Vec::new());
    }

    let chains = distinct_chains(&products);
    let ids = distinct_ids(&products);
    let stores = catalog::stores_for_chains(pool, date, &chains, city).await?;
    let store_index = index_stores(stores);
    let prices = catalog::prices_for(pool, date, &chains, &ids).await?;

    Ok(merge_groups(&products, &prices, &store_index))
}

async fn search_remote(
    upstream: &Upstream,
    date: &str,
    q: &str,
    city: Option<&str>,
) -> Result<SearchResponse> {
    let Some(actual_date) = resolve_upstream_date(upstream, date).await? else {
        // Nothing published and nothing ingested: empty result, best-effort date.
        return Ok(SearchResponse {
            products: Vec::new(),
            actual_date: date.to_string(),
            source: Source::Zip,
        });
    };

    let archive = upstream.open(&actual_date).await?;
    let products = search_archive(&archive, &actual_date, q, city).await?;
    Ok(SearchResponse {
        products,
        actual_date,
        source: Source::Zip,
    })
}

/// The requested date when the upstream lists it, else the most recent date
/// the upstream actually has. `None` when nothing is published at all.
async fn resolve_upstream_date(upstream: &Upstream, date: &str) -> Result<Option<String>> {
    let archives = upstream.list_archives().await?;
    if archives.iter().any(|a| a.date == date) {
        return Ok(Some(date.to_string()));
    }
    Ok(archives.first().map(|a| a.date.clone()))
}

/// Two-phase search over an opened archive.
pub(crate) async fn search_archive(
    archive: &Archive,
    date: &str,
    q: &str,
    city: Option<&str>,
) -> Result<Vec<ProductGroup>> {
    let (products, prices, store_index) =
        two_phase(archive, date, Matcher::Query(q.to_string()), None, city).await?;
    Ok(merge_groups(&products, &prices, &store_index))
}

// ─── History ────────────────────────────────────────────────────────────

/// A price-history lookup. At least one of `barcode` and `name` is
/// required; when both are present the barcode wins.
#[derive(Debug, Clone, Default)]
pub struct HistoryRequest {
    pub barcode: Option<String>,
    pub name: Option<String>,
    pub city: Option<String>,
    pub chain: Option<String>,
    pub days: u32,
}

impl HistoryRequest {
    fn barcode(&self) -> Option<&str> {
        self.barcode.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// The name term, unless a barcode already decides the lookup.
    fn name(&self) -> Option<&str> {
        if self.barcode().is_some() {
            return None;
        }
        self.name.as_deref().filter(|s| !s.trim().is_empty())
    }

    fn chain(&self) -> Option<&str> {
        self.chain.as_deref().filter(|s| !s.trim().is_empty())
    }

    fn city(&self) -> Option<&str> {
        self.city.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// Price evolution over the last `days` days, one point per date that has
/// matching observations, ascending by date.
pub async fn history(
    pool: &SqlitePool,
    upstream: &Upstream,
    request: &HistoryRequest,
) -> Result<Vec<HistoryPoint>> {
    if request.barcode().is_none() && request.name().is_none() {
        bail!("history requires a barcode or a product name");
    }
    if request.days == 0 {
        return Ok(Vec::new());
    }

    let ingested = catalog::success_dates(pool, request.days as i64).await?;
    let mut points = if ingested.is_empty() {
        history_remote(upstream, request).await?
    } else {
        let mut points = Vec::new();
        for date in &ingested {
            let stats = history_catalog_date(pool, date, request).await?;
            if !stats.is_empty() {
                points.push(HistoryPoint {
                    date: date.clone(),
                    prices: stats,
                });
            }
        }
        points
    };

    points.sort_by(|a, b| a.date.cmp(&b.date));
    Ok(points)
}

async fn history_catalog_date(
    pool: &SqlitePool,
    date: &str,
    request: &HistoryRequest,
) -> Result<Vec<ChainStat>> {
    let products = catalog::history_products(
        pool,
        date,
        request.barcode(),
        request.name(),
        request.chain(),
    )
    .await?;
    if products.is_empty() {
        return Ok(Vec::new());
    }

    let chains = distinct_chains(&products);
    let ids = distinct_ids(&products);
    let stores = catalog::stores_for_chains(pool, date, &chains, request.city()).await?;
    let store_index = index_stores(stores);
    let prices = catalog::prices_for(pool, date, &chains, &ids).await?;

    Ok(aggregate_by_chain(&products, &prices, &store_index))
}

async fn history_remote(upstream: &Upstream, request: &HistoryRequest) -> Result<Vec<HistoryPoint>> {
    let archives = upstream.list_archives().await?;
    let dates: Vec<String> = archives
        .iter()
        .take(request.days as usize)
        .map(|a| a.date.clone())
        .collect();

    let semaphore = Arc::new(Semaphore::new(HISTORY_DATE_CONCURRENCY));
    let mut handles = Vec::with_capacity(dates.len());
    for date in dates {
        let semaphore = Arc::clone(&semaphore);
        let request = request.clone();
        let upstream_date = date.clone();
        let matcher = Matcher::Lookup {
            barcode: request.barcode().map(str::to_string),
            name: request.name().map(str::to_lowercase),
        };
        let chain = request.chain().map(str::to_string);
        let city = request.city().map(str::to_string);
        let upstream = upstream.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            let archive = upstream.open(&upstream_date).await?;
            let (products, prices, store_index) = two_phase(
                &archive,
                &upstream_date,
                matcher,
                chain.as_deref(),
                city.as_deref(),
            )
            .await?;
            anyhow::Ok((
                upstream_date,
                aggregate_by_chain(&products, &prices, &store_index),
            ))
        }));
    }

    let mut points = Vec::new();
    for handle in handles {
        match handle.await? {
            Ok((date, stats)) => {
                if !stats.is_empty() {
                    points.push(HistoryPoint {
                        date,
                        prices: stats,
                    });
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "history date skipped");
            }
        }
    }
    Ok(points)
}

// ─── Two-phase archive extraction ───────────────────────────────────────

/// How phase A decides whether a product is interesting.
#[derive(Clone)]
enum Matcher {
    /// Search: substring over name/brand (lowercased), exact barcode.
    Query(String),
    /// History: exact barcode wins, else name substring.
    Lookup {
        barcode: Option<String>,
        name: Option<String>,
    },
}

impl Matcher {
    fn matches(&self, product: &ProductRec) -> bool {
        match self {
            Matcher::Query(q) => {
                product.name.to_lowercase().contains(q.as_str())
                    || product.brand.to_lowercase().contains(q.as_str())
                    || product.barcode == *q
            }
            Matcher::Lookup { barcode, name } => {
                if let Some(barcode) = barcode {
                    return product.barcode == *barcode;
                }
                match name {
                    Some(name) => product.name.to_lowercase().contains(name.as_str()),
                    None => false,
                }
            }
        }
    }
}

/// Phase A then phase B over one archive: matched products, the matching
/// chains' price rows, and a store index already narrowed to `city`.
async fn two_phase(
    archive: &Archive,
    date: &str,
    matcher: Matcher,
    chain: Option<&str>,
    city: Option<&str>,
) -> Result<(Vec<ProductRec>, Vec<PriceRec>, HashMap<(String, String), StoreRec>)> {
    let chains: Vec<String> = archive
        .chains()
        .into_iter()
        .filter(|c| chain.map_or(true, |only| c == only))
        .collect();

    // Phase A: products.csv only, every chain.
    let semaphore = Arc::new(Semaphore::new(FETCH_CONCURRENCY));
    let mut handles = Vec::with_capacity(chains.len());
    for chain in &chains {
        let semaphore = Arc::clone(&semaphore);
        let archive = archive.clone();
        let chain = chain.clone();
        let date = date.to_string();
        let matcher = matcher.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            let text = archive.read_csv(&chain, PRODUCTS_CSV).await?;
            let mut matched = Vec::new();
            if let Ok(table) = rows::Table::parse(&text) {
                for row in table {
                    let product = ingest::map_product(&row, &chain, &date);
                    if matcher.matches(&product) {
                        matched.push(product);
                    }
                }
            }
            Ok::<_, crate::error::ArchiveError>((chain, matched))
        }));
    }

    let mut products = Vec::new();
    let mut matched_chains = Vec::new();
    for handle in handles {
        match handle.await? {
            Ok((chain, mut matched)) => {
                if !matched.is_empty() {
                    matched_chains.push(chain);
                    products.append(&mut matched);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "chain skipped in product scan");
            }
        }
    }

    if products.is_empty() {
        return Ok((Vec::new(), Vec::new(), HashMap::new()));
    }

    // Phase B: stores.csv and prices.csv for matching chains only.
    let semaphore = Arc::new(Semaphore::new(FETCH_CONCURRENCY));
    let mut handles = Vec::with_capacity(matched_chains.len());
    for chain in &matched_chains {
        let semaphore = Arc::clone(&semaphore);
        let archive = archive.clone();
        let chain = chain.clone();
        let date = date.to_string();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            let stores_text = archive.read_csv(&chain, STORES_CSV).await?;
            let prices_text = archive.read_csv(&chain, PRICES_CSV).await?;

            let mut stores = Vec::new();
            if let Ok(table) = rows::Table::parse(&stores_text) {
                stores = table.map(|row| ingest::map_store(&row, &chain, &date)).collect();
            }
            let mut prices = Vec::new();
            if let Ok(table) = rows::Table::parse(&prices_text) {
                prices = table.map(|row| ingest::map_price(&row, &chain, &date)).collect();
            }
            Ok::<_, crate::error::ArchiveError>((stores, prices))
        }));
    }

    let mut stores = Vec::new();
    let mut prices = Vec::new();
    for handle in handles {
        match handle.await? {
            Ok((mut chain_stores, mut chain_prices)) => {
                stores.append(&mut chain_stores);
                prices.append(&mut chain_prices);
            }
            Err(err) => {
                tracing::warn!(error = %err, "chain skipped in store/price fetch");
            }
        }
    }

    if let Some(city) = city {
        let needle = city.to_lowercase();
        stores.retain(|s| s.city.to_lowercase().contains(&needle));
    }

    Ok((products, prices, index_stores(stores)))
}

// ─── Merge & aggregation ────────────────────────────────────────────────

fn distinct_chains(products: &[ProductRec]) -> Vec<String> {
    let mut chains: Vec<String> = products.iter().map(|p| p.chain.clone()).collect();
    chains.sort();
    chains.dedup();
    chains
}

fn distinct_ids(products: &[ProductRec]) -> Vec<String> {
    let mut ids: Vec<String> = products.iter().map(|p| p.product_id.clone()).collect();
    ids.sort();
    ids.dedup();
    ids
}

fn index_stores(stores: Vec<StoreRec>) -> HashMap<(String, String), StoreRec> {
    stores
        .into_iter()
        .map(|s| ((s.chain.clone(), s.store_id.clone()), s))
        .collect()
}

/// Merge matched products into fingerprint groups and attach every price
/// whose store passed the city filter. Orphan prices (no matched product,
/// no store) are skipped. Groups with no prices are dropped; the rest sort
/// by price count descending, capped at [`GROUP_LIMIT`].
fn merge_groups(
    products: &[ProductRec],
    prices: &[PriceRec],
    stores: &HashMap<(String, String), StoreRec>,
) -> Vec<ProductGroup> {
    let mut groups: Vec<ProductGroup> = Vec::new();
    let mut by_fingerprint: HashMap<String, usize> = HashMap::new();
    let mut member_group: HashMap<(String, String), usize> = HashMap::new();

    for product in products {
        let fingerprint = if product.barcode.is_empty() {
            format!("{}\u{1f}{}", product.chain, product.product_id)
        } else {
            product.barcode.clone()
        };
        let idx = *by_fingerprint.entry(fingerprint).or_insert_with(|| {
            groups.push(ProductGroup {
                barcode: product.barcode.clone(),
                name: product.name.clone(),
                brand: product.brand.clone(),
                category: product.category.clone(),
                unit: product.unit.clone(),
                quantity: product.quantity.clone(),
                prices: Vec::new(),
            });
            groups.len() - 1
        });
        member_group.insert((product.chain.clone(), product.product_id.clone()), idx);
    }

    for price in prices {
        let Some(&idx) = member_group.get(&(price.chain.clone(), price.product_id.clone())) else {
            continue;
        };
        let Some(store) = stores.get(&(price.chain.clone(), price.store_id.clone())) else {
            continue;
        };
        groups[idx].prices.push(PriceEntry {
            chain: price.chain.clone(),
            store_id: price.store_id.clone(),
            city: store.city.clone(),
            address: store.address.clone(),
            price: price.price,
            unit_price: price.unit_price,
            best_price_30: price.best_price_30,
            anchor_price: price.anchor_price,
            special_price: price.special_price,
        });
    }

    let mut groups: Vec<ProductGroup> = groups.into_iter().filter(|g| !g.prices.is_empty()).collect();
    groups.sort_by(|a, b| {
        b.prices
            .len()
            .cmp(&a.prices.len())
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.barcode.cmp(&b.barcode))
    });
    groups.truncate(GROUP_LIMIT);
    groups
}

/// Group price observations by chain and reduce to `min` / arithmetic mean.
/// An observation counts when its product matched and its store passed the
/// city filter. Chains without observations are omitted.
fn aggregate_by_chain(
    products: &[ProductRec],
    prices: &[PriceRec],
    stores: &HashMap<(String, String), StoreRec>,
) -> Vec<ChainStat> {
    let members: HashSet<(&str, &str)> = products
        .iter()
        .map(|p| (p.chain.as_str(), p.product_id.as_str()))
        .collect();

    let mut by_chain: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for price in prices {
        if !members.contains(&(price.chain.as_str(), price.product_id.as_str())) {
            continue;
        }
        if !stores.contains_key(&(price.chain.clone(), price.store_id.clone())) {
            continue;
        }
        by_chain.entry(price.chain.as_str()).or_default().push(price.price);
    }

    by_chain
        .into_iter()
        .map(|(chain, observed)| {
            let min_price = observed.iter().cloned().fold(f64::INFINITY, f64::min);
            let avg_price = observed.iter().sum::<f64>() / observed.len() as f64;
            ChainStat {
                chain: chain.to_string(),
                min_price,
                avg_price,
            }
        })
        .collect()
}

// ─── Cities ─────────────────────────────────────────────────────────────

/// Known city names: the catalog's store cities when anything is ingested,
/// else the major-city floor merged with whatever the latest archive
/// exposes. Sorted for the target locale.
pub async fn cities(pool: &SqlitePool, upstream: &Upstream) -> Result<Vec<String>> {
    let mut set: std::collections::BTreeSet<String> =
        catalog::cities(pool).await?.into_iter().collect();

    if set.is_empty() {
        set.extend(MAJOR_CITIES.iter().map(|c| c.to_string()));
        match remote_cities(upstream).await {
            Ok(remote) => set.extend(remote),
            Err(err) => {
                tracing::warn!(error = %err, "remote city scan unavailable, using the floor list");
            }
        }
    }

    let mut list: Vec<String> = set.into_iter().collect();
    list.sort_by(|a, b| locale_cmp(a, b));
    Ok(list)
}

async fn remote_cities(upstream: &Upstream) -> Result<Vec<String>> {
    let archives = upstream.list_archives().await?;
    let Some(latest) = archives.first() else {
        return Ok(Vec::new());
    };
    let archive = upstream.open(&latest.date).await?;

    let semaphore = Arc::new(Semaphore::new(FETCH_CONCURRENCY));
    let mut handles = Vec::new();
    for chain in archive.chains() {
        let semaphore = Arc::clone(&semaphore);
        let archive = archive.clone();
        let date = latest.date.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            let text = archive.read_csv(&chain, STORES_CSV).await?;
            let mut cities = Vec::new();
            if let Ok(table) = rows::Table::parse(&text) {
                for row in table {
                    let store = ingest::map_store(&row, &chain, &date);
                    if !store.city.is_empty() {
                        cities.push(store.city);
                    }
                }
            }
            Ok::<_, crate::error::ArchiveError>(cities)
        }));
    }

    let mut cities = Vec::new();
    for handle in handles {
        match handle.await? {
            Ok(mut chain_cities) => cities.append(&mut chain_cities),
            Err(err) => tracing::warn!(error = %err, "chain skipped in city scan"),
        }
    }
    Ok(cities)
}

/// Compare strings in Croatian alphabet order (č after c, đ after d, š
/// after s, ž after z), case-insensitive. Digraph letters are compared as
/// their constituent characters.
pub fn locale_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    collation_key(a).cmp(&collation_key(b))
}

fn collation_key(s: &str) -> Vec<u32> {
    s.chars()
        .flat_map(|c| c.to_lowercase())
        .map(|c| match c {
            'a'..='z' => (c as u32 - 'a' as u32) * 3,
            'č' => ('c' as u32 - 'a' as u32) * 3 + 1,
            'ć' => ('c' as u32 - 'a' as u32) * 3 + 2,
            'đ' => ('d' as u32 - 'a' as u32) * 3 + 1,
            'š' => ('s' as u32 - 'a' as u32) * 3 + 1,
            'ž' => ('z' as u32 - 'a' as u32) * 3 + 1,
            other => 100 + other as u32,
        })
        .collect()
}

// ─── CLI wrappers ───────────────────────────────────────────────────────

/// `cjenik search` entry point.
pub async fn run_search(
    config: &Config,
    query: &str,
    date: Option<String>,
    city: Option<String>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let upstream = Upstream::new(&config.upstream)?;

    let date = match date {
        Some(date) => {
            dates::validate(&date)?;
            date
        }
        None => dates::today(),
    };

    let response = search(&pool, &upstream, &date, query, city.as_deref()).await?;
    if response.products.is_empty() {
        println!("No results.");
    } else {
        println!(
            "{} product(s) for {:?} on {} (source: {})",
            response.products.len(),
            query,
            response.actual_date,
            response.source
        );
        for group in &response.products {
            let label = if group.barcode.is_empty() {
                group.name.clone()
            } else {
                format!("{} [{}]", group.name, group.barcode)
            };
            println!("  {} — {}", label, group.brand);
            for entry in &group.prices {
                let special = entry
                    .special_price
                    .map(|p| format!(" (special {:.2})", p))
                    .unwrap_or_default();
                println!(
                    "    {} {} {}: {:.2}{}",
                    entry.chain, entry.store_id, entry.city, entry.price, special
                );
            }
        }
    }

    pool.close().await;
    Ok(())
}

/// `cjenik history` entry point.
pub async fn run_history(config: &Config, request: &HistoryRequest) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let upstream = Upstream::new(&config.upstream)?;

    let points = history(&pool, &upstream, request).await?;
    if points.is_empty() {
        println!("No history.");
    } else {
        for point in &points {
            let stats: Vec<String> = point
                .prices
                .iter()
                .map(|s| format!("{} min {:.2} avg {:.2}", s.chain, s.min_price, s.avg_price))
                .collect();
            println!("{}  {}", point.date, stats.join("  "));
        }
    }

    pool.close().await;
    Ok(())
}

/// `cjenik cities` entry point.
pub async fn run_cities(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let upstream = Upstream::new(&config.upstream)?;

    for city in cities(&pool, &upstream).await? {
        println!("{}", city);
    }

    pool.close().await;
    Ok(())
}

/// `cjenik status` entry point: the ingestion log, newest first.
pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let log = catalog::ingestion_log(&pool).await?;
    if log.is_empty() {
        println!("No ingested dates.");
    } else {
        println!(
            "{:<12} {:>8} {:>9} {:>9} {:<8} ERROR",
            "DATE", "STORES", "PRODUCTS", "PRICES", "STATUS"
        );
        for row in &log {
            println!(
                "{:<12} {:>8} {:>9} {:>9} {:<8} {}",
                row.date,
                row.store_count,
                row.product_count,
                row.price_count,
                row.status,
                row.error_message
            );
        }
    }

    pool.close().await;
    Ok(())
}
