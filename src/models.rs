//! Core data types for the price catalog.
//!
//! The data lifecycle is:
//!
//! ```text
//! Archive (ZIP) → chain CSVs → StoreRec / ProductRec / PriceRec
//!                                       ↓
//!                            catalog (replace per date)
//!                                       ↓
//!                      search() → ProductGroup   history() → HistoryPoint
//! ```
//!
//! All entities are immutable once written for a given `date`; re-ingest of
//! the same date replaces all rows for that date atomically.

use serde::Serialize;

/// A physical outlet within a chain on a date.
/// `(chain, store_id, date)` is unique within a successfully ingested date.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoreRec {
    pub store_id: String,
    pub chain: String,
    pub date: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub address: String,
    pub city: String,
    pub zipcode: String,
}

/// A catalog item offered by a chain on a date.
/// `(chain, product_id, date)` is unique. A non-empty `barcode` is a global
/// EAN and merges the same product across chains.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProductRec {
    pub product_id: String,
    pub chain: String,
    pub date: String,
    pub barcode: String,
    pub name: String,
    pub brand: String,
    pub category: String,
    pub unit: String,
    pub quantity: String,
}

/// One price record for one product at one store on a date, keyed by
/// `(chain, store_id, product_id, date)`. The four optional columns may be
/// absent in the feed.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PriceRec {
    pub chain: String,
    pub store_id: String,
    pub product_id: String,
    pub date: String,
    pub price: f64,
    pub unit_price: Option<f64>,
    pub best_price_30: Option<f64>,
    pub anchor_price: Option<f64>,
    pub special_price: Option<f64>,
}

/// One row per date in `ingestion_log`; surfaces which dates are queryable.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IngestionLogRow {
    pub date: String,
    pub ingested_at: i64,
    pub store_count: i64,
    pub product_count: i64,
    pub price_count: i64,
    pub status: String,
    pub error_message: String,
}

impl IngestionLogRow {
    pub const STATUS_SUCCESS: &'static str = "success";
    pub const STATUS_ERROR: &'static str = "error";
}

/// Where a query answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Answered from the ingested catalog.
    Db,
    /// Answered by on-demand range extraction from the remote archive.
    Zip,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Db => write!(f, "db"),
            Source::Zip => write!(f, "zip"),
        }
    }
}

/// Search result: merged product groups, the date actually answered for,
/// and the source that answered.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub products: Vec<ProductGroup>,
    pub actual_date: String,
    pub source: Source,
}

/// Products merged by fingerprint (barcode when non-empty, else
/// `(chain, product_id)`), with every observable price attached.
#[derive(Debug, Clone, Serialize)]
pub struct ProductGroup {
    pub barcode: String,
    pub name: String,
    pub brand: String,
    pub category: String,
    pub unit: String,
    pub quantity: String,
    pub prices: Vec<PriceEntry>,
}

/// One observed price inside a [`ProductGroup`], joined with its store.
#[derive(Debug, Clone, Serialize)]
pub struct PriceEntry {
    pub chain: String,
    pub store_id: String,
    pub city: String,
    pub address: String,
    pub price: f64,
    pub unit_price: Option<f64>,
    pub best_price_30: Option<f64>,
    pub anchor_price: Option<f64>,
    pub special_price: Option<f64>,
}

/// One point of a price-history series; dates ascend and appear once.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPoint {
    pub date: String,
    pub prices: Vec<ChainStat>,
}

/// Per-chain aggregation for one history date. `avg_price` is the arithmetic
/// mean over store observations, equal weight per observation.
#[derive(Debug, Clone, Serialize)]
pub struct ChainStat {
    pub chain: String,
    pub min_price: f64,
    pub avg_price: f64,
}
