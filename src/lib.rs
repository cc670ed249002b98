//! # Cjenik
//!
//! **Ingest, index, and query daily retail-price archives.**
//!
//! The upstream catalog service publishes one ZIP archive per calendar day
//! (~80 MB) containing per-chain folders of three CSVs: `stores.csv`,
//! `products.csv`, `prices.csv`. Cjenik answers two questions against a day
//! and a geography: which prices match a product search in a city, and how
//! a product's price evolved over the last N days.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   range     ┌───────────┐   bulk     ┌─────────┐
//! │  upstream  │────────────▶│  ingest   │───────────▶│ SQLite  │
//! │ (ZIP/day)  │  requests   │  driver   │  replace   │ catalog │
//! └─────┬──────┘             └───────────┘            └────┬────┘
//!       │                                                  │
//!       │          on-demand ┌───────────┐   catalog-first │
//!       └────────────────────│   query   │◀────────────────┘
//!            two-phase fetch │   layer   │
//!                            └───────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **archive client** ([`upstream`]) lists published days, probes
//!    archive sizes, and opens [`upstream::Archive`] handles whose central
//!    directory is parsed once per URL by the **range reader** ([`zip`]).
//! 2. The **ingest driver** ([`ingest`]) decodes each chain's CSVs
//!    ([`rows`]) with bounded concurrency and atomically replaces the
//!    day's rows in the **catalog** ([`catalog`]).
//! 3. The **query layer** ([`query`]) answers search and history from the
//!    catalog when the day is ingested, else directly from the remote
//!    archive with a two-phase fetch that only pays for matching chains.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types: stores, products, prices, query shapes |
//! | [`rows`] | CSV decoding for the upstream's dialect |
//! | [`zip`] | Random-access ZIP reading over HTTP byte ranges |
//! | [`upstream`] | Archive client: list, size probe, member reads, caches |
//! | [`catalog`] | SQLite catalog: atomic per-date replace and reads |
//! | [`ingest`] | Ingest driver with bounded per-chain concurrency |
//! | [`query`] | Product search and price history with db→zip fallback |
//! | [`dates`] | ISO date helpers and the target-locale "today" |
//! | [`error`] | Archive failure taxonomy |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`migrate`] | Database schema migrations (idempotent) |

pub mod catalog;
pub mod config;
pub mod dates;
pub mod db;
pub mod error;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod query;
pub mod rows;
pub mod upstream;
pub mod zip;
