//! Database schema migrations.
//!
//! Creates the four catalog tables and their composite indexes. Designed to
//! be run via `cjenik init`; every statement is idempotent.
//!
//! # Tables
//!
//! | Table | Purpose | Indexes |
//! |-------|---------|---------|
//! | `stores` | Physical outlets per (chain, date) | (chain,date), (city), (store_id,chain,date) |
//! | `products` | Catalog items per (chain, date) | (chain,date), (barcode,date), (name,date), (product_id,chain,date) |
//! | `prices` | Price observations per (chain, store, product, date) | (chain,date), (product_id,chain,date), (store_id,chain,date) |
//! | `ingestion_log` | One row per ingested date | unique(date) |
//!
//! No foreign keys: price rows reference stores and products by convention,
//! and the query layer tolerates orphans by skipping them.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stores (
            store_id TEXT NOT NULL DEFAULT '',
            chain TEXT NOT NULL DEFAULT '',
            date TEXT NOT NULL DEFAULT '',
            type TEXT NOT NULL DEFAULT '',
            address TEXT NOT NULL DEFAULT '',
            city TEXT NOT NULL DEFAULT '',
            zipcode TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS products (
            product_id TEXT NOT NULL DEFAULT '',
            chain TEXT NOT NULL DEFAULT '',
            date TEXT NOT NULL DEFAULT '',
            barcode TEXT NOT NULL DEFAULT '',
            name TEXT NOT NULL DEFAULT '',
            brand TEXT NOT NULL DEFAULT '',
            category TEXT NOT NULL DEFAULT '',
            unit TEXT NOT NULL DEFAULT '',
            quantity TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prices (
            chain TEXT NOT NULL DEFAULT '',
            store_id TEXT NOT NULL DEFAULT '',
            product_id TEXT NOT NULL DEFAULT '',
            date TEXT NOT NULL DEFAULT '',
            price REAL NOT NULL DEFAULT 0,
            unit_price REAL,
            best_price_30 REAL,
            anchor_price REAL,
            special_price REAL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingestion_log (
            date TEXT PRIMARY KEY,
            ingested_at INTEGER NOT NULL,
            store_count INTEGER NOT NULL DEFAULT 0,
            product_count INTEGER NOT NULL DEFAULT 0,
            price_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            error_message TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_stores_chain_date ON stores(chain, date)",
        "CREATE INDEX IF NOT EXISTS idx_stores_city ON stores(city)",
        "CREATE INDEX IF NOT EXISTS idx_stores_id_chain_date ON stores(store_id, chain, date)",
        "CREATE INDEX IF NOT EXISTS idx_products_chain_date ON products(chain, date)",
        "CREATE INDEX IF NOT EXISTS idx_products_barcode_date ON products(barcode, date)",
        "CREATE INDEX IF NOT EXISTS idx_products_name_date ON products(name, date)",
        "CREATE INDEX IF NOT EXISTS idx_products_id_chain_date ON products(product_id, chain, date)",
        "CREATE INDEX IF NOT EXISTS idx_prices_chain_date ON prices(chain, date)",
        "CREATE INDEX IF NOT EXISTS idx_prices_product_chain_date ON prices(product_id, chain, date)",
        "CREATE INDEX IF NOT EXISTS idx_prices_store_chain_date ON prices(store_id, chain, date)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = db::connect_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(tables, vec!["ingestion_log", "prices", "products", "stores"]);
    }
}
