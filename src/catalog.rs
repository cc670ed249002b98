//! Persistent price catalog.
//!
//! Exclusively owns the four tables created by [`crate::migrate`]. The only
//! write is [`replace_date`]: an atomic per-date replace that deletes and
//! reloads every row for a date inside one transaction, then records the
//! outcome in `ingestion_log`. Readers either see the full previous state
//! or the full new state for a date, never a mixture.
//!
//! The catalog is a durable cache of the upstream, not a system of record;
//! rows for a date are destroyed only by a subsequent re-ingest of that
//! date.

use anyhow::Result;
use sqlx::{QueryBuilder, SqlitePool};

use crate::models::{IngestionLogRow, PriceRec, ProductRec, StoreRec};

/// Rows per INSERT statement, sized for SQLite bind-parameter limits.
const INSERT_BATCH: usize = 500;

/// Hard cap on product matches considered by a search.
pub const PRODUCT_MATCH_LIMIT: i64 = 500;

/// Everything ingested for one date.
#[derive(Debug, Default)]
pub struct DateBundle {
    pub stores: Vec<StoreRec>,
    pub products: Vec<ProductRec>,
    pub prices: Vec<PriceRec>,
}

/// Atomically replace all rows for `date` and record success with counts.
/// On error the transaction rolls back; the caller is expected to persist
/// the failure via [`record_failure`].
pub async fn replace_date(pool: &SqlitePool, date: &str, bundle: &DateBundle) -> Result<()> {
    let mut tx = pool.begin().await?;

    for table in ["prices", "products", "stores"] {
        sqlx::query(&format!("DELETE FROM {} WHERE date = ?", table))
            .bind(date)
            .execute(&mut *tx)
            .await?;
    }

    for chunk in bundle.stores.chunks(INSERT_BATCH) {
        let mut qb = QueryBuilder::new(
            "INSERT INTO stores (store_id, chain, date, type, address, city, zipcode) ",
        );
        qb.push_values(chunk, |mut b, s| {
            b.push_bind(&s.store_id)
                .push_bind(&s.chain)
                .push_bind(&s.date)
                .push_bind(&s.kind)
                .push_bind(&s.address)
                .push_bind(&s.city)
                .push_bind(&s.zipcode);
        });
        qb.build().execute(&mut *tx).await?;
    }

    for chunk in bundle.products.chunks(INSERT_BATCH) {
        let mut qb = QueryBuilder::new(
            "INSERT INTO products (product_id, chain, date, barcode, name, brand, category, unit, quantity) ",
        );
        qb.push_values(chunk, |mut b, p| {
            b.push_bind(&p.product_id)
                .push_bind(&p.chain)
                .push_bind(&p.date)
                .push_bind(&p.barcode)
                .push_bind(&p.name)
                .push_bind(&p.brand)
                .push_bind(&p.category)
                .push_bind(&p.unit)
                .push_bind(&p.quantity);
        });
        qb.build().execute(&mut *tx).await?;
    }

    for chunk in bundle.prices.chunks(INSERT_BATCH) {
        let mut qb = QueryBuilder::new(
            "INSERT INTO prices (chain, store_id, product_id, date, price, unit_price, best_price_30, anchor_price, special_price) ",
        );
        qb.push_values(chunk, |mut b, p| {
            b.push_bind(&p.chain)
                .push_bind(&p.store_id)
                .push_bind(&p.product_id)
                .push_bind(&p.date)
                .push_bind(p.price)
                .push_bind(p.unit_price)
                .push_bind(p.best_price_30)
                .push_bind(p.anchor_price)
                .push_bind(p.special_price);
        });
        qb.build().execute(&mut *tx).await?;
    }

    sqlx::query(
        r#"
        INSERT INTO ingestion_log (date, ingested_at, store_count, product_count, price_count, status, error_message)
        VALUES (?, ?, ?, ?, ?, ?, '')
        ON CONFLICT(date) DO UPDATE SET
            ingested_at = excluded.ingested_at,
            store_count = excluded.store_count,
            product_count = excluded.product_count,
            price_count = excluded.price_count,
            status = excluded.status,
            error_message = ''
        "#,
    )
    .bind(date)
    .bind(chrono::Utc::now().timestamp())
    .bind(bundle.stores.len() as i64)
    .bind(bundle.products.len() as i64)
    .bind(bundle.prices.len() as i64)
    .bind(IngestionLogRow::STATUS_SUCCESS)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Record a failed ingest attempt for `date`.
pub async fn record_failure(pool: &SqlitePool, date: &str, message: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ingestion_log (date, ingested_at, store_count, product_count, price_count, status, error_message)
        VALUES (?, ?, 0, 0, 0, ?, ?)
        ON CONFLICT(date) DO UPDATE SET
            ingested_at = excluded.ingested_at,
            status = excluded.status,
            error_message = excluded.error_message
        "#,
    )
    .bind(date)
    .bind(chrono::Utc::now().timestamp())
    .bind(IngestionLogRow::STATUS_ERROR)
    .bind(message)
    .execute(pool)
    .await?;
    Ok(())
}

/// True iff `date` has a `success` row in the ingestion log.
pub async fn is_date_ingested(pool: &SqlitePool, date: &str) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM ingestion_log WHERE date = ? AND status = ?")
            .bind(date)
            .bind(IngestionLogRow::STATUS_SUCCESS)
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}

/// Most recent successfully ingested date, if any.
pub async fn latest_ingested_date(pool: &SqlitePool) -> Result<Option<String>> {
    let date: Option<String> =
        sqlx::query_scalar("SELECT MAX(date) FROM ingestion_log WHERE status = ?")
            .bind(IngestionLogRow::STATUS_SUCCESS)
            .fetch_one(pool)
            .await?;
    Ok(date)
}

/// The most recent `limit` successfully ingested dates, newest first.
pub async fn success_dates(pool: &SqlitePool, limit: i64) -> Result<Vec<String>> {
    let dates = sqlx::query_scalar(
        "SELECT date FROM ingestion_log WHERE status = ? ORDER BY date DESC LIMIT ?",
    )
    .bind(IngestionLogRow::STATUS_SUCCESS)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(dates)
}

/// Full ingestion log, newest first. Backs `cjenik status`.
pub async fn ingestion_log(pool: &SqlitePool) -> Result<Vec<IngestionLogRow>> {
    let rows = sqlx::query_as::<_, IngestionLogRow>(
        "SELECT date, ingested_at, store_count, product_count, price_count, status, error_message
         FROM ingestion_log ORDER BY date DESC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// The ingestion log row for one date.
pub async fn log_row(pool: &SqlitePool, date: &str) -> Result<Option<IngestionLogRow>> {
    let row = sqlx::query_as::<_, IngestionLogRow>(
        "SELECT date, ingested_at, store_count, product_count, price_count, status, error_message
         FROM ingestion_log WHERE date = ?",
    )
    .bind(date)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Products on `date` whose name or brand contains `q` (already lowercased
/// and trimmed by the caller) or whose barcode equals it exactly.
pub async fn match_products(pool: &SqlitePool, date: &str, q: &str) -> Result<Vec<ProductRec>> {
    let like = format!("%{}%", q);
    let products = sqlx::query_as::<_, ProductRec>(
        "SELECT product_id, chain, date, barcode, name, brand, category, unit, quantity
         FROM products
         WHERE date = ? AND (name LIKE ? OR brand LIKE ? OR barcode = ?)
         LIMIT ?",
    )
    .bind(date)
    .bind(&like)
    .bind(&like)
    .bind(q)
    .bind(PRODUCT_MATCH_LIMIT)
    .fetch_all(pool)
    .await?;
    Ok(products)
}

/// Products on `date` matching a history lookup: exact barcode when given
/// (barcode wins), else name substring; optionally restricted to a chain.
pub async fn history_products(
    pool: &SqlitePool,
    date: &str,
    barcode: Option<&str>,
    name: Option<&str>,
    chain: Option<&str>,
) -> Result<Vec<ProductRec>> {
    let mut qb = QueryBuilder::new(
        "SELECT product_id, chain, date, barcode, name, brand, category, unit, quantity
         FROM products WHERE date = ",
    );
    qb.push_bind(date);

    if let Some(barcode) = barcode {
        qb.push(" AND barcode = ").push_bind(barcode);
    } else if let Some(name) = name {
        qb.push(" AND name LIKE ")
            .push_bind(format!("%{}%", name.trim().to_lowercase()));
    }
    if let Some(chain) = chain {
        qb.push(" AND chain = ").push_bind(chain);
    }
    qb.push(" LIMIT ").push_bind(PRODUCT_MATCH_LIMIT);

    let products = qb.build_query_as::<ProductRec>().fetch_all(pool).await?;
    Ok(products)
}

/// Stores on `date` for the given chains, optionally filtered by a city
/// substring.
pub async fn stores_for_chains(
    pool: &SqlitePool,
    date: &str,
    chains: &[String],
    city: Option<&str>,
) -> Result<Vec<StoreRec>> {
    if chains.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb = QueryBuilder::new(
        "SELECT store_id, chain, date, type, address, city, zipcode FROM stores WHERE date = ",
    );
    qb.push_bind(date);
    qb.push(" AND chain IN (");
    let mut sep = qb.separated(", ");
    for chain in chains {
        sep.push_bind(chain);
    }
    qb.push(")");
    if let Some(city) = city {
        qb.push(" AND city LIKE ").push_bind(format!("%{}%", city));
    }

    let stores = qb.build_query_as::<StoreRec>().fetch_all(pool).await?;
    Ok(stores)
}

/// Prices on `date` for the given chains and product ids.
pub async fn prices_for(
    pool: &SqlitePool,
    date: &str,
    chains: &[String],
    product_ids: &[String],
) -> Result<Vec<PriceRec>> {
    if chains.is_empty() || product_ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb = QueryBuilder::new(
        "SELECT chain, store_id, product_id, date, price, unit_price, best_price_30, anchor_price, special_price
         FROM prices WHERE date = ",
    );
    qb.push_bind(date);
    qb.push(" AND chain IN (");
    let mut sep = qb.separated(", ");
    for chain in chains {
        sep.push_bind(chain);
    }
    qb.push(") AND product_id IN (");
    let mut sep = qb.separated(", ");
    for id in product_ids {
        sep.push_bind(id);
    }
    qb.push(")");

    let prices = qb.build_query_as::<PriceRec>().fetch_all(pool).await?;
    Ok(prices)
}

/// Distinct non-empty city names across all ingested dates.
pub async fn cities(pool: &SqlitePool) -> Result<Vec<String>> {
    let cities =
        sqlx::query_scalar("SELECT DISTINCT city FROM stores WHERE city != '' ORDER BY city")
            .fetch_all(pool)
            .await?;
    Ok(cities)
}


#[cfg(test)]
mod tests {
    use super::testkit::*;
    use super::*;

    #[tokio::test]
    async fn replace_date_writes_rows_and_success_log() {
        let pool = test_pool().await;
        let bundle = DateBundle {
            stores: vec![store("lidl", "S1", "2025-06-01", "Zagreb")],
            products: vec![product("lidl", "A1", "2025-06-01", "5901234123457", "Mlijeko 1L")],
            prices: vec![price("lidl", "S1", "A1", "2025-06-01", 1.29)],
        };
        replace_date(&pool, "2025-06-01", &bundle).await.unwrap();

        assert!(is_date_ingested(&pool, "2025-06-01").await.unwrap());
        let log = log_row(&pool, "2025-06-01").await.unwrap().unwrap();
        assert_eq!(log.status, IngestionLogRow::STATUS_SUCCESS);
        assert_eq!(log.store_count, 1);
        assert_eq!(log.product_count, 1);
        assert_eq!(log.price_count, 1);
    }

    #[tokio::test]
    async fn replace_date_is_idempotent() {
        let pool = test_pool().await;
        let bundle = DateBundle {
            stores: vec![store("lidl", "S1", "2025-06-01", "Zagreb")],
            products: vec![product("lidl", "A1", "2025-06-01", "", "Jaja M")],
            prices: vec![price("lidl", "S1", "A1", "2025-06-01", 2.10)],
        };
        replace_date(&pool, "2025-06-01", &bundle).await.unwrap();
        replace_date(&pool, "2025-06-01", &bundle).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM prices WHERE date = ?")
            .bind("2025-06-01")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn replace_date_drops_rows_absent_from_the_new_load() {
        let pool = test_pool().await;
        let first = DateBundle {
            stores: vec![
                store("lidl", "S1", "2025-06-01", "Zagreb"),
                store("lidl", "S2", "2025-06-01", "Split"),
            ],
            ..Default::default()
        };
        replace_date(&pool, "2025-06-01", &first).await.unwrap();

        let second = DateBundle {
            stores: vec![store("lidl", "S1", "2025-06-01", "Zagreb")],
            ..Default::default()
        };
        replace_date(&pool, "2025-06-01", &second).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stores WHERE date = ?")
            .bind("2025-06-01")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn failure_then_success_transitions_the_log() {
        let pool = test_pool().await;
        record_failure(&pool, "2025-06-01", "directory fetch failed")
            .await
            .unwrap();
        assert!(!is_date_ingested(&pool, "2025-06-01").await.unwrap());
        let log = log_row(&pool, "2025-06-01").await.unwrap().unwrap();
        assert_eq!(log.status, IngestionLogRow::STATUS_ERROR);
        assert_eq!(log.error_message, "directory fetch failed");

        replace_date(&pool, "2025-06-01", &DateBundle::default())
            .await
            .unwrap();
        assert!(is_date_ingested(&pool, "2025-06-01").await.unwrap());
        let log = log_row(&pool, "2025-06-01").await.unwrap().unwrap();
        assert_eq!(log.error_message, "");
    }

    #[tokio::test]
    async fn latest_and_recent_dates_order_lexically() {
        let pool = test_pool().await;
        for date in ["2025-05-30", "2025-06-02", "2025-06-01"] {
            replace_date(&pool, date, &DateBundle::default())
                .await
                .unwrap();
        }
        record_failure(&pool, "2025-06-03", "boom").await.unwrap();

        assert_eq!(
            latest_ingested_date(&pool).await.unwrap().as_deref(),
            Some("2025-06-02")
        );
        assert_eq!(
            success_dates(&pool, 2).await.unwrap(),
            vec!["2025-06-02", "2025-06-01"]
        );
    }

    #[tokio::test]
    async fn match_products_covers_name_brand_and_barcode() {
        let pool = test_pool().await;
        let bundle = DateBundle {
            products: vec![
                product("lidl", "A1", "2025-06-01", "5901234123457", "Mlijeko 1L"),
                product("spar", "B7", "2025-06-01", "", "Kruh polubijeli"),
            ],
            ..Default::default()
        };
        replace_date(&pool, "2025-06-01", &bundle).await.unwrap();

        let by_name = match_products(&pool, "2025-06-01", "mlij").await.unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].product_id, "A1");

        // brand is "Latte" for both test products
        let by_brand = match_products(&pool, "2025-06-01", "latte").await.unwrap();
        assert_eq!(by_brand.len(), 2);

        let by_barcode = match_products(&pool, "2025-06-01", "5901234123457")
            .await
            .unwrap();
        assert_eq!(by_barcode.len(), 1);

        let miss = match_products(&pool, "2025-06-01", "čokolada").await.unwrap();
        assert!(miss.is_empty());
    }

    #[tokio::test]
    async fn stores_filter_by_chain_set_and_city_substring() {
        let pool = test_pool().await;
        let bundle = DateBundle {
            stores: vec![
                store("lidl", "S1", "2025-06-01", "Zagreb"),
                store("lidl", "S2", "2025-06-01", "Velika Gorica"),
                store("spar", "S3", "2025-06-01", "Zagreb"),
                store("tommy", "S4", "2025-06-01", "Split"),
            ],
            ..Default::default()
        };
        replace_date(&pool, "2025-06-01", &bundle).await.unwrap();

        let chains = vec!["lidl".to_string(), "spar".to_string()];
        let all = stores_for_chains(&pool, "2025-06-01", &chains, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let zagreb = stores_for_chains(&pool, "2025-06-01", &chains, Some("zagreb"))
            .await
            .unwrap();
        assert_eq!(zagreb.len(), 2);

        let none = stores_for_chains(&pool, "2025-06-01", &[], None).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn cities_are_distinct_and_non_empty() {
        let pool = test_pool().await;
        let mut bundle = DateBundle {
            stores: vec![
                store("lidl", "S1", "2025-06-01", "Zagreb"),
                store("spar", "S2", "2025-06-01", "Zagreb"),
                store("tommy", "S3", "2025-06-01", "Split"),
            ],
            ..Default::default()
        };
        bundle.stores.push(store("ktc", "S4", "2025-06-01", ""));
        replace_date(&pool, "2025-06-01", &bundle).await.unwrap();

        assert_eq!(cities(&pool).await.unwrap(), vec!["Split", "Zagreb"]);
    }
}
