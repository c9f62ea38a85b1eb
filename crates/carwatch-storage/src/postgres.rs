use async_trait::async_trait;
use carwatch_core::{ListingSnapshot, NotificationRule, WatchCatalog, WatchDefinition};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::{validate_chunk, EntityStore, StoreConfig, StoreError};

const SELECT_PARTITION_SQL: &str = r#"
SELECT partition_key, id, trim_level, price, km_driven, year, description, region, href,
       first_seen, last_seen
FROM listing_snapshots
WHERE partition_key = $1
"#;

const UPSERT_SNAPSHOT_SQL: &str = r#"
INSERT INTO listing_snapshots (
    partition_key, id, trim_level, price, km_driven, year, description, region, href,
    first_seen, last_seen
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
ON CONFLICT (partition_key, id) DO UPDATE SET
    trim_level = EXCLUDED.trim_level,
    price = EXCLUDED.price,
    km_driven = EXCLUDED.km_driven,
    year = EXCLUDED.year,
    description = COALESCE(EXCLUDED.description, listing_snapshots.description),
    region = COALESCE(EXCLUDED.region, listing_snapshots.region),
    href = EXCLUDED.href,
    last_seen = EXCLUDED.last_seen
"#;

/// Postgres-backed store. Snapshots live in `listing_snapshots`, keyed by
/// `(partition_key, id)`.
#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&config.database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("store schema up to date");
        Ok(())
    }

    /// Replaces every watch definition and rule in one transaction.
    pub async fn replace_catalog(&self, catalog: &WatchCatalog) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM watch_definitions")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM notification_rules")
            .execute(&mut *tx)
            .await?;

        for watch in &catalog.watches {
            sqlx::query(
                "INSERT INTO watch_definitions (model, trim_level, earliest_year, max_km_driven) VALUES ($1, $2, $3, $4)",
            )
            .bind(&watch.model)
            .bind(&watch.trim)
            .bind(watch.earliest_year)
            .bind(watch.max_km_driven)
            .execute(&mut *tx)
            .await?;
        }

        for rule in &catalog.rules {
            sqlx::query(
                "INSERT INTO notification_rules (model, trim_level, price_threshold, earliest_year, max_km_driven, email) VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&rule.model)
            .bind(&rule.trim)
            .bind(rule.price_threshold)
            .bind(&rule.earliest_year)
            .bind(&rule.max_km_driven)
            .bind(&rule.email)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(
            watches = catalog.watches.len(),
            rules = catalog.rules.len(),
            "catalog replaced"
        );
        Ok(())
    }
}

fn snapshot_from_row(row: &PgRow) -> Result<ListingSnapshot, sqlx::Error> {
    Ok(ListingSnapshot {
        partition_key: row.try_get("partition_key")?,
        id: row.try_get("id")?,
        trim: row.try_get("trim_level")?,
        price: row.try_get("price")?,
        km_driven: row.try_get("km_driven")?,
        year: row.try_get("year")?,
        description: row.try_get("description")?,
        region: row.try_get("region")?,
        href: row.try_get("href")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn load_catalog(&self) -> Result<WatchCatalog, StoreError> {
        let watch_rows = sqlx::query(
            "SELECT model, trim_level, earliest_year, max_km_driven FROM watch_definitions ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        let rule_rows = sqlx::query(
            "SELECT model, trim_level, price_threshold, earliest_year, max_km_driven, email FROM notification_rules ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let watches = watch_rows
            .iter()
            .map(|row| -> Result<WatchDefinition, sqlx::Error> {
                Ok(WatchDefinition {
                    model: row.try_get("model")?,
                    trim: row.try_get("trim_level")?,
                    earliest_year: row.try_get("earliest_year")?,
                    max_km_driven: row.try_get("max_km_driven")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let rules = rule_rows
            .iter()
            .map(|row| -> Result<NotificationRule, sqlx::Error> {
                Ok(NotificationRule {
                    model: row.try_get("model")?,
                    trim: row.try_get("trim_level")?,
                    price_threshold: row.try_get("price_threshold")?,
                    earliest_year: row.try_get("earliest_year")?,
                    max_km_driven: row.try_get("max_km_driven")?,
                    email: row.try_get("email")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(WatchCatalog { watches, rules })
    }

    async fn read_partition(&self, partition_key: &str) -> Result<Vec<ListingSnapshot>, StoreError> {
        let rows = sqlx::query(SELECT_PARTITION_SQL)
            .bind(partition_key)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(snapshot_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn upsert_batch(&self, chunk: &[ListingSnapshot]) -> Result<(), StoreError> {
        validate_chunk(chunk)?;
        if chunk.is_empty() {
            return Ok(());
        }

        // Dropping the transaction on an early return rolls the whole chunk back.
        let mut tx = self.pool.begin().await?;
        for snapshot in chunk {
            sqlx::query(UPSERT_SNAPSHOT_SQL)
                .bind(&snapshot.partition_key)
                .bind(&snapshot.id)
                .bind(&snapshot.trim)
                .bind(snapshot.price)
                .bind(snapshot.km_driven)
                .bind(snapshot.year)
                .bind(&snapshot.description)
                .bind(&snapshot.region)
                .bind(&snapshot.href)
                .bind(snapshot.first_seen)
                .bind(snapshot.last_seen)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
