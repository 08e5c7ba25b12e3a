use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use radar_core::{ParentRef, ProductFilter, ProductRecord};
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use tracing::{debug, info};

use crate::products::{check_children, ProductStore, StorageError};

const SELECT_COLUMNS: &str = "SELECT id, title, price, currency, brand, secondary_id, images_json, \
     url, marketplace_domain, locale_hint, parent_id, fetched_at FROM products";

const UPSERT_SQL: &str = r#"
    INSERT INTO products (
        id, title, price, currency, brand, secondary_id, images_json,
        url, marketplace_domain, locale_hint, parent_id, fetched_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        title = excluded.title,
        price = excluded.price,
        currency = excluded.currency,
        brand = excluded.brand,
        secondary_id = excluded.secondary_id,
        images_json = excluded.images_json,
        url = excluded.url,
        marketplace_domain = excluded.marketplace_domain,
        locale_hint = excluded.locale_hint,
        parent_id = excluded.parent_id,
        fetched_at = excluded.fetched_at
"#;

/// SQLite-backed product store. `seq` preserves first-insertion order across upserts.
#[derive(Debug, Clone)]
pub struct SqliteProductStore {
    pool: Pool<Sqlite>,
}

impl SqliteProductStore {
    /// Open (creating if needed) a database file and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let label = path.display().to_string();
        Self::connect_with(SqliteConnectOptions::new().filename(path), &label).await
    }

    /// Connect with a `sqlite:` URL, e.g. `DATABASE_URL=sqlite://radar.db`.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        Self::connect_with(SqliteConnectOptions::from_str(database_url)?, database_url).await
    }

    async fn connect_with(opts: SqliteConnectOptions, label: &str) -> Result<Self, StorageError> {
        let opts = opts
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // One connection keeps every write strictly serialized.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(database = label, "product store ready");
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS products (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                title TEXT,
                price REAL,
                currency TEXT,
                brand TEXT,
                secondary_id TEXT,
                images_json TEXT NOT NULL DEFAULT '[]',
                url TEXT NOT NULL,
                marketplace_domain TEXT NOT NULL,
                locale_hint TEXT,
                parent_id TEXT,
                fetched_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_products_parent_id ON products(parent_id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn upsert_query<'q>(
    record: &ProductRecord,
) -> Result<sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>, StorageError> {
    let images_json = serde_json::to_string(&record.images).map_err(|e| StorageError::CorruptRow {
        id: record.id.clone(),
        reason: format!("encoding images: {e}"),
    })?;
    Ok(sqlx::query(UPSERT_SQL)
        .bind(record.id.clone())
        .bind(record.title.clone())
        .bind(record.price)
        .bind(record.currency.clone())
        .bind(record.brand.clone())
        .bind(record.secondary_id.clone())
        .bind(images_json)
        .bind(record.url.clone())
        .bind(record.marketplace_domain.clone())
        .bind(record.locale_hint.clone())
        .bind(record.parent_id.clone())
        .bind(record.fetched_at.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
}

fn row_to_record(row: &SqliteRow) -> Result<ProductRecord, StorageError> {
    let id: String = row.try_get("id")?;
    let images_json: String = row.try_get("images_json")?;
    let images = serde_json::from_str::<Vec<String>>(&images_json).map_err(|e| {
        StorageError::CorruptRow {
            id: id.clone(),
            reason: format!("images_json: {e}"),
        }
    })?;
    let fetched_at_text: String = row.try_get("fetched_at")?;
    let fetched_at = DateTime::parse_from_rfc3339(&fetched_at_text)
        .map_err(|e| StorageError::CorruptRow {
            id: id.clone(),
            reason: format!("fetched_at: {e}"),
        })?
        .with_timezone(&Utc);

    Ok(ProductRecord {
        title: row.try_get("title")?,
        price: row.try_get("price")?,
        currency: row.try_get("currency")?,
        brand: row.try_get("brand")?,
        secondary_id: row.try_get("secondary_id")?,
        images,
        url: row.try_get("url")?,
        marketplace_domain: row.try_get("marketplace_domain")?,
        locale_hint: row.try_get("locale_hint")?,
        parent_id: row.try_get("parent_id")?,
        fetched_at,
        id,
    })
}

#[async_trait]
impl ProductStore for SqliteProductStore {
    async fn upsert(&self, record: ProductRecord) -> Result<(), StorageError> {
        upsert_query(&record)?.execute(&self.pool).await?;
        debug!(id = %record.id, "upserted product");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ProductRecord>, StorageError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn search(&self, filter: &ProductFilter) -> Result<Vec<ProductRecord>, StorageError> {
        let mut qb = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        qb.push(" WHERE 1 = 1");
        match &filter.parent {
            None => {}
            Some(ParentRef::Root) => {
                qb.push(" AND parent_id IS NULL");
            }
            Some(ParentRef::AnyParent) => {
                qb.push(" AND parent_id IS NOT NULL");
            }
            Some(ParentRef::Of(parent_id)) => {
                qb.push(" AND parent_id = ");
                qb.push_bind(parent_id.clone());
            }
        }
        let columns = [
            ("brand", &filter.brand),
            ("currency", &filter.currency),
            ("marketplace_domain", &filter.marketplace_domain),
            ("locale_hint", &filter.locale_hint),
        ];
        for (column, value) in columns {
            if let Some(value) = value {
                qb.push(format!(" AND {column} = "));
                qb.push_bind(value.clone());
            }
        }
        qb.push(" ORDER BY seq");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn list_all(&self) -> Result<Vec<ProductRecord>, StorageError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY seq"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn replace_children(
        &self,
        parent_id: &str,
        records: Vec<ProductRecord>,
    ) -> Result<(), StorageError> {
        check_children(parent_id, &records)?;
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM products WHERE parent_id = ?")
            .bind(parent_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        for record in &records {
            upsert_query(record)?.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(parent_id, removed, inserted = records.len(), "replaced competitor set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::products::tests::{exercise_store_contract, record};
    use tempfile::tempdir;

    #[tokio::test]
    async fn sqlite_store_honors_contract() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteProductStore::open(dir.path().join("radar.db"))
            .await
            .expect("open store");
        exercise_store_contract(&store).await;
    }

    #[tokio::test]
    async fn open_creates_missing_parent_directories() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state/nested/radar.db");
        let store = SqliteProductStore::open(&path).await.expect("open");
        assert!(store.list_all().await.unwrap().is_empty());
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn sqlite_store_persists_across_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("radar.db");
        {
            let store = SqliteProductStore::open(&path).await.expect("open");
            store.upsert(record("B0CX23VSAS", None, "kept")).await.unwrap();
            store.pool().close().await;
        }
        let reopened = SqliteProductStore::open(&path).await.expect("reopen");
        let back = reopened.get("B0CX23VSAS").await.unwrap().unwrap();
        assert_eq!(back, record("B0CX23VSAS", None, "kept"));
    }

    #[tokio::test]
    async fn sqlite_store_keeps_absent_and_empty_distinct() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteProductStore::open(dir.path().join("radar.db"))
            .await
            .expect("open");
        let mut rec = record("A", None, "t");
        rec.brand = None;
        rec.title = Some(String::new());
        rec.images.clear();
        store.upsert(rec).await.unwrap();

        let back = store.get("A").await.unwrap().unwrap();
        assert_eq!(back.brand, None);
        assert_eq!(back.title.as_deref(), Some(""));
        assert!(back.images.is_empty());
    }

    #[tokio::test]
    async fn corrupt_images_column_surfaces_as_storage_error() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteProductStore::open(dir.path().join("radar.db"))
            .await
            .expect("open");
        store.upsert(record("A", None, "t")).await.unwrap();
        sqlx::query("UPDATE products SET images_json = 'not json' WHERE id = 'A'")
            .execute(store.pool())
            .await
            .unwrap();
        assert!(matches!(
            store.get("A").await,
            Err(StorageError::CorruptRow { .. })
        ));
    }
}
