//! Durable dedupe ledger of previously notified listings, backed by SQLite.
use crate::model::{Listing, SeenRecord};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use thiserror::Error;
use tracing::instrument;

pub type Pool = SqlitePool;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("seen store query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("seen store migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub async fn init_pool(database_url: &str) -> Result<Pool, StorageError> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<(), StorageError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Seen store: one row per listing identity. The poll cycle is the sole
/// writer; status and listing queries may read concurrently.
#[derive(Debug, Clone)]
pub struct SeenStore {
    pool: Pool,
}

impl SeenStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[instrument(skip_all)]
    pub async fn contains(&self, listing_id: &str) -> Result<bool, StorageError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM seen_listings WHERE listing_id = ?")
                .bind(listing_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// Atomically record a listing if its identity is unknown. Returns true
    /// when the identity was previously absent.
    #[instrument(skip_all)]
    pub async fn record_if_new(&self, listing: &Listing) -> Result<bool, StorageError> {
        let res = sqlx::query(
            "INSERT OR IGNORE INTO seen_listings \
             (listing_id, title, price, location, url, description, image_url, first_seen_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&listing.id)
        .bind(&listing.title)
        .bind(&listing.price)
        .bind(&listing.location)
        .bind(&listing.url)
        .bind(listing.description.as_deref())
        .bind(listing.image_url.as_deref())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Remove records whose `first_seen_at` is older than the retention
    /// window. Returns the number of rows removed. A removed identity may be
    /// re-notified if the source re-surfaces it later.
    #[instrument(skip_all)]
    pub async fn cleanup(&self, retention: chrono::Duration) -> Result<u64, StorageError> {
        let cutoff = Utc::now() - retention;
        let res = sqlx::query("DELETE FROM seen_listings WHERE first_seen_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Page over stored records, newest first.
    #[instrument(skip_all)]
    pub async fn page(&self, limit: i64, offset: i64) -> Result<Vec<SeenRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT listing_id, title, price, location, url, description, image_url, first_seen_at \
             FROM seen_listings ORDER BY first_seen_at DESC, rowid DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM seen_listings")
            .fetch_one(&self.pool)
            .await?;
        Ok(cnt)
    }

    /// Drop all dedupe history. Every prior identity becomes eligible for
    /// re-notification.
    #[instrument(skip_all)]
    pub async fn clear(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM seen_listings")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_record(row: &SqliteRow) -> SeenRecord {
    SeenRecord {
        listing: Listing {
            id: row.get("listing_id"),
            title: row.get("title"),
            price: row.get("price"),
            location: row.get("location"),
            url: row.get("url"),
            description: row.get("description"),
            image_url: row.get("image_url"),
        },
        first_seen_at: row.get::<DateTime<Utc>, _>("first_seen_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_store() -> SeenStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        SeenStore::new(pool)
    }

    fn listing(id: &str, title: &str) -> Listing {
        Listing {
            id: id.into(),
            title: title.into(),
            price: "$100".into(),
            location: "Denver, CO".into(),
            url: format!("https://market.example/item/{id}"),
            description: None,
            image_url: None,
        }
    }

    #[tokio::test]
    async fn record_if_new_true_exactly_once_per_identity() {
        let store = setup_store().await;
        let l = listing("a1", "first");

        assert!(store.record_if_new(&l).await.unwrap());
        assert!(!store.record_if_new(&l).await.unwrap());

        // Field drift on the same identity is still not new.
        let mut drifted = l.clone();
        drifted.price = "$90".into();
        drifted.title = "price drop".into();
        assert!(!store.record_if_new(&drifted).await.unwrap());

        assert!(store.contains("a1").await.unwrap());
        assert!(!store.contains("zz").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_records() {
        let store = setup_store().await;
        store.record_if_new(&listing("old", "old")).await.unwrap();
        store.record_if_new(&listing("new", "new")).await.unwrap();

        // Age one record past the window.
        sqlx::query("UPDATE seen_listings SET first_seen_at = ? WHERE listing_id = ?")
            .bind(Utc::now() - chrono::Duration::days(2))
            .bind("old")
            .execute(store.pool())
            .await
            .unwrap();

        let removed = store.cleanup(chrono::Duration::days(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!store.contains("old").await.unwrap());
        assert!(store.contains("new").await.unwrap());

        // An expired identity re-surfacing is treated as new again.
        assert!(store.record_if_new(&listing("old", "again")).await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_never_removes_records_within_window() {
        let store = setup_store().await;
        store.record_if_new(&listing("young", "y")).await.unwrap();
        let removed = store.cleanup(chrono::Duration::days(7)).await.unwrap();
        assert_eq!(removed, 0);
        assert!(store.contains("young").await.unwrap());
    }

    #[tokio::test]
    async fn page_orders_by_first_seen_desc() {
        let store = setup_store().await;
        for id in ["a", "b", "c"] {
            store.record_if_new(&listing(id, id)).await.unwrap();
        }
        // Force distinct, ordered timestamps.
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            sqlx::query("UPDATE seen_listings SET first_seen_at = ? WHERE listing_id = ?")
                .bind(Utc::now() - chrono::Duration::minutes(10 - i as i64))
                .bind(id)
                .execute(store.pool())
                .await
                .unwrap();
        }

        let page = store.page(10, 0).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|r| r.listing.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        let second = store.page(1, 1).await.unwrap();
        assert_eq!(second[0].listing.id, "b");
    }

    #[tokio::test]
    async fn clear_empties_the_store() {
        let store = setup_store().await;
        store.record_if_new(&listing("a", "a")).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.record_if_new(&listing("a", "a")).await.unwrap());
    }

    #[test]
    fn prepare_sqlite_url_passthrough_memory() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://host/db"),
            "postgres://host/db"
        );
    }
}
