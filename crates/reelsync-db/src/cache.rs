//! # Local Item Cache
//!
//! SQLite copy of every subscribed project's items as of this device's last
//! merge pass. The merge engine diffs the change logs against it and writes
//! the differences back in one transaction.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Item Cache                                         │
//! │                                                                         │
//! │  CacheConfig::new(path)                                                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  CacheDb::new(config).await ← pool + WAL + migrations                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────┐                           │
//! │  │  cached_items (project_id, path) PK     │                           │
//! │  └─────────────────────────────────────────┘                           │
//! │       ▲                     │                                           │
//! │       │ bulk_upsert         │ load_items / latest_modified             │
//! │       │ (one transaction)   ▼                                           │
//! │  Merge engine ◄──────── diff against folded change logs                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use reelsync_core::Item;

use crate::error::{DbError, DbResult};
use crate::migrations;

// =============================================================================
// Configuration
// =============================================================================

/// Cache database configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = CacheConfig::new("/var/lib/reelsync/cache.db").max_connections(4);
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// Maximum number of connections in the pool.
    /// Default: 4
    pub max_connections: u32,

    /// Connection timeout duration.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Whether to run migrations on connect.
    /// Default: true
    pub run_migrations: bool,
}

impl CacheConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CacheConfig {
            database_path: path.into(),
            max_connections: 4,
            connect_timeout: Duration::from_secs(30),
            run_migrations: true,
        }
    }

    /// Sets the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets whether to run migrations on connect.
    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// In-memory cache for tests. Single connection so every query sees the
    /// same database.
    pub fn in_memory() -> Self {
        CacheConfig {
            database_path: PathBuf::from(":memory:"),
            max_connections: 1,
            connect_timeout: Duration::from_secs(5),
            run_migrations: true,
        }
    }

    fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == ":memory:"
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct CachedItemRow {
    path: String,
    item_type: String,
    name: String,
    metadata: String,
    created_at: i64,
    modified_at: i64,
    modified_by: String,
}

impl From<CachedItemRow> for Item {
    fn from(row: CachedItemRow) -> Self {
        Item {
            path: row.path,
            item_type: row.item_type,
            name: row.name,
            metadata: row.metadata,
            created_at: row.created_at,
            modified_at: row.modified_at,
            modified_by: row.modified_by,
        }
    }
}

// =============================================================================
// Cache Database
// =============================================================================

/// Handle to the local item cache.
#[derive(Debug, Clone)]
pub struct CacheDb {
    pool: SqlitePool,
}

impl CacheDb {
    /// Opens (creating if needed) the cache and runs migrations.
    pub async fn new(config: CacheConfig) -> DbResult<Self> {
        info!(
            path = %config.database_path.display(),
            "Opening item cache"
        );

        let connect_options = if config.is_in_memory() {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            SqliteConnectOptions::new()
                .filename(&config.database_path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)
            .acquire_timeout(config.connect_timeout)
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        debug!(max_connections = config.max_connections, "Cache pool created");

        let db = CacheDb { pool };
        if config.run_migrations {
            migrations::run_migrations(&db.pool).await?;
        }
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// All cached items of a project, ordered by path.
    pub async fn load_items(&self, project_id: &str) -> DbResult<Vec<Item>> {
        let rows: Vec<CachedItemRow> = sqlx::query_as(
            r#"
            SELECT path, item_type, name, metadata, created_at, modified_at, modified_by
            FROM cached_items
            WHERE project_id = ?1
            ORDER BY path ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Item::from).collect())
    }

    /// Inserts or replaces `items` in one transaction. Returns the row count.
    pub async fn bulk_upsert(&self, project_id: &str, items: &[Item]) -> DbResult<usize> {
        if items.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO cached_items (
                    project_id, path, item_type, name, metadata,
                    created_at, modified_at, modified_by
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT (project_id, path) DO UPDATE SET
                    item_type   = excluded.item_type,
                    name        = excluded.name,
                    metadata    = excluded.metadata,
                    created_at  = excluded.created_at,
                    modified_at = excluded.modified_at,
                    modified_by = excluded.modified_by
                "#,
            )
            .bind(project_id)
            .bind(&item.path)
            .bind(&item.item_type)
            .bind(&item.name)
            .bind(&item.metadata)
            .bind(item.created_at)
            .bind(item.modified_at)
            .bind(&item.modified_by)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(project_id = %project_id, count = items.len(), "Upserted cached items");
        Ok(items.len())
    }

    /// Largest `modified_at` cached for the project, if any.
    pub async fn latest_modified(&self, project_id: &str) -> DbResult<Option<i64>> {
        let latest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(modified_at) FROM cached_items WHERE project_id = ?1")
                .bind(project_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(latest)
    }

    pub async fn item_count(&self, project_id: &str) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM cached_items WHERE project_id = ?1")
                .bind(project_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    pub async fn close(&self) {
        info!("Closing item cache");
        self.pool.close().await;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn item(path: &str, metadata: &str, ts: i64) -> Item {
        Item::new(path, "shot", path, metadata, "A", ts)
    }

    #[tokio::test]
    async fn test_in_memory_cache() {
        let db = CacheDb::new(CacheConfig::in_memory()).await.unwrap();
        assert!(db.health_check().await);
        assert!(db.load_items("p1").await.unwrap().is_empty());
        assert_eq!(db.latest_modified("p1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bulk_upsert_inserts_and_replaces() {
        let db = CacheDb::new(CacheConfig::in_memory()).await.unwrap();

        let written = db
            .bulk_upsert("p1", &[item("shots/010", "status=WIP", 100), item("shots/020", "", 200)])
            .await
            .unwrap();
        assert_eq!(written, 2);

        db.bulk_upsert("p1", &[item("shots/010", "status=Done", 300)])
            .await
            .unwrap();

        let items = db.load_items("p1").await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].metadata, "status=Done");
        assert_eq!(db.latest_modified("p1").await.unwrap(), Some(300));
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_cache_untouched() {
        let db = CacheDb::new(CacheConfig::in_memory()).await.unwrap();
        db.bulk_upsert("p1", &[item("shots/010", "status=WIP", 100)])
            .await
            .unwrap();

        // Make the last row of the next batch fail inside the transaction.
        sqlx::query(
            r#"
            CREATE TRIGGER reject_bad_path BEFORE INSERT ON cached_items
            WHEN NEW.path = 'shots/bad'
            BEGIN SELECT RAISE(ABORT, 'rejected path'); END
            "#,
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let result = db
            .bulk_upsert(
                "p1",
                &[
                    item("shots/010", "status=Final", 300),
                    item("shots/020", "", 300),
                    item("shots/bad", "", 300),
                ],
            )
            .await;
        assert!(result.is_err());

        let items = db.load_items("p1").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].metadata, "status=WIP");
        assert_eq!(db.latest_modified("p1").await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_projects_are_isolated() {
        let db = CacheDb::new(CacheConfig::in_memory()).await.unwrap();
        db.bulk_upsert("p1", &[item("shots/010", "", 100)]).await.unwrap();

        assert_eq!(db.item_count("p1").await.unwrap(), 1);
        assert_eq!(db.item_count("p2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_backed_cache_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        let db = CacheDb::new(CacheConfig::new(&path)).await.unwrap();
        db.bulk_upsert("p1", &[item("shots/010", "", 100)]).await.unwrap();
        db.close().await;

        let reopened = CacheDb::new(CacheConfig::new(&path)).await.unwrap();
        assert_eq!(reopened.item_count("p1").await.unwrap(), 1);

        let (total, applied) = migrations::migration_status(reopened.pool()).await.unwrap();
        assert_eq!(total, applied);
    }

    #[tokio::test]
    async fn test_config_builder() {
        let config = CacheConfig::new("/tmp/cache.db")
            .max_connections(8)
            .run_migrations(false);
        assert_eq!(config.max_connections, 8);
        assert!(!config.run_migrations);
    }
}
