use anyhow::Context;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Row, Sqlite, SqlitePool};
use std::path::Path;
use uuid::Uuid;

// Key-value table backing every piece of persisted client state
const MIGRATIONS_SQL: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

/// Keys used in the store.
pub mod keys {
    use uuid::Uuid;

    pub const CLIENT_ID: &str = "void_client_id";
    pub const FREE_LEFT: &str = "void_free_left";
    pub const PRO_TOKEN: &str = "void_pro_token";
    pub const INVOICE_ID: &str = "void_invoice_id";
    pub const CHECKOUT_LINK: &str = "void_checkout_link";
    pub const PLAN_ID: &str = "void_plan_id";
    pub const ACTIVE_CHAT: &str = "void_active_chat";
    pub const CHAT_INDEX: &str = "void_chat_index";
    pub const MODEL: &str = "void_model";

    /// Key holding one conversation's messages.
    pub fn transcript(id: Uuid) -> String {
        format!("void_chat:{}", id)
    }
}

/// Durable key-value store. Reads are served from an in-memory copy that is
/// loaded once at open and kept in step with every write.
#[derive(Debug)]
pub struct StorageManager {
    pool: SqlitePool,
    cache: DashMap<String, String>,
}

impl StorageManager {
    /// Opens (creating if needed) the SQLite file at `path` and loads it.
    pub async fn open(path: &Path) -> Result<Self, anyhow::Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}?mode=rwc", path.to_string_lossy());
        log::info!("Connecting to database: {}", db_url);

        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            log::info!("Database file not found, creating...");
            Sqlite::create_database(&db_url)
                .await
                .context("Failed to create database")?;
        }

        let pool = SqlitePoolOptions::new()
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::from_pool(pool).await
    }

    /// Store living only in memory. A single connection that never expires,
    /// since every SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self, anyhow::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, anyhow::Error> {
        Self::run_migrations(&pool).await?;

        let rows = sqlx::query("SELECT key, value FROM kv")
            .fetch_all(&pool)
            .await
            .context("Failed to load key-value entries")?;

        let cache = DashMap::new();
        for row in rows {
            let key: String = row.try_get("key").context("Failed to read key column")?;
            let value: String = row.try_get("value").context("Failed to read value column")?;
            cache.insert(key, value);
        }
        log::info!("Loaded {} stored entries", cache.len());

        Ok(Self { pool, cache })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Returns the value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<String> {
        self.cache.get(key).map(|v| v.value().clone())
    }

    /// Returns the trimmed value for `key`, treating blank values as absent.
    pub fn get_trimmed(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Decodes a JSON value. Undecodable entries are logged and treated as absent.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Ignoring undecodable value under '{}': {}", key, e);
                None
            }
        }
    }

    /// Writes `value` under `key`. An empty value removes the key.
    pub async fn set(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
        if value.is_empty() {
            return self.remove(key).await;
        }
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .context(format!("Failed to write key '{}'", key))?;

        self.cache.insert(key.to_string(), value.to_string());
        log::debug!("Stored key '{}' ({} bytes)", key, value.len());
        Ok(())
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), anyhow::Error> {
        let raw = serde_json::to_string(value).context(format!("Failed to encode value for '{}'", key))?;
        self.set(key, &raw).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), anyhow::Error> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .context(format!("Failed to delete key '{}'", key))?;
        self.cache.remove(key);
        log::debug!("Removed key '{}'", key);
        Ok(())
    }

    /// Best-effort write: failures are logged, never surfaced.
    pub async fn persist(&self, key: &str, value: &str) {
        if let Err(e) = self.set(key, value).await {
            log::warn!("Best-effort write of '{}' failed: {:?}", key, e);
        }
    }

    pub async fn persist_opt(&self, key: &str, value: Option<&str>) {
        self.persist(key, value.unwrap_or("")).await;
    }

    /// Convenience accessor for the transcript of conversation `id`.
    pub fn transcript_exists(&self, id: Uuid) -> bool {
        self.cache.contains_key(&keys::transcript(id))
    }
}
