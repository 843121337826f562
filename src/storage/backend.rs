use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::{Mutex, PoisonError};

use super::schema::Database;
use super::types::{Section, StorageError};

/// Raw persisted config: the schema version plus one JSON value per section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredConfig {
    pub version: u32,
    pub sections: Map<String, Value>,
}

/// Persistence boundary for the config store.
///
/// Implementations only move documents in and out; migration and validation
/// happen in [`super::ConfigManager`].
#[async_trait]
pub trait ConfigBackend: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    async fn load(&self) -> Result<Option<StoredConfig>, StorageError>;

    async fn save(&self, config: &StoredConfig) -> Result<(), StorageError>;
}

const VERSION_KEY: &str = "config_version";

#[async_trait]
impl ConfigBackend for Database {
    async fn load(&self) -> Result<Option<StoredConfig>, StorageError> {
        let version: Option<(String,)> =
            sqlx::query_as("SELECT value FROM config_meta WHERE key = ?")
                .bind(VERSION_KEY)
                .fetch_optional(&self.pool)
                .await?;

        let Some((version,)) = version else {
            return Ok(None);
        };
        let version = version
            .parse::<u32>()
            .map_err(|e| StorageError::Migration(format!("bad config version '{version}': {e}")))?;

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT name, value FROM config_sections ORDER BY name")
                .fetch_all(&self.pool)
                .await?;

        let mut sections = Map::new();
        for (name, value) in rows {
            sections.insert(name, serde_json::from_str(&value)?);
        }

        Ok(Some(StoredConfig { version, sections }))
    }

    /// Replace every known section in one transaction.
    async fn save(&self, config: &StoredConfig) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        for section in Section::ALL {
            let Some(value) = config.sections.get(section.as_str()) else {
                continue;
            };
            sqlx::query(
                r#"
                INSERT INTO config_sections (name, value, updated_at)
                VALUES (?, ?, datetime('now'))
                ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            )
            .bind(section.as_str())
            .bind(serde_json::to_string(value)?)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO config_meta (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
        )
        .bind(VERSION_KEY)
        .bind(config.version.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

/// Process-local backend for tests and `--ephemeral` runs.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    stored: Mutex<Option<StoredConfig>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing document (e.g. a legacy config at `version`).
    pub fn with_contents(config: StoredConfig) -> Self {
        Self {
            stored: Mutex::new(Some(config)),
        }
    }

    pub fn contents(&self) -> Option<StoredConfig> {
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ConfigBackend for MemoryBackend {
    async fn load(&self) -> Result<Option<StoredConfig>, StorageError> {
        Ok(self.contents())
    }

    async fn save(&self, config: &StoredConfig) -> Result<(), StorageError> {
        *self.stored.lock().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn sample() -> StoredConfig {
        let mut sections = Map::new();
        sections.insert("rssfeeds".into(), json!({ "0": { "key": "0", "url": "http://a/rss" } }));
        sections.insert("subscriptions".into(), json!({}));
        StoredConfig {
            version: 4,
            sections,
        }
    }

    #[tokio::test]
    async fn test_load_empty_database() {
        let db = test_db().await;
        assert_eq!(db.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let db = test_db().await;
        let config = sample();
        db.save(&config).await.unwrap();

        let loaded = db.load().await.unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_save_overwrites_section() {
        let db = test_db().await;
        let mut config = sample();
        db.save(&config).await.unwrap();

        config
            .sections
            .insert("rssfeeds".into(), json!({ "1": { "key": "1" } }));
        config.version = 5;
        db.save(&config).await.unwrap();

        let loaded = db.load().await.unwrap().unwrap();
        assert_eq!(loaded.version, 5);
        assert_eq!(loaded.sections["rssfeeds"], json!({ "1": { "key": "1" } }));
    }

    #[tokio::test]
    async fn test_unknown_sections_not_written() {
        let db = test_db().await;
        let mut config = sample();
        config.sections.insert("bogus".into(), json!(1));
        db.save(&config).await.unwrap();

        let loaded = db.load().await.unwrap().unwrap();
        assert!(!loaded.sections.contains_key("bogus"));
    }

    #[tokio::test]
    async fn test_memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.load().await.unwrap(), None);
        backend.save(&sample()).await.unwrap();
        assert_eq!(backend.load().await.unwrap(), Some(sample()));
    }
}
