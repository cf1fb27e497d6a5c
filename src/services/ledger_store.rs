use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::SqlitePool;

/// Durable key-value storage backing the chunk ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// All `(key, value)` pairs whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>>;
}

/// SQLite-backed store; expects the `upload_ledger` table from
/// [`crate::infrastructure::database::run_migrations`].
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO upload_ledger (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM upload_ledger WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM upload_ledger WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM upload_ledger \
             WHERE substr(key, 1, length(?)) = ? ORDER BY updated_at",
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Process-local store for tests and hosts without durable storage.
#[derive(Default)]
pub struct MemoryLedgerStore {
    entries: DashMap<String, String>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut rows: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        rows.sort();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database;

    async fn exercise(store: &dyn LedgerStore) {
        store.put("upload_ledger:a", "{\"v\":1}").await.unwrap();
        store.put("upload_ledger:b", "{\"v\":2}").await.unwrap();
        store.put("other:c", "{}").await.unwrap();
        store.put("upload_ledger:a", "{\"v\":3}").await.unwrap();

        assert_eq!(
            store.get("upload_ledger:a").await.unwrap().as_deref(),
            Some("{\"v\":3}")
        );
        let keys: Vec<String> = store
            .list("upload_ledger:")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"upload_ledger:b".to_string()));

        store.delete("upload_ledger:a").await.unwrap();
        assert!(store.get("upload_ledger:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryLedgerStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let pool = database::connect_in_memory().await.unwrap();
        exercise(&SqliteLedgerStore::new(pool)).await;
    }
}
