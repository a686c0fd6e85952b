use super::{Collection, Store};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Pool, Postgres};

/// Store backed by a single `orchestrate_records` table.
///
/// Queries are built with `query()`/`query_as()` so no DATABASE_URL is needed at build time.
#[derive(Clone)]
pub struct PgStore {
    db: Pool<Postgres>,
}

impl PgStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    /// Apply embedded migrations (source of truth is /sqlx-migrations at workspace root).
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../sqlx-migrations").run(&self.db).await?;
        Ok(())
    }
}

/// Escape LIKE metacharacters so keys match literally.
fn like_prefix(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

#[async_trait]
impl Store for PgStore {
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>> {
        let row: Option<(Value,)> = sqlx::query_as(
            "SELECT value FROM orchestrate_records WHERE collection = $1 AND key = $2",
        )
        .bind(collection.as_str())
        .bind(key)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn put(&self, collection: Collection, key: &str, value: Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO orchestrate_records (collection, key, value, updated_at)
             VALUES ($1, $2, $3, NOW())
             ON CONFLICT (collection, key)
             DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
        )
        .bind(collection.as_str())
        .bind(key)
        .bind(value)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM orchestrate_records WHERE collection = $1 AND key = $2")
            .bind(collection.as_str())
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn list(&self, collection: Collection, prefix: &str) -> Result<Vec<(String, Value)>> {
        let rows: Vec<(String, Value)> = sqlx::query_as(
            r#"SELECT key, value FROM orchestrate_records
               WHERE collection = $1 AND key LIKE $2 ESCAPE '\'
               ORDER BY key"#,
        )
        .bind(collection.as_str())
        .bind(like_prefix(prefix))
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }
}
