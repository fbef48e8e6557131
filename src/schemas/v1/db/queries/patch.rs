use anyhow::Context;
use sqlx::{Pool, Sqlite};
use std::collections::HashSet;

/// Names of every patch marked applied. Presence in the table is the only
/// definition of "applied".
pub async fn patches_applied(pool: &Pool<Sqlite>) -> anyhow::Result<HashSet<String>> {
    let names = sqlx::query_scalar::<_, String>("SELECT name FROM patches")
        .fetch_all(pool)
        .await
        .context("Failed to fetch applied patches")?;

    Ok(names.into_iter().collect())
}

/// Durably records a patch as applied. Idempotent: re-marking after a crash
/// between effect and mark is harmless.
pub async fn patch_mark_applied(pool: &Pool<Sqlite>, name: &str) -> anyhow::Result<()> {
    sqlx::query("INSERT OR IGNORE INTO patches (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await
        .context("Failed to mark patch applied")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::v1::db::init_schema;

    #[tokio::test]
    async fn mark_is_idempotent() {
        let db = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&db).await.unwrap();

        assert!(patches_applied(&db).await.unwrap().is_empty());
        patch_mark_applied(&db, "storage_api").await.unwrap();
        patch_mark_applied(&db, "storage_api").await.unwrap();

        let applied = patches_applied(&db).await.unwrap();
        assert_eq!(applied.len(), 1);
        assert!(applied.contains("storage_api"));
    }
}
