use anyhow::Context;
use sqlx::{Pool, Sqlite};

pub async fn get_meta_value(pool: &Pool<Sqlite>, key: &str) -> anyhow::Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM metadata WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch metadata value")?;

    Ok(value)
}

pub async fn set_meta_value(pool: &Pool<Sqlite>, key: &str, value: &str) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO metadata (key, value) VALUES (?, ?) ON CONFLICT (key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("Failed to set metadata value")?;

    Ok(())
}
