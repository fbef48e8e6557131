//! Daemon-level config key/value store. The upgrade patches read the legacy
//! `storage.*` keys from here and clear them once the pool model owns the
//! information.

use anyhow::Context;
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;

pub async fn config_get(pool: &Pool<Sqlite>, key: &str) -> anyhow::Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM config WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch config key")?;

    Ok(value)
}

pub async fn config_set(pool: &Pool<Sqlite>, key: &str, value: &str) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO config (key, value) VALUES (?, ?) ON CONFLICT (key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("Failed to set config key")?;

    Ok(())
}

/// Removes a set of keys in a single transaction.
pub async fn config_delete(pool: &Pool<Sqlite>, keys: &[&str]) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    for key in keys {
        sqlx::query("DELETE FROM config WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .context("Failed to delete config key")?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn config_all(pool: &Pool<Sqlite>) -> anyhow::Result<HashMap<String, String>> {
    let rows = sqlx::query_as::<_, (String, String)>("SELECT key, value FROM config")
        .fetch_all(pool)
        .await
        .context("Failed to fetch config")?;

    Ok(rows.into_iter().collect())
}
