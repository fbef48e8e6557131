use crate::schemas::v1::models::storage::StoragePool;
use anyhow::Context;
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;

/// Retrieves all storage pools, oldest first.
pub async fn pool_list(pool: &Pool<Sqlite>) -> anyhow::Result<Vec<StoragePool>> {
    let pools = sqlx::query_as::<_, StoragePool>("SELECT * FROM storage_pools ORDER BY id")
        .fetch_all(pool)
        .await
        .context("Failed to fetch storage pools")?;

    Ok(pools)
}

/// Retrieves all pool names, sorted.
pub async fn pool_names(pool: &Pool<Sqlite>) -> anyhow::Result<Vec<String>> {
    let names =
        sqlx::query_scalar::<_, String>("SELECT name FROM storage_pools ORDER BY name")
            .fetch_all(pool)
            .await
            .context("Failed to fetch storage pool names")?;

    Ok(names)
}

/// Retrieves a single pool by name. `None` means no such object.
pub async fn pool_get_by_name(
    pool: &Pool<Sqlite>,
    name: &str,
) -> anyhow::Result<Option<StoragePool>> {
    let row = sqlx::query_as::<_, StoragePool>("SELECT * FROM storage_pools WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch storage pool")?;

    Ok(row)
}

/// Resolves a pool name to its stable id.
pub async fn pool_get_id(pool: &Pool<Sqlite>, name: &str) -> anyhow::Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM storage_pools WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("Failed to resolve storage pool id")?;

    Ok(id)
}

/// Retrieves the config map of a pool. Node-local rows override global rows
/// of the same key.
pub async fn pool_config(
    pool: &Pool<Sqlite>,
    pool_id: i64,
) -> anyhow::Result<HashMap<String, String>> {
    let rows = sqlx::query_as::<_, (String, String, Option<i64>)>(
        "SELECT key, value, node_id FROM storage_pools_config WHERE storage_pool_id = ?",
    )
    .bind(pool_id)
    .fetch_all(pool)
    .await
    .context("Failed to fetch storage pool config")?;

    let mut config = HashMap::new();
    for (key, value, node_id) in &rows {
        if node_id.is_none() {
            config.insert(key.clone(), value.clone());
        }
    }
    for (key, value, node_id) in rows {
        if node_id.is_some() {
            config.insert(key, value);
        }
    }

    Ok(config)
}

/// Creates a pool row together with its config rows in one transaction.
/// Returns the new pool id.
pub async fn pool_create(
    pool: &Pool<Sqlite>,
    name: &str,
    driver: &str,
    description: &str,
    config: &HashMap<String, String>,
) -> anyhow::Result<i64> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        "INSERT INTO storage_pools (name, driver, description) VALUES (?, ?, ?)",
    )
    .bind(name)
    .bind(driver)
    .bind(description)
    .execute(&mut *tx)
    .await
    .context("Failed to create storage pool")?;

    let pool_id = result.last_insert_rowid();
    insert_pool_config(&mut tx, pool_id, config).await?;

    tx.commit().await?;
    Ok(pool_id)
}

/// Updates description and replaces the config map in one transaction.
pub async fn pool_update(
    pool: &Pool<Sqlite>,
    pool_id: i64,
    description: &str,
    config: &HashMap<String, String>,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE storage_pools SET description = ? WHERE id = ?")
        .bind(description)
        .bind(pool_id)
        .execute(&mut *tx)
        .await
        .context("Failed to update storage pool")?;

    sqlx::query("DELETE FROM storage_pools_config WHERE storage_pool_id = ?")
        .bind(pool_id)
        .execute(&mut *tx)
        .await
        .context("Failed to clear storage pool config")?;

    insert_pool_config(&mut tx, pool_id, config).await?;

    tx.commit().await?;
    Ok(())
}

/// Replaces the config map (clear + add) in one transaction.
pub async fn pool_config_replace(
    pool: &Pool<Sqlite>,
    pool_id: i64,
    config: &HashMap<String, String>,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM storage_pools_config WHERE storage_pool_id = ?")
        .bind(pool_id)
        .execute(&mut *tx)
        .await
        .context("Failed to clear storage pool config")?;

    insert_pool_config(&mut tx, pool_id, config).await?;

    tx.commit().await?;
    Ok(())
}

/// Deletes config rows then the pool row, one transaction.
pub async fn pool_delete(pool: &Pool<Sqlite>, pool_id: i64) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM storage_pools_config WHERE storage_pool_id = ?")
        .bind(pool_id)
        .execute(&mut *tx)
        .await
        .context("Failed to delete storage pool config")?;

    sqlx::query("DELETE FROM storage_pools WHERE id = ?")
        .bind(pool_id)
        .execute(&mut *tx)
        .await
        .context("Failed to delete storage pool")?;

    tx.commit().await?;
    Ok(())
}

/// Counts volumes referencing the pool.
pub async fn pool_volume_count(pool: &Pool<Sqlite>, pool_id: i64) -> anyhow::Result<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM storage_volumes WHERE storage_pool_id = ?",
    )
    .bind(pool_id)
    .fetch_one(pool)
    .await
    .context("Failed to count storage volumes")?;

    Ok(count)
}

/// Distinct driver tags represented by at least one pool. Seeds the driver
/// cache at boot.
pub async fn pool_drivers(pool: &Pool<Sqlite>) -> anyhow::Result<Vec<String>> {
    let drivers =
        sqlx::query_scalar::<_, String>("SELECT DISTINCT driver FROM storage_pools")
            .fetch_all(pool)
            .await
            .context("Failed to fetch storage pool drivers")?;

    Ok(drivers)
}

/// Upserts a single config key. `node_id` scopes the row to one node.
pub async fn pool_config_set(
    pool: &Pool<Sqlite>,
    pool_id: i64,
    key: &str,
    value: &str,
    node_id: Option<i64>,
) -> anyhow::Result<()> {
    if value.is_empty() {
        return pool_config_unset(pool, pool_id, key).await;
    }
    match node_id {
        Some(node_id) => {
            sqlx::query(
                r#"INSERT INTO storage_pools_config (storage_pool_id, node_id, key, value)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (storage_pool_id, node_id, key) DO UPDATE SET value = excluded.value"#,
            )
            .bind(pool_id)
            .bind(node_id)
            .bind(key)
            .bind(value)
            .execute(pool)
            .await
            .context("Failed to set storage pool config key")?;
        }
        None => {
            // The unique index treats NULL node_ids as distinct, so an
            // upsert never fires for global rows; replace them instead.
            let mut tx = pool.begin().await?;
            sqlx::query(
                "DELETE FROM storage_pools_config WHERE storage_pool_id = ? AND key = ? AND node_id IS NULL",
            )
            .bind(pool_id)
            .bind(key)
            .execute(&mut *tx)
            .await
            .context("Failed to clear storage pool config key")?;

            sqlx::query(
                "INSERT INTO storage_pools_config (storage_pool_id, node_id, key, value) VALUES (?, NULL, ?, ?)",
            )
            .bind(pool_id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .context("Failed to set storage pool config key")?;

            tx.commit().await?;
        }
    }

    Ok(())
}

/// Removes a config key in every node scope.
pub async fn pool_config_unset(pool: &Pool<Sqlite>, pool_id: i64, key: &str) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM storage_pools_config WHERE storage_pool_id = ? AND key = ?")
        .bind(pool_id)
        .bind(key)
        .execute(pool)
        .await
        .context("Failed to unset storage pool config key")?;

    Ok(())
}

/// Renames a config key, keeping its value and scope. A no-op when the old
/// key is absent; an already-renamed key wins. The unique index does not
/// protect NULL-scoped rows, so the winner is resolved explicitly with a
/// NULL-safe scope comparison before the rename.
pub async fn pool_config_rename_key(
    pool: &Pool<Sqlite>,
    pool_id: i64,
    old_key: &str,
    new_key: &str,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"DELETE FROM storage_pools_config
        WHERE storage_pool_id = ? AND key = ?
            AND EXISTS (
                SELECT 1 FROM storage_pools_config c2
                WHERE c2.storage_pool_id = storage_pools_config.storage_pool_id
                    AND c2.key = ?
                    AND c2.node_id IS storage_pools_config.node_id
            )"#,
    )
    .bind(pool_id)
    .bind(old_key)
    .bind(new_key)
    .execute(&mut *tx)
    .await
    .context("Failed to drop superseded storage pool config key")?;

    sqlx::query(
        "UPDATE storage_pools_config SET key = ? WHERE storage_pool_id = ? AND key = ?",
    )
    .bind(new_key)
    .bind(pool_id)
    .bind(old_key)
    .execute(&mut *tx)
    .await
    .context("Failed to rename storage pool config key")?;

    tx.commit().await?;
    Ok(())
}

/// Rewrites the driver tag of a pool row.
pub async fn pool_set_driver(pool: &Pool<Sqlite>, pool_id: i64, driver: &str) -> anyhow::Result<()> {
    sqlx::query("UPDATE storage_pools SET driver = ? WHERE id = ?")
        .bind(driver)
        .bind(pool_id)
        .execute(pool)
        .await
        .context("Failed to set storage pool driver")?;

    Ok(())
}

/// Moves a config key from global scope to a node-local scope.
pub async fn pool_config_set_node_scope(
    pool: &Pool<Sqlite>,
    pool_id: i64,
    key: &str,
    node_id: i64,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"UPDATE OR IGNORE storage_pools_config SET node_id = ?
        WHERE storage_pool_id = ? AND key = ? AND node_id IS NULL"#,
    )
    .bind(node_id)
    .bind(pool_id)
    .bind(key)
    .execute(pool)
    .await
    .context("Failed to scope storage pool config key to node")?;

    Ok(())
}

async fn insert_pool_config(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    pool_id: i64,
    config: &HashMap<String, String>,
) -> anyhow::Result<()> {
    for (key, value) in config {
        // Empty means "use the default"; the row is simply not written.
        if value.is_empty() {
            continue;
        }
        sqlx::query(
            "INSERT INTO storage_pools_config (storage_pool_id, node_id, key, value) VALUES (?, NULL, ?, ?)",
        )
        .bind(pool_id)
        .bind(key)
        .bind(value)
        .execute(&mut **tx)
        .await
        .context("Failed to insert storage pool config")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::v1::db::init_schema;

    async fn test_pool() -> Pool<Sqlite> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn create_list_get_round_trip() {
        let db = test_pool().await;
        let mut config = HashMap::new();
        config.insert("source".to_string(), "/var/lib/ex/p1".to_string());
        config.insert("ignored".to_string(), String::new());

        let id = pool_create(&db, "p1", "dir", "", &config).await.unwrap();

        assert_eq!(pool_names(&db).await.unwrap(), vec!["p1".to_string()]);
        let row = pool_get_by_name(&db, "p1").await.unwrap().unwrap();
        assert_eq!(row.id, id);
        assert_eq!(row.driver, "dir");

        let stored = pool_config(&db, id).await.unwrap();
        assert_eq!(stored.get("source").map(String::as_str), Some("/var/lib/ex/p1"));
        // Empty values are skipped on write.
        assert!(!stored.contains_key("ignored"));
    }

    #[tokio::test]
    async fn missing_pool_is_none_not_error() {
        let db = test_pool().await;
        assert!(pool_get_by_name(&db, "nope").await.unwrap().is_none());
        assert!(pool_get_id(&db, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn node_local_key_overrides_global() {
        let db = test_pool().await;
        let id = pool_create(&db, "p1", "lvm", "", &HashMap::new()).await.unwrap();
        let node_id = crate::schemas::v1::db::queries::node::node_ensure(&db, "n1", "10.0.0.1")
            .await
            .unwrap();

        pool_config_set(&db, id, "lvm.vg_name", "global-vg", None).await.unwrap();
        pool_config_set(&db, id, "lvm.vg_name", "local-vg", Some(node_id)).await.unwrap();

        let config = pool_config(&db, id).await.unwrap();
        assert_eq!(config.get("lvm.vg_name").map(String::as_str), Some("local-vg"));
    }

    #[tokio::test]
    async fn global_config_set_replaces_instead_of_duplicating() {
        let db = test_pool().await;
        let id = pool_create(&db, "p1", "btrfs", "", &HashMap::new()).await.unwrap();

        pool_config_set(&db, id, "source", "/var/lib/vessel", None).await.unwrap();
        pool_config_set(&db, id, "source", "/var/lib/vessel/storage-pools/p1", None)
            .await
            .unwrap();

        let rows: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM storage_pools_config WHERE storage_pool_id = ? AND key = 'source'",
        )
        .bind(id)
        .fetch_one(&db)
        .await
        .unwrap();
        assert_eq!(rows, 1);

        let config = pool_config(&db, id).await.unwrap();
        assert_eq!(
            config.get("source").map(String::as_str),
            Some("/var/lib/vessel/storage-pools/p1")
        );
    }

    #[tokio::test]
    async fn rename_prefers_the_already_renamed_key() {
        let db = test_pool().await;
        let id = pool_create(&db, "p1", "lvm", "", &HashMap::new()).await.unwrap();
        pool_config_set(&db, id, "lvm.thinpool", "stale", None).await.unwrap();
        pool_config_set(&db, id, "lvm.thinpool_name", "tp0", None).await.unwrap();

        pool_config_rename_key(&db, id, "lvm.thinpool", "lvm.thinpool_name")
            .await
            .unwrap();

        let config = pool_config(&db, id).await.unwrap();
        assert_eq!(config.get("lvm.thinpool_name").map(String::as_str), Some("tp0"));
        assert!(!config.contains_key("lvm.thinpool"));

        let rows: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM storage_pools_config WHERE storage_pool_id = ? AND key = 'lvm.thinpool_name'",
        )
        .bind(id)
        .fetch_one(&db)
        .await
        .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn config_key_rename_is_idempotent() {
        let db = test_pool().await;
        let id = pool_create(&db, "p1", "lvm", "", &HashMap::new()).await.unwrap();
        pool_config_set(&db, id, "lvm.thinpool", "tp0", None).await.unwrap();

        pool_config_rename_key(&db, id, "lvm.thinpool", "lvm.thinpool_name").await.unwrap();
        pool_config_rename_key(&db, id, "lvm.thinpool", "lvm.thinpool_name").await.unwrap();

        let config = pool_config(&db, id).await.unwrap();
        assert_eq!(config.get("lvm.thinpool_name").map(String::as_str), Some("tp0"));
        assert!(!config.contains_key("lvm.thinpool"));
    }
}
