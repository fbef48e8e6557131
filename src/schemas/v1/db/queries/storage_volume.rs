use crate::schemas::v1::models::storage::StorageVolume;
use crate::storage::{SNAPSHOT_DELIMITER, VolumeKind};
use anyhow::Context;
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;

/// Retrieves volumes of a pool, optionally restricted to a kind set, ordered
/// by name.
pub async fn volume_list_by_pool(
    pool: &Pool<Sqlite>,
    pool_id: i64,
    kinds: &[VolumeKind],
) -> anyhow::Result<Vec<StorageVolume>> {
    let mut query_builder = sqlx::QueryBuilder::new(
        "SELECT * FROM storage_volumes WHERE storage_pool_id = ",
    );
    query_builder.push_bind(pool_id);

    if !kinds.is_empty() {
        query_builder.push(" AND kind IN (");
        let mut separated = query_builder.separated(", ");
        for kind in kinds {
            separated.push_bind(kind.as_str());
        }
        query_builder.push(")");
    }
    query_builder.push(" ORDER BY name");

    let volumes = query_builder
        .build_query_as::<StorageVolume>()
        .fetch_all(pool)
        .await
        .context("Failed to fetch storage volumes")?;

    Ok(volumes)
}

/// Retrieves a single volume. `None` means no such object.
pub async fn volume_get(
    pool: &Pool<Sqlite>,
    pool_id: i64,
    kind: VolumeKind,
    name: &str,
) -> anyhow::Result<Option<StorageVolume>> {
    let row = sqlx::query_as::<_, StorageVolume>(
        "SELECT * FROM storage_volumes WHERE storage_pool_id = ? AND kind = ? AND name = ?",
    )
    .bind(pool_id)
    .bind(kind.as_str())
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch storage volume")?;

    Ok(row)
}

/// Retrieves the config map of a volume.
pub async fn volume_config(
    pool: &Pool<Sqlite>,
    volume_id: i64,
) -> anyhow::Result<HashMap<String, String>> {
    let rows = sqlx::query_as::<_, (String, String)>(
        "SELECT key, value FROM storage_volumes_config WHERE storage_volume_id = ?",
    )
    .bind(volume_id)
    .fetch_all(pool)
    .await
    .context("Failed to fetch storage volume config")?;

    Ok(rows.into_iter().collect())
}

/// Creates a volume row together with its config rows in one transaction.
pub async fn volume_create(
    pool: &Pool<Sqlite>,
    pool_id: i64,
    kind: VolumeKind,
    name: &str,
    description: &str,
    config: &HashMap<String, String>,
) -> anyhow::Result<i64> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        "INSERT INTO storage_volumes (storage_pool_id, kind, name, description) VALUES (?, ?, ?, ?)",
    )
    .bind(pool_id)
    .bind(kind.as_str())
    .bind(name)
    .bind(description)
    .execute(&mut *tx)
    .await
    .context("Failed to create storage volume")?;

    let volume_id = result.last_insert_rowid();
    insert_volume_config(&mut tx, volume_id, config).await?;

    tx.commit().await?;
    Ok(volume_id)
}

/// Updates description and replaces config in one transaction.
pub async fn volume_update(
    pool: &Pool<Sqlite>,
    volume_id: i64,
    description: &str,
    config: &HashMap<String, String>,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE storage_volumes SET description = ? WHERE id = ?")
        .bind(description)
        .bind(volume_id)
        .execute(&mut *tx)
        .await
        .context("Failed to update storage volume")?;

    sqlx::query("DELETE FROM storage_volumes_config WHERE storage_volume_id = ?")
        .bind(volume_id)
        .execute(&mut *tx)
        .await
        .context("Failed to clear storage volume config")?;

    insert_volume_config(&mut tx, volume_id, config).await?;

    tx.commit().await?;
    Ok(())
}

/// Replaces the config map (clear + add) in one transaction.
pub async fn volume_config_replace(
    pool: &Pool<Sqlite>,
    volume_id: i64,
    config: &HashMap<String, String>,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM storage_volumes_config WHERE storage_volume_id = ?")
        .bind(volume_id)
        .execute(&mut *tx)
        .await
        .context("Failed to clear storage volume config")?;

    insert_volume_config(&mut tx, volume_id, config).await?;

    tx.commit().await?;
    Ok(())
}

/// Upserts a single volume config key.
pub async fn volume_config_set(
    pool: &Pool<Sqlite>,
    volume_id: i64,
    key: &str,
    value: &str,
) -> anyhow::Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"INSERT INTO storage_volumes_config (storage_volume_id, key, value) VALUES (?, ?, ?)
        ON CONFLICT (storage_volume_id, key) DO UPDATE SET value = excluded.value"#,
    )
    .bind(volume_id)
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("Failed to set storage volume config key")?;

    Ok(())
}

/// Renames a volume row in place.
pub async fn volume_rename(
    pool: &Pool<Sqlite>,
    volume_id: i64,
    new_name: &str,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE storage_volumes SET name = ? WHERE id = ?")
        .bind(new_name)
        .bind(volume_id)
        .execute(pool)
        .await
        .context("Failed to rename storage volume")?;

    Ok(())
}

/// Deletes a volume row and its config.
pub async fn volume_delete(pool: &Pool<Sqlite>, volume_id: i64) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM storage_volumes_config WHERE storage_volume_id = ?")
        .bind(volume_id)
        .execute(&mut *tx)
        .await
        .context("Failed to delete storage volume config")?;

    sqlx::query("DELETE FROM storage_volumes WHERE id = ?")
        .bind(volume_id)
        .execute(&mut *tx)
        .await
        .context("Failed to delete storage volume")?;

    tx.commit().await?;
    Ok(())
}

/// Ensures a `(pool, kind, name)` volume row exists: updates it when present,
/// inserts it otherwise. Returns the row id. The upgrade patches call this on
/// every boot until they complete, so it must never error on a duplicate.
pub async fn volume_ensure(
    pool: &Pool<Sqlite>,
    pool_id: i64,
    kind: VolumeKind,
    name: &str,
    description: &str,
    config: &HashMap<String, String>,
) -> anyhow::Result<i64> {
    if let Some(existing) = volume_get(pool, pool_id, kind, name).await? {
        volume_update(pool, existing.id, description, config).await?;
        return Ok(existing.id);
    }
    volume_create(pool, pool_id, kind, name, description, config).await
}

/// Snapshot volumes of a parent, ordered by name.
pub async fn volume_snapshots(
    pool: &Pool<Sqlite>,
    pool_id: i64,
    parent_kind: VolumeKind,
    parent: &str,
) -> anyhow::Result<Vec<StorageVolume>> {
    let Some(snapshot_kind) = parent_kind.snapshot_kind() else {
        return Ok(Vec::new());
    };

    let prefix = format!("{}{}", parent, SNAPSHOT_DELIMITER);
    let volumes = sqlx::query_as::<_, StorageVolume>(
        r#"SELECT * FROM storage_volumes
        WHERE storage_pool_id = ? AND kind = ? AND name LIKE ? ESCAPE '\'
        ORDER BY name"#,
    )
    .bind(pool_id)
    .bind(snapshot_kind.as_str())
    .bind(format!("{}%", prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")))
    .fetch_all(pool)
    .await
    .context("Failed to fetch storage volume snapshots")?;

    Ok(volumes)
}

async fn insert_volume_config(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    volume_id: i64,
    config: &HashMap<String, String>,
) -> anyhow::Result<()> {
    for (key, value) in config {
        if value.is_empty() {
            continue;
        }
        sqlx::query(
            "INSERT INTO storage_volumes_config (storage_volume_id, key, value) VALUES (?, ?, ?)",
        )
        .bind(volume_id)
        .bind(key)
        .bind(value)
        .execute(&mut **tx)
        .await
        .context("Failed to insert storage volume config")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::v1::db::init_schema;
    use crate::schemas::v1::db::queries::storage_pool;

    async fn pool_with_p1() -> (Pool<Sqlite>, i64) {
        let db = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&db).await.unwrap();
        let id = storage_pool::pool_create(&db, "p1", "dir", "", &HashMap::new())
            .await
            .unwrap();
        (db, id)
    }

    #[tokio::test]
    async fn kind_filter_and_ordering() {
        let (db, pid) = pool_with_p1().await;
        for (kind, name) in [
            (VolumeKind::Custom, "zeta"),
            (VolumeKind::Custom, "alpha"),
            (VolumeKind::Container, "web1"),
        ] {
            volume_create(&db, pid, kind, name, "", &HashMap::new()).await.unwrap();
        }

        let custom = volume_list_by_pool(&db, pid, &[VolumeKind::Custom]).await.unwrap();
        assert_eq!(
            custom.iter().map(|v| v.name.as_str()).collect::<Vec<_>>(),
            vec!["alpha", "zeta"]
        );

        let all = volume_list_by_pool(&db, pid, &[]).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn ensure_is_an_upsert() {
        let (db, pid) = pool_with_p1().await;
        let mut config = HashMap::new();
        config.insert("size".to_string(), "10GiB".to_string());

        let a = volume_ensure(&db, pid, VolumeKind::Container, "c1", "", &config)
            .await
            .unwrap();
        config.insert("size".to_string(), "20GiB".to_string());
        let b = volume_ensure(&db, pid, VolumeKind::Container, "c1", "", &config)
            .await
            .unwrap();

        assert_eq!(a, b);
        let stored = volume_config(&db, b).await.unwrap();
        assert_eq!(stored.get("size").map(String::as_str), Some("20GiB"));
    }

    #[tokio::test]
    async fn snapshots_resolve_by_flat_prefix() {
        let (db, pid) = pool_with_p1().await;
        volume_create(&db, pid, VolumeKind::Container, "web1", "", &HashMap::new())
            .await
            .unwrap();
        for snap in ["web1/snap0", "web1/snap1", "web10/snap0"] {
            volume_create(&db, pid, VolumeKind::ContainerSnapshot, snap, "", &HashMap::new())
                .await
                .unwrap();
        }

        let snaps = volume_snapshots(&db, pid, VolumeKind::Container, "web1").await.unwrap();
        assert_eq!(
            snaps.iter().map(|v| v.name.as_str()).collect::<Vec<_>>(),
            vec!["web1/snap0", "web1/snap1"]
        );
    }
}
