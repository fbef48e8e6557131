use crate::schemas::v1::models::profile::{Profile, ProfileDevice};
use anyhow::Context;
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;

pub async fn profile_get_by_name(
    pool: &Pool<Sqlite>,
    name: &str,
) -> anyhow::Result<Option<Profile>> {
    let profile = sqlx::query_as::<_, Profile>("SELECT * FROM profiles WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch profile")?;

    Ok(profile)
}

pub async fn profile_list(pool: &Pool<Sqlite>) -> anyhow::Result<Vec<Profile>> {
    let profiles = sqlx::query_as::<_, Profile>("SELECT * FROM profiles ORDER BY name")
        .fetch_all(pool)
        .await
        .context("Failed to fetch profiles")?;

    Ok(profiles)
}

/// Devices of a profile with their config rows folded in.
pub async fn profile_devices(
    pool: &Pool<Sqlite>,
    profile_id: i64,
) -> anyhow::Result<Vec<(ProfileDevice, HashMap<String, String>)>> {
    let devices = sqlx::query_as::<_, ProfileDevice>(
        "SELECT * FROM profiles_devices WHERE profile_id = ? ORDER BY name",
    )
    .bind(profile_id)
    .fetch_all(pool)
    .await
    .context("Failed to fetch profile devices")?;

    let mut out = Vec::with_capacity(devices.len());
    for device in devices {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM profiles_devices_config WHERE profile_device_id = ?",
        )
        .bind(device.id)
        .fetch_all(pool)
        .await
        .context("Failed to fetch profile device config")?;

        out.push((device, rows.into_iter().collect()));
    }

    Ok(out)
}

/// Adds a device with its config rows in one transaction. Returns the device
/// id.
pub async fn profile_device_add(
    pool: &Pool<Sqlite>,
    profile_id: i64,
    name: &str,
    device_type: &str,
    config: &HashMap<String, String>,
) -> anyhow::Result<i64> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        "INSERT INTO profiles_devices (profile_id, name, type) VALUES (?, ?, ?)",
    )
    .bind(profile_id)
    .bind(name)
    .bind(device_type)
    .execute(&mut *tx)
    .await
    .context("Failed to add profile device")?;

    let device_id = result.last_insert_rowid();
    for (key, value) in config {
        if value.is_empty() {
            continue;
        }
        sqlx::query(
            "INSERT INTO profiles_devices_config (profile_device_id, key, value) VALUES (?, ?, ?)",
        )
        .bind(device_id)
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await
        .context("Failed to add profile device config")?;
    }

    tx.commit().await?;
    Ok(device_id)
}

/// Upserts one config key on an existing device.
pub async fn profile_device_config_set(
    pool: &Pool<Sqlite>,
    device_id: i64,
    key: &str,
    value: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"INSERT INTO profiles_devices_config (profile_device_id, key, value) VALUES (?, ?, ?)
        ON CONFLICT (profile_device_id, key) DO UPDATE SET value = excluded.value"#,
    )
    .bind(device_id)
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("Failed to set profile device config")?;

    Ok(())
}

/// Profiles whose disk devices attach the given custom volume.
pub async fn profiles_using_volume(
    pool: &Pool<Sqlite>,
    pool_name: &str,
    volume_name: &str,
) -> anyhow::Result<Vec<String>> {
    let names = sqlx::query_scalar::<_, String>(
        r#"SELECT DISTINCT p.name
        FROM profiles p
        JOIN profiles_devices d ON d.profile_id = p.id
        JOIN profiles_devices_config cp
            ON cp.profile_device_id = d.id AND cp.key = 'pool' AND cp.value = ?
        JOIN profiles_devices_config cs
            ON cs.profile_device_id = d.id AND cs.key = 'source' AND cs.value = ?
        WHERE d.type = 'disk'
        ORDER BY p.name"#,
    )
    .bind(pool_name)
    .bind(volume_name)
    .fetch_all(pool)
    .await
    .context("Failed to fetch profiles using volume")?;

    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::v1::db::init_schema;

    #[tokio::test]
    async fn default_profile_exists_and_takes_devices() {
        let db = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&db).await.unwrap();

        let profile = profile_get_by_name(&db, "default").await.unwrap().unwrap();

        let mut config = HashMap::new();
        config.insert("path".to_string(), "/".to_string());
        config.insert("pool".to_string(), "p1".to_string());
        profile_device_add(&db, profile.id, "root", "disk", &config).await.unwrap();

        let devices = profile_devices(&db, profile.id).await.unwrap();
        assert_eq!(devices.len(), 1);
        let (device, config) = &devices[0];
        assert_eq!(device.name, "root");
        assert_eq!(config.get("pool").map(String::as_str), Some("p1"));
    }
}
