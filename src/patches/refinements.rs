//! Post-rollout refinements of the storage API.
//!
//! Each patch inspects the current state and writes only what has drifted;
//! none of them assumes any predecessor ran in the same boot, so all of them
//! are safe on catalogs in any intermediate shape.

use crate::db_manager::retry::with_retry;
use crate::patches::PatchContext;
use crate::schemas::v1::db::queries;
use crate::storage::driver::{self, lvm::LvmDriver, zfs::ZfsDriver, PoolSpec};
use crate::storage::{paths, StorageError, VolumeKind};
use log::{info, warn};

/// Pools created before the config defaults stabilized may lack a `source`.
/// Re-derive it from the driver defaults.
pub(super) async fn patch_storage_api_v1(ctx: &PatchContext) -> Result<(), StorageError> {
    for pool in with_retry(|| queries::storage_pool::pool_list(&ctx.db)).await? {
        let config = with_retry(|| queries::storage_pool::pool_config(&ctx.db, pool.id)).await?;
        if config.get("source").map(|s| !s.is_empty()).unwrap_or(false) {
            continue;
        }

        let drv = match driver::load_driver(&pool.driver) {
            Ok(drv) => drv,
            Err(_) => continue,
        };
        let mut spec = PoolSpec::new(&pool.name, config, &ctx.data_dir);
        drv.fill_defaults(&mut spec);

        if let Some(source) = spec.config.get("source") {
            info!("Backfilling source for pool {}", pool.name);
            with_retry(|| {
                queries::storage_pool::pool_config_set(&ctx.db, pool.id, "source", source, None)
            })
            .await?;
        }
    }
    Ok(())
}

/// The first rollout could leave dangling legacy symlinks behind for
/// entities deleted before the upgrade completed.
pub(super) async fn patch_storage_api_dir_cleanup(ctx: &PatchContext) -> Result<(), StorageError> {
    paths::prune_dangling_symlinks(&paths::legacy_containers_dir(&ctx.data_dir))
        .map_err(|e| StorageError::Driver(e.to_string()))?;
    paths::prune_dangling_symlinks(&paths::legacy_snapshots_dir(&ctx.data_dir))
        .map_err(|e| StorageError::Driver(e.to_string()))?;
    Ok(())
}

/// Early lvm pools used short config key names, and the VG/thinpool keys are
/// node-local in a cluster; rename and scope them.
pub(super) async fn patch_storage_api_lvm_keys(ctx: &PatchContext) -> Result<(), StorageError> {
    let pools = with_retry(|| queries::storage_pool::pool_list(&ctx.db)).await?;
    let lvm_pools: Vec<_> = pools.into_iter().filter(|p| p.driver == "lvm").collect();
    if lvm_pools.is_empty() {
        return Ok(());
    }

    // Reuse the local node row when registration already happened; only a
    // standalone daemon creates it here.
    let node_id = match with_retry(|| queries::node::node_get_by_name(&ctx.db, &ctx.node_name))
        .await?
    {
        Some(node) => node.id,
        None => {
            with_retry(|| queries::node::node_ensure(&ctx.db, &ctx.node_name, "127.0.0.1")).await?
        }
    };

    for pool in lvm_pools {
        for (old_key, new_key) in [("lvm.vg", "lvm.vg_name"), ("lvm.thinpool", "lvm.thinpool_name")]
        {
            with_retry(|| {
                queries::storage_pool::pool_config_rename_key(&ctx.db, pool.id, old_key, new_key)
            })
            .await?;
        }
        for key in ["lvm.vg_name", "lvm.thinpool_name"] {
            with_retry(|| {
                queries::storage_pool::pool_config_set_node_scope(&ctx.db, pool.id, key, node_id)
            })
            .await?;
        }
    }
    Ok(())
}

/// Drops config keys no driver schema recognizes any more.
pub(super) async fn patch_storage_api_keys(ctx: &PatchContext) -> Result<(), StorageError> {
    for pool in with_retry(|| queries::storage_pool::pool_list(&ctx.db)).await? {
        let drv = match driver::load_driver(&pool.driver) {
            Ok(drv) => drv,
            Err(_) => continue,
        };
        let allowed = drv.pool_config_keys();
        let config = with_retry(|| queries::storage_pool::pool_config(&ctx.db, pool.id)).await?;

        for key in config.keys() {
            if !allowed.contains(&key.as_str()) {
                info!("Dropping unknown config key {} from pool {}", key, pool.name);
                with_retry(|| queries::storage_pool::pool_config_unset(&ctx.db, pool.id, key))
                    .await?;
            }
        }
    }
    Ok(())
}

/// Re-derives driver defaults for every pool and writes back the merged
/// config, syncing catalogs that drifted from the current default set.
pub(super) async fn patch_storage_api_update_storage_configs(
    ctx: &PatchContext,
) -> Result<(), StorageError> {
    for pool in with_retry(|| queries::storage_pool::pool_list(&ctx.db)).await? {
        let drv = match driver::load_driver(&pool.driver) {
            Ok(drv) => drv,
            Err(_) => continue,
        };
        let config = with_retry(|| queries::storage_pool::pool_config(&ctx.db, pool.id)).await?;
        let mut spec = PoolSpec::new(&pool.name, config.clone(), &ctx.data_dir);
        drv.fill_defaults(&mut spec);
        if let Err(err) = drv.validate_config(&spec) {
            warn!("Pool {} config fails validation after defaults: {}", pool.name, err);
            continue;
        }
        if spec.config != config {
            with_retry(|| {
                queries::storage_pool::pool_config_replace(&ctx.db, pool.id, &spec.config)
            })
            .await?;
        }
    }
    Ok(())
}

/// A daemon whose data directory itself sits on btrfs ended up with pools
/// whose source pointed at the data directory root; point them at the pool
/// mount root instead.
pub(super) async fn patch_storage_api_vessel_on_btrfs(
    ctx: &PatchContext,
) -> Result<(), StorageError> {
    let data_dir = ctx.data_dir.to_string_lossy().into_owned();
    for pool in with_retry(|| queries::storage_pool::pool_list(&ctx.db)).await? {
        if pool.driver != "btrfs" {
            continue;
        }
        let config = with_retry(|| queries::storage_pool::pool_config(&ctx.db, pool.id)).await?;
        if config.get("source").map(String::as_str) == Some(data_dir.as_str()) {
            let source = paths::pool_mount_root(&ctx.data_dir, &pool.name)
                .to_string_lossy()
                .into_owned();
            info!("Repointing btrfs pool {} source into the pool layout", pool.name);
            with_retry(|| {
                queries::storage_pool::pool_config_set(&ctx.db, pool.id, "source", &source, None)
            })
            .await?;
        }
    }
    Ok(())
}

/// lvm pools from the upgrade predate the `volume.size` default; read the
/// actual size of an existing logical volume and record it.
pub(super) async fn patch_storage_api_lvm_detect_lv_size(
    ctx: &PatchContext,
) -> Result<(), StorageError> {
    for pool in with_retry(|| queries::storage_pool::pool_list(&ctx.db)).await? {
        if pool.driver != "lvm" {
            continue;
        }
        let config = with_retry(|| queries::storage_pool::pool_config(&ctx.db, pool.id)).await?;
        if config.contains_key("volume.size") {
            continue;
        }

        let spec = PoolSpec::new(&pool.name, config, &ctx.data_dir);
        let drv = LvmDriver;
        let volumes = with_retry(|| {
            queries::storage_volume::volume_list_by_pool(&ctx.db, pool.id, &[VolumeKind::Container])
        })
        .await?;

        let mut detected: Option<u64> = None;
        for volume in &volumes {
            let vol_spec = driver::VolumeSpec::new(VolumeKind::Container, &volume.name);
            match driver::StorageDriver::volume_size(&drv, &spec, &vol_spec).await {
                Ok(size) => {
                    detected = Some(size);
                    break;
                }
                Err(err) => warn!("Failed to read size of {}: {}", volume.name, err),
            }
        }

        let value = match detected {
            Some(bytes) => format!("{}B", bytes),
            None => "10GiB".to_string(),
        };
        with_retry(|| {
            queries::storage_pool::pool_config_set(&ctx.db, pool.id, "volume.size", &value, None)
        })
        .await?;
    }
    Ok(())
}

/// A short-lived release wrote pool rows without a driver tag when the
/// upgrade derived them from `zfs.pool_name`; backfill the tag.
pub(super) async fn patch_storage_api_insert_zfs_driver(
    ctx: &PatchContext,
) -> Result<(), StorageError> {
    for pool in with_retry(|| queries::storage_pool::pool_list(&ctx.db)).await? {
        if !pool.driver.is_empty() {
            continue;
        }
        let config = with_retry(|| queries::storage_pool::pool_config(&ctx.db, pool.id)).await?;
        if config.contains_key("zfs.pool_name") {
            info!("Backfilling zfs driver tag for pool {}", pool.name);
            with_retry(|| queries::storage_pool::pool_set_driver(&ctx.db, pool.id, "zfs")).await?;
        }
    }
    Ok(())
}

/// Container datasets must not auto-mount behind the daemon's back.
pub(super) async fn patch_storage_zfs_noauto(ctx: &PatchContext) -> Result<(), StorageError> {
    let zfs = ZfsDriver;
    for pool in with_retry(|| queries::storage_pool::pool_list(&ctx.db)).await? {
        if pool.driver != "zfs" {
            continue;
        }
        let config = with_retry(|| queries::storage_pool::pool_config(&ctx.db, pool.id)).await?;
        let spec = PoolSpec::new(&pool.name, config, &ctx.data_dir);
        let zpool = ZfsDriver::zpool_name(&spec);

        let volumes = with_retry(|| {
            queries::storage_volume::volume_list_by_pool(&ctx.db, pool.id, &[VolumeKind::Container])
        })
        .await?;
        for volume in volumes {
            let dataset = format!("{}/containers/{}", zpool, volume.name);
            zfs.set_property(&dataset, "canmount=noauto").await?;
        }
    }
    Ok(())
}

/// Volumes on zfs pools created before per-volume sizes copy the pool-level
/// default into their own config.
pub(super) async fn patch_storage_zfs_volume_size(ctx: &PatchContext) -> Result<(), StorageError> {
    for pool in with_retry(|| queries::storage_pool::pool_list(&ctx.db)).await? {
        if pool.driver != "zfs" {
            continue;
        }
        let config = with_retry(|| queries::storage_pool::pool_config(&ctx.db, pool.id)).await?;
        let Some(default_size) = config.get("volume.size").filter(|v| !v.is_empty()).cloned()
        else {
            continue;
        };

        let volumes = with_retry(|| {
            queries::storage_volume::volume_list_by_pool(
                &ctx.db,
                pool.id,
                &[VolumeKind::Container, VolumeKind::Custom],
            )
        })
        .await?;
        for volume in volumes {
            let volume_config =
                with_retry(|| queries::storage_volume::volume_config(&ctx.db, volume.id)).await?;
            if volume_config.contains_key("size") {
                continue;
            }
            with_retry(|| {
                queries::storage_volume::volume_config_set(&ctx.db, volume.id, "size", &default_size)
            })
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_manager::DatabaseManager;
    use sqlx::{Pool, Sqlite};
    use std::collections::HashMap;
    use tempfile::tempdir;

    async fn catalog() -> Pool<Sqlite> {
        DatabaseManager::new_in_memory().await.unwrap().get_pool().clone()
    }

    fn ctx(db: Pool<Sqlite>, dir: &tempfile::TempDir) -> PatchContext {
        PatchContext {
            db,
            data_dir: dir.path().to_path_buf(),
            node_name: "local".to_string(),
        }
    }

    #[tokio::test]
    async fn v1_backfills_missing_source() {
        let dir = tempdir().unwrap();
        let db = catalog().await;
        let pool_id = queries::storage_pool::pool_create(&db, "p1", "dir", "", &HashMap::new())
            .await
            .unwrap();

        let ctx = ctx(db, &dir);
        patch_storage_api_v1(&ctx).await.unwrap();
        // Idempotent by construction.
        patch_storage_api_v1(&ctx).await.unwrap();

        let config = queries::storage_pool::pool_config(&ctx.db, pool_id).await.unwrap();
        assert_eq!(
            config.get("source").map(String::as_str),
            Some(dir.path().join("storage-pools/p1").to_string_lossy().as_ref())
        );
    }

    #[tokio::test]
    async fn lvm_keys_rename_and_scope_to_node() {
        let dir = tempdir().unwrap();
        let db = catalog().await;
        let pool_id = queries::storage_pool::pool_create(&db, "vg0", "lvm", "", &HashMap::new())
            .await
            .unwrap();
        queries::storage_pool::pool_config_set(&db, pool_id, "lvm.vg", "vg0", None)
            .await
            .unwrap();
        queries::storage_pool::pool_config_set(&db, pool_id, "lvm.thinpool", "tp0", None)
            .await
            .unwrap();

        let ctx = ctx(db, &dir);
        patch_storage_api_lvm_keys(&ctx).await.unwrap();
        patch_storage_api_lvm_keys(&ctx).await.unwrap();

        let config = queries::storage_pool::pool_config(&ctx.db, pool_id).await.unwrap();
        assert_eq!(config.get("lvm.vg_name").map(String::as_str), Some("vg0"));
        assert_eq!(config.get("lvm.thinpool_name").map(String::as_str), Some("tp0"));
        assert!(!config.contains_key("lvm.vg"));

        // The scoped rows carry the local node id.
        let scoped: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM storage_pools_config WHERE storage_pool_id = ? AND node_id IS NOT NULL",
        )
        .bind(pool_id)
        .fetch_one(&ctx.db)
        .await
        .unwrap();
        assert_eq!(scoped, 2);
    }

    #[tokio::test]
    async fn unknown_keys_are_dropped() {
        let dir = tempdir().unwrap();
        let db = catalog().await;
        let mut config = HashMap::new();
        config.insert("source".to_string(), "/var/lib/vessel/p1".to_string());
        config.insert("volume.zfs_legacy".to_string(), "1".to_string());
        let pool_id = queries::storage_pool::pool_create(&db, "p1", "dir", "", &config)
            .await
            .unwrap();

        let ctx = ctx(db, &dir);
        patch_storage_api_keys(&ctx).await.unwrap();

        let config = queries::storage_pool::pool_config(&ctx.db, pool_id).await.unwrap();
        assert!(config.contains_key("source"));
        assert!(!config.contains_key("volume.zfs_legacy"));
    }

    #[tokio::test]
    async fn btrfs_source_repoints_into_pool_layout_without_duplicates() {
        let dir = tempdir().unwrap();
        let db = catalog().await;
        let mut config = HashMap::new();
        config.insert(
            "source".to_string(),
            dir.path().to_string_lossy().into_owned(),
        );
        let pool_id = queries::storage_pool::pool_create(&db, "p1", "btrfs", "", &config)
            .await
            .unwrap();

        let ctx = ctx(db, &dir);
        patch_storage_api_vessel_on_btrfs(&ctx).await.unwrap();
        patch_storage_api_vessel_on_btrfs(&ctx).await.unwrap();

        let config = queries::storage_pool::pool_config(&ctx.db, pool_id).await.unwrap();
        let expected = dir.path().join("storage-pools/p1");
        assert_eq!(
            config.get("source").map(String::as_str),
            Some(expected.to_string_lossy().as_ref())
        );

        // Repointing rewrites the existing row; it must not grow a second
        // global source row.
        let rows: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM storage_pools_config WHERE storage_pool_id = ? AND key = 'source'",
        )
        .bind(pool_id)
        .fetch_one(&ctx.db)
        .await
        .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn update_storage_configs_backfills_driver_defaults() {
        let dir = tempdir().unwrap();
        let db = catalog().await;
        let mut config = HashMap::new();
        config.insert("source".to_string(), "vg0".to_string());
        config.insert("lvm.vg_name".to_string(), "vg0".to_string());
        let pool_id = queries::storage_pool::pool_create(&db, "vg0", "lvm", "", &config)
            .await
            .unwrap();

        let ctx = ctx(db, &dir);
        patch_storage_api_update_storage_configs(&ctx).await.unwrap();
        patch_storage_api_update_storage_configs(&ctx).await.unwrap();

        let config = queries::storage_pool::pool_config(&ctx.db, pool_id).await.unwrap();
        assert_eq!(config.get("volume.size").map(String::as_str), Some("10GiB"));
        assert_eq!(
            config.get("volume.block.filesystem").map(String::as_str),
            Some("ext4")
        );
        assert_eq!(config.get("lvm.vg_name").map(String::as_str), Some("vg0"));
    }

    #[tokio::test]
    async fn zfs_volume_size_copies_pool_default_onto_bare_volumes() {
        let dir = tempdir().unwrap();
        let db = catalog().await;
        let mut config = HashMap::new();
        config.insert("zfs.pool_name".to_string(), "tank".to_string());
        config.insert("volume.size".to_string(), "7GiB".to_string());
        let pool_id = queries::storage_pool::pool_create(&db, "tank", "zfs", "", &config)
            .await
            .unwrap();

        let bare = queries::storage_volume::volume_create(
            &db,
            pool_id,
            VolumeKind::Container,
            "c1",
            "",
            &HashMap::new(),
        )
        .await
        .unwrap();
        let mut sized = HashMap::new();
        sized.insert("size".to_string(), "4GiB".to_string());
        let kept = queries::storage_volume::volume_create(
            &db,
            pool_id,
            VolumeKind::Custom,
            "data",
            "",
            &sized,
        )
        .await
        .unwrap();

        let ctx = ctx(db, &dir);
        patch_storage_zfs_volume_size(&ctx).await.unwrap();
        patch_storage_zfs_volume_size(&ctx).await.unwrap();

        let bare_config = queries::storage_volume::volume_config(&ctx.db, bare).await.unwrap();
        assert_eq!(bare_config.get("size").map(String::as_str), Some("7GiB"));

        // A volume carrying its own size keeps it.
        let kept_config = queries::storage_volume::volume_config(&ctx.db, kept).await.unwrap();
        assert_eq!(kept_config.get("size").map(String::as_str), Some("4GiB"));
    }

    #[tokio::test]
    async fn empty_driver_with_zfs_config_gets_tagged() {
        let dir = tempdir().unwrap();
        let db = catalog().await;
        let mut config = HashMap::new();
        config.insert("zfs.pool_name".to_string(), "tank".to_string());
        let pool_id = queries::storage_pool::pool_create(&db, "tank", "", "", &config)
            .await
            .unwrap();

        let ctx = ctx(db, &dir);
        patch_storage_api_insert_zfs_driver(&ctx).await.unwrap();

        let pool = queries::storage_pool::pool_get_by_name(&ctx.db, "tank")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pool.driver, "zfs");
        let _ = pool_id;
    }

    #[tokio::test]
    async fn dir_cleanup_prunes_dangling_legacy_links() {
        let dir = tempdir().unwrap();
        let containers = dir.path().join("containers");
        std::fs::create_dir_all(&containers).unwrap();
        std::os::unix::fs::symlink(dir.path().join("gone"), containers.join("c1")).unwrap();

        let ctx = ctx(catalog().await, &dir);
        patch_storage_api_dir_cleanup(&ctx).await.unwrap();
        assert!(std::fs::symlink_metadata(containers.join("c1")).is_err());
    }
}
