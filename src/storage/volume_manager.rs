//! Volume lifecycle: CRUD, rename/move, copy, snapshots and restore, with
//! in-use enforcement against profiles, instances, and the runtime.

use crate::db_manager::retry::with_retry;
use crate::instances::InstanceRuntime;
use crate::schemas::v1::db::queries;
use crate::schemas::v1::models::storage::{StoragePool, StorageVolume, StorageVolumeView};
use crate::storage::driver::{self, PoolSpec, StorageDriver, VolumeSpec};
use crate::storage::{paths, validate_object_name, SnapshotName, StorageError, VolumeKind};
use log::{info, warn};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub struct VolumeManager {
    db: Pool<Sqlite>,
    data_dir: PathBuf,
    runtime: Arc<dyn InstanceRuntime>,
}

impl VolumeManager {
    pub fn new(
        db: Pool<Sqlite>,
        data_dir: impl Into<PathBuf>,
        runtime: Arc<dyn InstanceRuntime>,
    ) -> Self {
        Self {
            db,
            data_dir: data_dir.into(),
            runtime,
        }
    }

    pub async fn list(
        &self,
        pool_name: &str,
        kinds: &[VolumeKind],
    ) -> Result<Vec<StorageVolumeView>, StorageError> {
        let (pool, _, _) = self.pool_context(pool_name).await?;
        let rows =
            with_retry(|| queries::storage_volume::volume_list_by_pool(&self.db, pool.id, kinds))
                .await?;

        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            views.push(self.view(&pool, &row).await?);
        }
        Ok(views)
    }

    pub async fn get(
        &self,
        pool_name: &str,
        kind: VolumeKind,
        name: &str,
    ) -> Result<StorageVolumeView, StorageError> {
        let (pool, _, _) = self.pool_context(pool_name).await?;
        let row = self.get_row(&pool, kind, name).await?;
        self.view(&pool, &row).await
    }

    /// Creates a volume: catalog row first, then the driver object; a driver
    /// failure rolls the row back.
    pub async fn create(
        &self,
        pool_name: &str,
        kind: VolumeKind,
        name: &str,
        description: &str,
        config: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        validate_object_name(name)?;
        let (pool, spec, drv) = self.pool_context(pool_name).await?;
        drv.validate_volume_config(&config)?;

        if with_retry(|| queries::storage_volume::volume_get(&self.db, pool.id, kind, name))
            .await?
            .is_some()
        {
            return Err(StorageError::Conflict(format!(
                "Storage volume {} already exists",
                name
            )));
        }

        let volume_id = with_retry(|| {
            queries::storage_volume::volume_create(&self.db, pool.id, kind, name, description, &config)
        })
        .await?;

        let volume = VolumeSpec::new(kind, name).with_config(config);
        if let Err(driver_err) = drv.volume_create(&spec, &volume).await {
            warn!(
                "Driver failed to create volume {} in pool {}, rolling back: {}",
                name, pool_name, driver_err
            );
            if let Err(db_err) =
                with_retry(|| queries::storage_volume::volume_delete(&self.db, volume_id)).await
            {
                warn!("Failed to roll back volume row for {}: {}", name, db_err);
            }
            return Err(driver_err);
        }

        info!("Created {} volume {} in pool {}", kind, name, pool_name);
        Ok(())
    }

    /// Updates description and replaces config.
    pub async fn update(
        &self,
        pool_name: &str,
        kind: VolumeKind,
        name: &str,
        description: &str,
        config: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        let (pool, _, drv) = self.pool_context(pool_name).await?;
        drv.validate_volume_config(&config)?;
        let row = self.get_row(&pool, kind, name).await?;

        with_retry(|| {
            queries::storage_volume::volume_update(&self.db, row.id, description, &config)
        })
        .await?;
        Ok(())
    }

    /// Deletes a volume and its snapshots. Refused while in use.
    pub async fn delete(
        &self,
        pool_name: &str,
        kind: VolumeKind,
        name: &str,
    ) -> Result<(), StorageError> {
        let (pool, spec, drv) = self.pool_context(pool_name).await?;
        let row = self.get_row(&pool, kind, name).await?;

        self.ensure_not_in_use(&pool, kind, name).await?;

        // Snapshots go first, driver object then row each time.
        let snapshots =
            with_retry(|| queries::storage_volume::volume_snapshots(&self.db, pool.id, kind, name))
                .await?;
        for snapshot_row in snapshots {
            if let Some(snap) = SnapshotName::parse(&snapshot_row.name) {
                drv.volume_snapshot_delete(&spec, &VolumeSpec::new(kind, &snap.parent), &snap.snapshot)
                    .await?;
            }
            with_retry(|| queries::storage_volume::volume_delete(&self.db, snapshot_row.id))
                .await?;
        }

        let volume = VolumeSpec::new(kind, name);
        drv.volume_delete(&spec, &volume).await?;
        with_retry(|| queries::storage_volume::volume_delete(&self.db, row.id)).await?;

        info!("Deleted {} volume {} from pool {}", kind, name, pool_name);
        Ok(())
    }

    /// Renames a volume inside its pool, or moves it to another pool when
    /// `target_pool` differs. Both forms are refused while the volume is in
    /// use.
    pub async fn rename(
        &self,
        pool_name: &str,
        kind: VolumeKind,
        name: &str,
        new_name: &str,
        target_pool: Option<&str>,
    ) -> Result<(), StorageError> {
        validate_object_name(new_name)?;
        let (pool, spec, drv) = self.pool_context(pool_name).await?;
        let row = self.get_row(&pool, kind, name).await?;

        self.ensure_not_in_use(&pool, kind, name).await?;

        let same_pool = target_pool.map(|t| t == pool_name).unwrap_or(true);
        if same_pool {
            // Intra-pool: a driver-level rename.
            if with_retry(|| {
                queries::storage_volume::volume_get(&self.db, pool.id, kind, new_name)
            })
            .await?
            .is_some()
            {
                return Err(StorageError::Conflict(format!(
                    "Storage volume {} already exists",
                    new_name
                )));
            }

            drv.volume_rename(&spec, &VolumeSpec::new(kind, name), new_name).await?;
            with_retry(|| queries::storage_volume::volume_rename(&self.db, row.id, new_name))
                .await?;

            // Snapshot rows keep the parent prefix in their flat names.
            let snapshots = with_retry(|| {
                queries::storage_volume::volume_snapshots(&self.db, pool.id, kind, name)
            })
            .await?;
            for snapshot_row in snapshots {
                if let Some(snap) = SnapshotName::parse(&snapshot_row.name) {
                    let renamed = SnapshotName::new(new_name, snap.snapshot).flat();
                    with_retry(|| {
                        queries::storage_volume::volume_rename(&self.db, snapshot_row.id, &renamed)
                    })
                    .await?;
                }
            }
        } else {
            // Inter-pool: create in target, copy data, delete in source.
            let target = target_pool.unwrap_or(pool_name);
            self.move_to_pool(&spec, drv.as_ref(), &row, kind, name, target, new_name)
                .await?;
        }

        info!(
            "Renamed {} volume {} to {}{}",
            kind,
            name,
            new_name,
            target_pool.map(|t| format!(" (pool {})", t)).unwrap_or_default()
        );
        Ok(())
    }

    /// Copies a local volume within one pool.
    pub async fn copy(
        &self,
        pool_name: &str,
        kind: VolumeKind,
        source_name: &str,
        target_name: &str,
    ) -> Result<(), StorageError> {
        validate_object_name(target_name)?;
        let (pool, spec, drv) = self.pool_context(pool_name).await?;
        let source_row = self.get_row(&pool, kind, source_name).await?;

        if with_retry(|| queries::storage_volume::volume_get(&self.db, pool.id, kind, target_name))
            .await?
            .is_some()
        {
            return Err(StorageError::Conflict(format!(
                "Storage volume {} already exists",
                target_name
            )));
        }

        let config =
            with_retry(|| queries::storage_volume::volume_config(&self.db, source_row.id)).await?;
        let target_id = with_retry(|| {
            queries::storage_volume::volume_create(
                &self.db,
                pool.id,
                kind,
                target_name,
                &source_row.description,
                &config,
            )
        })
        .await?;

        let source = VolumeSpec::new(kind, source_name);
        let target = VolumeSpec::new(kind, target_name).with_config(config);
        if let Err(driver_err) = drv.volume_copy(&spec, &source, &target).await {
            if let Err(db_err) =
                with_retry(|| queries::storage_volume::volume_delete(&self.db, target_id)).await
            {
                warn!("Failed to roll back copied volume row: {}", db_err);
            }
            return Err(driver_err);
        }
        Ok(())
    }

    /// Creates a snapshot of a volume.
    pub async fn snapshot_create(
        &self,
        pool_name: &str,
        kind: VolumeKind,
        parent: &str,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        validate_object_name(snapshot)?;
        let snapshot_kind = kind.snapshot_kind().ok_or_else(|| {
            StorageError::Validation(format!("{} volumes cannot be snapshotted", kind))
        })?;
        let (pool, spec, drv) = self.pool_context(pool_name).await?;
        let parent_row = self.get_row(&pool, kind, parent).await?;

        let flat = SnapshotName::new(parent, snapshot).flat();
        if with_retry(|| {
            queries::storage_volume::volume_get(&self.db, pool.id, snapshot_kind, &flat)
        })
        .await?
        .is_some()
        {
            return Err(StorageError::Conflict(format!(
                "Snapshot {} already exists",
                flat
            )));
        }

        let config =
            with_retry(|| queries::storage_volume::volume_config(&self.db, parent_row.id)).await?;
        let snapshot_id = with_retry(|| {
            queries::storage_volume::volume_create(&self.db, pool.id, snapshot_kind, &flat, "", &config)
        })
        .await?;

        if let Err(driver_err) = drv
            .volume_snapshot_create(&spec, &VolumeSpec::new(kind, parent), snapshot)
            .await
        {
            if let Err(db_err) =
                with_retry(|| queries::storage_volume::volume_delete(&self.db, snapshot_id)).await
            {
                warn!("Failed to roll back snapshot row: {}", db_err);
            }
            return Err(driver_err);
        }
        Ok(())
    }

    pub async fn snapshot_delete(
        &self,
        pool_name: &str,
        kind: VolumeKind,
        parent: &str,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let snapshot_kind = kind.snapshot_kind().ok_or_else(|| {
            StorageError::Validation(format!("{} volumes cannot have snapshots", kind))
        })?;
        let (pool, spec, drv) = self.pool_context(pool_name).await?;

        let flat = SnapshotName::new(parent, snapshot).flat();
        let row = with_retry(|| {
            queries::storage_volume::volume_get(&self.db, pool.id, snapshot_kind, &flat)
        })
        .await?
        .ok_or_else(|| StorageError::not_found(format!("Snapshot {}", flat)))?;

        drv.volume_snapshot_delete(&spec, &VolumeSpec::new(kind, parent), snapshot).await?;
        with_retry(|| queries::storage_volume::volume_delete(&self.db, row.id)).await?;
        Ok(())
    }

    /// Restores a volume from one of its snapshots. A driver primitive; the
    /// catalog records no restored-from edge.
    pub async fn restore(
        &self,
        pool_name: &str,
        kind: VolumeKind,
        name: &str,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let (pool, spec, drv) = self.pool_context(pool_name).await?;
        self.get_row(&pool, kind, name).await?;
        self.ensure_not_in_use(&pool, kind, name).await?;

        drv.volume_restore(&spec, &VolumeSpec::new(kind, name), snapshot).await
    }

    /// Everything referencing the volume: profiles and instances attaching a
    /// custom volume, or the owning instance for a container volume.
    pub async fn used_by(
        &self,
        pool_name: &str,
        kind: VolumeKind,
        name: &str,
    ) -> Result<Vec<String>, StorageError> {
        let mut refs = Vec::new();
        match kind {
            VolumeKind::Custom => {
                let profiles = with_retry(|| {
                    queries::profile::profiles_using_volume(&self.db, pool_name, name)
                })
                .await?;
                refs.extend(profiles.into_iter().map(|p| format!("/v1/profiles/{}", p)));

                let instances = with_retry(|| {
                    queries::instance::instances_using_volume(&self.db, pool_name, name)
                })
                .await?;
                refs.extend(instances.into_iter().map(|i| format!("/v1/instances/{}", i)));
            }
            VolumeKind::Container => {
                // A container volume always reports its owning instance.
                if with_retry(|| queries::instance::instance_get(&self.db, "default", name))
                    .await?
                    .is_some()
                {
                    refs.push(format!("/v1/instances/{}", name));
                }
            }
            _ => {}
        }
        Ok(refs)
    }

    /// Refuses mutation while a running instance (or the daemon itself) uses
    /// the volume.
    async fn ensure_not_in_use(
        &self,
        pool: &StoragePool,
        kind: VolumeKind,
        name: &str,
    ) -> Result<(), StorageError> {
        match kind {
            VolumeKind::Container => {
                if self.runtime.is_running("default", name).await {
                    return Err(StorageError::Conflict(format!(
                        "Volume {} is in use by running instance {}",
                        name, name
                    )));
                }
            }
            VolumeKind::Custom => {
                let instances = with_retry(|| {
                    queries::instance::instances_using_volume(&self.db, &pool.name, name)
                })
                .await?;
                for instance in instances {
                    if self.runtime.is_running("default", &instance).await {
                        return Err(StorageError::Conflict(format!(
                            "Volume {} is in use by running instance {}",
                            name, instance
                        )));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn move_to_pool(
        &self,
        source_spec: &PoolSpec,
        source_driver: &dyn StorageDriver,
        row: &StorageVolume,
        kind: VolumeKind,
        name: &str,
        target_pool_name: &str,
        new_name: &str,
    ) -> Result<(), StorageError> {
        let (target_pool, target_spec, target_driver) =
            self.pool_context(target_pool_name).await?;

        if with_retry(|| {
            queries::storage_volume::volume_get(&self.db, target_pool.id, kind, new_name)
        })
        .await?
        .is_some()
        {
            return Err(StorageError::Conflict(format!(
                "Storage volume {} already exists in pool {}",
                new_name, target_pool_name
            )));
        }

        let config = with_retry(|| queries::storage_volume::volume_config(&self.db, row.id)).await?;

        // Create in target, copy the data, delete in source.
        let target_volume = VolumeSpec::new(kind, new_name).with_config(config.clone());
        target_driver.volume_create(&target_spec, &target_volume).await?;

        let source_volume = VolumeSpec::new(kind, name);
        let source_path = source_volume.path(source_spec);
        let target_path = target_volume.path(&target_spec);
        paths::copy_tree(&source_path, &target_path)
            .map_err(|e| StorageError::Driver(format!("Failed to copy volume data: {}", e)))?;

        with_retry(|| {
            queries::storage_volume::volume_create(
                &self.db,
                target_pool.id,
                kind,
                new_name,
                &row.description,
                &config,
            )
        })
        .await?;

        source_driver.volume_delete(source_spec, &source_volume).await?;
        with_retry(|| queries::storage_volume::volume_delete(&self.db, row.id)).await?;

        Ok(())
    }

    pub(crate) async fn pool_context(
        &self,
        pool_name: &str,
    ) -> Result<(StoragePool, PoolSpec, Arc<dyn StorageDriver>), StorageError> {
        let row = with_retry(|| queries::storage_pool::pool_get_by_name(&self.db, pool_name))
            .await?
            .ok_or_else(|| StorageError::not_found(format!("Storage pool {}", pool_name)))?;
        let config = with_retry(|| queries::storage_pool::pool_config(&self.db, row.id)).await?;
        let spec = PoolSpec::new(&row.name, config, &self.data_dir);
        let drv = driver::load_driver(&row.driver)?;
        Ok((row, spec, drv))
    }

    async fn get_row(
        &self,
        pool: &StoragePool,
        kind: VolumeKind,
        name: &str,
    ) -> Result<StorageVolume, StorageError> {
        with_retry(|| queries::storage_volume::volume_get(&self.db, pool.id, kind, name))
            .await?
            .ok_or_else(|| StorageError::not_found(format!("Storage volume {}", name)))
    }

    async fn view(
        &self,
        pool: &StoragePool,
        row: &StorageVolume,
    ) -> Result<StorageVolumeView, StorageError> {
        let config = with_retry(|| queries::storage_volume::volume_config(&self.db, row.id)).await?;
        let kind = VolumeKind::from_str(&row.kind)?;
        let used_by = self.used_by(&pool.name, kind, &row.name).await?;

        Ok(StorageVolumeView {
            name: row.name.clone(),
            kind: row.kind.clone(),
            description: row.description.clone(),
            config,
            used_by,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_manager::DatabaseManager;
    use crate::instances::CatalogRuntime;
    use crate::storage::{DriverCache, PoolManager};
    use tempfile::tempdir;

    async fn fixtures(dir: &tempfile::TempDir) -> (Pool<Sqlite>, PoolManager, VolumeManager) {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let db = db.get_pool().clone();
        let pools = PoolManager::new(db.clone(), dir.path(), Arc::new(DriverCache::new()));
        let runtime = Arc::new(CatalogRuntime::new(db.clone(), "local"));
        let volumes = VolumeManager::new(db.clone(), dir.path(), runtime);

        let mut config = HashMap::new();
        config.insert(
            "source".to_string(),
            dir.path().join("p1").to_string_lossy().into_owned(),
        );
        pools.create("p1", "dir", "", config).await.unwrap();

        (db, pools, volumes)
    }

    #[tokio::test]
    async fn custom_volume_crud() {
        let dir = tempdir().unwrap();
        let (_db, _pools, volumes) = fixtures(&dir).await;

        volumes
            .create("p1", VolumeKind::Custom, "v1", "", HashMap::new())
            .await
            .unwrap();

        let listed = volumes.list("p1", &[VolumeKind::Custom]).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "v1");

        let err = volumes
            .create("p1", VolumeKind::Custom, "v1", "", HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        volumes.delete("p1", VolumeKind::Custom, "v1").await.unwrap();
        let err = volumes.get("p1", VolumeKind::Custom, "v1").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn names_with_the_delimiter_are_rejected() {
        let dir = tempdir().unwrap();
        let (_db, _pools, volumes) = fixtures(&dir).await;

        let err = volumes
            .create("p1", VolumeKind::Custom, "a/b", "", HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[tokio::test]
    async fn snapshot_lifecycle_and_rename_carries_snapshots() {
        let dir = tempdir().unwrap();
        let (db, _pools, volumes) = fixtures(&dir).await;

        volumes
            .create("p1", VolumeKind::Custom, "v1", "", HashMap::new())
            .await
            .unwrap();
        volumes
            .snapshot_create("p1", VolumeKind::Custom, "v1", "snap0")
            .await
            .unwrap();

        let pool_id = queries::storage_pool::pool_get_id(&db, "p1").await.unwrap().unwrap();
        let snaps = queries::storage_volume::volume_snapshots(&db, pool_id, VolumeKind::Custom, "v1")
            .await
            .unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].name, "v1/snap0");

        volumes
            .rename("p1", VolumeKind::Custom, "v1", "v2", None)
            .await
            .unwrap();
        let snaps = queries::storage_volume::volume_snapshots(&db, pool_id, VolumeKind::Custom, "v2")
            .await
            .unwrap();
        assert_eq!(snaps[0].name, "v2/snap0");
    }

    #[tokio::test]
    async fn volume_used_by_running_instance_refuses_mutation() {
        let dir = tempdir().unwrap();
        let (db, _pools, volumes) = fixtures(&dir).await;

        volumes
            .create("p1", VolumeKind::Custom, "data", "", HashMap::new())
            .await
            .unwrap();

        // Attach the volume to a running instance.
        let iid = sqlx::query(
            "INSERT INTO instances (name, kind, project, status) VALUES ('web1', 'container', 'default', 'running')",
        )
        .execute(&db)
        .await
        .unwrap()
        .last_insert_rowid();
        let did = sqlx::query(
            "INSERT INTO instances_devices (instance_id, name, type) VALUES (?, 'data', 'disk')",
        )
        .bind(iid)
        .execute(&db)
        .await
        .unwrap()
        .last_insert_rowid();
        for (k, v) in [("pool", "p1"), ("source", "data")] {
            sqlx::query(
                "INSERT INTO instances_devices_config (instance_device_id, key, value) VALUES (?, ?, ?)",
            )
            .bind(did)
            .bind(k)
            .bind(v)
            .execute(&db)
            .await
            .unwrap();
        }

        let err = volumes
            .delete("p1", VolumeKind::Custom, "data")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        let used_by = volumes.used_by("p1", VolumeKind::Custom, "data").await.unwrap();
        assert_eq!(used_by, vec!["/v1/instances/web1".to_string()]);

        // Stop the instance; mutation becomes legal.
        sqlx::query("UPDATE instances SET status = 'stopped' WHERE id = ?")
            .bind(iid)
            .execute(&db)
            .await
            .unwrap();
        volumes.delete("p1", VolumeKind::Custom, "data").await.unwrap();
    }

    #[tokio::test]
    async fn restore_round_trips_data() {
        let dir = tempdir().unwrap();
        let (_db, _pools, volumes) = fixtures(&dir).await;

        volumes
            .create("p1", VolumeKind::Custom, "v1", "", HashMap::new())
            .await
            .unwrap();
        let data_file = paths::volume_path(dir.path(), "p1", VolumeKind::Custom, "v1").join("f");
        std::fs::write(&data_file, b"one").unwrap();

        volumes
            .snapshot_create("p1", VolumeKind::Custom, "v1", "s0")
            .await
            .unwrap();
        std::fs::write(&data_file, b"two").unwrap();

        volumes
            .restore("p1", VolumeKind::Custom, "v1", "s0")
            .await
            .unwrap();
        assert_eq!(std::fs::read(&data_file).unwrap(), b"one");
    }
}
