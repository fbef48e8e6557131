//! Pool lifecycle orchestration: catalog rows, driver side effects, mount
//! refcounts, and the driver cache, kept mutually consistent.

use crate::db_manager::retry::with_retry;
use crate::schemas::v1::db::queries;
use crate::schemas::v1::models::storage::{StoragePool, StoragePoolView};
use crate::storage::driver::{self, PoolSpec};
use crate::storage::{validate_object_name, DriverCache, StorageError};
use log::{info, warn};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct PoolManager {
    db: Pool<Sqlite>,
    data_dir: PathBuf,
    cache: Arc<DriverCache>,
    /// Mount refcounts per pool: mount on first use, unmount on last release.
    mounts: Mutex<HashMap<String, usize>>,
}

impl PoolManager {
    pub fn new(db: Pool<Sqlite>, data_dir: impl Into<PathBuf>, cache: Arc<DriverCache>) -> Self {
        Self {
            db,
            data_dir: data_dir.into(),
            cache,
            mounts: Mutex::new(HashMap::new()),
        }
    }

    pub fn driver_cache(&self) -> &Arc<DriverCache> {
        &self.cache
    }

    /// Seeds the driver cache from the catalog. Called once at boot, after
    /// patches ran.
    pub async fn init(&self) -> Result<(), StorageError> {
        let drivers = with_retry(|| queries::storage_pool::pool_drivers(&self.db)).await?;
        self.cache.replace(drivers);
        Ok(())
    }

    pub async fn list_names(&self) -> Result<Vec<String>, StorageError> {
        Ok(with_retry(|| queries::storage_pool::pool_names(&self.db)).await?)
    }

    pub async fn list(&self) -> Result<Vec<StoragePoolView>, StorageError> {
        let rows = with_retry(|| queries::storage_pool::pool_list(&self.db)).await?;
        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            views.push(self.view(&row).await?);
        }
        views.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(views)
    }

    pub async fn get(&self, name: &str) -> Result<StoragePoolView, StorageError> {
        let row = self.get_row(name).await?;
        self.view(&row).await
    }

    /// Creates a pool: validate, fill defaults, commit the catalog row, then
    /// run the slow driver-side creation. A driver failure rolls the row back
    /// so no orphan survives.
    pub async fn create(
        &self,
        name: &str,
        driver_tag: &str,
        description: &str,
        config: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        validate_object_name(name)?;
        let driver = driver::load_driver(driver_tag)?;

        if with_retry(|| queries::storage_pool::pool_get_by_name(&self.db, name))
            .await?
            .is_some()
        {
            return Err(StorageError::Conflict(format!(
                "Storage pool {} already exists",
                name
            )));
        }

        let mut spec = PoolSpec::new(name, config, &self.data_dir);
        driver.fill_defaults(&mut spec);
        driver.validate_config(&spec)?;

        let pool_id = with_retry(|| {
            queries::storage_pool::pool_create(&self.db, name, driver_tag, description, &spec.config)
        })
        .await?;

        if let Err(driver_err) = driver.pool_create(&spec).await {
            warn!(
                "Driver {} failed to create pool {}, rolling back catalog row: {}",
                driver_tag, name, driver_err
            );
            if let Err(db_err) =
                with_retry(|| queries::storage_pool::pool_delete(&self.db, pool_id)).await
            {
                warn!("Failed to roll back pool row for {}: {}", name, db_err);
            }
            return Err(driver_err);
        }

        self.cache.insert(driver_tag);
        info!("Created storage pool {} (driver {})", name, driver_tag);
        Ok(())
    }

    /// Updates description and config in one transaction. The driver is not
    /// reconfigured online.
    pub async fn update(
        &self,
        name: &str,
        description: &str,
        config: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        let row = self.get_row(name).await?;
        let driver = driver::load_driver(&row.driver)?;

        let mut spec = PoolSpec::new(name, config, &self.data_dir);
        driver.fill_defaults(&mut spec);
        driver.validate_config(&spec)?;

        with_retry(|| {
            queries::storage_pool::pool_update(&self.db, row.id, description, &spec.config)
        })
        .await?;

        Ok(())
    }

    /// Deletes a pool. Refused while any volume references it. The driver
    /// cache is refreshed from the catalog after the teardown attempt,
    /// regardless of the driver outcome: admission follows the catalog.
    pub async fn delete(&self, name: &str) -> Result<(), StorageError> {
        let row = self.get_row(name).await?;

        let volumes = with_retry(|| queries::storage_pool::pool_volume_count(&self.db, row.id))
            .await?;
        if volumes > 0 {
            return Err(StorageError::Conflict(format!(
                "Storage pool {} has {} volumes",
                name, volumes
            )));
        }

        let spec = self.spec_for(&row).await?;
        let driver = driver::load_driver(&row.driver)?;

        with_retry(|| queries::storage_pool::pool_delete(&self.db, row.id)).await?;

        let teardown = driver.pool_delete(&spec).await;

        self.refresh_driver_cache().await?;
        self.mounts.lock().await.remove(name);

        teardown?;
        info!("Deleted storage pool {}", name);
        Ok(())
    }

    /// Mounts the pool on first use.
    pub async fn mount(&self, name: &str) -> Result<(), StorageError> {
        let row = self.get_row(name).await?;
        let spec = self.spec_for(&row).await?;
        let driver = driver::load_driver(&row.driver)?;

        let mut mounts = self.mounts.lock().await;
        let count = mounts.entry(name.to_string()).or_insert(0);
        if *count == 0 {
            driver.pool_mount(&spec).await?;
        }
        *count += 1;
        Ok(())
    }

    /// Releases one mount reference, unmounting on the last one.
    pub async fn release(&self, name: &str) -> Result<(), StorageError> {
        let row = self.get_row(name).await?;
        let spec = self.spec_for(&row).await?;
        let driver = driver::load_driver(&row.driver)?;

        let mut mounts = self.mounts.lock().await;
        match mounts.get_mut(name) {
            Some(count) if *count > 1 => {
                *count -= 1;
            }
            Some(_) => {
                mounts.remove(name);
                driver.pool_unmount(&spec).await?;
            }
            None => {}
        }
        Ok(())
    }

    /// Rebuilds the cache snapshot from the catalog's distinct driver set.
    pub async fn refresh_driver_cache(&self) -> Result<(), StorageError> {
        let drivers = with_retry(|| queries::storage_pool::pool_drivers(&self.db)).await?;
        self.cache.replace(drivers);
        Ok(())
    }

    pub(crate) async fn get_row(&self, name: &str) -> Result<StoragePool, StorageError> {
        with_retry(|| queries::storage_pool::pool_get_by_name(&self.db, name))
            .await?
            .ok_or_else(|| StorageError::not_found(format!("Storage pool {}", name)))
    }

    pub(crate) async fn spec_for(&self, row: &StoragePool) -> Result<PoolSpec, StorageError> {
        let config = with_retry(|| queries::storage_pool::pool_config(&self.db, row.id)).await?;
        Ok(PoolSpec::new(&row.name, config, &self.data_dir))
    }

    async fn view(&self, row: &StoragePool) -> Result<StoragePoolView, StorageError> {
        let config = with_retry(|| queries::storage_pool::pool_config(&self.db, row.id)).await?;
        let volumes =
            with_retry(|| queries::storage_volume::volume_list_by_pool(&self.db, row.id, &[]))
                .await?;

        let used_by = volumes
            .iter()
            .map(|v| format!("/v1/storage-pools/{}/volumes/{}/{}", row.name, v.kind, v.name))
            .collect();

        Ok(StoragePoolView {
            name: row.name.clone(),
            driver: row.driver.clone(),
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
    use crate::storage::VolumeKind;
    use tempfile::tempdir;

    async fn manager(data_dir: &std::path::Path) -> PoolManager {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        PoolManager::new(db.get_pool().clone(), data_dir, Arc::new(DriverCache::new()))
    }

    fn dir_config(dir: &tempfile::TempDir) -> HashMap<String, String> {
        let mut config = HashMap::new();
        config.insert(
            "source".to_string(),
            dir.path().join("p1").to_string_lossy().into_owned(),
        );
        config
    }

    #[tokio::test]
    async fn create_lists_pool_and_caches_driver() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path()).await;

        mgr.create("p1", "dir", "", dir_config(&dir)).await.unwrap();

        assert_eq!(mgr.list_names().await.unwrap(), vec!["p1".to_string()]);
        assert!(mgr.driver_cache().contains("dir"));

        let view = mgr.get("p1").await.unwrap();
        assert_eq!(view.driver, "dir");
        assert!(view.used_by.is_empty());
    }

    #[tokio::test]
    async fn unknown_driver_is_rejected_before_any_row() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path()).await;

        let err = mgr
            .create("p1", "floppy", "", HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
        assert!(mgr.list_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path()).await;

        mgr.create("p1", "dir", "", dir_config(&dir)).await.unwrap();
        let err = mgr
            .create("p1", "dir", "", dir_config(&dir))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_refused_while_volumes_exist_then_succeeds() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        mgr.create("p1", "dir", "", dir_config(&dir)).await.unwrap();

        let pool_id = queries::storage_pool::pool_get_id(&mgr.db, "p1")
            .await
            .unwrap()
            .unwrap();
        let volume_id = queries::storage_volume::volume_create(
            &mgr.db,
            pool_id,
            VolumeKind::Custom,
            "v1",
            "",
            &HashMap::new(),
        )
        .await
        .unwrap();

        let err = mgr.delete("p1").await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        assert!(mgr.driver_cache().contains("dir"));

        queries::storage_volume::volume_delete(&mgr.db, volume_id)
            .await
            .unwrap();
        mgr.delete("p1").await.unwrap();

        assert!(mgr.list_names().await.unwrap().is_empty());
        assert!(!mgr.driver_cache().contains("dir"));
    }

    #[tokio::test]
    async fn cache_keeps_driver_while_another_pool_uses_it() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path()).await;

        let mut config_a = HashMap::new();
        config_a.insert(
            "source".to_string(),
            dir.path().join("a").to_string_lossy().into_owned(),
        );
        let mut config_b = HashMap::new();
        config_b.insert(
            "source".to_string(),
            dir.path().join("b").to_string_lossy().into_owned(),
        );

        mgr.create("a", "dir", "", config_a).await.unwrap();
        mgr.create("b", "dir", "", config_b).await.unwrap();

        mgr.delete("a").await.unwrap();
        assert!(mgr.driver_cache().contains("dir"));

        mgr.delete("b").await.unwrap();
        assert!(!mgr.driver_cache().contains("dir"));
    }

    #[tokio::test]
    async fn pool_mounts_are_reference_counted() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        mgr.create("p1", "dir", "", dir_config(&dir)).await.unwrap();

        mgr.mount("p1").await.unwrap();
        mgr.mount("p1").await.unwrap();
        assert_eq!(mgr.mounts.lock().await.get("p1"), Some(&2));

        mgr.release("p1").await.unwrap();
        assert_eq!(mgr.mounts.lock().await.get("p1"), Some(&1));

        mgr.release("p1").await.unwrap();
        assert!(mgr.mounts.lock().await.get("p1").is_none());

        // Releasing an unmounted pool stays quiet.
        mgr.release("p1").await.unwrap();
    }

    #[tokio::test]
    async fn every_listed_name_resolves() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        mgr.create("p1", "dir", "", dir_config(&dir)).await.unwrap();

        for name in mgr.list_names().await.unwrap() {
            mgr.get(&name).await.unwrap();
        }
    }
}
