//! Plain-directory backend. No snapshots or quotas from the filesystem;
//! snapshots are full copies.

use super::{tree_size, validate_against_schema, PoolSpec, StorageDriver, VolumeSpec};
use crate::storage::{paths, StorageError, VolumeKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;

const POOL_CONFIG_KEYS: &[&str] = &["source", "volume.size"];
const VOLUME_CONFIG_KEYS: &[&str] = &["size"];

pub struct DirDriver;

impl DirDriver {
    fn snapshot_path(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> std::path::PathBuf {
        let kind = volume.kind.snapshot_kind().unwrap_or(volume.kind);
        paths::pool_mount_root(&pool.data_dir, &pool.name)
            .join(kind.dir_name())
            .join(&volume.name)
            .join(snapshot)
    }
}

#[async_trait]
impl StorageDriver for DirDriver {
    fn name(&self) -> &'static str {
        "dir"
    }

    fn pool_config_keys(&self) -> &'static [&'static str] {
        POOL_CONFIG_KEYS
    }

    fn fill_defaults(&self, spec: &mut PoolSpec) {
        if spec.source().map(str::is_empty).unwrap_or(true) {
            let source = spec.mount_root().to_string_lossy().into_owned();
            spec.config.insert("source".to_string(), source);
        }
    }

    fn validate_config(&self, spec: &PoolSpec) -> Result<(), StorageError> {
        validate_against_schema(&spec.config, POOL_CONFIG_KEYS)?;
        match spec.source() {
            Some(source) if source.starts_with('/') => Ok(()),
            _ => Err(StorageError::Validation(
                "dir pools require an absolute source path".into(),
            )),
        }
    }

    fn validate_volume_config(&self, config: &HashMap<String, String>) -> Result<(), StorageError> {
        validate_against_schema(config, VOLUME_CONFIG_KEYS)
    }

    async fn pool_create(&self, pool: &PoolSpec) -> Result<(), StorageError> {
        let root = pool.mount_root();
        for kind in [
            VolumeKind::Container,
            VolumeKind::ContainerSnapshot,
            VolumeKind::Image,
            VolumeKind::Custom,
            VolumeKind::CustomSnapshot,
        ] {
            fs::create_dir_all(root.join(kind.dir_name()))
                .map_err(|e| StorageError::Driver(format!("Failed to create pool layout: {}", e)))?;
        }
        Ok(())
    }

    async fn pool_delete(&self, pool: &PoolSpec) -> Result<(), StorageError> {
        paths::remove_tree(&pool.mount_root()).map_err(|e| StorageError::Driver(e.to_string()))
    }

    async fn pool_mount(&self, _pool: &PoolSpec) -> Result<bool, StorageError> {
        // Nothing to mount; the source directory is always visible.
        Ok(false)
    }

    async fn pool_unmount(&self, _pool: &PoolSpec) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn volume_create(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<(), StorageError> {
        fs::create_dir_all(volume.path(pool))
            .map_err(|e| StorageError::Driver(format!("Failed to create volume: {}", e)))
    }

    async fn volume_delete(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<(), StorageError> {
        paths::remove_tree(&volume.path(pool)).map_err(|e| StorageError::Driver(e.to_string()))
    }

    async fn volume_mount(&self, _pool: &PoolSpec, _volume: &VolumeSpec) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn volume_unmount(
        &self,
        _pool: &PoolSpec,
        _volume: &VolumeSpec,
    ) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn volume_rename(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        new_name: &str,
    ) -> Result<(), StorageError> {
        let old_path = volume.path(pool);
        let new_path = paths::volume_path(&pool.data_dir, &pool.name, volume.kind, new_name);
        if old_path.exists() || !new_path.exists() {
            fs::rename(&old_path, &new_path)
                .map_err(|e| StorageError::Driver(format!("Failed to rename volume: {}", e)))?;
        }

        // Snapshots live under a parent-named directory that moves with it.
        if let Some(snapshot_kind) = volume.kind.snapshot_kind() {
            let old_snapshots =
                paths::snapshot_dir(&pool.data_dir, &pool.name, snapshot_kind, &volume.name);
            let new_snapshots =
                paths::snapshot_dir(&pool.data_dir, &pool.name, snapshot_kind, new_name);
            if old_snapshots.exists() && !new_snapshots.exists() {
                fs::rename(&old_snapshots, &new_snapshots)
                    .map_err(|e| StorageError::Driver(format!("Failed to rename snapshots: {}", e)))?;
            }
        }
        Ok(())
    }

    async fn volume_snapshot_create(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let target = self.snapshot_path(pool, volume, snapshot);
        paths::copy_tree(&volume.path(pool), &target)
            .map_err(|e| StorageError::Driver(e.to_string()))
    }

    async fn volume_snapshot_delete(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        paths::remove_tree(&self.snapshot_path(pool, volume, snapshot))
            .map_err(|e| StorageError::Driver(e.to_string()))
    }

    async fn volume_restore(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let source = self.snapshot_path(pool, volume, snapshot);
        if !source.exists() {
            return Err(StorageError::not_found(format!(
                "Snapshot {}/{}",
                volume.name, snapshot
            )));
        }
        let target = volume.path(pool);
        paths::remove_tree(&target).map_err(|e| StorageError::Driver(e.to_string()))?;
        paths::copy_tree(&source, &target).map_err(|e| StorageError::Driver(e.to_string()))
    }

    async fn volume_size(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<u64, StorageError> {
        tree_size(&volume.path(pool))
            .map_err(|e| StorageError::Driver(format!("Failed to measure volume: {}", e)))
    }

    async fn volume_copy(
        &self,
        pool: &PoolSpec,
        source: &VolumeSpec,
        target: &VolumeSpec,
    ) -> Result<(), StorageError> {
        paths::copy_tree(&source.path(pool), &target.path(pool))
            .map_err(|e| StorageError::Driver(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(dir: &tempfile::TempDir) -> PoolSpec {
        let mut pool = PoolSpec::new("p1", HashMap::new(), dir.path());
        DirDriver.fill_defaults(&mut pool);
        pool
    }

    #[tokio::test]
    async fn pool_create_is_idempotent() {
        let dir = tempdir().unwrap();
        let pool = spec(&dir);
        DirDriver.validate_config(&pool).unwrap();

        DirDriver.pool_create(&pool).await.unwrap();
        DirDriver.pool_create(&pool).await.unwrap();
        assert!(pool.mount_root().join("containers").is_dir());
    }

    #[tokio::test]
    async fn volume_lifecycle_with_snapshot_restore() {
        let dir = tempdir().unwrap();
        let pool = spec(&dir);
        DirDriver.pool_create(&pool).await.unwrap();

        let volume = VolumeSpec::new(VolumeKind::Custom, "v1");
        DirDriver.volume_create(&pool, &volume).await.unwrap();
        fs::write(volume.path(&pool).join("data"), b"one").unwrap();

        DirDriver
            .volume_snapshot_create(&pool, &volume, "snap0")
            .await
            .unwrap();
        fs::write(volume.path(&pool).join("data"), b"two").unwrap();

        DirDriver.volume_restore(&pool, &volume, "snap0").await.unwrap();
        assert_eq!(fs::read(volume.path(&pool).join("data")).unwrap(), b"one");

        DirDriver.volume_delete(&pool, &volume).await.unwrap();
        assert!(!volume.path(&pool).exists());
        // Deleting a deleted volume stays green.
        DirDriver.volume_delete(&pool, &volume).await.unwrap();
    }
}
