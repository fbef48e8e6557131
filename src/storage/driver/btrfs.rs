//! Btrfs backend. Volumes are subvolumes; snapshots are subvolume snapshots
//! taken read-only.

use super::{command_succeeds, run_command, validate_against_schema, PoolSpec, StorageDriver, VolumeSpec};
use crate::storage::{paths, StorageError, VolumeKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const POOL_CONFIG_KEYS: &[&str] = &["source", "volume.size", "btrfs.mount_options"];
const VOLUME_CONFIG_KEYS: &[&str] = &["size"];

pub struct BtrfsDriver;

impl BtrfsDriver {
    async fn is_subvolume(&self, path: &Path) -> bool {
        path.exists()
            && command_succeeds("btrfs", &["subvolume", "show", &path.to_string_lossy()]).await
    }

    async fn subvolume_create(&self, path: &Path) -> Result<(), StorageError> {
        if self.is_subvolume(path).await {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StorageError::Driver(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
        run_command("btrfs", &["subvolume", "create", &path.to_string_lossy()]).await?;
        Ok(())
    }

    /// Deletes a subvolume, falling back to a plain tree removal for paths
    /// that turn out not to be subvolumes. Missing paths succeed.
    pub async fn subvolume_delete(&self, path: &Path) -> Result<(), StorageError> {
        if !path.exists() {
            return Ok(());
        }
        if self.is_subvolume(path).await {
            run_command("btrfs", &["subvolume", "delete", &path.to_string_lossy()]).await?;
        } else {
            paths::remove_tree(path).map_err(|e| StorageError::Driver(e.to_string()))?;
        }
        Ok(())
    }

    /// `btrfs subvolume snapshot`, optionally read-only.
    pub async fn subvolume_snapshot(
        &self,
        source: &Path,
        target: &Path,
        readonly: bool,
    ) -> Result<(), StorageError> {
        if target.exists() {
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StorageError::Driver(e.to_string()))?;
        }
        let source = source.to_string_lossy();
        let target = target.to_string_lossy();
        if readonly {
            run_command("btrfs", &["subvolume", "snapshot", "-r", &source, &target]).await?;
        } else {
            run_command("btrfs", &["subvolume", "snapshot", &source, &target]).await?;
        }
        Ok(())
    }

    fn snapshot_path(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> std::path::PathBuf {
        let kind = volume.kind.snapshot_kind().unwrap_or(volume.kind);
        pool.mount_root()
            .join(kind.dir_name())
            .join(&volume.name)
            .join(snapshot)
    }
}

#[async_trait]
impl StorageDriver for BtrfsDriver {
    fn name(&self) -> &'static str {
        "btrfs"
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
            Some(source) if !source.is_empty() => Ok(()),
            _ => Err(StorageError::Validation(
                "btrfs pools require a source".into(),
            )),
        }
    }

    fn validate_volume_config(&self, config: &HashMap<String, String>) -> Result<(), StorageError> {
        validate_against_schema(config, VOLUME_CONFIG_KEYS)
    }

    async fn pool_create(&self, pool: &PoolSpec) -> Result<(), StorageError> {
        let root = pool.mount_root();
        self.subvolume_create(&root).await?;
        for kind in [
            VolumeKind::Container,
            VolumeKind::ContainerSnapshot,
            VolumeKind::Image,
            VolumeKind::Custom,
            VolumeKind::CustomSnapshot,
        ] {
            fs::create_dir_all(root.join(kind.dir_name()))
                .map_err(|e| StorageError::Driver(e.to_string()))?;
        }
        Ok(())
    }

    async fn pool_delete(&self, pool: &PoolSpec) -> Result<(), StorageError> {
        let root = pool.mount_root();
        if !root.exists() {
            return Ok(());
        }
        for kind_dir in fs::read_dir(&root).map_err(|e| StorageError::Driver(e.to_string()))? {
            let kind_dir = kind_dir.map_err(|e| StorageError::Driver(e.to_string()))?.path();
            if !kind_dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&kind_dir).map_err(|e| StorageError::Driver(e.to_string()))? {
                let entry = entry.map_err(|e| StorageError::Driver(e.to_string()))?.path();
                self.subvolume_delete(&entry).await?;
            }
        }
        self.subvolume_delete(&root).await
    }

    async fn pool_mount(&self, _pool: &PoolSpec) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn pool_unmount(&self, _pool: &PoolSpec) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn volume_create(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<(), StorageError> {
        self.subvolume_create(&volume.path(pool)).await
    }

    async fn volume_delete(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<(), StorageError> {
        self.subvolume_delete(&volume.path(pool)).await
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
                .map_err(|e| StorageError::Driver(format!("Failed to rename subvolume: {}", e)))?;
        }

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
        self.subvolume_snapshot(&volume.path(pool), &target, true).await
    }

    async fn volume_snapshot_delete(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        self.subvolume_delete(&self.snapshot_path(pool, volume, snapshot))
            .await
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
        self.subvolume_delete(&target).await?;
        // Restore is a writable snapshot of the read-only snapshot.
        self.subvolume_snapshot(&source, &target, false).await
    }

    async fn volume_size(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<u64, StorageError> {
        super::tree_size(&volume.path(pool))
            .map_err(|e| StorageError::Driver(format!("Failed to measure volume: {}", e)))
    }

    async fn volume_copy(
        &self,
        pool: &PoolSpec,
        source: &VolumeSpec,
        target: &VolumeSpec,
    ) -> Result<(), StorageError> {
        self.subvolume_snapshot(&source.path(pool), &target.path(pool), false)
            .await
    }
}
