//! ZFS backend. Volumes are datasets under `<zpool>/<kind-dir>/<name>`;
//! snapshots are native `@`-snapshots.

use super::{command_succeeds, run_command, validate_against_schema, PoolSpec, StorageDriver, VolumeSpec};
use crate::storage::{StorageError, VolumeKind};
use async_trait::async_trait;
use std::collections::HashMap;

const POOL_CONFIG_KEYS: &[&str] = &[
    "source",
    "volume.size",
    "zfs.pool_name",
    "zfs.clone_copy",
    "volume.zfs.use_refquota",
];
const VOLUME_CONFIG_KEYS: &[&str] = &["size", "zfs.use_refquota"];

pub struct ZfsDriver;

impl ZfsDriver {
    /// The zpool (or dataset) backing this pool.
    pub fn zpool_name(pool: &PoolSpec) -> String {
        pool.config
            .get("zfs.pool_name")
            .cloned()
            .unwrap_or_else(|| pool.name.clone())
    }

    pub fn dataset_name(pool: &PoolSpec, volume: &VolumeSpec) -> String {
        format!(
            "{}/{}/{}",
            Self::zpool_name(pool),
            volume.kind.dir_name(),
            volume.name
        )
    }

    async fn dataset_exists(&self, dataset: &str) -> bool {
        command_succeeds("zfs", &["list", dataset]).await
    }

    /// Points a dataset's mountpoint at a path. The upgrade patch uses this
    /// to move legacy datasets under the pool mount root.
    pub async fn set_mountpoint(&self, dataset: &str, mountpoint: &str) -> Result<(), StorageError> {
        run_command("zfs", &["set", &format!("mountpoint={}", mountpoint), dataset]).await?;
        Ok(())
    }

    pub async fn set_property(&self, dataset: &str, property: &str) -> Result<(), StorageError> {
        run_command("zfs", &["set", property, dataset]).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for ZfsDriver {
    fn name(&self) -> &'static str {
        "zfs"
    }

    fn pool_config_keys(&self) -> &'static [&'static str] {
        POOL_CONFIG_KEYS
    }

    fn fill_defaults(&self, spec: &mut PoolSpec) {
        if !spec.config.contains_key("zfs.pool_name") {
            let source = spec.source().unwrap_or("").to_string();
            let name = if source.is_empty() { spec.name.clone() } else { source.clone() };
            spec.config.insert("zfs.pool_name".to_string(), name);
        }
        if spec.source().map(str::is_empty).unwrap_or(true) {
            let zpool = Self::zpool_name(spec);
            spec.config.insert("source".to_string(), zpool);
        }
    }

    fn validate_config(&self, spec: &PoolSpec) -> Result<(), StorageError> {
        validate_against_schema(&spec.config, POOL_CONFIG_KEYS)?;
        if Self::zpool_name(spec).is_empty() {
            return Err(StorageError::Validation(
                "zfs pools require zfs.pool_name".into(),
            ));
        }
        Ok(())
    }

    fn validate_volume_config(&self, config: &HashMap<String, String>) -> Result<(), StorageError> {
        validate_against_schema(config, VOLUME_CONFIG_KEYS)
    }

    async fn pool_create(&self, pool: &PoolSpec) -> Result<(), StorageError> {
        let zpool = Self::zpool_name(pool);
        if !self.dataset_exists(&zpool).await {
            return Err(StorageError::Driver(format!(
                "ZFS pool {} does not exist",
                zpool
            )));
        }
        for kind in [
            VolumeKind::Container,
            VolumeKind::ContainerSnapshot,
            VolumeKind::Image,
            VolumeKind::Custom,
            VolumeKind::CustomSnapshot,
        ] {
            let dataset = format!("{}/{}", zpool, kind.dir_name());
            if !self.dataset_exists(&dataset).await {
                run_command("zfs", &["create", "-p", &dataset]).await?;
            }
        }
        Ok(())
    }

    async fn pool_delete(&self, pool: &PoolSpec) -> Result<(), StorageError> {
        let zpool = Self::zpool_name(pool);
        for kind in [
            VolumeKind::Container,
            VolumeKind::ContainerSnapshot,
            VolumeKind::Image,
            VolumeKind::Custom,
            VolumeKind::CustomSnapshot,
        ] {
            let dataset = format!("{}/{}", zpool, kind.dir_name());
            if self.dataset_exists(&dataset).await {
                run_command("zfs", &["destroy", "-r", &dataset]).await?;
            }
        }
        Ok(())
    }

    async fn pool_mount(&self, pool: &PoolSpec) -> Result<bool, StorageError> {
        let zpool = Self::zpool_name(pool);
        if command_succeeds("zfs", &["mount", &zpool]).await {
            return Ok(true);
        }
        // Already mounted is fine.
        Ok(false)
    }

    async fn pool_unmount(&self, pool: &PoolSpec) -> Result<bool, StorageError> {
        let zpool = Self::zpool_name(pool);
        Ok(command_succeeds("zfs", &["unmount", &zpool]).await)
    }

    async fn volume_create(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<(), StorageError> {
        let dataset = Self::dataset_name(pool, volume);
        if self.dataset_exists(&dataset).await {
            return Ok(());
        }
        let mountpoint = volume.path(pool);
        run_command(
            "zfs",
            &[
                "create",
                "-p",
                "-o",
                &format!("mountpoint={}", mountpoint.to_string_lossy()),
                &dataset,
            ],
        )
        .await?;
        Ok(())
    }

    async fn volume_delete(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<(), StorageError> {
        let dataset = Self::dataset_name(pool, volume);
        if !self.dataset_exists(&dataset).await {
            return Ok(());
        }
        run_command("zfs", &["destroy", "-r", &dataset]).await?;
        Ok(())
    }

    async fn volume_mount(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<bool, StorageError> {
        let dataset = Self::dataset_name(pool, volume);
        Ok(command_succeeds("zfs", &["mount", &dataset]).await)
    }

    async fn volume_unmount(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
    ) -> Result<bool, StorageError> {
        let dataset = Self::dataset_name(pool, volume);
        Ok(command_succeeds("zfs", &["unmount", &dataset]).await)
    }

    async fn volume_rename(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        new_name: &str,
    ) -> Result<(), StorageError> {
        let old_dataset = Self::dataset_name(pool, volume);
        let new_volume = VolumeSpec::new(volume.kind, new_name);
        let new_dataset = Self::dataset_name(pool, &new_volume);
        if !self.dataset_exists(&old_dataset).await && self.dataset_exists(&new_dataset).await {
            return Ok(());
        }
        run_command("zfs", &["rename", &old_dataset, &new_dataset]).await?;
        self.set_mountpoint(
            &new_dataset,
            &new_volume.path(pool).to_string_lossy(),
        )
        .await
    }

    async fn volume_snapshot_create(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let snap = format!("{}@{}", Self::dataset_name(pool, volume), snapshot);
        if command_succeeds("zfs", &["list", "-t", "snapshot", &snap]).await {
            return Ok(());
        }
        run_command("zfs", &["snapshot", &snap]).await?;
        Ok(())
    }

    async fn volume_snapshot_delete(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let snap = format!("{}@{}", Self::dataset_name(pool, volume), snapshot);
        if !command_succeeds("zfs", &["list", "-t", "snapshot", &snap]).await {
            return Ok(());
        }
        run_command("zfs", &["destroy", &snap]).await?;
        Ok(())
    }

    async fn volume_restore(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let snap = format!("{}@{}", Self::dataset_name(pool, volume), snapshot);
        run_command("zfs", &["rollback", "-r", &snap]).await?;
        Ok(())
    }

    async fn volume_size(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<u64, StorageError> {
        let dataset = Self::dataset_name(pool, volume);
        let output = run_command("zfs", &["get", "-H", "-p", "-o", "value", "used", &dataset]).await?;
        output
            .trim()
            .parse::<u64>()
            .map_err(|e| StorageError::Driver(format!("Unparsable zfs used value: {}", e)))
    }

    async fn volume_copy(
        &self,
        pool: &PoolSpec,
        source: &VolumeSpec,
        target: &VolumeSpec,
    ) -> Result<(), StorageError> {
        let source_dataset = Self::dataset_name(pool, source);
        let target_dataset = Self::dataset_name(pool, target);
        if self.dataset_exists(&target_dataset).await {
            return Ok(());
        }
        // Clone through a transfer snapshot, then detach it from its origin.
        let transfer = format!("{}@copy-{}", source_dataset, target.name);
        if !command_succeeds("zfs", &["list", "-t", "snapshot", &transfer]).await {
            run_command("zfs", &["snapshot", &transfer]).await?;
        }
        run_command(
            "zfs",
            &[
                "clone",
                "-o",
                &format!("mountpoint={}", target.path(pool).to_string_lossy()),
                &transfer,
                &target_dataset,
            ],
        )
        .await?;
        run_command("zfs", &["promote", &target_dataset]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_derive_pool_name_from_source() {
        let mut config = HashMap::new();
        config.insert("source".to_string(), "tank".to_string());
        let mut spec = PoolSpec::new("vessel", config, "/var/lib/vessel");
        ZfsDriver.fill_defaults(&mut spec);

        assert_eq!(ZfsDriver::zpool_name(&spec), "tank");
        ZfsDriver.validate_config(&spec).unwrap();
    }

    #[test]
    fn dataset_names_follow_kind_layout() {
        let mut config = HashMap::new();
        config.insert("zfs.pool_name".to_string(), "tank".to_string());
        let spec = PoolSpec::new("vessel", config, "/var/lib/vessel");
        let volume = VolumeSpec::new(VolumeKind::Container, "web1");
        assert_eq!(ZfsDriver::dataset_name(&spec, &volume), "tank/containers/web1");
    }
}
