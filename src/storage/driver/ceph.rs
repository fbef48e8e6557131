//! Ceph RBD backend. Volumes are RBD images in an OSD pool; snapshots are
//! RBD snapshots.

use super::{command_succeeds, run_command, validate_against_schema, PoolSpec, StorageDriver, VolumeSpec};
use crate::storage::{paths, StorageError, VolumeKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;

const POOL_CONFIG_KEYS: &[&str] = &[
    "source",
    "volume.size",
    "ceph.cluster_name",
    "ceph.osd.pool_name",
    "ceph.user.name",
];
const VOLUME_CONFIG_KEYS: &[&str] = &["size"];

const DEFAULT_VOLUME_SIZE: &str = "10GiB";

pub struct CephDriver;

impl CephDriver {
    pub fn osd_pool(pool: &PoolSpec) -> String {
        pool.config
            .get("ceph.osd.pool_name")
            .cloned()
            .unwrap_or_else(|| pool.name.clone())
    }

    fn cluster(pool: &PoolSpec) -> String {
        pool.config
            .get("ceph.cluster_name")
            .cloned()
            .unwrap_or_else(|| "ceph".to_string())
    }

    fn image_name(volume: &VolumeSpec) -> String {
        format!("{}_{}", volume.kind.dir_name(), volume.name.replace('/', "-"))
    }

    async fn image_exists(pool: &PoolSpec, image: &str) -> bool {
        command_succeeds(
            "rbd",
            &[
                "--cluster",
                &Self::cluster(pool),
                "--pool",
                &Self::osd_pool(pool),
                "info",
                image,
            ],
        )
        .await
    }

    async fn rbd(pool: &PoolSpec, args: &[&str]) -> Result<String, StorageError> {
        let cluster = Self::cluster(pool);
        let osd_pool = Self::osd_pool(pool);
        let mut full = vec!["--cluster", cluster.as_str(), "--pool", osd_pool.as_str()];
        full.extend_from_slice(args);
        run_command("rbd", &full).await
    }
}

#[async_trait]
impl StorageDriver for CephDriver {
    fn name(&self) -> &'static str {
        "ceph"
    }

    fn pool_config_keys(&self) -> &'static [&'static str] {
        POOL_CONFIG_KEYS
    }

    fn fill_defaults(&self, spec: &mut PoolSpec) {
        if !spec.config.contains_key("ceph.osd.pool_name") {
            spec.config
                .insert("ceph.osd.pool_name".to_string(), spec.name.clone());
        }
        if !spec.config.contains_key("ceph.cluster_name") {
            spec.config
                .insert("ceph.cluster_name".to_string(), "ceph".to_string());
        }
        if spec.source().map(str::is_empty).unwrap_or(true) {
            let osd_pool = Self::osd_pool(spec);
            spec.config.insert("source".to_string(), osd_pool);
        }
        spec.config
            .entry("volume.size".to_string())
            .or_insert_with(|| DEFAULT_VOLUME_SIZE.to_string());
    }

    fn validate_config(&self, spec: &PoolSpec) -> Result<(), StorageError> {
        validate_against_schema(&spec.config, POOL_CONFIG_KEYS)?;
        if Self::osd_pool(spec).is_empty() {
            return Err(StorageError::Validation(
                "ceph pools require ceph.osd.pool_name".into(),
            ));
        }
        Ok(())
    }

    fn validate_volume_config(&self, config: &HashMap<String, String>) -> Result<(), StorageError> {
        validate_against_schema(config, VOLUME_CONFIG_KEYS)
    }

    async fn pool_create(&self, pool: &PoolSpec) -> Result<(), StorageError> {
        let osd_pool = Self::osd_pool(pool);
        if !command_succeeds(
            "ceph",
            &["--cluster", &Self::cluster(pool), "osd", "pool", "get", &osd_pool, "size"],
        )
        .await
        {
            return Err(StorageError::Driver(format!(
                "OSD pool {} does not exist",
                osd_pool
            )));
        }
        for kind in [
            VolumeKind::Container,
            VolumeKind::ContainerSnapshot,
            VolumeKind::Image,
            VolumeKind::Custom,
            VolumeKind::CustomSnapshot,
        ] {
            fs::create_dir_all(pool.mount_root().join(kind.dir_name()))
                .map_err(|e| StorageError::Driver(e.to_string()))?;
        }
        Ok(())
    }

    async fn pool_delete(&self, pool: &PoolSpec) -> Result<(), StorageError> {
        // The OSD pool belongs to the cluster operator.
        paths::remove_tree(&pool.mount_root()).map_err(|e| StorageError::Driver(e.to_string()))
    }

    async fn pool_mount(&self, _pool: &PoolSpec) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn pool_unmount(&self, _pool: &PoolSpec) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn volume_create(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<(), StorageError> {
        let image = Self::image_name(volume);
        if Self::image_exists(pool, &image).await {
            return Ok(());
        }
        let size = volume
            .config
            .get("size")
            .or_else(|| pool.config.get("volume.size"))
            .cloned()
            .unwrap_or_else(|| DEFAULT_VOLUME_SIZE.to_string());
        let bytes = super::parse_byte_size(&size)?;
        Self::rbd(pool, &["create", "--size", &format!("{}B", bytes), &image]).await?;
        fs::create_dir_all(volume.path(pool)).map_err(|e| StorageError::Driver(e.to_string()))?;
        Ok(())
    }

    async fn volume_delete(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<(), StorageError> {
        let image = Self::image_name(volume);
        if Self::image_exists(pool, &image).await {
            Self::rbd(pool, &["rm", &image]).await?;
        }
        paths::remove_tree(&volume.path(pool)).map_err(|e| StorageError::Driver(e.to_string()))
    }

    async fn volume_mount(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<bool, StorageError> {
        let image = Self::image_name(volume);
        let device = Self::rbd(pool, &["map", &image]).await?;
        let mount_point = volume.path(pool);
        fs::create_dir_all(&mount_point).map_err(|e| StorageError::Driver(e.to_string()))?;
        if command_succeeds("mountpoint", &["-q", &mount_point.to_string_lossy()]).await {
            return Ok(false);
        }
        run_command("mount", &[device.trim(), &mount_point.to_string_lossy()]).await?;
        Ok(true)
    }

    async fn volume_unmount(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
    ) -> Result<bool, StorageError> {
        let mount_point = volume.path(pool);
        if !command_succeeds("mountpoint", &["-q", &mount_point.to_string_lossy()]).await {
            return Ok(false);
        }
        run_command("umount", &[&mount_point.to_string_lossy()]).await?;
        let image = Self::image_name(volume);
        Self::rbd(pool, &["unmap", &image]).await?;
        Ok(true)
    }

    async fn volume_rename(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        new_name: &str,
    ) -> Result<(), StorageError> {
        let old_image = Self::image_name(volume);
        let new_volume = VolumeSpec::new(volume.kind, new_name);
        let new_image = Self::image_name(&new_volume);
        if !Self::image_exists(pool, &old_image).await && Self::image_exists(pool, &new_image).await
        {
            return Ok(());
        }
        Self::rbd(pool, &["mv", &old_image, &new_image]).await?;
        Ok(())
    }

    async fn volume_snapshot_create(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let image = Self::image_name(volume);
        Self::rbd(pool, &["snap", "create", &format!("{}@{}", image, snapshot)]).await?;
        Ok(())
    }

    async fn volume_snapshot_delete(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let image = Self::image_name(volume);
        Self::rbd(pool, &["snap", "rm", &format!("{}@{}", image, snapshot)]).await?;
        Ok(())
    }

    async fn volume_restore(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let image = Self::image_name(volume);
        Self::rbd(pool, &["snap", "rollback", &format!("{}@{}", image, snapshot)]).await?;
        Ok(())
    }

    async fn volume_size(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<u64, StorageError> {
        let image = Self::image_name(volume);
        let output = Self::rbd(pool, &["info", "--format", "json", &image]).await?;
        let info: serde_json::Value = serde_json::from_str(&output)
            .map_err(|e| StorageError::Driver(format!("Unparsable rbd info: {}", e)))?;
        info["size"]
            .as_u64()
            .ok_or_else(|| StorageError::Driver("rbd info missing size".into()))
    }

    async fn volume_copy(
        &self,
        pool: &PoolSpec,
        source: &VolumeSpec,
        target: &VolumeSpec,
    ) -> Result<(), StorageError> {
        let source_image = Self::image_name(source);
        let target_image = Self::image_name(target);
        if Self::image_exists(pool, &target_image).await {
            return Ok(());
        }
        Self::rbd(pool, &["cp", &source_image, &target_image]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_the_named_osd_pool() {
        let mut spec = PoolSpec::new("rbd0", HashMap::new(), "/var/lib/vessel");
        CephDriver.fill_defaults(&mut spec);
        assert_eq!(CephDriver::osd_pool(&spec), "rbd0");
        CephDriver.validate_config(&spec).unwrap();
    }
}
