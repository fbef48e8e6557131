//! LVM backend. Volumes are logical volumes named
//! `<kind-dir>_<munged-name>` inside the pool's volume group, formatted and
//! mounted under the pool mount root.

use super::{command_succeeds, run_command, validate_against_schema, PoolSpec, StorageDriver, VolumeSpec};
use crate::storage::{paths, StorageError, VolumeKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;

const POOL_CONFIG_KEYS: &[&str] = &[
    "source",
    "volume.size",
    "lvm.vg_name",
    "lvm.thinpool_name",
    "lvm.use_thinpool",
    "volume.block.filesystem",
];
const VOLUME_CONFIG_KEYS: &[&str] = &["size", "block.filesystem"];

const DEFAULT_VOLUME_SIZE: &str = "10GiB";

pub struct LvmDriver;

impl LvmDriver {
    pub fn vg_name(pool: &PoolSpec) -> String {
        pool.config
            .get("lvm.vg_name")
            .cloned()
            .unwrap_or_else(|| pool.name.clone())
    }

    /// Hyphens collide with LVM's own separators, so they are doubled and the
    /// snapshot delimiter becomes a single hyphen.
    pub fn munge_name(name: &str) -> String {
        name.replace('-', "--").replace('/', "-")
    }

    /// Logical volume name for a volume: `<kind-dir>_<munged-name>`.
    pub fn lv_name(kind: VolumeKind, name: &str) -> String {
        format!("{}_{}", kind.dir_name(), Self::munge_name(name))
    }

    fn device_path(vg: &str, lv: &str) -> String {
        format!("/dev/{}/{}", vg, lv)
    }

    pub async fn lv_exists(vg: &str, lv: &str) -> bool {
        command_succeeds("lvs", &[&format!("{}/{}", vg, lv)]).await
    }

    /// `lvrename`, succeeding when a previous run already did it.
    pub async fn lv_rename(vg: &str, old_lv: &str, new_lv: &str) -> Result<(), StorageError> {
        if !Self::lv_exists(vg, old_lv).await && Self::lv_exists(vg, new_lv).await {
            return Ok(());
        }
        run_command("lvrename", &[vg, old_lv, new_lv]).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for LvmDriver {
    fn name(&self) -> &'static str {
        "lvm"
    }

    fn pool_config_keys(&self) -> &'static [&'static str] {
        POOL_CONFIG_KEYS
    }

    fn fill_defaults(&self, spec: &mut PoolSpec) {
        if !spec.config.contains_key("lvm.vg_name") {
            let source = spec.source().unwrap_or("").to_string();
            let vg = if source.is_empty() { spec.name.clone() } else { source.clone() };
            spec.config.insert("lvm.vg_name".to_string(), vg);
        }
        if spec.source().map(str::is_empty).unwrap_or(true) {
            let vg = Self::vg_name(spec);
            spec.config.insert("source".to_string(), vg);
        }
        spec.config
            .entry("volume.size".to_string())
            .or_insert_with(|| DEFAULT_VOLUME_SIZE.to_string());
        spec.config
            .entry("volume.block.filesystem".to_string())
            .or_insert_with(|| "ext4".to_string());
    }

    fn validate_config(&self, spec: &PoolSpec) -> Result<(), StorageError> {
        validate_against_schema(&spec.config, POOL_CONFIG_KEYS)?;
        if Self::vg_name(spec).is_empty() {
            return Err(StorageError::Validation(
                "lvm pools require lvm.vg_name".into(),
            ));
        }
        Ok(())
    }

    fn validate_volume_config(&self, config: &HashMap<String, String>) -> Result<(), StorageError> {
        validate_against_schema(config, VOLUME_CONFIG_KEYS)
    }

    async fn pool_create(&self, pool: &PoolSpec) -> Result<(), StorageError> {
        let vg = Self::vg_name(pool);
        if !command_succeeds("vgs", &[&vg]).await {
            return Err(StorageError::Driver(format!(
                "Volume group {} does not exist",
                vg
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
        // The volume group belongs to the operator; only the mount layout is
        // ours to remove.
        paths::remove_tree(&pool.mount_root()).map_err(|e| StorageError::Driver(e.to_string()))
    }

    async fn pool_mount(&self, _pool: &PoolSpec) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn pool_unmount(&self, _pool: &PoolSpec) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn volume_create(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<(), StorageError> {
        let vg = Self::vg_name(pool);
        let lv = Self::lv_name(volume.kind, &volume.name);
        if Self::lv_exists(&vg, &lv).await {
            return Ok(());
        }

        let size = volume
            .config
            .get("size")
            .or_else(|| pool.config.get("volume.size"))
            .cloned()
            .unwrap_or_else(|| DEFAULT_VOLUME_SIZE.to_string());
        super::parse_byte_size(&size)?;

        if let Some(thinpool) = pool.config.get("lvm.thinpool_name") {
            run_command(
                "lvcreate",
                &["--thin", "-V", &size, "-n", &lv, &format!("{}/{}", vg, thinpool)],
            )
            .await?;
        } else {
            run_command("lvcreate", &["-L", &size, "-n", &lv, &vg]).await?;
        }

        let filesystem = volume
            .config
            .get("block.filesystem")
            .or_else(|| pool.config.get("volume.block.filesystem"))
            .map(String::as_str)
            .unwrap_or("ext4");
        run_command(&format!("mkfs.{}", filesystem), &[&Self::device_path(&vg, &lv)]).await?;

        fs::create_dir_all(volume.path(pool)).map_err(|e| StorageError::Driver(e.to_string()))?;
        Ok(())
    }

    async fn volume_delete(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<(), StorageError> {
        self.volume_unmount(pool, volume).await?;
        let vg = Self::vg_name(pool);
        let lv = Self::lv_name(volume.kind, &volume.name);
        if Self::lv_exists(&vg, &lv).await {
            run_command("lvremove", &["-f", &format!("{}/{}", vg, lv)]).await?;
        }
        paths::remove_tree(&volume.path(pool)).map_err(|e| StorageError::Driver(e.to_string()))
    }

    async fn volume_mount(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<bool, StorageError> {
        let vg = Self::vg_name(pool);
        let lv = Self::lv_name(volume.kind, &volume.name);
        let mount_point = volume.path(pool);
        fs::create_dir_all(&mount_point).map_err(|e| StorageError::Driver(e.to_string()))?;
        if command_succeeds("mountpoint", &["-q", &mount_point.to_string_lossy()]).await {
            return Ok(false);
        }
        run_command(
            "mount",
            &[&Self::device_path(&vg, &lv), &mount_point.to_string_lossy()],
        )
        .await?;
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
        Ok(true)
    }

    async fn volume_rename(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        new_name: &str,
    ) -> Result<(), StorageError> {
        let vg = Self::vg_name(pool);
        let old_lv = Self::lv_name(volume.kind, &volume.name);
        let new_lv = Self::lv_name(volume.kind, new_name);
        Self::lv_rename(&vg, &old_lv, &new_lv).await?;

        let old_path = volume.path(pool);
        let new_path = paths::volume_path(&pool.data_dir, &pool.name, volume.kind, new_name);
        if old_path.exists() {
            fs::rename(&old_path, &new_path).map_err(|e| StorageError::Driver(e.to_string()))?;
        }
        Ok(())
    }

    async fn volume_snapshot_create(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let vg = Self::vg_name(pool);
        let source_lv = Self::lv_name(volume.kind, &volume.name);
        let snapshot_kind = volume.kind.snapshot_kind().unwrap_or(volume.kind);
        let flat = format!("{}/{}", volume.name, snapshot);
        let snap_lv = Self::lv_name(snapshot_kind, &flat);
        if Self::lv_exists(&vg, &snap_lv).await {
            return Ok(());
        }
        run_command(
            "lvcreate",
            &["-s", "-n", &snap_lv, &format!("{}/{}", vg, source_lv)],
        )
        .await?;
        Ok(())
    }

    async fn volume_snapshot_delete(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let vg = Self::vg_name(pool);
        let snapshot_kind = volume.kind.snapshot_kind().unwrap_or(volume.kind);
        let flat = format!("{}/{}", volume.name, snapshot);
        let snap_lv = Self::lv_name(snapshot_kind, &flat);
        if Self::lv_exists(&vg, &snap_lv).await {
            run_command("lvremove", &["-f", &format!("{}/{}", vg, snap_lv)]).await?;
        }
        Ok(())
    }

    async fn volume_restore(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let vg = Self::vg_name(pool);
        let snapshot_kind = volume.kind.snapshot_kind().unwrap_or(volume.kind);
        let flat = format!("{}/{}", volume.name, snapshot);
        let snap_lv = Self::lv_name(snapshot_kind, &flat);
        if !Self::lv_exists(&vg, &snap_lv).await {
            return Err(StorageError::not_found(format!("Snapshot {}", flat)));
        }
        self.volume_unmount(pool, volume).await?;
        run_command("lvconvert", &["--merge", &format!("{}/{}", vg, snap_lv)]).await?;
        Ok(())
    }

    async fn volume_size(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<u64, StorageError> {
        let vg = Self::vg_name(pool);
        let lv = Self::lv_name(volume.kind, &volume.name);
        let output = run_command(
            "lvs",
            &["--noheadings", "--units", "b", "--nosuffix", "-o", "lv_size", &format!("{}/{}", vg, lv)],
        )
        .await?;
        output
            .trim()
            .parse::<u64>()
            .map_err(|e| StorageError::Driver(format!("Unparsable lv_size value: {}", e)))
    }

    async fn volume_copy(
        &self,
        pool: &PoolSpec,
        source: &VolumeSpec,
        target: &VolumeSpec,
    ) -> Result<(), StorageError> {
        self.volume_create(pool, target).await?;
        self.volume_mount(pool, source).await?;
        self.volume_mount(pool, target).await?;
        paths::copy_tree(&source.path(pool), &target.path(pool))
            .map_err(|e| StorageError::Driver(e.to_string()))?;
        self.volume_unmount(pool, target).await?;
        self.volume_unmount(pool, source).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lv_names_are_munged_per_convention() {
        assert_eq!(
            LvmDriver::lv_name(VolumeKind::Container, "c1"),
            "containers_c1"
        );
        assert_eq!(
            LvmDriver::lv_name(VolumeKind::Container, "my-app"),
            "containers_my--app"
        );
        assert_eq!(
            LvmDriver::lv_name(VolumeKind::ContainerSnapshot, "web1/snap0"),
            "containers-snapshots_web1-snap0"
        );
    }

    #[test]
    fn defaults_fill_vg_and_volume_size() {
        let mut config = HashMap::new();
        config.insert("source".to_string(), "vg0".to_string());
        let mut spec = PoolSpec::new("vg0", config, "/var/lib/vessel");
        LvmDriver.fill_defaults(&mut spec);

        assert_eq!(LvmDriver::vg_name(&spec), "vg0");
        assert_eq!(
            spec.config.get("volume.size").map(String::as_str),
            Some(DEFAULT_VOLUME_SIZE)
        );
        LvmDriver.validate_config(&spec).unwrap();
    }
}
