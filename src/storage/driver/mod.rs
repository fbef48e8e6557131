//! Storage driver registry.
//!
//! Every backend is a self-contained value implementing [`StorageDriver`].
//! The registry maps a driver tag to its constructor; nothing else in the
//! daemon knows backend specifics.
//!
//! Drivers are idempotent on already-satisfied state: re-issuing a create for
//! an existing, matching object succeeds. The upgrade patches and the
//! crash-recovery paths depend on that.

pub mod btrfs;
pub mod ceph;
pub mod dir;
pub mod lvm;
pub mod zfs;

use crate::storage::{paths, StorageError, VolumeKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

/// Driver tags in registration order.
pub const DRIVER_NAMES: &[&str] = &["dir", "btrfs", "zfs", "lvm", "ceph"];

/// Everything a driver needs to know about a pool.
#[derive(Debug, Clone)]
pub struct PoolSpec {
    pub name: String,
    pub config: HashMap<String, String>,
    pub data_dir: PathBuf,
}

impl PoolSpec {
    pub fn new(name: impl Into<String>, config: HashMap<String, String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            config,
            data_dir: data_dir.into(),
        }
    }

    /// The pool's mount root under the daemon data directory.
    pub fn mount_root(&self) -> PathBuf {
        paths::pool_mount_root(&self.data_dir, &self.name)
    }

    pub fn source(&self) -> Option<&str> {
        self.config.get("source").map(String::as_str)
    }
}

/// Everything a driver needs to know about a volume.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    pub kind: VolumeKind,
    pub name: String,
    pub config: HashMap<String, String>,
}

impl VolumeSpec {
    pub fn new(kind: VolumeKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            config: HashMap::new(),
        }
    }

    pub fn with_config(mut self, config: HashMap<String, String>) -> Self {
        self.config = config;
        self
    }

    /// The volume's path under the pool mount root.
    pub fn path(&self, pool: &PoolSpec) -> PathBuf {
        paths::volume_path(&pool.data_dir, &pool.name, self.kind, &self.name)
    }
}

/// Capability set every backend satisfies.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pool config keys this driver understands.
    fn pool_config_keys(&self) -> &'static [&'static str];

    /// Fills driver defaults into the pool config. Only absent keys are
    /// written.
    fn fill_defaults(&self, spec: &mut PoolSpec);

    /// Validates a pool config against the driver schema.
    fn validate_config(&self, spec: &PoolSpec) -> Result<(), StorageError>;

    /// Validates a volume config against the driver schema.
    fn validate_volume_config(&self, config: &HashMap<String, String>) -> Result<(), StorageError>;

    async fn pool_create(&self, pool: &PoolSpec) -> Result<(), StorageError>;
    async fn pool_delete(&self, pool: &PoolSpec) -> Result<(), StorageError>;

    /// Mounts the pool. Returns true when this call performed the mount,
    /// false when it was already mounted (or the backend has nothing to do).
    async fn pool_mount(&self, pool: &PoolSpec) -> Result<bool, StorageError>;
    async fn pool_unmount(&self, pool: &PoolSpec) -> Result<bool, StorageError>;

    async fn volume_create(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<(), StorageError>;
    async fn volume_delete(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<(), StorageError>;
    async fn volume_mount(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<bool, StorageError>;
    async fn volume_unmount(&self, pool: &PoolSpec, volume: &VolumeSpec)
        -> Result<bool, StorageError>;
    async fn volume_rename(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        new_name: &str,
    ) -> Result<(), StorageError>;

    async fn volume_snapshot_create(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> Result<(), StorageError>;
    async fn volume_snapshot_delete(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> Result<(), StorageError>;
    async fn volume_restore(
        &self,
        pool: &PoolSpec,
        volume: &VolumeSpec,
        snapshot: &str,
    ) -> Result<(), StorageError>;

    /// Bytes used by the volume.
    async fn volume_size(&self, pool: &PoolSpec, volume: &VolumeSpec) -> Result<u64, StorageError>;

    /// Copies `source` into `target` inside the same pool.
    async fn volume_copy(
        &self,
        pool: &PoolSpec,
        source: &VolumeSpec,
        target: &VolumeSpec,
    ) -> Result<(), StorageError>;
}

/// Instantiates the driver for a tag.
pub fn load_driver(tag: &str) -> Result<Arc<dyn StorageDriver>, StorageError> {
    match tag {
        "dir" => Ok(Arc::new(dir::DirDriver)),
        "btrfs" => Ok(Arc::new(btrfs::BtrfsDriver)),
        "zfs" => Ok(Arc::new(zfs::ZfsDriver)),
        "lvm" => Ok(Arc::new(lvm::LvmDriver)),
        "ceph" => Ok(Arc::new(ceph::CephDriver)),
        other => Err(StorageError::Validation(format!(
            "Unknown storage driver: {}",
            other
        ))),
    }
}

/// Runs an external tool, mapping any failure to a driver error carrying the
/// tool's stderr.
pub(crate) async fn run_command(program: &str, args: &[&str]) -> Result<String, StorageError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| StorageError::Driver(format!("Failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        return Err(StorageError::Driver(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Checks a tool exits zero without caring about its output.
pub(crate) async fn command_succeeds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .output()
        .await
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Parses sizes like "10GiB", "512MiB", "1073741824".
pub fn parse_byte_size(value: &str) -> Result<u64, StorageError> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);

    let base: u64 = digits
        .parse()
        .map_err(|_| StorageError::Validation(format!("Invalid size: {:?}", value)))?;

    let multiplier: u64 = match unit.trim() {
        "" | "B" => 1,
        "kB" | "KB" => 1000,
        "KiB" => 1 << 10,
        "MB" => 1000 * 1000,
        "MiB" => 1 << 20,
        "GB" => 1000 * 1000 * 1000,
        "GiB" => 1 << 30,
        "TB" => 1000u64.pow(4),
        "TiB" => 1 << 40,
        other => {
            return Err(StorageError::Validation(format!(
                "Invalid size suffix: {:?}",
                other
            )))
        }
    };

    Ok(base * multiplier)
}

/// Rejects config keys outside the driver's schema and checks well-known
/// value shapes. Shared by every driver's validate implementations.
pub(crate) fn validate_against_schema(
    config: &HashMap<String, String>,
    allowed: &[&str],
) -> Result<(), StorageError> {
    for (key, value) in config {
        if !allowed.contains(&key.as_str()) {
            return Err(StorageError::Validation(format!(
                "Invalid config key: {}",
                key
            )));
        }
        if key == "volume.size" || key == "size" {
            if !value.is_empty() {
                parse_byte_size(value)?;
            }
        }
    }
    Ok(())
}

/// Total size in bytes of a file or directory tree.
pub(crate) fn tree_size(path: &Path) -> std::io::Result<u64> {
    let meta = std::fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        total += tree_size(&entry?.path())?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_every_tag() {
        for tag in DRIVER_NAMES {
            let driver = load_driver(tag).unwrap();
            assert_eq!(&driver.name(), tag);
        }
        assert!(load_driver("tmpfs").is_err());
    }

    #[test]
    fn byte_sizes_parse() {
        assert_eq!(parse_byte_size("10GiB").unwrap(), 10 << 30);
        assert_eq!(parse_byte_size("512MiB").unwrap(), 512 << 20);
        assert_eq!(parse_byte_size("1073741824").unwrap(), 1 << 30);
        assert!(parse_byte_size("10 floppies").is_err());
        assert!(parse_byte_size("").is_err());
    }

    #[test]
    fn schema_validation_rejects_unknown_keys() {
        let mut config = HashMap::new();
        config.insert("source".to_string(), "/tmp/x".to_string());
        validate_against_schema(&config, &["source"]).unwrap();

        config.insert("bogus".to_string(), "1".to_string());
        assert!(validate_against_schema(&config, &["source"]).is_err());
    }
}
