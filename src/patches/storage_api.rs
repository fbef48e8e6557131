//! The storage-API upgrade.
//!
//! Transforms a pre-storage-API deployment (one backend selected through
//! daemon config keys, data under fixed directories, no pool rows) into the
//! pool/volume model: infer the prior backend, synthesize a first-class
//! pool, relocate on-disk data, populate the catalog, fix up the default
//! profile, and clear the legacy keys. Every step tolerates re-running after
//! a crash at any point.

use crate::db_manager::retry::with_retry;
use crate::patches::PatchContext;
use crate::schemas::v1::db::queries;
use crate::storage::driver::{self, btrfs::BtrfsDriver, lvm::LvmDriver, zfs::ZfsDriver, PoolSpec};
use crate::storage::{paths, SnapshotName, StorageError, VolumeKind};
use log::{info, warn};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

/// Daemon config keys the pre-pool model used to select and tune a backend.
/// Cleared in the final transaction of the upgrade.
const LEGACY_CONFIG_KEYS: &[&str] = &[
    "storage.lvm_vg_name",
    "storage.lvm_thinpool_name",
    "storage.lvm_fstype",
    "storage.lvm_volume_size",
    "storage.zfs_pool_name",
    "storage.zfs_use_refquota",
    "storage.images_volume_size",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum LegacyBackend {
    Dir,
    Btrfs,
    Lvm(String),
    Zfs(String),
}

impl LegacyBackend {
    /// Ordered precedence: configured LVM VG, configured ZFS pool, btrfs
    /// rootfs, plain directories.
    pub(super) fn detect(
        lvm_vg: Option<String>,
        zfs_pool: Option<String>,
        data_dir: &Path,
    ) -> Self {
        if let Some(vg) = lvm_vg.filter(|v| !v.is_empty()) {
            return LegacyBackend::Lvm(vg);
        }
        if let Some(zpool) = zfs_pool.filter(|v| !v.is_empty()) {
            return LegacyBackend::Zfs(zpool);
        }
        match paths::filesystem_detect(data_dir) {
            Ok(fstype) if fstype == "btrfs" => LegacyBackend::Btrfs,
            _ => LegacyBackend::Dir,
        }
    }

    pub(super) fn driver(&self) -> &'static str {
        match self {
            LegacyBackend::Dir => "dir",
            LegacyBackend::Btrfs => "btrfs",
            LegacyBackend::Lvm(_) => "lvm",
            LegacyBackend::Zfs(_) => "zfs",
        }
    }

    /// Pool name derived from the legacy config. A ZFS dataset path cannot
    /// name a pool, so it falls back to "default".
    pub(super) fn pool_name(&self) -> String {
        match self {
            LegacyBackend::Lvm(vg) => vg.clone(),
            LegacyBackend::Zfs(zpool) if !zpool.contains('/') => zpool.clone(),
            _ => "default".to_string(),
        }
    }

    fn pool_config(&self, data_dir: &Path, pool_name: &str) -> HashMap<String, String> {
        let mut config = HashMap::new();
        match self {
            LegacyBackend::Lvm(vg) => {
                config.insert("source".to_string(), vg.clone());
                config.insert("lvm.vg_name".to_string(), vg.clone());
            }
            LegacyBackend::Zfs(zpool) => {
                config.insert("source".to_string(), zpool.clone());
                config.insert("zfs.pool_name".to_string(), zpool.clone());
            }
            LegacyBackend::Dir | LegacyBackend::Btrfs => {
                config.insert(
                    "source".to_string(),
                    paths::pool_mount_root(data_dir, pool_name)
                        .to_string_lossy()
                        .into_owned(),
                );
            }
        }
        config
    }
}

/// Containers, snapshots, and images found on the legacy layout, unioned
/// with anything a prior interrupted run already moved under the pool, so a
/// re-run still sees the full entity set.
struct LegacyInventory {
    containers: Vec<String>,
    snapshots: Vec<SnapshotName>,
    images: Vec<String>,
}

impl LegacyInventory {
    fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.snapshots.is_empty() && self.images.is_empty()
    }
}

fn gather_inventory(data_dir: &Path, pool_name: &str) -> Result<LegacyInventory, StorageError> {
    let mut containers: BTreeSet<String> = BTreeSet::new();
    containers.extend(entry_names(&paths::legacy_containers_dir(data_dir), false)?);
    containers.extend(entry_names(
        &paths::pool_mount_root(data_dir, pool_name).join(VolumeKind::Container.dir_name()),
        false,
    )?);

    let mut parents: BTreeSet<String> = BTreeSet::new();
    parents.extend(entry_names(&paths::legacy_snapshots_dir(data_dir), false)?);
    parents.extend(entry_names(
        &paths::pool_mount_root(data_dir, pool_name)
            .join(VolumeKind::ContainerSnapshot.dir_name()),
        false,
    )?);

    let mut snapshots = Vec::new();
    for parent in &parents {
        // read_dir resolves a parent that is already a symlink into the pool.
        let mut names: BTreeSet<String> = BTreeSet::new();
        names.extend(entry_names(
            &paths::legacy_snapshot_parent_path(data_dir, parent),
            false,
        )?);
        names.extend(entry_names(
            &paths::snapshot_dir(data_dir, pool_name, VolumeKind::ContainerSnapshot, parent),
            false,
        )?);
        for name in names {
            snapshots.push(SnapshotName::new(parent.clone(), name));
        }
    }

    let mut images: BTreeSet<String> = BTreeSet::new();
    images.extend(entry_names(&paths::legacy_images_dir(data_dir), true)?);
    images.extend(entry_names(
        &paths::pool_mount_root(data_dir, pool_name).join(VolumeKind::Image.dir_name()),
        true,
    )?);

    Ok(LegacyInventory {
        containers: containers.into_iter().collect(),
        snapshots,
        images: images.into_iter().collect(),
    })
}

/// Entry names under `dir`: directories and symlinks, or plain files when
/// `files` is set. A missing directory is just empty.
fn entry_names(dir: &Path, files: bool) -> Result<Vec<String>, StorageError> {
    let mut names = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => {
            return Err(StorageError::Driver(format!(
                "Failed to read {}: {}",
                dir.display(),
                e
            )))
        }
    };
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::Driver(e.to_string()))?;
        let meta = fs::symlink_metadata(entry.path())
            .map_err(|e| StorageError::Driver(e.to_string()))?;
        let keep = if files {
            meta.is_file()
        } else {
            meta.is_dir() || meta.file_type().is_symlink()
        };
        if keep {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

pub(super) async fn patch_storage_api(ctx: &PatchContext) -> Result<(), StorageError> {
    let lvm_vg =
        with_retry(|| queries::config::config_get(&ctx.db, "storage.lvm_vg_name")).await?;
    let zfs_pool =
        with_retry(|| queries::config::config_get(&ctx.db, "storage.zfs_pool_name")).await?;

    let backend = LegacyBackend::detect(lvm_vg, zfs_pool, &ctx.data_dir);
    let pool_name = backend.pool_name();

    let inventory = gather_inventory(&ctx.data_dir, &pool_name)?;
    if inventory.is_empty() {
        // Nothing to migrate; the operator gets to pick a layout explicitly.
        info!("No legacy containers, snapshots or images; skipping storage upgrade");
        return Ok(());
    }

    info!(
        "Upgrading legacy {} storage into pool {} ({} containers, {} snapshots, {} images)",
        backend.driver(),
        pool_name,
        inventory.containers.len(),
        inventory.snapshots.len(),
        inventory.images.len()
    );

    let drv = driver::load_driver(backend.driver())?;
    let mut spec = PoolSpec::new(
        &pool_name,
        backend.pool_config(&ctx.data_dir, &pool_name),
        &ctx.data_dir,
    );
    drv.fill_defaults(&mut spec);
    drv.validate_config(&spec)?;

    // A pool row from a partial prior run is reused, its config rewritten
    // from the freshly derived state, never an error.
    let pool_id = match with_retry(|| {
        queries::storage_pool::pool_get_by_name(&ctx.db, &pool_name)
    })
    .await?
    {
        Some(existing) => {
            info!("Reusing storage pool row {} from earlier run", existing.id);
            with_retry(|| {
                queries::storage_pool::pool_config_replace(&ctx.db, existing.id, &spec.config)
            })
            .await?;
            existing.id
        }
        None => {
            with_retry(|| {
                queries::storage_pool::pool_create(
                    &ctx.db,
                    &pool_name,
                    backend.driver(),
                    "",
                    &spec.config,
                )
            })
            .await?
        }
    };

    // Unlike the manager path, the row exists before the driver object: the
    // patch needs the row id to resume, and the driver create is idempotent.
    drv.pool_create(&spec).await?;

    // Volume rows. The ZFS branch records no snapshot rows: the backend
    // materializes snapshots as datasets on its own.
    let snapshot_rows: &[SnapshotName] = match backend {
        LegacyBackend::Zfs(_) => &[],
        _ => &inventory.snapshots,
    };
    let empty_config: HashMap<String, String> = HashMap::new();
    for container in &inventory.containers {
        with_retry(|| {
            queries::storage_volume::volume_ensure(
                &ctx.db,
                pool_id,
                VolumeKind::Container,
                container,
                "",
                &empty_config,
            )
        })
        .await?;
    }
    for snapshot in snapshot_rows {
        let flat = snapshot.flat();
        with_retry(|| {
            queries::storage_volume::volume_ensure(
                &ctx.db,
                pool_id,
                VolumeKind::ContainerSnapshot,
                &flat,
                "",
                &empty_config,
            )
        })
        .await?;
    }
    for image in &inventory.images {
        with_retry(|| {
            queries::storage_volume::volume_ensure(
                &ctx.db,
                pool_id,
                VolumeKind::Image,
                image,
                "",
                &empty_config,
            )
        })
        .await?;

        // The image cache index is keyed by content fingerprint.
        let size = fs::metadata(paths::legacy_images_dir(&ctx.data_dir).join(image))
            .or_else(|_| {
                fs::metadata(paths::volume_path(
                    &ctx.data_dir,
                    &pool_name,
                    VolumeKind::Image,
                    image,
                ))
            })
            .map(|m| m.len() as i64)
            .unwrap_or(0);
        with_retry(|| queries::image::image_ensure(&ctx.db, image, image, size)).await?;
    }

    // On-disk relocation, backend-specific.
    match &backend {
        LegacyBackend::Dir => upgrade_dir_layout(ctx, &inventory, &pool_name)?,
        LegacyBackend::Btrfs => upgrade_btrfs_layout(ctx, &inventory, &pool_name).await?,
        LegacyBackend::Lvm(vg) => upgrade_lvm_layout(ctx, &inventory, &pool_name, vg).await?,
        LegacyBackend::Zfs(zpool) => {
            upgrade_zfs_layout(ctx, &inventory, &pool_name, zpool).await?
        }
    }

    fixup_default_profile(ctx, &pool_name).await?;

    with_retry(|| queries::config::config_delete(&ctx.db, LEGACY_CONFIG_KEYS)).await?;
    Ok(())
}

/// Moves one container directory under the pool and leaves a legacy symlink
/// behind. No-op when a previous run already converted it.
fn relocate_container_dir(
    data_dir: &Path,
    pool_name: &str,
    container: &str,
) -> Result<(), StorageError> {
    let legacy = paths::legacy_container_path(data_dir, container);
    let target = paths::volume_path(data_dir, pool_name, VolumeKind::Container, container);

    if is_symlink(&legacy) {
        return Ok(());
    }
    paths::rename_or_copy(&legacy, &target).map_err(|e| StorageError::Driver(e.to_string()))?;
    paths::ensure_symlink(&target, &legacy).map_err(|e| StorageError::Driver(e.to_string()))?;
    Ok(())
}

fn relocate_snapshot_parent(
    data_dir: &Path,
    pool_name: &str,
    parent: &str,
) -> Result<(), StorageError> {
    let legacy = paths::legacy_snapshot_parent_path(data_dir, parent);
    let target = paths::snapshot_dir(data_dir, pool_name, VolumeKind::ContainerSnapshot, parent);

    if is_symlink(&legacy) {
        return Ok(());
    }
    paths::rename_or_copy(&legacy, &target).map_err(|e| StorageError::Driver(e.to_string()))?;
    paths::ensure_symlink(&target, &legacy).map_err(|e| StorageError::Driver(e.to_string()))?;
    Ok(())
}

fn relocate_image(data_dir: &Path, pool_name: &str, fingerprint: &str) -> Result<(), StorageError> {
    let legacy = paths::legacy_images_dir(data_dir).join(fingerprint);
    let target = paths::volume_path(data_dir, pool_name, VolumeKind::Image, fingerprint);
    paths::rename_or_copy(&legacy, &target).map_err(|e| StorageError::Driver(e.to_string()))
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// dir backend: plain renames with copy fallback. First error aborts.
fn upgrade_dir_layout(
    ctx: &PatchContext,
    inventory: &LegacyInventory,
    pool_name: &str,
) -> Result<(), StorageError> {
    for container in &inventory.containers {
        relocate_container_dir(&ctx.data_dir, pool_name, container)?;
    }
    let parents: BTreeSet<&str> = inventory.snapshots.iter().map(|s| s.parent.as_str()).collect();
    for parent in parents {
        relocate_snapshot_parent(&ctx.data_dir, pool_name, parent)?;
    }
    for image in &inventory.images {
        relocate_image(&ctx.data_dir, pool_name, image)?;
    }
    Ok(())
}

/// btrfs backend: containers move like directories, but read-only snapshot
/// subvolumes cannot be moved; each is re-taken read-write at the new
/// location and the old one deleted. First error aborts.
async fn upgrade_btrfs_layout(
    ctx: &PatchContext,
    inventory: &LegacyInventory,
    pool_name: &str,
) -> Result<(), StorageError> {
    let btrfs = BtrfsDriver;

    for container in &inventory.containers {
        relocate_container_dir(&ctx.data_dir, pool_name, container)?;
    }

    for snapshot in &inventory.snapshots {
        let legacy_parent = paths::legacy_snapshot_parent_path(&ctx.data_dir, &snapshot.parent);
        if is_symlink(&legacy_parent) {
            continue;
        }
        let old_path = legacy_parent.join(&snapshot.snapshot);
        let new_path = paths::snapshot_dir(
            &ctx.data_dir,
            pool_name,
            VolumeKind::ContainerSnapshot,
            &snapshot.parent,
        )
        .join(&snapshot.snapshot);

        if old_path.exists() && !new_path.exists() {
            btrfs.subvolume_snapshot(&old_path, &new_path, false).await?;
            btrfs.subvolume_delete(&old_path).await?;
        }
    }

    // Once every snapshot moved, the emptied legacy parents become symlinks.
    let parents: BTreeSet<&str> = inventory.snapshots.iter().map(|s| s.parent.as_str()).collect();
    for parent in parents {
        let legacy_parent = paths::legacy_snapshot_parent_path(&ctx.data_dir, parent);
        if is_symlink(&legacy_parent) {
            continue;
        }
        let target =
            paths::snapshot_dir(&ctx.data_dir, pool_name, VolumeKind::ContainerSnapshot, parent);
        paths::remove_tree(&legacy_parent).map_err(|e| StorageError::Driver(e.to_string()))?;
        paths::ensure_symlink(&target, &legacy_parent)
            .map_err(|e| StorageError::Driver(e.to_string()))?;
    }

    for image in &inventory.images {
        relocate_image(&ctx.data_dir, pool_name, image)?;
    }
    Ok(())
}

/// lvm backend: logical volumes are renamed to the `<kind>_<munged-name>`
/// convention, stale `.lv` mount-point sidecars removed, mount directories
/// relocated. First error aborts.
async fn upgrade_lvm_layout(
    ctx: &PatchContext,
    inventory: &LegacyInventory,
    pool_name: &str,
    vg: &str,
) -> Result<(), StorageError> {
    for container in &inventory.containers {
        let legacy_lv = LvmDriver::munge_name(container);
        let new_lv = LvmDriver::lv_name(VolumeKind::Container, container);
        LvmDriver::lv_rename(vg, &legacy_lv, &new_lv).await?;

        // Pre-pool deployments kept a `.lv` sidecar next to the mount dir.
        let sidecar = paths::legacy_containers_dir(&ctx.data_dir).join(format!("{}.lv", container));
        if sidecar.exists() {
            fs::remove_file(&sidecar).map_err(|e| StorageError::Driver(e.to_string()))?;
        }

        relocate_container_dir(&ctx.data_dir, pool_name, container)?;
    }

    for snapshot in &inventory.snapshots {
        let flat = snapshot.flat();
        let legacy_lv = LvmDriver::munge_name(&flat);
        let new_lv = LvmDriver::lv_name(VolumeKind::ContainerSnapshot, &flat);
        LvmDriver::lv_rename(vg, &legacy_lv, &new_lv).await?;
    }
    let parents: BTreeSet<&str> = inventory.snapshots.iter().map(|s| s.parent.as_str()).collect();
    for parent in parents {
        relocate_snapshot_parent(&ctx.data_dir, pool_name, parent)?;
    }

    for image in &inventory.images {
        relocate_image(&ctx.data_dir, pool_name, image)?;
    }
    Ok(())
}

/// zfs backend: datasets stay where they are, their `mountpoint` property is
/// reassigned into the pool layout. The backend is resilient, so per-entity
/// failures accumulate instead of aborting; a non-empty list fails the
/// patch after the full sweep so the next boot retries.
async fn upgrade_zfs_layout(
    ctx: &PatchContext,
    inventory: &LegacyInventory,
    pool_name: &str,
    zpool: &str,
) -> Result<(), StorageError> {
    let zfs = ZfsDriver;
    let mut failures: Vec<String> = Vec::new();

    for container in &inventory.containers {
        let dataset = format!("{}/containers/{}", zpool, container);
        let new_path =
            paths::volume_path(&ctx.data_dir, pool_name, VolumeKind::Container, container);

        if let Err(err) = zfs.set_mountpoint(&dataset, &new_path.to_string_lossy()).await {
            warn!("Failed to move dataset {}: {}", dataset, err);
            failures.push(format!("{}: {}", dataset, err));
            continue;
        }

        let legacy = paths::legacy_container_path(&ctx.data_dir, container);
        if !is_symlink(&legacy) {
            let _ = paths::remove_tree(&legacy);
            if let Err(err) = paths::ensure_symlink(&new_path, &legacy) {
                failures.push(format!("{}: {}", container, err));
            }
        }
    }

    for image in &inventory.images {
        if let Err(err) = relocate_image(&ctx.data_dir, pool_name, image) {
            warn!("Failed to move image {}: {}", image, err);
            failures.push(format!("{}: {}", image, err));
        }
    }

    if !failures.is_empty() {
        return Err(StorageError::Driver(format!(
            "{} entities failed during the ZFS storage upgrade: {}",
            failures.len(),
            failures.join("; ")
        )));
    }
    Ok(())
}

/// The default profile must end up with a root-disk device naming the pool.
async fn fixup_default_profile(ctx: &PatchContext, pool_name: &str) -> Result<(), StorageError> {
    let Some(profile) =
        with_retry(|| queries::profile::profile_get_by_name(&ctx.db, "default")).await?
    else {
        return Ok(());
    };

    let devices = with_retry(|| queries::profile::profile_devices(&ctx.db, profile.id)).await?;

    for (device, config) in &devices {
        let is_root_disk =
            device.device_type == "disk" && config.get("path").map(String::as_str) == Some("/");
        if is_root_disk {
            if !config.contains_key("pool") {
                with_retry(|| {
                    queries::profile::profile_device_config_set(&ctx.db, device.id, "pool", pool_name)
                })
                .await?;
            }
            return Ok(());
        }
    }

    // No root disk at all: synthesize one under the first free name.
    let taken: BTreeSet<&str> = devices.iter().map(|(d, _)| d.name.as_str()).collect();
    let mut device_name = "root".to_string();
    let mut counter = 0;
    while taken.contains(device_name.as_str()) {
        device_name = format!("root{}", counter);
        counter += 1;
    }

    let mut config = HashMap::new();
    config.insert("path".to_string(), "/".to_string());
    config.insert("pool".to_string(), pool_name.to_string());
    with_retry(|| {
        queries::profile::profile_device_add(&ctx.db, profile.id, &device_name, "disk", &config)
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_manager::DatabaseManager;
    use sqlx::{Pool, Sqlite};
    use tempfile::tempdir;

    #[test]
    fn backend_detection_precedence() {
        let dir = tempdir().unwrap();
        assert_eq!(
            LegacyBackend::detect(Some("vg0".into()), Some("tank".into()), dir.path()),
            LegacyBackend::Lvm("vg0".into())
        );
        assert_eq!(
            LegacyBackend::detect(None, Some("tank".into()), dir.path()),
            LegacyBackend::Zfs("tank".into())
        );
        assert_eq!(
            LegacyBackend::detect(Some(String::new()), None, dir.path()),
            LegacyBackend::Dir
        );
    }

    #[test]
    fn zfs_dataset_paths_normalize_to_default() {
        assert_eq!(LegacyBackend::Zfs("tank".into()).pool_name(), "tank");
        assert_eq!(LegacyBackend::Zfs("tank/vessel".into()).pool_name(), "default");
        assert_eq!(LegacyBackend::Lvm("vg0".into()).pool_name(), "vg0");
        assert_eq!(LegacyBackend::Dir.pool_name(), "default");
    }

    async fn catalog() -> Pool<Sqlite> {
        DatabaseManager::new_in_memory().await.unwrap().get_pool().clone()
    }

    fn seed_legacy_dir_layout(data_dir: &Path) {
        fs::create_dir_all(data_dir.join("containers/c1")).unwrap();
        fs::write(data_dir.join("containers/c1/rootfs"), b"c1-root").unwrap();
        fs::create_dir_all(data_dir.join("snapshots/c1/s0")).unwrap();
        fs::write(data_dir.join("snapshots/c1/s0/rootfs"), b"c1-snap").unwrap();
        fs::create_dir_all(data_dir.join("images")).unwrap();
        fs::write(data_dir.join("images/abcd1234"), b"image-bits").unwrap();
    }

    async fn assert_upgraded(ctx: &PatchContext) {
        let pool = queries::storage_pool::pool_get_by_name(&ctx.db, "default")
            .await
            .unwrap()
            .expect("pool row");
        assert_eq!(pool.driver, "dir");

        let volumes = queries::storage_volume::volume_list_by_pool(&ctx.db, pool.id, &[])
            .await
            .unwrap();
        let mut names: Vec<(String, String)> = volumes
            .iter()
            .map(|v| (v.kind.clone(), v.name.clone()))
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                ("container".to_string(), "c1".to_string()),
                ("container-snapshot".to_string(), "c1/s0".to_string()),
                ("image".to_string(), "abcd1234".to_string()),
            ]
        );

        // Data lives under the pool; the legacy paths are symlinks into it.
        let new_root = ctx.data_dir.join("storage-pools/default");
        assert_eq!(
            fs::read(new_root.join("containers/c1/rootfs")).unwrap(),
            b"c1-root"
        );
        assert_eq!(
            fs::read(new_root.join("containers-snapshots/c1/s0/rootfs")).unwrap(),
            b"c1-snap"
        );
        assert_eq!(fs::read(new_root.join("images/abcd1234")).unwrap(), b"image-bits");

        let legacy_container = ctx.data_dir.join("containers/c1");
        assert!(fs::symlink_metadata(&legacy_container).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(legacy_container.join("rootfs")).unwrap(), b"c1-root");

        // Default profile carries a root disk naming the pool.
        let profile = queries::profile::profile_get_by_name(&ctx.db, "default")
            .await
            .unwrap()
            .unwrap();
        let devices = queries::profile::profile_devices(&ctx.db, profile.id).await.unwrap();
        let (root, config) = devices
            .iter()
            .find(|(d, _)| d.device_type == "disk")
            .expect("root disk device");
        assert_eq!(root.name, "root");
        assert_eq!(config.get("path").map(String::as_str), Some("/"));
        assert_eq!(config.get("pool").map(String::as_str), Some("default"));

        // Legacy keys are gone.
        assert!(queries::config::config_get(&ctx.db, "storage.lvm_vg_name")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn dir_upgrade_builds_pool_and_relocates_data() {
        let dir = tempdir().unwrap();
        seed_legacy_dir_layout(dir.path());
        let ctx = PatchContext {
            db: catalog().await,
            data_dir: dir.path().to_path_buf(),
            node_name: "local".to_string(),
        };

        patch_storage_api(&ctx).await.unwrap();
        assert_upgraded(&ctx).await;
    }

    #[tokio::test]
    async fn rerun_after_partial_completion_converges() {
        let dir = tempdir().unwrap();
        seed_legacy_dir_layout(dir.path());
        let ctx = PatchContext {
            db: catalog().await,
            data_dir: dir.path().to_path_buf(),
            node_name: "local".to_string(),
        };

        // First run completes its effects, but the process dies before the
        // patch is marked applied; boot runs the body again.
        patch_storage_api(&ctx).await.unwrap();
        patch_storage_api(&ctx).await.unwrap();
        assert_upgraded(&ctx).await;

        // No duplicate rows from the second pass.
        let pool = queries::storage_pool::pool_get_by_name(&ctx.db, "default")
            .await
            .unwrap()
            .unwrap();
        let volumes = queries::storage_volume::volume_list_by_pool(&ctx.db, pool.id, &[])
            .await
            .unwrap();
        assert_eq!(volumes.len(), 3);
        let pools = queries::storage_pool::pool_list(&ctx.db).await.unwrap();
        assert_eq!(pools.len(), 1);
    }

    #[tokio::test]
    async fn detection_reads_legacy_config_keys() {
        let dir = tempdir().unwrap();
        let db = catalog().await;
        queries::config::config_set(&db, "storage.lvm_vg_name", "vg0")
            .await
            .unwrap();

        let vg = queries::config::config_get(&db, "storage.lvm_vg_name")
            .await
            .unwrap();
        let zpool = queries::config::config_get(&db, "storage.zfs_pool_name")
            .await
            .unwrap();
        let backend = LegacyBackend::detect(vg, zpool, dir.path());

        assert_eq!(backend, LegacyBackend::Lvm("vg0".into()));
        assert_eq!(backend.pool_name(), "vg0");
        assert_eq!(backend.driver(), "lvm");
    }

    #[tokio::test]
    async fn empty_legacy_layout_is_skipped() {
        let dir = tempdir().unwrap();
        let ctx = PatchContext {
            db: catalog().await,
            data_dir: dir.path().to_path_buf(),
            node_name: "local".to_string(),
        };

        patch_storage_api(&ctx).await.unwrap();
        assert!(queries::storage_pool::pool_list(&ctx.db).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn existing_root_disk_gains_pool_attribute() {
        let dir = tempdir().unwrap();
        seed_legacy_dir_layout(dir.path());
        let db = catalog().await;

        let profile = queries::profile::profile_get_by_name(&db, "default")
            .await
            .unwrap()
            .unwrap();
        let mut config = HashMap::new();
        config.insert("path".to_string(), "/".to_string());
        queries::profile::profile_device_add(&db, profile.id, "root", "disk", &config)
            .await
            .unwrap();

        let ctx = PatchContext {
            db,
            data_dir: dir.path().to_path_buf(),
            node_name: "local".to_string(),
        };
        patch_storage_api(&ctx).await.unwrap();

        let devices = queries::profile::profile_devices(&ctx.db, profile.id).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].1.get("pool").map(String::as_str), Some("default"));
    }
}
